//! `FsContext`: the explicit, passed-by-reference replacement for a
//! process-wide global filesystem handle.

use crate::key::{DevId, Generation, Logical};
use crate::model::{FsGeometry, RootPointer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

/// On-disk feature flags this core understands the shape of. Only the
/// subset this tool's modules branch on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub skinny_metadata: bool,
    pub no_holes: bool,
    pub free_space_tree: bool,
    pub metadata_csum: bool,
    pub raid56: bool,
    pub extent_tree_v2: bool,
}

/// One registered device backing the filesystem.
#[derive(Debug, Clone)]
pub struct DeviceEntry {
    pub devid: DevId,
    pub path: String,
    pub total_bytes: u64,
}

/// Callback invoked by the repair path when an extent is freed mid-run so
/// that cached backrefs can be dropped consistently. `None` by default.
pub type FreeExtentHook = Arc<dyn Fn(Logical) + Send + Sync>;

/// Passed by reference to every component that needs the roots of the
/// forest. Superblock/root bytenrs are [`RootPointer`]s rather than raw
/// `u64`s so a `generation` check travels with every reference, matching
/// `read_tree_block`'s `expected_gen` parameter.
pub struct FsContext {
    pub geometry: FsGeometry,
    pub fsid: uuid::Uuid,
    pub devices: Vec<DeviceEntry>,
    pub features: FeatureFlags,

    pub tree_root: RootPointer,
    pub chunk_root: RootPointer,
    pub dev_root: RootPointer,
    pub extent_root: RootPointer,
    pub csum_root: RootPointer,
    pub quota_root: Option<RootPointer>,
    pub free_space_root: Option<RootPointer>,

    pub generation: Generation,

    /// Extents excluded from allocation consideration (e.g. super block
    /// copies, reserved ranges) — a plain key set, never a pointer graph.
    pub excluded_extents: Mutex<BTreeSet<Logical>>,
    /// Bytenrs of extents already visited by this run's fsck walk, used to
    /// avoid double-accounting shared subtrees across roots.
    pub fsck_extent_cache: Mutex<HashMap<Logical, u32>>,
    /// Bytenrs of tree blocks known to be structurally corrupt; the
    /// repairer consults this before attempting btree surgery on them.
    pub corrupt_blocks: Mutex<BTreeSet<Logical>>,

    pub free_extent_hook: Mutex<Option<FreeExtentHook>>,

    pub repair: bool,
    pub readonly: bool,
    pub force: bool,
    pub check_data_csum: bool,
}

impl FsContext {
    pub fn mark_corrupt(&self, bytenr: Logical) {
        self.corrupt_blocks.lock().unwrap().insert(bytenr);
    }

    pub fn is_corrupt(&self, bytenr: Logical) -> bool {
        self.corrupt_blocks.lock().unwrap().contains(&bytenr)
    }

    pub fn exclude_extent(&self, bytenr: Logical) {
        self.excluded_extents.lock().unwrap().insert(bytenr);
    }

    pub fn is_excluded(&self, bytenr: Logical) -> bool {
        self.excluded_extents.lock().unwrap().contains(&bytenr)
    }

    /// Invokes the installed free-extent hook, if any, then clears any
    /// cached visit count for `bytenr`.
    pub fn notify_extent_freed(&self, bytenr: Logical) {
        if let Some(hook) = self.free_extent_hook.lock().unwrap().as_ref() {
            hook(bytenr);
        }
        self.fsck_extent_cache.lock().unwrap().remove(&bytenr);
    }

    pub fn set_free_extent_hook(&self, hook: FreeExtentHook) {
        *self.free_extent_hook.lock().unwrap() = Some(hook);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_root() -> RootPointer {
        RootPointer {
            bytenr: 0,
            generation: 0,
            level: 0,
        }
    }

    fn dummy_ctx() -> FsContext {
        FsContext {
            geometry: FsGeometry::default(),
            fsid: uuid::Uuid::nil(),
            devices: vec![],
            features: FeatureFlags::default(),
            tree_root: dummy_root(),
            chunk_root: dummy_root(),
            dev_root: dummy_root(),
            extent_root: dummy_root(),
            csum_root: dummy_root(),
            quota_root: None,
            free_space_root: None,
            generation: 1,
            excluded_extents: Mutex::new(BTreeSet::new()),
            fsck_extent_cache: Mutex::new(HashMap::new()),
            corrupt_blocks: Mutex::new(BTreeSet::new()),
            free_extent_hook: Mutex::new(None),
            repair: false,
            readonly: true,
            force: false,
            check_data_csum: false,
        }
    }

    #[test]
    fn free_extent_hook_fires_and_clears_cache() {
        let ctx = dummy_ctx();
        ctx.fsck_extent_cache.lock().unwrap().insert(1024, 1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        ctx.set_free_extent_hook(Arc::new(move |b| seen2.lock().unwrap().push(b)));
        ctx.notify_extent_freed(1024);
        assert_eq!(*seen.lock().unwrap(), vec![1024]);
        assert!(!ctx.fsck_extent_cache.lock().unwrap().contains_key(&1024));
    }
}
