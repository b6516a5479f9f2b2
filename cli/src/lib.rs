//! Shared loading code for the `fsforge-check`/`fsforge-image` binaries.
//! Resolves an opaque device argument through a manager rather than
//! parsing a raw device itself; here the manager is a JSON manifest, since
//! parsing the on-disk forest means walking a generic B-tree this crate
//! does not implement. The manifest is the pre-decoded form the library
//! crates already expect their caller to supply, same as chunk items being
//! supplied pre-decoded by the caller in
//! `fsforge_image::restorer::find_chunk_tree_buffer`.

use fsforge_core::{FeatureFlags, FsContext, FsGeometry, Key, Logical, RootPointer};
use fsforge_tree::InMemoryTreeStore;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Mutex;

/// One already-decoded tree item, keyed by the root it lives under.
#[derive(Debug, Deserialize)]
pub struct SnapshotItem {
    pub root: Logical,
    pub key: Key,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Deserialize)]
pub struct DeviceManifest {
    pub devid: u64,
    pub path: String,
    pub total_bytes: u64,
}

/// Top-level manifest a run is built from, standing in for the real
/// on-disk superblock + forest a production caller would parse, since the
/// generic B-tree primitive itself is out of scope here.
#[derive(Debug, Deserialize)]
pub struct Manifest {
    pub geometry: FsGeometry,
    pub fsid: uuid::Uuid,
    #[serde(default)]
    pub devices: Vec<DeviceManifest>,
    #[serde(default)]
    pub features: FeatureFlags,
    pub generation: u64,
    pub tree_root: RootPointer,
    pub chunk_root: RootPointer,
    pub dev_root: RootPointer,
    pub extent_root: RootPointer,
    pub csum_root: RootPointer,
    #[serde(default)]
    pub quota_root: Option<RootPointer>,
    #[serde(default)]
    pub free_space_root: Option<RootPointer>,
    #[serde(default)]
    pub items: Vec<SnapshotItem>,
    #[serde(default)]
    pub chunks: Vec<fsforge_core::Chunk>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&bytes.iter().map(|b| format!("{b:02x}")).collect::<String>())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(serde::de::Error::custom))
            .collect()
    }
}

/// Loads a [`Manifest`] from `path` and builds the `(FsContext,
/// InMemoryTreeStore)` pair every run starts from.
pub fn load_manifest(path: impl AsRef<Path>) -> anyhow::Result<Manifest> {
    let raw = std::fs::read_to_string(path.as_ref())?;
    let manifest: Manifest = serde_json::from_str(&raw)?;
    Ok(manifest)
}

/// Populates a fresh [`InMemoryTreeStore`] from the manifest's item list.
pub fn build_store(manifest: &Manifest) -> anyhow::Result<InMemoryTreeStore> {
    let store = InMemoryTreeStore::new();
    for item in &manifest.items {
        store.insert_empty_item(item.root, item.key, item.data.len() as u32)?;
        store.set_item_data(item.root, &item.key, item.data.clone())?;
    }
    Ok(store)
}

/// Builds the [`FsContext`] a run shares across phases, using the flags
/// common to both the checker and the repair-init path.
pub fn build_context(manifest: &Manifest, repair: bool, readonly: bool, force: bool, check_data_csum: bool) -> FsContext {
    FsContext {
        geometry: manifest.geometry,
        fsid: manifest.fsid,
        devices: manifest
            .devices
            .iter()
            .map(|d| fsforge_core::DeviceEntry {
                devid: d.devid,
                path: d.path.clone(),
                total_bytes: d.total_bytes,
            })
            .collect(),
        features: manifest.features,
        tree_root: manifest.tree_root,
        chunk_root: manifest.chunk_root,
        dev_root: manifest.dev_root,
        extent_root: manifest.extent_root,
        csum_root: manifest.csum_root,
        quota_root: manifest.quota_root,
        free_space_root: manifest.free_space_root,
        generation: manifest.generation,
        excluded_extents: Mutex::new(BTreeSet::new()),
        fsck_extent_cache: Mutex::new(HashMap::new()),
        corrupt_blocks: Mutex::new(BTreeSet::new()),
        free_extent_hook: Mutex::new(None),
        repair,
        readonly,
        force,
        check_data_csum,
    }
}

/// Builds a [`fsforge_tree::ChunkMap`] from the manifest's pre-decoded
/// chunk list (the chunk-tree leaf layout itself is out of scope, per
/// `fsforge_image::restorer`'s own doc comment).
pub fn build_chunk_map(manifest: &Manifest) -> fsforge_tree::ChunkMap {
    let map = fsforge_tree::ChunkMap::new();
    for chunk in &manifest.chunks {
        map.insert(chunk.clone());
    }
    map
}

/// Opens every manifest-declared device through a [`fsforge_core::FileBlockIo`],
/// read-only when `readonly` is set.
pub fn open_devices(manifest: &Manifest, readonly: bool) -> anyhow::Result<fsforge_core::FileBlockIo> {
    let io = fsforge_core::FileBlockIo::new();
    for dev in &manifest.devices {
        if readonly {
            io.register_readonly(dev.devid, &dev.path)?;
        } else {
            io.register(dev.devid, &dev.path)?;
        }
    }
    Ok(io)
}

/// One extent the metadump writer's `source` side already knows it wants
/// to capture. Enumerating which bytenrs belong to a capture (via the
/// extent tree, or via `-w`'s tree walk) is the out-of-scope tree-reading
/// step ("walk-trees... retained for broken-extent-tree
/// filesystems"); the manifest supplies the result of either strategy
/// pre-computed, same as [`Manifest`] does for the checker.
#[derive(Debug, Deserialize)]
pub struct CaptureExtent {
    pub start: Logical,
    pub is_data: bool,
    #[serde(with = "hex_bytes")]
    pub bytes: Vec<u8>,
    #[serde(default)]
    pub names: Vec<fsforge_image::NameSpan>,
}

/// Manifest driving `fsforge-image`'s capture (non-`-r`) direction.
#[derive(Debug, Deserialize)]
pub struct DumpManifest {
    pub geometry: FsGeometry,
    #[serde(default)]
    pub devices: Vec<DeviceManifest>,
    #[serde(default)]
    pub chunks: Vec<fsforge_core::Chunk>,
    pub extents: Vec<CaptureExtent>,
}

pub fn load_dump_manifest(path: impl AsRef<Path>) -> anyhow::Result<DumpManifest> {
    let raw = std::fs::read_to_string(path.as_ref())?;
    Ok(serde_json::from_str(&raw)?)
}

/// Loads a plain JSON array of pre-decoded [`fsforge_core::Chunk`]s, the
/// restorer's `-o`-less path needs for `rewrite_chunk_single_stripe`
/// (chunk-tree leaf decoding itself is out of scope; see
/// `fsforge_image::restorer::find_chunk_tree_buffer`'s doc comment).
pub fn load_chunks_file(path: impl AsRef<Path>) -> anyhow::Result<Vec<fsforge_core::Chunk>> {
    let raw = std::fs::read_to_string(path.as_ref())?;
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize, serde::Serialize, PartialEq)]
    struct HexWrapper {
        #[serde(with = "hex_bytes")]
        data: Vec<u8>,
    }

    #[test]
    fn hex_bytes_round_trips() {
        let original = HexWrapper { data: vec![0x00, 0xab, 0xff, 0x10] };
        let json = serde_json::to_string(&original).unwrap();
        assert_eq!(json, r#"{"data":"00abff10"}"#);
        let back: HexWrapper = serde_json::from_str(&json).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn manifest_parses_minimal_json() {
        let json = r#"{
            "geometry": {"sector_size": 4096, "node_size": 16384, "csum_size": 4},
            "fsid": "00000000-0000-0000-0000-000000000000",
            "generation": 1,
            "tree_root": {"bytenr": 1, "generation": 1, "level": 0},
            "chunk_root": {"bytenr": 2, "generation": 1, "level": 0},
            "dev_root": {"bytenr": 3, "generation": 1, "level": 0},
            "extent_root": {"bytenr": 4, "generation": 1, "level": 0},
            "csum_root": {"bytenr": 5, "generation": 1, "level": 0}
        }"#;
        let manifest: Manifest = serde_json::from_str(json).unwrap();
        assert_eq!(manifest.devices.len(), 0);
        assert_eq!(manifest.items.len(), 0);
        assert_eq!(manifest.tree_root.bytenr, 1);
    }

    #[test]
    fn build_context_copies_manifest_roots() {
        let manifest = Manifest {
            geometry: FsGeometry::default(),
            fsid: uuid::Uuid::nil(),
            devices: vec![],
            features: FeatureFlags::default(),
            generation: 7,
            tree_root: RootPointer { bytenr: 1, generation: 7, level: 0 },
            chunk_root: RootPointer { bytenr: 2, generation: 7, level: 0 },
            dev_root: RootPointer { bytenr: 3, generation: 7, level: 0 },
            extent_root: RootPointer { bytenr: 4, generation: 7, level: 0 },
            csum_root: RootPointer { bytenr: 5, generation: 7, level: 0 },
            quota_root: None,
            free_space_root: None,
            items: vec![],
            chunks: vec![],
        };
        let ctx = build_context(&manifest, false, true, false, false);
        assert_eq!(ctx.generation, 7);
        assert_eq!(ctx.extent_root.bytenr, 4);
        assert!(ctx.readonly);
    }
}
