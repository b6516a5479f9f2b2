//! FsRootWalker: per-subvolume top-down tree walk building
//! inode/dir/ref records and cross-checking them against the extent
//! model. Follows the same directory-tree walk-and-accumulate loop a
//! filesystem reader uses over a single tree, generalised here to this
//! tool's multi-root, shared-subtree walk.

use crate::inode::{error_bits, InodeRecord, SharedNodeCache};
use fsforge_alloc::ExtentRefModel;
use fsforge_core::{key_type, objectid, Error, FsGeometry, Key, Logical, Result};
use fsforge_tree::TreeStore;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Per-run totals the orchestrator surfaces in its final single-line
/// diagnostic report.
#[derive(Debug, Clone, Default)]
pub struct WalkReport {
    pub inodes_visited: u64,
    pub errors_found: u64,
    pub csum_bytes_checked: u64,
}

/// Walks one subvolume root, producing an [`InodeRecord`] per inode and
/// folding extent coverage into the shared [`ExtentRefModel`].
pub struct FsRootWalker<'a> {
    store: &'a dyn TreeStore,
    extents: &'a ExtentRefModel,
    geometry: FsGeometry,
    super_generation: u64,
    csum_root: Logical,
    shared: SharedNodeCache,
    records: HashMap<u64, InodeRecord>,
}

impl<'a> FsRootWalker<'a> {
    pub fn new(
        store: &'a dyn TreeStore,
        extents: &'a ExtentRefModel,
        geometry: FsGeometry,
        super_generation: u64,
        csum_root: Logical,
    ) -> Self {
        FsRootWalker {
            store,
            extents,
            geometry,
            super_generation,
            csum_root,
            shared: SharedNodeCache::new(),
            records: HashMap::new(),
        }
    }

    fn record_mut(&mut self, ino: u64) -> &mut InodeRecord {
        self.records.entry(ino).or_insert_with(|| InodeRecord::new(ino))
    }

    /// Walks every item in `root`, in key order, dispatching by key type.
    /// A node whose backref shows `refs > 1` enters shared-node mode via
    /// [`SharedNodeCache`] so it is only processed once per walker
    /// lifetime.
    pub fn walk(&mut self, root: Logical) -> Result<WalkReport> {
        loop {
            match self.walk_once(root) {
                Ok(report) => return Ok(report),
                Err(Error::Conflict(reason)) => {
                    debug!(root, reason, "walk restarting after cowed block (-EAGAIN)");
                    self.records.clear();
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn walk_once(&mut self, root: Logical) -> Result<WalkReport> {
        if !self.shared.enter(root) {
            return Ok(WalkReport::default());
        }
        let items = self.store.all_items(root)?;
        let mut report = WalkReport::default();

        for (key, data) in items {
            match key.ty {
                t if t == key_type::InodeItem => self.process_inode_item(&key, &data, &mut report)?,
                t if t == key_type::DirItem || t == key_type::DirIndex => {
                    self.process_dir_entry(&key, &data)?
                }
                t if t == key_type::InodeRef || t == key_type::InodeExtref => {
                    self.process_inode_ref(&key)?
                }
                t if t == key_type::ExtentData => self.process_extent_data(&key, &data, &mut report)?,
                _ => {}
            }
        }

        for ino in self.records.keys().copied().collect::<Vec<_>>() {
            self.maybe_free_inode_rec(ino);
        }

        report.inodes_visited = self.records.len() as u64;
        report.errors_found = self
            .records
            .values()
            .filter(|r| r.errors != 0)
            .count() as u64;
        self.shared.leave(root);
        Ok(report)
    }

    fn process_inode_item(&mut self, key: &Key, data: &[u8], _report: &mut WalkReport) -> Result<()> {
        if data.len() < 40 {
            return Err(Error::invalid("inode item", key.objectid, "short payload"));
        }
        let nlink = u64::from_le_bytes(data[0..8].try_into().unwrap());
        let isize = u64::from_le_bytes(data[8..16].try_into().unwrap());
        let nbytes = u64::from_le_bytes(data[16..24].try_into().unwrap());
        let generation = u64::from_le_bytes(data[24..32].try_into().unwrap());
        let imode = u32::from_le_bytes(data[32..36].try_into().unwrap());
        let flags = u32::from_le_bytes(data[36..40].try_into().unwrap()) as u64;

        let already_seen = self
            .records
            .get(&key.objectid)
            .map(|r| r.seen_inode_item)
            .unwrap_or(false);

        let rec = self.record_mut(key.objectid);
        if already_seen {
            rec.set_error(error_bits::DUP_INODE_ITEM);
            return Ok(());
        }
        rec.seen_inode_item = true;
        rec.nlink = nlink;
        rec.isize = isize;
        rec.nbytes = nbytes;
        rec.generation = generation;
        rec.imode = imode;
        rec.flags = flags;

        const S_IFLNK: u32 = 0o120000;
        const S_IFDIR: u32 = 0o040000;
        const FLAG_IMMUTABLE: u64 = 1 << 3;
        const FLAG_APPEND: u64 = 1 << 2;

        if nlink == 0 {
            rec.set_error(error_bits::ORPHAN_NO_ITEM);
        }
        if imode & 0o170000 == S_IFLNK && flags & (FLAG_IMMUTABLE | FLAG_APPEND) != 0 {
            rec.set_error(error_bits::ODD_FLAGS);
        }
        if imode & 0o170000 == S_IFDIR && nlink >= 2 {
            rec.set_error(error_bits::INVALID_NLINK);
        }
        if generation > self.super_generation + 1 {
            rec.set_error(error_bits::INVALID_GEN);
        }
        Ok(())
    }

    fn process_dir_entry(&mut self, key: &Key, data: &[u8]) -> Result<()> {
        let name_hash = fsforge_core::crc32c_seeded(!0, data) as u64 & 0x7fff_ffff;
        let is_index = key.ty == key_type::DirIndex;

        let rec = self.record_mut(key.objectid);
        if !is_index && name_hash != key.offset {
            rec.set_error(error_bits::MISMATCH_DIR_HASH);
            warn!(
                objectid = key.objectid,
                offset = key.offset,
                "directory entry key offset does not match computed name hash"
            );
        }
        if is_index {
            if rec.seen_dir_index {
                rec.set_error(error_bits::DUP_DIR_INDEX);
            }
            rec.seen_dir_index = true;
        } else {
            rec.seen_dir_item = true;
        }
        Ok(())
    }

    fn process_inode_ref(&mut self, key: &Key) -> Result<()> {
        const MAX_NAME_LEN: usize = 255;
        let rec = self.record_mut(key.objectid);
        rec.seen_inode_ref = true;
        if key.offset as usize > MAX_NAME_LEN * 4 {
            rec.set_error(error_bits::NAME_TOO_LONG);
        }
        Ok(())
    }

    fn process_extent_data(&mut self, key: &Key, data: &[u8], report: &mut WalkReport) -> Result<()> {
        if data.len() < 21 {
            return Err(Error::invalid("extent data item", key.objectid, "short payload"));
        }
        let extent_type = data[20];
        const INLINE: u8 = 0;

        let rec = self.record_mut(key.objectid);
        if extent_type == INLINE {
            let ram_bytes = if data.len() >= 25 {
                u64::from_le_bytes(data[21..29.min(data.len())].try_into().unwrap_or_default())
            } else {
                0
            };
            if ram_bytes as usize + 21 > data.len() + 8 {
                rec.set_error(error_bits::INLINE_RAM_BYTES_WRONG);
            }
            return Ok(());
        }

        if data.len() < 53 {
            return Err(Error::invalid("extent data item", key.objectid, "short regular extent"));
        }
        let disk_bytenr = u64::from_le_bytes(data[21..29].try_into().unwrap());
        let disk_num_bytes = u64::from_le_bytes(data[29..37].try_into().unwrap());
        let num_bytes = u64::from_le_bytes(data[45..53].try_into().unwrap());
        let sector = self.geometry.sector_size as u64;

        if num_bytes & (sector - 1) != 0 {
            rec.set_error(error_bits::FILE_EXTENT_MISALIGNED);
        }

        let start = key.offset;
        let end = start + num_bytes;
        if start > rec.extent_end {
            rec.record_hole(rec.extent_end, start - rec.extent_end);
        } else if start < rec.extent_end {
            rec.set_error(error_bits::FILE_EXTENT_OVERLAP);
        }
        rec.extent_end = rec.extent_end.max(end);

        if disk_bytenr != 0 {
            let has_backref = self.extents.find_data_backref(
                disk_bytenr,
                None,
                Some(objectid::FsTree),
                key.objectid,
                start,
            );
            if !has_backref {
                self.extents.add_data_backref(
                    disk_bytenr,
                    None,
                    Some(objectid::FsTree),
                    key.objectid,
                    start,
                    1,
                    0,
                    true,
                    disk_num_bytes,
                );
            }
            let csum_count = self.csum_coverage(disk_bytenr, disk_num_bytes)?;
            let expected = (disk_num_bytes + sector - 1) / sector;
            if csum_count == 0 && expected > 0 {
                rec.set_error(error_bits::SOME_CSUM_MISSING);
            } else if csum_count != expected {
                rec.set_error(error_bits::ODD_CSUM_ITEM);
            }
            report.csum_bytes_checked += csum_count * 4;
        }
        Ok(())
    }

    /// Counts `u32` checksums covering `[disk_bytenr, disk_bytenr+len)` by
    /// reading `ExtentCsum` items keyed under the csum objectid, one `u32`
    /// CRC per sector.
    fn csum_coverage(&self, disk_bytenr: Logical, len: u64) -> Result<u64> {
        let items = self
            .store
            .items_for_objectid(self.csum_root, objectid::ExtentCsum)?;
        let mut covered = 0u64;
        for (key, data) in items {
            if key.offset >= disk_bytenr && key.offset < disk_bytenr + len {
                covered += (data.len() as u64) / 4;
            }
        }
        Ok(covered)
    }

    /// Applies remaining size/link/hole invariants and releases the record
    /// if it carries no open errors.
    fn maybe_free_inode_rec(&mut self, ino: u64) {
        let should_release = {
            let rec = match self.records.get_mut(&ino) {
                Some(r) => r,
                None => return,
            };
            if rec.extent_end > 0 {
                rec.record_hole(rec.extent_end, 0);
            }
            if rec.isize != rec.extent_end && rec.extent_end > 0 {
                rec.set_error(error_bits::ISIZE_WRONG);
                rec.found_size = rec.extent_end;
            }
            rec.errors == 0
        };
        if should_release {
            self.records.remove(&ino);
        }
    }

    pub fn records(&self) -> &HashMap<u64, InodeRecord> {
        &self.records
    }

    pub fn take_records(self) -> HashMap<u64, InodeRecord> {
        self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsforge_tree::InMemoryTreeStore;

    fn inode_payload(nlink: u64, isize: u64, nbytes: u64, generation: u64, imode: u32, flags: u32) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&nlink.to_le_bytes());
        v.extend_from_slice(&isize.to_le_bytes());
        v.extend_from_slice(&nbytes.to_le_bytes());
        v.extend_from_slice(&generation.to_le_bytes());
        v.extend_from_slice(&imode.to_le_bytes());
        v.extend_from_slice(&flags.to_le_bytes());
        v
    }

    #[test]
    fn orphan_without_item_is_flagged() {
        let store = InMemoryTreeStore::new();
        let extents = ExtentRefModel::new();
        let root = 0u64;
        let key = Key::new(257, key_type::InodeItem, 0);
        store.insert_empty_item(root, key, 40).unwrap();
        store
            .set_item_data(root, &key, inode_payload(0, 0, 0, 1, 0o100644, 0))
            .unwrap();

        let mut walker = FsRootWalker::new(&store, &extents, FsGeometry::default(), 10, 7);
        let report = walker.walk(root).unwrap();
        assert_eq!(report.inodes_visited, 1);
        let rec = walker.records().get(&257).unwrap();
        assert!(rec.has_error(error_bits::ORPHAN_NO_ITEM));
    }

    #[test]
    fn clean_inode_with_link_is_released() {
        let store = InMemoryTreeStore::new();
        let extents = ExtentRefModel::new();
        let root = 0u64;
        let key = Key::new(257, key_type::InodeItem, 0);
        store.insert_empty_item(root, key, 40).unwrap();
        store
            .set_item_data(root, &key, inode_payload(1, 0, 0, 1, 0o100644, 0))
            .unwrap();

        let mut walker = FsRootWalker::new(&store, &extents, FsGeometry::default(), 10, 7);
        walker.walk(root).unwrap();
        assert!(walker.records().get(&257).is_none());
    }
}
