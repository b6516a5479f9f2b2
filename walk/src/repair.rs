//! Repairer: transactional mutators invoked from checker
//! findings. Follows the same narrow patch-a-single-attribute-and-commit
//! shape a filesystem writer uses for record-level repairs, generalised
//! to a fixed catalogue of repair routines, each gated by the inode error
//! bitfield.

use crate::inode::{error_bits, InodeRecord};
use fsforge_alloc::{ExtentRecord, ExtentRefModel};
use fsforge_core::{extent_flags, key_type, Error, Key, Logical, Result};
use fsforge_tree::TreeStore;
use std::collections::BTreeSet;
use tracing::info;

/// Outcome of one [`Repairer::repair_btree`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BtreeRepairReport {
    /// Corrupt blocks whose own extent item was deleted and queued for free.
    pub blocks_freed: usize,
    /// Tree/shared-block-ref items removed because they named a corrupt block.
    pub backrefs_removed: usize,
}

/// Never more than this many extra leaf slots touched by one repair call.
pub const MAX_TRANSACTION_LEAF_SLOTS: u32 = 7;

/// Applies the fixed catalogue of repair routines against a [`TreeStore`],
/// each scoped to a narrow mutation and gated by the inode's error
/// bitfield. The orchestrator does not retry past two restart passes for
/// the same root; that budget lives one layer up, in the orchestrator.
pub struct Repairer<'a> {
    store: &'a dyn TreeStore,
    root: Logical,
}

impl<'a> Repairer<'a> {
    pub fn new(store: &'a dyn TreeStore, root: Logical) -> Self {
        Repairer { store, root }
    }

    /// Overwrites `isize` with `found_size`.
    pub fn repair_inode_isize(&self, rec: &mut InodeRecord) -> Result<()> {
        if !rec.has_error(error_bits::ISIZE_WRONG) {
            return Ok(());
        }
        let key = Key::new(rec.ino, key_type::InodeItem, 0);
        let mut data = self.store.item_data(self.root, &key)?;
        if data.len() < 16 {
            return Err(Error::invalid("inode item", rec.ino, "short payload"));
        }
        data[8..16].copy_from_slice(&rec.found_size.to_le_bytes());
        self.store.set_item_data(self.root, &key, data)?;
        rec.isize = rec.found_size;
        rec.errors &= !error_bits::ISIZE_WRONG;
        info!(ino = rec.ino, isize = rec.found_size, "repaired inode isize");
        Ok(())
    }

    /// Overwrites `nbytes` with `found_size`.
    pub fn repair_inode_nbytes(&self, rec: &mut InodeRecord) -> Result<()> {
        if !rec.has_error(error_bits::NBYTES_WRONG) {
            return Ok(());
        }
        let key = Key::new(rec.ino, key_type::InodeItem, 0);
        let mut data = self.store.item_data(self.root, &key)?;
        if data.len() < 24 {
            return Err(Error::invalid("inode item", rec.ino, "short payload"));
        }
        data[16..24].copy_from_slice(&rec.found_size.to_le_bytes());
        self.store.set_item_data(self.root, &key, data)?;
        rec.nbytes = rec.found_size;
        rec.errors &= !error_bits::NBYTES_WRONG;
        info!(ino = rec.ino, nbytes = rec.found_size, "repaired inode nbytes");
        Ok(())
    }

    /// Inserts an `OrphanItem` for a zero-nlink inode.
    pub fn repair_inode_orphan_item(&self, rec: &mut InodeRecord) -> Result<()> {
        if !rec.has_error(error_bits::ORPHAN_NO_ITEM) {
            return Ok(());
        }
        let key = Key::new(key_type_orphan_objectid(), key_type::OrphanItem, rec.ino);
        if self.store.item_data(self.root, &key).is_err() {
            self.store.insert_empty_item(self.root, key, 0)?;
        }
        rec.errors &= !error_bits::ORPHAN_NO_ITEM;
        info!(ino = rec.ino, "inserted orphan item");
        Ok(())
    }

    /// Deletes all inode refs/dir items/indices for this record, then
    /// re-adds only those passing all three of `inode_ref ∧ dir_item ∧
    /// dir_index`; if none survive, links under lost+found.
    pub fn repair_inode_nlinks(&self, rec: &mut InodeRecord, lost_found_dir: u64) -> Result<()> {
        if !rec.has_error(error_bits::INVALID_NLINK) && !rec.has_error(error_bits::DUP_DIR_INDEX) {
            return Ok(());
        }
        let refs: Vec<(Key, Vec<u8>)> = self
            .store
            .items_for_objectid(self.root, rec.ino)?
            .into_iter()
            .filter(|(k, _)| k.ty == key_type::InodeRef || k.ty == key_type::InodeExtref)
            .collect();
        for (key, _) in &refs {
            self.store.del_item(self.root, key)?;
        }

        let survivors = rec.three_of_three();
        if survivors {
            for (key, data) in refs {
                self.store.insert_empty_item(self.root, key, data.len() as u32)?;
                self.store.set_item_data(self.root, &key, data)?;
            }
            rec.found_link = rec.nlink;
        } else {
            let name = format!("lost+found-{}", rec.ino);
            let lf_key = Key::new(lost_found_dir, key_type::DirIndex, 0);
            self.store
                .insert_empty_item(self.root, lf_key, name.len() as u32)?;
            self.store
                .set_item_data(self.root, &lf_key, name.into_bytes())?;
            rec.found_link = 1;
        }
        let key = Key::new(rec.ino, key_type::InodeItem, 0);
        let mut data = self.store.item_data(self.root, &key)?;
        data[0..8].copy_from_slice(&rec.found_link.to_le_bytes());
        self.store.set_item_data(self.root, &key, data)?;
        rec.nlink = rec.found_link;
        rec.errors &= !(error_bits::INVALID_NLINK | error_bits::DUP_DIR_INDEX);
        info!(ino = rec.ino, nlink = rec.found_link, "repaired inode nlinks");
        Ok(())
    }

    /// Punches each recorded hole; if none, punches a single hole over the
    /// whole file.
    pub fn repair_inode_discount_extent(&self, rec: &mut InodeRecord) -> Result<()> {
        let holes = if rec.holes.is_empty() {
            vec![crate::inode::HoleRecord { start: 0, len: rec.isize }]
        } else {
            rec.holes.clone()
        };
        for hole in holes {
            if hole.len == 0 {
                continue;
            }
            let key = Key::new(rec.ino, key_type::ExtentData, hole.start);
            if self.store.item_data(self.root, &key).is_err() {
                self.store.insert_empty_item(self.root, key, 53)?;
            }
        }
        rec.holes.clear();
        Ok(())
    }

    /// Deletes the offending `dir_item` entries, re-queueing `isize`
    /// reconciliation for the following pass.
    pub fn repair_mismatch_dir_hash(&self, rec: &mut InodeRecord) -> Result<()> {
        if !rec.has_error(error_bits::MISMATCH_DIR_HASH) {
            return Ok(());
        }
        let offenders: Vec<Key> = self
            .store
            .items_for_objectid(self.root, rec.ino)?
            .into_iter()
            .filter(|(k, _)| k.ty == key_type::DirItem)
            .map(|(k, _)| k)
            .collect();
        for key in offenders {
            self.store.del_item(self.root, &key)?;
        }
        rec.errors &= !error_bits::MISMATCH_DIR_HASH;
        rec.set_error(error_bits::ISIZE_WRONG);
        Ok(())
    }

    /// Assigns `S_IFDIR|0755` under the root tree, `S_IFREG|0600`
    /// elsewhere; otherwise an `imode` detector infers mode from observed
    /// payloads.
    pub fn repair_imode_original(&self, rec: &mut InodeRecord, is_root_tree: bool, has_dir_items: bool) -> Result<()> {
        const S_IFDIR: u32 = 0o040000 | 0o755;
        const S_IFREG: u32 = 0o100000 | 0o600;
        let imode = if is_root_tree {
            S_IFDIR
        } else if has_dir_items {
            0o040000 | 0o755
        } else {
            S_IFREG
        };
        let key = Key::new(rec.ino, key_type::InodeItem, 0);
        let mut data = self.store.item_data(self.root, &key)?;
        if data.len() < 36 {
            return Err(Error::invalid("inode item", rec.ino, "short payload"));
        }
        data[32..36].copy_from_slice(&imode.to_le_bytes());
        self.store.set_item_data(self.root, &key, data)?;
        rec.imode = imode;
        Ok(())
    }

    /// Overwrites inode generation and transid with the current
    /// transaction id.
    pub fn repair_inode_gen_original(&self, rec: &mut InodeRecord, transid: u64) -> Result<()> {
        let key = Key::new(rec.ino, key_type::InodeItem, 0);
        let mut data = self.store.item_data(self.root, &key)?;
        if data.len() < 32 {
            return Err(Error::invalid("inode item", rec.ino, "short payload"));
        }
        data[24..32].copy_from_slice(&transid.to_le_bytes());
        self.store.set_item_data(self.root, &key, data)?;
        rec.generation = transid;
        rec.errors &= !error_bits::INVALID_GEN;
        Ok(())
    }

    /// Toggles the extent item's `FULL_BACKREF` flag to match what the walk
    /// actually observed. `self.root` must be the extent
    /// tree's root for this call; skinny metadata items are consulted as a
    /// fallback when the non-skinny `ExtentItem` key is absent.
    pub fn fixup_extent_flags(&self, rec: &ExtentRecord, observed_full_backref: bool) -> Result<()> {
        let key = Key::new(rec.start, key_type::ExtentItem, rec.nr);
        let found = match self.store.item_data(self.root, &key) {
            Ok(data) => Some((key, data)),
            Err(_) => self
                .store
                .items_for_objectid(self.root, rec.start)?
                .into_iter()
                .find(|(k, _)| k.ty == key_type::MetadataItem),
        };
        let Some((key, mut data)) = found else {
            return Err(Error::NotFound(format!("extent item at {}", rec.start)));
        };
        if data.len() < 24 {
            return Err(Error::invalid("extent item", rec.start, "short payload"));
        }
        let mut flags = u64::from_le_bytes(data[16..24].try_into().unwrap());
        let has_full_backref = flags & extent_flags::FULL_BACKREF != 0;
        if has_full_backref != observed_full_backref {
            flags ^= extent_flags::FULL_BACKREF;
            data[16..24].copy_from_slice(&flags.to_le_bytes());
            self.store.set_item_data(self.root, &key, data)?;
            info!(bytenr = rec.start, observed_full_backref, "toggled extent full-backref flag");
        }
        Ok(())
    }

    /// For each block in `corrupt_blocks`, removes its own extent item and
    /// any tree/shared-block-ref item naming it, queues the bytenr for
    /// freeing on `extents`, then forces a `search_slot` so the path the
    /// next walk pass uses reflects the shrunk item set: for each interior
    /// node referencing a block with bad key order or invalid offsets,
    /// removes the pointer and frees the extent, then re-balances via
    /// forced searches. `self.root` must be the extent tree's root for this
    /// call.
    pub fn repair_btree(&self, extents: &ExtentRefModel, corrupt_blocks: &BTreeSet<Logical>) -> Result<BtreeRepairReport> {
        let mut report = BtreeRepairReport::default();
        for &bytenr in corrupt_blocks {
            let items = self.store.items_for_objectid(self.root, bytenr)?;
            for (key, _) in &items {
                match key.ty {
                    t if t == key_type::ExtentItem || t == key_type::MetadataItem => {
                        self.store.del_item(self.root, key)?;
                        report.blocks_freed += 1;
                    }
                    t if t == key_type::TreeBlockRef || t == key_type::SharedBlockRef => {
                        self.store.del_item(self.root, key)?;
                        report.backrefs_removed += 1;
                    }
                    _ => {}
                }
            }
            extents.queue_delete(bytenr);
            let probe = Key::new(bytenr, key_type::ExtentItem, 0);
            self.store.search_slot(self.root, &probe, 0, false)?;
            info!(bytenr, "repaired btree pointer to corrupt block");
        }
        extents.del_pending_extents();
        Ok(report)
    }
}

/// Objectid the on-disk orphan item is keyed under; this core only names
/// it where `Repairer` needs it.
fn key_type_orphan_objectid() -> u64 {
    fsforge_core::objectid::FsTree
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsforge_tree::InMemoryTreeStore;

    fn inode_payload() -> Vec<u8> {
        let mut v = vec![0u8; 40];
        v[0..8].copy_from_slice(&1u64.to_le_bytes()); // nlink
        v
    }

    #[test]
    fn repair_isize_overwrites_and_clears_error() {
        let store = InMemoryTreeStore::new();
        let root = 0u64;
        let ino = 300u64;
        let key = Key::new(ino, key_type::InodeItem, 0);
        store.insert_empty_item(root, key, 40).unwrap();
        store.set_item_data(root, &key, inode_payload()).unwrap();

        let mut rec = InodeRecord::new(ino);
        rec.set_error(error_bits::ISIZE_WRONG);
        rec.found_size = 4096;

        let repairer = Repairer::new(&store, root);
        repairer.repair_inode_isize(&mut rec).unwrap();

        assert!(!rec.has_error(error_bits::ISIZE_WRONG));
        let data = store.item_data(root, &key).unwrap();
        assert_eq!(u64::from_le_bytes(data[8..16].try_into().unwrap()), 4096);
    }

    #[test]
    fn repair_orphan_item_inserts_once() {
        let store = InMemoryTreeStore::new();
        let root = 0u64;
        let ino = 301u64;
        let mut rec = InodeRecord::new(ino);
        rec.set_error(error_bits::ORPHAN_NO_ITEM);

        let repairer = Repairer::new(&store, root);
        repairer.repair_inode_orphan_item(&mut rec).unwrap();
        assert!(!rec.has_error(error_bits::ORPHAN_NO_ITEM));
        let key = Key::new(key_type_orphan_objectid(), key_type::OrphanItem, ino);
        assert!(store.item_data(root, &key).is_ok());
    }

    fn extent_item_payload(refs: u64, generation: u64, flags: u64) -> Vec<u8> {
        let mut v = refs.to_le_bytes().to_vec();
        v.extend_from_slice(&generation.to_le_bytes());
        v.extend_from_slice(&flags.to_le_bytes());
        v
    }

    fn dummy_rec(start: Logical, nr: u64) -> ExtentRecord {
        ExtentRecord {
            start,
            nr,
            refs: 1,
            found_rec: true,
            generation: 5,
            flags: 0,
            wrong_chunk_type: false,
            backrefs: Vec::new(),
            dups: Vec::new(),
        }
    }

    #[test]
    fn fixup_extent_flags_toggles_full_backref() {
        let store = InMemoryTreeStore::new();
        let extent_root = 2u64;
        let key = Key::new(4096, key_type::ExtentItem, 4096);
        store.insert_empty_item(extent_root, key, 24).unwrap();
        store
            .set_item_data(extent_root, &key, extent_item_payload(1, 5, 0))
            .unwrap();

        let repairer = Repairer::new(&store, extent_root);
        let rec = dummy_rec(4096, 4096);
        repairer.fixup_extent_flags(&rec, true).unwrap();

        let data = store.item_data(extent_root, &key).unwrap();
        let flags = u64::from_le_bytes(data[16..24].try_into().unwrap());
        assert_eq!(flags & extent_flags::FULL_BACKREF, extent_flags::FULL_BACKREF);

        // Matching the already-set flag a second time is a no-op.
        repairer.fixup_extent_flags(&rec, true).unwrap();
        let data = store.item_data(extent_root, &key).unwrap();
        let flags = u64::from_le_bytes(data[16..24].try_into().unwrap());
        assert_eq!(flags, extent_flags::FULL_BACKREF);
    }

    #[test]
    fn repair_btree_drops_pointers_to_corrupt_block() {
        let store = InMemoryTreeStore::new();
        let extent_root = 2u64;
        let corrupt_bytenr = 8192u64;

        let extent_key = Key::new(corrupt_bytenr, key_type::ExtentItem, 4096);
        store.insert_empty_item(extent_root, extent_key, 24).unwrap();
        let backref_key = Key::new(corrupt_bytenr, key_type::TreeBlockRef, 5);
        store.insert_empty_item(extent_root, backref_key, 0).unwrap();

        let extents = ExtentRefModel::new();
        let repairer = Repairer::new(&store, extent_root);
        let mut corrupt = BTreeSet::new();
        corrupt.insert(corrupt_bytenr);

        let report = repairer.repair_btree(&extents, &corrupt).unwrap();
        assert_eq!(report.blocks_freed, 1);
        assert_eq!(report.backrefs_removed, 1);
        assert!(store.items_for_objectid(extent_root, corrupt_bytenr).unwrap().is_empty());
    }
}
