//! ExtentRefModel: extent records, tree/data backref sets,
//! duplicate tracking and the deferred-mutation pending queue. Follows the
//! same reference-counted handle bookkeeping as `fsforge_tree`'s
//! `ExtentBufferArena` (`find_create`/refcount pattern), generalised to a
//! tagged union of backref kinds and a queue of mutations deferred until
//! the walk that found them has finished.

use fsforge_core::{key_type, Error, Key, Logical, Result};
use fsforge_tree::TreeStore;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use tracing::{info, warn};

/// Tagged union distinguishing a full backref (keyed by the referencing
/// tree block) from a rooted backref (keyed by the owning root id), per
/// "Unions in backref types" note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackrefTarget {
    Rooted(u64),
    FullBackref(Logical),
}

impl BackrefTarget {
    fn rank(&self) -> u8 {
        match self {
            BackrefTarget::Rooted(_) => 0,
            BackrefTarget::FullBackref(_) => 1,
        }
    }
}

impl PartialOrd for BackrefTarget {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BackrefTarget {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank()).then_with(|| match (self, other) {
            (BackrefTarget::Rooted(a), BackrefTarget::Rooted(b)) => a.cmp(b),
            (BackrefTarget::FullBackref(a), BackrefTarget::FullBackref(b)) => a.cmp(b),
            _ => Ordering::Equal,
        })
    }
}

/// One backref on an [`ExtentRecord`]. Comparison order: rooted before
/// full-backref within the same extent, then `(owner, offset)` for data,
/// then `(disk_bytenr, bytes)` for found refs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backref {
    pub for_data: bool,
    pub target: BackrefTarget,
    pub owner: u64,
    pub offset: u64,
    pub num_refs: u32,
    pub found_ref: u32,
    pub disk_bytenr: Logical,
    pub bytes: u64,
}

impl PartialOrd for Backref {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Backref {
    fn cmp(&self, other: &Self) -> Ordering {
        self.target
            .cmp(&other.target)
            .then_with(|| (self.owner, self.offset).cmp(&(other.owner, other.offset)))
            .then_with(|| (self.disk_bytenr, self.bytes).cmp(&(other.disk_bytenr, other.bytes)))
    }
}

/// A pending copy of an extent's observed attributes, used both to create
/// new records and as the duplicate-tracking payload.
#[derive(Debug, Clone)]
pub struct ExtentRecordTemplate {
    pub start: Logical,
    pub nr: u64,
    pub refs: Option<u64>,
    pub found_rec: bool,
    pub generation: u64,
    pub flags: u64,
}

/// One tracked extent and the backrefs the walk has found pointing at it.
#[derive(Debug, Clone)]
pub struct ExtentRecord {
    pub start: Logical,
    pub nr: u64,
    pub refs: u64,
    pub found_rec: bool,
    pub generation: u64,
    pub flags: u64,
    pub wrong_chunk_type: bool,
    pub backrefs: Vec<Backref>,
    pub dups: Vec<ExtentRecordTemplate>,
}

impl ExtentRecord {
    fn from_template(tmpl: &ExtentRecordTemplate) -> Self {
        ExtentRecord {
            start: tmpl.start,
            nr: tmpl.nr,
            refs: tmpl.refs.unwrap_or(0),
            found_rec: tmpl.found_rec,
            generation: tmpl.generation,
            flags: tmpl.flags,
            wrong_chunk_type: false,
            backrefs: Vec::new(),
            dups: Vec::new(),
        }
    }

    fn end(&self) -> Logical {
        self.start + self.nr
    }
}

enum PendingExtentOp {
    Insert(ExtentRecordTemplate),
    Delete(Logical),
}

/// Owns every tracked extent for one checker/restorer run, plus the
/// deferred-mutation queues that keep tree surgery out of the middle of a
/// walk.
pub struct ExtentRefModel {
    cache: Mutex<BTreeMap<Logical, ExtentRecord>>,
    duplicate_extents: Mutex<Vec<ExtentRecordTemplate>>,
    pending: Mutex<Vec<PendingExtentOp>>,
}

impl ExtentRefModel {
    pub fn new() -> Self {
        ExtentRefModel {
            cache: Mutex::new(BTreeMap::new()),
            duplicate_extents: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
        }
    }

    fn find_start(cache: &BTreeMap<Logical, ExtentRecord>, bytenr: Logical) -> Option<Logical> {
        cache
            .range(..=bytenr)
            .next_back()
            .filter(|(_, rec)| bytenr < rec.end())
            .map(|(&start, _)| start)
    }

    /// Looks up the extent covering `tmpl.start`; inserts if absent. If
    /// present, merges hint fields and, on a mismatched/duplicate
    /// observation, records `tmpl` on the existing record's `dups` and
    /// pushes it onto the global duplicate queue.
    pub fn add_or_merge(&self, tmpl: ExtentRecordTemplate) {
        let mut cache = self.cache.lock().unwrap();
        match Self::find_start(&cache, tmpl.start) {
            None => {
                cache.insert(tmpl.start, ExtentRecord::from_template(&tmpl));
            }
            Some(start) => {
                let rec = cache.get_mut(&start).unwrap();
                let mismatched = rec.start != tmpl.start || rec.nr != tmpl.nr;
                if let Some(refs) = tmpl.refs {
                    rec.refs += refs;
                }
                if tmpl.found_rec {
                    rec.found_rec = true;
                    if mismatched {
                        rec.dups.push(tmpl.clone());
                        drop(cache);
                        self.duplicate_extents.lock().unwrap().push(tmpl);
                        return;
                    }
                }
            }
        }
    }

    fn ensure_record(&self, cache: &mut BTreeMap<Logical, ExtentRecord>, bytenr: Logical) -> Logical {
        if let Some(start) = Self::find_start(cache, bytenr) {
            return start;
        }
        cache.insert(
            bytenr,
            ExtentRecord {
                start: bytenr,
                nr: 1,
                refs: 0,
                found_rec: false,
                generation: 0,
                flags: 0,
                wrong_chunk_type: false,
                backrefs: Vec::new(),
                dups: Vec::new(),
            },
        );
        bytenr
    }

    fn upsert_backref(rec: &mut ExtentRecord, mut backref: Backref) {
        let existing = rec.backrefs.iter_mut().find(|b| {
            b.for_data == backref.for_data
                && b.target == backref.target
                && b.owner == backref.owner
                && b.offset == backref.offset
        });
        match existing {
            Some(slot) => {
                slot.num_refs += backref.num_refs;
                slot.found_ref += backref.found_ref;
            }
            None => {
                backref.num_refs = backref.num_refs.max(1);
                rec.backrefs.push(backref);
            }
        }
    }

    /// Creates the extent record if missing, then inserts or updates a
    /// tree backref.
    pub fn add_tree_backref(&self, bytenr: Logical, parent: Option<Logical>, root: Option<u64>, found_ref: bool) {
        let mut cache = self.cache.lock().unwrap();
        let start = self.ensure_record(&mut cache, bytenr);
        let target = match (parent, root) {
            (Some(p), _) => BackrefTarget::FullBackref(p),
            (None, Some(r)) => BackrefTarget::Rooted(r),
            (None, None) => {
                warn!(bytenr, "tree backref with neither parent nor root");
                return;
            }
        };
        let rec = cache.get_mut(&start).unwrap();
        Self::upsert_backref(
            rec,
            Backref {
                for_data: false,
                target,
                owner: 0,
                offset: 0,
                num_refs: 1,
                found_ref: found_ref as u32,
                disk_bytenr: bytenr,
                bytes: 0,
            },
        );
    }

    /// Creates the extent record if missing, then inserts or updates a
    /// data backref.
    #[allow(clippy::too_many_arguments)]
    pub fn add_data_backref(
        &self,
        bytenr: Logical,
        parent: Option<Logical>,
        root: Option<u64>,
        owner: u64,
        offset: u64,
        num_refs: u32,
        _generation: u64,
        found_ref: bool,
        _max_size: u64,
    ) {
        let mut cache = self.cache.lock().unwrap();
        let start = self.ensure_record(&mut cache, bytenr);
        let target = match (parent, root) {
            (Some(p), _) => BackrefTarget::FullBackref(p),
            (None, Some(r)) => BackrefTarget::Rooted(r),
            (None, None) => {
                warn!(bytenr, "data backref with neither parent nor root");
                return;
            }
        };
        let rec = cache.get_mut(&start).unwrap();
        Self::upsert_backref(
            rec,
            Backref {
                for_data: true,
                target,
                owner,
                offset,
                num_refs,
                found_ref: found_ref as u32,
                disk_bytenr: bytenr,
                bytes: 0,
            },
        );
    }

    pub fn find_tree_backref(&self, bytenr: Logical, parent: Option<Logical>, root: Option<u64>) -> bool {
        let cache = self.cache.lock().unwrap();
        let Some(rec) = cache.get(&bytenr) else {
            return false;
        };
        let target = match (parent, root) {
            (Some(p), _) => BackrefTarget::FullBackref(p),
            (None, Some(r)) => BackrefTarget::Rooted(r),
            (None, None) => return false,
        };
        rec.backrefs.iter().any(|b| !b.for_data && b.target == target)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn find_data_backref(
        &self,
        bytenr: Logical,
        parent: Option<Logical>,
        root: Option<u64>,
        owner: u64,
        offset: u64,
    ) -> bool {
        let cache = self.cache.lock().unwrap();
        let Some(rec) = cache.get(&bytenr) else {
            return false;
        };
        let target = match (parent, root) {
            (Some(p), _) => BackrefTarget::FullBackref(p),
            (None, Some(r)) => BackrefTarget::Rooted(r),
            (None, None) => return false,
        };
        rec.backrefs
            .iter()
            .any(|b| b.for_data && b.target == target && b.owner == owner && b.offset == offset)
    }

    /// Verifies per-backref invariants and that the summed `found_ref`
    /// (one per tree backref) equals `rec.refs`.
    pub fn all_backpointers_checked(&self, bytenr: Logical) -> Result<bool> {
        let cache = self.cache.lock().unwrap();
        let rec = cache
            .get(&bytenr)
            .ok_or_else(|| Error::NotFound(format!("extent record at {bytenr}")))?;
        let observed: u64 = rec
            .backrefs
            .iter()
            .map(|b| if b.for_data { b.found_ref as u64 } else { 1 })
            .sum();
        Ok(observed == rec.refs)
    }

    /// Cross-references the extent with the owning block group's usage
    /// class, setting `wrong_chunk_type` on mismatch.
    pub fn check_extent_type(&self, bytenr: Logical, is_metadata: bool, group_is_metadata: bool, group_is_system: bool) {
        let mut cache = self.cache.lock().unwrap();
        if let Some(rec) = cache.get_mut(&bytenr) {
            rec.wrong_chunk_type = if is_metadata {
                !(group_is_metadata || group_is_system)
            } else {
                group_is_metadata || group_is_system
            };
        }
    }

    /// Enqueues a deferred insert.
    pub fn queue_insert(&self, tmpl: ExtentRecordTemplate) {
        self.pending.lock().unwrap().push(PendingExtentOp::Insert(tmpl));
    }

    /// Enqueues a deferred delete.
    pub fn queue_delete(&self, bytenr: Logical) {
        self.pending.lock().unwrap().push(PendingExtentOp::Delete(bytenr));
    }

    /// Flushes queued inserts by folding each template into the live
    /// cache via [`Self::add_or_merge`].
    pub fn finish_current_insert(&self) {
        let pending: Vec<ExtentRecordTemplate> = {
            let mut q = self.pending.lock().unwrap();
            let mut out = Vec::new();
            q.retain(|op| match op {
                PendingExtentOp::Insert(t) => {
                    out.push(t.clone());
                    false
                }
                PendingExtentOp::Delete(_) => true,
            });
            out
        };
        for tmpl in pending {
            self.add_or_merge(tmpl);
        }
    }

    /// Flushes queued deletes, skipping any bytenr that also has a pending
    /// insert.
    pub fn del_pending_extents(&self) {
        let mut q = self.pending.lock().unwrap();
        let still_inserting: std::collections::HashSet<Logical> = q
            .iter()
            .filter_map(|op| match op {
                PendingExtentOp::Insert(t) => Some(t.start),
                _ => None,
            })
            .collect();
        let to_delete: Vec<Logical> = q
            .iter()
            .filter_map(|op| match op {
                PendingExtentOp::Delete(b) if !still_inserting.contains(b) => Some(*b),
                _ => None,
            })
            .collect();
        q.retain(|op| !matches!(op, PendingExtentOp::Delete(b) if !still_inserting.contains(b)));
        drop(q);

        let mut cache = self.cache.lock().unwrap();
        for bytenr in to_delete {
            cache.remove(&bytenr);
        }
    }

    pub fn record(&self, bytenr: Logical) -> Option<ExtentRecord> {
        self.cache.lock().unwrap().get(&bytenr).cloned()
    }

    pub fn drain_duplicate_extents(&self) -> Vec<ExtentRecordTemplate> {
        std::mem::take(&mut self.duplicate_extents.lock().unwrap())
    }

    pub fn record_count(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    /// Every tracked extent's start bytenr, in ascending order. Used by
    /// callers (the quota verifier, the orchestrator's stats pass) that
    /// need to iterate the whole cache rather than look up one bytenr.
    pub fn all_bytenrs(&self) -> Vec<Logical> {
        self.cache.lock().unwrap().keys().copied().collect()
    }

    /// Rewrites the on-disk extent item and backrefs for `bytenr` to match
    /// what the walk actually observed: deletes every existing extent/backref
    /// item keyed under `rec.start`, then re-inserts one extent item plus
    /// exactly those backrefs with `found_ref > 0`. Skips records whose range
    /// overlaps a block already recorded as corrupt.
    pub fn fixup_extent_refs(&self, store: &dyn TreeStore, extent_root: Logical, bytenr: Logical, corrupt_blocks: &BTreeSet<Logical>) -> Result<()> {
        let rec = {
            let cache = self.cache.lock().unwrap();
            cache
                .get(&bytenr)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("extent record at {bytenr}")))?
        };
        if corrupt_blocks.range(rec.start..rec.end()).next().is_some() {
            warn!(bytenr = rec.start, "skipping fixup of extent overlapping corrupt block");
            return Ok(());
        }

        let existing: Vec<Key> = store
            .items_for_objectid(extent_root, rec.start)?
            .into_iter()
            .filter(|(k, _)| {
                matches!(
                    k.ty,
                    t if t == key_type::ExtentItem
                        || t == key_type::MetadataItem
                        || t == key_type::TreeBlockRef
                        || t == key_type::SharedBlockRef
                        || t == key_type::ExtentDataRef
                        || t == key_type::SharedDataRef
                        || t == key_type::ExtentRefV0
                )
            })
            .map(|(k, _)| k)
            .collect();
        for key in &existing {
            store.del_item(extent_root, key)?;
        }

        let mut extent_data = Vec::with_capacity(24);
        extent_data.extend_from_slice(&rec.refs.to_le_bytes());
        extent_data.extend_from_slice(&rec.generation.to_le_bytes());
        extent_data.extend_from_slice(&rec.flags.to_le_bytes());
        let extent_key = Key::new(rec.start, key_type::ExtentItem, rec.nr);
        store.insert_empty_item(extent_root, extent_key, extent_data.len() as u32)?;
        store.set_item_data(extent_root, &extent_key, extent_data)?;

        for backref in rec.backrefs.iter().filter(|b| b.found_ref > 0) {
            let (key, data) = match (backref.for_data, backref.target) {
                (false, BackrefTarget::Rooted(root)) => (Key::new(rec.start, key_type::TreeBlockRef, root), Vec::new()),
                (false, BackrefTarget::FullBackref(parent)) => (Key::new(rec.start, key_type::SharedBlockRef, parent), Vec::new()),
                (true, BackrefTarget::Rooted(root)) => {
                    let mut data = Vec::with_capacity(24);
                    data.extend_from_slice(&root.to_le_bytes());
                    data.extend_from_slice(&backref.owner.to_le_bytes());
                    data.extend_from_slice(&backref.offset.to_le_bytes());
                    // Unlike the tree-backref case, a data extent can carry
                    // many rooted backrefs (one per referencing file offset);
                    // `key.offset` isn't consulted by the reader so it only
                    // needs to keep items distinct.
                    (Key::new(rec.start, key_type::ExtentDataRef, hash_combine(root, backref.owner, backref.offset)), data)
                }
                (true, BackrefTarget::FullBackref(parent)) => {
                    let mut data = Vec::with_capacity(16);
                    data.extend_from_slice(&backref.owner.to_le_bytes());
                    data.extend_from_slice(&backref.offset.to_le_bytes());
                    (Key::new(rec.start, key_type::SharedDataRef, parent), data)
                }
            };
            if store.item_data(extent_root, &key).is_ok() {
                // A second data backref sharing the same full-backref parent;
                // the last one observed wins rather than erroring out.
                store.set_item_data(extent_root, &key, data)?;
            } else {
                store.insert_empty_item(extent_root, key, data.len() as u32)?;
                if !data.is_empty() {
                    store.set_item_data(extent_root, &key, data)?;
                }
            }
        }

        info!(bytenr = rec.start, backrefs = rec.backrefs.len(), "rewrote extent refs");
        Ok(())
    }
}

impl Default for ExtentRefModel {
    fn default() -> Self {
        Self::new()
    }
}

/// Cheap order-sensitive mix, only used to keep re-inserted `ExtentDataRef`
/// keys distinct; never read back as a meaningful value.
fn hash_combine(a: u64, b: u64, c: u64) -> u64 {
    let mut h = a.wrapping_mul(0x9E3779B97F4A7C15);
    h ^= b.wrapping_add(0x9E3779B9).rotate_left(17);
    h ^= c.wrapping_add(0x85EBCA6B).rotate_left(31);
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmpl(start: Logical, nr: u64) -> ExtentRecordTemplate {
        ExtentRecordTemplate {
            start,
            nr,
            refs: Some(1),
            found_rec: true,
            generation: 1,
            flags: 0,
        }
    }

    #[test]
    fn add_or_merge_creates_then_merges() {
        let model = ExtentRefModel::new();
        model.add_or_merge(tmpl(4096, 4096));
        assert_eq!(model.record_count(), 1);
        model.add_or_merge(tmpl(4096, 4096));
        let rec = model.record(4096).unwrap();
        assert_eq!(rec.refs, 2);
    }

    #[test]
    fn mismatched_merge_tracks_duplicate() {
        let model = ExtentRefModel::new();
        model.add_or_merge(tmpl(4096, 4096));
        model.add_or_merge(tmpl(4096, 8192));
        assert_eq!(model.drain_duplicate_extents().len(), 1);
    }

    #[test]
    fn backref_roundtrip_and_all_checked() {
        let model = ExtentRefModel::new();
        model.add_tree_backref(4096, Some(8192), None, true);
        assert!(model.find_tree_backref(4096, Some(8192), None));
        let rec = model.record(4096).unwrap();
        assert_eq!(rec.refs, 0);
    }

    #[test]
    fn fixup_extent_refs_rewrites_item_and_backref() {
        use fsforge_tree::InMemoryTreeStore;

        let store = InMemoryTreeStore::new();
        let extent_root = 2u64;
        let bytenr = 4096u64;

        // Stale on-disk state: wrong refs count, no backref item at all.
        let stale_key = Key::new(bytenr, key_type::ExtentItem, 4096);
        store.insert_empty_item(extent_root, stale_key, 24).unwrap();
        store
            .set_item_data(extent_root, &stale_key, vec![0u8; 24])
            .unwrap();

        let model = ExtentRefModel::new();
        model.add_or_merge(ExtentRecordTemplate {
            start: bytenr,
            nr: 4096,
            refs: Some(1),
            found_rec: true,
            generation: 7,
            flags: 0,
        });
        model.add_tree_backref(bytenr, None, Some(5), true);

        model
            .fixup_extent_refs(&store, extent_root, bytenr, &BTreeSet::new())
            .unwrap();

        let data = store.item_data(extent_root, &stale_key).unwrap();
        assert_eq!(u64::from_le_bytes(data[0..8].try_into().unwrap()), 1);
        assert_eq!(u64::from_le_bytes(data[8..16].try_into().unwrap()), 7);

        let backref_key = Key::new(bytenr, key_type::TreeBlockRef, 5);
        assert!(store.item_data(extent_root, &backref_key).is_ok());
    }

    #[test]
    fn fixup_extent_refs_skips_corrupt_range() {
        use fsforge_tree::InMemoryTreeStore;

        let store = InMemoryTreeStore::new();
        let extent_root = 2u64;
        let bytenr = 4096u64;
        let model = ExtentRefModel::new();
        model.add_or_merge(tmpl(bytenr, 4096));

        let mut corrupt = BTreeSet::new();
        corrupt.insert(bytenr);
        model
            .fixup_extent_refs(&store, extent_root, bytenr, &corrupt)
            .unwrap();
        assert!(store.all_items(extent_root).unwrap().is_empty());
    }

    #[test]
    fn pending_delete_skips_bytenr_with_pending_insert() {
        let model = ExtentRefModel::new();
        model.add_or_merge(tmpl(4096, 4096));
        model.queue_insert(tmpl(8192, 4096));
        model.queue_delete(4096);
        model.queue_delete(8192);
        model.del_pending_extents();
        assert!(model.record(4096).is_none());
        model.finish_current_insert();
        assert!(model.record(8192).is_some());
    }
}
