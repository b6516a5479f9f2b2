//! FreeSpaceCore: per-block-group free-space index with
//! extent/bitmap fusion. Follows the same bitmap-cache-with-explicit-
//! invalidation shape an ext4-style block allocator uses, generalised
//! from a single free-block bitmap to the mixed extent/bitmap
//! representation this filesystem's free-space cache actually uses.

use fsforge_core::{Error, Logical, Result};
use fsforge_tree::TreeStore;
use std::collections::BTreeMap;
use tracing::debug;

/// One run of free space, either a plain `[offset, offset+bytes)` extent or
/// a bitmap whose set bits each represent `bitmap_unit` free bytes starting
/// at `offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Extent,
    Bitmap(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeSpaceEntry {
    pub offset: Logical,
    pub bytes: u64,
    pub kind: EntryKind,
}

impl FreeSpaceEntry {
    fn end(&self) -> Logical {
        self.offset + self.bytes
    }

    fn is_bitmap(&self) -> bool {
        matches!(self.kind, EntryKind::Bitmap(_))
    }
}

/// Per-block-group index of [`FreeSpaceEntry`]s, ordered by `offset`.
pub struct FreeSpaceCore {
    pub block_group_start: Logical,
    pub block_group_length: u64,
    pub bitmap_unit: u64,
    entries: BTreeMap<Logical, FreeSpaceEntry>,
    pub free_space: u64,
    pub free_extents: u64,
    pub total_bitmaps: u64,
}

impl FreeSpaceCore {
    pub fn new(block_group_start: Logical, block_group_length: u64, bitmap_unit: u64) -> Self {
        FreeSpaceCore {
            block_group_start,
            block_group_length,
            bitmap_unit,
            entries: BTreeMap::new(),
            free_space: 0,
            free_extents: 0,
            total_bitmaps: 0,
        }
    }

    fn in_range(&self, offset: Logical, bytes: u64) -> bool {
        offset >= self.block_group_start
            && offset + bytes <= self.block_group_start + self.block_group_length
    }

    /// Inserts `[offset, offset+bytes)` as a free extent, merging with an
    /// abutting non-bitmap neighbour on either side.
    pub fn add(&mut self, offset: Logical, bytes: u64) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }
        if !self.in_range(offset, bytes) {
            return Err(Error::Invalid {
                what: "free space extent",
                bytenr: offset,
                reason: format!(
                    "[{offset}, {}) outside block group [{}, {})",
                    offset + bytes,
                    self.block_group_start,
                    self.block_group_start + self.block_group_length
                ),
            });
        }

        let mut start = offset;
        let mut end = offset + bytes;

        let left_match = self
            .entries
            .range(..start)
            .next_back()
            .filter(|(_, e)| !e.is_bitmap() && e.end() == start)
            .map(|(&off, e)| (off, e.clone()));
        if let Some((left_off, left)) = left_match {
            start = left_off;
            self.remove_accounting(&left);
            self.entries.remove(&left_off);
        }

        let right_match = self
            .entries
            .range(end..)
            .next()
            .filter(|(&off, e)| !e.is_bitmap() && off == end)
            .map(|(&off, e)| (off, e.clone()));
        if let Some((right_off, right)) = right_match {
            end = right.end();
            self.remove_accounting(&right);
            self.entries.remove(&right_off);
        }

        let merged = FreeSpaceEntry {
            offset: start,
            bytes: end - start,
            kind: EntryKind::Extent,
        };
        self.add_accounting(&merged);
        self.entries.insert(start, merged);
        Ok(())
    }

    fn add_accounting(&mut self, entry: &FreeSpaceEntry) {
        self.free_space += entry.bytes;
        match &entry.kind {
            EntryKind::Extent => self.free_extents += 1,
            EntryKind::Bitmap(_) => self.total_bitmaps += 1,
        }
    }

    fn remove_accounting(&mut self, entry: &FreeSpaceEntry) {
        self.free_space = self.free_space.saturating_sub(entry.bytes);
        match &entry.kind {
            EntryKind::Extent => self.free_extents = self.free_extents.saturating_sub(1),
            EntryKind::Bitmap(_) => self.total_bitmaps = self.total_bitmaps.saturating_sub(1),
        }
    }

    /// Left-leaning search: the entry covering `offset`, or (if `fuzzy`) the
    /// nearest entry strictly after it.
    pub fn search(&self, offset: Logical, fuzzy: bool) -> Option<&FreeSpaceEntry> {
        if let Some((_, entry)) = self.entries.range(..=offset).next_back() {
            if entry.offset <= offset && offset < entry.end() {
                return Some(entry);
            }
        }
        if fuzzy {
            return self.entries.range(offset..).next().map(|(_, e)| e);
        }
        None
    }

    /// Walks bits of a bitmap entry from `max(offset, entry.offset)`
    /// forward, returning the byte range of the first run of set bits long
    /// enough to cover `bytes`.
    pub fn bitmap_search(
        &self,
        entry: &FreeSpaceEntry,
        offset: Logical,
        bytes: u64,
    ) -> Option<(Logical, u64)> {
        let bitmap = match &entry.kind {
            EntryKind::Bitmap(b) => b,
            EntryKind::Extent => return None,
        };
        let unit = self.bitmap_unit.max(1);
        let need_bits = (bytes + unit - 1) / unit;
        let start_bit = offset.saturating_sub(entry.offset) / unit;
        let total_bits = (bitmap.len() as u64) * 8;

        let mut run_start: Option<u64> = None;
        let mut bit = start_bit;
        while bit < total_bits {
            let byte = (bit / 8) as usize;
            let shift = bit % 8;
            let set = (bitmap[byte] >> shift) & 1 == 1;
            if set {
                let s = *run_start.get_or_insert(bit);
                if bit - s + 1 >= need_bits {
                    let found_offset = entry.offset + s * unit;
                    return Some((found_offset, need_bits * unit));
                }
            } else {
                run_start = None;
            }
            bit += 1;
        }
        None
    }

    /// Streams a stored free-space-cache v1 inode buffer that has already
    /// been assembled (concatenated file extents) by the caller. `buf`
    /// layout: an 8-byte entry count, a generation, then `count` fixed
    /// `(offset: u64, bytes: u64, is_bitmap: u8)` records, bitmap payloads
    /// trailing in the same order as their entries (steps
    /// 1-4; this core owns validation, not inode/extent resolution, which
    /// is the walker's job).
    pub fn load_v1(&mut self, buf: &[u8], header_generation: u64) -> Result<()> {
        if buf.len() < 16 {
            return Err(Error::Invalid {
                what: "free space cache v1",
                bytenr: self.block_group_start,
                reason: "buffer shorter than header".into(),
            });
        }
        let count = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let inode_generation = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        if inode_generation != header_generation {
            return Err(Error::Invalid {
                what: "free space cache v1",
                bytenr: self.block_group_start,
                reason: format!(
                    "header generation {header_generation} != inode generation {inode_generation}"
                ),
            });
        }

        let mut offset = 16usize;
        let mut records = Vec::with_capacity(count as usize);
        for _ in 0..count {
            if offset + 17 > buf.len() {
                return Err(Error::Invalid {
                    what: "free space cache v1",
                    bytenr: self.block_group_start,
                    reason: "truncated entry table".into(),
                });
            }
            let e_offset = u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap());
            let e_bytes = u64::from_le_bytes(buf[offset + 8..offset + 16].try_into().unwrap());
            let is_bitmap = buf[offset + 16] != 0;
            records.push((e_offset, e_bytes, is_bitmap));
            offset += 17;
        }

        self.entries.clear();
        self.free_space = 0;
        self.free_extents = 0;
        self.total_bitmaps = 0;

        for (e_offset, e_bytes, is_bitmap) in records {
            if is_bitmap {
                let unit = self.bitmap_unit.max(1);
                let needed = ((e_bytes + unit - 1) / unit + 7) as usize / 8;
                if offset + needed > buf.len() {
                    return Err(Error::Invalid {
                        what: "free space cache v1",
                        bytenr: self.block_group_start,
                        reason: "truncated bitmap payload".into(),
                    });
                }
                let bitmap = buf[offset..offset + needed].to_vec();
                offset += needed;
                let entry = FreeSpaceEntry {
                    offset: e_offset,
                    bytes: e_bytes,
                    kind: EntryKind::Bitmap(bitmap),
                };
                self.add_accounting(&entry);
                self.entries.insert(e_offset, entry);
            } else {
                self.add(e_offset, e_bytes)?;
            }
        }
        Ok(())
    }

    /// Walks `FreeSpaceInfo`/`FreeSpaceExtent`/`FreeSpaceBitmap` keys for
    /// `block_group_start` out of the dedicated free-space tree rooted at
    /// `root`.
    pub fn load_v2(&mut self, store: &dyn TreeStore, root: Logical) -> Result<()> {
        self.entries.clear();
        self.free_space = 0;
        self.free_extents = 0;
        self.total_bitmaps = 0;

        let items = store.items_for_objectid(root, self.block_group_start)?;
        for (key, data) in items {
            match key.ty {
                t if t == fsforge_core::key::key_type::FreeSpaceExtent => {
                    // A FREE_SPACE_EXTENT item carries no payload: the free
                    // region's start is the key's objectid and its length
                    // is the key's offset.
                    self.add(key.objectid, key.offset)?;
                }
                t if t == fsforge_core::key::key_type::FreeSpaceBitmap => {
                    let entry = FreeSpaceEntry {
                        offset: key.offset,
                        bytes: (data.len() as u64) * 8 * self.bitmap_unit.max(1),
                        kind: EntryKind::Bitmap(data),
                    };
                    if !self.in_range(entry.offset, entry.bytes) {
                        return Err(Error::Invalid {
                            what: "free space bitmap",
                            bytenr: entry.offset,
                            reason: "bitmap extends past block group".into(),
                        });
                    }
                    self.add_accounting(&entry);
                    self.entries.insert(entry.offset, entry);
                }
                t if t == fsforge_core::key::key_type::FreeSpaceInfo => {
                    debug!(
                        block_group = self.block_group_start,
                        "free space info item seen, using-bitmaps hint carried by caller"
                    );
                }
                _ => {}
            }
        }
        self.merge();
        Ok(())
    }

    /// Deletes the cached free-space inode's items via `store`, then resets
    /// this group's counters.
    pub fn clear(&mut self, store: &dyn TreeStore, root: Logical, objectid: u64) -> Result<()> {
        let items = store.items_for_objectid(root, objectid)?;
        for (key, _) in items {
            store.del_item(root, &key)?;
        }
        self.entries.clear();
        self.free_space = 0;
        self.free_extents = 0;
        self.total_bitmaps = 0;
        Ok(())
    }

    /// Eagerly fuses adjacent extent entries and flattens bitmap entries
    /// back into extents until no more merges apply.
    pub fn merge(&mut self) {
        loop {
            let keys: Vec<Logical> = self.entries.keys().copied().collect();
            let mut merged_any = false;
            for k in keys {
                let Some(entry) = self.entries.get(&k) else {
                    continue;
                };
                if entry.is_bitmap() {
                    continue;
                }
                let end = entry.end();
                if let Some(next) = self.entries.get(&end).cloned() {
                    if !next.is_bitmap() {
                        let merged = FreeSpaceEntry {
                            offset: k,
                            bytes: end - k + next.bytes,
                            kind: EntryKind::Extent,
                        };
                        self.entries.remove(&end);
                        self.entries.insert(k, merged);
                        merged_any = true;
                    }
                }
            }
            if !merged_any {
                break;
            }
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &FreeSpaceEntry> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsforge_core::Key;
    use fsforge_tree::InMemoryTreeStore;

    #[test]
    fn add_merges_in_any_insertion_order() {
        let mut core = FreeSpaceCore::new(0, 1000, 4096);
        core.add(100, 100).unwrap();
        core.add(0, 100).unwrap();
        core.add(200, 100).unwrap();
        assert_eq!(core.entries().count(), 1);
        let e = core.entries().next().unwrap();
        assert_eq!((e.offset, e.bytes), (0, 300));
        assert_eq!(core.free_space, 300);
    }

    #[test]
    fn search_finds_covering_and_fuzzy_entries() {
        let mut core = FreeSpaceCore::new(0, 1000, 4096);
        core.add(500, 100).unwrap();
        assert!(core.search(550, false).is_some());
        assert!(core.search(10, false).is_none());
        assert_eq!(core.search(10, true).unwrap().offset, 500);
    }

    #[test]
    fn bitmap_search_finds_first_sufficient_run() {
        let mut core = FreeSpaceCore::new(0, 1 << 20, 4096);
        // bits: 0=free,1=used,2..5=free
        let bitmap = vec![0b0001_1101];
        let entry = FreeSpaceEntry {
            offset: 0,
            bytes: 8 * 4096,
            kind: EntryKind::Bitmap(bitmap),
        };
        let found = core.bitmap_search(&entry, 0, 2 * 4096);
        assert_eq!(found, Some((2 * 4096, 2 * 4096)));
    }

    #[test]
    fn load_v2_reads_extents_and_bitmaps_from_tree() {
        let store = InMemoryTreeStore::new();
        let root = 0u64;
        let bg_start = 1 << 24;
        let extent_key = Key::new(bg_start, fsforge_core::key::key_type::FreeSpaceExtent, 4096);
        store.insert_empty_item(root, extent_key, 0).unwrap();

        let mut core = FreeSpaceCore::new(bg_start, 1 << 30, 4096);
        core.load_v2(&store, root).unwrap();
        assert_eq!(core.free_space, 4096);
    }
}
