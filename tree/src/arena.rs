//! ExtentBufferArena: owns tree blocks in RAM, identity by
//! logical address. Follows the same cache-with-explicit-dirty-set
//! ownership pattern a block allocator uses for its per-group bitmap
//! cache, generalised from block-group bitmaps to tree blocks keyed by
//! logical address.

use crate::chunkmap::ChunkMap;
use fsforge_core::{BlockIo, Error, FsGeometry, Generation, Logical, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::warn;

/// Fixed header fields this core validates on every tree block read. The
/// real on-disk header additionally carries chunk-tree uuid and flags;
/// only the fields names as checked are modeled.
#[derive(Debug, Clone, Copy)]
pub struct TreeBlockHeader {
    pub bytenr: Logical,
    pub fsid: uuid::Uuid,
    pub generation: Generation,
    pub owner: u64,
    pub nritems: u32,
    pub level: u8,
}

pub const HEADER_LEN: usize = 8 + 16 + 8 + 8 + 4 + 1;

impl TreeBlockHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN);
        out.extend_from_slice(&self.bytenr.to_le_bytes());
        out.extend_from_slice(self.fsid.as_bytes());
        out.extend_from_slice(&self.generation.to_le_bytes());
        out.extend_from_slice(&self.owner.to_le_bytes());
        out.extend_from_slice(&self.nritems.to_le_bytes());
        out.push(self.level);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::invalid("tree block header", 0, "buffer too short"));
        }
        let bytenr = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let fsid = uuid::Uuid::from_slice(&buf[8..24]).map_err(|e| {
            Error::invalid("tree block header", bytenr, format!("bad fsid: {e}"))
        })?;
        let generation = u64::from_le_bytes(buf[24..32].try_into().unwrap());
        let owner = u64::from_le_bytes(buf[32..40].try_into().unwrap());
        let nritems = u32::from_le_bytes(buf[40..44].try_into().unwrap());
        let level = buf[44];
        Ok(TreeBlockHeader {
            bytenr,
            fsid,
            generation,
            owner,
            nritems,
            level,
        })
    }
}

/// A tree block cached in RAM.
pub struct ExtentBuffer {
    pub start: Logical,
    pub len: u32,
    pub content: Vec<u8>,
    pub up_to_date: bool,
    refcount: u32,
}

impl ExtentBuffer {
    /// Invariant from if up-to-date, the leading csum bytes
    /// equal `CRC32C(content[csum_size..])` unless dirtied without re-csum.
    pub fn csum_valid(&self, csum_size: usize) -> bool {
        if !self.up_to_date || self.content.len() < csum_size {
            return false;
        }
        fsforge_core::verify_csum(&self.content, csum_size, self.start).is_ok()
    }
}

/// A refcounted handle shared by every walker holding the same block.
pub type ExtentBufferHandle = Arc<RwLock<ExtentBuffer>>;

/// Owns every cached tree block for one filesystem instance. Duplicate
/// `find_create` calls for the same logical address share storage.
pub struct ExtentBufferArena {
    cache: Mutex<HashMap<Logical, ExtentBufferHandle>>,
    geometry: FsGeometry,
}

impl ExtentBufferArena {
    pub fn new(geometry: FsGeometry) -> Self {
        ExtentBufferArena {
            cache: Mutex::new(HashMap::new()),
            geometry,
        }
    }

    /// Returns a handle to the block at `start`, creating an empty
    /// not-up-to-date entry of `size` bytes if absent.
    pub fn find_create(&self, start: Logical, size: u32) -> ExtentBufferHandle {
        let mut cache = self.cache.lock().unwrap();
        cache
            .entry(start)
            .or_insert_with(|| {
                Arc::new(RwLock::new(ExtentBuffer {
                    start,
                    len: size,
                    content: vec![0u8; size as usize],
                    up_to_date: false,
                    refcount: 0,
                }))
            })
            .clone()
    }

    /// Drops the arena's own reference to `start`. Handles already held
    /// elsewhere keep the block alive via `Arc`; this only affects future
    /// `find_create` calls, which will re-fetch from disk. The block is
    /// freed once the last holder releases its `Arc`.
    pub fn evict(&self, start: Logical) {
        self.cache.lock().unwrap().remove(&start);
    }

    /// Fetches, validates and caches the tree block at `start`. If
    /// `expected_gen == 0`, the generation check is skipped (used by
    /// callers that only know the logical address, e.g. during chunk-tree
    /// bootstrap in the metadump restorer).
    pub fn read_tree_block(
        &self,
        io: &dyn BlockIo,
        chunk_map: &ChunkMap,
        fsid: uuid::Uuid,
        start: Logical,
        expected_gen: Generation,
    ) -> Result<ExtentBufferHandle> {
        let node_size = self.geometry.node_size;
        let handle = self.find_create(start, node_size);
        {
            let eb = handle.read().unwrap();
            if eb.up_to_date {
                return Ok(handle.clone());
            }
        }

        let mapping = chunk_map.map_block(start, node_size as u64)?;
        let buf = io.read(mapping.dev, mapping.physical, mapping.capped_len as usize)?;

        let header = TreeBlockHeader::decode(&buf)?;
        if header.bytenr != start {
            self.mark_invalid(&handle);
            return Err(Error::invalid(
                "tree block",
                start,
                format!("header bytenr {} != requested {}", header.bytenr, start),
            ));
        }
        if header.fsid != fsid {
            self.mark_invalid(&handle);
            return Err(Error::invalid("tree block", start, "fsid mismatch"));
        }
        fsforge_core::verify_csum(&buf, self.geometry.csum_size as usize, start)?;
        if expected_gen != 0 && header.generation != expected_gen {
            self.mark_invalid(&handle);
            return Err(Error::invalid(
                "tree block",
                start,
                format!(
                    "generation {} != expected {}",
                    header.generation, expected_gen
                ),
            ));
        }

        let mut eb = handle.write().unwrap();
        eb.content = buf;
        eb.up_to_date = true;
        drop(eb);
        Ok(handle)
    }

    fn mark_invalid(&self, handle: &ExtentBufferHandle) {
        let mut eb = handle.write().unwrap();
        eb.up_to_date = false;
        warn!(bytenr = eb.start, "tree block failed validation");
    }

    pub fn cached_count(&self) -> usize {
        self.cache.lock().unwrap().len()
    }
}

pub fn bump_refcount(handle: &ExtentBufferHandle) {
    handle.write().unwrap().refcount += 1;
}

pub fn drop_refcount(handle: &ExtentBufferHandle) {
    let mut eb = handle.write().unwrap();
    eb.refcount = eb.refcount.saturating_sub(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_create_shares_storage() {
        let arena = ExtentBufferArena::new(FsGeometry::default());
        let a = arena.find_create(4096, 16384);
        let b = arena.find_create(4096, 16384);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(arena.cached_count(), 1);
    }

    #[test]
    fn evict_drops_arena_entry_but_not_outstanding_handles() {
        let arena = ExtentBufferArena::new(FsGeometry::default());
        let handle = arena.find_create(4096, 16384);
        arena.evict(4096);
        assert_eq!(arena.cached_count(), 0);
        // Still readable through the handle already taken.
        assert_eq!(handle.read().unwrap().start, 4096);
    }
}
