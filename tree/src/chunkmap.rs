//! ChunkMap: logical ↔ physical translation, stripes,
//! profile flags. Follows the same offset-translation arithmetic an
//! ext4-style disk I/O layer uses to turn an inode-relative block number
//! into a device offset, generalised from a single fixed-size-block device
//! to an ordered interval map over striped chunks.

use fsforge_core::{Chunk, ChunkStripe, DevId, Error, Logical, Physical, Result};
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Resolved mapping for one read or write of `len` bytes starting at `L`.
#[derive(Debug, Clone)]
pub struct BlockMapping {
    pub dev: DevId,
    pub physical: Physical,
    /// Clamped to the end of the stripe the read/write started in.
    pub capped_len: u64,
    /// All mirrors, for redundant profiles (used by writers wanting to
    /// keep every copy consistent).
    pub stripes: Vec<ChunkStripe>,
}

/// Ordered map `L -> Chunk`, keyed by each chunk's start so lookups are a
/// single `range` query away from the covering entry.
pub struct ChunkMap {
    chunks: RwLock<BTreeMap<Logical, Chunk>>,
}

impl ChunkMap {
    pub fn new() -> Self {
        ChunkMap {
            chunks: RwLock::new(BTreeMap::new()),
        }
    }

    /// Inserts or replaces the chunk covering `chunk.logical`.
    pub fn insert(&self, chunk: Chunk) {
        self.chunks.write().unwrap().insert(chunk.logical, chunk);
    }

    pub fn len(&self) -> usize {
        self.chunks.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn find_covering(&self, bytenr: Logical) -> Option<Chunk> {
        let chunks = self.chunks.read().unwrap();
        chunks
            .range(..=bytenr)
            .next_back()
            .map(|(_, c)| c.clone())
            .filter(|c| bytenr < c.end())
    }

    /// For a read of `len` bytes starting at `L`, returns the first
    /// stripe's device and physical offset, clamping `capped_len` to the
    /// end of the stripe. For writes of redundant profiles,
    /// `stripes` carries every mirror.
    pub fn map_block(&self, logical: Logical, len: u64) -> Result<BlockMapping> {
        let chunk = self
            .find_covering(logical)
            .ok_or_else(|| Error::NotFound(format!("no chunk covers logical {logical}")))?;

        let offset_in_chunk = logical - chunk.logical;
        let stripe_len = chunk.stripe_len.max(1);
        let offset_in_stripe = offset_in_chunk % stripe_len;
        let stripe_index = ((offset_in_chunk / stripe_len) as u32) % chunk.num_stripes.max(1);

        let stripe = chunk
            .stripes
            .get(stripe_index as usize)
            .ok_or_else(|| Error::Invalid {
                what: "chunk stripe",
                bytenr: logical,
                reason: format!("stripe index {stripe_index} out of range"),
            })?;

        let remaining_in_stripe = stripe_len - offset_in_stripe;
        let capped_len = len.min(remaining_in_stripe);

        Ok(BlockMapping {
            dev: stripe.devid,
            physical: stripe.physical + offset_in_stripe,
            capped_len,
            stripes: chunk.stripes.clone(),
        })
    }

    /// True if `[bytenr, bytenr+len)` does not cross a chunk/stripe
    /// boundary — used by the allocator to enforce the "metadata extents
    /// do not cross a 64 KiB stripe boundary" invariant.
    pub fn crosses_stripe_boundary(&self, bytenr: Logical, len: u64, stripe_len: u64) -> bool {
        if stripe_len == 0 {
            return false;
        }
        let start_stripe = bytenr / stripe_len;
        let end_stripe = (bytenr + len - 1) / stripe_len;
        start_stripe != end_stripe
    }

    pub fn all_chunks(&self) -> Vec<Chunk> {
        self.chunks.read().unwrap().values().cloned().collect()
    }
}

impl Default for ChunkMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsforge_core::{Profile, UsageClass};

    fn single_stripe_chunk(logical: Logical, length: u64, devid: DevId, physical: Physical) -> Chunk {
        Chunk {
            logical,
            length,
            stripe_len: length,
            num_stripes: 1,
            sub_stripes: 1,
            profile: Profile::Single,
            usage: UsageClass::Data,
            stripes: vec![ChunkStripe { devid, physical }],
        }
    }

    #[test]
    fn maps_logical_to_physical_with_clamp() {
        let map = ChunkMap::new();
        map.insert(single_stripe_chunk(0, 1 << 20, 1, 1 << 30));
        let mapping = map.map_block(100, 5000).unwrap();
        assert_eq!(mapping.dev, 1);
        assert_eq!(mapping.physical, (1 << 30) + 100);
        assert_eq!(mapping.capped_len, 5000);
    }

    #[test]
    fn missing_chunk_errors() {
        let map = ChunkMap::new();
        assert!(map.map_block(0, 100).is_err());
    }

    #[test]
    fn detects_stripe_boundary_crossing() {
        let map = ChunkMap::new();
        assert!(map.crosses_stripe_boundary(65530, 16384, 65536));
        assert!(!map.crosses_stripe_boundary(65536, 16384, 65536));
    }

    #[test]
    fn multi_stripe_round_robins_by_offset() {
        let map = ChunkMap::new();
        let chunk = Chunk {
            logical: 0,
            length: 2 * 65536,
            stripe_len: 65536,
            num_stripes: 2,
            sub_stripes: 1,
            profile: Profile::Raid0,
            usage: UsageClass::Data,
            stripes: vec![
                ChunkStripe { devid: 1, physical: 0 },
                ChunkStripe { devid: 2, physical: 0 },
            ],
        };
        map.insert(chunk);
        let first = map.map_block(0, 100).unwrap();
        assert_eq!(first.dev, 1);
        let second = map.map_block(65536, 100).unwrap();
        assert_eq!(second.dev, 2);
    }
}
