//! Cross-crate data model entities that more than one component
//! (ChunkMap, FreeSpaceCore, ExtentRefModel, FsRootWalker) needs to name
//! without depending on each other.

use crate::key::{DevId, Generation, Logical, Physical};
use serde::{Deserialize, Serialize};

/// Default sector size `S`. Filesystems with a different sector size carry
/// it in [`FsGeometry`]; this constant is only a convenience default for
/// tests and for CLI defaults.
pub const DEFAULT_SECTOR_SIZE: u32 = 4096;
/// Default node (tree block) size `N`.
pub const DEFAULT_NODE_SIZE: u32 = 16384;
/// Stripe boundary that a metadata extent must not cross.
pub const STRIPE_LEN: u64 = 64 * 1024;

/// Sector size `S` and node size `N` for one filesystem instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsGeometry {
    pub sector_size: u32,
    pub node_size: u32,
    pub csum_size: u32,
}

impl FsGeometry {
    pub fn round_up_sector(&self, n: u64) -> u64 {
        let s = self.sector_size as u64;
        (n + s - 1) / s * s
    }
}

impl Default for FsGeometry {
    fn default() -> Self {
        FsGeometry {
            sector_size: DEFAULT_SECTOR_SIZE,
            node_size: DEFAULT_NODE_SIZE,
            csum_size: 4,
        }
    }
}

/// Usage class of a block group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UsageClass {
    Data,
    Metadata,
    System,
}

/// Redundancy profile of a block group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Profile {
    Single,
    Dup,
    Raid0,
    Raid1,
    Raid5,
    Raid6,
    Raid10,
}

impl Profile {
    pub fn num_copies(self) -> u32 {
        match self {
            Profile::Single | Profile::Raid0 | Profile::Raid5 | Profile::Raid6 => 1,
            Profile::Dup | Profile::Raid1 | Profile::Raid10 => 2,
        }
    }
}

/// `(devid, physical offset)` of one stripe of one block group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkStripe {
    pub devid: DevId,
    pub physical: Physical,
}

/// Contiguous logical range reserved for one usage class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockGroup {
    pub start: Logical,
    pub length: u64,
    pub usage: UsageClass,
    pub profile: Profile,
    pub used: u64,
    pub pinned: u64,
    pub reserved: u64,
    pub read_only: bool,
}

impl BlockGroup {
    pub fn end(&self) -> Logical {
        self.start + self.length
    }

    pub fn contains(&self, bytenr: Logical) -> bool {
        bytenr >= self.start && bytenr < self.end()
    }

    pub fn free(&self) -> u64 {
        self.length
            .saturating_sub(self.used)
            .saturating_sub(self.pinned)
            .saturating_sub(self.reserved)
    }

    /// Invariant from `used + free + pinned + reserved == length`.
    pub fn invariant_holds(&self) -> bool {
        self.used + self.free() + self.pinned + self.reserved == self.length
    }
}

/// A chunk maps a logical range to one or more physical stripes, carrying
/// the striping parameters needed by ChunkMap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub logical: Logical,
    pub length: u64,
    pub stripe_len: u64,
    pub num_stripes: u32,
    pub sub_stripes: u32,
    pub profile: Profile,
    pub usage: UsageClass,
    pub stripes: Vec<ChunkStripe>,
}

impl Chunk {
    pub fn end(&self) -> Logical {
        self.logical + self.length
    }
}

/// Generation-stamped reference to a tree root, used by FsContext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootPointer {
    pub bytenr: Logical,
    pub generation: Generation,
    pub level: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_group_invariant() {
        let bg = BlockGroup {
            start: 0,
            length: 1_000,
            usage: UsageClass::Data,
            profile: Profile::Single,
            used: 400,
            pinned: 100,
            reserved: 0,
            read_only: false,
        };
        assert_eq!(bg.free(), 500);
        assert!(bg.invariant_holds());
    }
}
