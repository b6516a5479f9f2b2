//! Keyed identifiers shared across the forest of B-trees.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// 64-bit byte offset in the filesystem's virtual address space.
pub type Logical = u64;
/// 64-bit byte offset on a specific device.
pub type Physical = u64;
/// Item object id.
pub type ObjectId = u64;
/// Item key type (8-bit discriminator).
pub type KeyType = u8;
/// Monotonic transaction generation number.
pub type Generation = u64;
/// Device identifier.
pub type DevId = u64;

/// `(objectid, type, offset)` triple with lexicographic order.
///
/// Field declaration order matches comparison order so `#[derive(Ord)]`
/// gives the correct lexicographic key order without a manual impl.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    pub objectid: ObjectId,
    pub ty: KeyType,
    pub offset: u64,
}

impl Key {
    pub const fn new(objectid: ObjectId, ty: KeyType, offset: u64) -> Self {
        Key { objectid, ty, offset }
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.objectid, self.ty, self.offset).cmp(&(other.objectid, other.ty, other.offset))
    }
}

/// Well-known key types used by the on-disk format this core does not
/// redesign. Only the subset the core reasons about directly.
#[allow(non_upper_case_globals)]
pub mod key_type {
    use super::KeyType;

    pub const InodeItem: KeyType = 1;
    pub const InodeRef: KeyType = 12;
    pub const InodeExtref: KeyType = 13;
    pub const XattrItem: KeyType = 24;
    pub const OrphanItem: KeyType = 48;
    pub const DirItem: KeyType = 84;
    pub const DirIndex: KeyType = 96;
    pub const ExtentData: KeyType = 108;
    pub const ExtentCsum: KeyType = 128;
    pub const RootItem: KeyType = 132;
    pub const RootBackref: KeyType = 144;
    pub const RootRef: KeyType = 156;
    pub const ExtentItem: KeyType = 168;
    pub const MetadataItem: KeyType = 169;
    pub const TreeBlockRef: KeyType = 176;
    pub const ExtentDataRef: KeyType = 178;
    pub const ExtentRefV0: KeyType = 180;
    pub const SharedBlockRef: KeyType = 182;
    pub const SharedDataRef: KeyType = 184;
    pub const BlockGroupItem: KeyType = 192;
    pub const FreeSpaceInfo: KeyType = 198;
    pub const FreeSpaceExtent: KeyType = 199;
    pub const FreeSpaceBitmap: KeyType = 200;
    pub const DevExtent: KeyType = 204;
    pub const DevItem: KeyType = 216;
    pub const ChunkItem: KeyType = 228;
    pub const QgroupStatus: KeyType = 240;
    pub const QgroupInfo: KeyType = 242;
    pub const QgroupLimit: KeyType = 244;
    pub const QgroupRelation: KeyType = 246;
    pub const PersistentItem: KeyType = 249;
}

/// Well-known object ids reserved for specific trees/items, reasoned about
/// directly by the walker, allocator and quota verifier.
#[allow(non_upper_case_globals)]
pub mod objectid {
    use super::ObjectId;

    pub const RootTree: ObjectId = 1;
    pub const ExtentTree: ObjectId = 2;
    pub const ChunkTree: ObjectId = 3;
    pub const DevTree: ObjectId = 4;
    pub const FsTree: ObjectId = 5;
    pub const RootTreeDir: ObjectId = 6;
    pub const CsumTree: ObjectId = 7;
    pub const QuotaTree: ObjectId = 8;
    pub const FreeSpaceTree: ObjectId = 10;
    /// Negative-indexed special objectids are stored as their two's
    /// complement `u64` representation, matching the on-disk encoding.
    pub const ExtentCsum: ObjectId = (-10i64) as u64;
    pub const FreeSpace: ObjectId = (-11i64) as u64;
    pub const FirstFree: ObjectId = 256;
}

/// Bits of an extent item's `flags` field.
#[allow(non_upper_case_globals)]
pub mod extent_flags {
    pub const DATA: u64 = 1;
    pub const TREE_BLOCK: u64 = 1 << 1;
    /// Set when the tree block's backrefs are full (keyed by parent block
    /// bytenr) rather than rooted (keyed by owning root id).
    pub const FULL_BACKREF: u64 = 1 << 8;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_orders_lexicographically() {
        let a = Key::new(5, 1, 0);
        let b = Key::new(5, 2, 0);
        let c = Key::new(6, 0, 0);
        assert!(a < b);
        assert!(b < c);
        assert!(a < c);
    }
}
