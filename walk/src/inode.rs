//! Per-inode findings accumulated during a walk. Follows
//! the same per-file attribute-accumulation pattern a filesystem reader
//! uses to build up a validation record while it walks, generalised to
//! a dedicated error-bitfield shape.

use fsforge_core::Logical;

/// One bit per named checker finding. Kept as plain `u32`
/// constants rather than a bitflags type, matching the rest of this
/// workspace's preference for explicit integer flag fields over an extra
/// dependency for a handful of bits.
pub mod error_bits {
    pub const DUP_INODE_ITEM: u32 = 1 << 0;
    pub const ORPHAN_NO_ITEM: u32 = 1 << 1;
    pub const ODD_FLAGS: u32 = 1 << 2;
    pub const INVALID_NLINK: u32 = 1 << 3;
    pub const INVALID_GEN: u32 = 1 << 4;
    pub const MISMATCH_DIR_HASH: u32 = 1 << 5;
    pub const DUP_DIR_INDEX: u32 = 1 << 6;
    pub const NAME_TOO_LONG: u32 = 1 << 7;
    pub const INLINE_RAM_BYTES_WRONG: u32 = 1 << 8;
    pub const FILE_EXTENT_TOO_LARGE: u32 = 1 << 9;
    pub const FILE_EXTENT_OVERLAP: u32 = 1 << 10;
    pub const SOME_CSUM_MISSING: u32 = 1 << 11;
    pub const ODD_CSUM_ITEM: u32 = 1 << 12;
    pub const ISIZE_WRONG: u32 = 1 << 13;
    pub const NBYTES_WRONG: u32 = 1 << 14;
    pub const FILE_EXTENT_MISALIGNED: u32 = 1 << 15;
}

/// A hole in an inode's extent coverage, recorded while scanning
/// `ExtentData` items in offset order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HoleRecord {
    pub start: u64,
    pub len: u64,
}

/// Accumulated state for one inode across the walk of a leaf range that
/// touches it. Released by `maybe_free_inode_rec` once its owning leaf
/// range is fully processed and it carries no open errors.
#[derive(Debug, Clone)]
pub struct InodeRecord {
    pub ino: u64,
    pub nlink: u64,
    pub isize: u64,
    pub nbytes: u64,
    pub imode: u32,
    pub flags: u64,
    pub generation: u64,

    pub found_size: u64,
    pub found_link: u64,
    pub extent_end: u64,
    pub holes: Vec<HoleRecord>,

    pub errors: u32,
    pub seen_inode_item: bool,
    pub seen_inode_ref: bool,
    pub seen_dir_item: bool,
    pub seen_dir_index: bool,
}

impl InodeRecord {
    pub fn new(ino: u64) -> Self {
        InodeRecord {
            ino,
            nlink: 0,
            isize: 0,
            nbytes: 0,
            imode: 0,
            flags: 0,
            generation: 0,
            found_size: 0,
            found_link: 0,
            extent_end: 0,
            holes: Vec::new(),
            errors: 0,
            seen_inode_item: false,
            seen_inode_ref: false,
            seen_dir_item: false,
            seen_dir_index: false,
        }
    }

    pub fn set_error(&mut self, bit: u32) {
        self.errors |= bit;
    }

    pub fn has_error(&self, bit: u32) -> bool {
        self.errors & bit != 0
    }

    /// `inode_ref ∧ dir_item ∧ dir_index`.
    pub fn three_of_three(&self) -> bool {
        self.seen_inode_ref && self.seen_dir_item && self.seen_dir_index
    }

    pub fn record_hole(&mut self, start: u64, len: u64) {
        if len > 0 {
            self.holes.push(HoleRecord { start, len });
        }
    }
}

/// A logical-address-scoped cache used while descending a shared subtree,
/// so repeated visits from multiple subvolumes do not re-walk it.
#[derive(Default)]
pub struct SharedNodeCache {
    visited: std::collections::HashMap<Logical, u32>,
}

impl SharedNodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` the first time `bytenr` is seen at this level,
    /// incrementing its refcount on every call.
    pub fn enter(&mut self, bytenr: Logical) -> bool {
        let count = self.visited.entry(bytenr).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Decrements the refcount; splices (drops) the entry once it reaches
    /// zero, mirroring "leaving a level... decrements".
    pub fn leave(&mut self, bytenr: Logical) {
        if let Some(count) = self.visited.get_mut(&bytenr) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.visited.remove(&bytenr);
            }
        }
    }
}
