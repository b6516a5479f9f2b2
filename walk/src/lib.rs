//! FsRootWalker, Repairer and QuotaVerifier.

pub mod inode;
pub mod quota;
pub mod repair;
pub mod walker;

pub use inode::{error_bits, HoleRecord, InodeRecord, SharedNodeCache};
pub use quota::{QgroupInfo, QgroupStatusFlags, QuotaVerifier};
pub use repair::{BtreeRepairReport, Repairer, MAX_TRANSACTION_LEAF_SLOTS};
pub use walker::{FsRootWalker, WalkReport};
