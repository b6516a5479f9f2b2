//! `CheckConfig`: a plain serde-serializable run
//! configuration assembled from parsed CLI flags, mirroring how a
//! formatter's own options struct is built from argv before it ever
//! touches a device. Not read from a config file — none is specified —
//! but documented as its own type so an embedding caller can construct a
//! run without going through `std::env::args`.

use serde::{Deserialize, Serialize};

/// `BTRFS_SUPER_MIRROR_MAX`.
pub const SUPER_MIRROR_MAX: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckMode {
    /// Full in-memory model of entity set.
    Original,
    /// Same algorithm, but per-root inode caches are evicted eagerly to
    /// trim memory use.
    Lowmem,
}

impl Default for CheckMode {
    fn default() -> Self {
        CheckMode::Original
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClearSpaceCache {
    V1,
    V2,
}

/// One error produced by [`CheckConfig::validate`] for a flag combination
/// the orchestrator refuses to run with.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("--readonly and --repair are mutually exclusive")]
    ReadonlyAndRepair,
    #[error("-s {0} is out of range (BTRFS_SUPER_MIRROR_MAX = {SUPER_MIRROR_MAX})")]
    SuperblockMirrorOutOfRange(u8),
}

/// Run configuration for `fsforge-check`, covering every flag its CLI
/// surface accepts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckConfig {
    pub superblock_mirror: Option<u8>,
    pub use_backup_root: bool,
    pub root_bytenr: Option<u64>,
    pub chunk_root_bytenr: Option<u64>,
    pub readonly: bool,
    pub repair: bool,
    pub force: bool,
    pub mode: CheckMode,
    pub init_csum_tree: bool,
    pub init_extent_tree: bool,
    pub check_data_csum: bool,
    pub clear_space_cache: Option<ClearSpaceCache>,
    pub clear_ino_cache: bool,
    pub qgroup_report: bool,
    pub subvolid: Option<u64>,
    pub progress: bool,
}

impl CheckConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.readonly && self.repair {
            return Err(ConfigError::ReadonlyAndRepair);
        }
        if let Some(n) = self.superblock_mirror {
            if n >= SUPER_MIRROR_MAX {
                return Err(ConfigError::SuperblockMirrorOutOfRange(n));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readonly_and_repair_reject() {
        let cfg = CheckConfig {
            readonly: true,
            repair: true,
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::ReadonlyAndRepair));
    }

    #[test]
    fn superblock_mirror_range_checked() {
        let cfg = CheckConfig {
            superblock_mirror: Some(3),
            ..Default::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::SuperblockMirrorOutOfRange(3))
        );
        let cfg2 = CheckConfig {
            superblock_mirror: Some(2),
            ..Default::default()
        };
        assert!(cfg2.validate().is_ok());
    }
}
