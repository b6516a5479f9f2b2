//! Per-phase and whole-run reporting: progress counters, exit status, and
//! a single-line diagnostic whose final line summarises totals. Follows
//! the same dry-run result/report accumulation shape used by a
//! formatter's own simulation report, generalised to a 7-phase run
//! instead of a single format call.

use serde::{Deserialize, Serialize};

/// One of the seven ordered phases names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    RootItems,
    Extents,
    FreeSpace,
    FsRoots,
    Csums,
    RootRefs,
    Quota,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Phase::RootItems => "root-items",
            Phase::Extents => "extents",
            Phase::FreeSpace => "free-space",
            Phase::FsRoots => "fs-roots",
            Phase::Csums => "csums",
            Phase::RootRefs => "root-refs",
            Phase::Quota => "quota",
        }
    }
}

/// The per-run statistics block recovered from `check/main.c` (/// of SPEC_FULL.md's features-recovered section).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RunStats {
    pub bytes_used: u64,
    pub total_csum_bytes: u64,
    pub total_btree_bytes: u64,
    pub total_fs_tree_bytes: u64,
    pub total_extent_tree_bytes: u64,
    pub btree_space_waste: u64,
    pub data_bytes_allocated: u64,
    pub data_bytes_referenced: u64,
}

/// Findings and counters for one completed phase. `item_count` is the
/// single progress counter says each phase updates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseReport {
    pub phase: Option<Phase>,
    pub item_count: u64,
    pub errors: u64,
    pub repaired: u64,
    pub restarted: bool,
}

impl PhaseReport {
    pub fn new(phase: Phase) -> Self {
        PhaseReport {
            phase: Some(phase),
            ..Default::default()
        }
    }
}

/// One subsystem-prefixed, single-line diagnostic ("each error
/// prints a single-line diagnostic prefixed by subsystem and, when
/// applicable, the offending extent's bytenr").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub subsystem: &'static str,
    pub bytenr: Option<u64>,
    pub message: String,
}

impl std::fmt::Display for Finding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.bytenr {
            Some(b) => write!(f, "{}: bytenr {}: {}", self.subsystem, b, self.message),
            None => write!(f, "{}: {}", self.subsystem, self.message),
        }
    }
}

/// The full result of one `fsforge-check` run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunReport {
    pub phases: Vec<PhaseReport>,
    pub stats: RunStats,
    pub findings: Vec<Finding>,
    pub bad_qgroups: Vec<u64>,
}

impl RunReport {
    pub fn push_finding(&mut self, subsystem: &'static str, bytenr: Option<u64>, message: impl Into<String>) {
        self.findings.push(Finding {
            subsystem,
            bytenr,
            message: message.into(),
        });
    }

    pub fn total_errors(&self) -> u64 {
        self.phases.iter().map(|p| p.errors).sum::<u64>() + self.bad_qgroups.len() as u64
    }

    pub fn total_repaired(&self) -> u64 {
        self.phases.iter().map(|p| p.repaired).sum()
    }

    /// Exit status is zero only when every phase returned zero.
    pub fn exit_code(&self) -> i32 {
        if self.total_errors() == 0 {
            0
        } else {
            1
        }
    }

    pub fn summary_line(&self) -> String {
        if self.total_errors() == 0 {
            "no error found".to_string()
        } else {
            format!(
                "found {} errors, repaired {}, total csum bytes {}",
                self.total_errors(),
                self.total_repaired(),
                self.stats.total_csum_bytes
            )
        }
    }
}
