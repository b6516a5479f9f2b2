//! Orchestrator: ties `fsforge-core`, `fsforge-tree`,
//! `fsforge-alloc` and `fsforge-walk` into the seven-phase checker run,
//! plus the `ClearOnly`/`Quota-only`/`Repair-init`/`Walk`/`Close` state
//! machine.

pub mod config;
pub mod csums_phase;
pub mod extents_phase;
pub mod freespace_phase;
pub mod orchestrator;
pub mod quota_phase;
pub mod report;
pub mod roots;

pub use config::{CheckConfig, CheckMode, ClearSpaceCache, ConfigError, SUPER_MIRROR_MAX};
pub use orchestrator::{Orchestrator, RunOutcome};
pub use report::{Finding, Phase, PhaseReport, RunReport, RunStats};
pub use roots::RootRecord;
