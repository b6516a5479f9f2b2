use thiserror::Error;

/// The discriminated error union shared by every fsforge crate.
///
/// `Conflict` is the `-EAGAIN`-like "restart the walk" signal: it is never
/// meant to reach a user. Callers that can retry (the walker, the
/// orchestrator) match on it explicitly via [`Error::is_conflict`]; a second
/// occurrence for the same root is demoted to `Corrupt` by the caller.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error on device {device}: {source}")]
    Io {
        device: String,
        #[source]
        source: std::io::Error,
    },

    #[error("checksum mismatch at bytenr {bytenr}: expected {expected:#010x}, found {found:#010x}")]
    ChecksumMismatch {
        bytenr: u64,
        expected: u32,
        found: u32,
    },

    #[error("invalid {what} at bytenr {bytenr}: {reason}")]
    Invalid {
        what: &'static str,
        bytenr: u64,
        reason: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("reference mismatch for extent {bytenr}: {reason}")]
    ReferenceMismatch { bytenr: u64, reason: String },

    #[error("structural discount for {what}: {reason}")]
    StructuralDiscount { what: String, reason: String },

    #[error("corrupt {what} at bytenr {bytenr}: {reason}")]
    Corrupt {
        what: &'static str,
        bytenr: u64,
        reason: String,
    },

    #[error("compression error: {0}")]
    Compress(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("conflict (restart required): {0}")]
    Conflict(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl Error {
    pub fn io(device: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            device: device.into(),
            source,
        }
    }

    pub fn invalid(what: &'static str, bytenr: u64, reason: impl Into<String>) -> Self {
        Error::Invalid {
            what,
            bytenr,
            reason: reason.into(),
        }
    }

    pub fn corrupt(what: &'static str, bytenr: u64, reason: impl Into<String>) -> Self {
        Error::Corrupt {
            what,
            bytenr,
            reason: reason.into(),
        }
    }

    /// True for the subset of errors the orchestrator treats as
    /// phase-restart triggers rather than fatal aborts.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;