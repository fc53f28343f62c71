//! Error taxonomy: fatal invariant violations abort the process, recoverable
//! per-request errors become a status byte, and script exceptions are their
//! own variant so callers can decide whether they're fatal (startup attribute
//! resolution) or recoverable (a per-request callable), per SPEC_FULL.md §7.

use thiserror::Error;

/// Invariant violations that abort the whole backend. Returned up through
/// `main` and printed with `tracing::error!` before the process exits
/// non-zero (SPEC_FULL.md §6 exit codes).
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("missing required argument: --{0}")]
    MissingArg(&'static str),

    #[error("ROADTEST_WORK_DIR is not set")]
    MissingWorkDir,

    #[error("failed to load main script {path}: {source}")]
    ScriptLoad {
        path: String,
        #[source]
        source: ScriptError,
    },

    #[error("main script has no `backend.{0}` attribute")]
    MissingSurface(&'static str),

    #[error("main script's backend.{surface} has no `{method}` callable")]
    MissingCallable {
        surface: &'static str,
        method: &'static str,
    },

    #[error("malformed virtqueue: {0}")]
    MalformedVirtqueue(String),

    #[error("failed to bind vhost-user socket at {path}: {source}")]
    SocketBind {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn child process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to create control fifo at {path}: {source}")]
    ControlFifo {
        path: String,
        #[source]
        source: nix::Error,
    },
}

/// A single request failed, but the device and the backend as a whole keep
/// running (spec.md §7: "one misbehaving request never wedges the queue").
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("guest address unmapped or request spans a region boundary")]
    InvalidGpa,

    #[error("model reported failure")]
    ModelFailure,

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error(transparent)]
    Script(#[from] ScriptError),
}

impl RequestError {
    /// I2C and GPIO both answer with a single trailing status byte; `0`
    /// means success and any nonzero value means failure (spec.md §4.3/4.4).
    /// The exact nonzero value carries no meaning to the guest driver, so one
    /// constant covers every `RequestError` variant.
    pub const STATUS_ERR: u8 = 1;
    pub const STATUS_OK: u8 = 0;

    pub fn status_byte(&self) -> u8 {
        Self::STATUS_ERR
    }
}

/// An exception raised by the embedded interpreter, carrying its formatted
/// traceback for logging. Whether it's fatal or recoverable depends on where
/// it was raised, per SPEC_FULL.md §7's error type mapping table.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ScriptError(pub String);

impl ScriptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}
