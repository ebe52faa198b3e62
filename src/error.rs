//! Error taxonomy for the capture/archival pipeline.
//!
//! Only `ConfigInvalid`, `IoOpen`, `IoWrite` and `RotationFailure` ever
//! cross a thread boundary as an `Err`. `FormatReject`, `Backpressure`
//! and `StreamRestart` are constructed to carry a reason string into a
//! log line; they are not propagated up the call stack on the hot path.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AudynError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("failed to open {what}: {source}")]
    IoOpen {
        what: String,
        #[source]
        source: std::io::Error,
    },

    #[error("write failed: {0}")]
    IoWrite(String),

    #[error("rotation failed: {0}")]
    RotationFailure(String),

    #[error("malformed packet: {0}")]
    FormatReject(String),

    #[error("backpressure: {0}")]
    Backpressure(String),

    #[error("stream restart: {0}")]
    StreamRestart(String),
}

pub type Result<T> = std::result::Result<T, AudynError>;
