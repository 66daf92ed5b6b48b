use thiserror::Error;

use crate::types::EngineKind;

#[derive(Error, Debug)]
pub enum ScanError {
    /// Target outside the allowed scope, malformed target or port spec.
    #[error("{0}")]
    Validation(String),

    #[error("{engine} engine unavailable: {reason}")]
    EngineUnavailable { engine: EngineKind, reason: String },

    #[error("{engine} engine failed: {message}")]
    EngineExecution { engine: EngineKind, message: String },

    #[error("unparseable engine output: {0}")]
    Parse(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("scan cancelled")]
    Cancelled,

    #[error("no scan targets specified")]
    NoTargets,

    #[error("auto target detection failed")]
    AutoTargets,

    #[error("a scan is already running")]
    Busy,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ScanError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ScanError::Cancelled)
    }

    pub(crate) fn execution(engine: EngineKind, message: impl Into<String>) -> Self {
        ScanError::EngineExecution {
            engine,
            message: message.into(),
        }
    }
}

impl From<rusqlite::Error> for ScanError {
    fn from(e: rusqlite::Error) -> Self {
        ScanError::Storage(e.to_string())
    }
}

impl From<sqlx::Error> for ScanError {
    fn from(e: sqlx::Error) -> Self {
        ScanError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for ScanError {
    fn from(e: serde_json::Error) -> Self {
        ScanError::Storage(format!("record encoding: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;
