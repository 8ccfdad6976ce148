//! Error taxonomy shared by every training component.
//!
//! Recoverable conditions (a corrupt checkpoint candidate) and fatal ones
//! (bad configuration, mismatched optimizer state) are distinct variants so
//! callers can decide per variant instead of string-matching.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainError {
    /// Invalid configuration. Fatal at startup.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Saved optimizer/model state does not fit the live parameters.
    #[error("state shape mismatch: {0}")]
    StateShapeMismatch(String),

    /// A checkpoint file could not be parsed.
    #[error("checkpoint {path} is corrupt: {reason}")]
    CheckpointCorrupt { path: PathBuf, reason: String },

    /// Ranks would resume from different positions.
    #[error("ranks disagree on resume position: {0}")]
    ResumeMismatch(String),

    /// A collective operation failed (peer closed, protocol violation).
    #[error("collective operation failed: {0}")]
    Collective(String),

    #[error("dataset error: {0}")]
    Data(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    SafeTensors(#[from] safetensors::SafeTensorError),
}

pub type Result<T> = std::result::Result<T, TrainError>;

impl TrainError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::CheckpointCorrupt {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the error is a fatal configuration or state problem, as
    /// opposed to an environmental one.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::StateShapeMismatch(_) | Self::ResumeMismatch(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = TrainError::corrupt("/tmp/ar-ckpt-last.safetensors", "bad header");
        let msg = err.to_string();
        assert!(msg.contains("ar-ckpt-last"));
        assert!(msg.contains("bad header"));
    }

    #[test]
    fn structural_classification() {
        assert!(TrainError::config("x").is_structural());
        assert!(TrainError::StateShapeMismatch("y".into()).is_structural());
        assert!(!TrainError::Collective("z".into()).is_structural());
    }
}
