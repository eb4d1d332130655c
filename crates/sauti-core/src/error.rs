//! Error types for the sauti inference control plane.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Core error type. Each variant maps onto one surfaced error kind in the
/// job response; [`Error::kind`] yields the wire string.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unknown voice '{requested}'")]
    UnknownVoice {
        requested: String,
        suggestions: Vec<String>,
    },

    #[error("missing configuration: {0}")]
    ConfigMissing(String),

    #[error("worker is shutting down")]
    ShuttingDown,

    #[error("job exceeded the {limit_secs}s ceiling")]
    Timeout { limit_secs: u64 },

    #[error("chunk {chunk} produced no audio after retry")]
    GenerationEmpty { chunk: usize },

    #[error("model error: {0}")]
    ModelError(String),

    #[error("inline audio is {size} bytes, over the {limit} byte cap; deliver via an external sink instead")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("upload failed after {attempts} attempts: {message}")]
    SinkUnavailable { attempts: usize, message: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The `error.kind` string surfaced in job responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidInput(_) => "InvalidInput",
            Error::UnknownVoice { .. } => "UnknownVoice",
            Error::ConfigMissing(_) => "ConfigMissing",
            Error::ShuttingDown => "ShuttingDown",
            Error::Timeout { .. } => "Timeout",
            Error::GenerationEmpty { .. } => "GenerationEmpty",
            Error::ModelError(_) => "ModelError",
            Error::PayloadTooLarge { .. } => "PayloadTooLarge",
            Error::SinkUnavailable { .. } => "SinkUnavailable",
            Error::Internal(_) => "Internal",
        }
    }

    /// Whether a caller may plausibly succeed by retrying elsewhere or later.
    pub fn retriable(&self) -> bool {
        matches!(
            self,
            Error::ShuttingDown
                | Error::Timeout { .. }
                | Error::SinkUnavailable { .. }
                | Error::ModelError(_)
        )
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(format!("io error: {err}"))
    }
}

impl From<candle_core::Error> for Error {
    fn from(err: candle_core::Error) -> Self {
        Error::ModelError(err.to_string())
    }
}

impl From<hound::Error> for Error {
    fn from(err: hound::Error) -> Self {
        Error::Internal(format!("wav error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_match_wire_contract() {
        assert_eq!(Error::InvalidInput("x".into()).kind(), "InvalidInput");
        assert_eq!(
            Error::UnknownVoice {
                requested: "v".into(),
                suggestions: vec![],
            }
            .kind(),
            "UnknownVoice"
        );
        assert_eq!(Error::ShuttingDown.kind(), "ShuttingDown");
        assert_eq!(Error::Timeout { limit_secs: 1 }.kind(), "Timeout");
        assert_eq!(
            Error::PayloadTooLarge { size: 2, limit: 1 }.kind(),
            "PayloadTooLarge"
        );
    }

    #[test]
    fn shutting_down_is_retriable_but_bad_input_is_not() {
        assert!(Error::ShuttingDown.retriable());
        assert!(!Error::InvalidInput("no".into()).retriable());
        assert!(!Error::ConfigMissing("SAUTI_STORE_ENDPOINT".into()).retriable());
    }
}
