// Pipeline error taxonomy and user-facing diagnostics
//
// Recoverable conditions (malformed datagram lines) never appear here: they are
// dropped where they are detected and only show up in the ingest counters.
// Everything in `PipelineError` is fatal for the run.

use std::fmt;
use std::io;

use thiserror::Error;

/// Result alias for the ingestion and windowing layers.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Fatal pipeline failures.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// End of input reached while a frame (or its length prefix) was only partly buffered.
    #[error("stream truncated: input ended with {buffered} byte(s) of an incomplete frame buffered")]
    TruncatedStream { buffered: usize },

    /// A length prefix declared a frame larger than the decoder is allowed to buffer.
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    OversizedFrame { len: u64, max: usize },

    /// A length prefix ran past 10 bytes or overflowed 64 bits.
    #[error("malformed length prefix at stream offset {offset}")]
    MalformedLength { offset: u64 },

    /// The external model oracle raised during `op`.
    #[error("oracle {op} failed: {message}")]
    OracleFailure { op: &'static str, message: String },

    /// Rejected before any I/O was attempted.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl PipelineError {
    pub fn oracle(op: &'static str, message: impl fmt::Display) -> Self {
        Self::OracleFailure {
            op,
            message: message.to_string(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration(message.into())
    }

    fn suggestion(&self) -> &'static str {
        match self {
            Self::TruncatedStream { .. } => {
                "The capture container ends in the middle of a record. Re-export the file \
                 or remove it from the input pattern."
            }
            Self::OversizedFrame { .. } => {
                "Make sure the input is a capture container, or raise `max_frame_len` in the config."
            }
            Self::MalformedLength { .. } => {
                "The input is corrupt or not a capture container (gzip files must end in .gz)."
            }
            Self::OracleFailure { .. } => {
                "Check the model service output. Weights may be inconsistent; restart from the \
                 latest checkpoint with --resume."
            }
            Self::InvalidConfiguration(_) => {
                "Check ~/.nettrain/config.toml and the command-line flags."
            }
            Self::Io(_) => "Check that the input paths exist and are readable.",
        }
    }
}

/// Render a fatal error for the terminal, with a suggestion when the root cause is known.
pub fn diagnostic(error: &anyhow::Error) -> String {
    let chain = format!("{:#}", error);
    match error.chain().find_map(|e| e.downcast_ref::<PipelineError>()) {
        Some(pipeline) => wrap_error_with_suggestion(chain, pipeline.suggestion()),
        None => chain,
    }
}

/// Wrap a generic error with suggestions
pub fn wrap_error_with_suggestion(error: impl fmt::Display, suggestion: &str) -> String {
    format!(
        "{}\n\n\
        \x1b[1;33mSuggestion:\x1b[0m {}",
        error, suggestion
    )
}
