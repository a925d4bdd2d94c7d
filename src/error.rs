// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for candle-msa.

/// Errors that can occur while applying attention control.
#[derive(Debug, thiserror::Error)]
pub enum MsaError {
    /// Tensor shape inconsistent with the attention layout contract.
    ///
    /// Fatal: indicates a caller/config mismatch (e.g. a batch axis not
    /// divisible by the head count). Aborts the current generation run.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Tensor operation error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// Schedule or configuration parsing error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for candle-msa operations.
pub type Result<T> = std::result::Result<T, MsaError>;
