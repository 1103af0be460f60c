//! Error types for transformation scripts.

use thiserror::Error;

/// Errors raised by a transformation script.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransformError {
    /// The script cannot be parsed or compiled. Fatal for the engine running it.
    #[error("Script compilation failed: {reason}")]
    Compile { reason: String },

    /// The script failed on one item.
    #[error("Transformation of '{id}' failed: {reason}")]
    Runtime { id: String, reason: String },
}

impl TransformError {
    pub fn compile(reason: impl Into<String>) -> Self {
        Self::Compile {
            reason: reason.into(),
        }
    }

    pub fn runtime(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Runtime {
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn is_compile(&self) -> bool {
        matches!(self, TransformError::Compile { .. })
    }
}
