//! Error handling utilities for the Viper optimizer core

use thiserror::Error;

/// The main error type shared across the optimizer crates
#[derive(Error, Debug, Clone)]
pub enum ViperError {
    #[error("Verifier error: {message}")]
    VerifyError { message: String },

    #[error("Pipeline error: {message}")]
    PipelineError { message: String },

    #[error("Execution error: {message}")]
    VmError { message: String },

    #[error("Malformed IL: {message}")]
    IlError { message: String },
}

/// Result type alias for optimizer operations
pub type ViperResult<T> = Result<T, ViperError>;

impl ViperError {
    pub fn verify_error(message: impl Into<String>) -> Self {
        Self::VerifyError { message: message.into() }
    }

    pub fn pipeline_error(message: impl Into<String>) -> Self {
        Self::PipelineError { message: message.into() }
    }

    pub fn vm_error(message: impl Into<String>) -> Self {
        Self::VmError { message: message.into() }
    }

    pub fn il_error(message: impl Into<String>) -> Self {
        Self::IlError { message: message.into() }
    }
}
