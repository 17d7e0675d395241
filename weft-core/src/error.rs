//! Error taxonomy shared across the pipeline.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// All failure kinds surfaced by the core pipeline.
#[derive(Debug, Error)]
pub enum WeftError {
    #[error("path validation failed for {path:?}: {reason}")]
    PathValidation { path: String, reason: String },

    #[error("parse error in {} at {line}:{column}: {message}", .file.display())]
    Parse {
        file: PathBuf,
        line: u32,
        column: u32,
        message: String,
    },

    #[error("cache error: {0}")]
    Cache(String),

    #[error("compile failed for {component}: {diagnostics} diagnostic(s)")]
    BuildCompile {
        component: String,
        diagnostics: usize,
    },

    #[error("compiler transport error: {0}")]
    BuildTransport(String),

    #[error("queue refused work within {0:?}")]
    Backpressure(Duration),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("plugin {name} failed: {message}")]
    Plugin { name: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl WeftError {
    /// An invariant violation. Aborts in debug builds, fails the current
    /// operation in release builds.
    pub fn internal(message: impl Into<String>) -> Self {
        let message = message.into();
        debug_assert!(false, "internal invariant violated: {message}");
        Self::Internal(message)
    }

    /// Stable machine-readable kind, used by the HTTP layer and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PathValidation { .. } => "path_validation",
            Self::Parse { .. } => "parse_error",
            Self::Cache(_) => "cache_error",
            Self::BuildCompile { .. } => "build_compile_error",
            Self::BuildTransport(_) => "build_transport_error",
            Self::Backpressure(_) => "backpressure",
            Self::Cancelled(_) => "cancelled",
            Self::Plugin { .. } => "plugin_error",
            Self::Io(_) => "io_error",
            Self::Serialization(_) => "serialization_error",
            Self::Internal(_) => "internal",
        }
    }

    /// True for failures that are expected to clear on retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Cache(_) | Self::BuildTransport(_) | Self::Backpressure(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, WeftError>;
