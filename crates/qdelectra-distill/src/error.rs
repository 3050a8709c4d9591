use std::path::PathBuf;

use thiserror::Error;

use qdelectra_core::CoreError;

#[derive(Debug, Error)]
pub enum DistillError {
    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Unknown output mode: {0}")]
    UnknownOutputMode(String),

    #[error("Invalid label '{label}': {reason}")]
    InvalidLabel { label: String, reason: String },

    #[error("Teacher has {t_heads} attention heads, not a multiple of the student's {s_heads}")]
    HeadMismatch { t_heads: usize, s_heads: usize },

    #[error("Configuration error: {field}: {reason}")]
    Config { field: String, reason: String },

    #[error("{}:{line}: expected at least {expected} columns, found {found}", .path.display())]
    MalformedRow {
        path: PathBuf,
        line: usize,
        expected: usize,
        found: usize,
    },

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config layering error: {0}")]
    Layering(#[from] config::ConfigError),
}

impl DistillError {
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config { field: field.into(), reason: reason.into() }
    }
}

pub type DistillResult<T> = Result<T, DistillError>;
