#![forbid(unsafe_code)]

//! Failure taxonomy shared by the job builder, the engine and the batch
//! orchestrator. Every variant carries a stable kind tag so summaries can tell
//! a bad option apart from a site failure or an exhausted download.

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Maximum length of an error detail stored in a run summary.
pub const MAX_ERROR_DETAIL: usize = 300;

pub type Result<T> = std::result::Result<T, JobError>;

#[derive(Debug, Error)]
pub enum JobError {
    /// Bad configuration or input, detected before any network activity.
    #[error("invalid {field}: {message}")]
    Validation { field: &'static str, message: String },

    /// The engine could not resolve the URL (unsupported site, parse failure,
    /// unreachable host).
    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("{}", download_message(.message, .retries_exhausted))]
    Download {
        message: String,
        retries_exhausted: bool,
    },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("interrupted by user")]
    Cancelled,
}

fn download_message(message: &str, retries_exhausted: &bool) -> String {
    if *retries_exhausted {
        format!("download failed after retries were exhausted: {message}")
    } else {
        format!("download failed: {message}")
    }
}

/// Coarse classification used in summaries and log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Validation,
    Extraction,
    Download,
    Io,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Extraction => "extraction",
            Self::Download => "download",
            Self::Io => "io",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl JobError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Extraction(_) => ErrorKind::Extraction,
            Self::Download { .. } => ErrorKind::Download,
            Self::Io { .. } => ErrorKind::Io,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Rendered message clipped to [`MAX_ERROR_DETAIL`] characters.
    pub fn detail(&self) -> String {
        truncate_detail(&self.to_string(), MAX_ERROR_DETAIL)
    }
}

/// Clips `text` to at most `max` characters, marking the cut with an ellipsis.
pub fn truncate_detail(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max {
        return trimmed.to_string();
    }
    let mut clipped: String = trimmed.chars().take(max.saturating_sub(1)).collect();
    clipped.push('…');
    clipped
}
