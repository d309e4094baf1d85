use thiserror::Error;

use crate::cancel::CancelReason;

pub type Result<T> = std::result::Result<T, FerryError>;

#[derive(Debug, Error)]
pub enum FerryError {
    #[error("manifest '{key}' does not exist in the store")]
    MissingManifest { key: String },

    #[error("manifest '{key}' is malformed: {source}")]
    ManifestDecode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("manifest encoding failed: {0}")]
    ManifestEncode(#[source] serde_json::Error),

    #[error("'{id}' has no record in manifest '{key}'")]
    MissingRecord { id: String, key: String },

    #[error("pipeline command `{command}` failed with {}", describe_code(.code))]
    Pipeline { command: String, code: Option<i32> },

    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("store error: {0}")]
    Store(String),

    #[error("unsafe storage key: {0}")]
    InvalidKey(String),

    #[error("invalid file name filter '{pattern}': {source}")]
    Filter {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("stopped: {0}")]
    Cancelled(CancelReason),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FerryError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FerryError::Cancelled(_))
    }
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("exit code {c}"),
        None => "termination by signal".to_string(),
    }
}
