//! Crate-wide error type.
//!
//! Recoverable conditions (missing `.env`, malformed lines) never show up here;
//! they are logged and handled where they occur.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DevrackError {
    #[error("failed to read {}: {source}", path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    ConfigWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    #[error("failed to spawn {id}: {source}")]
    Spawn {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid command for {id}: {reason}")]
    Command { id: String, reason: String },

    #[error("failed to load {}: {reason}", path.display())]
    ToolConfig { path: PathBuf, reason: String },

    #[error("prompt failed: {0}")]
    Prompt(#[from] std::io::Error),

    #[error("no tasks to supervise")]
    NoTasks,
}

pub type Result<T> = std::result::Result<T, DevrackError>;
