// src/errors.rs

//! Crate-wide error aliases and helpers.
//!
//! Component-level failures have their own enums ([`crate::watch::WatchError`],
//! [`crate::exec::TaskError`]); this type covers setup and configuration.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WatchrunError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("File watch setup error: {0}")]
    NotifyError(#[from] notify::Error),

    #[error("Invalid exclude pattern '{pattern}': {source}")]
    PatternError {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, WatchrunError>;
