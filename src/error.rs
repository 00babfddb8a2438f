use std::path::PathBuf;

use thiserror::Error;

/// A malformed image reference. Fatal to the job it belongs to, never to the
/// scan.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid image reference {name:?}: {reason}")]
    Invalid { name: String, reason: &'static str },

    #[error("invalid link template {template:?}: {reason}")]
    Template {
        template: String,
        reason: &'static str,
    },
}

/// Registry fetch failures. The job is marked `Error` and the scan continues;
/// the next scheduled scan is the retry mechanism.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("registry denied access to {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("timed out fetching {0}")]
    Timeout(String),

    #[error("network failure fetching {0}: {1}")]
    Network(String, String),

    #[error("malformed registry response from {0}: {1}")]
    Malformed(String, String),
}

impl FetchError {
    pub(crate) fn from_reqwest(url: &str, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout(url.to_string())
        } else if err.is_decode() {
            FetchError::Malformed(url.to_string(), err.to_string())
        } else {
            FetchError::Network(url.to_string(), err.to_string())
        }
    }
}

/// Manifest store failures. `Open`, `OpenTimeout`, `Migration` and
/// `MissingMigration` abort process startup; `Read`/`Write`/`Corrupt` during a
/// scan mark the affected job `Error` and forfeit its notification.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unable to open store at {path:?}")]
    Open {
        path: PathBuf,
        #[source]
        source: sled::Error,
    },

    #[error("timed out acquiring store lock at {path:?}")]
    OpenTimeout {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store read failed for {key:?}")]
    Read {
        key: String,
        #[source]
        source: sled::Error,
    },

    #[error("store write failed for {key:?}")]
    Write {
        key: String,
        #[source]
        source: sled::Error,
    },

    #[error("corrupt store record for {key:?}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("store migration to schema version {version} failed: {reason}")]
    Migration { version: u32, reason: String },

    #[error("no migration registered for schema version {version}")]
    MissingMigration { version: u32 },
}
