use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;
use crate::image::Image;
use crate::manifest::Manifest;

pub(crate) mod migrate;

/// Current store schema version. A store without a metadata record is treated
/// as the legacy version 1.
pub const SCHEMA_VERSION: u32 = 2;

const METADATA_TREE: &str = "metadata";
const MANIFEST_TREE: &str = "manifest";
const METADATA_KEY: &str = "ID";

const OPEN_DEADLINE: Duration = Duration::from_secs(10);
const OPEN_RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// Singleton metadata record, key `"ID"` in the `metadata` tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMetadata {
    #[serde(rename = "Version")]
    pub version: u32,
}

/// Embedded single-writer key/value store mapping canonical image strings to
/// their last-observed manifests.
#[derive(Debug)]
pub struct Store {
    db: sled::Db,
    metadata: sled::Tree,
    manifests: sled::Tree,
}

impl Store {
    /// Opens (or creates) the store. Lock contention from another process
    /// instance is retried until a bounded deadline; any other failure
    /// (missing permissions, path is a file, full disk) aborts immediately
    /// with the underlying error attached.
    pub fn open(path: &Path) -> Result<Store, StoreError> {
        let deadline = Instant::now() + OPEN_DEADLINE;

        let db = loop {
            match sled::open(path) {
                Ok(db) => break db,
                Err(sled::Error::Io(err)) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(StoreError::OpenTimeout {
                            path: path.to_path_buf(),
                            source: err,
                        });
                    }
                    debug!("store at {path:?} is locked, retrying: {err}");
                    std::thread::sleep(OPEN_RETRY_INTERVAL);
                }
                Err(source) => {
                    return Err(StoreError::Open {
                        path: path.to_path_buf(),
                        source,
                    });
                }
            }
        };

        let metadata = db.open_tree(METADATA_TREE).map_err(|source| open_err(path, source))?;
        let manifests = db.open_tree(MANIFEST_TREE).map_err(|source| open_err(path, source))?;

        Ok(Store {
            db,
            metadata,
            manifests,
        })
    }

    /// Schema version recorded in the metadata tree; 1 when no record exists
    /// (a store created before versioning).
    pub fn schema_version(&self) -> Result<u32, StoreError> {
        let record = self
            .metadata
            .get(METADATA_KEY)
            .map_err(|source| read_err(METADATA_KEY, source))?;

        match record {
            Some(raw) => {
                let metadata: StoreMetadata = serde_json::from_slice(&raw)
                    .map_err(|source| corrupt_err(METADATA_KEY, source))?;
                Ok(metadata.version)
            }
            None => Ok(1),
        }
    }

    /// The last-observed manifest for an image, or `None` when the image has
    /// never been seen. Absence is not an error; callers use it to
    /// distinguish "never seen" from "unchanged".
    pub fn get(&self, image: &Image) -> Result<Option<Manifest>, StoreError> {
        let key = image.canonical();
        let record = self
            .manifests
            .get(&key)
            .map_err(|source| read_err(&key, source))?;

        record
            .map(|raw| serde_json::from_slice(&raw).map_err(|source| corrupt_err(&key, source)))
            .transpose()
    }

    /// Replaces the record for the image's canonical key wholesale.
    pub fn put(&self, image: &Image, manifest: &Manifest) -> Result<(), StoreError> {
        let key = image.canonical();
        let value = serde_json::to_vec(manifest).map_err(|source| corrupt_err(&key, source))?;

        self.manifests
            .insert(key.as_bytes(), value)
            .map_err(|source| write_err(&key, source))?;
        self.db
            .flush()
            .map_err(|source| write_err(&key, source))?;

        Ok(())
    }

    /// Number of stored manifest records. Mostly for logging and tests.
    pub fn len(&self) -> usize {
        self.manifests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
    }

    /// Flushes outstanding writes. The file lock itself is released when the
    /// store is dropped.
    pub fn close(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(|source| write_err("", source))?;
        Ok(())
    }
}

fn open_err(path: &Path, source: sled::Error) -> StoreError {
    StoreError::Open {
        path: path.to_path_buf(),
        source,
    }
}

fn read_err(key: &str, source: sled::Error) -> StoreError {
    StoreError::Read {
        key: key.to_string(),
        source,
    }
}

fn write_err(key: &str, source: sled::Error) -> StoreError {
    StoreError::Write {
        key: key.to_string(),
        source,
    }
}

fn corrupt_err(key: &str, source: serde_json::Error) -> StoreError {
    StoreError::Corrupt {
        key: key.to_string(),
        source,
    }
}
