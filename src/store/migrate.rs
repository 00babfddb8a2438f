use serde_json::Value;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::manifest::Manifest;
use crate::store::{METADATA_KEY, SCHEMA_VERSION, Store, StoreMetadata};

type MigrationFn = fn(&sled::Tree) -> Result<(), StoreError>;

/// The upgrade routine that brings a store from `version - 1` to `version`.
fn migration(version: u32) -> Option<MigrationFn> {
    match version {
        2 => Some(migrate_v2),
        _ => None,
    }
}

impl Store {
    /// Applies pending migrations in strictly ascending order up to
    /// [`SCHEMA_VERSION`]. Each step rewrites the manifest tree atomically
    /// (one batch per version); the metadata record is updated only after
    /// every step has succeeded. A missing intermediate migration is a fatal
    /// configuration error.
    pub fn migrate(&self) -> Result<(), StoreError> {
        let current = self.schema_version()?;

        if current > SCHEMA_VERSION {
            return Err(StoreError::Migration {
                version: current,
                reason: format!("store is newer than this binary (target {SCHEMA_VERSION})"),
            });
        }
        if current == SCHEMA_VERSION {
            debug!("store schema is up to date (version {current})");
            return Ok(());
        }

        for version in current + 1..=SCHEMA_VERSION {
            let step = migration(version).ok_or(StoreError::MissingMigration { version })?;
            info!("migrating store schema to version {version}");
            step(&self.manifests)?;
        }

        let metadata = StoreMetadata {
            version: SCHEMA_VERSION,
        };
        let value = serde_json::to_vec(&metadata)
            .map_err(|source| super::corrupt_err(METADATA_KEY, source))?;
        self.metadata
            .insert(METADATA_KEY, value)
            .map_err(|source| super::write_err(METADATA_KEY, source))?;
        self.db
            .flush()
            .map_err(|source| super::write_err(METADATA_KEY, source))?;

        info!("store schema migrated to version {SCHEMA_VERSION}");
        Ok(())
    }
}

/// v1 → v2: version 1 stored the platform flat on each record
/// (`Architecture`/`Os`/`Variant` at the top level); rewrite every record to
/// the nested `Platform` encoding. Records already in the new shape pass
/// through unchanged.
fn migrate_v2(manifests: &sled::Tree) -> Result<(), StoreError> {
    let mut batch = sled::Batch::default();

    for item in manifests.iter() {
        let (key, value) = item.map_err(|source| super::read_err("<iter>", source))?;
        let key_str = String::from_utf8_lossy(&key).into_owned();

        let legacy: Value = serde_json::from_slice(&value)
            .map_err(|source| super::corrupt_err(&key_str, source))?;
        let manifest = v2_record(legacy).map_err(|source| super::corrupt_err(&key_str, source))?;

        let encoded = serde_json::to_vec(&manifest)
            .map_err(|source| super::corrupt_err(&key_str, source))?;
        batch.insert(key, encoded);
    }

    manifests
        .apply_batch(batch)
        .map_err(|source| super::write_err("<batch>", source))?;
    Ok(())
}

fn v2_record(mut value: Value) -> Result<Manifest, serde_json::Error> {
    let needs_rewrite = value.get("Platform").is_none();
    if needs_rewrite {
        if let Some(object) = value.as_object_mut() {
            let architecture = object
                .remove("Architecture")
                .unwrap_or(Value::String(String::new()));
            let os = object
                .remove("Os")
                .or_else(|| object.remove("OS"))
                .unwrap_or(Value::String(String::new()));
            let variant = object.remove("Variant").filter(|v| !v.is_null());

            let mut platform = serde_json::Map::new();
            platform.insert("Architecture".to_string(), architecture);
            platform.insert("OS".to_string(), os);
            if let Some(variant) = variant {
                platform.insert("Variant".to_string(), variant);
            }
            object.insert("Platform".to_string(), Value::Object(platform));
        }
    }

    serde_json::from_value(value)
}
