use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Platform an image was built for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    #[serde(rename = "Architecture", default)]
    pub architecture: String,
    #[serde(rename = "OS", default)]
    pub os: String,
    #[serde(rename = "Variant", default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// Registry-reported metadata for one image tag. Produced fresh on every
/// fetch and replaced wholesale in the store, never mutated in place.
///
/// Serialized with PascalCase field names; this is the store's value
/// encoding (schema version 2) and must stay stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Manifest {
    pub name: String,
    pub tag: String,
    #[serde(rename = "MIMEType")]
    pub mime_type: String,
    pub digest: String,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub docker_version: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub platform: Platform,
    #[serde(default)]
    pub layers: Vec<String>,
}

/// Test fixture shared by the store and scheduler tests.
#[cfg(test)]
pub(crate) fn sample(created: Option<DateTime<Utc>>, digest: &str) -> Manifest {
    Manifest {
        name: "docker.io/library/alpine".to_string(),
        tag: "latest".to_string(),
        mime_type: "application/vnd.docker.distribution.manifest.v2+json".to_string(),
        digest: digest.to_string(),
        created,
        docker_version: "20.10.0".to_string(),
        labels: BTreeMap::from([("maintainer".to_string(), "someone".to_string())]),
        platform: Platform {
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            variant: None,
        },
        layers: vec!["sha256:layer1".to_string()],
    }
}
