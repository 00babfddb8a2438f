use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::error::FetchError;
use crate::image::Image;
use crate::manifest::{Manifest, Platform};
use crate::registry::{Client, base_url};

const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.oci.image.manifest.v1+json";

const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";

#[derive(Debug, Deserialize)]
struct ManifestEnvelope {
    #[serde(default, rename = "mediaType")]
    media_type: Option<String>,
    /// Present only on manifest lists / OCI indexes.
    #[serde(default)]
    manifests: Vec<Descriptor>,
    #[serde(default)]
    config: Option<Descriptor>,
    #[serde(default)]
    layers: Vec<Descriptor>,
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    digest: String,
    #[serde(default)]
    platform: Option<DescriptorPlatform>,
}

#[derive(Debug, Deserialize)]
struct DescriptorPlatform {
    #[serde(default)]
    architecture: String,
    #[serde(default)]
    os: String,
    #[serde(default)]
    variant: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigBlob {
    #[serde(default)]
    created: Option<DateTime<Utc>>,
    #[serde(default)]
    architecture: Option<String>,
    #[serde(default)]
    os: Option<String>,
    #[serde(default)]
    variant: Option<String>,
    #[serde(default)]
    docker_version: Option<String>,
    #[serde(default)]
    config: Option<ContainerConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct ContainerConfig {
    #[serde(default, rename = "Labels")]
    labels: Option<BTreeMap<String, String>>,
}

impl Client {
    /// Fetches the live manifest for an image reference: resolves manifest
    /// lists to the client's configured platform, then reads the config blob
    /// for creation time, labels and platform details.
    pub async fn fetch_manifest(&self, image: &Image) -> Result<Manifest, FetchError> {
        let base = base_url(&image.domain);
        let url = format!("{base}/v2/{}/manifests/{}", image.path, image.reference());

        let response = self.get(&url, Some(MANIFEST_ACCEPT), &image.path).await?;
        let header_digest = response
            .headers()
            .get("docker-content-digest")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|err| FetchError::from_reqwest(&url, err))?;

        let mut digest = header_digest.unwrap_or_else(|| sha256_digest(&body));
        let mut envelope: ManifestEnvelope = serde_json::from_slice(&body)
            .map_err(|err| FetchError::Malformed(url.clone(), err.to_string()))?;

        if !envelope.manifests.is_empty() {
            let entry = self.select_platform(&envelope.manifests).ok_or_else(|| {
                FetchError::Malformed(
                    url.clone(),
                    format!(
                        "no manifest for platform {}/{}",
                        self.image_os, self.image_arch
                    ),
                )
            })?;
            digest = entry.digest.clone();
            debug!(image = %image, digest = %digest, "resolved manifest list entry");

            let url = format!("{base}/v2/{}/manifests/{}", image.path, digest);
            let response = self.get(&url, Some(MANIFEST_ACCEPT), &image.path).await?;
            let body = response
                .bytes()
                .await
                .map_err(|err| FetchError::from_reqwest(&url, err))?;
            envelope = serde_json::from_slice(&body)
                .map_err(|err| FetchError::Malformed(url.clone(), err.to_string()))?;
        }

        let config = envelope.config.as_ref().ok_or_else(|| {
            FetchError::Malformed(url.clone(), "manifest carries no config descriptor".into())
        })?;

        let blob_url = format!("{base}/v2/{}/blobs/{}", image.path, config.digest);
        let response = self.get(&blob_url, None, &image.path).await?;
        let blob: ConfigBlob = response
            .json()
            .await
            .map_err(|err| FetchError::from_reqwest(&blob_url, err))?;

        Ok(Manifest {
            name: image.repository(),
            tag: image.reference().to_string(),
            mime_type: envelope
                .media_type
                .unwrap_or_else(|| DOCKER_MANIFEST_V2.to_string()),
            digest,
            created: blob.created,
            docker_version: blob.docker_version.unwrap_or_default(),
            labels: blob.config.and_then(|c| c.labels).unwrap_or_default(),
            platform: Platform {
                architecture: blob.architecture.unwrap_or_else(|| self.image_arch.clone()),
                os: blob.os.unwrap_or_else(|| self.image_os.clone()),
                variant: blob.variant.or_else(|| self.image_variant.clone()),
            },
            layers: envelope
                .layers
                .into_iter()
                .map(|layer| layer.digest)
                .collect(),
        })
    }

    fn select_platform<'a>(&self, entries: &'a [Descriptor]) -> Option<&'a Descriptor> {
        entries.iter().find(|entry| {
            entry.platform.as_ref().is_some_and(|platform| {
                platform.os == self.image_os
                    && platform.architecture == self.image_arch
                    && (self.image_variant.is_none() || platform.variant == self.image_variant)
            })
        })
    }
}

fn sha256_digest(body: &[u8]) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, body);
    format!(
        "sha256:{}",
        data_encoding::HEXLOWER.encode(digest.as_ref())
    )
}
