use std::path::PathBuf;

use figment::{
    Figment,
    providers::{Format, Yaml},
};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::ProvidersConfig;
use crate::job::{ImageWatch, Job};

/// A source of image watch jobs. Providers are enumerated fresh on every
/// scan; they never fail a scan, they only yield fewer jobs and log why.
pub enum Provider {
    Static(StaticProvider),
    File(FileProvider),
}

impl Provider {
    pub fn from_config(config: &ProvidersConfig) -> Vec<Provider> {
        let mut providers = Vec::new();
        if !config.static_.is_empty() {
            providers.push(Provider::Static(StaticProvider {
                images: config.static_.clone(),
            }));
        }
        if !config.file.is_empty() {
            providers.push(Provider::File(FileProvider {
                paths: config.file.clone(),
            }));
        }
        providers
    }

    pub fn name(&self) -> &'static str {
        match self {
            Provider::Static(_) => "static",
            Provider::File(_) => "file",
        }
    }

    pub fn list_jobs(&self) -> Vec<Job> {
        let jobs = match self {
            Provider::Static(provider) => provider.list_jobs(),
            Provider::File(provider) => provider.list_jobs(),
        };
        if jobs.is_empty() {
            warn!(provider = self.name(), "provider yielded no jobs");
        }
        jobs
    }

    /// Release any resources held by the provider. Current providers hold
    /// none; the hook exists for sources that watch or poll.
    pub fn close(&self) {}
}

/// Images listed directly in the main configuration.
pub struct StaticProvider {
    images: Vec<ImageWatch>,
}

impl StaticProvider {
    fn list_jobs(&self) -> Vec<Job> {
        self.images
            .iter()
            .map(|image| Job::new("static", image.clone()))
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct FileImages {
    #[serde(default)]
    images: Vec<ImageWatch>,
}

/// Images read from standalone YAML files, re-read on every scan so edits
/// take effect without a restart. An unreadable or malformed file is logged
/// and skipped; the remaining files still contribute jobs.
pub struct FileProvider {
    paths: Vec<PathBuf>,
}

impl FileProvider {
    fn list_jobs(&self) -> Vec<Job> {
        let mut jobs = Vec::new();

        for path in &self.paths {
            let parsed: Result<FileImages, _> =
                Figment::from(Yaml::file_exact(path)).extract();

            match parsed {
                Ok(file) => {
                    debug!(path = %path.display(), images = file.images.len(), "loaded watch file");
                    jobs.extend(file.images.into_iter().map(|image| Job::new("file", image)));
                }
                Err(err) => {
                    warn!(path = %path.display(), "skipping unreadable watch file: {err}");
                }
            }
        }

        jobs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::NotifyOn;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn watch(name: &str) -> ImageWatch {
        ImageWatch {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn static_provider_maps_every_image() {
        let provider = Provider::Static(StaticProvider {
            images: vec![watch("alpine"), watch("crazymax/diun:4")],
        });

        let jobs = provider.list_jobs();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|job| job.provider == "static"));
        assert_eq!(jobs[1].image.name, "crazymax/diun:4");
    }

    #[test]
    fn file_provider_reads_yaml_files() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
images:
  - name: alpine
  - name: crazymax/diun
    watch_repo: true
    max_tags: 10
    notify_on: [update]
"#
        )
        .unwrap();

        let provider = Provider::File(FileProvider {
            paths: vec![file.path().to_path_buf()],
        });

        let jobs = provider.list_jobs();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].provider, "file");
        assert!(jobs[1].image.watch_repo);
        assert_eq!(jobs[1].image.max_tags, 10);
        assert_eq!(jobs[1].image.notify_on, vec![NotifyOn::Update]);
    }

    #[test]
    fn malformed_file_is_skipped_not_fatal() {
        let mut bad = NamedTempFile::new().unwrap();
        writeln!(bad, "images: {{not a list}}").unwrap();

        let mut good = NamedTempFile::new().unwrap();
        writeln!(good, "images:\n  - name: alpine").unwrap();

        let provider = Provider::File(FileProvider {
            paths: vec![
                bad.path().to_path_buf(),
                PathBuf::from("/nonexistent/watch.yaml"),
                good.path().to_path_buf(),
            ],
        });

        let jobs = provider.list_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].image.name, "alpine");
    }

    #[test]
    fn empty_images_key_yields_no_jobs() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "images: []").unwrap();

        let provider = Provider::File(FileProvider {
            paths: vec![file.path().to_path_buf()],
        });
        assert!(provider.list_jobs().is_empty());
    }

    #[test]
    fn from_config_builds_only_configured_providers() {
        let providers = Provider::from_config(&ProvidersConfig::default());
        assert!(providers.is_empty());

        let providers = Provider::from_config(&ProvidersConfig {
            static_: vec![watch("alpine")],
            file: vec![],
        });
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].name(), "static");
    }
}
