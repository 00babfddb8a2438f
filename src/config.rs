use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::job::ImageWatch;
use crate::registry::RegistryOptions;

/// Serde helper for durations expressed as whole seconds in config files.
pub(crate) mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct DbConfig {
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("var/tagwatch.db"),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Cron expression; standard 5-field syntax or with a leading seconds
    /// field.
    pub schedule: String,
    /// IANA timezone the schedule is evaluated in.
    pub timezone: String,
    /// Worker pool size per scan.
    pub workers: usize,
    /// Notify `New` entries on the very first scan after startup.
    pub first_check_notif: bool,
    /// Compare manifests by content digest instead of creation time.
    pub compare_digest: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            schedule: "0 * * * *".to_string(),
            timezone: "UTC".to_string(),
            workers: 10,
            first_check_notif: false,
            compare_digest: false,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Images watched straight from the configuration file.
    #[serde(rename = "static")]
    pub static_: Vec<ImageWatch>,
    /// Paths to YAML files, each carrying an `images:` list.
    pub file: Vec<PathBuf>,
}

const fn default_webhook_timeout() -> Duration {
    Duration::from_secs(10)
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WebhookNotifierConfig {
    pub url: String,
    #[serde(with = "crate::config::duration", default = "default_webhook_timeout")]
    pub timeout: Duration,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct NotifiersConfig {
    pub webhook: Vec<WebhookNotifierConfig>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Configuration {
    pub db: DbConfig,
    pub watch: WatchConfig,
    /// Named registry-options profiles referenced by `regopt` on a watch.
    pub regopts: HashMap<String, RegistryOptions>,
    pub providers: ProvidersConfig,
    pub notifiers: NotifiersConfig,
}

impl Configuration {
    pub fn figment(config: Option<PathBuf>) -> Figment {
        let fig = Figment::from(Serialized::defaults(Configuration::default()));

        let fig = match config {
            Some(path) => fig.admerge(Yaml::file(path)),
            None => fig,
        };

        fig.admerge(Env::prefixed("TAGWATCH_").split("__"))
    }

    pub fn load(figment: Figment) -> Result<Configuration> {
        let config: Configuration = figment.extract().context("Failed to load configuration")?;

        if config.watch.workers == 0 {
            bail!("watch.workers must be at least 1");
        }
        crate::scheduler::parse_schedule(&config.watch.schedule)?;
        config
            .watch
            .timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|err| anyhow::anyhow!("invalid watch.timezone: {err}"))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Configuration::load(Configuration::figment(None)).unwrap();
        assert_eq!(config.watch.workers, 10);
        assert_eq!(config.watch.timezone, "UTC");
        assert!(!config.watch.compare_digest);
        assert!(config.providers.static_.is_empty());
        assert!(config.notifiers.webhook.is_empty());
    }

    #[test]
    fn yaml_file_overrides_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "config.yaml",
                r#"
                db:
                  path: /tmp/tagwatch-test.db
                watch:
                  schedule: "*/30 * * * *"
                  timezone: Europe/Paris
                  workers: 4
                  compare_digest: true
                regopts:
                  private:
                    username: bob
                    password: hunter2
                    timeout: 20
                    insecure_tls: true
                providers:
                  static:
                    - name: alpine
                    - name: crazymax/diun:4
                      regopt: private
                      notify_on: [update]
                notifiers:
                  webhook:
                    - url: http://localhost:8080/hook
                "#,
            )?;

            let config = Configuration::load(Configuration::figment(Some(
                jail.directory().join("config.yaml"),
            )))
            .expect("configuration should load");

            assert_eq!(config.watch.workers, 4);
            assert_eq!(config.watch.timezone, "Europe/Paris");
            assert!(config.watch.compare_digest);

            let regopt = &config.regopts["private"];
            assert_eq!(regopt.username.as_deref(), Some("bob"));
            assert_eq!(regopt.timeout, Duration::from_secs(20));
            assert!(regopt.insecure_tls);

            assert_eq!(config.providers.static_.len(), 2);
            assert_eq!(config.providers.static_[1].regopt.as_deref(), Some("private"));
            assert_eq!(config.notifiers.webhook[0].url, "http://localhost:8080/hook");
            assert_eq!(
                config.notifiers.webhook[0].timeout,
                Duration::from_secs(10)
            );

            Ok(())
        });
    }

    #[test]
    fn env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("TAGWATCH_WATCH__WORKERS", "2");

            let config = Configuration::load(Configuration::figment(None))
                .expect("configuration should load");
            assert_eq!(config.watch.workers, 2);

            Ok(())
        });
    }

    #[test]
    fn invalid_schedule_is_rejected() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("config.yaml", "watch:\n  schedule: nonsense\n")?;

            let result = Configuration::load(Configuration::figment(Some(
                jail.directory().join("config.yaml"),
            )));
            assert!(result.is_err());

            Ok(())
        });
    }

    #[test]
    fn invalid_timezone_is_rejected() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("config.yaml", "watch:\n  timezone: Mars/Olympus\n")?;

            let result = Configuration::load(Configuration::figment(Some(
                jail.directory().join("config.yaml"),
            )));
            assert!(result.is_err());

            Ok(())
        });
    }

    #[test]
    fn zero_workers_is_rejected() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("config.yaml", "watch:\n  workers: 0\n")?;

            let result = Configuration::load(Configuration::figment(Some(
                jail.directory().join("config.yaml"),
            )));
            assert!(result.is_err());

            Ok(())
        });
    }
}
