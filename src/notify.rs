use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error};

use crate::config::{NotifiersConfig, WebhookNotifierConfig};
use crate::job::NotifEntry;
use crate::manifest::Platform;

/// A notification sink. Delivery is fire-and-forget: a failed send is logged
/// and dropped, it is never retried and never blocks the other sinks.
pub enum Notifier {
    Webhook(WebhookNotifier),
}

impl Notifier {
    pub fn from_config(config: &NotifiersConfig) -> anyhow::Result<Vec<Notifier>> {
        config
            .webhook
            .iter()
            .map(|webhook| Ok(Notifier::Webhook(WebhookNotifier::new(webhook)?)))
            .collect()
    }

    pub fn name(&self) -> &'static str {
        match self {
            Notifier::Webhook(_) => "webhook",
        }
    }

    pub async fn send(&self, entry: &NotifEntry) -> anyhow::Result<()> {
        match self {
            Notifier::Webhook(notifier) => notifier.send(entry).await,
        }
    }
}

/// Delivers the entry to every notifier in turn. Failures are logged per
/// notifier; one broken sink never suppresses the rest.
pub async fn fan_out(notifiers: &[Notifier], entry: &NotifEntry) {
    for notifier in notifiers {
        match notifier.send(entry).await {
            Ok(()) => {
                debug!(
                    notifier = notifier.name(),
                    image = %entry.image,
                    status = %entry.status,
                    "notification sent"
                );
            }
            Err(err) => {
                error!(
                    notifier = notifier.name(),
                    image = %entry.image,
                    "notification failed: {err:#}"
                );
            }
        }
    }
}

/// JSON body POSTed by the webhook notifier.
#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    version: &'static str,
    status: &'a str,
    provider: &'a str,
    image: String,
    hub_link: Option<&'a str>,
    mime_type: &'a str,
    digest: &'a str,
    created: Option<DateTime<Utc>>,
    platform: &'a Platform,
}

pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(config: &WebhookNotifierConfig) -> anyhow::Result<WebhookNotifier> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;

        Ok(WebhookNotifier {
            client,
            url: config.url.clone(),
        })
    }

    async fn send(&self, entry: &NotifEntry) -> anyhow::Result<()> {
        let status = entry.status.to_string();
        let payload = WebhookPayload {
            version: env!("CARGO_PKG_VERSION"),
            status: &status,
            provider: &entry.provider,
            image: entry.image.canonical(),
            hub_link: entry.image.external_link(),
            mime_type: &entry.manifest.mime_type,
            digest: &entry.manifest.digest,
            created: entry.manifest.created,
            platform: &entry.manifest.platform,
        };

        let response = self.client.post(&self.url).json(&payload).send().await?;
        response.error_for_status()?;
        Ok(())
    }
}
