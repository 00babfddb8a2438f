use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

use crate::image::Image;
use crate::manifest::Manifest;
use crate::registry::sort::SortPolicy;

/// Terminal state of one fetch-and-compare job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Status {
    New,
    Updated,
    Unchanged,
    Skipped,
    Error,
}

/// Which change kinds a watched image notifies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyOn {
    New,
    Update,
}

impl NotifyOn {
    pub fn covers(self, status: Status) -> bool {
        matches!(
            (self, status),
            (NotifyOn::New, Status::New) | (NotifyOn::Update, Status::Updated)
        )
    }
}

fn default_notify_on() -> Vec<NotifyOn> {
    vec![NotifyOn::New, NotifyOn::Update]
}

/// Watch configuration for one image, as written by a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageWatch {
    /// Free-form image reference, e.g. `crazymax/diun:4`.
    pub name: String,
    /// Registry-options profile to resolve the client from; `None` uses the
    /// built-in defaults.
    pub regopt: Option<String>,
    /// Watch the whole repository rather than the single referenced tag.
    /// Fan-out into per-tag checks happens inside the worker slot.
    pub watch_repo: bool,
    #[serde(default = "default_notify_on")]
    pub notify_on: Vec<NotifyOn>,
    /// Overrides the built-in web link templates for this image's
    /// notification link. Supports `{domain}` and `{path}` placeholders.
    pub link_template: Option<String>,
    /// Cap on tags considered for repository watching; 0 means no limit.
    pub max_tags: usize,
    pub sort_tags: SortPolicy,
    #[serde(with = "serde_regex")]
    pub include_tags: Vec<Regex>,
    #[serde(with = "serde_regex")]
    pub exclude_tags: Vec<Regex>,
}

impl Default for ImageWatch {
    fn default() -> Self {
        Self {
            name: String::new(),
            regopt: None,
            watch_repo: false,
            notify_on: default_notify_on(),
            link_template: None,
            max_tags: 0,
            sort_tags: SortPolicy::default(),
            include_tags: vec![],
            exclude_tags: vec![],
        }
    }
}

/// One unit of work: produced by a provider during a scan, bound to a
/// registry client at dispatch, consumed exactly once by a worker.
#[derive(Debug, Clone)]
pub struct Job {
    pub provider: String,
    pub id: Uuid,
    pub image: ImageWatch,
    /// Set on the first scan after startup; used to suppress the initial
    /// flood of `New` notifications unless configured otherwise.
    pub first_check: bool,
}

impl Job {
    pub fn new(provider: &str, image: ImageWatch) -> Job {
        Job {
            provider: provider.to_string(),
            id: Uuid::new_v4(),
            image,
            first_check: false,
        }
    }
}

/// A change event handed to the notification fan-out, then discarded.
#[derive(Debug, Clone, Serialize)]
pub struct NotifEntry {
    pub status: Status,
    pub provider: String,
    pub image: Image,
    pub manifest: Manifest,
}
