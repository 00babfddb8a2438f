use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use prometheus_client::registry::Registry;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::Configuration;
use crate::image::{Image, ParseOptions};
use crate::job::{Job, NotifEntry, Status};
use crate::manifest::Manifest;
use crate::metrics::{JobLabels, ScanMetrics};
use crate::notify::{Notifier, fan_out};
use crate::provider::Provider;
use crate::registry::tags::{TagsOptions, keep_tag};
use crate::registry::{Client, RegistryOptions};
use crate::store::Store;

/// Broadcast marker asking long-running loops to stop.
#[derive(Debug, Clone, Copy)]
pub struct Shutdown;

/// Lazily-built registry clients, one per named options profile. The
/// anonymous profile (`regopt` unset) falls back to built-in defaults unless
/// the configuration defines a profile named `default`.
struct ClientPool {
    profiles: HashMap<String, RegistryOptions>,
    clients: Mutex<HashMap<String, Arc<Client>>>,
}

impl ClientPool {
    fn new(profiles: HashMap<String, RegistryOptions>) -> ClientPool {
        ClientPool {
            profiles,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn resolve(&self, name: Option<&str>) -> Result<Arc<Client>> {
        let key = name.unwrap_or("default");

        let mut clients = self.clients.lock().expect("client pool lock poisoned");
        if let Some(client) = clients.get(key) {
            return Ok(client.clone());
        }

        let options = match self.profiles.get(key) {
            Some(options) => options.clone(),
            None if name.is_none() => RegistryOptions::default(),
            None => bail!("unknown registry options profile {key:?}"),
        };

        let client = Arc::new(Client::new(&options)?);
        clients.insert(key.to_string(), client.clone());
        Ok(client)
    }
}

/// Per-scan tally of job outcomes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    pub new: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ScanReport {
    fn record(&mut self, status: Status) {
        match status {
            Status::New => self.new += 1,
            Status::Updated => self.updated += 1,
            Status::Unchanged => self.unchanged += 1,
            Status::Skipped => self.skipped += 1,
            Status::Error => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    Completed(ScanReport),
    /// The trigger fired while a scan was still running and was dropped.
    Skipped,
}

/// Drives the cron loop: enumerates providers, dispatches jobs to a bounded
/// worker pool, and enforces that at most one scan runs at a time.
pub struct Scheduler {
    schedule: cron::Schedule,
    timezone: chrono_tz::Tz,
    workers: usize,
    first_check_notif: bool,
    compare_digest: bool,
    providers: Vec<Provider>,
    notifiers: Arc<Vec<Notifier>>,
    store: Arc<Store>,
    clients: ClientPool,
    scanning: AtomicBool,
    first_scan: AtomicBool,
    metrics: ScanMetrics,
}

/// Parses a cron expression, accepting the standard 5-field form by pinning
/// the seconds field to zero.
pub(crate) fn parse_schedule(expr: &str) -> Result<cron::Schedule> {
    let fields = expr.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };

    cron::Schedule::from_str(&normalized)
        .with_context(|| format!("invalid cron expression {expr:?}"))
}

impl Scheduler {
    pub fn new(
        config: &Configuration,
        store: Arc<Store>,
        registry: &mut Registry,
    ) -> Result<Scheduler> {
        let schedule = parse_schedule(&config.watch.schedule)?;
        let timezone: chrono_tz::Tz = config
            .watch
            .timezone
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid timezone: {err}"))?;

        let notifiers = Notifier::from_config(&config.notifiers)?;

        Ok(Scheduler {
            schedule,
            timezone,
            workers: config.watch.workers,
            first_check_notif: config.watch.first_check_notif,
            compare_digest: config.watch.compare_digest,
            providers: Provider::from_config(&config.providers),
            notifiers: Arc::new(notifiers),
            store,
            clients: ClientPool::new(config.regopts.clone()),
            scanning: AtomicBool::new(false),
            first_scan: AtomicBool::new(true),
            metrics: ScanMetrics::new(registry),
        })
    }

    /// Runs one scan immediately, then follows the cron schedule until a
    /// shutdown message arrives.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<Shutdown>) -> Result<()> {
        self.run_once().await;

        loop {
            let Some(next) = self.schedule.upcoming(self.timezone).next() else {
                warn!("schedule has no upcoming occurrence, stopping");
                break;
            };
            info!("next scan at {next}");

            let delay = (next.with_timezone(&Utc) - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    self.run_once().await;
                }
                _ = shutdown.recv() => {
                    info!("shutdown requested, stopping scheduler");
                    break;
                }
            }
        }

        for provider in &self.providers {
            provider.close();
        }
        Ok(())
    }

    /// Triggers a scan unless one is already in flight; a conflicting trigger
    /// is dropped, never queued.
    pub async fn run_once(&self) -> ScanOutcome {
        if self
            .scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("scan already in progress, dropping trigger");
            self.metrics.scans_skipped.inc();
            return ScanOutcome::Skipped;
        }

        let report = self.scan().await;
        self.scanning.store(false, Ordering::SeqCst);
        ScanOutcome::Completed(report)
    }

    async fn scan(&self) -> ScanReport {
        self.metrics.scans_total.inc();
        let first_check = self.first_scan.swap(false, Ordering::SeqCst);

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks: JoinSet<(String, Vec<Status>)> = JoinSet::new();
        let mut report = ScanReport::default();

        for provider in &self.providers {
            for mut job in provider.list_jobs() {
                job.first_check = first_check;

                let client = match self.clients.resolve(job.image.regopt.as_deref()) {
                    Ok(client) => client,
                    Err(err) => {
                        error!(
                            provider = %job.provider,
                            image = %job.image.name,
                            "cannot resolve registry client: {err:#}"
                        );
                        report.record(Status::Error);
                        self.count_job(&job.provider, Status::Error);
                        continue;
                    }
                };

                let semaphore = semaphore.clone();
                let store = self.store.clone();
                let notifiers = self.notifiers.clone();
                let compare_digest = self.compare_digest;
                let first_check_notif = self.first_check_notif;

                tasks.spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .expect("worker semaphore closed");
                    let provider = job.provider.clone();
                    let statuses = run_job(
                        job,
                        client,
                        store,
                        notifiers,
                        compare_digest,
                        first_check_notif,
                    )
                    .await;
                    (provider, statuses)
                });
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((provider, statuses)) => {
                    for status in statuses {
                        report.record(status);
                        self.count_job(&provider, status);
                    }
                }
                Err(err) => {
                    error!("watch job panicked: {err}");
                    report.record(Status::Error);
                }
            }
        }

        info!(
            new = report.new,
            updated = report.updated,
            unchanged = report.unchanged,
            skipped = report.skipped,
            failed = report.failed,
            "scan finished"
        );
        report
    }

    fn count_job(&self, provider: &str, status: Status) {
        self.metrics
            .jobs_total
            .get_or_create(&JobLabels {
                status: status.to_string(),
                provider: provider.to_string(),
            })
            .inc();
    }
}

/// Executes one watch job inside its worker slot. A repository watch fans out
/// into a check per surviving tag; a plain watch checks its single reference.
async fn run_job(
    job: Job,
    client: Arc<Client>,
    store: Arc<Store>,
    notifiers: Arc<Vec<Notifier>>,
    compare_digest: bool,
    first_check_notif: bool,
) -> Vec<Status> {
    let parse_options = ParseOptions {
        link_template: job.image.link_template.clone(),
    };
    let image = match Image::parse(&job.image.name, &parse_options) {
        Ok(image) => image,
        Err(err) => {
            error!(
                provider = %job.provider,
                id = %job.id,
                image = %job.image.name,
                "invalid image reference: {err}"
            );
            return vec![Status::Error];
        }
    };

    if job.image.watch_repo {
        let options = TagsOptions {
            max: job.image.max_tags,
            sort: job.image.sort_tags,
            include: job.image.include_tags.clone(),
            exclude: job.image.exclude_tags.clone(),
        };
        let tags = match client.list_tags(&image, &options).await {
            Ok(tags) => tags,
            Err(err) => {
                error!(provider = %job.provider, id = %job.id, image = %image, "tag listing failed: {err}");
                return vec![Status::Error];
            }
        };
        debug!(
            image = %image,
            kept = tags.list.len(),
            not_included = tags.not_included_count,
            excluded = tags.excluded_count,
            total = tags.total_count,
            "repository tags filtered"
        );

        let mut statuses = Vec::with_capacity(tags.list.len());
        for tag in &tags.list {
            let tagged = image.with_tag(tag);
            statuses.push(
                check_image(
                    &job,
                    &tagged,
                    &client,
                    &store,
                    &notifiers,
                    compare_digest,
                    first_check_notif,
                )
                .await,
            );
        }
        return statuses;
    }

    if !keep_tag(&image.tag, &job.image.include_tags, &job.image.exclude_tags) {
        debug!(provider = %job.provider, image = %image, "tag rejected by filters");
        return vec![Status::Skipped];
    }

    vec![
        check_image(
            &job,
            &image,
            &client,
            &store,
            &notifiers,
            compare_digest,
            first_check_notif,
        )
        .await,
    ]
}

/// Fetch, compare against the store, persist, notify. The store write always
/// precedes the notification; a failed write forfeits the notification so a
/// change is never announced without being remembered.
async fn check_image(
    job: &Job,
    image: &Image,
    client: &Client,
    store: &Store,
    notifiers: &[Notifier],
    compare_digest: bool,
    first_check_notif: bool,
) -> Status {
    let manifest = match client.fetch_manifest(image).await {
        Ok(manifest) => manifest,
        Err(err) => {
            error!(provider = %job.provider, id = %job.id, image = %image, "manifest fetch failed: {err}");
            return Status::Error;
        }
    };

    let previous = match store.get(image) {
        Ok(previous) => previous,
        Err(err) => {
            error!(image = %image, "store read failed: {err}");
            return Status::Error;
        }
    };

    let status = match &previous {
        None => Status::New,
        Some(previous) if manifest_changed(previous, &manifest, compare_digest) => Status::Updated,
        Some(_) => Status::Unchanged,
    };

    if status == Status::Unchanged {
        return status;
    }

    if let Err(err) = store.put(image, &manifest) {
        error!(image = %image, "store write failed: {err}");
        return Status::Error;
    }

    let suppressed = status == Status::New && job.first_check && !first_check_notif;
    let wanted = job.image.notify_on.iter().any(|on| on.covers(status));
    if wanted && !suppressed {
        let entry = NotifEntry {
            status,
            provider: job.provider.clone(),
            image: image.clone(),
            manifest,
        };
        fan_out(notifiers, &entry).await;
    }

    status
}

/// A manifest counts as changed when its creation time moves; digests are the
/// fallback when either side lacks one, and the primary signal when digest
/// comparison is switched on.
fn manifest_changed(previous: &Manifest, next: &Manifest, compare_digest: bool) -> bool {
    if compare_digest || previous.created.is_none() || next.created.is_none() {
        previous.digest != next.digest
    } else {
        previous.created != next.created
    }
}
