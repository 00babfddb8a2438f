use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct JobLabels {
    pub status: String,
    pub provider: String,
}

/// Counters covering the scan loop. Registered once at startup; the scheduler
/// holds the handles.
#[derive(Clone)]
pub struct ScanMetrics {
    pub scans_total: Counter,
    pub scans_skipped: Counter,
    pub jobs_total: Family<JobLabels, Counter>,
}

impl ScanMetrics {
    pub fn new(registry: &mut Registry) -> ScanMetrics {
        let scans_total = Counter::default();
        registry.register(
            "scans",
            "Number of scan cycles started",
            scans_total.clone(),
        );

        let scans_skipped = Counter::default();
        registry.register(
            "scans_skipped",
            "Number of triggers dropped because a scan was already running",
            scans_skipped.clone(),
        );

        let jobs_total = Family::<JobLabels, Counter>::default();
        registry.register(
            "jobs",
            "Number of watch jobs processed, by provider and outcome",
            jobs_total.clone(),
        );

        ScanMetrics {
            scans_total,
            scans_skipped,
            jobs_total,
        }
    }
}
