use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(30);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a fmt subscriber honouring `RUST_LOG` (default `info`). Safe to call repeatedly.
pub fn init_tracing() {
    TRACING_INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    });
}

/// Process-wide counters for the indexing core.
#[derive(Default, Debug)]
pub struct Telemetry {
    blocks_applied: AtomicU64,
    blocks_reverted: AtomicU64,
    forks_detected: AtomicU64,
    jobs_enqueued: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_retried: AtomicU64,
    jobs_failed: AtomicU64,
    audits_run: AtomicU64,
    audit_mismatches: AtomicU64,
    validator_reloads: AtomicU64,
    listener_failures: AtomicU64,
    backlog_detections: AtomicU64,
    last_backlog: AtomicU64,
}

macro_rules! counter {
    ($($record:ident => $field:ident),+ $(,)?) => {
        $(
            pub fn $record(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )+
    };
}

impl Telemetry {
    counter! {
        record_block_applied => blocks_applied,
        record_block_reverted => blocks_reverted,
        record_fork_detected => forks_detected,
        record_job_enqueued => jobs_enqueued,
        record_job_completed => jobs_completed,
        record_job_retried => jobs_retried,
        record_job_failed => jobs_failed,
        record_audit => audits_run,
        record_audit_mismatch => audit_mismatches,
        record_validator_reload => validator_reloads,
        record_listener_failure => listener_failures,
    }

    /// Records a backfill pass whose missing-height count crossed the skip threshold.
    pub fn record_backlog(&self, missing: u64) {
        self.backlog_detections.fetch_add(1, Ordering::Relaxed);
        self.last_backlog.store(missing, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        TelemetrySnapshot {
            blocks_applied: load(&self.blocks_applied),
            blocks_reverted: load(&self.blocks_reverted),
            forks_detected: load(&self.forks_detected),
            jobs_enqueued: load(&self.jobs_enqueued),
            jobs_completed: load(&self.jobs_completed),
            jobs_retried: load(&self.jobs_retried),
            jobs_failed: load(&self.jobs_failed),
            audits_run: load(&self.audits_run),
            audit_mismatches: load(&self.audit_mismatches),
            validator_reloads: load(&self.validator_reloads),
            listener_failures: load(&self.listener_failures),
            backlog_detections: load(&self.backlog_detections),
            last_backlog: load(&self.last_backlog),
        }
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub blocks_applied: u64,
    pub blocks_reverted: u64,
    pub forks_detected: u64,
    pub jobs_enqueued: u64,
    pub jobs_completed: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    pub audits_run: u64,
    pub audit_mismatches: u64,
    pub validator_reloads: u64,
    pub listener_failures: u64,
    pub backlog_detections: u64,
    pub last_backlog: u64,
}

/// Periodically logs a snapshot and block throughput until `shutdown` fires.
pub fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut previous = telemetry.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "chainview::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current = telemetry.snapshot();
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let applied = current.blocks_applied.saturating_sub(previous.blocks_applied);
                    let throughput = if elapsed <= f64::EPSILON { 0.0 } else { applied as f64 / elapsed };

                    tracing::info!(
                        target: "chainview::metrics",
                        throughput = format!("{throughput:.2}"),
                        blocks_applied = current.blocks_applied,
                        blocks_reverted = current.blocks_reverted,
                        forks = current.forks_detected,
                        jobs_completed = current.jobs_completed,
                        jobs_failed = current.jobs_failed,
                        audit_mismatches = current.audit_mismatches,
                        listener_failures = current.listener_failures,
                        backlog = current.last_backlog,
                        "indexer metrics snapshot"
                    );

                    previous = current;
                    last_tick = Instant::now();
                }
            }
        }
    })
}
