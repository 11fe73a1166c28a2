use crate::runtime::telemetry;
use anyhow::{bail, Context, Result};
use num_bigint::BigUint;
use std::time::Duration;

const DEFAULT_NODE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_JOB_WORKERS: usize = 4;
const DEFAULT_JOB_MAX_ATTEMPTS: usize = 5;
const DEFAULT_JOB_INITIAL_BACKOFF_MS: u64 = 500;
const DEFAULT_JOB_MAX_BACKOFF_SECS: u64 = 30;
const DEFAULT_BACKFILL_INTERVAL_SECS: u64 = 15 * 60;
const DEFAULT_AUDIT_INTERVAL_SECS: u64 = 5 * 60;
const DEFAULT_BACKFILL_SKIP_THRESHOLD: usize = 1_000;
const DEFAULT_ACTIVE_VALIDATORS: usize = 101;
/// 1000 tokens at 8 decimals.
const DEFAULT_MIN_ELIGIBLE_WEIGHT: u64 = 100_000_000_000;
const DEFAULT_PATCH_CONCURRENCY: usize = 8;
const DEFAULT_FORK_WINDOW_SIZE: usize = 128;
const DEFAULT_GENESIS_MAX_ATTEMPTS: usize = 12;

/// Runtime configuration for the indexer.
///
/// All instances are built through [`IndexerConfig::builder`] or [`IndexerConfig::new`],
/// both of which validate before returning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexerConfig {
    node_url: String,
    node_timeout: Duration,
    job_workers: usize,
    job_max_attempts: usize,
    job_initial_backoff: Duration,
    job_max_backoff: Duration,
    backfill_interval: Duration,
    audit_interval: Duration,
    backfill_skip_threshold: usize,
    active_validators: usize,
    min_eligible_weight: BigUint,
    patch_concurrency: usize,
    fork_window_size: usize,
    genesis_max_attempts: usize,
    metrics_interval: Duration,
}

pub struct IndexerConfigParams {
    pub node_url: String,
    pub node_timeout: Duration,
    pub job_workers: usize,
    pub job_max_attempts: usize,
    pub job_initial_backoff: Duration,
    pub job_max_backoff: Duration,
    pub backfill_interval: Duration,
    pub audit_interval: Duration,
    pub backfill_skip_threshold: usize,
    pub active_validators: usize,
    pub min_eligible_weight: BigUint,
    pub patch_concurrency: usize,
    pub fork_window_size: usize,
    pub genesis_max_attempts: usize,
    pub metrics_interval: Duration,
}

impl IndexerConfig {
    pub fn builder() -> IndexerConfigBuilder {
        IndexerConfigBuilder::default()
    }

    pub fn new(params: IndexerConfigParams) -> Result<Self> {
        let IndexerConfigParams {
            node_url,
            node_timeout,
            job_workers,
            job_max_attempts,
            job_initial_backoff,
            job_max_backoff,
            backfill_interval,
            audit_interval,
            backfill_skip_threshold,
            active_validators,
            min_eligible_weight,
            patch_concurrency,
            fork_window_size,
            genesis_max_attempts,
            metrics_interval,
        } = params;

        let config = Self {
            node_url: node_url.trim().to_owned(),
            node_timeout,
            job_workers,
            job_max_attempts,
            job_initial_backoff,
            job_max_backoff,
            backfill_interval,
            audit_interval,
            backfill_skip_threshold,
            active_validators,
            min_eligible_weight,
            patch_concurrency,
            fork_window_size,
            genesis_max_attempts,
            metrics_interval,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn node_url(&self) -> &str {
        &self.node_url
    }

    /// Timeout applied to every node request.
    pub fn node_timeout(&self) -> Duration {
        self.node_timeout
    }

    pub fn job_workers(&self) -> usize {
        self.job_workers
    }

    pub fn job_max_attempts(&self) -> usize {
        self.job_max_attempts
    }

    pub fn job_initial_backoff(&self) -> Duration {
        self.job_initial_backoff
    }

    pub fn job_max_backoff(&self) -> Duration {
        self.job_max_backoff
    }

    /// Interval between periodic backfill passes.
    pub fn backfill_interval(&self) -> Duration {
        self.backfill_interval
    }

    /// Interval between validator cache audits.
    pub fn audit_interval(&self) -> Duration {
        self.audit_interval
    }

    /// Missing-height count above which a backfill pass is reported as a backlog.
    pub fn backfill_skip_threshold(&self) -> usize {
        self.backfill_skip_threshold
    }

    /// Size of the active generator set.
    pub fn active_validators(&self) -> usize {
        self.active_validators
    }

    pub fn min_eligible_weight(&self) -> &BigUint {
        &self.min_eligible_weight
    }

    /// Upper bound on concurrent per-validator node fetches during a patch.
    pub fn patch_concurrency(&self) -> usize {
        self.patch_concurrency
    }

    /// Number of recent blocks remembered for fork detection and reconciliation depth.
    pub fn fork_window_size(&self) -> usize {
        self.fork_window_size
    }

    pub fn genesis_max_attempts(&self) -> usize {
        self.genesis_max_attempts
    }

    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    pub fn validate(&self) -> Result<()> {
        let url = self.node_url.as_str();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            bail!("node_url must start with http:// or https://");
        }

        let durations = [
            ("node_timeout", self.node_timeout),
            ("job_initial_backoff", self.job_initial_backoff),
            ("job_max_backoff", self.job_max_backoff),
            ("backfill_interval", self.backfill_interval),
            ("audit_interval", self.audit_interval),
            ("metrics_interval", self.metrics_interval),
        ];
        for (field, value) in durations {
            if value.is_zero() {
                bail!("{field} must be greater than 0");
            }
        }

        let counts = [
            ("job_workers", self.job_workers),
            ("job_max_attempts", self.job_max_attempts),
            ("active_validators", self.active_validators),
            ("patch_concurrency", self.patch_concurrency),
            ("fork_window_size", self.fork_window_size),
            ("genesis_max_attempts", self.genesis_max_attempts),
        ];
        for (field, value) in counts {
            if value == 0 {
                bail!("{field} must be greater than 0");
            }
        }

        if self.job_max_backoff < self.job_initial_backoff {
            bail!("job_max_backoff must not be shorter than job_initial_backoff");
        }

        Ok(())
    }
}

#[derive(Default)]
pub struct IndexerConfigBuilder {
    node_url: Option<String>,
    node_timeout: Option<Duration>,
    job_workers: Option<usize>,
    job_max_attempts: Option<usize>,
    job_initial_backoff: Option<Duration>,
    job_max_backoff: Option<Duration>,
    backfill_interval: Option<Duration>,
    audit_interval: Option<Duration>,
    backfill_skip_threshold: Option<usize>,
    active_validators: Option<usize>,
    min_eligible_weight: Option<BigUint>,
    patch_concurrency: Option<usize>,
    fork_window_size: Option<usize>,
    genesis_max_attempts: Option<usize>,
    metrics_interval: Option<Duration>,
}

macro_rules! setters {
    ($($field:ident: $ty:ty),+ $(,)?) => {
        $(
            pub fn $field(mut self, value: $ty) -> Self {
                self.$field = Some(value);
                self
            }
        )+
    };
}

impl IndexerConfigBuilder {
    pub fn node_url(mut self, url: impl Into<String>) -> Self {
        self.node_url = Some(url.into());
        self
    }

    setters! {
        node_timeout: Duration,
        job_workers: usize,
        job_max_attempts: usize,
        job_initial_backoff: Duration,
        job_max_backoff: Duration,
        backfill_interval: Duration,
        audit_interval: Duration,
        backfill_skip_threshold: usize,
        active_validators: usize,
        min_eligible_weight: BigUint,
        patch_concurrency: usize,
        fork_window_size: usize,
        genesis_max_attempts: usize,
        metrics_interval: Duration,
    }

    pub fn build(self) -> Result<IndexerConfig> {
        let params = IndexerConfigParams {
            node_url: self.node_url.context("node_url is required")?,
            node_timeout: self
                .node_timeout
                .unwrap_or(Duration::from_secs(DEFAULT_NODE_TIMEOUT_SECS)),
            job_workers: self.job_workers.unwrap_or(DEFAULT_JOB_WORKERS),
            job_max_attempts: self.job_max_attempts.unwrap_or(DEFAULT_JOB_MAX_ATTEMPTS),
            job_initial_backoff: self
                .job_initial_backoff
                .unwrap_or(Duration::from_millis(DEFAULT_JOB_INITIAL_BACKOFF_MS)),
            job_max_backoff: self
                .job_max_backoff
                .unwrap_or(Duration::from_secs(DEFAULT_JOB_MAX_BACKOFF_SECS)),
            backfill_interval: self
                .backfill_interval
                .unwrap_or(Duration::from_secs(DEFAULT_BACKFILL_INTERVAL_SECS)),
            audit_interval: self
                .audit_interval
                .unwrap_or(Duration::from_secs(DEFAULT_AUDIT_INTERVAL_SECS)),
            backfill_skip_threshold: self
                .backfill_skip_threshold
                .unwrap_or(DEFAULT_BACKFILL_SKIP_THRESHOLD),
            active_validators: self.active_validators.unwrap_or(DEFAULT_ACTIVE_VALIDATORS),
            min_eligible_weight: self
                .min_eligible_weight
                .unwrap_or_else(|| BigUint::from(DEFAULT_MIN_ELIGIBLE_WEIGHT)),
            patch_concurrency: self.patch_concurrency.unwrap_or(DEFAULT_PATCH_CONCURRENCY),
            fork_window_size: self.fork_window_size.unwrap_or(DEFAULT_FORK_WINDOW_SIZE),
            genesis_max_attempts: self
                .genesis_max_attempts
                .unwrap_or(DEFAULT_GENESIS_MAX_ATTEMPTS),
            metrics_interval: self
                .metrics_interval
                .unwrap_or(telemetry::DEFAULT_METRICS_INTERVAL),
        };

        IndexerConfig::new(params)
    }
}
