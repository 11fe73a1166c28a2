use crate::bus::{EventBus, ReloadReason};
use crate::error::IndexerError;
use crate::indexer::{BlockIndexer, IndexStatsCache};
use crate::model::block::POS_MODULE;
use crate::node::{JsonRpcNodeClient, NetworkStatus, NodeClient, NodeClientOptions};
use crate::queue::{
    retry_with_backoff, JobHandler, JobQueue, MemoryJobQueue, RetryDisposition, RetryPolicy,
};
use crate::runtime::config::IndexerConfig;
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::telemetry::{spawn_metrics_reporter, Telemetry};
use crate::scheduler::{BackfillScheduler, BackfillSettings, ModuleRegistry};
use crate::store::{IndexStore, MemoryStore};
use crate::validators::{ValidatorCache, ValidatorCacheSettings};
use anyhow::{bail, Context, Result};
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Every long-lived component, shared by `Arc`.
#[derive(Clone)]
pub struct Components {
    pub bus: Arc<EventBus>,
    pub store: Arc<dyn IndexStore>,
    pub node: Arc<dyn NodeClient>,
    pub telemetry: Arc<Telemetry>,
    pub indexer: Arc<BlockIndexer>,
    pub stats: Arc<IndexStatsCache>,
    pub validators: Arc<ValidatorCache>,
    pub queue: Arc<MemoryJobQueue>,
    pub scheduler: Arc<BackfillScheduler>,
    pub modules: Arc<ModuleRegistry>,
}

/// Composition root: builds the components once, wires them onto the bus, and
/// owns the background tasks until shutdown.
pub struct Runner {
    config: IndexerConfig,
    components: Components,
    shutdown: CancellationToken,
    fatal: FatalErrorHandler,
    handles: Vec<JoinHandle<()>>,
    started: bool,
    stopped: bool,
}

impl Runner {
    pub fn new(
        config: IndexerConfig,
        store: Arc<dyn IndexStore>,
        node: Arc<dyn NodeClient>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let telemetry = Arc::new(Telemetry::default());
        let bus = Arc::new(EventBus::with_telemetry(Arc::clone(&telemetry)));

        let indexer = Arc::new(BlockIndexer::new(
            Arc::clone(&store),
            Arc::clone(&node),
            Arc::clone(&bus),
            Arc::clone(&telemetry),
            config.fork_window_size(),
        ));
        let stats = Arc::new(IndexStatsCache::new(Arc::clone(&store), Arc::clone(&node)));
        let validators = Arc::new(ValidatorCache::new(
            Arc::clone(&store),
            Arc::clone(&node),
            Arc::clone(&telemetry),
            ValidatorCacheSettings::from_config(&config),
        ));
        let queue = Arc::new(MemoryJobQueue::with_telemetry(
            config.job_workers(),
            RetryPolicy::new(
                config.job_initial_backoff(),
                config.job_max_backoff(),
                config.job_max_attempts(),
            ),
            shutdown.child_token(),
            Arc::clone(&telemetry),
        ));
        let scheduler = Arc::new(
            BackfillScheduler::new(
                Arc::clone(&store),
                Arc::clone(&indexer),
                Arc::clone(&stats),
                Arc::clone(&queue) as Arc<dyn JobQueue>,
                Arc::clone(&telemetry),
                BackfillSettings::from_config(&config),
            )
            .with_validators(Arc::clone(&validators)),
        );
        let modules = Arc::new(ModuleRegistry::new(Arc::clone(&node)));

        Self {
            fatal: FatalErrorHandler::new(shutdown.clone()),
            config,
            components: Components {
                bus,
                store,
                node,
                telemetry,
                indexer,
                stats,
                validators,
                queue,
                scheduler,
                modules,
            },
            shutdown,
            handles: Vec::new(),
            started: false,
            stopped: false,
        }
    }

    /// Wires a JSON-RPC node client and an in-process store from `config`.
    pub fn from_config(config: IndexerConfig) -> Result<Self> {
        let options = NodeClientOptions {
            request_timeout: config.node_timeout(),
            ..NodeClientOptions::default()
        };
        let node = JsonRpcNodeClient::with_options(config.node_url(), options)
            .context("failed to build node client")?;
        Ok(Self::new(config, Arc::new(MemoryStore::new()), Arc::new(node)))
    }

    pub fn components(&self) -> &Components {
        &self.components
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    /// Root token; cancelling it stops every task the runner started.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn fatal_error(&self) -> Option<String> {
        self.fatal.error()
    }

    /// Discovers genesis, loads validators, attaches listeners, starts the
    /// workers and loops, and schedules the initial backfill.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        if self.stopped {
            bail!("runner cannot be restarted after stop");
        }

        let status = self.discover_genesis().await?;
        let c = &self.components;
        c.indexer.observe_network_status(&status);

        if c.modules
            .is_enabled(POS_MODULE)
            .await
            .context("failed to read registered modules")?
        {
            c.validators
                .bootstrap_from_node()
                .await
                .context("failed to seed validators")?;
        }
        c.validators
            .reload(ReloadReason::Startup)
            .await
            .context("failed to load validators")?;

        c.stats.attach(&c.bus);
        self.handles.push(c.indexer.attach(self.shutdown.child_token()));
        self.handles
            .push(c.validators.attach(&c.bus, self.shutdown.child_token()));
        self.handles
            .push(c.scheduler.attach(&c.bus, self.shutdown.child_token()));

        let indexer = Arc::clone(&c.indexer);
        let handler: JobHandler = Arc::new(move |job| {
            let indexer = Arc::clone(&indexer);
            Box::pin(async move { indexer.index_job(job).await.map_err(anyhow::Error::from) })
                as BoxFuture<'static, anyhow::Result<()>>
        });
        c.queue.process(handler)?;

        self.handles
            .push(c.scheduler.spawn_periodic(self.shutdown.child_token()));
        self.handles.push(
            c.validators
                .spawn_audit_loop(self.config.audit_interval(), self.shutdown.child_token()),
        );
        self.handles.push(spawn_metrics_reporter(
            Arc::clone(&c.telemetry),
            self.shutdown.child_token(),
            self.config.metrics_interval(),
        ));
        self.started = true;

        let report = c
            .scheduler
            .start()
            .await
            .context("initial backfill scheduling failed")?;
        tracing::info!(
            genesis = report.genesis_height,
            chain_height = report.chain_height,
            missing = report.missing.len(),
            "indexer started"
        );
        Ok(())
    }

    /// Cancels every task and waits for them to exit.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }

        self.shutdown.cancel();
        self.components.queue.shutdown().await;
        for handle in self.handles.drain(..) {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "runtime task join failed");
            }
        }
        self.started = false;
        self.stopped = true;
        tracing::info!("indexer stopped");
        Ok(())
    }

    /// Runs until Ctrl-C or until the root token is cancelled, e.g. by a fatal error.
    pub async fn run_until_ctrl_c(&mut self) -> Result<()> {
        self.start().await?;
        tracing::info!("runner started; waiting for Ctrl-C (SIGINT) to initiate shutdown");

        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("Ctrl-C received; shutting down runner");
            }
            _ = self.shutdown.cancelled() => {
                tracing::info!("runner shutdown token cancelled");
            }
        }

        self.stop().await?;
        match self.fatal.error() {
            Some(message) => bail!("runner stopped after fatal error: {message}"),
            None => Ok(()),
        }
    }

    async fn discover_genesis(&self) -> Result<NetworkStatus> {
        let policy = RetryPolicy::new(
            self.config.job_initial_backoff(),
            self.config.job_max_backoff(),
            self.config.genesis_max_attempts(),
        );
        let node = Arc::clone(&self.components.node);
        let result = retry_with_backoff(
            policy,
            &self.shutdown,
            |_| {
                let node = Arc::clone(&node);
                async move { node.get_network_status().await.map_err(anyhow::Error::from) }
            },
            |_| RetryDisposition::Retry,
            |attempt, delay, err, will_retry| {
                if will_retry {
                    tracing::warn!(
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        error = %err,
                        "genesis discovery failed; retrying"
                    );
                }
            },
        )
        .await;

        match result {
            Ok(status) => {
                tracing::info!(
                    genesis = status.genesis_height,
                    chain_height = status.height,
                    "genesis discovered"
                );
                Ok(status)
            }
            Err(err) => {
                let fatal = IndexerError::FatalIntegrity(format!(
                    "genesis height unavailable after {} attempts: {err:#}",
                    policy.max_attempts
                ));
                Err(self.fatal.trigger("genesis discovery", fatal.into()))
            }
        }
    }
}
