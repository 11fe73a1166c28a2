use super::ValidatorCache;
use crate::bus::ReloadReason;
use crate::error::IndexerResult;
use crate::model::GeneratorTally;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOutcome {
    Consistent { eligible: usize },
    /// The cached eligible order diverged from the store and was reloaded.
    Reloaded { cached: usize, authoritative: usize },
    /// Cached block counters diverged from the generator tallies and were reloaded.
    CountersDrifted { drifted: usize },
}

impl ValidatorCache {
    /// Compares the cached eligible ordering and block counters with the store's.
    /// A mismatch triggers exactly one full reload and no incremental repair.
    pub async fn audit(&self) -> IndexerResult<AuditOutcome> {
        self.telemetry.record_audit();

        let outcome = {
            let _guard = self.write_lock.lock().await;
            let authoritative = self
                .store
                .eligible_validators(self.settings.min_eligible_weight.clone())
                .await?;
            let tallies = self.store.generator_tallies().await?;
            let snapshot = self.snapshot();

            let cached: Vec<&str> = snapshot
                .iter()
                .filter(|validator| self.settings.is_eligible(validator))
                .map(|validator| validator.address.as_str())
                .collect();
            let expected: Vec<&str> = authoritative
                .iter()
                .map(|validator| validator.address.as_str())
                .collect();
            let empty = GeneratorTally::default();
            let drifted = snapshot
                .iter()
                .filter(|validator| {
                    let tally = tallies.get(&validator.address).unwrap_or(&empty);
                    validator.produced_blocks != tally.produced_blocks
                        || validator.rewards != tally.rewards
                })
                .count();

            if cached != expected {
                AuditOutcome::Reloaded {
                    cached: cached.len(),
                    authoritative: expected.len(),
                }
            } else if drifted > 0 {
                AuditOutcome::CountersDrifted { drifted }
            } else {
                AuditOutcome::Consistent {
                    eligible: cached.len(),
                }
            }
        };

        if let AuditOutcome::Consistent { eligible } = outcome {
            tracing::debug!(eligible, "validator audit consistent");
            return Ok(outcome);
        }

        tracing::warn!(?outcome, "validator cache diverged from store; reloading");
        self.telemetry.record_audit_mismatch();
        self.reload(ReloadReason::AuditMismatch).await?;
        Ok(outcome)
    }

    /// Runs [`ValidatorCache::audit`] every `interval` until `shutdown` fires.
    pub fn spawn_audit_loop(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("validator audit loop shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = cache.audit().await {
                            tracing::warn!(error = %err, "validator audit failed");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::telemetry::Telemetry;
    use crate::store::{IndexStore, MemoryStore};
    use crate::model::{AppliedBlock, IndexedBlock};
    use crate::testing::{eventually, node_validator, raw_block, StubNode, BLOCK_REWARD};
    use crate::validators::ValidatorCacheSettings;
    use num_bigint::BigUint;

    async fn loaded_cache(store: Arc<MemoryStore>, telemetry: Arc<Telemetry>) -> Arc<ValidatorCache> {
        let node = Arc::new(StubNode::new());
        node.set_status(0, 10, 0);
        node.put_validator(node_validator("lska", 7_000));
        node.put_validator(node_validator("lskb", 5_000));
        node.put_validator(node_validator("lskc", 10));
        let cache = Arc::new(ValidatorCache::new(
            store,
            node,
            telemetry,
            ValidatorCacheSettings {
                active_validators: 1,
                min_eligible_weight: BigUint::from(1_000u32),
                patch_concurrency: 2,
            },
        ));
        cache.bootstrap_from_node().await.unwrap();
        cache.reload(ReloadReason::Startup).await.unwrap();
        cache
    }

    #[tokio::test]
    async fn consistent_cache_is_left_alone() {
        let telemetry = Arc::new(Telemetry::default());
        let cache = loaded_cache(Arc::new(MemoryStore::new()), telemetry.clone()).await;

        assert_eq!(
            cache.audit().await.unwrap(),
            AuditOutcome::Consistent { eligible: 2 }
        );
        assert_eq!(cache.reload_count(), 1);
        assert_eq!(telemetry.snapshot().audit_mismatches, 0);
    }

    #[tokio::test]
    async fn swapped_order_triggers_exactly_one_reload() {
        let store = Arc::new(MemoryStore::new());
        let telemetry = Arc::new(Telemetry::default());
        let cache = loaded_cache(store.clone(), telemetry.clone()).await;

        let mut lskb = store.validator("lskb").await.unwrap().unwrap();
        lskb.weight = BigUint::from(9_000u32);
        store.upsert_validators(vec![lskb]).await.unwrap();

        assert_eq!(
            cache.audit().await.unwrap(),
            AuditOutcome::Reloaded {
                cached: 2,
                authoritative: 2
            }
        );
        assert_eq!(cache.reload_count(), 2);
        assert_eq!(cache.patch_count(), 0);
        assert_eq!(cache.snapshot()[0].address, "lskb");
        assert_eq!(telemetry.snapshot().audit_mismatches, 1);

        assert!(matches!(
            cache.audit().await.unwrap(),
            AuditOutcome::Consistent { .. }
        ));
        assert_eq!(cache.reload_count(), 2);
    }

    #[tokio::test]
    async fn counters_behind_the_store_are_reloaded() {
        let store = Arc::new(MemoryStore::new());
        let telemetry = Arc::new(Telemetry::default());
        let cache = loaded_cache(store.clone(), telemetry.clone()).await;

        let (block, transactions) = raw_block(4, 1).normalize().unwrap();
        let mut block = block;
        block.generator_address = "lska".into();
        let write = store
            .apply_block(block.clone(), transactions.clone())
            .await
            .unwrap();
        store.fail_next_writes(1);
        let applied = AppliedBlock {
            indexed: IndexedBlock {
                block,
                transactions,
            },
            write,
        };
        assert!(cache.on_block_applied(&applied).await.is_err());
        assert_eq!(cache.get("lska").unwrap().produced_blocks, 0);

        assert_eq!(
            cache.audit().await.unwrap(),
            AuditOutcome::CountersDrifted { drifted: 1 }
        );
        let lska = cache.get("lska").unwrap();
        assert_eq!(lska.produced_blocks, 1);
        assert_eq!(lska.rewards, BigUint::from(BLOCK_REWARD));
        assert_eq!(
            store.validator("lska").await.unwrap().unwrap().produced_blocks,
            1
        );
        assert_eq!(telemetry.snapshot().audit_mismatches, 1);
        assert!(matches!(
            cache.audit().await.unwrap(),
            AuditOutcome::Consistent { .. }
        ));
    }

    #[tokio::test]
    async fn audit_loop_runs_until_shutdown() {
        let telemetry = Arc::new(Telemetry::default());
        let cache = loaded_cache(Arc::new(MemoryStore::new()), telemetry.clone()).await;
        let shutdown = CancellationToken::new();
        let handle = cache.spawn_audit_loop(Duration::from_millis(10), shutdown.clone());

        eventually(|| {
            let telemetry = telemetry.clone();
            async move { telemetry.snapshot().audits_run >= 2 }
        })
        .await;
        shutdown.cancel();
        handle.await.unwrap();
    }
}
