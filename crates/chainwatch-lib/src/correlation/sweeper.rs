//! Periodic maintenance
//!
//! Closes chains whose next stage never arrived in wall-clock time,
//! attaches deferred weak links, evicts idle actor profiles and retries the
//! event store outbox.

use super::engine::CorrelationEngine;
use crate::health::{components, HealthRegistry};
use crate::profiler::BehaviorProfiler;
use crate::store::{StoreRecord, StoreWriter};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Outcome of one maintenance pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaintenanceReport {
    pub chains_expired: usize,
    pub weak_links_attached: usize,
    pub actors_evicted: usize,
    pub records_flushed: usize,
}

pub struct MaintenanceWorker {
    engine: Arc<CorrelationEngine>,
    profiler: Arc<BehaviorProfiler>,
    store: Arc<StoreWriter>,
    health: HealthRegistry,
    interval: Duration,
}

impl MaintenanceWorker {
    pub fn new(
        engine: Arc<CorrelationEngine>,
        profiler: Arc<BehaviorProfiler>,
        store: Arc<StoreWriter>,
        health: HealthRegistry,
    ) -> Self {
        let interval = engine.config().sweep_interval;
        Self {
            engine,
            profiler,
            store,
            health,
            interval,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run until shutdown, then flush the outbox one last time
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting maintenance worker"
        );

        let mut ticker = interval(self.interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                _ = shutdown.recv() => {
                    if let Err(e) = self.store.flush().await {
                        warn!(
                            error = %e,
                            pending = self.store.pending(),
                            "Event store unavailable at shutdown, records not persisted"
                        );
                    }
                    info!("Shutting down maintenance worker");
                    break;
                }
            }
        }
    }

    pub async fn run_once(&self) -> MaintenanceReport {
        let now = Utc::now();
        let sweep = self.engine.sweep(now).await;
        for transition in sweep.transitions {
            // Failed writes stay in the outbox
            let _ = self
                .store
                .write(StoreRecord::ChainTransition(transition))
                .await;
        }

        let actors_evicted = self.profiler.evict_idle(now);
        let records_flushed = self.store.flush().await.unwrap_or(0);

        self.health.set_healthy(components::CORRELATION).await;

        let report = MaintenanceReport {
            chains_expired: sweep.expired,
            weak_links_attached: sweep.weak_links_attached,
            actors_evicted,
            records_flushed,
        };
        debug!(
            chains_expired = report.chains_expired,
            weak_links_attached = report.weak_links_attached,
            actors_evicted = report.actors_evicted,
            records_flushed = report.records_flushed,
            slots_removed = sweep.slots_removed,
            "Maintenance pass complete"
        );
        report
    }
}
