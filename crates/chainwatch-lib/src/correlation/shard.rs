//! Sharded correlation stream
//!
//! Events are routed to one of N workers by hash of their chain key, so all
//! events for a key are correlated in arrival order while distinct keys
//! proceed in parallel.

use super::chain::ChainKey;
use super::engine::{CorrelationEngine, CorrelationReport};
use crate::error::{CoreError, CoreResult};
use crate::models::{SecurityEvent, ThreatVerdict};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

struct CorrelationJob {
    verdict: ThreatVerdict,
    event: SecurityEvent,
    reply: oneshot::Sender<CorrelationReport>,
}

pub struct ShardedCorrelator {
    senders: Vec<mpsc::Sender<CorrelationJob>>,
}

impl ShardedCorrelator {
    /// Start one worker per configured shard
    pub fn spawn(
        engine: Arc<CorrelationEngine>,
        shutdown: &broadcast::Sender<()>,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let shards = engine.config().shards.max(1);
        let capacity = engine.config().shard_capacity.max(1);
        let mut senders = Vec::with_capacity(shards);
        let mut handles = Vec::with_capacity(shards);

        for index in 0..shards {
            let (tx, rx) = mpsc::channel(capacity);
            senders.push(tx);
            handles.push(tokio::spawn(run_shard(
                index,
                engine.clone(),
                rx,
                shutdown.subscribe(),
            )));
        }
        info!(shards, capacity, "Started correlation shards");
        (Self { senders }, handles)
    }

    pub fn shard_count(&self) -> usize {
        self.senders.len()
    }

    pub fn shard_for(&self, key: &ChainKey) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.senders.len() as u64) as usize
    }

    /// Correlate on the key's shard and wait for the result
    pub async fn submit(
        &self,
        verdict: ThreatVerdict,
        event: SecurityEvent,
    ) -> CoreResult<CorrelationReport> {
        let key = ChainKey::new(&event.actor_id, &event.asset_id);
        let shard = self.shard_for(&key);
        let (reply, rx) = oneshot::channel();

        self.senders[shard]
            .send(CorrelationJob {
                verdict,
                event,
                reply,
            })
            .await
            .map_err(|_| CoreError::upstream("correlation", format!("shard {} stopped", shard)))?;

        rx.await
            .map_err(|_| CoreError::upstream("correlation", format!("shard {} dropped the event", shard)))
    }
}

async fn run_shard(
    index: usize,
    engine: Arc<CorrelationEngine>,
    mut rx: mpsc::Receiver<CorrelationJob>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            job = rx.recv() => match job {
                Some(job) => process(&engine, job).await,
                None => break,
            },
            _ = shutdown.recv() => {
                rx.close();
                let mut drained = 0usize;
                while let Some(job) = rx.recv().await {
                    process(&engine, job).await;
                    drained += 1;
                }
                info!(shard = index, drained, "Correlation shard drained");
                break;
            }
        }
    }
}

async fn process(engine: &CorrelationEngine, job: CorrelationJob) {
    let report = engine.correlate(&job.verdict, &job.event).await;
    if job.reply.send(report).is_err() {
        debug!(event_id = %job.event.id, "Submitter went away before correlation finished");
    }
}
