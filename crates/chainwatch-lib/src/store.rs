//! Event and chain persistence
//!
//! This module provides:
//! - The append-only [`EventStore`] boundary for verdicts, unclassified
//!   events and chain transitions
//! - An in-memory store and a JSON-lines file store
//! - [`StoreWriter`], an outbox in front of the store that retries failed
//!   appends in order (at-least-once delivery)

use crate::correlation::ChainTransition;
use crate::error::{CoreError, CoreResult};
use crate::health::{components, HealthRegistry};
use crate::models::{SecurityEvent, ThreatVerdict};
use crate::observability::EngineMetrics;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Default maximum outbox size (100,000 records)
pub const DEFAULT_MAX_OUTBOX: usize = 100_000;

/// Default bound on a single append (2 seconds)
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(2);

/// One append-only record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum StoreRecord {
    Verdict {
        event: SecurityEvent,
        verdict: ThreatVerdict,
    },
    Unclassified {
        event: SecurityEvent,
        reason: String,
    },
    ChainTransition(ChainTransition),
}

impl StoreRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            StoreRecord::Verdict { .. } => "verdict",
            StoreRecord::Unclassified { .. } => "unclassified",
            StoreRecord::ChainTransition(_) => "chain_transition",
        }
    }
}

/// Append-only persistence capability
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, record: &StoreRecord) -> CoreResult<()>;
}

/// Keeps records in memory; can be switched unavailable
#[derive(Default)]
pub struct MemoryEventStore {
    records: Mutex<Vec<StoreRecord>>,
    unavailable: AtomicBool,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub async fn records(&self) -> Vec<StoreRecord> {
        self.records.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, record: &StoreRecord) -> CoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CoreError::upstream("event_store", "store marked unavailable"));
        }
        self.records.lock().await.push(record.clone());
        Ok(())
    }
}

/// Appends one JSON document per line to a file
pub struct JsonlEventStore {
    path: PathBuf,
    file: Mutex<Option<tokio::fs::File>>,
}

impl JsonlEventStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn unavailable(&self, e: impl std::fmt::Display) -> CoreError {
        CoreError::upstream("event_store", format!("{}: {}", self.path.display(), e))
    }
}

#[async_trait]
impl EventStore for JsonlEventStore {
    async fn append(&self, record: &StoreRecord) -> CoreResult<()> {
        let mut line = serde_json::to_vec(record).map_err(|e| self.unavailable(e))?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        if file.is_none() {
            let opened = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| self.unavailable(e))?;
            *file = Some(opened);
        }

        let Some(handle) = file.as_mut() else {
            return Err(self.unavailable("file handle missing"));
        };
        let written = match handle.write_all(&line).await {
            Ok(()) => handle.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            // Reopen on the next append
            *file = None;
            return Err(self.unavailable(e));
        }
        Ok(())
    }
}

/// Outbox in front of an [`EventStore`]
///
/// Records that fail to append are retained and retried in order ahead of
/// newer records. When the outbox is full the oldest record is dropped.
/// The queue lock is never held across an append, and each append is
/// bounded by the writer's timeout.
pub struct StoreWriter {
    store: Arc<dyn EventStore>,
    outbox: StdMutex<VecDeque<StoreRecord>>,
    /// Held by the single task currently delivering
    delivery: Mutex<()>,
    max_outbox: usize,
    timeout: Duration,
    health: HealthRegistry,
    metrics: EngineMetrics,
}

impl StoreWriter {
    pub fn new(store: Arc<dyn EventStore>, health: HealthRegistry, metrics: EngineMetrics) -> Self {
        Self {
            store,
            outbox: StdMutex::new(VecDeque::new()),
            delivery: Mutex::new(()),
            max_outbox: DEFAULT_MAX_OUTBOX,
            timeout: DEFAULT_STORE_TIMEOUT,
            health,
            metrics,
        }
    }

    pub fn with_max_outbox(mut self, max_outbox: usize) -> Self {
        self.max_outbox = max_outbox.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<StoreRecord>> {
        self.outbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `record` and deliver everything pending
    ///
    /// When another task is already delivering, the record is left for it
    /// and this returns at once. An error means the record is retained for
    /// a later flush.
    pub async fn write(&self, record: StoreRecord) -> CoreResult<()> {
        {
            let mut outbox = self.queue();
            while outbox.len() >= self.max_outbox {
                if let Some(dropped) = outbox.pop_front() {
                    warn!(kind = dropped.kind(), "Event store outbox full, dropping oldest record");
                }
            }
            outbox.push_back(record);
        }
        let Ok(_delivering) = self.delivery.try_lock() else {
            return Ok(());
        };
        self.deliver().await.map(|_| ())
    }

    /// Retry pending records; returns how many were delivered
    pub async fn flush(&self) -> CoreResult<usize> {
        let _delivering = self.delivery.lock().await;
        if self.queue().is_empty() {
            return Ok(0);
        }
        self.deliver().await
    }

    pub fn pending(&self) -> usize {
        self.queue().len()
    }

    /// Caller holds the delivery lock
    async fn deliver(&self) -> CoreResult<usize> {
        let mut delivered = 0;
        loop {
            let Some(record) = self.queue().front().cloned() else {
                break;
            };
            let result = match tokio::time::timeout(self.timeout, self.store.append(&record)).await {
                Ok(result) => result,
                Err(_) => Err(CoreError::upstream(
                    "event_store",
                    format!("append timed out after {:?}", self.timeout),
                )),
            };
            match result {
                Ok(()) => {
                    let mut outbox = self.queue();
                    // The front can only have moved if the outbox overflowed meanwhile
                    if outbox.front() == Some(&record) {
                        outbox.pop_front();
                    }
                    delivered += 1;
                }
                Err(e) => {
                    let pending = self.pending();
                    self.metrics.inc_store_failures();
                    warn!(error = %e, pending, "Event store append failed, retaining in outbox");
                    self.health
                        .set_degraded(
                            components::EVENT_STORE,
                            format!("{} record(s) pending: {}", pending, e),
                        )
                        .await;
                    return Err(e);
                }
            }
        }
        if delivered > 0 {
            debug!(delivered, "Event store records delivered");
        }
        self.health.set_healthy(components::EVENT_STORE).await;
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::ComponentStatus;
    use crate::models::{ContextMap, Severity};
    use chrono::Utc;

    fn event(id: &str) -> SecurityEvent {
        SecurityEvent {
            id: id.to_string(),
            event_type: "port_scan".to_string(),
            source: "ids".to_string(),
            actor_id: "a".to_string(),
            asset_id: "h".to_string(),
            timestamp: Utc::now(),
            severity: Severity::Low,
            indicators: vec![],
            context: ContextMap::new(),
        }
    }

    fn record(id: &str) -> StoreRecord {
        StoreRecord::Unclassified {
            event: event(id),
            reason: "no signal".to_string(),
        }
    }

    #[tokio::test]
    async fn test_outbox_retries_in_order() {
        let store = Arc::new(MemoryEventStore::new());
        let health = HealthRegistry::new();
        let writer = StoreWriter::new(store.clone(), health.clone(), EngineMetrics::new());

        store.set_available(false);
        assert!(writer.write(record("e1")).await.is_err());
        assert!(writer.write(record("e2")).await.is_err());
        assert_eq!(writer.pending(), 2);
        assert_eq!(
            health.component(components::EVENT_STORE).await.unwrap().status,
            ComponentStatus::Degraded
        );

        store.set_available(true);
        assert_eq!(writer.flush().await.unwrap(), 2);
        assert_eq!(writer.pending(), 0);
        writer.write(record("e3")).await.unwrap();

        let ids: Vec<String> = store
            .records()
            .await
            .into_iter()
            .filter_map(|r| match r {
                StoreRecord::Unclassified { event, .. } => Some(event.id),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["e1", "e2", "e3"]);
        assert_eq!(
            health.component(components::EVENT_STORE).await.unwrap().status,
            ComponentStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_outbox_is_bounded() {
        let store = Arc::new(MemoryEventStore::new());
        store.set_available(false);
        let writer = StoreWriter::new(store.clone(), HealthRegistry::new(), EngineMetrics::new())
            .with_max_outbox(2);
        for id in ["e1", "e2", "e3"] {
            let _ = writer.write(record(id)).await;
        }
        assert_eq!(writer.pending(), 2);
    }

    struct StalledStore;

    #[async_trait]
    impl EventStore for StalledStore {
        async fn append(&self, _record: &StoreRecord) -> CoreResult<()> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_stalled_append_times_out_and_is_retained() {
        let health = HealthRegistry::new();
        let writer = Arc::new(
            StoreWriter::new(Arc::new(StalledStore), health.clone(), EngineMetrics::new())
                .with_timeout(Duration::from_millis(50)),
        );

        let err = writer.write(record("e1")).await.unwrap_err();
        assert!(matches!(err, CoreError::UpstreamUnavailable { .. }));
        assert_eq!(writer.pending(), 1);
        assert_eq!(
            health.component(components::EVENT_STORE).await.unwrap().status,
            ComponentStatus::Degraded
        );

        // A writer arriving mid-delivery enqueues and returns at once
        let delivering = {
            let writer = writer.clone();
            tokio::spawn(async move { writer.flush().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let queued = tokio::time::timeout(Duration::from_millis(20), writer.write(record("e2")))
            .await
            .expect("write should not wait for the delivering task");
        assert!(queued.is_ok());
        assert!(delivering.await.unwrap().is_err());
        assert_eq!(writer.pending(), 2);
    }

    #[tokio::test]
    async fn test_jsonl_store_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let store = JsonlEventStore::new(&path);
        store.append(&record("e1")).await.unwrap();
        store.append(&record("e2")).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: StoreRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed.kind(), "unclassified");
        assert!(lines[0].contains(r#""record":"unclassified""#));
    }

    #[tokio::test]
    async fn test_jsonl_store_reports_unwritable_path() {
        let store = JsonlEventStore::new("/nonexistent/dir/events.jsonl");
        let err = store.append(&record("e1")).await.unwrap_err();
        assert!(matches!(err, CoreError::UpstreamUnavailable { .. }));
    }
}
