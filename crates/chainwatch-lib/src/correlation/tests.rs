//! Chain lifecycle scenarios

use super::*;
use crate::health::HealthRegistry;
use crate::models::{ContextMap, SecurityEvent, Severity, ThreatVerdict};
use crate::observability::{EngineMetrics, StructuredLogger};
use crate::profiler::BehaviorProfiler;
use crate::store::{MemoryEventStore, StoreRecord, StoreWriter};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

fn t0() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
}

fn event(id: &str, event_type: &str, indicators: &[&str], at: DateTime<Utc>) -> SecurityEvent {
    keyed_event(id, "actor-a", "web-01", event_type, indicators, at)
}

fn keyed_event(
    id: &str,
    actor: &str,
    asset: &str,
    event_type: &str,
    indicators: &[&str],
    at: DateTime<Utc>,
) -> SecurityEvent {
    SecurityEvent {
        id: id.to_string(),
        event_type: event_type.to_string(),
        source: "ids".to_string(),
        actor_id: actor.to_string(),
        asset_id: asset.to_string(),
        timestamp: at,
        severity: Severity::High,
        indicators: indicators.iter().map(|s| s.to_string()).collect(),
        context: ContextMap::new(),
    }
}

fn verdict(event_id: &str, category: &str, risk: f32, confidence: f32) -> ThreatVerdict {
    ThreatVerdict {
        event_id: event_id.to_string(),
        threat_category: category.to_string(),
        risk_score: risk,
        confidence,
        contributing_models: vec!["threat-classifier".to_string()],
        anomaly_score: 0.2,
        similar_threats: vec![],
        reduced_confidence: false,
        unavailable_signals: vec![],
        classified_at: Utc::now(),
    }
}

fn engine_with(config: CorrelationConfig) -> (Arc<CorrelationEngine>, UnboundedReceiver<ChainAlert>) {
    let (alerts, rx) = ChannelAlertDispatcher::new();
    let engine = CorrelationEngine::new(
        RuleSet::default(),
        config,
        Arc::new(alerts),
        StructuredLogger::new("test"),
        EngineMetrics::new(),
    );
    (Arc::new(engine), rx)
}

fn engine() -> (Arc<CorrelationEngine>, UnboundedReceiver<ChainAlert>) {
    engine_with(CorrelationConfig::default())
}

async fn recon(engine: &CorrelationEngine, id: &str, at: DateTime<Utc>) -> CorrelationReport {
    let ev = event(id, "port_scan", &["T1595"], at);
    engine.correlate(&verdict(id, "reconnaissance", 6.0, 0.8), &ev).await
}

async fn exploit(engine: &CorrelationEngine, id: &str, at: DateTime<Utc>) -> CorrelationReport {
    let ev = event(id, "exploit_attempt", &["T1190"], at);
    engine.correlate(&verdict(id, "execution", 6.0, 0.8), &ev).await
}

#[tokio::test]
async fn test_recon_then_exploit_extends_chain() {
    let (engine, _rx) = engine();
    let opened = recon(&engine, "e1", t0()).await;
    assert_eq!(opened.outcome, CorrelationOutcome::Opened);
    let chain_id = opened.chain_id.unwrap();
    let before = engine.get_chain(&chain_id).unwrap().confidence;

    let extended = exploit(&engine, "e2", t0() + Duration::minutes(5)).await;
    assert_eq!(extended.outcome, CorrelationOutcome::Extended { stage: 2 });
    assert_eq!(extended.chain_id.as_deref(), Some(chain_id.as_str()));

    let chain = engine.get_chain(&chain_id).unwrap();
    assert_eq!(chain.stages.len(), 2);
    assert_eq!(chain.stages[1].tactic, "initial-access");
    assert!(chain.confidence > before);
    assert_eq!(chain.status, ChainStatus::Open);
    assert_eq!(chain.rule_id, "recon-to-initial-access");
}

#[tokio::test]
async fn test_gap_beyond_max_times_out_chain() {
    let (engine, mut rx) = engine();
    let chain_id = recon(&engine, "e1", t0()).await.chain_id.unwrap();

    let late = exploit(&engine, "e2", t0() + Duration::minutes(15)).await;
    let resolved: Vec<_> = late
        .transitions
        .iter()
        .filter(|t| t.kind == TransitionKind::TimedOut)
        .collect();
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].chain.id, chain_id);

    let chain = engine.get_chain(&chain_id).unwrap();
    assert_eq!(chain.status, ChainStatus::Resolved);
    assert_eq!(chain.close_reason, Some(CloseReason::TimedOut));
    assert_eq!(chain.stages.len(), 1);
    assert!(engine.get_open_chains(Some("actor-a"), None).is_empty());

    let alert = rx.recv().await.unwrap();
    assert_eq!(alert.chain_id, chain_id);
    assert_eq!(alert.severity, AlertSeverity::Warning);
}

#[tokio::test]
async fn test_escalated_chain_times_out_as_escalated() {
    let (engine, _rx) = engine();
    let ev = event("e1", "port_scan", &["T1595"], t0());
    let opened = engine
        .correlate(&verdict("e1", "reconnaissance", 10.0, 1.0), &ev)
        .await;
    let chain_id = opened.chain_id.unwrap();
    assert_eq!(engine.get_chain(&chain_id).unwrap().status, ChainStatus::Escalated);

    let late = exploit(&engine, "e2", t0() + Duration::minutes(15)).await;
    let closing = late
        .transitions
        .iter()
        .find(|t| t.chain.id == chain_id)
        .unwrap();
    assert_eq!(closing.kind, TransitionKind::TimedOut);

    let chain = engine.get_chain(&chain_id).unwrap();
    assert_eq!(chain.status, ChainStatus::Escalated);
    assert_eq!(chain.close_reason, Some(CloseReason::TimedOut));
    assert!(!chain.is_active());
    assert!(engine
        .get_open_chains(Some("actor-a"), None)
        .iter()
        .all(|c| c.id != chain_id));
}

#[tokio::test]
async fn test_late_event_does_not_become_next_stage() {
    let (engine, _rx) = engine();
    let chain_id = recon(&engine, "e1", t0()).await.chain_id.unwrap();

    let report = exploit(&engine, "e2", t0() - Duration::hours(1)).await;
    assert_eq!(report.outcome, CorrelationOutcome::WeakLink);

    let chain = engine.get_chain(&chain_id).unwrap();
    assert_eq!(chain.stages.len(), 1);
    assert_eq!(chain.weak_links[0].event_id, "e2");

    // In order, the same technique still advances the chain
    let report = exploit(&engine, "e3", t0() + Duration::minutes(2)).await;
    assert_eq!(report.outcome, CorrelationOutcome::Extended { stage: 2 });
    let chain = engine.get_chain(&chain_id).unwrap();
    assert!(chain.stages[0].started_at <= chain.stages[1].started_at);
}

#[tokio::test]
async fn test_terminal_stage_completes_chain() {
    let (engine, mut rx) = engine();
    let chain_id = recon(&engine, "e1", t0()).await.chain_id.unwrap();
    exploit(&engine, "e2", t0() + Duration::minutes(5)).await;

    let ev = event("e3", "custom_action", &["T1059.001"], t0() + Duration::minutes(20));
    let report = engine
        .correlate(&verdict("e3", "execution", 9.0, 0.9), &ev)
        .await;
    assert_eq!(report.outcome, CorrelationOutcome::Extended { stage: 3 });

    let chain = engine.get_chain(&chain_id).unwrap();
    assert_eq!(chain.status, ChainStatus::Resolved);
    assert_eq!(chain.close_reason, Some(CloseReason::Completed));
    assert_eq!(chain.stages[2].techniques, vec!["T1059.001"]);
    let numbers: Vec<u32> = chain.stages.iter().map(|s| s.stage_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);

    let mut last = None;
    while let Ok(alert) = rx.try_recv() {
        last = Some(alert);
    }
    assert_eq!(last.unwrap().severity, AlertSeverity::Critical);
}

#[tokio::test]
async fn test_confidence_is_monotonic_and_escalates() {
    let (engine, _rx) = engine();
    let chain_id = recon(&engine, "e1", t0()).await.chain_id.unwrap();
    let mut previous = engine.get_chain(&chain_id).unwrap().confidence;

    // Lower-risk events absorbed into the current stage never lower confidence
    for (i, minutes) in [1, 2].into_iter().enumerate() {
        let id = format!("r{}", i);
        let ev = event(&id, "port_scan", &["T1595"], t0() + Duration::minutes(minutes));
        let report = engine
            .correlate(&verdict(&id, "reconnaissance", 2.0, 0.5), &ev)
            .await;
        assert_eq!(report.outcome, CorrelationOutcome::Absorbed { stage: 1 });
        let confidence = engine.get_chain(&chain_id).unwrap().confidence;
        assert!(confidence >= previous);
        previous = confidence;
    }

    let ev = event("e2", "exploit_attempt", &["T1190"], t0() + Duration::minutes(4));
    let report = engine
        .correlate(&verdict("e2", "execution", 10.0, 1.0), &ev)
        .await;
    assert!(report
        .transitions
        .iter()
        .any(|t| t.kind == TransitionKind::Escalated));

    let chain = engine.get_chain(&chain_id).unwrap();
    assert!(chain.confidence > previous);
    assert!(chain.confidence >= engine.config().escalation_threshold);
    assert_eq!(chain.status, ChainStatus::Escalated);
    assert_eq!(engine.get_open_chains(None, Some("web-01")).len(), 1);
}

#[tokio::test]
async fn test_non_matching_high_risk_event_is_weak_link() {
    let (engine, _rx) = engine();
    let chain_id = recon(&engine, "e1", t0()).await.chain_id.unwrap();

    let ev = event("w1", "file_write", &["T1486"], t0() + Duration::minutes(1));
    let report = engine.correlate(&verdict("w1", "execution", 7.0, 0.9), &ev).await;
    assert_eq!(report.outcome, CorrelationOutcome::WeakLink);

    let ev = event("w2", "file_write", &[], t0() + Duration::minutes(2));
    let report = engine.correlate(&verdict("w2", "benign", 1.0, 0.9), &ev).await;
    assert_eq!(report.outcome, CorrelationOutcome::Ignored);

    let chain = engine.get_chain(&chain_id).unwrap();
    assert_eq!(chain.weak_links.len(), 1);
    assert_eq!(chain.weak_links[0].tactics, vec!["impact"]);
}

#[tokio::test]
async fn test_duplicate_and_benign_events() {
    let (engine, _rx) = engine();
    recon(&engine, "e1", t0()).await;
    assert_eq!(
        recon(&engine, "e1", t0()).await.outcome,
        CorrelationOutcome::Duplicate
    );

    let ev = keyed_event("b1", "actor-b", "db-01", "port_scan", &["T1595"], t0());
    let report = engine.correlate(&verdict("b1", "benign", 0.5, 0.9), &ev).await;
    assert_eq!(report.outcome, CorrelationOutcome::Ignored);
    assert!(engine.get_open_chains(Some("actor-b"), None).is_empty());
}

#[tokio::test]
async fn test_distinct_keys_correlate_independently() {
    let (engine, _rx) = engine();
    let mut handles = Vec::new();
    for k in 0..16 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let actor = format!("actor-{}", k);
            let first = keyed_event(&format!("{}-1", k), &actor, "host", "port_scan", &["T1595"], t0());
            let second = keyed_event(
                &format!("{}-2", k),
                &actor,
                "host",
                "exploit_attempt",
                &["T1190"],
                t0() + Duration::minutes(3),
            );
            engine
                .correlate(&verdict(&first.id, "reconnaissance", 6.0, 0.8), &first)
                .await;
            engine
                .correlate(&verdict(&second.id, "execution", 6.0, 0.8), &second)
                .await
        }));
    }
    for handle in handles {
        let report = handle.await.unwrap();
        assert_eq!(report.outcome, CorrelationOutcome::Extended { stage: 2 });
    }

    let chains = engine.get_open_chains(None, None);
    assert_eq!(chains.len(), 16);
    for chain in chains {
        assert_eq!(chain.stages.len(), 2);
        let prefix = format!("{}-", chain.actor_id.trim_start_matches("actor-"));
        assert!(chain.stages.iter().all(|s| s.event_ids[0].starts_with(&prefix)));
    }
}

#[tokio::test]
async fn test_lock_timeout_defers_weak_link() {
    let config = CorrelationConfig {
        lock_timeout: std::time::Duration::from_millis(5),
        ..CorrelationConfig::default()
    };
    let (engine, _rx) = engine_with(config);
    let chain_id = recon(&engine, "e1", t0()).await.chain_id.unwrap();

    let slot = engine.slot(&ChainKey::new("actor-a", "web-01"));
    let held = slot.lock_owned().await;

    let ev = event("w1", "file_write", &[], t0() + Duration::minutes(1));
    let report = engine.correlate(&verdict("w1", "execution", 8.0, 0.9), &ev).await;
    assert_eq!(report.outcome, CorrelationOutcome::Deferred);

    // Below the weak-link floor, still kept as a candidate
    let ev = event("w2", "file_write", &[], t0() + Duration::minutes(1));
    let report = engine.correlate(&verdict("w2", "execution", 1.0, 0.9), &ev).await;
    assert_eq!(report.outcome, CorrelationOutcome::Deferred);
    assert_eq!(engine.deferred_len(), 2);
    drop(held);

    let sweep = engine.sweep(t0() + Duration::minutes(2)).await;
    assert_eq!(sweep.weak_links_attached, 2);
    assert_eq!(engine.deferred_len(), 0);
    let chain = engine.get_chain(&chain_id).unwrap();
    let ids: Vec<&str> = chain.weak_links.iter().map(|w| w.event_id.as_str()).collect();
    assert_eq!(ids, vec!["w1", "w2"]);
}

#[tokio::test]
async fn test_sweep_expires_stale_chains_and_drops_slots() {
    let (engine, _rx) = engine();
    let chain_id = recon(&engine, "e1", t0()).await.chain_id.unwrap();

    let early = engine.sweep(t0() + Duration::minutes(5)).await;
    assert_eq!(early.expired, 0);
    assert_eq!(engine.tracked_keys(), 1);

    let late = engine.sweep(t0() + Duration::minutes(11)).await;
    assert_eq!(late.expired, 1);
    assert_eq!(late.slots_removed, 1);
    assert_eq!(engine.tracked_keys(), 0);
    assert_eq!(
        engine.get_chain(&chain_id).unwrap().close_reason,
        Some(CloseReason::TimedOut)
    );
}

#[tokio::test]
async fn test_manual_resolution() {
    let (engine, mut rx) = engine();
    let chain_id = recon(&engine, "e1", t0()).await.chain_id.unwrap();

    let (chain, transition) = engine.resolve_chain(&chain_id, false).await.unwrap();
    assert_eq!(transition.unwrap().kind, TransitionKind::Resolved);
    assert_eq!(chain.status, ChainStatus::Resolved);
    assert_eq!(chain.close_reason, Some(CloseReason::Manual));
    assert!(engine.get_open_chains(None, None).is_empty());

    let (again, transition) = engine.resolve_chain(&chain_id, false).await.unwrap();
    assert_eq!(again.status, ChainStatus::Resolved);
    assert!(transition.is_none());

    let (marked, transition) = engine.resolve_chain(&chain_id, true).await.unwrap();
    assert_eq!(transition.unwrap().kind, TransitionKind::FalsePositive);
    assert_eq!(marked.status, ChainStatus::FalsePositive);
    assert_eq!(
        engine.get_chain(&chain_id).unwrap().status,
        ChainStatus::FalsePositive
    );

    assert!(matches!(
        engine.resolve_chain("chain-missing", false).await,
        Err(crate::error::CoreError::ChainNotFound(_))
    ));

    let statuses: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
        .map(|a| a.status)
        .collect();
    assert_eq!(statuses, vec![ChainStatus::Resolved, ChainStatus::FalsePositive]);
}

#[tokio::test]
async fn test_new_chain_opens_after_timeout() {
    let (engine, _rx) = engine();
    let first = recon(&engine, "e1", t0()).await.chain_id.unwrap();
    let report = recon(&engine, "e2", t0() + Duration::hours(1)).await;
    assert_eq!(report.outcome, CorrelationOutcome::Opened);
    let second = report.chain_id.unwrap();
    assert_ne!(first, second);
    assert_eq!(engine.get_open_chains(Some("actor-a"), Some("web-01")).len(), 1);
}

#[tokio::test]
async fn test_sharded_correlator_preserves_key_order() {
    let (engine, _rx) = engine();
    let (shutdown, _) = tokio::sync::broadcast::channel(1);
    let (correlator, handles) = ShardedCorrelator::spawn(engine.clone(), &shutdown);
    assert_eq!(correlator.shard_count(), engine.config().shards);

    let first = event("e1", "port_scan", &["T1595"], t0());
    let second = event("e2", "exploit_attempt", &["T1190"], t0() + Duration::minutes(2));
    let opened = correlator
        .submit(verdict("e1", "reconnaissance", 6.0, 0.8), first)
        .await
        .unwrap();
    let extended = correlator
        .submit(verdict("e2", "execution", 6.0, 0.8), second)
        .await
        .unwrap();
    assert_eq!(opened.outcome, CorrelationOutcome::Opened);
    assert_eq!(extended.outcome, CorrelationOutcome::Extended { stage: 2 });

    shutdown.send(()).unwrap();
    for handle in handles {
        handle.await.unwrap();
    }
    let after = event("e3", "port_scan", &[], t0());
    assert!(correlator
        .submit(verdict("e3", "reconnaissance", 6.0, 0.8), after)
        .await
        .is_err());
}

#[tokio::test]
async fn test_maintenance_persists_expirations() {
    let (engine, _rx) = engine();
    let store = Arc::new(MemoryEventStore::new());
    let writer = Arc::new(StoreWriter::new(
        store.clone(),
        HealthRegistry::new(),
        EngineMetrics::new(),
    ));
    let worker = MaintenanceWorker::new(
        engine.clone(),
        Arc::new(BehaviorProfiler::default()),
        writer,
        HealthRegistry::new(),
    );

    // Event time far in the past, so the wall-clock sweep expires it
    recon(&engine, "e1", t0()).await;
    let report = worker.run_once().await;
    assert_eq!(report.chains_expired, 1);

    let records = store.records().await;
    assert_eq!(records.len(), 1);
    assert!(matches!(
        &records[0],
        StoreRecord::ChainTransition(t) if t.kind == TransitionKind::TimedOut
    ));
}
