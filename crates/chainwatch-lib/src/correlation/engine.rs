//! Correlation engine
//!
//! Maintains at most one active attack chain per (actor, asset) key. Each
//! key has its own async lock, acquired with a timeout, so events on
//! distinct keys never contend. Chain state is advanced on event time; the
//! sweeper closes chains whose next stage never arrives in wall-clock time.
//!
//! State machine:
//!
//! ```text
//! open --stage match--> open
//! open --confidence >= threshold--> escalated
//! open|escalated --terminal match--> resolved (completed)
//! open|escalated --max gap elapsed--> resolved (timed out)
//! open|escalated --operator--> resolved | false_positive
//! ```

use super::alerter::{AlertDispatcher, ChainAlert};
use super::chain::{
    AttackChain, ChainKey, ChainStatus, ChainTransition, CloseReason, TransitionKind, WeakLink,
};
use super::mitre::{TechniqueHit, TechniqueMapper};
use super::rules::{CorrelationRule, RuleSet};
use crate::error::{CoreError, CoreResult};
use crate::models::{SecurityEvent, ThreatVerdict};
use crate::observability::{EngineMetrics, StructuredLogger};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// Configuration for the correlation engine
#[derive(Debug, Clone)]
pub struct CorrelationConfig {
    /// Chain confidence at which an open chain escalates
    pub escalation_threshold: f64,
    /// Minimum risk for a non-matching event to be kept as a weak link
    pub weak_link_floor: f32,
    /// Minimum risk for an event to open or extend a chain
    pub min_stage_risk: f32,
    pub lock_timeout: Duration,
    pub max_weak_links: usize,
    /// Closed chains kept for lookup
    pub closed_retention: usize,
    /// Correlation stream partitions
    pub shards: usize,
    pub shard_capacity: usize,
    pub sweep_interval: Duration,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            escalation_threshold: 0.8,
            weak_link_floor: 4.0,
            min_stage_risk: 1.0,
            lock_timeout: Duration::from_millis(50),
            max_weak_links: 64,
            closed_retention: 1024,
            shards: 4,
            shard_capacity: 1024,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// What correlating one event did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CorrelationOutcome {
    Opened,
    Extended { stage: u32 },
    /// Folded into the chain's current stage
    Absorbed { stage: u32 },
    WeakLink,
    /// Event already part of the chain
    Duplicate,
    Ignored,
    /// Chain lock unavailable; kept as a weak link for the sweeper to attach
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationReport {
    pub outcome: CorrelationOutcome,
    pub chain_id: Option<String>,
    pub transitions: Vec<ChainTransition>,
}

impl CorrelationReport {
    fn new(outcome: CorrelationOutcome) -> Self {
        Self {
            outcome,
            chain_id: None,
            transitions: Vec::new(),
        }
    }
}

/// Result of one maintenance sweep
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub transitions: Vec<ChainTransition>,
    pub expired: usize,
    pub weak_links_attached: usize,
    pub weak_links_dropped: usize,
    pub slots_removed: usize,
}

type Slot = Arc<AsyncMutex<Option<AttackChain>>>;

pub struct CorrelationEngine {
    rules: RuleSet,
    mapper: TechniqueMapper,
    config: CorrelationConfig,
    slots: DashMap<ChainKey, Slot>,
    /// Snapshot of every active chain by id, refreshed under the key lock
    active: DashMap<String, AttackChain>,
    closed: Mutex<VecDeque<AttackChain>>,
    deferred: Mutex<Vec<(ChainKey, WeakLink)>>,
    alerts: Arc<dyn AlertDispatcher>,
    logger: StructuredLogger,
    metrics: EngineMetrics,
    id_prefix: String,
    sequence: AtomicU64,
}

impl CorrelationEngine {
    pub fn new(
        rules: RuleSet,
        config: CorrelationConfig,
        alerts: Arc<dyn AlertDispatcher>,
        logger: StructuredLogger,
        metrics: EngineMetrics,
    ) -> Self {
        Self {
            rules,
            mapper: TechniqueMapper::new(),
            config,
            slots: DashMap::new(),
            active: DashMap::new(),
            closed: Mutex::new(VecDeque::new()),
            deferred: Mutex::new(Vec::new()),
            alerts,
            logger,
            metrics,
            id_prefix: format!("{:x}", Utc::now().timestamp_millis()),
            sequence: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &CorrelationConfig {
        &self.config
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn mapper(&self) -> &TechniqueMapper {
        &self.mapper
    }

    pub(super) fn slot(&self, key: &ChainKey) -> Slot {
        self.slots.entry(key.clone()).or_default().clone()
    }

    /// Acquire the key lock, retrying once before giving up
    async fn lock(&self, slot: &Slot) -> Option<OwnedMutexGuard<Option<AttackChain>>> {
        for attempt in 1..=2 {
            match tokio::time::timeout(self.config.lock_timeout, slot.clone().lock_owned()).await {
                Ok(guard) => return Some(guard),
                Err(_) => {
                    self.metrics.inc_lock_timeouts();
                    debug!(attempt, "Chain lock busy");
                }
            }
        }
        None
    }

    /// Feed one classified event into its key's chain
    pub async fn correlate(&self, verdict: &ThreatVerdict, event: &SecurityEvent) -> CorrelationReport {
        let key = ChainKey::new(&event.actor_id, &event.asset_id);
        let hits = self.mapper.map(event, verdict);
        let slot = self.slot(&key);

        let Some(mut guard) = self.lock(&slot).await else {
            let err = CoreError::ChainLockTimeout {
                actor_id: key.actor_id.clone(),
                asset_id: key.asset_id.clone(),
            };
            warn!(error = %err, event_id = %event.id, "Deferring event as weak link");
            self.defer(key, weak_link(verdict, event, &hits));
            return CorrelationReport::new(CorrelationOutcome::Deferred);
        };

        let mut report = CorrelationReport::new(CorrelationOutcome::Ignored);
        report.outcome = self.advance(&mut guard, verdict, event, &hits, &mut report.transitions);
        report.chain_id = guard
            .as_ref()
            .map(|c| c.id.clone())
            .or_else(|| report.transitions.last().map(|t| t.chain.id.clone()));
        self.publish(&guard);
        drop(guard);

        self.emit(&report.transitions);
        report
    }

    fn advance(
        &self,
        slot: &mut Option<AttackChain>,
        verdict: &ThreatVerdict,
        event: &SecurityEvent,
        hits: &[TechniqueHit],
        transitions: &mut Vec<ChainTransition>,
    ) -> CorrelationOutcome {
        let at = event.timestamp;

        if slot.as_ref().is_some_and(|c| c.is_expired(at)) {
            if let Some(mut chain) = slot.take() {
                self.expire(&mut chain, at, transitions);
                self.retire(chain);
            }
        }

        let candidate = !verdict.is_benign() && verdict.risk_score >= self.config.min_stage_risk;
        let stage_confidence = stage_confidence(verdict);

        if let Some(chain) = slot.as_mut() {
            if chain.contains_event(&event.id) {
                return CorrelationOutcome::Duplicate;
            }

            if let (true, Some(rule)) = (candidate, self.rules.get(&chain.rule_id)) {
                let next = chain.stages.len();
                // A late event cannot become a stage ahead of one already observed
                let in_order = at >= chain.last_activity();
                let advancing = rule
                    .stages
                    .get(next)
                    .filter(|_| in_order)
                    .and_then(|s| s.matches(hits));
                if let Some(techniques) = advancing {
                    let stage = self.extend(chain, rule, techniques, event, stage_confidence, transitions);
                    if !chain.is_active() {
                        if let Some(closed) = slot.take() {
                            self.retire(closed);
                        }
                    }
                    return CorrelationOutcome::Extended { stage };
                }

                let current = rule
                    .stages
                    .get(next.saturating_sub(1))
                    .filter(|_| chain.absorb_floor().map_or(true, |floor| at >= floor));
                if let Some(techniques) = current.and_then(|s| s.matches(hits)) {
                    if let Some(stage) = chain.absorb(&event.id, &techniques, stage_confidence, at) {
                        chain.expires_at = expiry(rule, chain);
                        return CorrelationOutcome::Absorbed { stage };
                    }
                }
            }

            if verdict.risk_score >= self.config.weak_link_floor {
                let link = weak_link(verdict, event, hits);
                if chain.add_weak_link(link, self.config.max_weak_links) {
                    self.logger
                        .log_weak_link(Some(&chain.id), &event.id, verdict.risk_score);
                    return CorrelationOutcome::WeakLink;
                }
            }
            return CorrelationOutcome::Ignored;
        }

        if !candidate {
            return CorrelationOutcome::Ignored;
        }

        let best = self
            .rules
            .iter()
            .filter_map(|rule| rule.stages[0].matches(hits).map(|t| (rule, t)))
            .max_by(|(a, _), (b, _)| a.prior.partial_cmp(&b.prior).unwrap_or(std::cmp::Ordering::Equal));
        let Some((rule, techniques)) = best else {
            return CorrelationOutcome::Ignored;
        };

        let mut chain = self.open(rule, techniques, event, stage_confidence);
        transitions.push(ChainTransition::new(TransitionKind::Opened, at, &chain));
        self.settle(&mut chain, rule, at, transitions);
        if chain.is_active() {
            *slot = Some(chain);
        } else {
            self.retire(chain);
        }
        CorrelationOutcome::Opened
    }

    fn open(
        &self,
        rule: &CorrelationRule,
        techniques: Vec<String>,
        event: &SecurityEvent,
        stage_confidence: f64,
    ) -> AttackChain {
        let n = self.sequence.fetch_add(1, Ordering::Relaxed);
        let at = event.timestamp;
        let mut chain = AttackChain {
            id: format!("chain-{}-{:04}", self.id_prefix, n),
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            actor_id: event.actor_id.clone(),
            asset_id: event.asset_id.clone(),
            stages: Vec::new(),
            confidence: 0.0,
            status: ChainStatus::Open,
            close_reason: None,
            weak_links: Vec::new(),
            opened_at: at,
            updated_at: at,
            expires_at: at,
        };
        chain.push_stage(&rule.stages[0].tactic, techniques, &event.id, stage_confidence, at);
        chain.raise_confidence(stage_confidence * rule.prior);
        chain.expires_at = expiry(rule, &chain);
        chain
    }

    /// Append the next stage; returns the new stage number
    fn extend(
        &self,
        chain: &mut AttackChain,
        rule: &CorrelationRule,
        techniques: Vec<String>,
        event: &SecurityEvent,
        stage_confidence: f64,
        transitions: &mut Vec<ChainTransition>,
    ) -> u32 {
        let at = event.timestamp;
        let tactic = &rule.stages[chain.stages.len()].tactic;
        let stage = chain.push_stage(tactic, techniques, &event.id, stage_confidence, at);

        // Noisy-or: each stage closes part of the remaining gap to certainty
        let c = chain.confidence;
        chain.raise_confidence(c + (1.0 - c) * stage_confidence * rule.prior);
        chain.expires_at = expiry(rule, chain);

        transitions.push(ChainTransition::new(TransitionKind::Extended, at, chain));
        self.settle(chain, rule, at, transitions);
        stage
    }

    /// Escalate and/or complete after a stage was added
    fn settle(
        &self,
        chain: &mut AttackChain,
        rule: &CorrelationRule,
        at: DateTime<Utc>,
        transitions: &mut Vec<ChainTransition>,
    ) {
        if chain.status == ChainStatus::Open && chain.confidence >= self.config.escalation_threshold {
            chain.status = ChainStatus::Escalated;
            transitions.push(ChainTransition::new(TransitionKind::Escalated, at, chain));
        }
        if rule.is_terminal(chain.stages.len()) {
            chain.close(ChainStatus::Resolved, CloseReason::Completed, at);
            transitions.push(ChainTransition::new(TransitionKind::Resolved, at, chain));
        }
    }

    /// Close a chain whose next stage never arrived
    ///
    /// It ends escalated when its confidence reached the escalation
    /// threshold and resolved otherwise.
    fn expire(&self, chain: &mut AttackChain, at: DateTime<Utc>, transitions: &mut Vec<ChainTransition>) {
        let status = if chain.confidence >= self.config.escalation_threshold {
            if chain.status == ChainStatus::Open {
                chain.status = ChainStatus::Escalated;
                transitions.push(ChainTransition::new(TransitionKind::Escalated, at, chain));
            }
            ChainStatus::Escalated
        } else {
            ChainStatus::Resolved
        };
        chain.close(status, CloseReason::TimedOut, at);
        transitions.push(ChainTransition::new(TransitionKind::TimedOut, at, chain));
    }

    /// Move a closed chain from the active index to the archive
    fn retire(&self, chain: AttackChain) {
        self.active.remove(&chain.id);
        let mut closed = self.closed.lock().unwrap_or_else(PoisonError::into_inner);
        closed.push_back(chain);
        while closed.len() > self.config.closed_retention {
            closed.pop_front();
        }
    }

    fn publish(&self, slot: &Option<AttackChain>) {
        if let Some(chain) = slot {
            self.active.insert(chain.id.clone(), chain.clone());
        }
        self.metrics.set_active_chains(self.active.len() as i64);
    }

    fn emit(&self, transitions: &[ChainTransition]) {
        for transition in transitions {
            let chain = &transition.chain;
            let reason = chain.close_reason.map(|r| r.to_string());
            self.logger.log_chain_transition(
                transition.kind.as_str(),
                &chain.id,
                &chain.rule_id,
                &chain.actor_id,
                &chain.asset_id,
                chain.stages.len(),
                chain.confidence,
                reason.as_deref(),
            );
            self.metrics.inc_chain_transition(transition.kind.as_str());
            if let Some(alert) = ChainAlert::from_transition(transition) {
                self.alerts.dispatch(alert);
            }
        }
    }

    fn defer(&self, key: ChainKey, link: WeakLink) {
        let mut deferred = self.deferred.lock().unwrap_or_else(PoisonError::into_inner);
        deferred.push((key, link));
    }

    /// Deferred weak links waiting for their key's lock
    pub fn deferred_len(&self) -> usize {
        self.deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Close or mark a chain by id
    ///
    /// Resolving an already closed chain is a no-op unless it is being
    /// marked as a false positive; the transition is `None` for a no-op.
    pub async fn resolve_chain(
        &self,
        chain_id: &str,
        false_positive: bool,
    ) -> CoreResult<(AttackChain, Option<ChainTransition>)> {
        let (status, kind) = if false_positive {
            (ChainStatus::FalsePositive, TransitionKind::FalsePositive)
        } else {
            (ChainStatus::Resolved, TransitionKind::Resolved)
        };
        let now = Utc::now();

        let key = self.active.get(chain_id).map(|c| c.value().key());
        if let Some(key) = key {
            let slot = self.slot(&key);
            let mut guard = self.lock(&slot).await.ok_or_else(|| CoreError::ChainLockTimeout {
                actor_id: key.actor_id.clone(),
                asset_id: key.asset_id.clone(),
            })?;
            if guard.as_ref().is_some_and(|c| c.id == chain_id) {
                if let Some(mut chain) = guard.take() {
                    chain.close(status, CloseReason::Manual, now);
                    let transition = ChainTransition::new(kind, now, &chain);
                    self.retire(chain.clone());
                    self.publish(&guard);
                    drop(guard);
                    self.emit(std::slice::from_ref(&transition));
                    return Ok((chain, Some(transition)));
                }
            }
        }

        let transition = {
            let mut closed = self.closed.lock().unwrap_or_else(PoisonError::into_inner);
            let chain = closed
                .iter_mut()
                .rev()
                .find(|c| c.id == chain_id)
                .ok_or_else(|| CoreError::ChainNotFound(chain_id.to_string()))?;
            if !false_positive || chain.status == ChainStatus::FalsePositive {
                return Ok((chain.clone(), None));
            }
            chain.status = ChainStatus::FalsePositive;
            chain.updated_at = chain.updated_at.max(now);
            ChainTransition::new(kind, now, chain)
        };
        self.emit(std::slice::from_ref(&transition));
        Ok((transition.chain.clone(), Some(transition)))
    }

    /// Close chains expired in wall-clock time, attach deferred weak links,
    /// and drop idle key slots
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        let slots: Vec<(ChainKey, Slot)> = self
            .slots
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (key, slot) in slots {
            let Ok(mut guard) = slot.try_lock_owned() else {
                debug!(key = %key, "Chain busy, skipping sweep");
                continue;
            };
            if guard.as_ref().is_some_and(|c| c.is_expired(now)) {
                if let Some(mut chain) = guard.take() {
                    self.expire(&mut chain, now, &mut report.transitions);
                    self.retire(chain);
                    report.expired += 1;
                }
            }
        }

        let deferred = std::mem::take(
            &mut *self.deferred.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let mut retry = Vec::new();
        for (key, link) in deferred {
            let Some(slot) = self.slots.get(&key).map(|s| s.value().clone()) else {
                report.weak_links_dropped += 1;
                continue;
            };
            let Ok(mut guard) = slot.try_lock_owned() else {
                retry.push((key, link));
                continue;
            };
            match guard.as_mut() {
                Some(chain) => {
                    let event_id = link.event_id.clone();
                    let risk = link.risk_score;
                    if chain.add_weak_link(link, self.config.max_weak_links) {
                        self.logger.log_weak_link(Some(&chain.id), &event_id, risk);
                        report.weak_links_attached += 1;
                    }
                    self.publish(&guard);
                }
                None => report.weak_links_dropped += 1,
            }
        }
        if !retry.is_empty() {
            self.deferred
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(retry);
        }

        let before = self.slots.len();
        self.slots.retain(|_, slot| {
            Arc::strong_count(slot) > 1 || slot.try_lock().map_or(true, |g| g.is_some())
        });
        report.slots_removed = before.saturating_sub(self.slots.len());

        self.metrics.set_active_chains(self.active.len() as i64);
        self.emit(&report.transitions);
        report
    }

    pub fn get_chain(&self, chain_id: &str) -> Option<AttackChain> {
        if let Some(chain) = self.active.get(chain_id) {
            return Some(chain.value().clone());
        }
        self.closed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find(|c| c.id == chain_id)
            .cloned()
    }

    /// Active chains, optionally filtered by actor and/or asset, oldest first
    pub fn get_open_chains(&self, actor_id: Option<&str>, asset_id: Option<&str>) -> Vec<AttackChain> {
        let mut chains: Vec<AttackChain> = self
            .active
            .iter()
            .filter(|c| actor_id.map_or(true, |a| c.actor_id == a))
            .filter(|c| asset_id.map_or(true, |a| c.asset_id == a))
            .map(|c| c.value().clone())
            .collect();
        chains.sort_by(|a, b| a.opened_at.cmp(&b.opened_at).then_with(|| a.id.cmp(&b.id)));
        chains
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.slots.len()
    }
}

/// Per-stage confidence: normalised risk weighted by verdict confidence
fn stage_confidence(verdict: &ThreatVerdict) -> f64 {
    let risk = (verdict.risk_score / 10.0).clamp(0.0, 1.0) as f64;
    (risk * verdict.confidence.clamp(0.0, 1.0) as f64).clamp(0.0, 1.0)
}

/// Deadline for the chain's next stage
fn expiry(rule: &CorrelationRule, chain: &AttackChain) -> DateTime<Utc> {
    let gap = rule
        .stages
        .get(chain.stages.len())
        .or_else(|| rule.stages.last())
        .map(|s| s.max_gap())
        .unwrap_or_else(chrono::Duration::zero);
    chain.last_activity() + gap
}

fn weak_link(verdict: &ThreatVerdict, event: &SecurityEvent, hits: &[TechniqueHit]) -> WeakLink {
    let mut tactics: Vec<String> = Vec::new();
    for hit in hits {
        if !tactics.contains(&hit.tactic) {
            tactics.push(hit.tactic.clone());
        }
    }
    WeakLink {
        event_id: event.id.clone(),
        risk_score: verdict.risk_score,
        tactics,
        observed_at: event.timestamp,
    }
}
