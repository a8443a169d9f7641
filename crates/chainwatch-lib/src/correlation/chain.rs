//! Attack chain data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of an attack chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    Open,
    Escalated,
    Resolved,
    FalsePositive,
}

impl ChainStatus {
    /// Open and escalated chains still accept events
    pub fn is_active(&self) -> bool {
        matches!(self, ChainStatus::Open | ChainStatus::Escalated)
    }
}

impl std::fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainStatus::Open => write!(f, "open"),
            ChainStatus::Escalated => write!(f, "escalated"),
            ChainStatus::Resolved => write!(f, "resolved"),
            ChainStatus::FalsePositive => write!(f, "false_positive"),
        }
    }
}

/// Why a chain stopped accepting events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The rule's terminal stage matched
    Completed,
    /// The next stage did not arrive within its max gap
    TimedOut,
    /// Closed by an operator
    Manual,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Completed => write!(f, "completed"),
            CloseReason::TimedOut => write!(f, "timed_out"),
            CloseReason::Manual => write!(f, "manual"),
        }
    }
}

/// At most one active chain exists per key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainKey {
    pub actor_id: String,
    pub asset_id: String,
}

impl ChainKey {
    pub fn new(actor_id: impl Into<String>, asset_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            asset_id: asset_id.into(),
        }
    }
}

impl std::fmt::Display for ChainKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.actor_id, self.asset_id)
    }
}

/// One matched stage of a rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackStage {
    /// 1-based, contiguous within a chain
    pub stage_number: u32,
    pub tactic: String,
    pub techniques: Vec<String>,
    pub event_ids: Vec<String>,
    pub confidence: f64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl AttackStage {
    fn absorb(&mut self, event_id: &str, techniques: &[String], confidence: f64, at: DateTime<Utc>) {
        self.event_ids.push(event_id.to_string());
        for technique in techniques {
            if !self.techniques.contains(technique) {
                self.techniques.push(technique.clone());
            }
        }
        self.confidence = self.confidence.max(confidence);
        self.started_at = self.started_at.min(at);
        self.ended_at = self.ended_at.max(at);
    }
}

/// A significant event on the key that matched no stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeakLink {
    pub event_id: String,
    pub risk_score: f32,
    pub tactics: Vec<String>,
    pub observed_at: DateTime<Utc>,
}

/// An in-progress or closed multi-stage attack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackChain {
    pub id: String,
    pub rule_id: String,
    pub rule_name: String,
    pub actor_id: String,
    pub asset_id: String,
    pub stages: Vec<AttackStage>,
    /// Never decreases over the chain's lifetime
    pub confidence: f64,
    pub status: ChainStatus,
    pub close_reason: Option<CloseReason>,
    #[serde(default)]
    pub weak_links: Vec<WeakLink>,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Event time after which the chain times out waiting for its next stage
    pub expires_at: DateTime<Utc>,
}

impl AttackChain {
    pub fn key(&self) -> ChainKey {
        ChainKey::new(&self.actor_id, &self.asset_id)
    }

    /// Still accepting events; a chain closed while escalated keeps that status
    pub fn is_active(&self) -> bool {
        self.close_reason.is_none() && self.status.is_active()
    }

    pub fn current_stage(&self) -> Option<&AttackStage> {
        self.stages.last()
    }

    /// Latest event time seen by any stage
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.stages
            .iter()
            .map(|s| s.ended_at)
            .max()
            .unwrap_or(self.opened_at)
    }

    /// Earliest event time the current stage can absorb while staying
    /// after its predecessor
    pub fn absorb_floor(&self) -> Option<DateTime<Utc>> {
        let previous = self.stages.len().checked_sub(2)?;
        Some(self.stages[previous].ended_at)
    }

    pub fn tactics(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.tactic.as_str()).collect()
    }

    pub fn contains_event(&self, event_id: &str) -> bool {
        self.stages
            .iter()
            .any(|s| s.event_ids.iter().any(|id| id == event_id))
            || self.weak_links.iter().any(|w| w.event_id == event_id)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.is_active() && now > self.expires_at
    }

    /// Append the next stage, returning its number
    pub(crate) fn push_stage(
        &mut self,
        tactic: &str,
        techniques: Vec<String>,
        event_id: &str,
        confidence: f64,
        at: DateTime<Utc>,
    ) -> u32 {
        let stage_number = self.stages.len() as u32 + 1;
        self.stages.push(AttackStage {
            stage_number,
            tactic: tactic.to_string(),
            techniques,
            event_ids: vec![event_id.to_string()],
            confidence,
            started_at: at,
            ended_at: at,
        });
        self.updated_at = self.updated_at.max(at);
        stage_number
    }

    /// Fold an event into the current stage
    pub(crate) fn absorb(
        &mut self,
        event_id: &str,
        techniques: &[String],
        confidence: f64,
        at: DateTime<Utc>,
    ) -> Option<u32> {
        let stage = self.stages.last_mut()?;
        stage.absorb(event_id, techniques, confidence, at);
        let number = stage.stage_number;
        self.updated_at = self.updated_at.max(at);
        Some(number)
    }

    /// Raise confidence; a lower value is ignored
    pub(crate) fn raise_confidence(&mut self, confidence: f64) {
        self.confidence = self.confidence.max(confidence.clamp(0.0, 1.0));
    }

    /// Record a weak link, keeping at most `max` of the newest
    pub(crate) fn add_weak_link(&mut self, link: WeakLink, max: usize) -> bool {
        if self.contains_event(&link.event_id) {
            return false;
        }
        self.weak_links.push(link);
        if self.weak_links.len() > max {
            let excess = self.weak_links.len() - max;
            self.weak_links.drain(..excess);
        }
        true
    }

    pub(crate) fn close(&mut self, status: ChainStatus, reason: CloseReason, at: DateTime<Utc>) {
        self.status = status;
        self.close_reason = Some(reason);
        self.updated_at = self.updated_at.max(at);
    }
}

/// Kind of state change a chain went through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Opened,
    Extended,
    Escalated,
    Resolved,
    /// Closed after its max gap elapsed, as resolved or escalated
    TimedOut,
    FalsePositive,
}

impl TransitionKind {
    /// Name used for log events and metric labels
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionKind::Opened => "chain_opened",
            TransitionKind::Extended => "chain_extended",
            TransitionKind::Escalated => "chain_escalated",
            TransitionKind::Resolved => "chain_resolved",
            TransitionKind::TimedOut => "chain_timed_out",
            TransitionKind::FalsePositive => "chain_false_positive",
        }
    }

    /// Transitions an alert collaborator is told about
    pub fn is_alerting(&self) -> bool {
        matches!(
            self,
            TransitionKind::Escalated
                | TransitionKind::Resolved
                | TransitionKind::TimedOut
                | TransitionKind::FalsePositive
        )
    }
}

/// A chain state change with the chain as it stood afterwards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainTransition {
    pub kind: TransitionKind,
    pub at: DateTime<Utc>,
    pub chain: AttackChain,
}

impl ChainTransition {
    pub fn new(kind: TransitionKind, at: DateTime<Utc>, chain: &AttackChain) -> Self {
        Self {
            kind,
            at,
            chain: chain.clone(),
        }
    }
}
