//! Alert dispatch for chain transitions
//!
//! Escalated and closed chains are handed to an [`AlertDispatcher`] as a
//! [`ChainAlert`]. Delivery is fire-and-forget: a dispatcher never reports
//! failure back to the engine.

use super::chain::{AttackChain, ChainStatus, ChainTransition, CloseReason, TransitionKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Confidence at which an escalation is critical rather than high
const CRITICAL_CONFIDENCE: f64 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    High,
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertSeverity::Info => write!(f, "info"),
            AlertSeverity::Warning => write!(f, "warning"),
            AlertSeverity::High => write!(f, "high"),
            AlertSeverity::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainAlert {
    pub chain_id: String,
    pub rule_id: String,
    pub status: ChainStatus,
    pub severity: AlertSeverity,
    pub summary: String,
    pub confidence: f64,
    pub actor_id: String,
    pub asset_id: String,
    pub tactics: Vec<String>,
    pub raised_at: DateTime<Utc>,
}

impl ChainAlert {
    /// Alert for an alerting transition, `None` for opened/extended
    pub fn from_transition(transition: &ChainTransition) -> Option<Self> {
        if !transition.kind.is_alerting() {
            return None;
        }
        let chain = &transition.chain;
        Some(Self {
            chain_id: chain.id.clone(),
            rule_id: chain.rule_id.clone(),
            status: chain.status,
            severity: severity_for(transition.kind, chain),
            summary: summarize(transition.kind, chain),
            confidence: chain.confidence,
            actor_id: chain.actor_id.clone(),
            asset_id: chain.asset_id.clone(),
            tactics: chain.tactics().into_iter().map(str::to_string).collect(),
            raised_at: transition.at,
        })
    }
}

fn severity_for(kind: TransitionKind, chain: &AttackChain) -> AlertSeverity {
    match kind {
        TransitionKind::Escalated if chain.confidence >= CRITICAL_CONFIDENCE => {
            AlertSeverity::Critical
        }
        TransitionKind::Escalated => AlertSeverity::High,
        TransitionKind::Resolved => match chain.close_reason {
            Some(CloseReason::Completed) => AlertSeverity::Critical,
            _ => AlertSeverity::Info,
        },
        TransitionKind::TimedOut if chain.status == ChainStatus::Escalated => AlertSeverity::High,
        TransitionKind::TimedOut => AlertSeverity::Warning,
        _ => AlertSeverity::Info,
    }
}

fn summarize(kind: TransitionKind, chain: &AttackChain) -> String {
    let verb = match kind {
        TransitionKind::Escalated => "escalated".to_string(),
        TransitionKind::FalsePositive => "marked false positive".to_string(),
        TransitionKind::TimedOut => format!("timed out while {}", chain.status),
        _ => match chain.close_reason {
            Some(reason) => format!("resolved ({})", reason),
            None => "resolved".to_string(),
        },
    };
    format!(
        "{} {} for {} on {}: {} stage(s) [{}], confidence {:.2}",
        chain.rule_name,
        verb,
        chain.actor_id,
        chain.asset_id,
        chain.stages.len(),
        chain.tactics().join(" -> "),
        chain.confidence
    )
}

/// Receives alerts for escalated and closed chains
pub trait AlertDispatcher: Send + Sync {
    fn dispatch(&self, alert: ChainAlert);
}

/// Emits alerts as structured log lines
#[derive(Debug, Clone, Default)]
pub struct LogAlertDispatcher;

impl AlertDispatcher for LogAlertDispatcher {
    fn dispatch(&self, alert: ChainAlert) {
        match alert.severity {
            AlertSeverity::High | AlertSeverity::Critical => warn!(
                event = "chain_alert",
                chain_id = %alert.chain_id,
                severity = %alert.severity,
                status = %alert.status,
                confidence = alert.confidence,
                "{}",
                alert.summary
            ),
            _ => info!(
                event = "chain_alert",
                chain_id = %alert.chain_id,
                severity = %alert.severity,
                status = %alert.status,
                confidence = alert.confidence,
                "{}",
                alert.summary
            ),
        }
    }
}

/// Forwards alerts to an in-process consumer
#[derive(Debug, Clone)]
pub struct ChannelAlertDispatcher {
    tx: mpsc::UnboundedSender<ChainAlert>,
}

impl ChannelAlertDispatcher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ChainAlert>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AlertDispatcher for ChannelAlertDispatcher {
    fn dispatch(&self, alert: ChainAlert) {
        if let Err(e) = self.tx.send(alert) {
            debug!(chain_id = %e.0.chain_id, "Alert consumer gone, dropping alert");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::chain::AttackStage;

    fn chain(status: ChainStatus, reason: Option<CloseReason>, confidence: f64) -> AttackChain {
        let at = Utc::now();
        AttackChain {
            id: "chain-1".to_string(),
            rule_id: "recon-to-initial-access".to_string(),
            rule_name: "Recon then access".to_string(),
            actor_id: "actor".to_string(),
            asset_id: "web-01".to_string(),
            stages: vec![
                AttackStage {
                    stage_number: 1,
                    tactic: "reconnaissance".to_string(),
                    techniques: vec![],
                    event_ids: vec!["e1".to_string()],
                    confidence: 0.5,
                    started_at: at,
                    ended_at: at,
                },
                AttackStage {
                    stage_number: 2,
                    tactic: "initial-access".to_string(),
                    techniques: vec![],
                    event_ids: vec!["e2".to_string()],
                    confidence: 0.6,
                    started_at: at,
                    ended_at: at,
                },
            ],
            confidence,
            status,
            close_reason: reason,
            weak_links: vec![],
            opened_at: at,
            updated_at: at,
            expires_at: at,
        }
    }

    #[test]
    fn test_opened_transitions_do_not_alert() {
        let t = ChainTransition::new(
            TransitionKind::Opened,
            Utc::now(),
            &chain(ChainStatus::Open, None, 0.4),
        );
        assert!(ChainAlert::from_transition(&t).is_none());
    }

    #[test]
    fn test_alert_severity() {
        let escalated = ChainTransition::new(
            TransitionKind::Escalated,
            Utc::now(),
            &chain(ChainStatus::Escalated, None, 0.85),
        );
        let alert = ChainAlert::from_transition(&escalated).unwrap();
        assert_eq!(alert.severity, AlertSeverity::High);
        assert_eq!(alert.tactics, vec!["reconnaissance", "initial-access"]);
        assert!(alert.summary.contains("reconnaissance -> initial-access"));

        let timed_out = ChainTransition::new(
            TransitionKind::TimedOut,
            Utc::now(),
            &chain(ChainStatus::Resolved, Some(CloseReason::TimedOut), 0.4),
        );
        let alert = ChainAlert::from_transition(&timed_out).unwrap();
        assert_eq!(alert.severity, AlertSeverity::Warning);
        assert!(alert.summary.contains("timed out while resolved"));

        let escalated_timeout = ChainTransition::new(
            TransitionKind::TimedOut,
            Utc::now(),
            &chain(ChainStatus::Escalated, Some(CloseReason::TimedOut), 0.85),
        );
        let alert = ChainAlert::from_transition(&escalated_timeout).unwrap();
        assert_eq!(alert.severity, AlertSeverity::High);
        assert!(alert.summary.contains("timed out while escalated"));

        let completed = ChainTransition::new(
            TransitionKind::Resolved,
            Utc::now(),
            &chain(ChainStatus::Resolved, Some(CloseReason::Completed), 0.9),
        );
        assert_eq!(
            ChainAlert::from_transition(&completed).unwrap().severity,
            AlertSeverity::Critical
        );
    }

    #[tokio::test]
    async fn test_channel_dispatcher_forwards() {
        let (dispatcher, mut rx) = ChannelAlertDispatcher::new();
        let t = ChainTransition::new(
            TransitionKind::FalsePositive,
            Utc::now(),
            &chain(ChainStatus::FalsePositive, Some(CloseReason::Manual), 0.5),
        );
        dispatcher.dispatch(ChainAlert::from_transition(&t).unwrap());
        let alert = rx.recv().await.unwrap();
        assert_eq!(alert.severity, AlertSeverity::Info);
        assert_eq!(alert.status, ChainStatus::FalsePositive);

        drop(rx);
        dispatcher.dispatch(ChainAlert::from_transition(&t).unwrap());
    }
}
