//! Attack chain correlation
//!
//! This module provides:
//! - Mapping of events onto ATT&CK tactics and techniques
//! - Technique-sequence correlation rules and a default rule set
//! - The per-key chain state machine and its sharded stream consumer
//! - Alert dispatch and periodic maintenance

mod alerter;
mod chain;
mod engine;
mod mitre;
mod rules;
mod shard;
mod sweeper;

#[cfg(test)]
mod tests;

pub use alerter::{
    AlertDispatcher, AlertSeverity, ChainAlert, ChannelAlertDispatcher, LogAlertDispatcher,
};
pub use chain::{
    AttackChain, AttackStage, ChainKey, ChainStatus, ChainTransition, CloseReason,
    TransitionKind, WeakLink,
};
pub use engine::{
    CorrelationConfig, CorrelationEngine, CorrelationOutcome, CorrelationReport, SweepReport,
};
pub use mitre::{TechniqueHit, TechniqueMapper};
pub use rules::{default_rules, CorrelationRule, RuleSet, RuleStage};
pub use shard::ShardedCorrelator;
pub use sweeper::{MaintenanceReport, MaintenanceWorker};
