//! Correlation rules
//!
//! A rule is an ordered list of tactic stages. Each stage after the first
//! carries the longest gap allowed since the previous stage's last event.

use super::mitre::TechniqueHit;
use anyhow::{bail, Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// One stage of a rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleStage {
    pub tactic: String,
    /// Accepted techniques; empty accepts any technique of the tactic
    #[serde(default)]
    pub techniques: Vec<String>,
    /// Longest wait for this stage after the previous one
    pub max_gap_secs: u64,
}

impl RuleStage {
    pub fn new(tactic: &str, techniques: &[&str], max_gap_secs: u64) -> Self {
        Self {
            tactic: tactic.to_string(),
            techniques: techniques.iter().map(|t| t.to_string()).collect(),
            max_gap_secs,
        }
    }

    pub fn max_gap(&self) -> Duration {
        Duration::seconds(self.max_gap_secs.min(i64::MAX as u64) as i64)
    }

    /// Techniques from `hits` satisfying this stage, or `None` if nothing does
    ///
    /// A tactic-only hit satisfies a stage with no technique constraint. A
    /// sub-technique satisfies a stage listing its base technique.
    pub fn matches(&self, hits: &[TechniqueHit]) -> Option<Vec<String>> {
        let mut matched = false;
        let mut techniques = Vec::new();
        for hit in hits.iter().filter(|h| h.tactic == self.tactic) {
            match &hit.technique {
                Some(technique) if self.accepts(technique) => {
                    matched = true;
                    if !techniques.contains(technique) {
                        techniques.push(technique.clone());
                    }
                }
                None if self.techniques.is_empty() => matched = true,
                _ => {}
            }
        }
        matched.then_some(techniques)
    }

    fn accepts(&self, technique: &str) -> bool {
        if self.techniques.is_empty() {
            return true;
        }
        let base = technique.split('.').next().unwrap_or(technique);
        self.techniques.iter().any(|t| t == technique || t == base)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationRule {
    pub id: String,
    pub name: String,
    /// Weight of this rule's evidence, in (0, 1]
    pub prior: f64,
    pub stages: Vec<RuleStage>,
}

impl CorrelationRule {
    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            bail!("rule id must not be empty");
        }
        if !(self.prior > 0.0 && self.prior <= 1.0) {
            bail!("rule '{}': prior {} outside (0, 1]", self.id, self.prior);
        }
        if self.stages.is_empty() {
            bail!("rule '{}' has no stages", self.id);
        }
        if let Some(stage) = self.stages.iter().find(|s| s.tactic.trim().is_empty()) {
            bail!("rule '{}' has a stage without a tactic: {:?}", self.id, stage);
        }
        Ok(())
    }

    pub fn is_terminal(&self, stage_count: usize) -> bool {
        stage_count >= self.stages.len()
    }
}

/// Validated, ordered set of rules
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<CorrelationRule>,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            rules: default_rules(),
        }
    }
}

impl RuleSet {
    pub fn new(rules: Vec<CorrelationRule>) -> Result<Self> {
        let mut seen = HashSet::new();
        for rule in &rules {
            rule.validate()?;
            if !seen.insert(rule.id.clone()) {
                bail!("duplicate rule id '{}'", rule.id);
            }
        }
        Ok(Self { rules })
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let rules: Vec<CorrelationRule> =
            serde_json::from_str(json).context("Failed to parse correlation rules")?;
        Self::new(rules)
    }

    /// Load a JSON list of rules from `path`
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read rules file {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("Invalid rules file {}", path.display()))
    }

    pub fn get(&self, id: &str) -> Option<&CorrelationRule> {
        self.rules.iter().find(|r| r.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CorrelationRule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Common ATT&CK kill-chain progressions
pub fn default_rules() -> Vec<CorrelationRule> {
    vec![
        CorrelationRule {
            id: "recon-to-initial-access".to_string(),
            name: "Reconnaissance followed by initial access".to_string(),
            prior: 0.9,
            stages: vec![
                RuleStage::new("reconnaissance", &[], 0),
                RuleStage::new("initial-access", &[], 600),
                RuleStage::new("execution", &[], 1800),
            ],
        },
        CorrelationRule {
            id: "credential-access-to-lateral-movement".to_string(),
            name: "Credential theft followed by lateral movement".to_string(),
            prior: 0.85,
            stages: vec![
                RuleStage::new("credential-access", &["T1110", "T1003"], 0),
                RuleStage::new("lateral-movement", &[], 3600),
                RuleStage::new("exfiltration", &[], 7200),
            ],
        },
        CorrelationRule {
            id: "execution-to-exfiltration".to_string(),
            name: "Execution followed by data exfiltration".to_string(),
            prior: 0.8,
            stages: vec![
                RuleStage::new("execution", &[], 0),
                RuleStage::new("exfiltration", &[], 3600),
            ],
        },
        CorrelationRule {
            id: "privilege-escalation-to-impact".to_string(),
            name: "Privilege escalation followed by impact".to_string(),
            prior: 0.85,
            stages: vec![
                RuleStage::new("privilege-escalation", &[], 0),
                RuleStage::new("impact", &[], 3600),
            ],
        },
        CorrelationRule {
            id: "c2-beacon-to-exfiltration".to_string(),
            name: "Command and control followed by exfiltration".to_string(),
            prior: 0.75,
            stages: vec![
                RuleStage::new("command-and-control", &["T1071"], 0),
                RuleStage::new("exfiltration", &["T1041", "T1048"], 1800),
            ],
        },
    ]
}
