//! Mapping events onto ATT&CK tactics and techniques
//!
//! Explicit technique ids in an event's indicators (`T1046`, `T1059.001`)
//! are taken verbatim and placed under the tactic of their base technique.
//! `tactic:<name>` indicators name a tactic directly. Event types are
//! matched against a keyword table, and the verdict category is the last
//! resort when nothing else maps.

use crate::models::{SecurityEvent, ThreatVerdict};
use crate::predictor::is_technique_id;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A tactic, optionally narrowed to one technique
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TechniqueHit {
    pub tactic: String,
    pub technique: Option<String>,
}

impl TechniqueHit {
    pub fn new(tactic: &str, technique: Option<&str>) -> Self {
        Self {
            tactic: tactic.to_string(),
            technique: technique.map(str::to_string),
        }
    }
}

/// Built-in technique table: (technique id, tactic, name)
const TECHNIQUES: &[(&str, &str, &str)] = &[
    ("T1595", "reconnaissance", "Active Scanning"),
    ("T1592", "reconnaissance", "Gather Victim Host Information"),
    ("T1046", "discovery", "Network Service Discovery"),
    ("T1087", "discovery", "Account Discovery"),
    ("T1190", "initial-access", "Exploit Public-Facing Application"),
    ("T1566", "initial-access", "Phishing"),
    ("T1078", "initial-access", "Valid Accounts"),
    ("T1059", "execution", "Command and Scripting Interpreter"),
    ("T1204", "execution", "User Execution"),
    ("T1053", "persistence", "Scheduled Task/Job"),
    ("T1068", "privilege-escalation", "Exploitation for Privilege Escalation"),
    ("T1548", "privilege-escalation", "Abuse Elevation Control Mechanism"),
    ("T1110", "credential-access", "Brute Force"),
    ("T1003", "credential-access", "OS Credential Dumping"),
    ("T1021", "lateral-movement", "Remote Services"),
    ("T1570", "lateral-movement", "Lateral Tool Transfer"),
    ("T1071", "command-and-control", "Application Layer Protocol"),
    ("T1041", "exfiltration", "Exfiltration Over C2 Channel"),
    ("T1048", "exfiltration", "Exfiltration Over Alternative Protocol"),
    ("T1486", "impact", "Data Encrypted for Impact"),
    ("T1485", "impact", "Data Destruction"),
];

/// Event type keywords, checked in order: (keyword, tactic, technique)
const EVENT_KEYWORDS: &[(&str, &str, &str)] = &[
    ("scan", "reconnaissance", "T1595"),
    ("recon", "reconnaissance", "T1595"),
    ("probe", "reconnaissance", "T1595"),
    ("exploit", "initial-access", "T1190"),
    ("phish", "initial-access", "T1566"),
    ("brute", "credential-access", "T1110"),
    ("login_failure", "credential-access", "T1110"),
    ("password_spray", "credential-access", "T1110"),
    ("credential_dump", "credential-access", "T1003"),
    ("privilege", "privilege-escalation", "T1068"),
    ("sudo", "privilege-escalation", "T1548"),
    ("process_exec", "execution", "T1059"),
    ("shell", "execution", "T1059"),
    ("script", "execution", "T1059"),
    ("remote_login", "lateral-movement", "T1021"),
    ("lateral", "lateral-movement", "T1021"),
    ("beacon", "command-and-control", "T1071"),
    ("exfil", "exfiltration", "T1041"),
    ("upload", "exfiltration", "T1048"),
    ("ransom", "impact", "T1486"),
    ("encrypt", "impact", "T1486"),
];

/// Verdict categories the classifier produces, by tactic
const CATEGORY_TACTICS: &[(&str, &str)] = &[
    ("reconnaissance", "reconnaissance"),
    ("credential_access", "credential-access"),
    ("execution", "execution"),
    ("lateral_movement", "lateral-movement"),
    ("exfiltration", "exfiltration"),
];

#[derive(Debug, Clone)]
pub struct TechniqueMapper {
    techniques: HashMap<String, (String, String)>,
}

impl Default for TechniqueMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl TechniqueMapper {
    pub fn new() -> Self {
        let techniques = TECHNIQUES
            .iter()
            .map(|(id, tactic, name)| (id.to_string(), (tactic.to_string(), name.to_string())))
            .collect();
        Self { techniques }
    }

    /// Tactic of a technique or sub-technique id
    pub fn tactic_of(&self, technique: &str) -> Option<&str> {
        let base = technique.split('.').next().unwrap_or(technique);
        self.techniques.get(base).map(|(tactic, _)| tactic.as_str())
    }

    pub fn technique_name(&self, technique: &str) -> Option<&str> {
        let base = technique.split('.').next().unwrap_or(technique);
        self.techniques.get(base).map(|(_, name)| name.as_str())
    }

    /// Every distinct tactic/technique the event evidences
    pub fn map(&self, event: &SecurityEvent, verdict: &ThreatVerdict) -> Vec<TechniqueHit> {
        let mut hits: Vec<TechniqueHit> = Vec::new();

        for indicator in &event.indicators {
            if is_technique_id(indicator) {
                if let Some(tactic) = self.tactic_of(indicator) {
                    push_unique(&mut hits, TechniqueHit::new(tactic, Some(indicator)));
                }
            } else if let Some(tactic) = indicator.strip_prefix("tactic:") {
                let tactic = tactic.trim().to_lowercase().replace('_', "-");
                if !tactic.is_empty() {
                    push_unique(&mut hits, TechniqueHit::new(&tactic, None));
                }
            }
        }

        let event_type = event.event_type.to_lowercase();
        for (keyword, tactic, technique) in EVENT_KEYWORDS {
            if event_type.contains(keyword) {
                push_unique(&mut hits, TechniqueHit::new(tactic, Some(*technique)));
            }
        }

        if hits.is_empty() {
            if let Some((_, tactic)) = CATEGORY_TACTICS
                .iter()
                .find(|(category, _)| *category == verdict.threat_category)
            {
                push_unique(&mut hits, TechniqueHit::new(tactic, None));
            }
        }
        hits
    }
}

fn push_unique(hits: &mut Vec<TechniqueHit>, hit: TechniqueHit) {
    if !hits.contains(&hit) {
        hits.push(hit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContextMap, Severity};
    use chrono::Utc;

    fn event(event_type: &str, indicators: &[&str]) -> SecurityEvent {
        SecurityEvent {
            id: "e1".to_string(),
            event_type: event_type.to_string(),
            source: "ids".to_string(),
            actor_id: "a".to_string(),
            asset_id: "h".to_string(),
            timestamp: Utc::now(),
            severity: Severity::Medium,
            indicators: indicators.iter().map(|s| s.to_string()).collect(),
            context: ContextMap::new(),
        }
    }

    fn verdict(category: &str) -> ThreatVerdict {
        ThreatVerdict {
            event_id: "e1".to_string(),
            threat_category: category.to_string(),
            risk_score: 6.0,
            confidence: 0.8,
            contributing_models: vec![],
            anomaly_score: 0.0,
            similar_threats: vec![],
            reduced_confidence: false,
            unavailable_signals: vec![],
            classified_at: Utc::now(),
        }
    }

    #[test]
    fn test_technique_ids_are_taken_verbatim() {
        let mapper = TechniqueMapper::new();
        let hits = mapper.map(&event("custom", &["T1059.001", "T9999"]), &verdict("benign"));
        assert_eq!(hits, vec![TechniqueHit::new("execution", Some("T1059.001"))]);
        assert_eq!(mapper.technique_name("T1059.001"), Some("Command and Scripting Interpreter"));
    }

    #[test]
    fn test_tactic_indicator_and_keywords() {
        let mapper = TechniqueMapper::new();
        let hits = mapper.map(&event("port_scan", &["tactic:Initial_Access"]), &verdict("benign"));
        assert!(hits.contains(&TechniqueHit::new("initial-access", None)));
        assert!(hits.contains(&TechniqueHit::new("reconnaissance", Some("T1595"))));
    }

    #[test]
    fn test_duplicates_are_removed() {
        let mapper = TechniqueMapper::new();
        let hits = mapper.map(&event("recon_scan", &["T1595"]), &verdict("reconnaissance"));
        assert_eq!(hits, vec![TechniqueHit::new("reconnaissance", Some("T1595"))]);
    }

    #[test]
    fn test_category_is_last_resort() {
        let mapper = TechniqueMapper::new();
        let hits = mapper.map(&event("unknown", &[]), &verdict("exfiltration"));
        assert_eq!(hits, vec![TechniqueHit::new("exfiltration", None)]);
        assert!(mapper.map(&event("unknown", &[]), &verdict("benign")).is_empty());
    }
}
