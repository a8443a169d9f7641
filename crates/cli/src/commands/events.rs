//! Event submission and analyst feedback commands

use anyhow::{Context, Result};
use std::path::Path;

use crate::client::{ApiClient, FeedbackAck, FeedbackRequest, SubmissionResult};
use crate::output::{
    color_risk, format_confidence, print_info, print_json, print_success, print_warning,
    OutputFormat,
};

/// Read events from a file holding one event object or an array of them
pub fn read_events(path: &Path) -> Result<Vec<serde_json::Value>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&content).context("Event file is not valid JSON")?;

    match value {
        serde_json::Value::Array(events) => Ok(events),
        event @ serde_json::Value::Object(_) => Ok(vec![event]),
        _ => anyhow::bail!("Event file must contain an object or an array of objects"),
    }
}

/// Submit events for classification and correlation
pub async fn submit(client: &ApiClient, file: &Path, format: OutputFormat) -> Result<()> {
    let events = read_events(file)?;
    let mut results = Vec::with_capacity(events.len());

    for event in &events {
        let result: SubmissionResult = client.post("api/v1/events", event).await?;
        results.push(result);
    }

    match format {
        OutputFormat::Json => print_json(&results)?,
        OutputFormat::Table => {
            for result in &results {
                let verdict = &result.verdict;
                print_success(&format!(
                    "{}: {} risk {} confidence {}{}",
                    verdict.event_id,
                    verdict.threat_category,
                    color_risk(verdict.risk_score),
                    format_confidence(verdict.confidence as f64),
                    if result.cached { " (cached)" } else { "" }
                ));
                if verdict.reduced_confidence {
                    print_warning(&format!(
                        "Reduced confidence, unavailable: {}",
                        verdict.unavailable_signals.join(", ")
                    ));
                }
                if let (Some(chain_id), Some(correlation)) = (&result.chain_id, &result.correlation) {
                    let stage = correlation
                        .stage
                        .map(|s| format!(" stage {}", s))
                        .unwrap_or_default();
                    print_info(&format!("Chain {}: {}{}", chain_id, correlation.kind, stage));
                }
            }
        }
    }
    Ok(())
}

/// Send an analyst correction for a classified event
pub async fn feedback(
    client: &ApiClient,
    event_id: &str,
    label: &str,
    format: OutputFormat,
) -> Result<()> {
    let request = FeedbackRequest {
        event_id: event_id.to_string(),
        label: label.to_string(),
    };
    let ack: FeedbackAck = client.post("api/v1/feedback", &request).await?;

    match format {
        OutputFormat::Json => print_json(&ack)?,
        OutputFormat::Table => {
            let verb = if ack.replaced { "replaced" } else { "queued" };
            print_success(&format!("Feedback for {} {} as '{}'", ack.event_id, verb, ack.label));
            println!("Pending corrections: {}", ack.pending);
        }
    }
    Ok(())
}
