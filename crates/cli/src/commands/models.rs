//! Model registry commands

use anyhow::Result;
use tabled::Tabled;

use crate::client::{ApiClient, ModelMetrics, ModelSummary, ReloadRequest};
use crate::output::{
    color_status, format_confidence, print_json, print_rows, print_success, print_warning,
    OutputFormat,
};

/// Row for models table
#[derive(Tabled)]
struct ModelRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Accuracy")]
    accuracy: String,
    #[tabled(rename = "Predictions")]
    predictions: u64,
}

fn accuracy(value: Option<f64>) -> String {
    value.map(format_confidence).unwrap_or_else(|| "-".to_string())
}

/// List registered models
pub async fn list_models(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let models: Vec<ModelSummary> = client.get("api/v1/models", &[]).await?;

    print_rows(
        &models,
        |models| {
            models
                .iter()
                .map(|m| ModelRow {
                    name: m.name.clone(),
                    kind: m.kind.clone(),
                    version: m.version.clone(),
                    status: color_status(&m.status),
                    accuracy: accuracy(m.accuracy),
                    predictions: m.prediction_count,
                })
                .collect()
        },
        "No models registered",
        format,
    )?;

    if format == OutputFormat::Table {
        for model in &models {
            if let Some(error) = &model.last_error {
                print_warning(&format!("{}: {}", model.name, error));
            }
        }
    }
    Ok(())
}

/// Show serving metrics for one model
pub async fn model_metrics(client: &ApiClient, name: &str, format: OutputFormat) -> Result<()> {
    let metrics: ModelMetrics = client
        .get(&format!("api/v1/models/{}/metrics", name), &[])
        .await?;

    match format {
        OutputFormat::Json => print_json(&metrics)?,
        OutputFormat::Table => {
            println!("Model:       {}", metrics.name);
            println!("Status:      {}", color_status(&metrics.status));
            println!("Predictions: {}", metrics.prediction_count);
            println!("Avg latency: {:.2}ms", metrics.avg_latency_ms);
            println!("Accuracy:    {}", accuracy(metrics.accuracy));
        }
    }
    Ok(())
}

/// Reload a model, optionally from a new weights file
pub async fn reload_model(
    client: &ApiClient,
    name: &str,
    file: Option<String>,
    checksum: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let source = file.map(|path| {
        serde_json::json!({
            "type": "file",
            "path": path,
            "checksum": checksum,
        })
    });
    let path = format!("api/v1/models/{}/reload", name);
    let summary: ModelSummary = client.post(&path, &ReloadRequest { source }).await?;

    match format {
        OutputFormat::Json => print_json(&summary)?,
        OutputFormat::Table => {
            print_success(&format!("Model {} reloaded", name));
            println!("Version: {}", summary.version);
            println!("Status:  {}", color_status(&summary.status));
        }
    }
    Ok(())
}
