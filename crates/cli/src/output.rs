//! Output formatting utilities

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Self as ValueEnum>::from_str(s, true)
    }
}

/// Print rows as a table, or the raw items as JSON
pub fn print_rows<T: Serialize, R: Tabled>(
    items: &[T],
    rows: impl FnOnce(&[T]) -> Vec<R>,
    empty: &str,
    format: OutputFormat,
) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => print_json(items)?,
        OutputFormat::Table => {
            if items.is_empty() {
                print_warning(empty);
                return Ok(());
            }
            let table = Table::new(rows(items)).with(Style::rounded()).to_string();
            println!("{}", table);
        }
    }
    Ok(())
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Format a probability as percentage
pub fn format_confidence(confidence: f64) -> String {
    format!("{:.0}%", confidence * 100.0)
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Color status based on value
pub fn color_status(status: &str) -> String {
    match status.to_lowercase().as_str() {
        "open" | "loading" => status.yellow().to_string(),
        "escalated" => status.red().bold().to_string(),
        "resolved" | "ready" | "healthy" => status.green().to_string(),
        "false_positive" => status.dimmed().to_string(),
        "degraded" | "warning" => status.yellow().to_string(),
        "error" | "unhealthy" => status.red().to_string(),
        _ => status.to_string(),
    }
}

/// Color a 0-10 risk score
pub fn color_risk(risk: f32) -> String {
    let formatted = format!("{:.1}", risk);
    if risk >= 7.0 {
        formatted.red().bold().to_string()
    } else if risk >= 4.0 {
        formatted.yellow().to_string()
    } else {
        formatted.green().to_string()
    }
}

/// Color confidence based on value
pub fn color_confidence(confidence: f64) -> String {
    let formatted = format_confidence(confidence);
    if confidence >= 0.8 {
        formatted.red().to_string()
    } else if confidence >= 0.5 {
        formatted.yellow().to_string()
    } else {
        formatted.normal().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_confidence_rounds() {
        assert_eq!(format_confidence(0.876), "88%");
        assert_eq!(format_confidence(0.0), "0%");
    }

    #[test]
    fn test_output_format_parses_case_insensitively() {
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert_eq!("table".parse::<OutputFormat>().unwrap(), OutputFormat::Table);
        assert!("yaml".parse::<OutputFormat>().is_err());
    }
}
