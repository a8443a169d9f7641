//! Attack chain commands

use anyhow::Result;
use tabled::Tabled;

use crate::client::{ApiClient, AttackChain, ResolveRequest};
use crate::output::{
    color_confidence, color_status, format_confidence, format_timestamp, print_info, print_json,
    print_rows, print_success, OutputFormat,
};

/// Row for chains table
#[derive(Tabled)]
struct ChainRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Rule")]
    rule: String,
    #[tabled(rename = "Actor")]
    actor: String,
    #[tabled(rename = "Asset")]
    asset: String,
    #[tabled(rename = "Tactics")]
    tactics: String,
    #[tabled(rename = "Confidence")]
    confidence: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

/// Row for a chain's stages
#[derive(Tabled)]
struct StageRow {
    #[tabled(rename = "#")]
    number: u32,
    #[tabled(rename = "Tactic")]
    tactic: String,
    #[tabled(rename = "Techniques")]
    techniques: String,
    #[tabled(rename = "Events")]
    events: usize,
    #[tabled(rename = "Confidence")]
    confidence: String,
    #[tabled(rename = "Started")]
    started: String,
}

fn tactics(chain: &AttackChain) -> String {
    chain
        .stages
        .iter()
        .map(|s| s.tactic.as_str())
        .collect::<Vec<_>>()
        .join(" → ")
}

/// List open chains, optionally filtered by actor and asset
pub async fn list_chains(
    client: &ApiClient,
    actor: Option<String>,
    asset: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let chains: Vec<AttackChain> = client
        .get(
            "api/v1/chains",
            &[("actor", actor.as_deref()), ("asset", asset.as_deref())],
        )
        .await?;

    print_rows(
        &chains,
        |chains| {
            chains
                .iter()
                .map(|c| ChainRow {
                    id: c.id.clone(),
                    rule: c.rule_id.clone(),
                    actor: c.actor_id.clone(),
                    asset: c.asset_id.clone(),
                    tactics: tactics(c),
                    confidence: color_confidence(c.confidence),
                    status: color_status(&c.status),
                    updated: format_timestamp(&c.updated_at),
                })
                .collect()
        },
        "No open attack chains",
        format,
    )?;

    if format == OutputFormat::Table && !chains.is_empty() {
        println!("\nTotal: {} chains", chains.len());
    }
    Ok(())
}

fn print_chain(chain: &AttackChain) {
    println!("Chain:      {}", chain.id);
    println!("Rule:       {} ({})", chain.rule_name, chain.rule_id);
    println!("Actor:      {}", chain.actor_id);
    println!("Asset:      {}", chain.asset_id);
    println!("Status:     {}", color_status(&chain.status));
    if let Some(reason) = &chain.close_reason {
        println!("Closed:     {}", reason);
    }
    println!("Confidence: {}", color_confidence(chain.confidence));
    println!("Opened:     {}", format_timestamp(&chain.opened_at));
    println!("Expires:    {}", format_timestamp(&chain.expires_at));

    let rows: Vec<StageRow> = chain
        .stages
        .iter()
        .map(|s| StageRow {
            number: s.stage_number,
            tactic: s.tactic.clone(),
            techniques: s.techniques.join(", "),
            events: s.event_ids.len(),
            confidence: format_confidence(s.confidence),
            started: format_timestamp(&s.started_at),
        })
        .collect();
    println!(
        "\n{}",
        tabled::Table::new(rows).with(tabled::settings::Style::rounded())
    );

    if !chain.weak_links.is_empty() {
        print_info(&format!(
            "{} weak link(s) attached, highest risk {:.1}",
            chain.weak_links.len(),
            chain
                .weak_links
                .iter()
                .map(|l| l.risk_score)
                .fold(0.0_f32, f32::max)
        ));
    }
}

/// Show one chain with its stages
pub async fn get_chain(client: &ApiClient, id: &str, format: OutputFormat) -> Result<()> {
    let chain: AttackChain = client.get(&format!("api/v1/chains/{}", id), &[]).await?;

    match format {
        OutputFormat::Json => print_json(&chain)?,
        OutputFormat::Table => print_chain(&chain),
    }
    Ok(())
}

/// Resolve a chain, or mark it a false positive
pub async fn resolve_chain(
    client: &ApiClient,
    id: &str,
    false_positive: bool,
    format: OutputFormat,
) -> Result<()> {
    let path = format!("api/v1/chains/{}/resolve", id);
    let chain: AttackChain = client.post(&path, &ResolveRequest { false_positive }).await?;

    match format {
        OutputFormat::Json => print_json(&chain)?,
        OutputFormat::Table => {
            print_success(&format!("Chain {} marked {}", id, chain.status));
            println!("Stages: {}", tactics(&chain));
        }
    }
    Ok(())
}
