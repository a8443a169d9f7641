//! Chainwatch operator CLI
//!
//! A command-line tool for inspecting attack chains, managing models and
//! submitting events and analyst feedback to a Chainwatch agent.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{chains, events, models};
use std::path::PathBuf;

/// Chainwatch threat engine CLI
#[derive(Parser)]
#[command(name = "cw")]
#[command(author, version, about = "CLI for the Chainwatch threat engine", long_about = None)]
pub struct Cli {
    /// Agent API URL (can also be set via CW_API_URL env var)
    #[arg(long, env = "CW_API_URL")]
    pub api_url: Option<String>,

    /// Output format
    #[arg(long, short)]
    pub format: Option<output::OutputFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect and resolve attack chains
    #[command(subcommand)]
    Chains(ChainCommands),

    /// Inspect and reload models
    #[command(subcommand)]
    Models(ModelCommands),

    /// Submit events from a JSON file (one event or an array)
    Submit {
        /// Path to the event file
        file: PathBuf,
    },

    /// Correct the label of a classified event
    Feedback {
        /// Event ID
        event_id: String,

        /// Correct threat label (e.g. benign, reconnaissance)
        label: String,
    },
}

#[derive(Subcommand)]
pub enum ChainCommands {
    /// List open attack chains
    List {
        /// Filter by actor
        #[arg(long, short)]
        actor: Option<String>,

        /// Filter by asset
        #[arg(long)]
        asset: Option<String>,
    },

    /// Show one chain with its stages
    Get {
        /// Chain ID
        id: String,
    },

    /// Close a chain
    Resolve {
        /// Chain ID
        id: String,

        /// Mark the chain as a false positive instead of resolved
        #[arg(long)]
        false_positive: bool,
    },
}

#[derive(Subcommand)]
pub enum ModelCommands {
    /// List registered models
    List,

    /// Show serving metrics for a model
    Metrics {
        /// Model name
        name: String,
    },

    /// Reload a model in place
    Reload {
        /// Model name
        name: String,

        /// New weights file; the current source when omitted
        #[arg(long)]
        file: Option<String>,

        /// Expected SHA256 of the weights file
        #[arg(long, requires = "file")]
        checksum: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load()?;

    let format = match cli.format {
        Some(format) => format,
        None => config
            .default_format
            .as_deref()
            .and_then(|f| f.parse().ok())
            .unwrap_or_default(),
    };

    // Initialize client
    let client = client::ApiClient::new(&config.api_url(cli.api_url))?;

    // Execute command
    match cli.command {
        Commands::Chains(chain_cmd) => match chain_cmd {
            ChainCommands::List { actor, asset } => {
                chains::list_chains(&client, actor, asset, format).await?;
            }
            ChainCommands::Get { id } => {
                chains::get_chain(&client, &id, format).await?;
            }
            ChainCommands::Resolve { id, false_positive } => {
                chains::resolve_chain(&client, &id, false_positive, format).await?;
            }
        },
        Commands::Models(model_cmd) => match model_cmd {
            ModelCommands::List => {
                models::list_models(&client, format).await?;
            }
            ModelCommands::Metrics { name } => {
                models::model_metrics(&client, &name, format).await?;
            }
            ModelCommands::Reload { name, file, checksum } => {
                models::reload_model(&client, &name, file, checksum, format).await?;
            }
        },
        Commands::Submit { file } => {
            events::submit(&client, &file, format).await?;
        }
        Commands::Feedback { event_id, label } => {
            events::feedback(&client, &event_id, &label, format).await?;
        }
    }

    Ok(())
}
