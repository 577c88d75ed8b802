//! Wayfinder operator CLI.
//!
//! Validates stored flows, previews variant assignment and summarizes
//! recorded analytics.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use wayfinder_analytics::{FlowStats, JsonLinesStore};
use wayfinder_codec::{deserialize, prepare_save, EncodedFlow, StepRow, VariantRow};
use wayfinder_core::config::WayfinderConfig;
use wayfinder_core::types::Variant;
use wayfinder_segmentation::{bucket, validate_allocation, AllocationSummary, SegmentationResolver};

#[derive(Parser, Debug)]
#[command(name = "wayfinder")]
#[command(about = "Operator tools for Wayfinder onboarding flows")]
#[command(version)]
struct Cli {
    /// Optional config file (TOML), layered under WAYFINDER__* variables
    #[arg(long, global = true, env = "WAYFINDER_CONFIG")]
    config: Option<String>,

    /// Application id (overrides config)
    #[arg(long, global = true, env = "WAYFINDER__APP_ID")]
    app_id: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode a flow from its step rows and check it can be saved
    Validate {
        /// JSON array of step rows
        #[arg(long)]
        steps: PathBuf,
        /// JSON array of variant rows
        #[arg(long)]
        variants: Option<PathBuf>,
        /// Flow id (defaults to the first row's flow id)
        #[arg(long)]
        flow_id: Option<String>,
    },
    /// Show which variant a visitor lands in
    Assign {
        #[arg(long)]
        flow_id: String,
        #[arg(long)]
        visitor: String,
        /// JSON array of variants
        #[arg(long)]
        variants: PathBuf,
    },
    /// Aggregate per-step statistics from an NDJSON analytics file
    Stats {
        #[arg(long)]
        events: PathBuf,
        /// Only report this flow
        #[arg(long)]
        flow_id: Option<String>,
    },
}

#[derive(Serialize)]
struct ValidationReport {
    flow_id: String,
    nodes: usize,
    edges: usize,
    entry_node: Option<String>,
    warnings: Vec<String>,
    allocation: AllocationSummary,
}

#[derive(Serialize)]
struct AssignmentReport {
    flow_id: String,
    visitor_id: String,
    bucket: f64,
    /// `None` is the control path.
    variant: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout stays parseable.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wayfinder=info".into()),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();

    let mut config = WayfinderConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        WayfinderConfig::default()
    });
    if let Some(app_id) = cli.app_id {
        config.app_id = app_id;
    }
    info!(app_id = %config.app_id, "Configuration loaded");

    match cli.command {
        Command::Validate {
            steps,
            variants,
            flow_id,
        } => {
            let report = validate(&steps, variants.as_deref(), flow_id)?;
            print_json(&report)
        }
        Command::Assign {
            flow_id,
            visitor,
            variants,
        } => {
            let variants: Vec<Variant> = read_json(&variants)?;
            let variant = SegmentationResolver::new().assign(&flow_id, &visitor, &variants);
            print_json(&AssignmentReport {
                bucket: bucket(&flow_id, &visitor),
                flow_id,
                visitor_id: visitor,
                variant,
            })
        }
        Command::Stats { events, flow_id } => {
            let rows = JsonLinesStore::new(&events)
                .read_all()
                .await
                .with_context(|| format!("reading {}", events.display()))?;
            info!(rows = rows.len(), "Loaded analytics rows");
            match flow_id {
                Some(flow_id) => print_json(&FlowStats::from_rows(&flow_id, &rows)),
                None => print_json(&FlowStats::group(&rows)),
            }
        }
    }
}

fn validate(
    steps: &Path,
    variants: Option<&Path>,
    flow_id: Option<String>,
) -> anyhow::Result<ValidationReport> {
    let steps: Vec<StepRow> = read_json(steps)?;
    let variants: Vec<VariantRow> = match variants {
        Some(path) => read_json(path)?,
        None => Vec::new(),
    };
    let flow_id = flow_id
        .or_else(|| steps.first().map(|row| row.flow_id.clone()))
        .context("no flow id given and no step rows to take one from")?;

    let encoded = EncodedFlow {
        flow_id,
        steps,
        variants,
    };
    let decoded = deserialize(&encoded)?;
    for warning in &decoded.warnings {
        warn!(node_id = %warning.node_id, "{}", warning.message);
    }

    prepare_save(&decoded.flow)?;
    let allocation = validate_allocation(&decoded.flow.variants)?;

    let flow = decoded.flow;
    Ok(ValidationReport {
        entry_node: flow.entry_node().map(|n| n.id.clone()),
        nodes: flow.nodes.len(),
        edges: flow.edges.len(),
        warnings: decoded.warnings.iter().map(ToString::to_string).collect(),
        allocation,
        flow_id: flow.id,
    })
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
