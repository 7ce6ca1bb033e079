use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use fabric_chaos::{compile_schedule, ChaosEngine, OverridesSink};
use fabric_io::{load_nodes_dir, load_topology};

/// Fault injection engine for the fabric digital twin.
#[derive(Parser)]
#[command(name = "fabric-chaos", version, about)]
struct Cli {
    /// Topology document with links, scenarios, and chaos event lists
    #[arg(long, default_value = "sim/topology.yaml")]
    topology: PathBuf,

    /// Scenario name; omit to run only the top-level chaos list
    #[arg(long)]
    scenario: Option<String>,

    /// Virtual-time acceleration factor (e.g. 20 for 20x)
    #[arg(long, default_value_t = 1.0)]
    speed: f64,

    /// Print the compiled schedule without applying anything
    #[arg(long)]
    dry_run: bool,

    /// Execute the schedule
    #[arg(long)]
    run: bool,

    /// Overrides document the state store watches
    #[arg(long, default_value = "sim/overrides.json")]
    overrides: PathBuf,

    /// Directory of node descriptors, for label-targeted events
    #[arg(long, default_value = "nodes")]
    nodes: PathBuf,

    /// Optional observe endpoint to push each change to
    #[arg(long)]
    observe: Option<String>,
}

async fn execute(cli: Cli) -> Result<()> {
    if !cli.topology.exists() {
        bail!("topology {} does not exist", cli.topology.display());
    }
    let topology = load_topology(&cli.topology)
        .with_context(|| format!("loading {}", cli.topology.display()))?;
    let schedule = compile_schedule(&topology, cli.scenario.as_deref())?;

    if cli.dry_run || !cli.run {
        println!("loaded {} events", schedule.len());
        for ev in &schedule {
            println!("  {}", ev.describe());
        }
        if !cli.run {
            return Ok(());
        }
    }

    // label-targeted events degrade to no-ops without descriptors
    let nodes = load_nodes_dir(&cli.nodes).unwrap_or_default();
    let sink = OverridesSink::new(cli.overrides.clone()).with_observe(cli.observe.clone());
    let mut engine = ChaosEngine::new(sink, cli.speed, &nodes);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping");
            let _ = shutdown_tx.send(true);
        }
    });

    engine.run(&schedule, 0.0, shutdown_rx).await;
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = execute(cli).await {
        eprintln!("fabric-chaos: {e:#}");
        std::process::exit(2);
    }
}
