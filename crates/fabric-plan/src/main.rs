use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fabric_core::{FabricStore, FederatedPlanner, GreedyPlanner, PlanMode, PlanResult, StoreConfig};
use fabric_io::load_jobs;

/// Submit jobs to the fabric digital twin planner.
#[derive(Parser)]
#[command(name = "fabric-plan", version, about)]
struct Cli {
    /// Directory of node descriptors
    #[arg(long, default_value = "nodes")]
    nodes: PathBuf,

    /// Topology document (links and network defaults); optional on disk
    #[arg(long, default_value = "sim/topology.yaml")]
    topology: PathBuf,

    /// Standing overrides document, merged when present
    #[arg(long, default_value = "sim/overrides.json")]
    overrides: PathBuf,

    /// Job file: one job, a list, or {jobs: [...]}
    #[arg(long)]
    job: PathBuf,

    /// greedy | cheapest-energy | resilient | network-aware | federated
    #[arg(long, default_value = "greedy")]
    strategy: String,

    /// Plan without reserving capacity
    #[arg(long)]
    dry_run: bool,

    /// Save the full JSON results here
    #[arg(long)]
    out: Option<PathBuf>,
}

enum Strategy {
    Greedy,
    CheapestEnergy,
    Federated(PlanMode),
}

fn parse_strategy(name: &str) -> Strategy {
    match name.trim().to_lowercase().as_str() {
        "greedy" => Strategy::Greedy,
        "cheapest-energy" => Strategy::CheapestEnergy,
        other => Strategy::Federated(PlanMode::parse(other)),
    }
}

fn summarise(result: &PlanResult) {
    let feasible = if result.infeasible { "INFEASIBLE" } else { "ok" };
    let latency = if result.latency_ms.is_finite() {
        format!("{:.1}ms", result.latency_ms)
    } else {
        "inf".to_string()
    };
    let mut line = format!(
        "{:<16} {:<10} latency={:<10} energy={:.3}kJ risk={:.3}",
        result.job_id, feasible, latency, result.energy_kj, result.risk
    );
    if let Some(penalty) = result.slo_penalty {
        line.push_str(&format!(" slo_penalty={penalty:.1}"));
    }
    if let Some(spread) = result.federation_spread {
        line.push_str(&format!(" spread={spread:.2}"));
    }
    if let Some(score) = result.resilience_score {
        line.push_str(&format!(" resilience={score:.2}"));
    }
    println!("{line}");
    for stage in &result.per_stage {
        let node = stage.node.as_deref().unwrap_or("-");
        let mut detail = format!(
            "  {:<12} -> {:<14} compute={:.1}ms xfer={:.1}ms",
            stage.id, node, stage.compute_ms, stage.xfer_ms
        );
        if let Some(reason) = &stage.reason {
            detail.push_str(&format!(" [{reason}]"));
        }
        if !stage.fallbacks.is_empty() {
            detail.push_str(&format!(" fallbacks={}", stage.fallbacks.join(",")));
        }
        println!("{detail}");
    }
}

fn execute(cli: Cli) -> Result<()> {
    if !cli.nodes.exists() {
        bail!("nodes directory {} does not exist", cli.nodes.display());
    }
    let jobs = load_jobs(&cli.job).with_context(|| format!("loading {}", cli.job.display()))?;
    if jobs.is_empty() {
        bail!("no jobs found in {}", cli.job.display());
    }

    // one-shot planning session: load everything once, no watcher
    let store = Arc::new(FabricStore::open(StoreConfig {
        nodes_dir: cli.nodes.clone(),
        topology_path: cli.topology.clone(),
        overrides_path: cli.overrides.clone(),
        watch_interval: Duration::from_millis(500),
    }));
    if store.snapshot().nodes.is_empty() {
        bail!("no node descriptors found under {}", cli.nodes.display());
    }

    let strategy = parse_strategy(&cli.strategy);
    let mut results = Vec::with_capacity(jobs.len());
    for job in &jobs {
        let result = match &strategy {
            Strategy::Greedy => GreedyPlanner::new(Arc::clone(&store)).plan_job(job, cli.dry_run),
            Strategy::CheapestEnergy => {
                GreedyPlanner::cheapest_energy(Arc::clone(&store)).plan_job(job, cli.dry_run)
            }
            Strategy::Federated(mode) => {
                FederatedPlanner::new(Arc::clone(&store)).plan_job(job, cli.dry_run, *mode)
            }
        };
        summarise(&result);
        results.push(result);
    }

    let feasible = results.iter().filter(|r| !r.infeasible).count();
    println!("planned {}/{} jobs feasible", feasible, results.len());

    if let Some(out) = &cli.out {
        let text = serde_json::to_string_pretty(&results)?;
        std::fs::write(out, text).with_context(|| format!("writing {}", out.display()))?;
        println!("results saved to {}", out.display());
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = execute(cli) {
        eprintln!("fabric-plan: {e:#}");
        std::process::exit(2);
    }
}
