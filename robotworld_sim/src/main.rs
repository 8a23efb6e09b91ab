//! RobotWorld Simulator CLI
//!
//! Runs deterministic protocol scenarios, or a single TCP peer when
//! `--listen`/`--connect` is given.

use clap::Parser;
use robotworld_core::{EndpointConfig, Message, MessageType, Trace, TraceTarget, WorldTracer};
use robotworld_sim::scenarios::ScenarioId;
use robotworld_sim::{serve_duration, PeerNode, ScenarioResult, ScenarioRunner, SimConfig, SimError};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// RobotWorld Deterministic Simulation CLI
#[derive(Parser, Debug)]
#[command(name = "robotworld-sim")]
#[command(about = "Run deterministic protocol scenarios or a RobotWorld TCP peer", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Number of simulated peers
    #[arg(short, long, default_value = "2")]
    peers: usize,

    /// Scenario to run (echo, mirror_populate, start_stop, reconcile, split_brain, lossy_link, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Maximum simulation duration in seconds (peer mode: how long to serve)
    #[arg(short, long, default_value = "10")]
    duration: f64,

    /// Simulation config file (JSON); overrides seed, peers and duration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Export per-frame world snapshots of a single scenario to a JSON file
    #[arg(long)]
    export: Option<PathBuf>,

    /// Peer mode: accept connections on this address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Peer mode: connect to this address and send requests
    #[arg(long)]
    connect: Option<SocketAddr>,

    /// Peer mode: world layout to populate (0-5)
    #[arg(short, long, default_value = "0")]
    world: i64,

    /// Peer mode: where world dumps go (console, discard, file:<path>)
    #[arg(long, default_value = "discard")]
    trace: TraceTarget,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    if args.listen.is_some() || args.connect.is_some() {
        if let Err(e) = run_peer(&args).await {
            error!("Peer failed: {}", e);
            std::process::exit(1);
        }
        return;
    }

    let config = match &args.config {
        Some(path) => match SimConfig::load(path) {
            Ok(config) => Some(config),
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        },
        None => None,
    };

    if !args.json {
        info!("RobotWorld Simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    // Parse scenarios
    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        vec![args.scenario.parse().unwrap_or_else(|e| {
            eprintln!("Error: {}", e);
            let names: Vec<&str> = ScenarioId::all().iter().map(|s| s.name()).collect();
            eprintln!("Available scenarios: {}, all", names.join(", "));
            std::process::exit(1);
        })]
    };

    // Determine base seed
    let base_seed = match &config {
        Some(config) => config.seed,
        None if args.seed == 0 => std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(42),
        None => args.seed,
    };

    let runner_for = |seed: u64| match &config {
        Some(config) => ScenarioRunner::from_config(&SimConfig {
            seed,
            ..config.clone()
        }),
        None => ScenarioRunner::new(seed, args.peers).with_duration(args.duration),
    };

    // Handle --export mode
    if let Some(export_path) = &args.export {
        if scenarios.len() > 1 {
            eprintln!("Error: --export only supports a single scenario, not 'all'");
            std::process::exit(1);
        }

        let (result, export) = runner_for(base_seed).run_with_export(scenarios[0]).await;
        match export.write_to_file(export_path) {
            Ok(()) => info!("Exported {} frames to {}", export.frames.len(), export_path.display()),
            Err(e) => error!("Failed to write export: {}", e),
        }
        report(&result, args.json);

        if !result.passed {
            std::process::exit(1);
        }
        return;
    }

    // Run simulations
    let mut all_results: Vec<ScenarioResult> = Vec::new();
    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);
        let runner = runner_for(seed);

        for scenario in &scenarios {
            let result = runner.run(*scenario).await;
            report(&result, args.json);
            all_results.push(result);
        }
    }

    // Summary
    let total = all_results.len();
    let failed_count = all_results.iter().filter(|r| !r.passed).count();
    let passed = total - failed_count;

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": passed,
            "failed": failed_count,
            "results": all_results.iter().map(|r| {
                serde_json::json!({
                    "scenario": r.scenario.name(),
                    "seed": r.seed,
                    "passed": r.passed,
                    "ticks": r.total_ticks,
                    "time_secs": r.final_time_secs,
                    "entities": r.final_entity_count,
                    "metrics": r.metrics,
                    "failure_reason": r.failure_reason,
                })
            }).collect::<Vec<_>>(),
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{}", json),
            Err(e) => error!("Failed to encode summary: {}", e),
        }
    } else {
        info!("");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        if failed_count == 0 {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed_count, total);

            for result in all_results.iter().filter(|r| !r.passed) {
                error!(
                    "  - {} seed={}: {}",
                    result.scenario.name(),
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    // Exit with proper code for CI
    if failed_count > 0 {
        std::process::exit(1);
    }
}

fn report(result: &ScenarioResult, json: bool) {
    if json {
        return;
    }
    if result.passed {
        info!(
            "✓ {} (seed={}) PASSED in {} ticks",
            result.scenario.name(),
            result.seed,
            result.total_ticks
        );
    } else {
        error!(
            "✗ {} (seed={}) FAILED: {}",
            result.scenario.name(),
            result.seed,
            result.failure_reason.as_deref().unwrap_or("unknown")
        );
    }
}

/// Serves one robot over TCP for `--duration` seconds. With `--connect` it
/// also mirrors its layout to the peer and checks the link with an echo.
async fn run_peer(args: &Args) -> Result<(), SimError> {
    let serve_for = serve_duration(args.duration)?;
    let config = EndpointConfig::default().with_name(format!("world-{}", args.world));
    let node = PeerNode::new(config);

    let trace = Trace::shared();
    trace.select(&args.trace)?;
    node.world.attach(Arc::new(WorldTracer::new(trace)));
    node.world.populate(args.world, false);

    if let Some(addr) = args.listen {
        let bound = node.listen(addr).await?;
        info!("Node {} serving world {} on {}", node.node_id(), args.world, bound);
    }
    let task = node.spawn();

    if let Some(addr) = args.connect {
        node.connect(addr).await?;

        let answer = node
            .request(Message::with_payload(MessageType::PopulateRequest, args.world.to_string()))
            .await?;
        info!("Populate answered: {}", answer);

        let answer = node
            .request(Message::with_payload(MessageType::EchoRequest, "Hello world!"))
            .await?;
        if answer.kind() != MessageType::EchoResponse {
            node.shutdown();
            return Err(SimError::Peer(format!("echo failed: {}", answer)));
        }
        info!("Echo answered: {}", answer);
    }

    tokio::time::sleep(serve_for).await;
    info!("{}", node.world.as_string());
    node.shutdown();
    let _ = task.await;
    Ok(())
}
