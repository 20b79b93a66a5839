//! LabelView Simulator CLI
//!
//! Run deterministic annotation-session scenarios.

use clap::Parser;
use labelview_sim::scenarios::ScenarioId;
use labelview_sim::{ScenarioResult, ScenarioRunner};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// LabelView Deterministic Simulation CLI
#[derive(Parser, Debug)]
#[command(name = "labelview-sim")]
#[command(about = "Run deterministic simulation scenarios for LabelView", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Scenario to run (autosave_storm, flaky_storage, track_sweep, projection_sweep, undo_marathon, scene_switch, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Length of the editing phase in seconds
    #[arg(short, long, default_value = "3")]
    duration: f64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,
}

fn main() {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }

    if !args.json {
        info!("LabelView Simulator v{}", env!("CARGO_PKG_VERSION"));
    }

    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        vec![args.scenario.parse().unwrap_or_else(|e| {
            eprintln!("Error: {}", e);
            eprintln!("Available scenarios:");
            for id in ScenarioId::all() {
                eprintln!("  {:<18} {}", id.name(), id.description());
            }
            std::process::exit(1);
        })]
    };

    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1)
    } else {
        args.seed
    };

    let mut all_results: Vec<ScenarioResult> = Vec::new();

    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);
        let runner = ScenarioRunner::new(seed).with_duration(args.duration);

        for scenario in &scenarios {
            let result = runner.run(*scenario);

            if !args.json {
                if result.passed {
                    info!(
                        "✓ {} (seed={}) PASSED in {} ticks, {} writes",
                        scenario.name(),
                        seed,
                        result.total_ticks,
                        result.metrics.writes
                    );
                } else {
                    error!(
                        "✗ {} (seed={}) FAILED: {}",
                        scenario.name(),
                        seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }
            all_results.push(result);
        }
    }

    let total = all_results.len();
    let failed_count = all_results.iter().filter(|r| !r.passed).count();

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": total - failed_count,
            "failed": failed_count,
            "results": all_results.iter().map(|r| {
                serde_json::json!({
                    "scenario": r.scenario.name(),
                    "seed": r.seed,
                    "passed": r.passed,
                    "ticks": r.total_ticks,
                    "time_secs": r.final_time_secs,
                    "failure_reason": r.failure_reason,
                    "metrics": {
                        "writes": r.metrics.writes,
                        "failed_writes": r.metrics.failed_writes,
                        "saves_started": r.metrics.saves_started,
                        "superseded": r.metrics.superseded,
                        "membership_recomputes": r.metrics.membership_recomputes,
                        "projected_points": r.metrics.projected_points,
                    },
                })
            }).collect::<Vec<_>>(),
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("Failed to render summary: {}", e),
        }
    } else if failed_count == 0 {
        info!("All {} scenario runs passed", total);
    } else {
        error!("{}/{} scenario runs failed", failed_count, total);
        for result in all_results.iter().filter(|r| !r.passed) {
            error!(
                "  - {} seed={}: {}",
                result.scenario.name(),
                result.seed,
                result.failure_reason.as_deref().unwrap_or("unknown")
            );
        }
    }

    if failed_count > 0 {
        std::process::exit(1);
    }
}
