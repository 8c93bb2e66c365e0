use clap::Parser;
use log::info;
use std::time::{Duration, Instant};

use crossflow::{SimConfig, SimulationController, TopologyBuilder};

#[derive(Parser)]
#[command(name = "crossflow")]
#[command(about = "Concurrent traffic-flow simulation on a demo grid city")]
struct Cli {
    /// Grid rows
    #[arg(long, default_value = "3")]
    rows: usize,

    /// Grid columns
    #[arg(long, default_value = "3")]
    cols: usize,

    /// Maximum number of vehicles alive at once
    #[arg(long, default_value = "15")]
    population: usize,

    /// How long to run, in seconds
    #[arg(long, default_value = "30")]
    duration: u64,

    /// Seed for reproducible spawning
    #[arg(long)]
    seed: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let blueprint = TopologyBuilder::grid(cli.rows, cli.cols);
    let config = SimConfig {
        population_cap: cli.population,
        seed: cli.seed,
        ..SimConfig::default()
    };

    let mut controller = SimulationController::new(blueprint, config)?;
    info!(
        "crossflow: {}x{} grid, population cap {}, running for {}s",
        cli.rows, cli.cols, cli.population, cli.duration
    );
    controller.start();

    let deadline = Instant::now() + Duration::from_secs(cli.duration);
    while Instant::now() < deadline {
        std::thread::sleep(Duration::from_secs(2).min(deadline - Instant::now()));
        print_progress(&controller);
    }

    controller.stop();
    controller.stats().log_summary();
    Ok(())
}

fn print_progress(controller: &SimulationController) {
    let snapshot = controller.snapshot();
    let stats = &snapshot.stats;
    info!(
        "active {} | spawned {} | completed {} | abandoned {} | avg congestion {:.2}",
        stats.active_agents,
        stats.total_spawned,
        stats.completed,
        stats.abandoned,
        stats.average_congestion
    );
    for signal in &snapshot.signals {
        log::debug!(
            "signal on {}: {} for {:.1}s",
            signal.road,
            signal.phase,
            signal.time_in_phase.as_secs_f32()
        );
    }
}
