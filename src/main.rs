use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use v2x_highway::coordination::{CoordinationConfig, FaultProfile, Highway, Role};

#[derive(Parser)]
#[command(name = "v2x_highway")]
#[command(about = "Cooperative highway coordination, run headless on an in-process broker")]
struct Cli {
    /// Number of vehicles to place on the highway
    #[arg(long, default_value = "6")]
    nodes: usize,

    /// Number of coordination ticks to run
    #[arg(long, default_value = "300")]
    ticks: u64,

    /// Time delta per tick in seconds
    #[arg(long, default_value = "0.1")]
    delta: f32,

    /// Seed for vehicle placement and fault injection
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Run each vehicle node on its own thread in real time
    #[arg(long)]
    threaded: bool,

    /// JSON file overriding the default coordination settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Mark a vehicle's driver as drowsy from the start
    #[arg(long)]
    drowsy: Option<String>,

    /// Dispatch an emergency vehicle from this vehicle's node
    #[arg(long)]
    ambulance: Option<String>,

    /// Change every driver's cruise speed by this many steps
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    speed_steps: i32,

    /// Inject duplicated, delayed and dropped messages
    #[arg(long)]
    faults: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info,v2x_highway=info"))
        .init();

    let cli = Cli::parse();
    run_headless(&cli)
}

fn build_highway(cli: &Cli) -> Result<Highway> {
    let config = match &cli.config {
        Some(path) => CoordinationConfig::load(path)?,
        None => CoordinationConfig::default(),
    };

    let mut highway = Highway::new_with_seed(config, cli.seed);
    if cli.faults {
        highway = highway.with_faults(FaultProfile {
            duplicate_rate: 0.1,
            delay_rate: 0.1,
            drop_rate: 0.05,
        });
    }

    highway
        .spawn_random_traffic(cli.nodes)
        .context("Failed to place vehicles")?;

    let speed_delta = cli.speed_steps as f32 * highway.config().speed_step;
    if speed_delta != 0.0 {
        for node in highway.nodes() {
            node.control().request_speed_delta(speed_delta);
        }
    }

    if let Some(id) = &cli.drowsy {
        match highway.node(id) {
            Some(node) => node.control().toggle_drowsy(),
            None => warn!("No vehicle {} to mark drowsy", id),
        }
    }

    if let Some(id) = &cli.ambulance {
        match highway.node(id) {
            Some(node) if node.state().role == Role::Normal => node.control().spawn_emergency(),
            _ => warn!("No vehicle {} to dispatch an emergency vehicle from", id),
        }
    }

    Ok(highway)
}

/// Run the highway without any presentation layer
fn run_headless(cli: &Cli) -> Result<()> {
    let delta = if cli.delta.is_finite() && cli.delta > 0.0 {
        cli.delta
    } else {
        0.1
    };

    println!("Running V2X highway in headless mode...");
    println!("Vehicles: {}, Ticks: {}, Delta: {}s", cli.nodes, cli.ticks, delta);
    println!();

    let mut highway = build_highway(cli)?;

    println!("Initial state:");
    highway.print_summary();
    highway.draw_map();

    if cli.threaded {
        let stop = AtomicBool::new(false);
        highway.run_threaded(Duration::from_secs_f32(delta), cli.ticks, &stop)?;
    } else {
        // Print a summary after every simulated 10 seconds
        let report_every = ((10.0 / delta).ceil() as u64).max(1);
        for tick in 1..=cli.ticks {
            highway.tick(delta);
            if tick % report_every == 0 && tick < cli.ticks {
                println!("--- After tick {} ({:.1}s simulated time) ---", tick, highway.time);
                highway.print_summary();
            }
        }
    }

    println!("=== Final State ===");
    highway.print_summary();
    highway.draw_map();

    let (published, delivered) = highway.broker().stats();
    let stats = &highway.stats;
    info!("SIMULATION COMPLETE");
    info!("Simulated time: {:.1}s", highway.time);
    info!("Vehicles: {}", highway.nodes().len());
    info!("Messages published: {}", published);
    info!("Messages delivered: {}", delivered);
    info!("Malformed messages: {}", stats.messages_malformed);
    info!("Peers evicted: {}", stats.peers_evicted);
    info!("Lane changes deferred: {}", stats.lane_changes_deferred);
    info!("Transport errors: {}", stats.transport_errors);

    Ok(())
}
