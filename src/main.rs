//! Simulated pool runner.
//!
//! Builds a small pool on mock hardware (two slit blades, a two-circle
//! diffractometer and a three-channel counter card), runs one operation and
//! prints every notification as a JSON line.
//!
//! ```bash
//! motion-pool-sim move diff 10 20
//! motion-pool-sim move slit 4 0.5
//! motion-pool-sim acquire --preset 0.5
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

use motion_pool::config::PoolConfig;
use motion_pool::element::Family;
use motion_pool::hardware::{MockCounterController, MockMotorController, SlitController};
use motion_pool::logging::init_tracing;
use motion_pool::{AcquisitionSpec, PoolEngine, PoolEvent};

#[derive(Parser)]
#[command(name = "motion-pool-sim")]
#[command(about = "Run group operations against simulated hardware", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "MOTION_POOL_CONFIG", default_value = "config/pool.toml")]
    config: PathBuf,

    /// Print the group state after the operation
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Move a group (diff, slit or all) to the given user positions
    Move {
        group: String,
        #[arg(allow_hyphen_values = true)]
        positions: Vec<f64>,
    },
    /// Count on the measurement group
    Acquire {
        /// Integration time in seconds
        #[arg(short, long, default_value_t = 1.0)]
        preset: f64,
        /// Master channel
        #[arg(short, long, default_value = "timer")]
        master: String,
    },
    /// Print the effective configuration as TOML
    Config,
}

fn build_pool(engine: &PoolEngine) -> Result<()> {
    let registry = engine.registry();

    let motors = registry.register_hardware("motctrl01", Arc::new(MockMotorController::new(4)))?;
    for (axis, name) in ["blade_top", "blade_bottom", "th", "tth"].into_iter().enumerate() {
        registry.register_physical(name, motors, axis, Family::Motor)?;
    }
    registry.set_backlash("th", -0.05)?;

    let slit = registry.register_pseudo("slitctrl01", Arc::new(SlitController))?;
    registry.register_pseudo_element("gap", slit, 0, &["blade_top", "blade_bottom"])?;
    registry.register_pseudo_element("offset", slit, 1, &["blade_top", "blade_bottom"])?;

    let counters = registry.register_hardware("ctctrl01", Arc::new(MockCounterController::new(3)))?;
    for (axis, name) in ["timer", "ct01", "ct02"].into_iter().enumerate() {
        registry.register_physical(name, counters, axis, Family::CounterTimer)?;
    }

    registry.create_group("diff", &["th", "tth"])?;
    registry.create_group("slit", &["gap", "offset"])?;
    registry.create_group("all", &["slit", "diff"])?;
    registry.create_group("mntgrp", &["timer", "ct01", "ct02"])?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = PoolConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    init_tracing(&config.logging);

    let engine = PoolEngine::new(config.engine.clone());
    build_pool(&engine)?;
    let mut events = engine.subscribe();

    let (group, handle) = match cli.command {
        Commands::Config => {
            print!("{}", config.to_toml()?);
            return Ok(());
        }
        Commands::Move { group, positions } => {
            let handle = engine.execute(&group, &positions, true).await?;
            (group, handle)
        }
        Commands::Acquire { preset, master } => {
            let spec = AcquisitionSpec { master, preset };
            let handle = engine.acquire("mntgrp", spec, true).await?;
            ("mntgrp".to_string(), handle)
        }
    };
    info!(session = %handle.id(), %group, "operation started");

    loop {
        match events.recv().await {
            Ok(event) => {
                println!("{}", serde_json::to_string(&event)?);
                if matches!(event, PoolEvent::GroupOperationEnded { .. }) {
                    break;
                }
            }
            Err(RecvError::Lagged(missed)) => tracing::warn!(missed, "notifications dropped"),
            Err(RecvError::Closed) => break,
        }
    }

    let outcome = handle.wait().await;
    info!(?outcome, "operation finished");
    if cli.verbose {
        let status = engine.current_state(&group).await?;
        println!("{}: {}\n{}", group, status.state, status.diagnostic);
        println!("{:?}", engine.current_user_vector(&group).await?);
    }
    Ok(())
}
