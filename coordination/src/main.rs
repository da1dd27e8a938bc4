//! fleetd: runs a fleet coordination kernel until interrupted
//!
//! # Usage
//!
//! ```bash
//! # Defaults, state in ./fleet-state
//! fleetd
//!
//! # From a TOML file, with a different state directory
//! fleetd --config fleet.toml --state-path /var/lib/fleet
//!
//! # Environment overrides
//! FLEET_MIN_AGENTS=2 FLEET_HEALTH_POLICY=terminate fleetd
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use fleet_coordination::{
    BlackboardCoordination, ConsensusGating, FleetConfig, FleetManager,
};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the RocksDB state directory (overrides FLEET_STATE_PATH)
    #[arg(long)]
    state_path: Option<PathBuf>,

    /// Seconds between fleet status lines; 0 disables them
    #[arg(long, default_value_t = 60)]
    status_interval_secs: u64,

    /// Print the effective configuration as TOML and exit
    #[arg(long, default_value_t = false)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fleet_coordination=info".parse()?)
                .add_directive("fleetd=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = FleetConfig::load(args.config.as_deref())?;
    if let Some(path) = args.state_path {
        config.state_path = path;
    }

    if args.print_config {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    info!(
        state_path = %config.state_path.display(),
        health_policy = ?config.health_policy,
        autoscale = config.autoscale.enabled,
        "Starting fleet coordination kernel"
    );

    let consensus_timeout = config.consensus_timeout();
    let hint_ttl = config.hint_ttl();
    let gc_interval = config.gc_interval();

    let fleet = FleetManager::from_config(config);
    fleet
        .initialize()
        .map_err(|e| anyhow::anyhow!("Failed to start fleet: {}", e))?;

    let consensus = ConsensusGating::new(fleet.bus().clone(), Some(fleet.store().clone()))
        .with_default_timeout(consensus_timeout);
    let restored = consensus
        .restore()
        .context("Failed to restore pending proposals")?;
    if restored > 0 {
        info!(restored, "Restored pending proposals");
    }

    let mut blackboard = BlackboardCoordination::new(fleet.bus().clone(), fleet.store().clone());
    if let Some(ttl) = hint_ttl {
        blackboard = blackboard.with_default_ttl(ttl);
    }

    let mut sweep = tokio::time::interval(gc_interval);
    let mut status = (args.status_interval_secs > 0)
        .then(|| tokio::time::interval(Duration::from_secs(args.status_interval_secs)));

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "Signal handler failed, shutting down");
                }
                break;
            }
            _ = sweep.tick() => {
                let expired = consensus.expire_overdue();
                if expired > 0 {
                    info!(expired, "Expired overdue proposals");
                }
                if let Err(e) = blackboard.purge_expired() {
                    warn!(error = %e, "Hint purge failed");
                }
            }
            _ = async {
                match status.as_mut() {
                    Some(interval) => {
                        interval.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            } => {
                let snapshot = fleet.snapshot();
                info!(
                    state = %snapshot.fleet_state,
                    agents = snapshot.total_agents,
                    busy = snapshot.load.busy,
                    unhealthy = snapshot.unhealthy,
                    pending_proposals = consensus.pending().len(),
                    "Fleet status"
                );
            }
        }
    }

    info!("Shutting down");
    drop(consensus);
    fleet
        .shutdown()
        .await
        .map_err(|e| anyhow::anyhow!("Shutdown failed: {}", e))?;
    Ok(())
}
