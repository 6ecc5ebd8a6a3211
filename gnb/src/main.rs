//! NR Slot Engine Simulator
//!
//! Runs the configured base stations and terminals on a shared channel for a
//! given simulated time and reports per-cell and per-terminal statistics.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use common::CellId;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use config::GnbConfig;
use layers::mac::RoundRobinScheduler;
use layers::phy::{GnbPhy, SpectrumPhy};
use layers::sim::{Simulation, SimulationReport, Terminal};

/// NR slot engine simulator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (.yml, .yaml or .toml)
    #[arg(short, long, default_value = "config/gnb.yml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error), overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    /// Simulated time in milliseconds, overrides the config file
    #[arg(long)]
    duration_ms: Option<u64>,

    /// Random seed, overrides the config file
    #[arg(long)]
    seed: Option<u64>,

    /// Write the final statistics as JSON to this file
    #[arg(long)]
    stats_json: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = GnbConfig::from_file(&args.config)?;
    if let Some(duration_ms) = args.duration_ms {
        config.simulation.duration_ms = duration_ms;
    }
    if let Some(seed) = args.seed {
        config.simulation.seed = seed;
    }

    // Initialize logging
    let level = args.log_level.clone().unwrap_or_else(|| config.log.level.clone());
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting NR slot engine simulator");
    info!("Configuration file: {}", args.config.display());
    info!(
        "{} cells, {} UEs, {} ms simulated, seed {}",
        config.cells.len(),
        config.ues.len(),
        config.simulation.duration_ms,
        config.simulation.seed
    );

    let stop = Arc::new(AtomicBool::new(false));
    let started = Instant::now();

    // The simulation is single threaded and not Send; build and run it on
    // the blocking pool.
    let mut sim_handle = {
        let stop = Arc::clone(&stop);
        let config = config.clone();
        tokio::task::spawn_blocking(move || run_simulation(&config, stop))
    };

    let report = tokio::select! {
        res = &mut sim_handle => res.context("simulation task failed")??,
        _ = tokio::signal::ctrl_c() => {
            warn!("Received shutdown signal, stopping the simulation");
            stop.store(true, Ordering::Relaxed);
            sim_handle.await.context("simulation task failed")??
        }
    };

    info!(
        "Simulated {} us in {:?} ({} events)",
        report.simulated_time_us,
        started.elapsed(),
        report.events
    );
    log_report(&report);

    if let Some(path) = &args.stats_json {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        info!("Statistics written to {}", path.display());
    }

    info!("Simulator shutdown complete");
    Ok(())
}

fn run_simulation(config: &GnbConfig, stop: Arc<AtomicBool>) -> Result<SimulationReport> {
    let seed = config.simulation.seed;
    let mut sim = Simulation::with_stop_flag(config.channel_model(), stop);

    for (index, cell) in config.cells.iter().enumerate() {
        let cell_seed = seed.wrapping_add(index as u64);
        let phy_config = cell.phy_config()?;
        let radio = SpectrumPhy::new(cell.radio_config(cell_seed)?, cell.error_model.build());
        let mac = RoundRobinScheduler::new(cell.scheduler_config())?;
        let stats = mac.stats_handle();
        let phy = GnbPhy::new(
            phy_config,
            radio,
            Box::new(mac),
            cell.channel_access_manager(cell_seed),
        )?;
        sim.add_gnb(phy, cell.position.into(), Some(stats))?;
    }

    for (index, ue) in config.ues.iter().enumerate() {
        let Some(cell) = config.cell(ue.cell_id) else {
            anyhow::bail!("UE {} refers to unknown cell {}", ue.rnti, ue.cell_id);
        };
        let ue_seed = seed.wrapping_add(1000 + index as u64);
        let (terminal_config, radio_config) = ue.terminal_config(cell, ue_seed)?;
        let radio = SpectrumPhy::new(radio_config, cell.error_model.build());
        sim.add_terminal(Terminal::new(terminal_config, radio)?, ue.position.into())?;
    }

    let end = Duration::from_millis(config.simulation.duration_ms);
    if let Err(e) = sim.run_until(end) {
        error!("Simulation aborted at {:?}: {}", sim.now(), e);
        return Err(e.into());
    }

    for cell in &config.cells {
        if let Some(phy) = sim.gnb(CellId(cell.cell_id)) {
            info!(
                "Cell {} ended in slot {} with channel {}",
                cell.cell_id,
                phy.current_slot(),
                phy.channel_status()
            );
        }
    }
    Ok(sim.report())
}

fn log_report(report: &SimulationReport) {
    for cell in &report.cells {
        info!("Cell {} PHY statistics:", cell.cell_id);
        info!(
            "  Slots: {} ({} with the channel), requests {}, grants {}, denials {}",
            cell.phy.slots, cell.phy.granted_slots, cell.phy.access_requests, cell.phy.grants, cell.phy.denials
        );
        info!(
            "  DL CTRL bursts {}, DL DATA bursts {}, UL blocks expected {}, re-queued allocations {}, lapsed data {}",
            cell.phy.dl_ctrl_bursts,
            cell.phy.dl_data_bursts,
            cell.phy.ul_data_expected,
            cell.phy.requeued_allocations,
            cell.phy.lapsed_data
        );
        info!("  RX ok {}, corrupted {}", cell.phy.rx_ok, cell.phy.rx_corrupted);
        if let Some(mac) = &cell.scheduler {
            info!(
                "  Scheduler: DL new {} retx {} ack {} nack {}, UL new {} retx {}, {} UL bytes, {} RACH, {} dropped",
                mac.dl_new_tx,
                mac.dl_retx,
                mac.dl_acks,
                mac.dl_nacks,
                mac.ul_new_tx,
                mac.ul_retx,
                mac.ul_rx_bytes,
                mac.rach_received,
                mac.dropped_tbs
            );
        }
    }
    for ue in &report.terminals {
        info!(
            "UE {} (cell {}): synchronized {}, DL ok {} corrupted {} ({} bytes), UL {} bytes",
            ue.rnti,
            ue.cell_id,
            ue.synchronized,
            ue.stats.dl_tb_ok,
            ue.stats.dl_tb_corrupted,
            ue.stats.dl_rx_bytes,
            ue.stats.ul_tx_bytes
        );
    }
}
