//! # VCU Pipeline Entry Point
//!
//! Runs the telemetry/actuation loop against one vehicle interface until the operator sends
//! `exit`, Ctrl-C is pressed, or `--duration-secs` elapses.
//!
//! ## Outputs
//! - `data/episodes.csv`: one row per finished or interrupted episode.
//! - Status: `http://127.0.0.1:8080/health` (configurable, optional).

use std::{path::PathBuf, sync::Arc, thread, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};

use vcu_pipeline::{
    config::{
        AppConfig, FlashKind, ProbeKind,
        vehicles::{VehicleProfile, VehicleRegistry},
    },
    conn::{
        SharedClient, client,
        probe::{LivenessProbe, PingProbe, TcpProbe},
        sim::{FlashBackend, SimVehicle},
        tbox::{TboxFlasher, TboxPaths},
    },
    control::{agent::RandomAgent, episode::EpisodeLoop, exit::ExitToken},
    utils::{
        episode_log::EpisodeLog,
        health::{bind_health, spawn_health_server},
    },
    vehicle::interface::VehicleInterface,
};

/// Closed-loop torque-table calibration pipeline
#[derive(Parser, Debug)]
#[command(name = "vcu_pipeline")]
#[command(about = "Capture vehicle telemetry, drive an agent, flash torque tables", long_about = None)]
#[command(version)]
struct Args {
    /// Path to the TOML configuration (defaults apply when omitted)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Vehicle id from the built-in registry, overrides the config file
    #[arg(long, value_name = "VID")]
    vehicle: Option<String>,

    /// Stop after this many seconds
    #[arg(long, value_name = "SECS")]
    duration_secs: Option<u64>,
}

fn build_client(config: &AppConfig, profile: &VehicleProfile) -> SharedClient {
    let t = &config.transport;
    let backend = match t.flash {
        FlashKind::Loopback => FlashBackend::Loopback,
        FlashKind::Tbox => FlashBackend::Tbox(
            TboxFlasher::new(TboxPaths::under(&t.tbox_root), t.diff_flash).with_timeouts(
                Duration::from_millis(t.diff_timeout_ms),
                Duration::from_millis(t.full_timeout_ms),
            ),
        ),
    };
    let mut sim = SimVehicle::new(profile.interface.geometry(), t.seed, backend)
        .with_fault_rate(t.fault_rate);
    if t.unpaced {
        sim = sim.unpaced();
    }
    client::shared(sim)
}

fn build_probe(config: &AppConfig) -> Arc<dyn LivenessProbe> {
    let p = &config.probe;
    match p.kind {
        ProbeKind::Ping => Arc::new(PingProbe::new(p.target.clone())),
        ProbeKind::Tcp => Arc::new(TcpProbe::new(p.target.clone(), Duration::from_millis(p.timeout_ms))),
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    info!("=== VCU PIPELINE START ===");

    let mut config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    if let Some(vid) = args.vehicle {
        config.vehicle.vid = vid;
    }
    config.validate()?;

    let registry = VehicleRegistry::builtin();
    let profile = registry.by_vid(&config.vehicle.vid).cloned().with_context(|| {
        format!(
            "unknown vehicle {:?}, known: {}",
            config.vehicle.vid,
            registry.vids().collect::<Vec<_>>().join(", ")
        )
    })?;
    info!(
        "Vehicle {} ({:?}, {} interface), table {}x{}",
        profile.vid,
        profile.maturity,
        profile.interface.name(),
        profile.table_rows(),
        profile.table_cols()
    );

    let exit = ExitToken::new();
    {
        let exit = exit.clone();
        ctrlc::set_handler(move || {
            info!("Ctrl-C received, shutting down");
            exit.trigger();
        })
        .context("failed to install Ctrl-C handler")?;
    }

    let interface = VehicleInterface::new(
        profile.clone(),
        build_client(&config, &profile),
        build_probe(&config),
        config.interface_settings(),
    );
    let (link, workers) = interface.start(exit.clone(), config.hmi_source()?)?;
    let poll = config.interface_settings().poll;

    let health = match &config.output.health_bind {
        Some(bind) => {
            let addr = bind.parse().with_context(|| format!("bad health bind {bind:?}"))?;
            let listener = bind_health(addr).with_context(|| format!("cannot bind health endpoint {bind}"))?;
            Some(spawn_health_server(listener, link.status.clone(), exit.clone(), poll)?)
        }
        None => None,
    };

    if let Some(secs) = args.duration_secs {
        let exit = exit.clone();
        thread::Builder::new().name("timer".into()).spawn(move || {
            if !exit.sleep(Duration::from_secs(secs)) {
                info!("Run duration of {}s reached", secs);
                exit.trigger();
            }
        })?;
    }

    let mut agent = RandomAgent::new(config.agent.seed, profile.flash_numel(), config.agent.exploration_nm);
    if let Some(dir) = &config.agent.checkpoint_dir {
        agent = agent.with_checkpoint_dir(dir);
    }
    let mut episodes = EpisodeLoop::new(agent, profile, link, exit.clone(), config.episode_settings());
    if let Some(path) = &config.output.episode_log {
        let log = EpisodeLog::open(path)
            .with_context(|| format!("cannot open episode log {}", path.display()))?;
        episodes = episodes.with_log(log);
    }

    let loop_result = episodes.run();
    exit.trigger();
    let workers_result = workers.join();
    if let Some(handle) = health {
        if handle.join().is_err() {
            error!("health endpoint thread panicked");
        }
    }

    loop_result.context("episode loop failed")?;
    workers_result.context("pipeline worker failed")?;
    info!(
        "=== VCU PIPELINE FINISHED ({} episodes) ===",
        episodes.history().len()
    );
    Ok(())
}
