// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! VistterStream — on-premise live-video streaming engine
//!
//! Usage:
//!   vistterstream run          --config config.toml
//!   vistterstream probe        --config config.toml
//!   vistterstream check-config --config config.toml

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vistterstream::api;
use vistterstream::config::EngineConfig;
use vistterstream::hardware;
use vistterstream::overlay::OverlayPrefetcher;
use vistterstream::ptz::PtzController;
use vistterstream::relay::RelayPool;
use vistterstream::router::StreamRouter;
use vistterstream::scheduler::Scheduler;
use vistterstream::timeline::TimelineExecutor;
use vistterstream::transcoder::Supervisor;
use vistterstream::watchdog::WatchdogManager;

#[derive(Parser)]
#[command(name = "vistterstream", about = "On-premise live-video streaming engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the engine and block until shutdown.
    Run {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Run the hardware probe once, print the result, and exit.
    Probe {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Load and validate the config file, then exit.
    CheckConfig {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => run_engine(config).await,
        Command::Probe { config } => run_probe(config).await,
        Command::CheckConfig { config } => run_check_config(config),
    }
}

async fn run_engine(config_path: PathBuf) {
    let cfg = match EngineConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let hardware = match hardware::probe(&cfg.engine.transcoder_binary).await {
        Ok(h) => h,
        Err(e) => {
            error!(error = %e, "hardware probe failed");
            std::process::exit(1);
        }
    };
    info!(
        platform = %hardware.platform_label,
        encoder = %hardware.encoder_tag,
        max_concurrent_streams = hardware.max_concurrent_streams,
        "hardware probe complete"
    );

    let supervisor = Arc::new(Supervisor::new(cfg.engine.transcoder_binary.clone(), hardware.clone(), cfg.engine.timeouts_secs.clone()));
    let relay_pool = Arc::new(RelayPool::new(cfg.engine.transcoder_binary.clone(), cfg.engine.relay_rtmp_base.clone()));
    let ptz = Arc::new(PtzController::new());
    let overlay = Arc::new(OverlayPrefetcher::with_fetch_timeout(std::time::Duration::from_secs(
        cfg.engine.timeouts_secs.overlay_fetch,
    )));

    let watchdog = Arc::new(WatchdogManager::with_probe_timeout(
        supervisor.clone(),
        cfg.engine.watchdog.clone(),
        std::time::Duration::from_secs(cfg.engine.timeouts_secs.watchdog_probe),
    ));

    let executor = Arc::new(TimelineExecutor::new(
        supervisor.clone(),
        relay_pool.clone(),
        ptz,
        overlay,
        watchdog.clone(),
        hardware,
        cfg.engine.timeouts_secs.clone(),
    ));
    let router = Arc::new(StreamRouter::with_health_check(
        executor.clone(),
        cfg.engine.preview_rtmp_url.clone(),
        cfg.engine.preview_health_url.clone(),
        std::time::Duration::from_secs(cfg.engine.timeouts_secs.preview_health),
    ));
    let scheduler = Arc::new(Scheduler::new(executor.clone(), std::time::Duration::from_secs(cfg.engine.scheduler.tick_interval_secs)));

    let scheduler_handle = scheduler.spawn();

    if cfg.api.enabled {
        let state = Arc::new(api::AppState {
            executor: executor.clone(),
            router: router.clone(),
            watchdog: watchdog.clone(),
            scheduler: scheduler.clone(),
        });
        let port = cfg.api.port;
        tokio::spawn(async move {
            api::start_server(state, port).await;
        });
    }

    info!("vistterstream engine running, awaiting CTRL+C");
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received CTRL+C, shutting down"),
        Err(e) => error!(error = %e, "signal error"),
    }

    scheduler_handle.stop().await;
    watchdog.stop_all().await;
    for timeline_id in executor.active_timeline_ids() {
        executor.stop_timeline(timeline_id).await;
    }
    router.stop().await;
    relay_pool.stop_all().await;
    info!("vistterstream engine stopped");
}

async fn run_probe(config_path: PathBuf) {
    let cfg = match EngineConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    match hardware::probe(&cfg.engine.transcoder_binary).await {
        Ok(h) => {
            println!("=== Hardware Probe ===");
            println!("Platform              : {}", h.platform_label);
            println!("Encoder                : {}", h.encoder_tag);
            println!("Decoder                : {}", h.decoder_tag.as_deref().unwrap_or("(software)"));
            println!("Hardware accelerated   : {}", h.hardware_accelerated);
            println!("Max concurrent streams : {}", h.max_concurrent_streams);
        }
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

fn run_check_config(config_path: PathBuf) {
    match EngineConfig::from_file(&config_path) {
        Ok(cfg) => {
            println!("Config OK: {}", config_path.display());
            println!("  transcoder_binary : {}", cfg.engine.transcoder_binary);
            println!("  preview_rtmp_url  : {}", cfg.engine.preview_rtmp_url);
            println!("  api.enabled       : {}", cfg.api.enabled);
            println!("  api.port          : {}", cfg.api.port);
        }
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}
