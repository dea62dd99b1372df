//! ppe_dashboard - read-only dashboard API for PPE detections
//!
//! Serves detection listings, evidence images and compliance statistics from
//! the database written by `ppe_monitor`. Does NOT capture or detect.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;

use ppe_monitor::api::{ApiConfig, ApiServer};
use ppe_monitor::PpeConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "Dashboard API for PPE detections")]
struct Args {
    /// JSON configuration document (database path and listen address).
    #[arg(long, env = "PPE_CONFIG", default_value = "config.json")]
    config: PathBuf,

    /// Override the listen address. Must be a loopback address.
    #[arg(long, env = "PPE_API_ADDR")]
    addr: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let cfg = PpeConfig::load_from(Some(&args.config))?;

    let api_config = ApiConfig {
        addr: args.addr.unwrap_or_else(|| cfg.api.addr.clone()),
        db_path: cfg.paths.database.clone(),
    };
    let api_handle = ApiServer::new(api_config).spawn()?;
    log::info!(
        "ppe_dashboard running on {}. serving {}",
        api_handle.addr,
        cfg.paths.database
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("ppe_dashboard waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;

    Ok(())
}
