//! ppe_monitor - capture, detect and alert daemon
//!
//! This daemon:
//! 1. Loads the configuration document and the detection model (fatal on failure)
//! 2. Opens the camera and runs the detection loop until Ctrl-C
//! 3. Raises throttled alerts and stores one evidence row per missing item
//! 4. Accepts `key value` setting updates on stdin and persists them

use anyhow::Result;
use arc_swap::ArcSwap;
use clap::Parser;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ppe_monitor::detect::load_label_font;
use ppe_monitor::evidence::DEFAULT_QUEUE_DEPTH;
use ppe_monitor::pipeline::SourceOpener;
use ppe_monitor::{
    open_source, ConfigStore, DetectionLoop, Detector, EvidenceWriter, LiveSettings, LogDisplay,
    Notifier, PpeConfig, SettingUpdate, SqliteStore, TerminalBell,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "PPE compliance monitor")]
struct Args {
    /// JSON configuration document. Created on the first accepted setting update.
    #[arg(long, env = "PPE_CONFIG", default_value = "config.json")]
    config: PathBuf,

    /// Minimum delay between ticks, in milliseconds.
    #[arg(long, default_value_t = 10)]
    tick_ms: u64,

    /// Write the latest annotated frame to this JPEG file for headless viewing.
    #[arg(long)]
    snapshot_path: Option<PathBuf>,

    /// Write the snapshot every N processed frames.
    #[arg(long, default_value_t = 30)]
    snapshot_every: u64,

    /// Do not read setting updates from stdin.
    #[arg(long)]
    no_stdin: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = PpeConfig::load_from(Some(&args.config))?;
    let catalog = Arc::new(cfg.catalog()?);

    let mut detector = Detector::load(
        &cfg.paths.model,
        Arc::clone(&catalog),
        cfg.detection.min_confidence,
    )?;
    if let Some(path) = &cfg.detection.label_font {
        match load_label_font(path) {
            Ok(font) => detector = detector.with_font(font),
            Err(err) => log::warn!("label font unavailable, boxes only: {:#}", err),
        }
    }

    let mut evidence_db = SqliteStore::open(&cfg.paths.database, &catalog)?;
    evidence_db.save_settings(&cfg.settings_row())?;
    let settings_db = SqliteStore::open(&cfg.paths.database, &catalog)?;
    let mut writer = EvidenceWriter::spawn(evidence_db, Arc::clone(&catalog), DEFAULT_QUEUE_DEPTH)?;

    let display = Arc::new(LogDisplay::new(
        args.snapshot_path.clone(),
        args.snapshot_every,
    ));
    let notifier = Notifier::new(display, Arc::new(TerminalBell), writer.queue());

    let live = Arc::new(ArcSwap::from_pointee(LiveSettings::from_config(&cfg)));
    let config_store = Arc::new(ConfigStore::new(cfg, Some(args.config.clone())));

    let opener_store = Arc::clone(&config_store);
    let opener: SourceOpener = Box::new(move || {
        let snapshot = opener_store.snapshot();
        open_source(&snapshot.camera_source(), &snapshot.capture_options())
    });
    let mut pipeline = DetectionLoop::new(opener, detector, notifier, Arc::clone(&live))
        .with_tick(Duration::from_millis(args.tick_ms));

    if !args.no_stdin {
        let reconnect = pipeline.reconnect_flag();
        let config_store = Arc::clone(&config_store);
        let live = Arc::clone(&live);
        std::thread::Builder::new()
            .name("settings-input".to_string())
            .spawn(move || read_setting_updates(config_store, live, reconnect, settings_db))?;
    }

    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        handler_flag.store(false, Ordering::SeqCst);
    })
    .expect("error setting Ctrl-C handler");

    log::info!(
        "ppe_monitor running. source {}, writing to {}",
        config_store.snapshot().camera_source(),
        config_store.snapshot().paths.database
    );
    pipeline.run(&running);

    log::info!("shutdown signal received, draining evidence...");
    let stats = pipeline.finish();
    writer.shutdown();
    log::info!(
        "ppe_monitor stopped: {} ticks, {} frames, {} violations, {} alerts",
        stats.ticks,
        stats.frames_processed,
        stats.violations,
        stats.alerts_emitted
    );
    Ok(())
}

fn read_setting_updates(
    config_store: Arc<ConfigStore>,
    live: Arc<ArcSwap<LiveSettings>>,
    reconnect: Arc<AtomicBool>,
    mut settings_db: SqliteStore,
) {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                log::warn!("settings input closed: {}", err);
                return;
            }
        };
        let update = match SettingUpdate::parse_line(&line) {
            Ok(Some(update)) => update,
            Ok(None) => continue,
            Err(err) => {
                log::warn!("ignoring setting '{}': {:#}", line.trim(), err);
                continue;
            }
        };
        let Ok(next) = config_store.apply(&update) else {
            continue;
        };
        live.store(Arc::new(LiveSettings::from_config(&next)));
        if update.changes_source() {
            reconnect.store(true, Ordering::SeqCst);
        }
        if let Err(err) = settings_db.save_settings(&next.settings_row()) {
            log::error!("failed to record settings row: {:#}", err);
        }
    }
}
