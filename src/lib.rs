//! PPE monitor
//!
//! Watches a camera feed for workers missing protective equipment (glasses,
//! helmet, gloves, ear protection), raises rate-limited alerts and stores an
//! evidence frame for every violation.
//!
//! # Pipeline
//!
//! `FrameSource -> adjust -> Detector -> AlertThrottle -> Notifier -> EvidenceWriter`
//!
//! One thread drives [`pipeline::DetectionLoop`]. Evidence is written by a single
//! background worker so the loop never waits on the database; user-facing alert
//! notification runs on at most one short-lived thread at a time.
//!
//! # Module Structure
//!
//! - `frame`: pixel buffers and JPEG encoding
//! - `catalog`: class id to equipment name mapping
//! - `adjust`: brightness, contrast, sharpness and grayscale
//! - `detect`: inference backends, confidence filtering, annotation
//! - `ingest`: frame sources (synthetic, HTTP/MJPEG, RTSP, V4L2)
//! - `throttle`, `notify`, `evidence`, `pipeline`: alerting path
//! - `store`, `analytics`, `api`: persistence and the dashboard
//! - `config`: configuration document and live setting updates

use anyhow::Result;
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};

pub mod adjust;
pub mod analytics;
pub mod api;
pub mod catalog;
pub mod config;
pub mod detect;
pub mod evidence;
pub mod frame;
pub mod ingest;
pub mod notify;
pub mod pipeline;
pub mod store;
pub mod throttle;

pub use adjust::{adjust, Adjustments};
pub use analytics::{compliance_percentage, trend_percentage, Analytics, TimeRange};
pub use catalog::EquipmentCatalog;
pub use config::{ConfigStore, PpeConfig, SettingUpdate};
pub use detect::{Detection, DetectionResult, Detector, DetectorOutput, InferenceBackend};
pub use evidence::{AlertEvent, EvidenceQueue, EvidenceWriter};
pub use frame::Frame;
pub use ingest::{open_source, CaptureOptions, FrameSource, SourceDescriptor};
pub use notify::{AlertSound, LogDisplay, MonitorDisplay, Notifier, TerminalBell};
pub use pipeline::{DetectionLoop, LiveSettings};
pub use store::{EvidenceStore, SqliteStore};
pub use throttle::{AlertThrottle, ThrottleDecision, ThrottleState};

/// URI of a fresh shared-cache in-memory database.
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:ppe_monitor_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}
