//! SQLite persistence for equipment, detection events and the settings snapshot.
//!
//! Schema:
//! - `equipment(id, name UNIQUE)`: one row per catalog name
//! - `detections(id, timestamp, frame_data, equipment_id)`: one row per missing
//!   item per alert; `equipment_id` is NULL for rows that carry no violation
//! - `settings(id = 1, ...)`: the last accepted live settings

use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDateTime;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::catalog::EquipmentCatalog;
use crate::open_db_connection;

/// Text format of `detections.timestamp`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(raw: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .with_context(|| format!("parse timestamp '{}'", raw))
}

/// Bounded retry for transient contention (`SQLITE_BUSY`, `SQLITE_LOCKED`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempts run out. The last error is returned with `what` as context.
    pub fn run<T, F>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> rusqlite::Result<T>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if is_transient(&err) && attempt < attempts => {
                    log::warn!(
                        "store: {} hit contention (attempt {}/{}): {}",
                        what,
                        attempt,
                        attempts,
                        err
                    );
                    thread::sleep(self.backoff);
                    attempt += 1;
                }
                Err(err) => {
                    return Err(anyhow::Error::new(err)
                        .context(format!("{} failed after {} attempt(s)", what, attempt)))
                }
            }
        }
    }
}

pub fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// Write side used by the evidence worker.
pub trait EvidenceStore: Send {
    /// Id of the equipment row called `name`, creating it if needed.
    fn lookup_or_create_equipment(&mut self, name: &str) -> Result<i64>;

    /// Insert one detection row and return its id.
    fn insert_detection(
        &mut self,
        timestamp: &NaiveDateTime,
        frame_jpeg: &[u8],
        equipment_id: Option<i64>,
    ) -> Result<i64>;

    /// Insert one row per entry of `equipment`, all sharing `timestamp` and
    /// `frame_jpeg`. Returns the new row ids in order.
    fn insert_alert_rows(
        &mut self,
        timestamp: &NaiveDateTime,
        frame_jpeg: &[u8],
        equipment: &[String],
    ) -> Result<Vec<i64>> {
        let mut ids = Vec::with_capacity(equipment.len());
        for name in equipment {
            let equipment_id = self.lookup_or_create_equipment(name)?;
            ids.push(self.insert_detection(timestamp, frame_jpeg, Some(equipment_id))?);
        }
        Ok(ids)
    }
}

/// Single-row snapshot of the live settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SettingsRow {
    pub width: u32,
    pub height: u32,
    pub brightness: u16,
    pub contrast: u16,
    pub sharpness: u8,
    pub grayscale: bool,
    pub min_confidence: f32,
    pub alert_frequency: u32,
    pub alert_duration_ms: u64,
    pub delay_time_s: f64,
    pub absent_classes: Vec<String>,
    pub present_classes: Vec<String>,
}

/// Create the tables and indexes if they do not exist yet.
pub fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA foreign_keys=ON;

        CREATE TABLE IF NOT EXISTS equipment (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          name TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS detections (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          timestamp TEXT NOT NULL,
          frame_data BLOB NOT NULL,
          equipment_id INTEGER NULL REFERENCES equipment(id)
        );

        CREATE TABLE IF NOT EXISTS settings (
          id INTEGER PRIMARY KEY CHECK (id = 1),
          width INTEGER NOT NULL,
          height INTEGER NOT NULL,
          brightness INTEGER NOT NULL,
          contrast INTEGER NOT NULL,
          sharpness INTEGER NOT NULL,
          grayscale INTEGER NOT NULL,
          min_confidence REAL NOT NULL,
          alert_frequency INTEGER NOT NULL,
          alert_duration_ms INTEGER NOT NULL,
          delay_time_s REAL NOT NULL,
          absent_classes TEXT NOT NULL,
          present_classes TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_detections_timestamp ON detections(timestamp);
        CREATE INDEX IF NOT EXISTS idx_detections_equipment ON detections(equipment_id);
        "#,
    )
    .context("create sqlite schema")?;
    Ok(())
}

pub struct SqliteStore {
    conn: Connection,
    retry: RetryPolicy,
}

impl SqliteStore {
    /// Open (or create) the database and seed the equipment table from `catalog`.
    pub fn open(db_path: &str, catalog: &EquipmentCatalog) -> Result<Self> {
        Self::open_with_policy(db_path, catalog, RetryPolicy::default())
    }

    pub fn open_with_policy(
        db_path: &str,
        catalog: &EquipmentCatalog,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let conn = open_db_connection(db_path)
            .with_context(|| format!("open sqlite store {}", db_path))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("set sqlite busy timeout")?;
        ensure_schema(&conn)?;
        let mut store = Self { conn, retry };
        store.seed_catalog(catalog)?;
        Ok(store)
    }

    fn seed_catalog(&mut self, catalog: &EquipmentCatalog) -> Result<()> {
        for (_, name) in catalog.entries() {
            self.lookup_or_create_equipment(name)?;
        }
        Ok(())
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn equipment_id(&self, name: &str) -> Result<Option<i64>> {
        let conn = &self.conn;
        self.retry.run("look up equipment", || {
            conn.query_row(
                "SELECT id FROM equipment WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
        })
    }

    pub fn detection_count(&self) -> Result<u64> {
        let conn = &self.conn;
        let count: i64 = self.retry.run("count detections", || {
            conn.query_row("SELECT COUNT(*) FROM detections", [], |row| row.get(0))
        })?;
        Ok(count.max(0) as u64)
    }

    /// Replace the single settings row.
    pub fn save_settings(&mut self, row: &SettingsRow) -> Result<()> {
        let absent = serde_json::to_string(&row.absent_classes)?;
        let present = serde_json::to_string(&row.present_classes)?;
        let conn = &self.conn;
        self.retry.run("save settings", || {
            conn.execute(
                "INSERT OR REPLACE INTO settings (id, width, height, brightness, contrast, \
                 sharpness, grayscale, min_confidence, alert_frequency, alert_duration_ms, \
                 delay_time_s, absent_classes, present_classes) \
                 VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    row.width,
                    row.height,
                    row.brightness,
                    row.contrast,
                    row.sharpness,
                    row.grayscale,
                    row.min_confidence as f64,
                    row.alert_frequency,
                    row.alert_duration_ms as i64,
                    row.delay_time_s,
                    absent,
                    present
                ],
            )
        })?;
        Ok(())
    }

    pub fn load_settings(&self) -> Result<Option<SettingsRow>> {
        let conn = &self.conn;
        let raw = self.retry.run("load settings", || {
            conn.query_row(
                "SELECT width, height, brightness, contrast, sharpness, grayscale, \
                 min_confidence, alert_frequency, alert_duration_ms, delay_time_s, \
                 absent_classes, present_classes FROM settings WHERE id = 1",
                [],
                |row| {
                    Ok((
                        (
                            row.get::<_, u32>(0)?,
                            row.get::<_, u32>(1)?,
                            row.get::<_, u16>(2)?,
                            row.get::<_, u16>(3)?,
                            row.get::<_, u8>(4)?,
                            row.get::<_, bool>(5)?,
                        ),
                        (
                            row.get::<_, f64>(6)?,
                            row.get::<_, u32>(7)?,
                            row.get::<_, i64>(8)?,
                            row.get::<_, f64>(9)?,
                            row.get::<_, String>(10)?,
                            row.get::<_, String>(11)?,
                        ),
                    ))
                },
            )
            .optional()
        })?;

        let Some((
            (width, height, brightness, contrast, sharpness, grayscale),
            (min_confidence, alert_frequency, alert_duration_ms, delay_time_s, absent, present),
        )) = raw
        else {
            return Ok(None);
        };

        Ok(Some(SettingsRow {
            width,
            height,
            brightness,
            contrast,
            sharpness,
            grayscale,
            min_confidence: min_confidence as f32,
            alert_frequency,
            alert_duration_ms: u64::try_from(alert_duration_ms)
                .map_err(|_| anyhow!("negative alert duration in settings row"))?,
            delay_time_s,
            absent_classes: serde_json::from_str(&absent).context("decode absent classes")?,
            present_classes: serde_json::from_str(&present).context("decode present classes")?,
        }))
    }
}

impl EvidenceStore for SqliteStore {
    fn lookup_or_create_equipment(&mut self, name: &str) -> Result<i64> {
        let conn = &self.conn;
        self.retry.run("look up or create equipment", || {
            conn.execute(
                "INSERT OR IGNORE INTO equipment (name) VALUES (?1)",
                params![name],
            )?;
            conn.query_row(
                "SELECT id FROM equipment WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
        })
    }

    fn insert_detection(
        &mut self,
        timestamp: &NaiveDateTime,
        frame_jpeg: &[u8],
        equipment_id: Option<i64>,
    ) -> Result<i64> {
        let ts = format_timestamp(timestamp);
        let conn = &self.conn;
        self.retry.run("insert detection", || {
            conn.execute(
                "INSERT INTO detections (timestamp, frame_data, equipment_id) VALUES (?1, ?2, ?3)",
                params![ts, frame_jpeg, equipment_id],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// All rows of one alert commit together or not at all.
    fn insert_alert_rows(
        &mut self,
        timestamp: &NaiveDateTime,
        frame_jpeg: &[u8],
        equipment: &[String],
    ) -> Result<Vec<i64>> {
        let ts = format_timestamp(timestamp);
        let retry = self.retry;
        let conn = &mut self.conn;
        retry.run("insert alert rows", || {
            let tx = conn.transaction()?;
            let mut ids = Vec::with_capacity(equipment.len());
            for name in equipment {
                tx.execute(
                    "INSERT OR IGNORE INTO equipment (name) VALUES (?1)",
                    params![name],
                )?;
                let equipment_id: i64 = tx.query_row(
                    "SELECT id FROM equipment WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )?;
                tx.execute(
                    "INSERT INTO detections (timestamp, frame_data, equipment_id) VALUES (?1, ?2, ?3)",
                    params![ts, frame_jpeg, equipment_id],
                )?;
                ids.push(tx.last_insert_rowid());
            }
            tx.commit()?;
            Ok(ids)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared_memory_uri;
    use std::cell::Cell;

    fn busy() -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY), None)
    }

    fn quick() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            backoff: Duration::ZERO,
        }
    }

    #[test]
    fn retry_recovers_from_transient_contention() -> Result<()> {
        let calls = Cell::new(0);
        let value = quick().run("op", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(busy())
            } else {
                Ok(7)
            }
        })?;
        assert_eq!(value, 7);
        assert_eq!(calls.get(), 3);
        Ok(())
    }

    #[test]
    fn retry_gives_up_after_the_attempt_bound() {
        let calls = Cell::new(0);
        let result: Result<()> = quick().run("op", || {
            calls.set(calls.get() + 1);
            Err(busy())
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn retry_does_not_repeat_permanent_errors() {
        let calls = Cell::new(0);
        let result: Result<()> = quick().run("op", || {
            calls.set(calls.get() + 1);
            Err(rusqlite::Error::QueryReturnedNoRows)
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn catalog_is_seeded_once() -> Result<()> {
        let uri = shared_memory_uri();
        let catalog = EquipmentCatalog::default();
        let mut store = SqliteStore::open(&uri, &catalog)?;
        let helmet = store.equipment_id("No Helmet")?.expect("seeded");
        assert_eq!(store.lookup_or_create_equipment("No Helmet")?, helmet);

        let reopened = SqliteStore::open(&uri, &catalog)?;
        let count: i64 =
            reopened
                .connection()
                .query_row("SELECT COUNT(*) FROM equipment", [], |row| row.get(0))?;
        assert_eq!(count, 8);
        drop(store);
        Ok(())
    }

    #[test]
    fn detection_rows_round_trip_timestamp_and_link() -> Result<()> {
        let mut store = SqliteStore::open(&shared_memory_uri(), &EquipmentCatalog::default())?;
        let id = store.lookup_or_create_equipment("Respirator")?;
        let ts = parse_timestamp("2024-03-05 14:07:09")?;
        let row = store.insert_detection(&ts, &[1, 2, 3], Some(id))?;
        store.insert_detection(&ts, &[4], None)?;

        let (stamp, blob, link): (String, Vec<u8>, Option<i64>) = store.connection().query_row(
            "SELECT timestamp, frame_data, equipment_id FROM detections WHERE id = ?1",
            params![row],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )?;
        assert_eq!(stamp, "2024-03-05 14:07:09");
        assert_eq!(blob, vec![1, 2, 3]);
        assert_eq!(link, Some(id));
        assert_eq!(store.detection_count()?, 2);
        Ok(())
    }

    #[test]
    fn settings_row_is_replaced_not_appended() -> Result<()> {
        let mut store = SqliteStore::open(&shared_memory_uri(), &EquipmentCatalog::default())?;
        assert!(store.load_settings()?.is_none());

        let mut row = SettingsRow {
            width: 640,
            height: 480,
            brightness: 100,
            contrast: 100,
            sharpness: 0,
            grayscale: false,
            min_confidence: 0.5,
            alert_frequency: 2500,
            alert_duration_ms: 1000,
            delay_time_s: 5.0,
            absent_classes: vec!["a".into(), "b".into(), "c".into(), "d".into()],
            present_classes: vec!["e".into(), "f".into(), "g".into(), "h".into()],
        };
        store.save_settings(&row)?;
        row.brightness = 150;
        row.grayscale = true;
        store.save_settings(&row)?;

        assert_eq!(store.load_settings()?, Some(row));
        let count: i64 = store
            .connection()
            .query_row("SELECT COUNT(*) FROM settings", [], |r| r.get(0))?;
        assert_eq!(count, 1);
        Ok(())
    }
}
