//! User-facing alert notification.
//!
//! [`Notifier`] runs at most one notification thread at a time. That thread
//! only encodes the evidence frame and hands the event to the evidence queue,
//! so the in-flight window ends as soon as the event is queued. A separate cue
//! thread shows the missing items on the status line, plays the audible cue and,
//! once the display duration has passed, puts the status back to
//! [`MONITORING_STATUS`] unless something newer replaced it meanwhile.

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::NaiveDateTime;

use crate::evidence::{AlertEvent, EvidenceQueue};
use crate::frame::{Frame, DEFAULT_JPEG_QUALITY};

pub const MONITORING_STATUS: &str = "Monitoring...";

/// Receives annotated frames and status text.
pub trait MonitorDisplay: Send + Sync {
    fn show_frame(&self, frame: &Frame);
    fn set_status(&self, status: &str);
}

/// Audible cue. `play` may block for `duration`.
pub trait AlertSound: Send + Sync {
    fn play(&self, frequency: u32, duration: Duration);
}

// ----------------------------------------------------------------------------
// Headless collaborators
// ----------------------------------------------------------------------------

/// Display for headless runs: status changes go to the log, and every
/// `every`-th frame is optionally written to `snapshot_path` as JPEG.
pub struct LogDisplay {
    snapshot_path: Option<PathBuf>,
    every: u64,
    frames: AtomicU64,
    status: Mutex<String>,
}

impl LogDisplay {
    pub fn new(snapshot_path: Option<PathBuf>, every: u64) -> Self {
        Self {
            snapshot_path,
            every: every.max(1),
            frames: AtomicU64::new(0),
            status: Mutex::new(String::new()),
        }
    }

    pub fn status(&self) -> String {
        self.status
            .lock()
            .map(|status| status.clone())
            .unwrap_or_default()
    }

    fn write_snapshot(&self, frame: &Frame) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let jpeg = frame.encode_jpeg(DEFAULT_JPEG_QUALITY)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, jpeg).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, path).with_context(|| format!("replace {}", path.display()))?;
        Ok(())
    }
}

impl MonitorDisplay for LogDisplay {
    fn show_frame(&self, frame: &Frame) {
        let n = self.frames.fetch_add(1, Ordering::Relaxed);
        if n % self.every == 0 {
            if let Err(err) = self.write_snapshot(frame) {
                log::warn!("display: snapshot failed: {:#}", err);
            }
        }
    }

    fn set_status(&self, status: &str) {
        let Ok(mut current) = self.status.lock() else {
            return;
        };
        if *current != status {
            log::info!("status: {}", status);
            *current = status.to_string();
        }
    }
}

/// Rings the terminal bell and holds for the cue duration.
#[derive(Clone, Copy, Debug, Default)]
pub struct TerminalBell;

impl AlertSound for TerminalBell {
    fn play(&self, frequency: u32, duration: Duration) {
        log::debug!("alert cue {} Hz for {:?}", frequency, duration);
        let mut err = std::io::stderr();
        let _ = err.write_all(b"\x07");
        let _ = err.flush();
        thread::sleep(duration);
    }
}

// ----------------------------------------------------------------------------
// Notifier
// ----------------------------------------------------------------------------

/// Cue parameters taken from the live settings at emission time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AlertCue {
    pub frequency: u32,
    pub duration: Duration,
    /// How long the missing-equipment status stays up.
    pub display: Duration,
}

/// A violation approved by the throttle, not yet encoded.
#[derive(Clone, Debug)]
pub struct PendingAlert {
    pub timestamp: NaiveDateTime,
    pub missing: Vec<String>,
    pub class_ids: Vec<u32>,
    pub frame: Frame,
}

pub fn missing_status(missing: &[String]) -> String {
    let mut names: Vec<&str> = Vec::new();
    for name in missing {
        if !names.contains(&name.as_str()) {
            names.push(name);
        }
    }
    format!("Missing equipment: {}", names.join(", "))
}

pub struct Notifier {
    display: Arc<dyn MonitorDisplay>,
    sound: Arc<dyn AlertSound>,
    evidence: Option<EvidenceQueue>,
    generation: Arc<AtomicU64>,
    in_flight: Option<JoinHandle<()>>,
    cues: Vec<JoinHandle<()>>,
}

impl Notifier {
    pub fn new(
        display: Arc<dyn MonitorDisplay>,
        sound: Arc<dyn AlertSound>,
        evidence: Option<EvidenceQueue>,
    ) -> Self {
        Self {
            display,
            sound,
            evidence,
            generation: Arc::new(AtomicU64::new(0)),
            in_flight: None,
            cues: Vec::new(),
        }
    }

    pub fn display(&self) -> &Arc<dyn MonitorDisplay> {
        &self.display
    }

    /// Whether the previous notification thread is still running.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Replace the status line. Cancels any pending revert.
    pub fn set_status(&self, status: &str) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.display.set_status(status);
    }

    /// Start the notification for `alert`. Only the evidence hand-off counts
    /// as in flight; the cue and the status revert run detached from it.
    pub fn dispatch(&mut self, alert: PendingAlert, cue: AlertCue) -> Result<()> {
        if self.is_in_flight() {
            log::warn!("notify: previous alert still in flight, skipping");
            return Ok(());
        }
        self.reap();

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let status = missing_status(&alert.missing);
        let shared = Arc::clone(&self.generation);
        let display = Arc::clone(&self.display);
        let sound = Arc::clone(&self.sound);
        let started = Instant::now();
        let cue_handle = thread::Builder::new()
            .name("alert-cue".to_string())
            .spawn(move || {
                display.set_status(&status);
                sound.play(cue.frequency, cue.duration);
                if let Some(rest) = cue.display.checked_sub(started.elapsed()) {
                    thread::sleep(rest);
                }
                if shared.load(Ordering::SeqCst) == generation {
                    display.set_status(MONITORING_STATUS);
                }
            })
            .context("spawn alert cue thread")?;
        self.cues.push(cue_handle);

        let evidence = self.evidence.clone();
        let handle = thread::Builder::new()
            .name("alert-notifier".to_string())
            .spawn(move || {
                if let Some(queue) = evidence {
                    match encode_event(&alert) {
                        Ok(event) => queue.write(event),
                        Err(err) => log::error!("notify: evidence not recorded: {:#}", err),
                    }
                }
            })
            .context("spawn alert notification thread")?;
        self.in_flight = Some(handle);
        Ok(())
    }

    /// Block until the notification thread and every pending cue have finished.
    pub fn wait(&mut self) {
        if let Some(handle) = self.in_flight.take() {
            if handle.join().is_err() {
                log::error!("notify: notification thread panicked");
            }
        }
        for handle in self.cues.drain(..) {
            if handle.join().is_err() {
                log::error!("notify: cue thread panicked");
            }
        }
    }

    fn reap(&mut self) {
        if self.in_flight.as_ref().is_some_and(JoinHandle::is_finished) {
            if let Some(handle) = self.in_flight.take() {
                if handle.join().is_err() {
                    log::error!("notify: notification thread panicked");
                }
            }
        }
        self.cues.retain(|handle| !handle.is_finished());
    }
}

fn encode_event(alert: &PendingAlert) -> Result<AlertEvent> {
    let jpeg = alert
        .frame
        .encode_jpeg(DEFAULT_JPEG_QUALITY)
        .context("encode evidence frame")?;
    AlertEvent::new(
        alert.timestamp,
        alert.missing.iter().cloned(),
        alert.class_ids.clone(),
        jpeg,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        statuses: Mutex<Vec<String>>,
        cues: Mutex<Vec<u32>>,
    }

    impl MonitorDisplay for Recorder {
        fn show_frame(&self, _frame: &Frame) {}
        fn set_status(&self, status: &str) {
            self.statuses.lock().unwrap().push(status.to_string());
        }
    }

    impl AlertSound for Recorder {
        fn play(&self, frequency: u32, _duration: Duration) {
            self.cues.lock().unwrap().push(frequency);
        }
    }

    fn alert() -> PendingAlert {
        PendingAlert {
            timestamp: crate::store::parse_timestamp("2024-06-01 08:00:00").unwrap(),
            missing: vec!["No Helmet".into(), "No Gloves".into(), "No Helmet".into()],
            class_ids: vec![5, 6, 5],
            frame: Frame::filled(8, 8, 3, 40),
        }
    }

    fn cue(display_ms: u64) -> AlertCue {
        AlertCue {
            frequency: 2500,
            duration: Duration::ZERO,
            display: Duration::from_millis(display_ms),
        }
    }

    #[test]
    fn status_lists_each_missing_item_once() {
        assert_eq!(
            missing_status(&alert().missing),
            "Missing equipment: No Helmet, No Gloves"
        );
    }

    #[test]
    fn notification_shows_status_beeps_and_reverts() -> Result<()> {
        let recorder = Arc::new(Recorder::default());
        let mut notifier = Notifier::new(recorder.clone(), recorder.clone(), None);
        notifier.dispatch(alert(), cue(0))?;
        notifier.wait();

        assert_eq!(
            *recorder.statuses.lock().unwrap(),
            vec![
                "Missing equipment: No Helmet, No Gloves".to_string(),
                MONITORING_STATUS.to_string()
            ]
        );
        assert_eq!(*recorder.cues.lock().unwrap(), vec![2500]);
        Ok(())
    }

    #[test]
    fn newer_status_is_not_reverted() -> Result<()> {
        let recorder = Arc::new(Recorder::default());
        let mut notifier = Notifier::new(recorder.clone(), recorder.clone(), None);
        notifier.dispatch(alert(), cue(200))?;
        thread::sleep(Duration::from_millis(50));
        notifier.set_status("Camera unavailable, retrying...");
        notifier.wait();

        let statuses = recorder.statuses.lock().unwrap();
        assert_eq!(statuses.last().unwrap(), "Camera unavailable, retrying...");
        assert!(!statuses.iter().any(|s| s == MONITORING_STATUS));
        Ok(())
    }

    #[test]
    fn in_flight_ends_before_the_status_reverts() -> Result<()> {
        let recorder = Arc::new(Recorder::default());
        let mut notifier = Notifier::new(recorder.clone(), recorder.clone(), None);
        notifier.dispatch(alert(), cue(500))?;

        let deadline = Instant::now() + Duration::from_millis(400);
        while notifier.is_in_flight() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!notifier.is_in_flight());
        assert!(!recorder
            .statuses
            .lock()
            .unwrap()
            .iter()
            .any(|s| s == MONITORING_STATUS));

        notifier.dispatch(alert(), cue(0))?;
        notifier.wait();
        assert_eq!(recorder.cues.lock().unwrap().len(), 2);
        Ok(())
    }
}
