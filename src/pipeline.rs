//! The capture / detect / alert tick loop.
//!
//! One thread drives [`DetectionLoop::run`]. Each tick reads one frame, applies
//! the current [`LiveSettings`] snapshot, runs the detector, publishes the
//! annotated frame and consults the throttle. Alerts are handed to the
//! [`Notifier`], which never blocks the loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use arc_swap::ArcSwap;
use chrono::Local;
use serde::Serialize;

use crate::adjust::{adjust, Adjustments};
use crate::config::PpeConfig;
use crate::detect::Detector;
use crate::ingest::FrameSource;
use crate::notify::{AlertCue, Notifier, PendingAlert, MONITORING_STATUS};
use crate::throttle::{AlertThrottle, ThrottleDecision};

pub const DEFAULT_TICK: Duration = Duration::from_millis(10);
pub const RECONNECT_BACKOFF: Duration = Duration::from_millis(1000);
pub const HEALTH_INTERVAL: Duration = Duration::from_secs(5);

pub const SOURCE_UNAVAILABLE_STATUS: &str = "Camera unavailable, retrying...";
pub const READ_FAILED_STATUS: &str = "Failed to capture frame";

/// Opens the configured frame source. Called again after every disconnect.
pub type SourceOpener = Box<dyn FnMut() -> Result<Box<dyn FrameSource>> + Send>;

/// Settings the loop reads on every tick.
#[derive(Clone, Debug, PartialEq)]
pub struct LiveSettings {
    pub adjustments: Adjustments,
    pub min_confidence: f32,
    pub alert_delay: Duration,
    pub cue: AlertCue,
}

impl LiveSettings {
    pub fn from_config(cfg: &PpeConfig) -> Self {
        Self {
            adjustments: cfg.camera.default_settings,
            min_confidence: cfg.detection.min_confidence,
            alert_delay: cfg.alert_delay(),
            cue: AlertCue {
                frequency: cfg.alerts.frequency,
                duration: Duration::from_millis(cfg.alerts.duration),
                display: Duration::from_millis(cfg.alerts.display_ms),
            },
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LoopStats {
    pub ticks: u64,
    pub frames_processed: u64,
    pub open_failures: u64,
    pub read_failures: u64,
    pub detect_failures: u64,
    pub violations: u64,
    pub alerts_emitted: u64,
    pub alerts_suppressed: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// No usable source; another open attempt follows after the backoff.
    SourceUnavailable,
    ReadFailed,
    DetectFailed,
    Processed { violation: bool, alerted: bool },
}

pub struct DetectionLoop {
    opener: SourceOpener,
    source: Option<Box<dyn FrameSource>>,
    detector: Detector,
    throttle: AlertThrottle,
    notifier: Notifier,
    settings: Arc<ArcSwap<LiveSettings>>,
    reconnect: Arc<AtomicBool>,
    tick: Duration,
    degraded: bool,
    stats: LoopStats,
    last_health: Instant,
}

impl DetectionLoop {
    pub fn new(
        opener: SourceOpener,
        detector: Detector,
        notifier: Notifier,
        settings: Arc<ArcSwap<LiveSettings>>,
    ) -> Self {
        let delay = settings.load().alert_delay;
        Self {
            opener,
            source: None,
            detector,
            throttle: AlertThrottle::new(delay),
            notifier,
            settings,
            reconnect: Arc::new(AtomicBool::new(false)),
            tick: DEFAULT_TICK,
            degraded: false,
            stats: LoopStats::default(),
            last_health: Instant::now(),
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Setting this flag makes the next tick drop and reopen the source.
    pub fn reconnect_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.reconnect)
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    pub fn throttle(&self) -> &AlertThrottle {
        &self.throttle
    }

    pub fn detector(&self) -> &Detector {
        &self.detector
    }

    /// Whether an alert is still being handed to the evidence queue.
    pub fn notification_in_flight(&self) -> bool {
        self.notifier.is_in_flight()
    }

    /// Wait for a running notification and its cue to finish.
    pub fn wait_for_notifications(&mut self) {
        self.notifier.wait();
    }

    /// Delay before the next tick after `outcome`.
    pub fn next_delay(&self, outcome: TickOutcome) -> Duration {
        match outcome {
            TickOutcome::SourceUnavailable => RECONNECT_BACKOFF,
            _ => self.tick,
        }
    }

    pub fn tick(&mut self) -> TickOutcome {
        self.tick_at(Instant::now())
    }

    /// One pass of the loop with `now` as the throttle clock.
    pub fn tick_at(&mut self, now: Instant) -> TickOutcome {
        self.stats.ticks += 1;
        let settings = self.settings.load_full();
        self.sync_settings(&settings);

        if self.reconnect.swap(false, Ordering::SeqCst) {
            self.close_source("source settings changed");
        }
        if !self.ensure_source() {
            self.report_problem(SOURCE_UNAVAILABLE_STATUS);
            return TickOutcome::SourceUnavailable;
        }
        let Some(source) = self.source.as_mut() else {
            return TickOutcome::SourceUnavailable;
        };

        let frame = match source.read_frame() {
            Ok(frame) => frame,
            Err(err) => {
                self.stats.read_failures += 1;
                log::warn!("pipeline: frame read failed: {:#}", err);
                if !source.is_open() {
                    self.close_source("stream ended");
                }
                self.report_problem(READ_FAILED_STATUS);
                return TickOutcome::ReadFailed;
            }
        };

        let adjusted = adjust(&frame, &settings.adjustments);
        let output = match self.detector.detect(&adjusted) {
            Ok(output) => output,
            Err(err) => {
                self.stats.detect_failures += 1;
                log::warn!("pipeline: detection failed: {:#}", err);
                return TickOutcome::DetectFailed;
            }
        };
        self.stats.frames_processed += 1;
        if self.degraded {
            self.degraded = false;
            self.notifier.set_status(MONITORING_STATUS);
        }
        self.notifier.display().show_frame(&output.annotated);

        let violation = output.has_violation();
        if violation {
            self.stats.violations += 1;
        }
        let decision = self
            .throttle
            .evaluate(now, &output.missing, self.notifier.is_in_flight());
        let alerted = match decision {
            ThrottleDecision::Emit => {
                let alert = PendingAlert {
                    timestamp: Local::now().naive_local(),
                    missing: output.missing,
                    class_ids: output.class_ids,
                    frame: output.annotated,
                };
                match self.notifier.dispatch(alert, settings.cue) {
                    Ok(()) => {
                        self.stats.alerts_emitted += 1;
                        true
                    }
                    Err(err) => {
                        log::error!("pipeline: alert notification failed: {:#}", err);
                        false
                    }
                }
            }
            ThrottleDecision::NoViolation => false,
            ThrottleDecision::Cooling { .. } | ThrottleDecision::InFlight => {
                self.stats.alerts_suppressed += 1;
                false
            }
        };
        TickOutcome::Processed { violation, alerted }
    }

    /// Tick until `running` is cleared.
    pub fn run(&mut self, running: &AtomicBool) {
        log::info!(
            "pipeline: started ({} backend, tick {:?})",
            self.detector.backend_name(),
            self.tick
        );
        self.notifier.set_status(MONITORING_STATUS);
        while running.load(Ordering::SeqCst) {
            let outcome = self.tick();
            self.log_health();
            let mut remaining = self.next_delay(outcome);
            while !remaining.is_zero() && running.load(Ordering::SeqCst) {
                let step = remaining.min(Duration::from_millis(50));
                std::thread::sleep(step);
                remaining -= step;
            }
        }
        log::info!("pipeline: stop requested");
    }

    /// Close the source and wait for the running notification. Pending evidence
    /// is drained by the writer's own shutdown once this loop is dropped.
    pub fn finish(mut self) -> LoopStats {
        self.close_source("shutdown");
        self.notifier.wait();
        log::info!(
            "pipeline: stopped after {} frames, {} alerts",
            self.stats.frames_processed,
            self.stats.alerts_emitted
        );
        self.stats.clone()
    }

    fn sync_settings(&mut self, settings: &LiveSettings) {
        if self.detector.min_confidence() != settings.min_confidence {
            if let Err(err) = self.detector.set_min_confidence(settings.min_confidence) {
                log::warn!("pipeline: ignoring confidence update: {:#}", err);
            }
        }
        if self.throttle.delay() != settings.alert_delay {
            self.throttle.set_delay(settings.alert_delay);
        }
    }

    fn ensure_source(&mut self) -> bool {
        if self.source.as_ref().is_some_and(|source| source.is_open()) {
            return true;
        }
        self.close_source("handle closed");
        match (self.opener)() {
            Ok(source) => {
                log::info!("pipeline: source {} opened", source.stats().source);
                self.source = Some(source);
                true
            }
            Err(err) => {
                self.stats.open_failures += 1;
                log::warn!("pipeline: cannot open source: {:#}", err);
                false
            }
        }
    }

    fn close_source(&mut self, reason: &str) {
        if let Some(mut source) = self.source.take() {
            source.close();
            log::info!("pipeline: source closed ({})", reason);
        }
    }

    fn report_problem(&mut self, status: &str) {
        self.degraded = true;
        self.notifier.set_status(status);
    }

    fn log_health(&mut self) {
        if self.last_health.elapsed() < HEALTH_INTERVAL {
            return;
        }
        self.last_health = Instant::now();
        let source = self
            .source
            .as_ref()
            .map(|source| source.stats())
            .unwrap_or_default();
        log::info!(
            "health: {} frames processed, {} alerts emitted, {} suppressed, source '{}' ({} captured, {} read failures)",
            self.stats.frames_processed,
            self.stats.alerts_emitted,
            self.stats.alerts_suppressed,
            source.source,
            source.frames_captured,
            source.read_failures
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::EquipmentCatalog;
    use crate::detect::{BoundingBox, Detection, StubBackend};
    use crate::frame::Frame;
    use crate::ingest::SourceStats;
    use crate::notify::{AlertSound, MonitorDisplay};
    use anyhow::anyhow;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedSource {
        reads: VecDeque<Option<Frame>>,
        open: bool,
    }

    impl FrameSource for ScriptedSource {
        fn read_frame(&mut self) -> Result<Frame> {
            match self.reads.pop_front() {
                Some(Some(frame)) => Ok(frame),
                Some(None) => Err(anyhow!("timeout")),
                None => {
                    self.open = false;
                    Err(anyhow!("end of stream"))
                }
            }
        }
        fn is_open(&self) -> bool {
            self.open
        }
        fn close(&mut self) {
            self.open = false;
        }
        fn stats(&self) -> SourceStats {
            SourceStats::default()
        }
    }

    #[derive(Default)]
    struct Screen {
        frames: Mutex<u64>,
        statuses: Mutex<Vec<String>>,
    }

    impl MonitorDisplay for Screen {
        fn show_frame(&self, _frame: &Frame) {
            *self.frames.lock().unwrap() += 1;
        }
        fn set_status(&self, status: &str) {
            self.statuses.lock().unwrap().push(status.to_string());
        }
    }

    impl AlertSound for Screen {
        fn play(&self, _frequency: u32, _duration: Duration) {}
    }

    fn settings(delay: Duration) -> Arc<ArcSwap<LiveSettings>> {
        settings_with_display(delay, Duration::ZERO)
    }

    fn settings_with_display(delay: Duration, display: Duration) -> Arc<ArcSwap<LiveSettings>> {
        let mut live = LiveSettings::from_config(&PpeConfig::default());
        live.alert_delay = delay;
        live.cue.duration = Duration::ZERO;
        live.cue.display = display;
        Arc::new(ArcSwap::from_pointee(live))
    }

    fn violation() -> Vec<Detection> {
        vec![Detection::new(5, 0.9, BoundingBox::new(0.1, 0.1, 0.4, 0.4))]
    }

    fn build(
        reads: Vec<Option<Frame>>,
        script: Vec<Vec<Detection>>,
        delay: Duration,
    ) -> Result<(DetectionLoop, Arc<Screen>)> {
        build_with(reads, script, settings(delay))
    }

    fn build_with(
        reads: Vec<Option<Frame>>,
        script: Vec<Vec<Detection>>,
        live: Arc<ArcSwap<LiveSettings>>,
    ) -> Result<(DetectionLoop, Arc<Screen>)> {
        let screen = Arc::new(Screen::default());
        let mut reads = Some(reads);
        let opener: SourceOpener = Box::new(move || match reads.take() {
            Some(reads) => Ok(Box::new(ScriptedSource {
                reads: reads.into(),
                open: true,
            }) as Box<dyn FrameSource>),
            None => Err(anyhow!("connection refused")),
        });
        let detector = Detector::new(
            Box::new(StubBackend::new(script)),
            Arc::new(EquipmentCatalog::default()),
            0.5,
        )?;
        let notifier = Notifier::new(screen.clone(), screen.clone(), None);
        Ok((
            DetectionLoop::new(opener, detector, notifier, live),
            screen,
        ))
    }

    fn frame() -> Option<Frame> {
        Some(Frame::filled(16, 16, 3, 90))
    }

    #[test]
    fn unavailable_source_backs_off() -> Result<()> {
        let (mut pipeline, screen) = build(Vec::new(), Vec::new(), Duration::ZERO)?;
        // first open succeeds with an empty script, the stream then ends
        assert_eq!(pipeline.tick(), TickOutcome::ReadFailed);
        let outcome = pipeline.tick();
        assert_eq!(outcome, TickOutcome::SourceUnavailable);
        assert_eq!(pipeline.next_delay(outcome), RECONNECT_BACKOFF);
        assert_eq!(pipeline.stats().open_failures, 1);
        assert_eq!(
            screen.statuses.lock().unwrap().last().map(String::as_str),
            Some(SOURCE_UNAVAILABLE_STATUS)
        );
        Ok(())
    }

    #[test]
    fn failed_read_keeps_source_and_recovers() -> Result<()> {
        let (mut pipeline, screen) =
            build(vec![None, frame()], vec![Vec::new()], Duration::ZERO)?;
        let outcome = pipeline.tick();
        assert_eq!(outcome, TickOutcome::ReadFailed);
        assert_eq!(pipeline.next_delay(outcome), DEFAULT_TICK);
        assert_eq!(
            pipeline.tick(),
            TickOutcome::Processed {
                violation: false,
                alerted: false
            }
        );
        assert_eq!(*screen.frames.lock().unwrap(), 1);
        assert_eq!(
            screen.statuses.lock().unwrap().last().map(String::as_str),
            Some(MONITORING_STATUS)
        );
        Ok(())
    }

    #[test]
    fn violations_are_throttled_between_alerts() -> Result<()> {
        let delay = Duration::from_secs(5);
        let (mut pipeline, screen) = build(
            vec![frame(), frame(), frame()],
            vec![violation()],
            delay,
        )?;
        let t = Instant::now();
        assert_eq!(
            pipeline.tick_at(t),
            TickOutcome::Processed {
                violation: true,
                alerted: true
            }
        );
        pipeline.wait_for_notifications();
        assert_eq!(
            pipeline.tick_at(t + Duration::from_secs(1)),
            TickOutcome::Processed {
                violation: true,
                alerted: false
            }
        );
        pipeline.wait_for_notifications();
        assert_eq!(
            pipeline.tick_at(t + delay + Duration::from_millis(1)),
            TickOutcome::Processed {
                violation: true,
                alerted: true
            }
        );
        pipeline.wait_for_notifications();
        assert_eq!(pipeline.stats().alerts_emitted, 2);
        assert_eq!(pipeline.stats().alerts_suppressed, 1);
        assert_eq!(*screen.frames.lock().unwrap(), 3);
        Ok(())
    }

    #[test]
    fn live_settings_reach_detector_and_throttle() -> Result<()> {
        let (mut pipeline, _screen) = build(vec![frame()], vec![violation()], Duration::ZERO)?;
        let mut next = (**pipeline.settings.load()).clone();
        next.min_confidence = 0.95;
        next.alert_delay = Duration::from_secs(9);
        pipeline.settings.store(Arc::new(next));

        assert_eq!(
            pipeline.tick(),
            TickOutcome::Processed {
                violation: false,
                alerted: false
            }
        );
        assert_eq!(pipeline.detector().min_confidence(), 0.95);
        assert_eq!(pipeline.throttle().delay(), Duration::from_secs(9));
        Ok(())
    }

    #[test]
    fn reconnect_flag_reopens_source() -> Result<()> {
        let (mut pipeline, _screen) = build(vec![frame(), frame()], vec![Vec::new()], Duration::ZERO)?;
        assert!(matches!(pipeline.tick(), TickOutcome::Processed { .. }));
        pipeline.reconnect_flag().store(true, Ordering::SeqCst);
        // the opener only succeeds once
        assert_eq!(pipeline.tick(), TickOutcome::SourceUnavailable);
        let stats = pipeline.finish();
        assert_eq!(stats.frames_processed, 1);
        Ok(())
    }

    #[test]
    fn status_display_time_does_not_hold_back_the_next_alert() -> Result<()> {
        let live = settings_with_display(Duration::ZERO, Duration::from_millis(1500));
        let (mut pipeline, screen) =
            build_with(vec![frame(), frame(), frame()], vec![violation()], live)?;
        let alerted = TickOutcome::Processed {
            violation: true,
            alerted: true,
        };
        let settle = |pipeline: &DetectionLoop| {
            let deadline = Instant::now() + Duration::from_millis(500);
            while pipeline.notification_in_flight() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
        };

        let t = Instant::now();
        assert_eq!(pipeline.tick_at(t), alerted);
        settle(&pipeline);
        assert_eq!(pipeline.tick_at(t + Duration::from_millis(300)), alerted);
        settle(&pipeline);
        assert_eq!(pipeline.tick_at(t + Duration::from_millis(1300)), alerted);

        let stats = pipeline.finish();
        assert_eq!(stats.alerts_emitted, 3);
        assert_eq!(stats.alerts_suppressed, 0);
        assert_eq!(
            screen.statuses.lock().unwrap().last().map(String::as_str),
            Some(MONITORING_STATUS)
        );
        Ok(())
    }
}
