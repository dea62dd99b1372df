//! Alert rate limiting.
//!
//! `AlertThrottle` is a single watermark (`last_alert`) with two observable states:
//! `Idle` (never alerted, or the delay window has passed) and `Cooling` (inside the
//! window). A violation emits only when the window has strictly elapsed and no
//! previous emission is still in flight. Violations that do not emit are dropped.

use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ThrottleState {
    Idle,
    Cooling,
}

/// Outcome of one throttle evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThrottleDecision {
    /// Emit an alert; the watermark has been moved to `now`.
    Emit,
    /// Nothing missing in this frame.
    NoViolation,
    /// Still inside the delay window.
    Cooling { remaining: Duration },
    /// A previous alert is still being delivered.
    InFlight,
}

impl ThrottleDecision {
    pub fn should_emit(&self) -> bool {
        matches!(self, ThrottleDecision::Emit)
    }
}

#[derive(Clone, Debug)]
pub struct AlertThrottle {
    delay: Duration,
    last_alert: Option<Instant>,
    emitted: u64,
    suppressed: u64,
}

impl AlertThrottle {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            last_alert: None,
            emitted: 0,
            suppressed: 0,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Change the window length. The watermark is kept.
    pub fn set_delay(&mut self, delay: Duration) {
        self.delay = delay;
    }

    pub fn last_alert(&self) -> Option<Instant> {
        self.last_alert
    }

    pub fn state(&self, now: Instant) -> ThrottleState {
        match self.last_alert {
            Some(last) if now.saturating_duration_since(last) <= self.delay => {
                ThrottleState::Cooling
            }
            _ => ThrottleState::Idle,
        }
    }

    /// Decide whether the violation observed at `now` should raise an alert.
    ///
    /// `missing` is the list of missing equipment names for the frame;
    /// `in_flight` reports whether a previous alert is still being delivered.
    pub fn evaluate(&mut self, now: Instant, missing: &[String], in_flight: bool) -> ThrottleDecision {
        if missing.is_empty() {
            return ThrottleDecision::NoViolation;
        }
        if let Some(last) = self.last_alert {
            let elapsed = now.saturating_duration_since(last);
            if elapsed <= self.delay {
                self.suppressed += 1;
                return ThrottleDecision::Cooling {
                    remaining: self.delay - elapsed,
                };
            }
        }
        if in_flight {
            self.suppressed += 1;
            return ThrottleDecision::InFlight;
        }
        self.last_alert = Some(now);
        self.emitted += 1;
        ThrottleDecision::Emit
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn missing() -> Vec<String> {
        vec!["No Helmet".to_string()]
    }

    #[test]
    fn violations_inside_the_window_emit_once() {
        let delay = Duration::from_secs(5);
        let mut throttle = AlertThrottle::new(delay);
        let t = Instant::now();

        assert_eq!(throttle.evaluate(t, &missing(), false), ThrottleDecision::Emit);
        let second = throttle.evaluate(t + delay - Duration::from_millis(1), &missing(), false);
        assert!(matches!(second, ThrottleDecision::Cooling { .. }));
        assert_eq!(throttle.emitted(), 1);
        assert_eq!(throttle.suppressed(), 1);
    }

    #[test]
    fn violations_past_the_window_emit_twice() {
        let delay = Duration::from_secs(5);
        let mut throttle = AlertThrottle::new(delay);
        let t = Instant::now();

        assert!(throttle.evaluate(t, &missing(), false).should_emit());
        assert!(throttle
            .evaluate(t + delay + Duration::from_millis(1), &missing(), false)
            .should_emit());
        assert_eq!(throttle.emitted(), 2);
    }

    #[test]
    fn exactly_the_delay_is_still_cooling() {
        let delay = Duration::from_secs(2);
        let mut throttle = AlertThrottle::new(delay);
        let t = Instant::now();
        throttle.evaluate(t, &missing(), false);
        assert_eq!(throttle.state(t + delay), ThrottleState::Cooling);
        assert!(!throttle.evaluate(t + delay, &missing(), false).should_emit());
    }

    #[test]
    fn empty_missing_list_never_emits() {
        let mut throttle = AlertThrottle::new(Duration::ZERO);
        let t = Instant::now();
        for i in 0..5 {
            let decision = throttle.evaluate(t + Duration::from_secs(i * 60), &[], false);
            assert_eq!(decision, ThrottleDecision::NoViolation);
        }
        assert_eq!(throttle.state(t), ThrottleState::Idle);
        assert!(throttle.last_alert().is_none());
    }

    #[test]
    fn in_flight_emission_suppresses_and_keeps_watermark() {
        let mut throttle = AlertThrottle::new(Duration::from_secs(1));
        let t = Instant::now();
        assert!(throttle.evaluate(t, &missing(), false).should_emit());

        let later = t + Duration::from_secs(3);
        assert_eq!(throttle.evaluate(later, &missing(), true), ThrottleDecision::InFlight);
        assert_eq!(throttle.last_alert(), Some(t));

        assert!(throttle.evaluate(later, &missing(), false).should_emit());
        assert_eq!(throttle.last_alert(), Some(later));
    }

    #[test]
    fn first_violation_emits_even_with_zero_delay() {
        let mut throttle = AlertThrottle::new(Duration::ZERO);
        let t = Instant::now();
        assert_eq!(throttle.state(t), ThrottleState::Idle);
        assert!(throttle.evaluate(t, &missing(), false).should_emit());
        assert_eq!(throttle.state(t), ThrottleState::Cooling);
        assert!(throttle
            .evaluate(t + Duration::from_nanos(1), &missing(), false)
            .should_emit());
    }
}
