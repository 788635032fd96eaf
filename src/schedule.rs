use std::time::{Duration, Instant};

pub const MIN_INTERVAL_MINUTES: u32 = 1;
pub const MAX_INTERVAL_MINUTES: u32 = 120;

/// Fixed-delay auto-measure timer.
///
/// The next run is due one interval after the previous run *finished*, not
/// after it started. While a run is in flight nothing is due.
#[derive(Debug, Clone)]
pub struct AutoSchedule {
    enabled: bool,
    interval_minutes: u32,
    next_due: Option<Instant>,
    running: bool,
}

impl AutoSchedule {
    pub fn new(interval_minutes: u32) -> Self {
        AutoSchedule {
            enabled: false,
            interval_minutes: clamp_interval(interval_minutes),
            next_due: None,
            running: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn interval_minutes(&self) -> u32 {
        self.interval_minutes
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.interval_minutes) * 60)
    }

    /// Turn auto-measure on. The first run is due immediately.
    pub fn enable(&mut self, now: Instant) {
        self.enabled = true;
        if !self.running {
            self.next_due = Some(now);
        }
    }

    /// Turn auto-measure off. A run already in flight is left alone, but
    /// nothing further is scheduled.
    pub fn disable(&mut self) {
        self.enabled = false;
        self.next_due = None;
    }

    /// Returns the new state.
    pub fn toggle(&mut self, now: Instant) -> bool {
        if self.enabled {
            self.disable();
        } else {
            self.enable(now);
        }
        self.enabled
    }

    /// Set the interval, clamped to the allowed range. A pending run keeps
    /// its original due time; the new interval applies from the next one.
    pub fn set_interval_minutes(&mut self, minutes: u32) -> u32 {
        self.interval_minutes = clamp_interval(minutes);
        self.interval_minutes
    }

    pub fn adjust_interval(&mut self, delta: i32) -> u32 {
        let minutes = (self.interval_minutes as i64 + delta as i64).max(0) as u32;
        self.set_interval_minutes(minutes)
    }

    /// Whether an auto-run should start now.
    pub fn due(&self, now: Instant) -> bool {
        self.enabled && !self.running && self.next_due.is_some_and(|at| now >= at)
    }

    /// Record that an auto-run has started.
    pub fn on_run_started(&mut self) {
        self.running = true;
        self.next_due = None;
    }

    /// Record that an auto-run has finished, successfully or not.
    pub fn on_run_complete(&mut self, now: Instant) {
        self.running = false;
        if self.enabled {
            self.next_due = Some(now + self.interval());
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn time_until_next(&self, now: Instant) -> Option<Duration> {
        self.next_due.map(|at| at.saturating_duration_since(now))
    }
}

pub fn clamp_interval(minutes: u32) -> u32 {
    minutes.clamp(MIN_INTERVAL_MINUTES, MAX_INTERVAL_MINUTES)
}
