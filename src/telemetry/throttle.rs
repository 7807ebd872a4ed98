use std::time::{Duration, Instant};

/// Default minimum spacing between snapshot broadcasts
pub const DEFAULT_THROTTLE_MS: u64 = 150;

/// Minimum-interval gate for snapshot broadcasts.
///
/// Attempts arriving sooner than `interval` after the last pass are dropped,
/// not queued. A trailing flush can be armed once per closed window.
#[derive(Debug, Clone)]
pub struct BroadcastGate {
    interval: Duration,
    last_pass: Option<Instant>,
    trailing_armed: bool,
}

impl BroadcastGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_pass: None,
            trailing_armed: false,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// True if a broadcast may go out now; records the pass
    pub fn try_pass(&mut self, now: Instant) -> bool {
        let open = match self.last_pass {
            Some(last) => now.saturating_duration_since(last) >= self.interval,
            None => true,
        };
        if open {
            self.last_pass = Some(now);
            self.trailing_armed = false;
        }
        open
    }

    /// Record a pass regardless of the interval
    pub fn force(&mut self, now: Instant) {
        self.last_pass = Some(now);
        self.trailing_armed = false;
    }

    /// Time until the gate reopens
    pub fn remaining(&self, now: Instant) -> Duration {
        match self.last_pass {
            Some(last) => self
                .interval
                .saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        }
    }

    /// Arm the trailing flush. Returns false if one is already pending.
    pub fn arm_trailing(&mut self) -> bool {
        if self.trailing_armed {
            return false;
        }
        self.trailing_armed = true;
        true
    }

    pub fn trailing_armed(&self) -> bool {
        self.trailing_armed
    }
}

impl Default for BroadcastGate {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_THROTTLE_MS))
    }
}
