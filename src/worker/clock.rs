//! Deterministic replay clock.
//!
//! During replay `now_ms` returns the recorded timestamp of the batch being
//! re-driven, so time-dependent workflow logic reproduces its original
//! decisions. In the live batch the value is the service timestamp of the
//! task being decided, which tracks wall time.

#[derive(Debug)]
pub struct ReplayClock {
    current_time_ms: i64,
    replaying: bool,
}

impl ReplayClock {
    pub fn new(initial_time_ms: i64) -> Self {
        Self {
            current_time_ms: initial_time_ms,
            replaying: true,
        }
    }

    /// Deterministic current time in epoch milliseconds.
    pub fn now_ms(&self) -> i64 {
        self.current_time_ms
    }

    /// Advance the clock. History timestamps are monotone; a stale value is
    /// ignored rather than moving time backwards.
    pub fn set_time_ms(&mut self, time_ms: i64) {
        if time_ms > self.current_time_ms {
            self.current_time_ms = time_ms;
        }
    }

    pub fn is_replaying(&self) -> bool {
        self.replaying
    }

    pub fn set_replaying(&mut self, replaying: bool) {
        self.replaying = replaying;
    }
}
