//! Mapping from recorded timestamps to wall-clock deadlines.
//!
//! The clock is anchored at a pair (wall instant, recorded timestamp); a
//! record's deadline is the anchor instant plus its distance from the anchor
//! timestamp divided by the rate. Pause, resume, rate changes and jumps only
//! move the anchor, so deadlines stay non-decreasing in timestamp order.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct PlaybackClock {
    rate: f64,
    anchor_wall: Instant,
    anchor_ts: i64,
    paused_at: Option<Instant>,
}

impl PlaybackClock {
    /// Clock where `start_ts` is due at `now`. `rate` must be positive.
    pub fn new(now: Instant, start_ts: i64, rate: f64) -> Self {
        Self {
            rate,
            anchor_wall: now,
            anchor_ts: start_ts,
            paused_at: None,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }

    /// Wall instant at which a record stamped `ts` is due.
    ///
    /// Timestamps before the anchor are due at the anchor. While paused the
    /// result is only meaningful after `resume`.
    pub fn deadline(&self, ts: i64) -> Instant {
        self.anchor_wall + self.scale(ts.saturating_sub(self.anchor_ts))
    }

    /// Recorded timestamp the clock is at, at wall time `now`.
    pub fn now_ts(&self, now: Instant) -> i64 {
        let effective = self.paused_at.unwrap_or(now);
        let elapsed = effective.saturating_duration_since(self.anchor_wall);
        let logical = (elapsed.as_nanos() as f64 * self.rate).round() as i64;
        self.anchor_ts.saturating_add(logical)
    }

    /// Freeze the clock. No-op when already paused.
    pub fn pause(&mut self, now: Instant) {
        if self.paused_at.is_none() {
            self.paused_at = Some(now);
        }
    }

    /// Unfreeze the clock, shifting every deadline by the paused duration.
    pub fn resume(&mut self, now: Instant) {
        if let Some(paused_at) = self.paused_at.take() {
            self.anchor_wall += now.saturating_duration_since(paused_at);
        }
    }

    /// Change the rate without moving the current logical position.
    pub fn set_rate(&mut self, rate: f64, now: Instant) {
        let ts = self.now_ts(now);
        self.anchor_ts = ts;
        self.anchor_wall = self.paused_at.unwrap_or(now);
        self.rate = rate;
    }

    /// Re-anchor so that `ts` is due at `now`. Keeps the pause state.
    pub fn jump(&mut self, ts: i64, now: Instant) {
        self.anchor_ts = ts;
        self.anchor_wall = now;
        if self.paused_at.is_some() {
            self.paused_at = Some(now);
        }
    }

    fn scale(&self, delta_ns: i64) -> Duration {
        if delta_ns <= 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos((delta_ns as f64 / self.rate).round() as u64)
    }
}
