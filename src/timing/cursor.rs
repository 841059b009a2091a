use std::time::{Duration, Instant};

/// Position within a filtered event list, anchored to the wall clock.
///
/// While running, the event at offset `t` is due at
/// `anchor + (t - elapsed_at_pause)`. Every wait is derived from the anchor,
/// never from the previous event, so lateness does not accumulate.
#[derive(Debug, Clone)]
pub struct PlaybackCursor {
    pub index: usize,
    elapsed_at_pause: Duration,
    anchor: Instant,
    running: bool,
}

impl PlaybackCursor {
    pub fn new(now: Instant) -> Self {
        Self {
            index: 0,
            elapsed_at_pause: Duration::ZERO,
            anchor: now,
            running: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Starts or resumes from the frozen position.
    pub fn start(&mut self, now: Instant) {
        self.anchor = now;
        self.running = true;
    }

    pub fn freeze(&mut self, now: Instant) {
        self.elapsed_at_pause = self.position(now);
        self.running = false;
    }

    pub fn position(&self, now: Instant) -> Duration {
        if self.running {
            self.elapsed_at_pause + now.saturating_duration_since(self.anchor)
        } else {
            self.elapsed_at_pause
        }
    }

    pub fn position_ms(&self, now: Instant) -> u64 {
        self.position(now).as_millis() as u64
    }

    pub fn due_at(&self, time_ms: u64) -> Instant {
        let offset = Duration::from_millis(time_ms).saturating_sub(self.elapsed_at_pause);
        self.anchor + offset
    }

    /// Moves to `index` at `position_ms`, keeping the running flag.
    pub fn relocate(&mut self, index: usize, position_ms: u64, now: Instant) {
        self.index = index;
        self.elapsed_at_pause = Duration::from_millis(position_ms);
        self.anchor = now;
    }
}
