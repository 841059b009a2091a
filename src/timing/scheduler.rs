use super::PlaybackCursor;
use crate::events::NoteEvent;
use std::time::Instant;

/// The events being played and where playback is within them.
#[derive(Debug, Clone)]
pub struct Schedule {
    events: Vec<NoteEvent>,
    cursor: PlaybackCursor,
}

impl Schedule {
    /// A stopped schedule at the start of `events`, which must be time-ordered.
    pub fn new(events: Vec<NoteEvent>, now: Instant) -> Self {
        Self {
            events,
            cursor: PlaybackCursor::new(now),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.cursor.index >= self.events.len()
    }

    pub fn is_running(&self) -> bool {
        self.cursor.is_running()
    }

    pub fn start(&mut self, now: Instant) {
        self.cursor.start(now);
    }

    pub fn freeze(&mut self, now: Instant) {
        self.cursor.freeze(now);
    }

    pub fn position_ms(&self, now: Instant) -> u64 {
        self.cursor.position_ms(now)
    }

    /// When the next batch is due, if there is one.
    pub fn next_due(&self) -> Option<Instant> {
        self.events
            .get(self.cursor.index)
            .map(|event| self.cursor.due_at(event.time_ms))
    }

    /// Takes the next batch, every event sharing one timestamp, if it is due
    /// by `now`. Returns an empty slice otherwise.
    pub fn take_due(&mut self, now: Instant) -> &[NoteEvent] {
        if !self.cursor.is_running() {
            return &[];
        }
        let start = self.cursor.index;
        let Some(first) = self.events.get(start) else {
            return &[];
        };
        if self.cursor.due_at(first.time_ms) > now {
            return &[];
        }

        let time_ms = first.time_ms;
        let len = self.events[start..]
            .iter()
            .take_while(|e| e.time_ms == time_ms)
            .count();
        self.cursor.index = start + len;
        &self.events[start..start + len]
    }

    /// Moves to the first event at or after `offset_ms`.
    pub fn seek(&mut self, offset_ms: u64, now: Instant) {
        let index = self.events.partition_point(|e| e.time_ms < offset_ms);
        self.cursor.relocate(index, offset_ms, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn events() -> Vec<NoteEvent> {
        vec![
            NoteEvent::on(0, 0, 60, 100),
            NoteEvent::on(250, 1, 64, 100),
            NoteEvent::off(500, 0, 60),
            NoteEvent::on(500, 1, 67, 100),
            NoteEvent::off(750, 1, 64),
        ]
    }

    #[test]
    fn test_batches_group_equal_timestamps() {
        let start = Instant::now();
        let mut schedule = Schedule::new(events(), start);
        assert!(schedule.take_due(start).is_empty(), "not started yet");

        schedule.start(start);
        assert_eq!(schedule.take_due(start).len(), 1);
        assert!(schedule.take_due(start).is_empty());
        assert_eq!(schedule.next_due(), Some(start + Duration::from_millis(250)));

        // running late delivers each batch in turn
        let late = start + Duration::from_millis(600);
        assert_eq!(schedule.take_due(late).len(), 1);
        let batch = schedule.take_due(late);
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|e| e.time_ms == 500));
        assert!(schedule.take_due(late).is_empty());
        assert!(!schedule.is_finished());

        schedule.take_due(start + Duration::from_millis(750));
        assert!(schedule.is_finished());
        assert_eq!(schedule.next_due(), None);
    }

    #[test]
    fn test_frozen_schedule_emits_nothing() {
        let start = Instant::now();
        let mut schedule = Schedule::new(events(), start);
        schedule.start(start);
        schedule.take_due(start);
        schedule.freeze(start + Duration::from_millis(100));
        assert!(schedule.take_due(start + Duration::from_secs(5)).is_empty());
        assert_eq!(schedule.position_ms(start + Duration::from_secs(5)), 100);
    }

    #[test]
    fn test_seek_lands_on_first_event_at_offset() {
        let start = Instant::now();
        let mut schedule = Schedule::new(events(), start);
        schedule.seek(400, start);
        schedule.start(start);
        assert_eq!(schedule.next_due(), Some(start + Duration::from_millis(100)));
        let batch = schedule.take_due(start + Duration::from_millis(100));
        assert_eq!(batch[0].time_ms, 500);
    }
}
