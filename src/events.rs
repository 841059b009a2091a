use crate::keymap::KeyId;

/// A single note edge on the merged timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoteEvent {
    /// Milliseconds from the start of the score
    pub time_ms: u64,
    pub track: u32,
    pub pitch: u8,
    pub is_note_on: bool,
    pub velocity: u8,
}

impl NoteEvent {
    pub fn on(time_ms: u64, track: u32, pitch: u8, velocity: u8) -> Self {
        Self {
            time_ms,
            track,
            pitch,
            is_note_on: true,
            velocity,
        }
    }

    pub fn off(time_ms: u64, track: u32, pitch: u8) -> Self {
        Self {
            time_ms,
            track,
            pitch,
            is_note_on: false,
            velocity: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyAction {
    Press(KeyId),
    Release(KeyId),
}

impl KeyAction {
    pub fn key(&self) -> KeyId {
        match self {
            KeyAction::Press(key) | KeyAction::Release(key) => *key,
        }
    }
}
