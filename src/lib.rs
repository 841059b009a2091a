//! Plays MIDI scores into a game window as timed keystrokes.
//!
//! A [`Timeline`] is parsed from a MIDI file, each note is mapped to one of
//! the instrument's 36 keys by [`keymap`], and a player thread spawned with
//! [`spawn_player`] presses and releases keys on time while a
//! [`FocusMonitor`] watches the target window.

pub mod config;
pub mod emitter;
pub mod engine;
pub mod events;
pub mod focus;
pub mod keymap;
pub mod score;
pub mod timing;

pub use config::{ConfigError, Settings};
pub use emitter::{EmitError, KeyDriver, KeyEmitter, LogEmitter, RecordingEmitter};
pub use engine::{
    PlaybackState, PlaybackStats, PlayerCommand, PlayerError, PlayerHandle, PlayerStatus,
    PlayerUpdate, StopReason, spawn_player,
};
pub use events::{KeyAction, NoteEvent};
pub use focus::{
    CommandProbe, FocusEvent, FocusMonitor, ManualProbe, TitleMatch, WindowProbe, WindowStatus,
};
pub use keymap::{KeyId, KeyLayout, map_pitch};
pub use score::{ParseError, Timeline, Track, TrackSelection};
