//! Pitch to key translation for the 36-key in-game instrument.
//!
//! The instrument spans three octaves, C3 (48) to B5 (83). Naturals sit on the
//! letter rows `z..m`, `a..j` and `q..u`; accidentals are played by holding
//! `shift` on the natural below.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const LOWEST_PITCH: u8 = 48;
pub const HIGHEST_PITCH: u8 = 83;
pub const KEY_COUNT: usize = (HIGHEST_PITCH - LOWEST_PITCH + 1) as usize;

/// How many octave shifts are tried before a note is given up on.
pub const MAX_OCTAVE_SHIFTS: u32 = 3;

const SUGGEST_SEARCH: i8 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Modifier {
    Shift,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyId {
    pub key: char,
    pub modifier: Option<Modifier>,
}

impl KeyId {
    const fn plain(key: char) -> Self {
        Self {
            key,
            modifier: None,
        }
    }

    const fn shifted(key: char) -> Self {
        Self {
            key,
            modifier: Some(Modifier::Shift),
        }
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.modifier {
            Some(Modifier::Shift) => write!(f, "shift+{}", self.key),
            None => write!(f, "{}", self.key),
        }
    }
}

#[rustfmt::skip]
static KEY_TABLE: [KeyId; KEY_COUNT] = [
    // low octave, 48..=59
    KeyId::plain('z'), KeyId::shifted('z'), KeyId::plain('x'), KeyId::shifted('x'),
    KeyId::plain('c'), KeyId::plain('v'), KeyId::shifted('v'), KeyId::plain('b'),
    KeyId::shifted('b'), KeyId::plain('n'), KeyId::shifted('n'), KeyId::plain('m'),
    // middle octave, 60..=71
    KeyId::plain('a'), KeyId::shifted('a'), KeyId::plain('s'), KeyId::shifted('s'),
    KeyId::plain('d'), KeyId::plain('f'), KeyId::shifted('f'), KeyId::plain('g'),
    KeyId::shifted('g'), KeyId::plain('h'), KeyId::shifted('h'), KeyId::plain('j'),
    // high octave, 72..=83
    KeyId::plain('q'), KeyId::shifted('q'), KeyId::plain('w'), KeyId::shifted('w'),
    KeyId::plain('e'), KeyId::plain('r'), KeyId::shifted('r'), KeyId::plain('t'),
    KeyId::shifted('t'), KeyId::plain('y'), KeyId::shifted('y'), KeyId::plain('u'),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KeyLayout {
    /// All 36 semitones, accidentals through `shift`.
    #[default]
    Chromatic,
    /// Only the 21 naturals; an accidental falls to the natural below it.
    Diatonic,
}

impl KeyLayout {
    pub fn map_pitch(self, pitch: u8, transposition: i8) -> Option<KeyId> {
        let folded = fold_into_range(pitch, transposition)?;
        let index = (folded - LOWEST_PITCH) as usize;
        match self {
            KeyLayout::Chromatic => Some(KEY_TABLE[index]),
            KeyLayout::Diatonic if is_natural(folded) => Some(KEY_TABLE[index]),
            // the lowest pitch is a natural, so index - 1 never underflows here
            KeyLayout::Diatonic => Some(KEY_TABLE[index - 1]),
        }
    }

    fn plays_directly(self, pitch: i16) -> bool {
        let in_range = (LOWEST_PITCH as i16..=HIGHEST_PITCH as i16).contains(&pitch);
        match self {
            KeyLayout::Chromatic => in_range,
            KeyLayout::Diatonic => in_range && is_natural(pitch as u8),
        }
    }
}

/// Maps a pitch on the chromatic layout.
pub fn map_pitch(pitch: u8, transposition: i8) -> Option<KeyId> {
    KeyLayout::Chromatic.map_pitch(pitch, transposition)
}

/// Applies the transposition and folds by octaves toward the playable range.
///
/// Returns `None` when the note is still out of range after
/// [`MAX_OCTAVE_SHIFTS`] shifts.
pub fn fold_into_range(pitch: u8, transposition: i8) -> Option<u8> {
    let mut effective = pitch as i16 + transposition as i16;
    for _ in 0..MAX_OCTAVE_SHIFTS {
        if effective < LOWEST_PITCH as i16 {
            effective += 12;
        } else if effective > HIGHEST_PITCH as i16 {
            effective -= 12;
        } else {
            break;
        }
    }

    (LOWEST_PITCH as i16..=HIGHEST_PITCH as i16)
        .contains(&effective)
        .then_some(effective as u8)
}

/// Picks the transposition that lets the most notes play without octave
/// folding. Ties go to the smallest shift.
pub fn suggest_transposition(pitches: &[u8], layout: KeyLayout) -> i8 {
    let mut best_offset = 0i8;
    let mut best_count = 0usize;

    let candidates = std::iter::once(0).chain((1..=SUGGEST_SEARCH).flat_map(|d| [-d, d]));
    for offset in candidates {
        let count = pitches
            .iter()
            .filter(|&&p| layout.plays_directly(p as i16 + offset as i16))
            .count();
        if count > best_count {
            best_count = count;
            best_offset = offset;
        }
    }

    best_offset
}

fn is_natural(pitch: u8) -> bool {
    matches!(pitch % 12, 0 | 2 | 4 | 5 | 7 | 9 | 11)
}
