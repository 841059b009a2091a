//! Standard MIDI File decoding.
//!
//! Ticks are converted to milliseconds through a single tempo map gathered
//! from every track, so a conductor track in a format 1 file drives all parts.

use super::ParseError;
use crate::events::NoteEvent;
use midly::{Format, MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};
use std::collections::BTreeMap;
use tracing::debug;

const DEFAULT_MICROS_PER_QUARTER: u64 = 500_000;

/// Note edges decoded from a file, before normalisation.
pub(super) struct DecodedScore {
    pub events: Vec<NoteEvent>,
    pub names: BTreeMap<u32, String>,
    /// End of each owning track in milliseconds
    pub track_ends: BTreeMap<u32, u64>,
    pub duration_ms: u64,
}

struct RawNote {
    tick: u64,
    owner: u32,
    pitch: u8,
    is_note_on: bool,
    velocity: u8,
}

pub(super) fn decode(data: &[u8]) -> Result<DecodedScore, ParseError> {
    let smf = Smf::parse(data)?;
    let clock = TickClock::from_smf(&smf)?;

    // A format 0 file keeps every part in one track, so parts are told apart by channel
    let split_channels = smf.header.format == Format::SingleTrack;

    debug!(
        "Decoding MIDI file: {:?}, {} tracks, split by channel: {}",
        smf.header.format,
        smf.tracks.len(),
        split_channels
    );

    let mut raw = Vec::new();
    let mut names = BTreeMap::new();
    let mut end_ticks: BTreeMap<u32, u64> = BTreeMap::new();
    let mut last_tick = 0u64;

    for (track_index, track) in smf.tracks.iter().enumerate() {
        let track_index = track_index as u32;
        let mut tick = 0u64;
        let mut track_name = None;
        let first_note = raw.len();

        for event in track.iter() {
            tick += event.delta.as_int() as u64;

            match event.kind {
                TrackEventKind::Meta(MetaMessage::TrackName(bytes)) if track_name.is_none() => {
                    track_name = decode_name(bytes);
                }
                TrackEventKind::Midi { channel, message } => {
                    let (pitch, is_note_on, velocity) = match message {
                        MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                            (key.as_int(), true, vel.as_int())
                        }
                        // a note-on with zero velocity is a note-off
                        MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => {
                            (key.as_int(), false, 0)
                        }
                        _ => continue,
                    };
                    let owner = if split_channels {
                        channel.as_int() as u32
                    } else {
                        track_index
                    };
                    raw.push(RawNote {
                        tick,
                        owner,
                        pitch,
                        is_note_on,
                        velocity,
                    });
                }
                _ => {}
            }
        }

        last_tick = last_tick.max(tick);

        for note in &raw[first_note..] {
            let end = end_ticks.entry(note.owner).or_insert(0);
            *end = (*end).max(tick);
            if !split_channels {
                if let Some(name) = &track_name {
                    names.entry(note.owner).or_insert_with(|| name.clone());
                }
            }
        }
    }

    raw.sort_by_key(|note| (note.tick, note.owner));

    let events = raw
        .iter()
        .map(|note| NoteEvent {
            time_ms: clock.ms_at(note.tick),
            track: note.owner,
            pitch: note.pitch,
            is_note_on: note.is_note_on,
            velocity: note.velocity,
        })
        .collect::<Vec<_>>();

    if split_channels {
        for &owner in end_ticks.keys() {
            names.insert(owner, format!("Channel {}", owner + 1));
        }
    }

    let track_ends = end_ticks
        .into_iter()
        .map(|(owner, tick)| (owner, clock.ms_at(tick)))
        .collect();

    debug!("Decoded {} note edges", events.len());

    Ok(DecodedScore {
        events,
        names,
        track_ends,
        duration_ms: clock.ms_at(last_tick),
    })
}

fn decode_name(bytes: &[u8]) -> Option<String> {
    let name: String = String::from_utf8_lossy(bytes)
        .chars()
        .filter(|c| !c.is_control())
        .collect();
    let name = name.trim();
    (!name.is_empty()).then(|| name.to_string())
}

#[derive(Debug, Clone, Copy)]
struct TempoSegment {
    tick: u64,
    /// Microseconds elapsed when this segment starts
    micros: u64,
    micros_per_quarter: u64,
}

enum TickClock {
    Metrical {
        ticks_per_quarter: u64,
        segments: Vec<TempoSegment>,
    },
    Timecode {
        ticks_per_second: f64,
    },
}

impl TickClock {
    fn from_smf(smf: &Smf) -> Result<Self, ParseError> {
        match smf.header.timing {
            Timing::Metrical(tpq) => {
                let ticks_per_quarter = tpq.as_int() as u64;
                if ticks_per_quarter == 0 {
                    return Err(ParseError::Malformed(
                        "zero ticks per quarter note".to_string(),
                    ));
                }

                let mut changes = Vec::new();
                for track in smf.tracks.iter() {
                    let mut tick = 0u64;
                    for event in track.iter() {
                        tick += event.delta.as_int() as u64;
                        if let TrackEventKind::Meta(MetaMessage::Tempo(tempo)) = event.kind {
                            changes.push((tick, tempo.as_int() as u64));
                        }
                    }
                }
                changes.sort_by_key(|&(tick, _)| tick);

                let mut segments = vec![TempoSegment {
                    tick: 0,
                    micros: 0,
                    micros_per_quarter: DEFAULT_MICROS_PER_QUARTER,
                }];
                for (tick, micros_per_quarter) in changes {
                    let last = segments[segments.len() - 1];
                    if tick == last.tick {
                        // later change at the same tick wins
                        let len = segments.len();
                        segments[len - 1].micros_per_quarter = micros_per_quarter;
                        continue;
                    }
                    segments.push(TempoSegment {
                        tick,
                        micros: last.micros
                            + (tick - last.tick) * last.micros_per_quarter / ticks_per_quarter,
                        micros_per_quarter,
                    });
                }

                debug!(
                    "Tempo map: {} segments at {} ticks per quarter",
                    segments.len(),
                    ticks_per_quarter
                );

                Ok(TickClock::Metrical {
                    ticks_per_quarter,
                    segments,
                })
            }
            Timing::Timecode(fps, subframes) => {
                let ticks_per_second = fps.as_f32() as f64 * subframes as f64;
                if ticks_per_second <= 0.0 {
                    return Err(ParseError::Malformed("zero timecode resolution".to_string()));
                }
                Ok(TickClock::Timecode { ticks_per_second })
            }
        }
    }

    fn ms_at(&self, tick: u64) -> u64 {
        match self {
            TickClock::Metrical {
                ticks_per_quarter,
                segments,
            } => {
                let idx = segments.partition_point(|s| s.tick <= tick).saturating_sub(1);
                let segment = &segments[idx];
                let micros = segment.micros
                    + (tick - segment.tick) * segment.micros_per_quarter / ticks_per_quarter;
                micros / 1000
            }
            TickClock::Timecode { ticks_per_second } => {
                (tick as f64 * 1000.0 / ticks_per_second).round() as u64
            }
        }
    }
}
