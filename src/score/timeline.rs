use super::{ParseError, parser};
use crate::events::NoteEvent;
use midly::num::{u15, u24, u28, u4, u7};
use midly::{Format, Header, MetaMessage, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    pub index: u32,
    pub name: String,
    pub note_count: u32,
    pub is_enabled: bool,
    /// Lowest and highest sounding pitch
    pub pitch_range: Option<(u8, u8)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackSelection {
    /// Every enabled track
    #[default]
    All,
    /// A single track, regardless of its enabled flag
    Solo(u32),
}

/// Every note of a score merged into one time-ordered sequence.
///
/// Per `(track, pitch)` presses and releases strictly alternate, starting with
/// a press and ending with a release.
#[derive(Debug, Clone)]
pub struct Timeline {
    events: Vec<NoteEvent>,
    tracks: Vec<Track>,
    duration_ms: u64,
}

impl Timeline {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ParseError> {
        let data = std::fs::read(path.as_ref())?;
        Self::parse(&data)
    }

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let decoded = parser::decode(data)?;
        let track_ends = decoded.track_ends;
        Self::build(
            decoded.events,
            decoded.names,
            |track| track_ends.get(&track).copied().unwrap_or(0),
            decoded.duration_ms,
        )
    }

    /// Builds a timeline from loose note edges, for scores that don't come
    /// from a file.
    pub fn from_events(mut events: Vec<NoteEvent>) -> Result<Self, ParseError> {
        events.sort_by_key(|e| (e.time_ms, e.track));
        let mut ends = BTreeMap::new();
        for event in &events {
            ends.insert(event.track, event.time_ms);
        }
        let duration_ms = events.last().map_or(0, |e| e.time_ms);
        Self::build(
            events,
            BTreeMap::new(),
            |track| ends.get(&track).copied().unwrap_or(0),
            duration_ms,
        )
    }

    fn build(
        sorted: Vec<NoteEvent>,
        mut names: BTreeMap<u32, String>,
        track_end: impl Fn(u32) -> u64,
        duration_ms: u64,
    ) -> Result<Self, ParseError> {
        let mut events = Vec::with_capacity(sorted.len());
        let mut sounding: HashSet<(u32, u8)> = HashSet::new();
        let mut dropped = 0usize;

        for event in sorted {
            let voice = (event.track, event.pitch);
            if event.is_note_on {
                if !sounding.insert(voice) {
                    // re-press while sounding: release first, the new press wins
                    events.push(NoteEvent::off(event.time_ms, event.track, event.pitch));
                }
                events.push(event);
            } else if sounding.remove(&voice) {
                events.push(event);
            } else {
                dropped += 1;
            }
        }

        if !sounding.is_empty() {
            let mut hanging: Vec<_> = sounding.into_iter().collect();
            hanging.sort_unstable();
            debug!("Closing {} notes left sounding at track end", hanging.len());
            for (track, pitch) in hanging {
                events.push(NoteEvent::off(track_end(track), track, pitch));
            }
            events.sort_by_key(|e| (e.time_ms, e.track));
        }

        if dropped > 0 {
            debug!("Dropped {} note-offs without a matching note-on", dropped);
        }

        let mut tracks: BTreeMap<u32, Track> = BTreeMap::new();
        for event in events.iter().filter(|e| e.is_note_on) {
            let track = tracks.entry(event.track).or_insert_with(|| Track {
                index: event.track,
                name: names
                    .remove(&event.track)
                    .unwrap_or_else(|| format!("Track {}", event.track + 1)),
                note_count: 0,
                is_enabled: true,
                pitch_range: None,
            });
            track.note_count += 1;
            track.pitch_range = Some(match track.pitch_range {
                Some((low, high)) => (low.min(event.pitch), high.max(event.pitch)),
                None => (event.pitch, event.pitch),
            });
        }

        if tracks.is_empty() {
            return Err(ParseError::Empty);
        }

        let duration_ms = duration_ms.max(events.last().map_or(0, |e| e.time_ms));

        Ok(Self {
            events,
            tracks: tracks.into_values().collect(),
            duration_ms,
        })
    }

    pub fn events(&self) -> &[NoteEvent] {
        &self.events
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn track(&self, index: u32) -> Option<&Track> {
        self.tracks.iter().find(|t| t.index == index)
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    /// Returns `false` when no track has that index.
    pub fn set_track_enabled(&mut self, index: u32, enabled: bool) -> bool {
        match self.tracks.iter_mut().find(|t| t.index == index) {
            Some(track) => {
                track.is_enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn events_for(&self, selection: TrackSelection) -> Vec<NoteEvent> {
        match selection {
            TrackSelection::All => {
                let enabled: HashSet<u32> = self
                    .tracks
                    .iter()
                    .filter(|t| t.is_enabled)
                    .map(|t| t.index)
                    .collect();
                self.events
                    .iter()
                    .filter(|e| enabled.contains(&e.track))
                    .copied()
                    .collect()
            }
            TrackSelection::Solo(index) => self
                .events
                .iter()
                .filter(|e| e.track == index)
                .copied()
                .collect(),
        }
    }

    /// Pitches of every note-on, in time order.
    pub fn pitches(&self) -> Vec<u8> {
        self.events
            .iter()
            .filter(|e| e.is_note_on)
            .map(|e| e.pitch)
            .collect()
    }

    /// Flattens the timeline into a format 1 file with one tick per
    /// millisecond. Track indices are not kept, track order and names are.
    ///
    /// Fails with `InvalidData` when two edges of a track are further apart
    /// than a delta time can hold (about 74 hours).
    pub fn to_smf(&self) -> std::io::Result<Vec<u8>> {
        let mut smf = Smf::new(Header::new(
            Format::Parallel,
            Timing::Metrical(u15::from(1000)),
        ));

        smf.tracks.push(vec![
            TrackEvent {
                delta: u28::from(0),
                // 1000 ticks per quarter at one quarter per second
                kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::from(1_000_000))),
            },
            end_of_track(0),
        ]);

        for track in &self.tracks {
            let mut events = vec![TrackEvent {
                delta: u28::from(0),
                kind: TrackEventKind::Meta(MetaMessage::TrackName(track.name.as_bytes())),
            }];
            let channel = u4::from((track.index % 16) as u8);
            let mut last_ms = 0u64;

            for event in self.events.iter().filter(|e| e.track == track.index) {
                let message = if event.is_note_on {
                    MidiMessage::NoteOn {
                        key: u7::from(event.pitch),
                        vel: u7::from(event.velocity.max(1)),
                    }
                } else {
                    MidiMessage::NoteOff {
                        key: u7::from(event.pitch),
                        vel: u7::from(0),
                    }
                };
                events.push(TrackEvent {
                    delta: smf_delta(event.time_ms - last_ms)?,
                    kind: TrackEventKind::Midi { channel, message },
                });
                last_ms = event.time_ms;
            }

            events.push(end_of_track(0));
            smf.tracks.push(events);
        }

        let mut bytes = Vec::new();
        smf.write_std(&mut bytes)?;
        Ok(bytes)
    }
}

/// Largest value of a variable-length delta time.
const MAX_DELTA: u32 = (1 << 28) - 1;

fn smf_delta(gap_ms: u64) -> std::io::Result<u28> {
    u32::try_from(gap_ms)
        .ok()
        .filter(|&gap| gap <= MAX_DELTA)
        .map(u28::from)
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("gap of {gap_ms} ms does not fit in a delta time"),
            )
        })
}

fn end_of_track(delta: u32) -> TrackEvent<'static> {
    TrackEvent {
        delta: u28::from(delta),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    }
}
