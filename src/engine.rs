use crate::config::Settings;
use crate::emitter::{KeyDriver, KeyEmitter};
use crate::events::NoteEvent;
use crate::focus::{FocusEvent, FocusMonitor, WindowProbe, WindowStatus};
use crate::keymap::{self, KeyLayout};
use crate::score::{Timeline, Track, TrackSelection};
use crate::timing::Schedule;
use crossbeam::channel::{Receiver, Sender, TrySendError};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

const COMMAND_QUEUE: usize = 64;
const UPDATE_QUEUE: usize = 256;
const IDLE_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaybackState::Stopped => write!(f, "stopped"),
            PlaybackState::Playing => write!(f, "playing"),
            PlaybackState::Paused => write!(f, "paused"),
        }
    }
}

/// Why playback ended up in [`PlaybackState::Stopped`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Operator,
    Finished,
    /// The target window lost focus
    TargetLost,
    /// The target window no longer exists
    TargetClosed,
    NoTracksRemaining,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlayerError {
    #[error("target window not found or not in front")]
    NoTargetWindow,

    #[error("target window was lost, playback stopped")]
    TargetLost,

    #[error("cannot {op} while {state}")]
    InvalidTransition {
        op: &'static str,
        state: PlaybackState,
    },

    #[error("no score loaded")]
    NoScore,

    #[error("no track with index {0}")]
    UnknownTrack(u32),

    #[error("no enabled track has notes")]
    NoEnabledTracks,

    #[error("player thread is gone")]
    Disconnected,
}

#[derive(Debug, Clone)]
pub enum PlayerCommand {
    Load(Box<Timeline>),
    Play(TrackSelection),
    Pause,
    Resume,
    Stop,
    NextTrack,
    PreviousTrack,
    Seek(u64),
    SetTrackEnabled { index: u32, enabled: bool },
    SetTransposition(i8),
    Status,
}

#[derive(Debug, Clone)]
pub enum PlayerUpdate {
    ScoreLoaded {
        tracks: Vec<Track>,
        duration_ms: u64,
        transposition: i8,
    },
    StateChanged {
        state: PlaybackState,
        reason: Option<StopReason>,
    },
    TrackChanged {
        selection: TrackSelection,
    },
    Progress {
        position_ms: u64,
        duration_ms: u64,
        selection: TrackSelection,
    },
    TargetLost {
        closed: bool,
    },
    TargetRegained,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    pub notes_played: u64,
    /// Notes with no key after octave folding
    pub skipped_notes: u64,
    pub emit_failures: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerStatus {
    pub state: PlaybackState,
    pub selection: TrackSelection,
    pub position_ms: u64,
    pub duration_ms: u64,
    pub transposition: i8,
    pub held_keys: usize,
    pub stats: PlaybackStats,
}

struct Request {
    command: PlayerCommand,
    reply: Sender<Result<PlayerStatus, PlayerError>>,
}

/// Caller side of the player thread.
///
/// Every operation is a message to the player thread; the call returns once
/// the thread has applied it.
pub struct PlayerHandle {
    command_tx: Option<Sender<Request>>,
    pub updates: Receiver<PlayerUpdate>,
    thread: Option<JoinHandle<()>>,
}

impl PlayerHandle {
    pub fn load(&self, timeline: Timeline) -> Result<PlayerStatus, PlayerError> {
        self.request(PlayerCommand::Load(Box::new(timeline)))
    }

    pub fn play(&self, selection: TrackSelection) -> Result<PlayerStatus, PlayerError> {
        self.request(PlayerCommand::Play(selection))
    }

    pub fn pause(&self) -> Result<PlayerStatus, PlayerError> {
        self.request(PlayerCommand::Pause)
    }

    pub fn resume(&self) -> Result<PlayerStatus, PlayerError> {
        self.request(PlayerCommand::Resume)
    }

    pub fn stop(&self) -> Result<PlayerStatus, PlayerError> {
        self.request(PlayerCommand::Stop)
    }

    pub fn next_track(&self) -> Result<PlayerStatus, PlayerError> {
        self.request(PlayerCommand::NextTrack)
    }

    pub fn previous_track(&self) -> Result<PlayerStatus, PlayerError> {
        self.request(PlayerCommand::PreviousTrack)
    }

    pub fn seek(&self, offset_ms: u64) -> Result<PlayerStatus, PlayerError> {
        self.request(PlayerCommand::Seek(offset_ms))
    }

    pub fn set_track_enabled(&self, index: u32, enabled: bool) -> Result<PlayerStatus, PlayerError> {
        self.request(PlayerCommand::SetTrackEnabled { index, enabled })
    }

    pub fn set_transposition(&self, transposition: i8) -> Result<PlayerStatus, PlayerError> {
        self.request(PlayerCommand::SetTransposition(transposition))
    }

    pub fn status(&self) -> Result<PlayerStatus, PlayerError> {
        self.request(PlayerCommand::Status)
    }

    pub fn request(&self, command: PlayerCommand) -> Result<PlayerStatus, PlayerError> {
        let command_tx = self.command_tx.as_ref().ok_or(PlayerError::Disconnected)?;
        let (reply, reply_rx) = crossbeam::channel::bounded(1);
        command_tx
            .send(Request { command, reply })
            .map_err(|_| PlayerError::Disconnected)?;
        reply_rx.recv().map_err(|_| PlayerError::Disconnected)?
    }

    /// Stops the player thread, releasing any held key.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        self.command_tx.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for PlayerHandle {
    fn drop(&mut self) {
        self.close();
    }
}

pub fn spawn_player(
    settings: &Settings,
    emitter: Box<dyn KeyEmitter>,
    probe: Arc<dyn WindowProbe>,
) -> PlayerHandle {
    let (command_tx, command_rx) = crossbeam::channel::bounded(COMMAND_QUEUE);
    let (update_tx, update_rx) = crossbeam::channel::bounded(UPDATE_QUEUE);

    let focus = FocusMonitor::spawn(probe, settings.target.clone(), settings.focus_poll_interval());
    let player = Player::new(settings, KeyDriver::new(emitter), focus, update_tx);

    let thread = std::thread::Builder::new()
        .name("player".to_string())
        .spawn(move || player.run(command_rx))
        .map_err(|e| warn!("Failed to start player thread: {}", e))
        .ok();

    PlayerHandle {
        command_tx: Some(command_tx),
        updates: update_rx,
        thread,
    }
}

struct Player {
    layout: KeyLayout,
    transposition: i8,
    auto_transpose: bool,
    enabled_tracks: Option<Vec<u32>>,
    pause_on_focus_loss: bool,
    progress_interval: Duration,
    max_wait: Duration,

    timeline: Option<Timeline>,
    state: PlaybackState,
    selection: TrackSelection,
    schedule: Option<Schedule>,
    auto_paused: bool,
    last_progress: Instant,
    stats: PlaybackStats,

    keys: KeyDriver,
    focus: FocusMonitor,
    updates: Sender<PlayerUpdate>,
}

impl Player {
    fn new(
        settings: &Settings,
        keys: KeyDriver,
        focus: FocusMonitor,
        updates: Sender<PlayerUpdate>,
    ) -> Self {
        Self {
            layout: settings.layout,
            transposition: settings.transposition,
            auto_transpose: settings.auto_transpose,
            enabled_tracks: settings.enabled_tracks.clone(),
            pause_on_focus_loss: settings.pause_on_focus_loss,
            progress_interval: settings.progress_interval(),
            max_wait: settings.max_wait(),
            timeline: None,
            state: PlaybackState::Stopped,
            selection: TrackSelection::All,
            schedule: None,
            auto_paused: false,
            last_progress: Instant::now(),
            stats: PlaybackStats::default(),
            keys,
            focus,
            updates,
        }
    }

    fn run(mut self, command_rx: Receiver<Request>) {
        let focus_rx = self.focus.events().clone();
        let never = crossbeam::channel::never();
        let mut focus_alive = true;

        loop {
            let timeout = self.wait_timeout(Instant::now());
            let focus_events = if focus_alive { &focus_rx } else { &never };

            crossbeam::channel::select! {
                recv(command_rx) -> msg => match msg {
                    Ok(Request { command, reply }) => {
                        let result = self.handle(command);
                        let _ = reply.send(result);
                    }
                    Err(_) => break,
                },
                recv(focus_events) -> event => match event {
                    Ok(event) => self.on_focus(event),
                    Err(_) => {
                        warn!("Focus monitor went away, relying on just-in-time checks");
                        focus_alive = false;
                    }
                },
                default(timeout) => {}
            }

            if self.state == PlaybackState::Playing {
                let now = Instant::now();
                self.emit_due(now);
                self.report_progress(now);
            }
        }

        self.keys.release_all();
        debug!("Player thread stopped");
    }

    fn wait_timeout(&self, now: Instant) -> Duration {
        if self.state != PlaybackState::Playing {
            return IDLE_WAIT;
        }
        let ceiling = now + self.max_wait;
        let deadline = match self.schedule.as_ref().and_then(Schedule::next_due) {
            Some(due) => due.min(ceiling),
            None => ceiling,
        };
        deadline.saturating_duration_since(now)
    }

    fn handle(&mut self, command: PlayerCommand) -> Result<PlayerStatus, PlayerError> {
        match command {
            PlayerCommand::Load(timeline) => self.load(*timeline),
            PlayerCommand::Play(selection) => self.play(selection),
            PlayerCommand::Pause => self.pause(),
            PlayerCommand::Resume => self.resume(),
            PlayerCommand::Stop => self.stop(),
            PlayerCommand::NextTrack => self.step_track(true),
            PlayerCommand::PreviousTrack => self.step_track(false),
            PlayerCommand::Seek(offset_ms) => self.seek(offset_ms),
            PlayerCommand::SetTrackEnabled { index, enabled } => {
                self.set_track_enabled(index, enabled)
            }
            PlayerCommand::SetTransposition(transposition) => {
                self.keys.release_all();
                self.transposition = transposition;
                info!("Transposition set to {}", transposition);
                Ok(self.status())
            }
            PlayerCommand::Status => Ok(self.status()),
        }
    }

    fn load(&mut self, mut timeline: Timeline) -> Result<PlayerStatus, PlayerError> {
        if self.state != PlaybackState::Stopped {
            self.halt(StopReason::Operator);
        }

        if let Some(enabled) = &self.enabled_tracks {
            let indices: Vec<u32> = timeline.tracks().iter().map(|t| t.index).collect();
            for index in indices {
                timeline.set_track_enabled(index, enabled.contains(&index));
            }
        }
        if self.auto_transpose {
            self.transposition = keymap::suggest_transposition(&timeline.pitches(), self.layout);
            info!("Suggested transposition {}", self.transposition);
        }

        info!(
            "Loaded score: {} tracks, {} ms",
            timeline.tracks().len(),
            timeline.duration_ms()
        );
        self.notify(PlayerUpdate::ScoreLoaded {
            tracks: timeline.tracks().to_vec(),
            duration_ms: timeline.duration_ms(),
            transposition: self.transposition,
        });

        self.selection = TrackSelection::All;
        self.timeline = Some(timeline);
        Ok(self.status())
    }

    fn play(&mut self, selection: TrackSelection) -> Result<PlayerStatus, PlayerError> {
        let timeline = self.timeline.as_ref().ok_or(PlayerError::NoScore)?;
        if let TrackSelection::Solo(index) = selection {
            timeline.track(index).ok_or(PlayerError::UnknownTrack(index))?;
        }
        if !self.focus.is_target_active() {
            warn!("Target window is not active, not starting");
            return Err(PlayerError::NoTargetWindow);
        }

        let events = timeline.events_for(selection);
        if events.is_empty() {
            return Err(PlayerError::NoEnabledTracks);
        }

        self.keys.release_all();
        let now = Instant::now();
        let mut schedule = Schedule::new(events, now);
        schedule.start(now);
        self.schedule = Some(schedule);
        self.selection = selection;
        self.auto_paused = false;
        self.last_progress = now;

        self.notify(PlayerUpdate::TrackChanged { selection });
        self.set_state(PlaybackState::Playing, None);
        Ok(self.status())
    }

    fn pause(&mut self) -> Result<PlayerStatus, PlayerError> {
        self.require(&[PlaybackState::Playing], "pause")?;
        self.freeze();
        self.auto_paused = false;
        Ok(self.status())
    }

    fn resume(&mut self) -> Result<PlayerStatus, PlayerError> {
        self.require(&[PlaybackState::Paused], "resume")?;

        match self.focus.status() {
            WindowStatus::Active => {}
            status => {
                warn!("Target window is {:?}, cannot resume", status);
                self.halt(lost_reason(status == WindowStatus::Missing));
                return Err(PlayerError::TargetLost);
            }
        }

        self.unfreeze(Instant::now());
        Ok(self.status())
    }

    fn stop(&mut self) -> Result<PlayerStatus, PlayerError> {
        self.require(&[PlaybackState::Playing, PlaybackState::Paused], "stop")?;
        self.halt(StopReason::Operator);
        Ok(self.status())
    }

    fn step_track(&mut self, forward: bool) -> Result<PlayerStatus, PlayerError> {
        let op = if forward { "go to next track" } else { "go to previous track" };
        self.require(&[PlaybackState::Playing, PlaybackState::Paused], op)?;
        let timeline = self.timeline.as_ref().ok_or(PlayerError::NoScore)?;

        let indices = timeline.tracks().iter().map(|t| t.index);
        let target = match (self.selection, forward) {
            (TrackSelection::All, true) => indices.min(),
            (TrackSelection::All, false) => indices.max(),
            (TrackSelection::Solo(current), true) => indices.filter(|&i| i > current).min(),
            (TrackSelection::Solo(current), false) => indices.filter(|&i| i < current).max(),
        };

        let Some(index) = target else {
            info!("No track left in that direction");
            self.halt(StopReason::NoTracksRemaining);
            return Ok(self.status());
        };

        let selection = TrackSelection::Solo(index);
        let events = timeline.events_for(selection);
        self.keys.release_all();

        let now = Instant::now();
        let mut schedule = Schedule::new(events, now);
        if self.state == PlaybackState::Playing {
            schedule.start(now);
        }
        self.schedule = Some(schedule);
        self.selection = selection;
        info!("Switched to track {}", index);
        self.notify(PlayerUpdate::TrackChanged { selection });
        Ok(self.status())
    }

    fn seek(&mut self, offset_ms: u64) -> Result<PlayerStatus, PlayerError> {
        self.require(&[PlaybackState::Playing, PlaybackState::Paused], "seek")?;
        let duration_ms = self.duration_ms();
        let offset_ms = offset_ms.min(duration_ms);

        self.keys.release_all();
        if let Some(schedule) = self.schedule.as_mut() {
            schedule.seek(offset_ms, Instant::now());
        }
        debug!("Seeked to {} ms", offset_ms);
        Ok(self.status())
    }

    fn set_track_enabled(&mut self, index: u32, enabled: bool) -> Result<PlayerStatus, PlayerError> {
        let timeline = self.timeline.as_mut().ok_or(PlayerError::NoScore)?;
        if !timeline.set_track_enabled(index, enabled) {
            return Err(PlayerError::UnknownTrack(index));
        }
        info!("Track {} {}", index, if enabled { "enabled" } else { "disabled" });

        // an all-tracks schedule is rebuilt in place at the current position
        if self.state != PlaybackState::Stopped && self.selection == TrackSelection::All {
            let now = Instant::now();
            let events = timeline.events_for(TrackSelection::All);
            if let Some(schedule) = self.schedule.as_mut() {
                let position = schedule.position_ms(now);
                let running = schedule.is_running();
                let mut rebuilt = Schedule::new(events, now);
                rebuilt.seek(position, now);
                if running {
                    rebuilt.start(now);
                }
                *schedule = rebuilt;
            }
            self.keys.release_all();
        }
        Ok(self.status())
    }

    fn on_focus(&mut self, event: FocusEvent) {
        match event {
            FocusEvent::TargetLost { closed } => {
                self.notify(PlayerUpdate::TargetLost { closed });
                match self.state {
                    PlaybackState::Playing if !closed && self.pause_on_focus_loss => {
                        info!("Target window lost focus, pausing");
                        self.freeze();
                        self.auto_paused = true;
                    }
                    PlaybackState::Playing => {
                        warn!("Target window lost, stopping");
                        self.halt(lost_reason(closed));
                    }
                    PlaybackState::Paused if closed => {
                        warn!("Target window closed while paused, stopping");
                        self.halt(StopReason::TargetClosed);
                    }
                    _ => {}
                }
            }
            FocusEvent::TargetRegained => {
                self.notify(PlayerUpdate::TargetRegained);
                if self.state == PlaybackState::Paused && self.auto_paused {
                    info!("Target window back in front, resuming");
                    self.unfreeze(Instant::now());
                }
            }
        }
    }

    fn emit_due(&mut self, now: Instant) {
        loop {
            let Some(schedule) = self.schedule.as_mut() else {
                return;
            };
            if !schedule.next_due().is_some_and(|due| due <= now) {
                break;
            }

            // checked right before each burst, the monitor's signal may still be in flight
            let status = self.focus.status();
            if status != WindowStatus::Active {
                warn!("Target window is {:?}, holding back", status);
                self.on_focus(FocusEvent::TargetLost {
                    closed: status == WindowStatus::Missing,
                });
                return;
            }

            let batch = schedule.take_due(now).to_vec();
            self.emit_batch(&batch);
        }

        if self.schedule.as_ref().is_some_and(Schedule::is_finished) {
            info!("Reached the end of the score");
            self.halt(StopReason::Finished);
        }
    }

    fn emit_batch(&mut self, batch: &[NoteEvent]) {
        let order = BatchOrder::split(batch);
        for event in order.early {
            if let Some(key) = self.key_for(event) {
                self.keys.release(key);
            }
        }
        for event in order.presses {
            match self.key_for(event) {
                Some(key) => {
                    trace!(
                        "{} ms: track {} pitch {} -> {}",
                        event.time_ms, event.track, event.pitch, key
                    );
                    if self.keys.press(key) {
                        self.stats.notes_played += 1;
                    }
                }
                None => self.stats.skipped_notes += 1,
            }
        }
        for event in order.late {
            if let Some(key) = self.key_for(event) {
                self.keys.release(key);
            }
        }
    }

    fn key_for(&self, event: &NoteEvent) -> Option<keymap::KeyId> {
        self.layout.map_pitch(event.pitch, self.transposition)
    }

    fn report_progress(&mut self, now: Instant) {
        if now.duration_since(self.last_progress) < self.progress_interval {
            return;
        }
        self.last_progress = now;
        let position_ms = self.position_ms(now);
        self.notify(PlayerUpdate::Progress {
            position_ms,
            duration_ms: self.duration_ms(),
            selection: self.selection,
        });
    }

    fn freeze(&mut self) {
        if let Some(schedule) = self.schedule.as_mut() {
            schedule.freeze(Instant::now());
        }
        self.keys.release_all();
        self.set_state(PlaybackState::Paused, None);
    }

    fn unfreeze(&mut self, now: Instant) {
        if let Some(schedule) = self.schedule.as_mut() {
            schedule.start(now);
        }
        self.auto_paused = false;
        self.last_progress = now;
        self.set_state(PlaybackState::Playing, None);
    }

    /// Releases every key and drops the schedule.
    fn halt(&mut self, reason: StopReason) {
        let released = self.keys.release_all();
        if released > 0 {
            debug!("Released {} held keys", released);
        }
        self.schedule = None;
        self.auto_paused = false;
        self.set_state(PlaybackState::Stopped, Some(reason));
    }

    fn require(&self, allowed: &[PlaybackState], op: &'static str) -> Result<(), PlayerError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(PlayerError::InvalidTransition {
                op,
                state: self.state,
            })
        }
    }

    fn set_state(&mut self, state: PlaybackState, reason: Option<StopReason>) {
        match reason {
            Some(reason) => info!("{} -> {} ({:?})", self.state, state, reason),
            None => info!("{} -> {}", self.state, state),
        }
        self.state = state;
        self.notify(PlayerUpdate::StateChanged { state, reason });
    }

    fn notify(&self, update: PlayerUpdate) {
        match self.updates.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(update)) => trace!("Update queue full, dropping {:?}", update),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn duration_ms(&self) -> u64 {
        self.timeline.as_ref().map_or(0, Timeline::duration_ms)
    }

    fn position_ms(&self, now: Instant) -> u64 {
        self.schedule
            .as_ref()
            .map_or(0, |schedule| schedule.position_ms(now))
    }

    fn status(&self) -> PlayerStatus {
        PlayerStatus {
            state: self.state,
            selection: self.selection,
            position_ms: self.position_ms(Instant::now()),
            duration_ms: self.duration_ms(),
            transposition: self.transposition,
            held_keys: self.keys.held_count(),
            stats: PlaybackStats {
                emit_failures: self.keys.failures(),
                ..self.stats
            },
        }
    }
}

/// Emission order for the edges sharing one timestamp.
///
/// A release that follows a press of the same voice within the batch ends a
/// zero-length note and goes after every press. Any other release goes before
/// the presses, so a repeated note lifts its key before striking it again.
#[derive(Debug, Default)]
struct BatchOrder<'a> {
    early: Vec<&'a NoteEvent>,
    presses: Vec<&'a NoteEvent>,
    late: Vec<&'a NoteEvent>,
}

impl<'a> BatchOrder<'a> {
    fn split(batch: &'a [NoteEvent]) -> Self {
        let mut order = Self::default();
        let mut pressed: HashSet<(u32, u8)> = HashSet::new();
        for event in batch {
            let voice = (event.track, event.pitch);
            if event.is_note_on {
                pressed.insert(voice);
                order.presses.push(event);
            } else if pressed.contains(&voice) {
                order.late.push(event);
            } else {
                order.early.push(event);
            }
        }
        order
    }
}

fn lost_reason(closed: bool) -> StopReason {
    if closed {
        StopReason::TargetClosed
    } else {
        StopReason::TargetLost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::RecordingEmitter;
    use crate::events::KeyAction;
    use crate::focus::ManualProbe;
    use std::thread::sleep;

    const WAIT: Duration = Duration::from_secs(2);

    struct Harness {
        player: PlayerHandle,
        emitter: RecordingEmitter,
        probe: ManualProbe,
    }

    fn settings() -> Settings {
        Settings {
            focus_poll_ms: 10,
            max_wait_ms: 5,
            progress_interval_ms: 1000,
            ..Settings::default()
        }
    }

    fn harness(settings: Settings, status: WindowStatus) -> Harness {
        let emitter = RecordingEmitter::new();
        let probe = ManualProbe::new(status);
        let player = spawn_player(&settings, Box::new(emitter.clone()), Arc::new(probe.clone()));
        Harness {
            player,
            emitter,
            probe,
        }
    }

    fn key(pitch: u8) -> keymap::KeyId {
        KeyLayout::Chromatic.map_pitch(pitch, 0).unwrap()
    }

    fn wait_for(player: &PlayerHandle, wanted: impl Fn(&PlayerUpdate) -> bool) -> PlayerUpdate {
        let deadline = Instant::now() + WAIT;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            let update = player
                .updates
                .recv_timeout(left)
                .expect("update did not arrive in time");
            if wanted(&update) {
                return update;
            }
        }
    }

    fn wait_for_stop(player: &PlayerHandle) -> Option<StopReason> {
        match wait_for(player, |u| {
            matches!(
                u,
                PlayerUpdate::StateChanged {
                    state: PlaybackState::Stopped,
                    ..
                }
            )
        }) {
            PlayerUpdate::StateChanged { reason, .. } => reason,
            _ => unreachable!(),
        }
    }

    fn wait_for_state(player: &PlayerHandle, wanted: PlaybackState) {
        wait_for(player, |u| {
            matches!(u, PlayerUpdate::StateChanged { state, .. } if *state == wanted)
        });
    }

    fn two_tracks() -> Timeline {
        Timeline::from_events(vec![
            NoteEvent::on(0, 0, 60, 100),
            NoteEvent::off(500, 0, 60),
            NoteEvent::on(250, 1, 64, 100),
            NoteEvent::off(750, 1, 64),
        ])
        .unwrap()
    }

    fn long_notes(tracks: u32) -> Timeline {
        let mut events = Vec::new();
        for track in 0..tracks {
            events.push(NoteEvent::on(0, track, 60 + track as u8, 100));
            events.push(NoteEvent::off(10_000, track, 60 + track as u8));
        }
        Timeline::from_events(events).unwrap()
    }

    fn assert_near(actual: Duration, expected_ms: u64, tolerance_ms: u64) {
        let actual_ms = actual.as_millis() as u64;
        assert!(
            actual_ms.abs_diff(expected_ms) <= tolerance_ms,
            "expected ~{expected_ms} ms, got {actual_ms} ms"
        );
    }

    #[test]
    fn test_keys_follow_note_times() {
        let h = harness(settings(), WindowStatus::Active);
        h.player.load(two_tracks()).unwrap();
        h.player.play(TrackSelection::All).unwrap();
        assert_eq!(wait_for_stop(&h.player), Some(StopReason::Finished));

        let actions = h.emitter.actions();
        let origin = actions[0].at;
        let at = |action: KeyAction| {
            actions
                .iter()
                .find(|r| r.action == action)
                .map(|r| r.at.duration_since(origin))
                .unwrap()
        };
        assert_eq!(actions[0].action, KeyAction::Press(key(60)));
        assert_near(at(KeyAction::Press(key(64))), 250, 30);
        assert_near(at(KeyAction::Release(key(60))), 500, 30);
        assert_near(at(KeyAction::Release(key(64))), 750, 30);
        assert_eq!(h.emitter.balance(), 0);

        let status = h.player.status().unwrap();
        assert_eq!(status.state, PlaybackState::Stopped);
        assert_eq!(status.stats.notes_played, 2);
    }

    #[test]
    fn test_pause_keeps_position() {
        let h = harness(settings(), WindowStatus::Active);
        h.player.load(long_notes(1)).unwrap();
        h.player.play(TrackSelection::All).unwrap();

        sleep(Duration::from_millis(100));
        let paused = h.player.pause().unwrap();
        assert_eq!(paused.state, PlaybackState::Paused);
        assert_eq!(paused.held_keys, 0);
        assert_eq!(h.emitter.balance(), 0);

        sleep(Duration::from_millis(200));
        let later = h.player.status().unwrap();
        assert_eq!(later.position_ms, paused.position_ms);

        let resumed = h.player.resume().unwrap();
        assert_eq!(resumed.state, PlaybackState::Playing);
        assert!(resumed.position_ms.abs_diff(paused.position_ms) <= 20);
        assert!(paused.position_ms.abs_diff(100) <= 20);

        let stopped = h.player.stop().unwrap();
        assert_eq!(stopped.state, PlaybackState::Stopped);
        assert_eq!(stopped.held_keys, 0);
        assert_eq!(h.emitter.balance(), 0);
    }

    #[test]
    fn test_focus_loss_stops_and_releases() {
        let h = harness(settings(), WindowStatus::Active);
        h.player.load(long_notes(2)).unwrap();
        h.player.play(TrackSelection::All).unwrap();
        sleep(Duration::from_millis(30));
        assert!(h.emitter.balance() > 0);

        h.probe.set(WindowStatus::Background);
        assert_eq!(wait_for_stop(&h.player), Some(StopReason::TargetLost));
        assert_eq!(h.emitter.balance(), 0);
        assert_eq!(h.player.status().unwrap().held_keys, 0);
    }

    #[test]
    fn test_closed_window_is_reported_as_closed() {
        let h = harness(settings(), WindowStatus::Active);
        h.player.load(long_notes(1)).unwrap();
        h.player.play(TrackSelection::All).unwrap();

        h.probe.set(WindowStatus::Missing);
        assert_eq!(wait_for_stop(&h.player), Some(StopReason::TargetClosed));
        assert_eq!(h.emitter.balance(), 0);
    }

    #[test]
    fn test_focus_loss_can_pause_instead() {
        let settings = Settings {
            pause_on_focus_loss: true,
            ..settings()
        };
        let h = harness(settings, WindowStatus::Active);
        h.player.load(long_notes(1)).unwrap();
        h.player.play(TrackSelection::All).unwrap();

        h.probe.set(WindowStatus::Background);
        wait_for_state(&h.player, PlaybackState::Paused);
        assert_eq!(h.emitter.balance(), 0);

        h.probe.set(WindowStatus::Active);
        wait_for_state(&h.player, PlaybackState::Playing);
        h.player.stop().unwrap();
    }

    #[test]
    fn test_invalid_transitions() {
        let h = harness(settings(), WindowStatus::Active);
        assert_eq!(h.player.play(TrackSelection::All), Err(PlayerError::NoScore));

        h.player.load(two_tracks()).unwrap();
        assert_eq!(
            h.player.resume(),
            Err(PlayerError::InvalidTransition {
                op: "resume",
                state: PlaybackState::Stopped,
            })
        );
        assert!(matches!(
            h.player.pause(),
            Err(PlayerError::InvalidTransition { .. })
        ));
        assert_eq!(
            h.player.play(TrackSelection::Solo(7)),
            Err(PlayerError::UnknownTrack(7))
        );
        assert_eq!(h.emitter.actions().len(), 0);
    }

    #[test]
    fn test_play_needs_target_window() {
        let h = harness(settings(), WindowStatus::Background);
        h.player.load(two_tracks()).unwrap();
        assert_eq!(
            h.player.play(TrackSelection::All),
            Err(PlayerError::NoTargetWindow)
        );
        assert_eq!(h.player.status().unwrap().state, PlaybackState::Stopped);
    }

    #[test]
    fn test_resume_after_window_lost() {
        let h = harness(settings(), WindowStatus::Active);
        h.player.load(long_notes(1)).unwrap();
        h.player.play(TrackSelection::All).unwrap();
        h.player.pause().unwrap();

        h.probe.set(WindowStatus::Background);
        wait_for(&h.player, |u| matches!(u, PlayerUpdate::TargetLost { .. }));

        assert_eq!(h.player.resume(), Err(PlayerError::TargetLost));
        assert_eq!(h.player.status().unwrap().state, PlaybackState::Stopped);
    }

    #[test]
    fn test_track_stepping() {
        let h = harness(settings(), WindowStatus::Active);
        h.player.load(long_notes(3)).unwrap();
        h.player.play(TrackSelection::All).unwrap();

        assert_eq!(h.player.next_track().unwrap().selection, TrackSelection::Solo(0));
        assert_eq!(h.player.next_track().unwrap().selection, TrackSelection::Solo(1));
        assert_eq!(h.player.previous_track().unwrap().selection, TrackSelection::Solo(0));
        assert_eq!(h.player.next_track().unwrap().selection, TrackSelection::Solo(1));
        assert_eq!(h.player.next_track().unwrap().selection, TrackSelection::Solo(2));

        let status = h.player.next_track().unwrap();
        assert_eq!(status.state, PlaybackState::Stopped);
        assert_eq!(wait_for_stop(&h.player), Some(StopReason::NoTracksRemaining));
        assert_eq!(h.emitter.balance(), 0);
    }

    #[test]
    fn test_track_stepping_while_paused_stays_paused() {
        let h = harness(settings(), WindowStatus::Active);
        h.player.load(long_notes(2)).unwrap();
        h.player.play(TrackSelection::All).unwrap();
        h.player.pause().unwrap();

        let status = h.player.previous_track().unwrap();
        assert_eq!(status.selection, TrackSelection::Solo(1));
        assert_eq!(status.state, PlaybackState::Paused);
        assert_eq!(status.position_ms, 0);
    }

    #[test]
    fn test_seek_is_clamped_to_duration() {
        let h = harness(settings(), WindowStatus::Active);
        h.player.load(long_notes(1)).unwrap();
        h.player.play(TrackSelection::All).unwrap();
        h.player.pause().unwrap();

        let status = h.player.seek(4_000).unwrap();
        assert_eq!(status.position_ms, 4_000);
        let status = h.player.seek(60_000).unwrap();
        assert_eq!(status.position_ms, status.duration_ms);
    }

    #[test]
    fn test_unplayable_notes_are_counted() {
        let h = harness(settings(), WindowStatus::Active);
        let timeline = Timeline::from_events(vec![
            NoteEvent::on(0, 0, 60, 100),
            NoteEvent::on(0, 0, 0, 100),
            NoteEvent::off(50, 0, 60),
            NoteEvent::off(50, 0, 0),
        ])
        .unwrap();
        h.player.load(timeline).unwrap();
        h.player.play(TrackSelection::All).unwrap();
        assert_eq!(wait_for_stop(&h.player), Some(StopReason::Finished));

        let stats = h.player.status().unwrap().stats;
        assert_eq!(stats.notes_played, 1);
        assert_eq!(stats.skipped_notes, 1);
    }

    #[test]
    fn test_failed_press_is_retried() {
        let h = harness(settings(), WindowStatus::Active);
        h.emitter.fail_next(1);
        h.player.load(two_tracks()).unwrap();
        h.player.play(TrackSelection::All).unwrap();
        assert_eq!(wait_for_stop(&h.player), Some(StopReason::Finished));

        assert_eq!(h.emitter.actions()[0].action, KeyAction::Press(key(60)));
        assert_eq!(h.player.status().unwrap().stats.emit_failures, 0);
        assert_eq!(h.emitter.balance(), 0);
    }

    #[test]
    fn test_disabled_track_is_not_played() {
        let h = harness(settings(), WindowStatus::Active);
        h.player.load(two_tracks()).unwrap();
        h.player.set_track_enabled(1, false).unwrap();
        assert_eq!(
            h.player.set_track_enabled(9, false),
            Err(PlayerError::UnknownTrack(9))
        );
        h.player.play(TrackSelection::All).unwrap();
        assert_eq!(wait_for_stop(&h.player), Some(StopReason::Finished));

        let actions = h.emitter.actions();
        assert!(actions.iter().all(|r| r.action.key() == key(60)));
    }

    #[test]
    fn test_shutdown_releases_held_keys() {
        let h = harness(settings(), WindowStatus::Active);
        h.player.load(long_notes(2)).unwrap();
        h.player.play(TrackSelection::All).unwrap();
        sleep(Duration::from_millis(30));
        h.player.shutdown();
        assert_eq!(h.emitter.balance(), 0);
    }

    fn played(emitter: &RecordingEmitter) -> Vec<KeyAction> {
        emitter.actions().iter().map(|r| r.action).collect()
    }

    #[test]
    fn test_batch_order_depends_on_edge_order() {
        let batch = [
            NoteEvent::off(100, 0, 60),
            NoteEvent::on(100, 0, 60, 100),
            NoteEvent::on(100, 1, 64, 100),
            NoteEvent::off(100, 1, 64),
            NoteEvent::off(100, 2, 67),
        ];
        let order = BatchOrder::split(&batch);
        let voices = |events: &[&NoteEvent]| -> Vec<(u32, u8)> {
            events.iter().map(|e| (e.track, e.pitch)).collect()
        };
        assert_eq!(voices(&order.early), vec![(0, 60), (2, 67)]);
        assert_eq!(voices(&order.presses), vec![(0, 60), (1, 64)]);
        assert_eq!(voices(&order.late), vec![(1, 64)]);
    }

    #[test]
    fn test_repeated_note_is_struck_again() {
        let h = harness(settings(), WindowStatus::Active);
        let timeline = Timeline::from_events(vec![
            NoteEvent::on(0, 0, 60, 100),
            NoteEvent::off(100, 0, 60),
            NoteEvent::on(100, 0, 60, 100),
            NoteEvent::off(200, 0, 60),
        ])
        .unwrap();
        h.player.load(timeline).unwrap();
        h.player.play(TrackSelection::All).unwrap();
        assert_eq!(wait_for_stop(&h.player), Some(StopReason::Finished));

        let a = key(60);
        assert_eq!(
            played(&h.emitter),
            vec![
                KeyAction::Press(a),
                KeyAction::Release(a),
                KeyAction::Press(a),
                KeyAction::Release(a),
            ]
        );
        let actions = h.emitter.actions();
        assert_near(actions[2].at.duration_since(actions[0].at), 100, 30);
        assert_near(actions[3].at.duration_since(actions[0].at), 200, 30);
        assert_eq!(h.player.status().unwrap().stats.notes_played, 2);
    }

    #[test]
    fn test_zero_length_note_is_pressed_then_released() {
        let h = harness(settings(), WindowStatus::Active);
        let timeline = Timeline::from_events(vec![
            NoteEvent::on(0, 0, 60, 100),
            NoteEvent::off(0, 0, 60),
            NoteEvent::on(0, 0, 64, 100),
            NoteEvent::off(100, 0, 64),
        ])
        .unwrap();
        h.player.load(timeline).unwrap();
        h.player.play(TrackSelection::All).unwrap();
        assert_eq!(wait_for_stop(&h.player), Some(StopReason::Finished));

        assert_eq!(
            played(&h.emitter),
            vec![
                KeyAction::Press(key(60)),
                KeyAction::Press(key(64)),
                KeyAction::Release(key(60)),
                KeyAction::Release(key(64)),
            ]
        );
    }

    #[test]
    fn test_handover_between_tracks_on_one_pitch() {
        // the releasing track sorts first in one score and last in the other
        for (first, second) in [(0, 1), (1, 0)] {
            let h = harness(settings(), WindowStatus::Active);
            let timeline = Timeline::from_events(vec![
                NoteEvent::on(0, first, 60, 100),
                NoteEvent::off(100, first, 60),
                NoteEvent::on(100, second, 60, 100),
                NoteEvent::off(200, second, 60),
            ])
            .unwrap();
            h.player.load(timeline).unwrap();
            h.player.play(TrackSelection::All).unwrap();
            assert_eq!(wait_for_stop(&h.player), Some(StopReason::Finished));

            let a = key(60);
            assert_eq!(
                played(&h.emitter),
                vec![
                    KeyAction::Press(a),
                    KeyAction::Release(a),
                    KeyAction::Press(a),
                    KeyAction::Release(a),
                ],
                "tracks {first} then {second}"
            );
        }
    }
}
