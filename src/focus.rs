//! Target window watchdog.
//!
//! A [`FocusMonitor`] samples a [`WindowProbe`] on its own thread, keeps the
//! latest [`WindowStatus`] readable without locking and signals transitions as
//! [`FocusEvent`]s. It never touches playback state.

use arc_swap::ArcSwap;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, trace};

pub const DEFAULT_TARGET_TITLE: &str = "燕云十六声";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowStatus {
    /// The target window is in the foreground
    Active,
    /// The target window exists but another window has focus
    Background,
    /// No window matches
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusEvent {
    TargetLost { closed: bool },
    TargetRegained,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TitleMatch {
    Exact(String),
    Contains(String),
}

impl Default for TitleMatch {
    fn default() -> Self {
        TitleMatch::Exact(DEFAULT_TARGET_TITLE.to_string())
    }
}

impl TitleMatch {
    pub fn matches(&self, title: &str) -> bool {
        match self {
            TitleMatch::Exact(expected) => title == expected,
            TitleMatch::Contains(fragment) => title.contains(fragment.as_str()),
        }
    }

    fn pattern(&self) -> &str {
        match self {
            TitleMatch::Exact(s) | TitleMatch::Contains(s) => s,
        }
    }
}

pub trait WindowProbe: Send + Sync {
    fn probe(&self, target: &TitleMatch) -> WindowStatus;
}

/// A probe whose answer is set by hand. Clones share the same status.
#[derive(Debug, Clone)]
pub struct ManualProbe {
    status: Arc<AtomicU8>,
}

impl ManualProbe {
    pub fn new(status: WindowStatus) -> Self {
        Self {
            status: Arc::new(AtomicU8::new(encode(status))),
        }
    }

    pub fn set(&self, status: WindowStatus) {
        self.status.store(encode(status), Ordering::SeqCst);
    }

    pub fn status(&self) -> WindowStatus {
        decode(self.status.load(Ordering::SeqCst))
    }
}

impl WindowProbe for ManualProbe {
    fn probe(&self, _target: &TitleMatch) -> WindowStatus {
        self.status()
    }
}

fn encode(status: WindowStatus) -> u8 {
    match status {
        WindowStatus::Active => 0,
        WindowStatus::Background => 1,
        WindowStatus::Missing => 2,
    }
}

fn decode(raw: u8) -> WindowStatus {
    match raw {
        0 => WindowStatus::Active,
        1 => WindowStatus::Background,
        _ => WindowStatus::Missing,
    }
}

/// Asks an `xdotool` compatible program about the desktop's windows.
#[derive(Debug, Clone)]
pub struct CommandProbe {
    program: String,
}

impl Default for CommandProbe {
    fn default() -> Self {
        Self::new("xdotool")
    }
}

impl CommandProbe {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(&self, args: &[&str]) -> Option<String> {
        let output = Command::new(&self.program).args(args).output().ok()?;
        // xdotool exits non-zero when a search finds nothing
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl WindowProbe for CommandProbe {
    fn probe(&self, target: &TitleMatch) -> WindowStatus {
        if let Some(title) = self.run(&["getactivewindow", "getwindowname"]) {
            if target.matches(title.trim_end_matches('\n')) {
                return WindowStatus::Active;
            }
        }

        let pattern = escape_pattern(target.pattern());
        let Some(ids) = self.run(&["search", "--name", &pattern]) else {
            return WindowStatus::Missing;
        };
        let exists = ids.lines().any(|id| {
            self.run(&["getwindowname", id.trim()])
                .is_some_and(|name| target.matches(name.trim_end_matches('\n')))
        });

        if exists {
            WindowStatus::Background
        } else {
            WindowStatus::Missing
        }
    }
}

fn escape_pattern(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if ".^$*+?()[]{}|\\".contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

pub struct FocusMonitor {
    verdict: Arc<ArcSwap<WindowStatus>>,
    events_rx: Receiver<FocusEvent>,
    shutdown_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl FocusMonitor {
    /// Takes a first sample on the calling thread, then keeps sampling every
    /// `interval` on a background thread until dropped.
    pub fn spawn(probe: Arc<dyn WindowProbe>, target: TitleMatch, interval: Duration) -> Self {
        let initial = probe.probe(&target);
        debug!("Focus monitor started, target {:?} is {:?}", target, initial);

        let verdict = Arc::new(ArcSwap::from_pointee(initial));
        let (events_tx, events_rx) = channel::bounded(16);
        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(1);

        let verdict_sampler = verdict.clone();
        let thread = std::thread::Builder::new()
            .name("focus-monitor".to_string())
            .spawn(move || {
                sampling_loop(
                    probe.as_ref(),
                    &target,
                    interval,
                    &verdict_sampler,
                    &events_tx,
                    &shutdown_rx,
                );
            })
            .ok();

        Self {
            verdict,
            events_rx,
            shutdown_tx: Some(shutdown_tx),
            thread,
        }
    }

    pub fn is_target_active(&self) -> bool {
        self.status() == WindowStatus::Active
    }

    pub fn status(&self) -> WindowStatus {
        **self.verdict.load()
    }

    pub fn events(&self) -> &Receiver<FocusEvent> {
        &self.events_rx
    }
}

impl Drop for FocusMonitor {
    fn drop(&mut self) {
        self.shutdown_tx.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn sampling_loop(
    probe: &dyn WindowProbe,
    target: &TitleMatch,
    interval: Duration,
    verdict: &ArcSwap<WindowStatus>,
    events_tx: &Sender<FocusEvent>,
    shutdown_rx: &Receiver<()>,
) {
    loop {
        match shutdown_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => break,
        }

        let status = probe.probe(target);
        let previous = *verdict.swap(Arc::new(status));
        let Some(event) = transition(previous, status) else {
            continue;
        };

        info!("Target window {:?} -> {:?}", previous, status);
        match events_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => trace!("Dropping {:?}, queue full", event),
            Err(TrySendError::Disconnected(_)) => break,
        }
    }
    debug!("Focus monitor stopped");
}

fn transition(previous: WindowStatus, current: WindowStatus) -> Option<FocusEvent> {
    use WindowStatus::*;
    match (previous, current) {
        (a, b) if a == b => None,
        (_, Active) => Some(FocusEvent::TargetRegained),
        (Active, status) => Some(FocusEvent::TargetLost {
            closed: status == Missing,
        }),
        (Background, Missing) => Some(FocusEvent::TargetLost { closed: true }),
        // a closed window reappearing in the background changes nothing
        _ => None,
    }
}
