//! Key injection.
//!
//! [`KeyEmitter`] is the platform seam. [`KeyDriver`] wraps one and tracks
//! which keys are down, so every press can be paired with a release.

use crate::events::KeyAction;
use crate::keymap::KeyId;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use thiserror::Error;
use tracing::{info, trace, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmitError {
    #[error("input injection failed for {key}: {reason}")]
    Injection { key: KeyId, reason: String },

    #[error("input backend unavailable: {0}")]
    Unavailable(String),
}

pub trait KeyEmitter: Send {
    fn press(&mut self, key: KeyId) -> Result<(), EmitError>;
    fn release(&mut self, key: KeyId) -> Result<(), EmitError>;
}

/// Emitter for dry runs: logs each action instead of injecting it.
#[derive(Debug, Default)]
pub struct LogEmitter;

impl KeyEmitter for LogEmitter {
    fn press(&mut self, key: KeyId) -> Result<(), EmitError> {
        info!("press {}", key);
        Ok(())
    }

    fn release(&mut self, key: KeyId) -> Result<(), EmitError> {
        info!("release {}", key);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedAction {
    pub action: KeyAction,
    pub at: Instant,
}

/// Emitter that keeps every successful action. Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct RecordingEmitter {
    log: Arc<Mutex<Vec<RecordedAction>>>,
    failures_left: Arc<AtomicUsize>,
}

impl RecordingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` calls fail.
    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn actions(&self) -> Vec<RecordedAction> {
        self.log.lock().clone()
    }

    /// Presses minus releases.
    pub fn balance(&self) -> i64 {
        self.log
            .lock()
            .iter()
            .map(|r| match r.action {
                KeyAction::Press(_) => 1,
                KeyAction::Release(_) => -1,
            })
            .sum()
    }

    fn record(&self, action: KeyAction) -> Result<(), EmitError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(EmitError::Injection {
                key: action.key(),
                reason: "simulated failure".to_string(),
            });
        }
        self.log.lock().push(RecordedAction {
            action,
            at: Instant::now(),
        });
        Ok(())
    }
}

impl KeyEmitter for RecordingEmitter {
    fn press(&mut self, key: KeyId) -> Result<(), EmitError> {
        self.record(KeyAction::Press(key))
    }

    fn release(&mut self, key: KeyId) -> Result<(), EmitError> {
        self.record(KeyAction::Release(key))
    }
}

/// Owns the emitter on the scheduler thread and remembers held keys.
pub struct KeyDriver {
    emitter: Box<dyn KeyEmitter>,
    held: HashSet<KeyId>,
    failures: u64,
}

impl KeyDriver {
    pub fn new(emitter: Box<dyn KeyEmitter>) -> Self {
        Self {
            emitter,
            held: HashSet::new(),
            failures: 0,
        }
    }

    /// Presses `key` unless it is already down. Returns whether the key is
    /// down afterwards.
    pub fn press(&mut self, key: KeyId) -> bool {
        if self.held.contains(&key) {
            return true;
        }
        if self.perform(KeyAction::Press(key)) {
            self.held.insert(key);
            true
        } else {
            false
        }
    }

    pub fn release(&mut self, key: KeyId) {
        if !self.held.contains(&key) {
            return;
        }
        // a key that could not be released stays held and is retried on the next release_all
        if self.perform(KeyAction::Release(key)) {
            self.held.remove(&key);
        }
    }

    /// Releases every held key. Returns how many were released.
    pub fn release_all(&mut self) -> usize {
        let mut keys: Vec<KeyId> = self.held.iter().copied().collect();
        keys.sort_by_key(|k| (k.key, k.modifier.is_some()));
        let mut released = 0;
        for key in keys {
            self.release(key);
            if !self.held.contains(&key) {
                released += 1;
            }
        }
        if !self.held.is_empty() {
            warn!("{} keys could not be released", self.held.len());
        }
        released
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    fn perform(&mut self, action: KeyAction) -> bool {
        for attempt in 0..2 {
            let result = match action {
                KeyAction::Press(key) => self.emitter.press(key),
                KeyAction::Release(key) => self.emitter.release(key),
            };
            match result {
                Ok(()) => {
                    trace!("{:?}", action);
                    return true;
                }
                Err(e) if attempt == 0 => warn!("{}, retrying", e),
                Err(e) => warn!("{}, giving up", e),
            }
        }
        self.failures += 1;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keymap::map_pitch;

    fn driver() -> (KeyDriver, RecordingEmitter) {
        let emitter = RecordingEmitter::new();
        (KeyDriver::new(Box::new(emitter.clone())), emitter)
    }

    #[test]
    fn test_press_is_not_repeated_while_held() {
        let (mut driver, emitter) = driver();
        let key = map_pitch(60, 0).unwrap();
        assert!(driver.press(key));
        assert!(driver.press(key));
        assert_eq!(emitter.actions().len(), 1);
        driver.release(key);
        driver.release(key);
        assert_eq!(emitter.actions().len(), 2);
        assert_eq!(emitter.balance(), 0);
    }

    #[test]
    fn test_single_failure_is_retried() {
        let (mut driver, emitter) = driver();
        emitter.fail_next(1);
        assert!(driver.press(map_pitch(62, 0).unwrap()));
        assert_eq!(driver.failures(), 0);
        assert_eq!(emitter.balance(), 1);
    }

    #[test]
    fn test_double_failure_skips_event() {
        let (mut driver, emitter) = driver();
        emitter.fail_next(2);
        assert!(!driver.press(map_pitch(62, 0).unwrap()));
        assert_eq!(driver.failures(), 1);
        assert_eq!(driver.held_count(), 0);
        assert!(emitter.actions().is_empty());
    }

    #[test]
    fn test_release_all_balances_presses() {
        let (mut driver, emitter) = driver();
        for pitch in [60, 64, 67, 61] {
            driver.press(map_pitch(pitch, 0).unwrap());
        }
        assert_eq!(driver.release_all(), 4);
        assert_eq!(driver.held_count(), 0);
        assert_eq!(emitter.balance(), 0);
    }
}
