//! Pause/resume state shared between a worker's public handle and its loop.
//!
//! The hot path (`is_paused`, read by the processing loop on every trigger and
//! before every attempt) is a single atomic load.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

/// Thread-safe pause flag.
#[derive(Debug, Clone, Default)]
pub struct PauseState {
    paused: Arc<AtomicBool>,
}

impl PauseState {
    pub fn new(paused: bool) -> Self {
        Self {
            paused: Arc::new(AtomicBool::new(paused)),
        }
    }

    /// Check if processing is paused (hot path, lock-free).
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Pause processing. Returns `true` if the state changed.
    pub fn pause(&self) -> bool {
        let changed = !self.paused.swap(true, Ordering::SeqCst);
        if changed {
            info!("Job processing PAUSED");
        }
        changed
    }

    /// Resume processing. Returns `true` if the state changed.
    pub fn resume(&self) -> bool {
        let changed = self.paused.swap(false, Ordering::SeqCst);
        if changed {
            info!("Job processing RESUMED");
        }
        changed
    }

    /// Set the flag to `paused`. Returns `true` if the state changed.
    pub fn set(&self, paused: bool) -> bool {
        if paused {
            self.pause()
        } else {
            self.resume()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_running() {
        assert!(!PauseState::default().is_paused());
        assert!(PauseState::new(true).is_paused());
    }

    #[test]
    fn test_pause_resume_report_transitions() {
        let state = PauseState::new(false);
        assert!(state.pause());
        assert!(!state.pause());
        assert!(state.is_paused());

        assert!(state.resume());
        assert!(!state.resume());
        assert!(!state.is_paused());
    }

    #[test]
    fn test_clones_share_state() {
        let state = PauseState::new(false);
        let handle = state.clone();
        handle.set(true);
        assert!(state.is_paused());
        state.set(false);
        assert!(!handle.is_paused());
    }
}
