//! Liveness state machine for the shared source.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use nerdcam_common::{Error, LivenessState, Result};
use serde::Serialize;

/// Transitions kept for `/api/status`.
const HISTORY_LEN: usize = 64;

/// One recorded state change.
#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub from: LivenessState,
    pub to: LivenessState,
    #[serde(skip)]
    pub at: Instant,
    pub at_wall: DateTime<Utc>,
}

/// Current state plus a bounded, timestamped transition log.
#[derive(Debug)]
pub struct LivenessTracker {
    state: LivenessState,
    history: VecDeque<StateTransition>,
}

impl LivenessTracker {
    pub fn new() -> Self {
        Self {
            state: LivenessState::Starting,
            history: VecDeque::with_capacity(HISTORY_LEN),
        }
    }

    pub fn state(&self) -> LivenessState {
        self.state
    }

    /// Move to `to`. Returns `Ok(None)` when already there and an error for
    /// an edge the state machine does not allow.
    pub fn transition(&mut self, to: LivenessState) -> Result<Option<StateTransition>> {
        if self.state == to {
            return Ok(None);
        }
        if !self.state.can_transition_to(to) {
            return Err(Error::internal(format!(
                "illegal liveness transition {} -> {}",
                self.state, to
            )));
        }

        let transition = StateTransition {
            from: self.state,
            to,
            at: Instant::now(),
            at_wall: Utc::now(),
        };
        self.state = to;

        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(transition.clone());

        Ok(Some(transition))
    }

    /// Oldest first.
    pub fn history(&self) -> Vec<StateTransition> {
        self.history.iter().cloned().collect()
    }
}

impl Default for LivenessTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a session whose last frame arrived at `last_frame` is stale.
pub fn is_stale(last_frame: Instant, now: Instant, threshold: Duration) -> bool {
    now.saturating_duration_since(last_frame) >= threshold
}

/// Exponential backoff between attempts once the source has FAILED.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay before the next attempt; doubles each call up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
