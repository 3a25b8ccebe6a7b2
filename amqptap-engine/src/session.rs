//! Lifecycle state of a tap session.
//!
//! ```text
//! Idle ──▶ Connecting ──▶ Consuming
//!              ▲               │
//!              │               ▼
//!              └────────── Reconnecting
//!
//! any state ──▶ Closed (terminal)
//! ```

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Where a tap session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum SessionState {
    /// Created, not started yet.
    #[default]
    Idle,
    /// Dialing and setting up the tap queue.
    Connecting,
    /// Receiving deliveries.
    Consuming,
    /// Waiting out the backoff before the next attempt.
    Reconnecting,
    /// Finished. Nothing leaves this state.
    Closed,
}

impl SessionState {
    /// Whether moving from `self` to `next` is a legal step.
    pub fn can_transition(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Consuming)
                | (Connecting, Reconnecting)
                | (Consuming, Reconnecting)
                | (Reconnecting, Connecting)
                | (Idle | Connecting | Consuming | Reconnecting, Closed)
        )
    }

    /// Whether the session is finished.
    pub fn is_closed(self) -> bool {
        self == SessionState::Closed
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Consuming => "consuming",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Runtime bookkeeping of one tap source.
#[derive(Debug, Clone, Default)]
pub struct TapSession {
    state: SessionState,
    retry_count: u32,
}

impl TapSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Consecutive failed attempts since the last successful consume.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Move to `next` if the step is legal.
    ///
    /// Returns `false` and leaves the state untouched otherwise. Once
    /// `Closed`, every transition is refused.
    pub fn transition(&mut self, next: SessionState) -> bool {
        if !self.state.can_transition(next) {
            return false;
        }
        if next == SessionState::Consuming {
            self.retry_count = 0;
        }
        self.state = next;
        true
    }

    /// Count one more failed attempt and return the new count.
    pub fn record_failure(&mut self) -> u32 {
        self.retry_count = self.retry_count.saturating_add(1);
        self.retry_count
    }

    /// Move to `Closed` unconditionally.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }
}
