//! Heartbeat-driven liveness state machine
//!
//! Pure: every method takes the current instant, so tests drive it without a
//! clock and the connection task feeds it `tokio::time::Instant::now()`.
//!
//! ```text
//!   connecting ──handshake──▶ ready ──timeout──▶ degraded ──grace──▶ disconnected
//!                               ▲                   │
//!                               └────heartbeat──────┘
//! ```
//!
//! Both deadlines run from the last heartbeat (or the handshake).

use std::time::Duration;

use tokio::time::Instant;

use crate::registry::LinkState;

/// A state change the connection task must act on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessEvent {
    /// Heartbeat overdue; the component stays registered
    Degraded {
        /// Time since the last heartbeat
        silent_for: Duration,
    },
    /// A heartbeat arrived while degraded
    Recovered,
    /// Grace period exceeded; the connection must close
    Expired {
        /// Time since the last heartbeat
        silent_for: Duration,
    },
}

/// Liveness of one connection
#[derive(Debug, Clone)]
pub struct LivenessTracker {
    state: LinkState,
    last_seen: Instant,
    heartbeat_timeout: Duration,
    grace_period: Duration,
}

impl LivenessTracker {
    /// New connection, handshake pending
    #[must_use]
    pub fn new(now: Instant, heartbeat_timeout: Duration, grace_period: Duration) -> Self {
        Self {
            state: LinkState::Connecting,
            last_seen: now,
            heartbeat_timeout,
            grace_period,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Valid handshake received
    pub fn handshake_complete(&mut self, now: Instant) {
        if self.state == LinkState::Connecting {
            self.state = LinkState::Ready;
            self.last_seen = now;
        }
    }

    /// Heartbeat received
    pub fn heartbeat(&mut self, now: Instant) -> Option<LivenessEvent> {
        if self.state == LinkState::Disconnected {
            return None;
        }
        self.last_seen = now;
        if self.state == LinkState::Degraded {
            self.state = LinkState::Ready;
            return Some(LivenessEvent::Recovered);
        }
        None
    }

    /// Check the deadlines
    pub fn tick(&mut self, now: Instant) -> Option<LivenessEvent> {
        let silent_for = now.saturating_duration_since(self.last_seen);
        match self.state {
            LinkState::Ready | LinkState::Degraded if silent_for >= self.grace_period => {
                self.state = LinkState::Disconnected;
                Some(LivenessEvent::Expired { silent_for })
            }
            LinkState::Ready if silent_for >= self.heartbeat_timeout => {
                self.state = LinkState::Degraded;
                Some(LivenessEvent::Degraded { silent_for })
            }
            _ => None,
        }
    }

    /// Connection closed
    pub fn close(&mut self) {
        self.state = LinkState::Disconnected;
    }

    /// When `tick` may next produce an event
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            LinkState::Ready => Some(self.last_seen + self.heartbeat_timeout),
            LinkState::Degraded => Some(self.last_seen + self.grace_period),
            LinkState::Connecting | LinkState::Disconnected => None,
        }
    }
}
