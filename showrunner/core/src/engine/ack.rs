//! Acknowledgement tracking
//!
//! Connection tasks post `CueAck`s here; the engine waits on them. The board
//! is the only thing the two sides share, so an ack can never move the cursor
//! by itself.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::protocol::{AckStatus, ComponentIdentity, DispatchId};

/// Why a component did not acknowledge a cue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AckFailureReason {
    /// No ack before the cue's timeout
    Timeout,
    /// The component reported failure
    Rejected {
        /// Detail from the component
        message: Option<String>,
    },
    /// The connection closed while the ack was pending
    Disconnected,
    /// The cue could not be queued to the component
    Undeliverable,
}

impl fmt::Display for AckFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("timed out"),
            Self::Rejected { message: Some(m) } => write!(f, "rejected: {m}"),
            Self::Rejected { message: None } => f.write_str("rejected"),
            Self::Disconnected => f.write_str("disconnected"),
            Self::Undeliverable => f.write_str("undeliverable"),
        }
    }
}

/// One component that failed to acknowledge a cue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckFailure {
    /// Who
    pub component: ComponentIdentity,
    /// Why
    #[serde(flatten)]
    pub reason: AckFailureReason,
}

impl fmt::Display for AckFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.component, self.reason)
    }
}

/// Result of waiting on a dispatch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckOutcome {
    /// Components that acknowledged successfully
    pub acked: Vec<ComponentIdentity>,
    /// Components that did not
    pub failures: Vec<AckFailure>,
}

#[derive(Debug)]
struct PendingAcks {
    waiting: HashSet<ComponentIdentity>,
    acked: Vec<ComponentIdentity>,
    failures: Vec<AckFailure>,
    notify: Arc<Notify>,
}

impl PendingAcks {
    fn resolve(&mut self, component: &ComponentIdentity, failure: Option<AckFailureReason>) -> bool {
        if !self.waiting.remove(component) {
            return false;
        }
        match failure {
            None => self.acked.push(component.clone()),
            Some(reason) => self.failures.push(AckFailure {
                component: component.clone(),
                reason,
            }),
        }
        self.notify.notify_one();
        true
    }
}

/// Pending acknowledgements, keyed by dispatch
#[derive(Debug, Clone, Default)]
pub struct AckBoard {
    inner: Arc<DashMap<DispatchId, PendingAcks>>,
}

impl AckBoard {
    /// Create an empty board
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a dispatch sent to `targets`
    pub fn open(
        &self,
        dispatch_id: DispatchId,
        targets: impl IntoIterator<Item = ComponentIdentity>,
    ) -> AckWaiter {
        let notify = Arc::new(Notify::new());
        self.inner.insert(
            dispatch_id,
            PendingAcks {
                waiting: targets.into_iter().collect(),
                acked: Vec::new(),
                failures: Vec::new(),
                notify: Arc::clone(&notify),
            },
        );
        AckWaiter {
            board: self.clone(),
            dispatch_id,
            notify,
        }
    }

    /// Record a `CueAck` from a component
    ///
    /// Returns false for unknown dispatches and components that were not
    /// targeted (or already answered).
    pub fn acknowledge(
        &self,
        dispatch_id: DispatchId,
        component: &ComponentIdentity,
        status: AckStatus,
        message: Option<String>,
    ) -> bool {
        let Some(mut pending) = self.inner.get_mut(&dispatch_id) else {
            tracing::debug!(%dispatch_id, component = %component, "Ack for unknown dispatch");
            return false;
        };
        let failure = match status {
            AckStatus::Ok => None,
            AckStatus::Failed => Some(AckFailureReason::Rejected { message }),
        };
        pending.resolve(component, failure)
    }

    /// Record a failure Core observed itself (e.g. the cue could not be queued)
    pub fn fail(
        &self,
        dispatch_id: DispatchId,
        component: &ComponentIdentity,
        reason: AckFailureReason,
    ) -> bool {
        self.inner
            .get_mut(&dispatch_id)
            .is_some_and(|mut pending| pending.resolve(component, Some(reason)))
    }

    /// Fail every pending ack of a component whose connection went away
    ///
    /// Returns the number of dispatches affected.
    pub fn abandon(&self, component: &ComponentIdentity) -> usize {
        let mut affected = 0;
        for mut entry in self.inner.iter_mut() {
            if entry.resolve(component, Some(AckFailureReason::Disconnected)) {
                affected += 1;
            }
        }
        affected
    }

    /// Number of dispatches still being tracked
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.len()
    }
}

/// Waits for the acknowledgements of one dispatch
///
/// Dropping the waiter stops tracking the dispatch.
#[derive(Debug)]
pub struct AckWaiter {
    board: AckBoard,
    dispatch_id: DispatchId,
    notify: Arc<Notify>,
}

impl AckWaiter {
    /// Dispatch being tracked
    #[must_use]
    pub fn dispatch_id(&self) -> DispatchId {
        self.dispatch_id
    }

    /// Wait until every target answered or `timeout` elapsed
    ///
    /// Targets still silent at the deadline are reported as timed out.
    pub async fn wait(self, timeout: Duration) -> AckOutcome {
        self.wait_until(tokio::time::Instant::now() + timeout).await
    }

    /// Like [`wait`](Self::wait) against a deadline shared by several dispatches
    pub async fn wait_until(self, deadline: tokio::time::Instant) -> AckOutcome {
        loop {
            let settled = self
                .board
                .inner
                .get(&self.dispatch_id)
                .map_or(true, |p| p.waiting.is_empty());
            if settled {
                break;
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                break;
            }
        }
        self.finish()
    }

    fn finish(&self) -> AckOutcome {
        let Some((_, pending)) = self.board.inner.remove(&self.dispatch_id) else {
            return AckOutcome::default();
        };
        let mut failures = pending.failures;
        let mut silent: Vec<ComponentIdentity> = pending.waiting.into_iter().collect();
        silent.sort();
        failures.extend(silent.into_iter().map(|component| AckFailure {
            component,
            reason: AckFailureReason::Timeout,
        }));
        AckOutcome {
            acked: pending.acked,
            failures,
        }
    }
}

impl Drop for AckWaiter {
    fn drop(&mut self) {
        self.board.inner.remove(&self.dispatch_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> ComponentIdentity {
        ComponentIdentity::new("audio", name)
    }

    #[tokio::test]
    async fn test_all_acked_returns_early() {
        let board = AckBoard::new();
        let dispatch = DispatchId::next();
        let waiter = board.open(dispatch, [id("a"), id("b")]);

        assert!(board.acknowledge(dispatch, &id("a"), AckStatus::Ok, None));
        assert!(board.acknowledge(dispatch, &id("b"), AckStatus::Ok, None));

        let outcome = waiter.wait(Duration::from_secs(60)).await;
        assert_eq!(outcome.acked.len(), 2);
        assert!(outcome.failures.is_empty());
        assert_eq!(board.pending(), 0);
    }

    #[tokio::test]
    async fn test_wait_pending_until_last_ack() {
        use tokio_test::{assert_pending, assert_ready, task};

        let board = AckBoard::new();
        let dispatch = DispatchId::next();
        let mut wait =
            task::spawn(board.open(dispatch, [id("a"), id("b")]).wait(Duration::from_secs(60)));

        assert_pending!(wait.poll());
        board.acknowledge(dispatch, &id("a"), AckStatus::Ok, None);
        assert!(wait.is_woken());
        assert_pending!(wait.poll());

        board.acknowledge(dispatch, &id("b"), AckStatus::Ok, None);
        assert!(wait.is_woken());
        let outcome = assert_ready!(wait.poll());
        assert_eq!(outcome.acked, vec![id("a"), id("b")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_component_times_out() {
        let board = AckBoard::new();
        let dispatch = DispatchId::next();
        let waiter = board.open(dispatch, [id("a"), id("b")]);

        let acker = board.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            acker.acknowledge(dispatch, &id("a"), AckStatus::Ok, None);
        });

        let outcome = waiter.wait(Duration::from_millis(200)).await;
        assert_eq!(outcome.acked, vec![id("a")]);
        assert_eq!(
            outcome.failures,
            vec![AckFailure {
                component: id("b"),
                reason: AckFailureReason::Timeout,
            }]
        );
    }

    #[tokio::test]
    async fn test_negative_ack_and_disconnect_are_failures() {
        let board = AckBoard::new();
        let dispatch = DispatchId::next();
        let waiter = board.open(dispatch, [id("a"), id("b")]);

        board.acknowledge(
            dispatch,
            &id("a"),
            AckStatus::Failed,
            Some("no such file".to_string()),
        );
        assert_eq!(board.abandon(&id("b")), 1);

        let outcome = waiter.wait(Duration::from_secs(60)).await;
        assert!(outcome.acked.is_empty());
        assert_eq!(outcome.failures.len(), 2);
        assert_eq!(outcome.failures[1].reason, AckFailureReason::Disconnected);
    }

    #[test]
    fn test_unknown_and_duplicate_acks_ignored() {
        let board = AckBoard::new();
        let dispatch = DispatchId::next();
        let _waiter = board.open(dispatch, [id("a")]);

        assert!(!board.acknowledge(DispatchId::next(), &id("a"), AckStatus::Ok, None));
        assert!(!board.acknowledge(dispatch, &id("stranger"), AckStatus::Ok, None));
        assert!(board.acknowledge(dispatch, &id("a"), AckStatus::Ok, None));
        assert!(!board.acknowledge(dispatch, &id("a"), AckStatus::Ok, None));
    }

    #[test]
    fn test_dropping_waiter_stops_tracking() {
        let board = AckBoard::new();
        let waiter = board.open(DispatchId::next(), [id("a")]);
        assert_eq!(board.pending(), 1);
        drop(waiter);
        assert_eq!(board.pending(), 0);
    }
}
