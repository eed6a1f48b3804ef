//! Engine task
//!
//! One task owns the [`ShowEngine`]; everything else talks to it through an
//! [`EngineHandle`]. Commands are applied strictly in arrival order, and a
//! command that arrives while a cue is waiting for acks queues behind it.

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::{DispatchReport, EngineError, ShowEngine, ShowSnapshot};
use crate::protocol::OperatorCommand;

/// Depth of the command queue
const COMMAND_QUEUE: usize = 64;

type Reply = Result<Option<DispatchReport>, EngineError>;

struct EngineRequest {
    command: OperatorCommand,
    reply: oneshot::Sender<Reply>,
}

/// Cloneable handle to the engine task
#[derive(Clone, Debug)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    state: watch::Receiver<ShowSnapshot>,
}

impl EngineHandle {
    /// Move `engine` onto its own task
    ///
    /// The task ends when every handle is dropped.
    #[must_use]
    pub fn spawn(mut engine: ShowEngine) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<EngineRequest>(COMMAND_QUEUE);
        let state = engine.subscribe();

        let task = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let result = engine.execute(&request.command).await;
                // The requester may have gone away; the command still counts
                let _ = request.reply.send(result);
            }
            tracing::debug!("Show engine task stopped");
        });

        (Self { tx, state }, task)
    }

    /// Queue a command without waiting for it to be applied
    ///
    /// # Errors
    ///
    /// `EngineError::Unavailable` if the engine task has stopped.
    pub async fn enqueue(
        &self,
        command: OperatorCommand,
    ) -> Result<oneshot::Receiver<Reply>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineRequest { command, reply })
            .await
            .map_err(|_| EngineError::Unavailable)?;
        Ok(rx)
    }

    /// Apply a command and wait for its outcome
    ///
    /// # Errors
    ///
    /// Whatever the command returns, or `Unavailable`.
    pub async fn submit(&self, command: OperatorCommand) -> Reply {
        let rx = self.enqueue(command).await?;
        rx.await.map_err(|_| EngineError::Unavailable)?
    }

    /// Latest published snapshot
    #[must_use]
    pub fn snapshot(&self) -> ShowSnapshot {
        self.state.borrow().clone()
    }

    /// Watch snapshots as commands are applied
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ShowSnapshot> {
        self.state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{AckBoard, EngineConfig, RunState};
    use crate::opus;
    use crate::registry::ComponentRegistry;
    use std::sync::Arc;

    fn handle() -> EngineHandle {
        let opus = opus::parse(
            r"
components: []
scenes:
  - id: only
    cues:
      - { id: a, target: internal, action: { cmd: log, params: { text: one } } }
      - { id: b, target: internal, action: { cmd: log, params: { text: two } } }
",
        )
        .unwrap();
        let engine = ShowEngine::new(
            Some(Arc::new(opus)),
            ComponentRegistry::new(),
            AckBoard::new(),
            EngineConfig::default(),
        );
        EngineHandle::spawn(engine).0
    }

    #[tokio::test]
    async fn test_submit_applies_in_order() {
        let engine = handle();

        engine.submit(OperatorCommand::Start).await.unwrap();
        let report = engine.submit(OperatorCommand::Advance).await.unwrap();
        assert_eq!(report.map(|r| r.cue), Some("only/a".to_string()));

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.state, RunState::Running);
        assert_eq!(snapshot.cue.as_deref(), Some("only/b"));
    }

    #[tokio::test]
    async fn test_errors_are_returned_to_the_caller() {
        let engine = handle();
        let err = engine.submit(OperatorCommand::Advance).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_queued_commands_run_back_to_back() {
        let engine = handle();
        let mut state = engine.subscribe();

        let first = engine.enqueue(OperatorCommand::Start).await.unwrap();
        let second = engine.enqueue(OperatorCommand::Advance).await.unwrap();
        let third = engine.enqueue(OperatorCommand::Advance).await.unwrap();

        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_ok());
        assert!(third.await.unwrap().is_ok());

        state.mark_changed();
        state.changed().await.unwrap();
        assert_eq!(state.borrow().state, RunState::Finished);
        assert_eq!(state.borrow().history.len(), 2);
    }

    #[tokio::test]
    async fn test_stopped_engine_is_unavailable() {
        let opus = None;
        let engine = ShowEngine::new(
            opus,
            ComponentRegistry::new(),
            AckBoard::new(),
            EngineConfig::default(),
        );
        let (handle, task) = EngineHandle::spawn(engine);
        task.abort();
        let _ = task.await;

        assert_eq!(
            handle.submit(OperatorCommand::Start).await,
            Err(EngineError::Unavailable)
        );
    }
}
