//! Show Execution Engine
//!
//! The cue sequencer. Owns the show cursor, applies operator commands one at
//! a time and dispatches cues to every eligible component of the current
//! cue's target type.
//!
//! # State Machine
//!
//! ```text
//!            start                 advance (past last cue)
//!   ┌──────┐ ─────▶ ┌─────────┐ ──────────────────────▶ ┌──────────┐
//!   │ idle │        │ running │                         │ finished │
//!   └──────┘ ◀───── └─────────┘                         └──────────┘
//!       ▲    reset    │     ▲                                 │
//!       │       pause │     │ resume                          │
//!       │             ▼     │                                 │
//!       │           ┌────────┐                                │
//!       └────────── │ paused │ ◀──────────────────────────────┘
//!         reset     └────────┘           (reset from anywhere)
//! ```
//!
//! `back` and `jump` move the cursor in `running` and `paused` without
//! executing anything.
//!
//! # Ownership
//!
//! The engine reads the registry to resolve recipients and never writes to
//! it. Acknowledgements arrive through the [`AckBoard`]; connection tasks
//! never touch the cursor.

mod ack;
mod service;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::opus::{ComponentType, CuePayload, CuePosition, InternalAction, Opus};
use crate::protocol::{ComponentIdentity, CoreMessage, DispatchId, OperatorCommand};
use crate::registry::ComponentRegistry;

pub use ack::{AckBoard, AckFailure, AckFailureReason, AckOutcome, AckWaiter};
pub use service::EngineHandle;

/// Run state of the show
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Not started (or reset)
    Idle,
    /// Accepting `advance`
    Running,
    /// Held by the operator
    Paused,
    /// Past the last cue
    Finished,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// Current execution position plus run state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShowCursor {
    position: Option<CuePosition>,
    state: RunState,
}

impl ShowCursor {
    /// Idle, no position
    #[must_use]
    pub fn idle() -> Self {
        Self {
            position: None,
            state: RunState::Idle,
        }
    }

    /// Cue that the next `advance` executes
    #[must_use]
    pub fn position(&self) -> Option<CuePosition> {
        self.position
    }

    /// Run state
    #[must_use]
    pub fn state(&self) -> RunState {
        self.state
    }
}

impl Default for ShowCursor {
    fn default() -> Self {
        Self::idle()
    }
}

/// What to do when a waited-on cue is not acknowledged by everyone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckFailurePolicy {
    /// Keep the cursor on the cue and report `CueAckTimeout`
    Block,
    /// Move on and list the failures in the dispatch report
    #[default]
    Continue,
}

impl FromStr for AckFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "continue" => Ok(Self::Continue),
            other => Err(format!("expected `block` or `continue`, got `{other}`")),
        }
    }
}

impl fmt::Display for AckFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Block => f.write_str("block"),
            Self::Continue => f.write_str("continue"),
        }
    }
}

/// Engine settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Ack timeout for cues that do not set their own
    pub ack_timeout: Duration,
    /// Reaction to missing acknowledgements
    pub ack_policy: AckFailurePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(2000),
            ack_policy: AckFailurePolicy::Continue,
        }
    }
}

/// What happened when a cue was executed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    /// One dispatch id per command step, in step order (empty for internal cues)
    pub dispatch_ids: Vec<DispatchId>,
    /// Cue that was executed
    pub position: CuePosition,
    /// `scene/cue` label
    pub cue: String,
    /// Component types the cue's steps address
    pub targets: Vec<ComponentType>,
    /// Components the cue was queued to
    pub delivered: Vec<ComponentIdentity>,
    /// Components that acknowledged (only when the cue waits)
    pub acked: Vec<ComponentIdentity>,
    /// Components that failed to receive or acknowledge the cue
    pub failures: Vec<AckFailure>,
    /// Whether the engine waited for acknowledgements
    pub waited: bool,
    /// When the cue was dispatched
    pub dispatched_at: DateTime<Utc>,
}

impl DispatchReport {
    /// Whether every targeted component received (and, if waited, acked) the cue
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Published engine state for operator consoles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShowSnapshot {
    /// Run state
    pub state: RunState,
    /// Next cue to execute
    pub position: Option<CuePosition>,
    /// `scene/cue` label of `position`
    pub cue: Option<String>,
    /// Description of the cue at `position`
    pub description: Option<String>,
    /// Cues the cursor moved past since `start`, in order
    pub history: Vec<CuePosition>,
    /// Whether an opus is loaded
    pub opus_loaded: bool,
    /// Total cues in the opus
    pub total_cues: usize,
    /// Components currently eligible for cues
    pub eligible_components: usize,
    /// Report of the most recent cue
    pub last_dispatch: Option<DispatchReport>,
    /// When this snapshot was taken
    pub updated_at: DateTime<Utc>,
}

/// Errors from engine commands
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Command not allowed in the current state
    #[error("cannot {command} while {state}: {reason}")]
    InvalidTransition {
        /// Command name
        command: String,
        /// State the engine was in
        state: RunState,
        /// Why
        reason: String,
    },

    /// No opus is loaded (degraded startup)
    #[error("no opus loaded")]
    NoOpus,

    /// `jump` named a scene that does not exist
    #[error("unknown scene `{scene}`")]
    UnknownScene {
        /// Scene id
        scene: String,
    },

    /// `jump` named a cue that does not exist in the scene
    #[error("unknown cue `{cue}` in scene `{scene}`")]
    UnknownCue {
        /// Scene id
        scene: String,
        /// Cue id
        cue: String,
    },

    /// A waited-on cue was not acknowledged and the policy is `block`
    #[error("cue {cue} was not acknowledged by {}", join(.failures))]
    CueAckTimeout {
        /// `scene/cue` label
        cue: String,
        /// Components that did not ack, with reasons
        failures: Vec<AckFailure>,
    },

    /// The engine task is gone
    #[error("show engine is not running")]
    Unavailable,
}

fn join(failures: &[AckFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// The cue sequencer
pub struct ShowEngine {
    opus: Option<Arc<Opus>>,
    registry: ComponentRegistry,
    acks: AckBoard,
    config: EngineConfig,
    cursor: ShowCursor,
    history: Vec<CuePosition>,
    last_dispatch: Option<DispatchReport>,
    state_tx: watch::Sender<ShowSnapshot>,
}

impl ShowEngine {
    /// Create an idle engine
    ///
    /// With `opus` absent (degraded startup) every `start` fails with
    /// [`EngineError::NoOpus`].
    #[must_use]
    pub fn new(
        opus: Option<Arc<Opus>>,
        registry: ComponentRegistry,
        acks: AckBoard,
        config: EngineConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(ShowSnapshot {
            state: RunState::Idle,
            position: None,
            cue: None,
            description: None,
            history: Vec::new(),
            opus_loaded: opus.is_some(),
            total_cues: opus.as_ref().map_or(0, |o| o.cue_count()),
            eligible_components: 0,
            last_dispatch: None,
            updated_at: Utc::now(),
        });
        Self {
            opus,
            registry,
            acks,
            config,
            cursor: ShowCursor::idle(),
            history: Vec::new(),
            last_dispatch: None,
            state_tx,
        }
    }

    /// Current cursor
    #[must_use]
    pub fn cursor(&self) -> ShowCursor {
        self.cursor
    }

    /// Cues the cursor moved past since `start`
    #[must_use]
    pub fn history(&self) -> &[CuePosition] {
        &self.history
    }

    /// The loaded opus
    #[must_use]
    pub fn opus(&self) -> Option<&Arc<Opus>> {
        self.opus.as_ref()
    }

    /// Receive a snapshot after every command
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ShowSnapshot> {
        self.state_tx.subscribe()
    }

    /// Current state as published to operators
    #[must_use]
    pub fn snapshot(&self) -> ShowSnapshot {
        let opus = self.opus.as_deref();
        let position = self.cursor.position;
        ShowSnapshot {
            state: self.cursor.state,
            position,
            cue: position.and_then(|p| opus.map(|o| o.label(p))),
            description: position
                .and_then(|p| opus.and_then(|o| o.cue(p)))
                .and_then(|c| c.description.clone()),
            history: self.history.clone(),
            opus_loaded: opus.is_some(),
            total_cues: opus.map_or(0, Opus::cue_count),
            eligible_components: self.registry.summary().eligible,
            last_dispatch: self.last_dispatch.clone(),
            updated_at: Utc::now(),
        }
    }

    /// Apply an operator command
    ///
    /// Returns the dispatch report for `advance`. The new state is published
    /// to subscribers whether or not the command succeeded.
    ///
    /// # Errors
    ///
    /// See the individual commands.
    pub async fn execute(
        &mut self,
        command: &OperatorCommand,
    ) -> Result<Option<DispatchReport>, EngineError> {
        let result = match command {
            OperatorCommand::Start => self.start().map(|()| None),
            OperatorCommand::Advance => self.advance().await.map(Some),
            OperatorCommand::Back => self.back().map(|()| None),
            OperatorCommand::Pause => self.pause().map(|()| None),
            OperatorCommand::Resume => self.resume().map(|()| None),
            OperatorCommand::Jump { scene, cue } => self.jump(scene, cue.as_deref()).map(|()| None),
            OperatorCommand::Reset => {
                self.reset();
                Ok(None)
            }
        };

        match &result {
            Ok(_) => tracing::info!(
                %command,
                state = %self.cursor.state,
                position = ?self.cursor.position,
                "Command applied"
            ),
            Err(e) => tracing::warn!(%command, state = %self.cursor.state, error = %e, "Command refused"),
        }
        self.state_tx.send_replace(self.snapshot());
        result
    }

    /// `idle → running`, cursor at the first cue of the first scene
    ///
    /// # Errors
    ///
    /// `NoOpus` without an opus, `InvalidTransition` unless idle.
    pub fn start(&mut self) -> Result<(), EngineError> {
        let opus = self.opus.clone().ok_or(EngineError::NoOpus)?;
        self.require("start", &[RunState::Idle], "the show has already started")?;

        self.cursor = ShowCursor {
            position: opus.first_position(),
            state: RunState::Running,
        };
        self.history.clear();
        self.last_dispatch = None;
        Ok(())
    }

    /// Execute the current cue and move the cursor on
    ///
    /// # Errors
    ///
    /// `InvalidTransition` unless running; `CueAckTimeout` when a waited-on
    /// cue is not acknowledged by every target and the policy is `block`
    /// (the cursor then stays on the cue).
    pub async fn advance(&mut self) -> Result<DispatchReport, EngineError> {
        self.require("advance", &[RunState::Running], "the show is not running")?;
        let opus = self.opus.clone().ok_or(EngineError::NoOpus)?;
        let Some(position) = self.cursor.position else {
            return Err(self.invalid("advance", "no cue under the cursor"));
        };
        let Some(cue) = opus.cue(position) else {
            return Err(self.invalid("advance", "cursor is outside the opus"));
        };
        let label = opus.label(position);

        let mut next = opus.next_position(position);
        let scene_id = opus.scene(position.scene).map(|s| s.id.clone()).unwrap_or_default();
        // Every step of a composite cue shares one acknowledgement deadline
        let deadline =
            Instant::now() + cue.ack_timeout.unwrap_or(self.config.ack_timeout);

        let mut dispatch_ids = Vec::new();
        let mut delivered: Vec<ComponentIdentity> = Vec::new();
        let mut failures = Vec::new();
        let mut waiters = Vec::new();
        for (step_index, step) in cue.actions.iter().enumerate() {
            let (cmd, params) = match &step.payload {
                CuePayload::Internal(InternalAction::Log { text }) => {
                    tracing::info!(target: "showrunner::show", cue = %label, "{text}");
                    continue;
                }
                CuePayload::Internal(InternalAction::Goto { scene, cue }) => {
                    next = Some(resolve(&opus, scene, cue.as_deref())?);
                    continue;
                }
                CuePayload::Command { cmd, params } => (cmd, params),
            };

            let recipients = self.registry.recipients(&step.target);
            let dispatch_id = DispatchId::next();
            let message = CoreMessage::CueDispatch {
                dispatch_id,
                scene_id: scene_id.clone(),
                cue_id: cue.id.clone(),
                cmd: cmd.clone(),
                params: params.clone(),
                asset: step.asset.as_ref().and_then(|a| opus.asset(a)).cloned(),
                wait_for_ack: cue.wait_for_ack,
            };

            // Open before sending so a fast ack cannot arrive unobserved
            let waiter = cue
                .wait_for_ack
                .then(|| self.acks.open(dispatch_id, recipients.iter().map(|r| r.identity.clone())));

            let mut sent = 0;
            for recipient in recipients {
                if recipient.tx.try_send(message.clone()).is_ok() {
                    sent += 1;
                    if !delivered.contains(&recipient.identity) {
                        delivered.push(recipient.identity);
                    }
                } else if waiter.is_some() {
                    self.acks
                        .fail(dispatch_id, &recipient.identity, AckFailureReason::Undeliverable);
                } else {
                    failures.push(AckFailure {
                        component: recipient.identity,
                        reason: AckFailureReason::Undeliverable,
                    });
                }
            }
            tracing::info!(
                cue = %label,
                step = step_index,
                action = step.name.as_deref().unwrap_or("-"),
                %dispatch_id,
                target = %step.target,
                recipients = sent,
                wait_for_ack = cue.wait_for_ack,
                "Cue dispatched"
            );
            dispatch_ids.push(dispatch_id);
            waiters.extend(waiter);
        }

        let waited = !waiters.is_empty();
        let mut acked: Vec<ComponentIdentity> = Vec::new();
        for waiter in waiters {
            let outcome = waiter.wait_until(deadline).await;
            for component in outcome.acked {
                if !acked.contains(&component) {
                    acked.push(component);
                }
            }
            failures.extend(outcome.failures);
        }

        let report = DispatchReport {
            dispatch_ids,
            position,
            cue: label.clone(),
            targets: cue.targets().into_iter().cloned().collect(),
            delivered,
            acked,
            failures,
            waited,
            dispatched_at: Utc::now(),
        };

        self.last_dispatch = Some(report.clone());

        if !report.is_clean() {
            for failure in &report.failures {
                tracing::warn!(cue = %label, component = %failure.component, reason = %failure.reason, "Cue not acknowledged");
            }
            if report.waited && self.config.ack_policy == AckFailurePolicy::Block {
                return Err(EngineError::CueAckTimeout {
                    cue: label,
                    failures: report.failures,
                });
            }
        }

        // History only records cues the cursor moved past
        self.history.push(position);
        match next {
            Some(p) => self.cursor.position = Some(p),
            None => {
                self.cursor = ShowCursor {
                    position: None,
                    state: RunState::Finished,
                };
                tracing::info!("Show finished");
            }
        }
        Ok(report)
    }

    /// Step the cursor back one cue without executing anything
    ///
    /// # Errors
    ///
    /// `InvalidTransition` unless running or paused, or at the first cue.
    pub fn back(&mut self) -> Result<(), EngineError> {
        self.require(
            "back",
            &[RunState::Running, RunState::Paused],
            "the show is not in progress",
        )?;
        let previous = match (&self.opus, self.cursor.position) {
            (Some(opus), Some(p)) => opus.previous_position(p),
            _ => None,
        };
        let previous = previous.ok_or_else(|| self.invalid("back", "already at the first cue"))?;
        self.cursor.position = Some(previous);
        Ok(())
    }

    /// `running → paused`
    ///
    /// # Errors
    ///
    /// `InvalidTransition` unless running.
    pub fn pause(&mut self) -> Result<(), EngineError> {
        self.require("pause", &[RunState::Running], "the show is not running")?;
        self.cursor.state = RunState::Paused;
        Ok(())
    }

    /// `paused → running`
    ///
    /// # Errors
    ///
    /// `InvalidTransition` unless paused.
    pub fn resume(&mut self) -> Result<(), EngineError> {
        self.require("resume", &[RunState::Paused], "the show is not paused")?;
        self.cursor.state = RunState::Running;
        Ok(())
    }

    /// Move the cursor to `scene` (first cue, or `cue` within it)
    ///
    /// # Errors
    ///
    /// `InvalidTransition` unless running or paused; `UnknownScene` /
    /// `UnknownCue` for names not in the opus.
    pub fn jump(&mut self, scene: &str, cue: Option<&str>) -> Result<(), EngineError> {
        self.require(
            "jump",
            &[RunState::Running, RunState::Paused],
            "the show is not in progress",
        )?;
        let opus = self.opus.clone().ok_or(EngineError::NoOpus)?;
        self.cursor.position = Some(resolve(&opus, scene, cue)?);
        Ok(())
    }

    /// Back to idle from any state
    pub fn reset(&mut self) {
        self.cursor = ShowCursor::idle();
        self.history.clear();
        self.last_dispatch = None;
    }

    fn require(
        &self,
        command: &str,
        allowed: &[RunState],
        reason: &str,
    ) -> Result<(), EngineError> {
        if allowed.contains(&self.cursor.state) {
            Ok(())
        } else {
            Err(self.invalid(command, reason))
        }
    }

    fn invalid(&self, command: &str, reason: &str) -> EngineError {
        EngineError::InvalidTransition {
            command: command.to_string(),
            state: self.cursor.state,
            reason: reason.to_string(),
        }
    }
}

fn resolve(opus: &Opus, scene: &str, cue: Option<&str>) -> Result<CuePosition, EngineError> {
    let scene_index = opus
        .find_scene(scene)
        .ok_or_else(|| EngineError::UnknownScene {
            scene: scene.to_string(),
        })?;
    let cue_index = match cue {
        None => 0,
        Some(cue) => opus
            .find_cue(scene_index, cue)
            .ok_or_else(|| EngineError::UnknownCue {
                scene: scene.to_string(),
                cue: cue.to_string(),
            })?,
    };
    Ok(CuePosition::new(scene_index, cue_index))
}

impl fmt::Debug for ShowEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShowEngine")
            .field("cursor", &self.cursor)
            .field("opus_loaded", &self.opus.is_some())
            .field("history", &self.history.len())
            .field("config", &self.config)
            .finish()
    }
}
