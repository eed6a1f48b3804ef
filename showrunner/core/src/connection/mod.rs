//! Connection Manager
//!
//! Runs one peer connection from handshake to close. Generic over the byte
//! stream so the daemon hands it TCP sockets and tests hand it
//! `tokio::io::duplex` pipes.
//!
//! # Lifecycle
//!
//! ```text
//!   accept ─▶ handshake (bounded) ─┬─ component ─▶ register ─▶ reconcile assets
//!                                  │                 │
//!                                  │                 ▼
//!                                  │        heartbeats / acks / sync replies
//!                                  │
//!                                  └─ operator ──▶ show state + commands
//!
//!   close (goodbye, EOF, grace period, reconnect elsewhere)
//!       ─▶ release registry entry ─▶ fail pending acks ─▶ cancel sync
//! ```
//!
//! Each connection task owns its liveness tracker. The registry is the only
//! place other tasks learn about the connection.

mod handshake;
mod liveness;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::Instrument;

use crate::engine::{AckBoard, DispatchReport, EngineError, EngineHandle};
use crate::opus::Opus;
use crate::protocol::{
    ComponentMessage, ConnectionId, CoreMessage, NoticeLevel, OperatorCommand, Role,
    PROTOCOL_VERSION,
};
use crate::registry::{ComponentHandle, ComponentRegistry, LinkState, RegistryError};
use crate::sync::SyncCoordinator;
use crate::transport::{FrameReader, FrameWriter, TransportConfig, TransportError};

pub use handshake::{validate_handshake, Handshake, ProtocolError};
pub use liveness::{LivenessEvent, LivenessTracker};

/// Why a connection ended normally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer sent `Goodbye`
    Goodbye,
    /// The peer closed the stream
    PeerClosed,
    /// The same identity connected again elsewhere
    Superseded,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Goodbye => f.write_str("goodbye"),
            Self::PeerClosed => f.write_str("peer closed"),
            Self::Superseded => f.write_str("superseded by a newer connection"),
        }
    }
}

/// Errors that end a connection
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The peer broke the protocol
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// No handshake within the deadline
    #[error("no handshake within {after:?}")]
    HandshakeTimeout {
        /// Configured deadline
        after: Duration,
    },

    /// Heartbeats stopped for longer than the grace period
    #[error("{identity} sent no heartbeat for {after:?}")]
    HeartbeatTimeout {
        /// Peer identity
        identity: String,
        /// Silence observed
        after: Duration,
    },

    /// The stream failed
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Shared services every connection task needs
#[derive(Clone, Debug)]
pub struct ConnectionContext {
    /// Component registry
    pub registry: ComponentRegistry,
    /// Asset sync coordinator
    pub sync: SyncCoordinator,
    /// Pending cue acknowledgements
    pub acks: AckBoard,
    /// Show engine task
    pub engine: EngineHandle,
    /// Loaded opus, if any
    pub opus: Option<Arc<Opus>>,
    /// Timings and limits
    pub config: TransportConfig,
}

enum Flow {
    Continue,
    Close(CloseReason),
}

/// Serves peer connections
///
/// Cheap to clone; one clone per accepted connection.
#[derive(Clone, Debug)]
pub struct ConnectionManager {
    ctx: Arc<ConnectionContext>,
}

impl ConnectionManager {
    /// Create a manager over shared services
    #[must_use]
    pub fn new(ctx: ConnectionContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    /// Shared services
    #[must_use]
    pub fn context(&self) -> &ConnectionContext {
        &self.ctx
    }

    /// Run a connection to completion
    ///
    /// # Errors
    ///
    /// Handshake failures (after `HandshakeRejected` was sent), handshake and
    /// heartbeat timeouts, and unrecoverable transport errors.
    pub async fn serve<S>(
        &self,
        conn_id: ConnectionId,
        stream: S,
    ) -> Result<CloseReason, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FrameReader::new(read_half);
        let mut writer = FrameWriter::new(write_half);

        let handshake = match self.read_handshake(&mut reader).await {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(error = %e, "Handshake rejected");
                let _ = writer
                    .send(&CoreMessage::HandshakeRejected {
                        reason: e.to_string(),
                    })
                    .await;
                let _ = writer.shutdown().await;
                return Err(e);
            }
        };

        writer
            .send(&CoreMessage::HandshakeAck {
                connection_id: conn_id,
                protocol_version: PROTOCOL_VERSION,
                heartbeat_interval_ms: self.ctx.config.heartbeat_interval_ms,
            })
            .await?;

        let result = match handshake.role {
            Role::Component => {
                self.serve_component(conn_id, handshake, &mut reader, &mut writer)
                    .await
            }
            Role::Operator => self.serve_operator(handshake, &mut reader, &mut writer).await,
        };
        let _ = writer.shutdown().await;
        result
    }

    async fn read_handshake<R>(
        &self,
        reader: &mut FrameReader<R>,
    ) -> Result<Handshake, ConnectionError>
    where
        R: AsyncRead + Unpin,
    {
        let after = self.ctx.config.handshake_timeout();
        let first = tokio::time::timeout(after, reader.next::<ComponentMessage>())
            .await
            .map_err(|_| ConnectionError::HandshakeTimeout { after })?;

        match first {
            Ok(Some(message)) => Ok(validate_handshake(message)?),
            Ok(None) => Err(ProtocolError::ClosedBeforeHandshake.into()),
            Err(e) if e.is_recoverable() => Err(ProtocolError::Malformed(e.to_string()).into()),
            Err(e) => Err(e.into()),
        }
    }

    // ========================================================================
    // Component Role
    // ========================================================================

    async fn serve_component<R, W>(
        &self,
        conn_id: ConnectionId,
        handshake: Handshake,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
    ) -> Result<CloseReason, ConnectionError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let ctx = &self.ctx;
        let Handshake {
            identity,
            capabilities,
            assets,
            ..
        } = handshake;

        if let Some(opus) = &ctx.opus {
            if !opus.declares(&identity.component_type) {
                tracing::warn!(
                    component = %identity,
                    "Component type is not declared by the opus; it will receive no cues"
                );
            }
        }

        let (tx, mut outbound) = mpsc::channel(ctx.config.outbound_capacity);
        let registration = ctx
            .registry
            .register(identity, capabilities, assets, conn_id, tx);
        let handle = registration.handle;

        let mut tracker = LivenessTracker::new(
            Instant::now(),
            ctx.config.heartbeat_timeout(),
            ctx.config.grace_period(),
        );
        tracker.handshake_complete(Instant::now());
        self.spawn_reconcile(handle.clone());

        let result = loop {
            let wake = tracker
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + ctx.config.grace_period());

            tokio::select! {
                frame = reader.next::<ComponentMessage>() => match frame {
                    Ok(Some(message)) => {
                        match self.on_component_message(&handle, &mut tracker, writer, message).await {
                            Ok(Flow::Continue) => {}
                            Ok(Flow::Close(reason)) => break Ok(reason),
                            Err(e) => break Err(e),
                        }
                    }
                    Ok(None) => break Ok(CloseReason::PeerClosed),
                    Err(e) if e.is_recoverable() => {
                        tracing::warn!(component = %handle.identity, error = %e, "Dropped malformed frame");
                        if let Err(e) = writer
                            .send(&CoreMessage::notice(NoticeLevel::Warning, format!("malformed message: {e}")))
                            .await
                        {
                            break Err(e.into());
                        }
                    }
                    Err(e) => break Err(e.into()),
                },

                message = outbound.recv() => match message {
                    Some(message) => {
                        if let Err(e) = writer.send(&message).await {
                            break Err(e.into());
                        }
                    }
                    // The registry dropped our sender: a reconnect replaced us
                    None => break Ok(CloseReason::Superseded),
                },

                () = tokio::time::sleep_until(wake) => match tracker.tick(Instant::now()) {
                    Some(LivenessEvent::Degraded { silent_for }) => {
                        tracing::warn!(component = %handle.identity, ?silent_for, "Heartbeat overdue");
                        if let Err(RegistryError::StaleConnection { .. }) =
                            ctx.registry.transition(&handle, LinkState::Degraded)
                        {
                            break Ok(CloseReason::Superseded);
                        }
                    }
                    Some(LivenessEvent::Expired { silent_for }) => {
                        break Err(ConnectionError::HeartbeatTimeout {
                            identity: handle.identity.to_string(),
                            after: silent_for,
                        });
                    }
                    Some(LivenessEvent::Recovered) | None => {}
                },
            }
        };

        tracker.close();
        self.cleanup(&handle);
        result
    }

    async fn on_component_message<W>(
        &self,
        handle: &ComponentHandle,
        tracker: &mut LivenessTracker,
        writer: &mut FrameWriter<W>,
        message: ComponentMessage,
    ) -> Result<Flow, ConnectionError>
    where
        W: AsyncWrite + Unpin,
    {
        let ctx = &self.ctx;
        match message {
            ComponentMessage::Heartbeat { seq } => {
                writer.send(&CoreMessage::HeartbeatAck { seq }).await?;
                if tracker.heartbeat(Instant::now()) == Some(LivenessEvent::Recovered) {
                    tracing::info!(component = %handle.identity, "Heartbeat resumed");
                    if let Err(RegistryError::StaleConnection { .. }) =
                        ctx.registry.transition(handle, LinkState::Ready)
                    {
                        return Ok(Flow::Close(CloseReason::Superseded));
                    }
                }
                if ctx.sync.needs_retry(handle) {
                    tracing::info!(component = %handle.identity, "Retrying asset sync");
                    self.spawn_reconcile(handle.clone());
                }
            }

            ComponentMessage::CueAck {
                dispatch_id,
                cue_id,
                status,
                reason,
            } => {
                if !ctx
                    .acks
                    .acknowledge(dispatch_id, &handle.identity, status, reason)
                {
                    tracing::debug!(
                        component = %handle.identity,
                        %dispatch_id,
                        cue = %cue_id,
                        "Late or unexpected cue ack"
                    );
                }
            }

            ComponentMessage::AssetSyncComplete { sync_id, assets } => {
                if !ctx.sync.complete(handle, sync_id, assets) {
                    send_notice(writer, NoticeLevel::Warning, format!("{sync_id} is not pending")).await?;
                }
            }

            ComponentMessage::AssetSyncFailed { sync_id, reason } => {
                if !ctx.sync.fail(handle, sync_id, reason) {
                    send_notice(writer, NoticeLevel::Warning, format!("{sync_id} is not pending")).await?;
                }
            }

            ComponentMessage::ResyncRequest { assets } => {
                match ctx.registry.update_manifest(handle, assets) {
                    Ok(()) => self.spawn_reconcile(handle.clone()),
                    Err(RegistryError::StaleConnection { .. }) => {
                        return Ok(Flow::Close(CloseReason::Superseded))
                    }
                    Err(e) => tracing::warn!(component = %handle.identity, error = %e, "Resync refused"),
                }
            }

            ComponentMessage::Command { command } => {
                let err = ProtocolError::CommandFromComponent {
                    identity: handle.identity.clone(),
                };
                tracing::warn!(%command, error = %err, "Rejected operator command");
                writer
                    .send(&CoreMessage::CommandResult {
                        ok: false,
                        message: err.to_string(),
                    })
                    .await?;
            }

            ComponentMessage::Handshake { .. } => {
                send_notice(writer, NoticeLevel::Warning, "already handshaken; ignored").await?;
            }

            ComponentMessage::Goodbye { reason } => {
                tracing::info!(component = %handle.identity, reason = ?reason, "Component said goodbye");
                return Ok(Flow::Close(CloseReason::Goodbye));
            }
        }
        Ok(Flow::Continue)
    }

    fn spawn_reconcile(&self, handle: ComponentHandle) {
        let sync = self.ctx.sync.clone();
        tokio::spawn(
            async move {
                if let Err(e) = sync.reconcile(&handle).await {
                    tracing::debug!(component = %handle.identity, error = %e, "Reconcile ended");
                }
            }
            .in_current_span(),
        );
    }

    fn cleanup(&self, handle: &ComponentHandle) {
        if self.ctx.registry.release(handle) {
            let abandoned = self.ctx.acks.abandon(&handle.identity);
            if abandoned > 0 {
                tracing::info!(component = %handle.identity, abandoned, "Failed pending cue acks");
            }
        }
        self.ctx.sync.cancel(handle);
    }

    // ========================================================================
    // Operator Role
    // ========================================================================

    async fn serve_operator<R, W>(
        &self,
        handshake: Handshake,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
    ) -> Result<CloseReason, ConnectionError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let ctx = &self.ctx;
        let identity = handshake.identity;
        tracing::info!(operator = %identity, "Operator connected");

        let mut state = ctx.engine.subscribe();
        let snapshot = state.borrow_and_update().clone();
        writer.send(&CoreMessage::ShowState { snapshot }).await?;

        let (results_tx, mut results) = mpsc::channel(ctx.config.outbound_capacity);
        let mut engine_live = true;
        let mut tracker = LivenessTracker::new(
            Instant::now(),
            ctx.config.heartbeat_timeout(),
            ctx.config.grace_period(),
        );
        tracker.handshake_complete(Instant::now());

        loop {
            let wake = tracker
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + ctx.config.grace_period());

            tokio::select! {
                frame = reader.next::<ComponentMessage>() => match frame {
                    Ok(Some(ComponentMessage::Command { command })) => {
                        tracing::info!(operator = %identity, %command, "Operator command");
                        match ctx.engine.enqueue(command.clone()).await {
                            Ok(reply) => {
                                let results_tx = results_tx.clone();
                                tokio::spawn(async move {
                                    let outcome = reply.await.unwrap_or(Err(EngineError::Unavailable));
                                    let _ = results_tx.send(command_result(&command, outcome)).await;
                                });
                            }
                            Err(e) => writer.send(&command_result(&command, Err(e))).await?,
                        }
                    }
                    Ok(Some(ComponentMessage::Heartbeat { seq })) => {
                        tracker.heartbeat(Instant::now());
                        writer.send(&CoreMessage::HeartbeatAck { seq }).await?;
                    }
                    Ok(Some(ComponentMessage::Goodbye { .. })) => return Ok(CloseReason::Goodbye),
                    Ok(Some(other)) => {
                        tracing::debug!(operator = %identity, kind = other.kind(), "Ignored message from operator");
                        send_notice(
                            writer,
                            NoticeLevel::Warning,
                            format!("`{}` is not accepted from an operator", other.kind()),
                        )
                        .await?;
                    }
                    Ok(None) => return Ok(CloseReason::PeerClosed),
                    Err(e) if e.is_recoverable() => {
                        send_notice(writer, NoticeLevel::Warning, format!("malformed message: {e}")).await?;
                    }
                    Err(e) => return Err(e.into()),
                },

                Some(result) = results.recv() => writer.send(&result).await?,

                changed = state.changed(), if engine_live => match changed {
                    Ok(()) => {
                        let snapshot = state.borrow_and_update().clone();
                        writer.send(&CoreMessage::ShowState { snapshot }).await?;
                    }
                    Err(_) => {
                        engine_live = false;
                        send_notice(writer, NoticeLevel::Error, "show engine stopped").await?;
                    }
                },

                () = tokio::time::sleep_until(wake) => {
                    if let Some(LivenessEvent::Expired { silent_for }) = tracker.tick(Instant::now()) {
                        return Err(ConnectionError::HeartbeatTimeout {
                            identity: identity.to_string(),
                            after: silent_for,
                        });
                    }
                },
            }
        }
    }
}

fn command_result(
    command: &OperatorCommand,
    outcome: Result<Option<DispatchReport>, EngineError>,
) -> CoreMessage {
    match outcome {
        Ok(Some(report)) if report.is_clean() => CoreMessage::CommandResult {
            ok: true,
            message: format!("{command}: executed {}", report.cue),
        },
        Ok(Some(report)) => CoreMessage::CommandResult {
            ok: true,
            message: format!(
                "{command}: executed {} with {} failure(s)",
                report.cue,
                report.failures.len()
            ),
        },
        Ok(None) => CoreMessage::CommandResult {
            ok: true,
            message: format!("{command}: ok"),
        },
        Err(e) => CoreMessage::CommandResult {
            ok: false,
            message: e.to_string(),
        },
    }
}

async fn send_notice<W>(
    writer: &mut FrameWriter<W>,
    level: NoticeLevel,
    message: impl Into<String>,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    writer.send(&CoreMessage::notice(level, message)).await
}
