//! Daemon Server Implementation
//!
//! This module provides the server loop for the Showrunner daemon:
//! - Accepts TCP connections from components and operator consoles
//! - Spawns one handler task per connection
//! - Enforces the connection limit
//! - Supports graceful shutdown
//!
//! # Architecture
//!
//! ```text
//!                     DaemonServer
//!                          │
//!          ┌───────────────┼───────────────┐
//!          │               │               │
//!     audio:main     lighting:rig    operator console
//!     (conn-1)        (conn-2)          (conn-3)
//!          │               │               │
//!          └───────────────┴───────────────┘
//!                          │
//!                  ConnectionManager
//!          (registry · sync · acks · engine task)
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use showrunner_core::{
    AckBoard, ComponentRegistry, ConnectionContext, ConnectionId, ConnectionManager, CoreConfig,
    EngineHandle, Opus, ShowEngine, SyncCoordinator,
};

/// Connection state tracking (internal to the server)
struct ConnectionState {
    /// When the connection was accepted
    connected_at: Instant,
    /// Remote address
    peer: SocketAddr,
    /// Handle to abort the connection task
    abort_handle: tokio::task::AbortHandle,
}

/// The main daemon server
pub struct DaemonServer {
    /// Bound listener
    listener: TcpListener,
    /// Shared per-connection services
    manager: ConnectionManager,
    /// Task owning the show engine
    engine_task: JoinHandle<()>,
    /// Connection limit
    max_connections: usize,
    /// Active connection state (task handles, peer info)
    connection_states: Arc<DashMap<ConnectionId, ConnectionState>>,
}

impl DaemonServer {
    /// Wire up Core's services and bind the listener
    ///
    /// # Errors
    ///
    /// Fails if the listen address cannot be bound.
    pub async fn bind(config: &CoreConfig, opus: Option<Arc<Opus>>) -> Result<Self> {
        let registry = ComponentRegistry::new();
        let acks = AckBoard::new();

        let engine = ShowEngine::new(
            opus.clone(),
            registry.clone(),
            acks.clone(),
            config.engine_config(),
        );
        let (engine, engine_task) = EngineHandle::spawn(engine);

        let sync = SyncCoordinator::new(
            registry.clone(),
            opus.clone(),
            config.sync_assets,
            config.sync_timeout(),
        );
        info!(
            enabled = config.sync_assets,
            timeout_ms = config.sync_timeout_ms,
            "Asset sync"
        );

        let manager = ConnectionManager::new(ConnectionContext {
            registry,
            sync,
            acks,
            engine,
            opus,
            config: config.transport.clone(),
        });

        let listener = TcpListener::bind(config.transport.listen)
            .await
            .with_context(|| format!("Failed to bind {}", config.transport.listen))?;
        info!(addr = %listener.local_addr()?, "Listening for connections");

        Ok(Self {
            listener,
            manager,
            engine_task,
            max_connections: config.transport.max_connections,
            connection_states: Arc::new(DashMap::new()),
        })
    }

    /// Address actually bound (useful with port 0)
    ///
    /// # Errors
    ///
    /// Propagates the socket error.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Listener has no local address")
    }

    /// Accept connections until `shutdown` is notified
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok`; accept errors are logged and skipped.
    pub async fn run(&self, shutdown: Arc<Notify>) -> Result<()> {
        loop {
            let (stream, peer) = tokio::select! {
                () = shutdown.notified() => {
                    info!("Shutdown requested, stopping accept loop");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        continue;
                    }
                },
            };

            // Check connection limit
            if self.connection_states.len() >= self.max_connections {
                warn!(%peer, limit = self.max_connections, "Connection limit reached, rejecting");
                drop(stream);
                continue;
            }
            if let Err(e) = stream.set_nodelay(true) {
                debug!(%peer, error = %e, "Could not set TCP_NODELAY");
            }

            let conn_id = ConnectionId::new();
            info!(
                conn_id = %conn_id,
                %peer,
                active_connections = self.connection_states.len() + 1,
                "New connection accepted"
            );

            let manager = self.manager.clone();
            let states = Arc::clone(&self.connection_states);
            let task = tokio::spawn(
                async move {
                    match manager.serve(conn_id, stream).await {
                        Ok(reason) => info!(%reason, "Connection closed"),
                        Err(e) => warn!(error = %e, "Connection ended with error"),
                    }
                    states.remove(&conn_id);
                    debug!(
                        active_connections = states.len(),
                        "Connection handler finished"
                    );
                }
                .instrument(tracing::info_span!("connection", %conn_id)),
            );

            self.connection_states.insert(
                conn_id,
                ConnectionState {
                    connected_at: Instant::now(),
                    peer,
                    abort_handle: task.abort_handle(),
                },
            );
            // The handler may have finished before it was tracked
            if task.is_finished() {
                self.connection_states.remove(&conn_id);
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Graceful shutdown
    fn shutdown(&self) {
        info!("Initiating graceful shutdown");

        // Abort all connection handlers
        let conn_ids: Vec<ConnectionId> = self.connection_states.iter().map(|r| *r.key()).collect();
        for conn_id in conn_ids {
            if let Some((_, conn_state)) = self.connection_states.remove(&conn_id) {
                info!(conn_id = %conn_id, "Aborting connection");
                conn_state.abort_handle.abort();
            }
        }
        self.engine_task.abort();

        info!("Shutdown complete");
    }

    /// Get number of active connections
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connection_states.len()
    }

    /// Get connection statistics
    #[must_use]
    pub fn connection_stats(&self) -> HashMap<ConnectionId, ConnectionStats> {
        self.connection_states
            .iter()
            .map(|r| {
                let conn_state = r.value();
                (
                    *r.key(),
                    ConnectionStats {
                        peer: conn_state.peer,
                        uptime_secs: conn_state.connected_at.elapsed().as_secs(),
                    },
                )
            })
            .collect()
    }
}

/// Statistics for a single connection
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    /// Remote address
    pub peer: SocketAddr,
    /// Connection uptime in seconds
    pub uptime_secs: u64,
}
