//! Component Registry
//!
//! Source of truth for which components are connected, what they can do, what
//! assets they hold, and whether they may receive cues right now.
//!
//! # Architecture
//!
//! ```text
//!                      ComponentRegistry
//!                     ┌─────────────────────────────────────────────┐
//!                     │ HashMap<ComponentIdentity, ComponentEntry>  │
//!                     │   - wrapped in Arc<RwLock<>>                │
//!                     └───────────────┬─────────────────────────────┘
//!                                     │
//!              ┌──────────────────────┼──────────────────────┐
//!              │                      │                      │
//!       ┌──────▼──────┐       ┌───────▼──────┐       ┌───────▼──────┐
//!       │ audio:main  │       │ lighting:rig │       │ video:screen │
//!       │   conn-1    │       │   conn-2     │       │   conn-3     │
//!       └─────────────┘       └──────────────┘       └──────────────┘
//! ```
//!
//! # Thread Safety
//!
//! Every mutation takes the write lock, so concurrent register/unregister
//! calls linearize. Readers (the engine, the sync coordinator) take snapshots
//! and never hold the lock across an await.
//!
//! # Stale Connections
//!
//! When a component reconnects, its new connection replaces the entry. The old
//! connection's task may still be winding down; the handle-scoped methods
//! ([`ComponentRegistry::transition`], [`ComponentRegistry::release`], ...)
//! refuse to touch an entry owned by a different connection.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::assets::ReportedAsset;
use crate::opus::ComponentType;
use crate::protocol::{ComponentIdentity, ConnectionId, CoreMessage};

/// Connection liveness of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// Transport open, handshake in progress
    Connecting,
    /// Handshake done, heartbeats on time
    Ready,
    /// Heartbeat overdue, still inside the grace period
    Degraded,
    /// Gone; terminal
    Disconnected,
}

impl LinkState {
    /// Whether moving from `self` to `next` is allowed
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Disconnected, _) => false,
            (_, Self::Disconnected) => true,
            (Self::Connecting, Self::Ready) => true,
            (Self::Ready | Self::Degraded, Self::Ready | Self::Degraded) => true,
            _ => false,
        }
    }

    /// Whether the connection is up (ready or degraded)
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Ready | Self::Degraded)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Asset synchronization status of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Not reconciled yet
    Pending,
    /// Instruction sent, waiting for completion
    Syncing,
    /// Cache matches the opus
    Synced,
    /// Last round failed or timed out
    Failed,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Errors from registry operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// No component with this identity is registered
    #[error("component {identity} is not registered")]
    NotFound {
        /// Identity looked up
        identity: ComponentIdentity,
    },

    /// The entry now belongs to a newer connection
    #[error("component {identity} was taken over by another connection (caller {connection})")]
    StaleConnection {
        /// Identity of the entry
        identity: ComponentIdentity,
        /// The caller's (old) connection
        connection: ConnectionId,
    },

    /// Illegal liveness transition
    #[error("component {identity} cannot go from {from} to {to}")]
    InvalidTransition {
        /// Identity of the entry
        identity: ComponentIdentity,
        /// Current state
        from: LinkState,
        /// Requested state
        to: LinkState,
    },
}

/// Proof that a connection owns a registry entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentHandle {
    /// Registered identity
    pub identity: ComponentIdentity,
    /// Connection that registered it
    pub connection: ConnectionId,
}

/// Outcome of [`ComponentRegistry::register`]
#[derive(Debug, Clone)]
pub struct Registration {
    /// Handle for connection-scoped updates
    pub handle: ComponentHandle,
    /// Connection whose entry was replaced, if this was a reconnect
    pub replaced: Option<ConnectionId>,
}

impl Registration {
    /// Whether this registration replaced a live entry
    #[must_use]
    pub fn is_reconnect(&self) -> bool {
        self.replaced.is_some()
    }
}

#[derive(Debug)]
struct ComponentEntry {
    connection: ConnectionId,
    capabilities: Vec<String>,
    manifest: Vec<ReportedAsset>,
    state: LinkState,
    sync: SyncStatus,
    tx: mpsc::Sender<CoreMessage>,
    connected_at: DateTime<Utc>,
}

impl ComponentEntry {
    fn is_eligible(&self) -> bool {
        self.state.is_live() && self.sync == SyncStatus::Synced && !self.tx.is_closed()
    }

    fn snapshot(&self, identity: &ComponentIdentity) -> ComponentSnapshot {
        ComponentSnapshot {
            identity: identity.clone(),
            connection: self.connection,
            capabilities: self.capabilities.clone(),
            manifest: self.manifest.clone(),
            state: self.state,
            sync: self.sync,
            connected_at: self.connected_at,
        }
    }
}

/// Point-in-time copy of a registry entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentSnapshot {
    /// Identity
    pub identity: ComponentIdentity,
    /// Owning connection
    pub connection: ConnectionId,
    /// Declared capabilities
    pub capabilities: Vec<String>,
    /// Last reported asset manifest
    pub manifest: Vec<ReportedAsset>,
    /// Liveness
    pub state: LinkState,
    /// Asset sync status
    pub sync: SyncStatus,
    /// When this connection registered
    pub connected_at: DateTime<Utc>,
}

impl ComponentSnapshot {
    /// Whether this component may receive cues
    #[must_use]
    pub fn is_eligible(&self) -> bool {
        self.state.is_live() && self.sync == SyncStatus::Synced
    }

    /// Handle matching this snapshot's connection
    #[must_use]
    pub fn handle(&self) -> ComponentHandle {
        ComponentHandle {
            identity: self.identity.clone(),
            connection: self.connection,
        }
    }
}

/// Selects entries in [`ComponentRegistry::list`]
#[derive(Debug, Clone, Default)]
pub struct ComponentFilter {
    component_type: Option<ComponentType>,
    state: Option<LinkState>,
    eligible_only: bool,
}

impl ComponentFilter {
    /// Every entry
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Entries of one component type
    #[must_use]
    pub fn of_type(component_type: ComponentType) -> Self {
        Self {
            component_type: Some(component_type),
            ..Self::default()
        }
    }

    /// Only entries in this liveness state
    #[must_use]
    pub fn in_state(mut self, state: LinkState) -> Self {
        self.state = Some(state);
        self
    }

    /// Only entries that may receive cues
    #[must_use]
    pub fn eligible(mut self) -> Self {
        self.eligible_only = true;
        self
    }

    fn matches(&self, identity: &ComponentIdentity, entry: &ComponentEntry) -> bool {
        self.component_type
            .as_ref()
            .map_or(true, |t| &identity.component_type == t)
            && self.state.map_or(true, |s| entry.state == s)
            && (!self.eligible_only || entry.is_eligible())
    }
}

/// A component that should receive a message, with its outbound channel
#[derive(Debug, Clone)]
pub struct Recipient {
    /// Who
    pub identity: ComponentIdentity,
    /// Outbound channel of its connection task
    pub tx: mpsc::Sender<CoreMessage>,
}

/// Result of a broadcast operation
#[derive(Debug, Clone, Default)]
pub struct BroadcastResult {
    /// Number of components that received the message
    pub successful: usize,
    /// Components whose channel was full or closed
    pub failed: Vec<ComponentIdentity>,
}

impl BroadcastResult {
    /// Check if all recipients received the message
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Counts by type and state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistrySummary {
    /// Registered components
    pub total: usize,
    /// Components that may receive cues
    pub eligible: usize,
    /// Count by component type
    pub by_type: BTreeMap<String, usize>,
    /// Count by liveness state
    pub by_state: BTreeMap<String, usize>,
}

/// Registry of connected components
///
/// Cheap to clone; clones share the same map.
#[derive(Clone, Default)]
pub struct ComponentRegistry {
    inner: Arc<RwLock<HashMap<ComponentIdentity, ComponentEntry>>>,
}

impl ComponentRegistry {
    /// Create a new empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component that completed its handshake
    ///
    /// An entry with the same identity is replaced: this is a reconnect, not
    /// an error. The new entry starts `ready` with sync status `pending`.
    pub fn register(
        &self,
        identity: ComponentIdentity,
        capabilities: Vec<String>,
        manifest: Vec<ReportedAsset>,
        connection: ConnectionId,
        tx: mpsc::Sender<CoreMessage>,
    ) -> Registration {
        let entry = ComponentEntry {
            connection,
            capabilities,
            manifest,
            state: LinkState::Ready,
            sync: SyncStatus::Pending,
            tx,
            connected_at: Utc::now(),
        };

        let previous = self.inner.write().insert(identity.clone(), entry);
        let replaced = previous.map(|p| p.connection);

        match replaced {
            Some(old) => tracing::info!(
                component = %identity,
                connection_id = %connection,
                replaced = %old,
                "Component reconnected"
            ),
            None => tracing::info!(
                component = %identity,
                connection_id = %connection,
                "Component registered"
            ),
        }

        Registration {
            handle: ComponentHandle {
                identity,
                connection,
            },
            replaced,
        }
    }

    /// Remove a component regardless of which connection owns it
    pub fn unregister(&self, identity: &ComponentIdentity) -> Option<ComponentSnapshot> {
        let removed = self.inner.write().remove(identity);
        removed.map(|mut entry| {
            entry.state = LinkState::Disconnected;
            tracing::info!(component = %identity, "Component unregistered");
            entry.snapshot(identity)
        })
    }

    /// Remove the entry only if `handle`'s connection still owns it
    ///
    /// Returns false when a reconnect already replaced it.
    pub fn release(&self, handle: &ComponentHandle) -> bool {
        let mut inner = self.inner.write();
        let owned = inner
            .get(&handle.identity)
            .is_some_and(|e| e.connection == handle.connection);
        if owned {
            inner.remove(&handle.identity);
            tracing::info!(
                component = %handle.identity,
                connection_id = %handle.connection,
                "Component disconnected"
            );
        }
        owned
    }

    /// Look up a component
    ///
    /// # Errors
    ///
    /// `RegistryError::NotFound` if nothing is registered under `identity`.
    pub fn lookup(&self, identity: &ComponentIdentity) -> Result<ComponentSnapshot, RegistryError> {
        self.inner
            .read()
            .get(identity)
            .map(|e| e.snapshot(identity))
            .ok_or_else(|| RegistryError::NotFound {
                identity: identity.clone(),
            })
    }

    /// Entries matching `filter`, ordered by identity
    #[must_use]
    pub fn list(&self, filter: &ComponentFilter) -> Vec<ComponentSnapshot> {
        let mut out: Vec<ComponentSnapshot> = self
            .inner
            .read()
            .iter()
            .filter(|(id, e)| filter.matches(id, e))
            .map(|(id, e)| e.snapshot(id))
            .collect();
        out.sort_by(|a, b| a.identity.cmp(&b.identity));
        out
    }

    /// Set the liveness state of whichever connection owns `identity`
    ///
    /// Returns the previous state.
    ///
    /// # Errors
    ///
    /// `NotFound`, or `InvalidTransition` for an illegal move.
    pub fn mark_state(
        &self,
        identity: &ComponentIdentity,
        state: LinkState,
    ) -> Result<LinkState, RegistryError> {
        let mut inner = self.inner.write();
        let entry = inner
            .get_mut(identity)
            .ok_or_else(|| RegistryError::NotFound {
                identity: identity.clone(),
            })?;
        apply_state(identity, entry, state)
    }

    /// Set the liveness state, only if `handle`'s connection owns the entry
    ///
    /// # Errors
    ///
    /// `NotFound`, `StaleConnection`, or `InvalidTransition`.
    pub fn transition(
        &self,
        handle: &ComponentHandle,
        state: LinkState,
    ) -> Result<LinkState, RegistryError> {
        self.with_owned(handle, |entry| apply_state(&handle.identity, entry, state))?
    }

    /// Record the outcome of an asset reconciliation
    ///
    /// # Errors
    ///
    /// `NotFound` or `StaleConnection`.
    pub fn set_sync_status(
        &self,
        handle: &ComponentHandle,
        sync: SyncStatus,
    ) -> Result<(), RegistryError> {
        self.with_owned(handle, |entry| {
            if entry.sync != sync {
                tracing::debug!(
                    component = %handle.identity,
                    from = %entry.sync,
                    to = %sync,
                    "Sync status changed"
                );
            }
            entry.sync = sync;
        })
    }

    /// Replace the reported asset manifest
    ///
    /// # Errors
    ///
    /// `NotFound` or `StaleConnection`.
    pub fn update_manifest(
        &self,
        handle: &ComponentHandle,
        manifest: Vec<ReportedAsset>,
    ) -> Result<(), RegistryError> {
        self.with_owned(handle, |entry| entry.manifest = manifest)
    }

    /// Eligible components of a type with their outbound channels
    ///
    /// Collected under the read lock so callers can send without holding it.
    #[must_use]
    pub fn recipients(&self, component_type: &ComponentType) -> Vec<Recipient> {
        let mut out: Vec<Recipient> = self
            .inner
            .read()
            .iter()
            .filter(|(id, e)| &id.component_type == component_type && e.is_eligible())
            .map(|(id, e)| Recipient {
                identity: id.clone(),
                tx: e.tx.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.identity.cmp(&b.identity));
        out
    }

    /// Send a message to one component without waiting
    ///
    /// Returns true if the message was queued.
    pub fn send_to(&self, identity: &ComponentIdentity, message: CoreMessage) -> bool {
        let tx = self.inner.read().get(identity).map(|e| e.tx.clone());
        match tx {
            Some(tx) => tx.try_send(message).is_ok(),
            None => {
                tracing::warn!(component = %identity, "Attempted to send to unknown component");
                false
            }
        }
    }

    /// Send a message to every entry matching `filter`
    ///
    /// Uses `try_send` to avoid blocking on slow components.
    #[must_use]
    pub fn broadcast(&self, message: &CoreMessage, filter: &ComponentFilter) -> BroadcastResult {
        let targets: Vec<(ComponentIdentity, mpsc::Sender<CoreMessage>)> = self
            .inner
            .read()
            .iter()
            .filter(|(id, e)| filter.matches(id, e))
            .map(|(id, e)| (id.clone(), e.tx.clone()))
            .collect();

        let mut result = BroadcastResult::default();
        for (identity, tx) in targets {
            if tx.try_send(message.clone()).is_ok() {
                result.successful += 1;
            } else {
                result.failed.push(identity);
            }
        }
        result
    }

    /// Number of registered components
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether `identity` is registered
    #[must_use]
    pub fn contains(&self, identity: &ComponentIdentity) -> bool {
        self.inner.read().contains_key(identity)
    }

    /// Counts by type and state
    #[must_use]
    pub fn summary(&self) -> RegistrySummary {
        let inner = self.inner.read();
        let mut summary = RegistrySummary {
            total: inner.len(),
            ..RegistrySummary::default()
        };
        for (identity, entry) in inner.iter() {
            *summary
                .by_type
                .entry(identity.component_type.to_string())
                .or_insert(0) += 1;
            *summary.by_state.entry(entry.state.to_string()).or_insert(0) += 1;
            if entry.is_eligible() {
                summary.eligible += 1;
            }
        }
        summary
    }

    fn with_owned<R>(
        &self,
        handle: &ComponentHandle,
        f: impl FnOnce(&mut ComponentEntry) -> R,
    ) -> Result<R, RegistryError> {
        let mut inner = self.inner.write();
        let entry = inner
            .get_mut(&handle.identity)
            .ok_or_else(|| RegistryError::NotFound {
                identity: handle.identity.clone(),
            })?;
        if entry.connection != handle.connection {
            return Err(RegistryError::StaleConnection {
                identity: handle.identity.clone(),
                connection: handle.connection,
            });
        }
        Ok(f(entry))
    }
}

fn apply_state(
    identity: &ComponentIdentity,
    entry: &mut ComponentEntry,
    state: LinkState,
) -> Result<LinkState, RegistryError> {
    let from = entry.state;
    if from == state {
        return Ok(from);
    }
    if !from.can_transition_to(state) {
        return Err(RegistryError::InvalidTransition {
            identity: identity.clone(),
            from,
            to: state,
        });
    }
    entry.state = state;
    tracing::info!(component = %identity, %from, to = %state, "Component state changed");
    Ok(from)
}

impl fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("ComponentRegistry")
            .field("component_count", &inner.len())
            .field("components", &inner.keys().collect::<Vec<_>>())
            .finish()
    }
}
