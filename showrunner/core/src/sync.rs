//! Asset Sync Coordinator
//!
//! Brings each component's asset cache in line with the opus before it may
//! receive cues.
//!
//! # Flow
//!
//! ```text
//!   reconcile(handle)
//!       │
//!       ├─ sync disabled / no opus ──────────────▶ synced
//!       ├─ diff empty ───────────────────────────▶ synced
//!       └─ diff non-empty
//!             │  AssetSyncInstruction ──▶ component      status: syncing
//!             │
//!             ├─ AssetSyncComplete ──────────────▶ synced, manifest updated
//!             └─ AssetSyncFailed / timeout ──────▶ failed, degraded
//!                                                  (retried on next heartbeat)
//! ```
//!
//! `reconcile` suspends while the component works, so connection tasks spawn
//! it instead of awaiting it in their read loop. The replies arrive through
//! [`SyncCoordinator::complete`] and [`SyncCoordinator::fail`].

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::assets::{AssetDiff, AssetIndex, ReportedAsset};
use crate::opus::Opus;
use crate::protocol::{ComponentIdentity, ConnectionId, CoreMessage, SyncId};
use crate::registry::{ComponentHandle, ComponentRegistry, LinkState, RegistryError, SyncStatus};

/// Errors from a reconciliation round
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// The component reported it could not apply the instruction
    #[error("asset sync failed for {component}: {reason}")]
    Failed {
        /// Component
        component: ComponentIdentity,
        /// Reported reason
        reason: String,
    },

    /// No completion within the sync timeout
    #[error("asset sync for {component} timed out after {after:?}")]
    Timeout {
        /// Component
        component: ComponentIdentity,
        /// Configured timeout
        after: Duration,
    },

    /// The component is not connected
    #[error("component {component} is {state}, cannot sync")]
    NotReady {
        /// Component
        component: ComponentIdentity,
        /// Its liveness state
        state: LinkState,
    },

    /// The round was superseded by a newer one or the connection closed
    #[error("asset sync for {component} was cancelled")]
    Cancelled {
        /// Component
        component: ComponentIdentity,
    },

    /// Registry refused the update
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug)]
enum SyncReply {
    Complete(Vec<ReportedAsset>),
    Failed(String),
}

#[derive(Debug)]
struct PendingSync {
    sync_id: SyncId,
    connection: ConnectionId,
    reply: oneshot::Sender<SyncReply>,
}

/// Drives asset reconciliation for connected components
///
/// Cheap to clone; clones share pending rounds.
#[derive(Debug, Clone)]
pub struct SyncCoordinator {
    registry: ComponentRegistry,
    opus: Option<Arc<Opus>>,
    enabled: bool,
    timeout: Duration,
    pending: Arc<DashMap<ComponentIdentity, PendingSync>>,
}

impl SyncCoordinator {
    /// Create a coordinator
    ///
    /// With `enabled` false, or no opus, every component is synced as soon as
    /// it registers.
    #[must_use]
    pub fn new(
        registry: ComponentRegistry,
        opus: Option<Arc<Opus>>,
        enabled: bool,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            opus,
            enabled,
            timeout,
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Whether asset reconciliation is switched on
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Reconcile one component against the opus
    ///
    /// Returns the diff that was applied (empty when nothing had to change).
    ///
    /// # Errors
    ///
    /// `Failed` / `Timeout` after marking the component failed and degraded,
    /// `NotReady` if it is not connected, `Cancelled` if a newer round or a
    /// disconnect took over, `Registry` if the handle is stale.
    pub async fn reconcile(&self, handle: &ComponentHandle) -> Result<AssetDiff, SyncError> {
        // A newer round always wins, even one that needs no instruction
        self.cancel(handle);

        let opus = match (&self.opus, self.enabled) {
            (Some(opus), true) => Arc::clone(opus),
            _ => {
                self.mark_synced(handle)?;
                return Ok(AssetDiff::default());
            }
        };

        let snapshot = self.registry.lookup(&handle.identity)?;
        if snapshot.connection != handle.connection {
            return Err(RegistryError::StaleConnection {
                identity: handle.identity.clone(),
                connection: handle.connection,
            }
            .into());
        }
        if !snapshot.state.is_live() {
            return Err(SyncError::NotReady {
                component: handle.identity.clone(),
                state: snapshot.state,
            });
        }

        let diff = AssetIndex::diff(&opus, &handle.identity.component_type, &snapshot.manifest);
        if diff.is_empty() {
            tracing::debug!(component = %handle.identity, "Assets already in sync");
            self.mark_synced(handle)?;
            return Ok(diff);
        }

        let sync_id = SyncId::next();
        let (reply, rx) = oneshot::channel();
        // Replacing an older round drops its sender, which cancels it
        self.pending.insert(
            handle.identity.clone(),
            PendingSync {
                sync_id,
                connection: handle.connection,
                reply,
            },
        );
        self.registry.set_sync_status(handle, SyncStatus::Syncing)?;

        let specs = diff
            .add
            .iter()
            .chain(&diff.update)
            .filter_map(|id| opus.asset(id).cloned())
            .collect();
        tracing::info!(
            component = %handle.identity,
            %sync_id,
            add = diff.add.len(),
            remove = diff.remove.len(),
            update = diff.update.len(),
            "Sending asset sync instruction"
        );
        let sent = self.registry.send_to(
            &handle.identity,
            CoreMessage::AssetSyncInstruction {
                sync_id,
                diff: diff.clone(),
                specs,
            },
        );
        if !sent {
            if !self.forget(&handle.identity, sync_id) {
                return Err(SyncError::Cancelled {
                    component: handle.identity.clone(),
                });
            }
            return Err(self.failed(handle, "instruction could not be queued".to_string()));
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(SyncReply::Complete(assets))) => {
                self.registry.update_manifest(handle, assets)?;
                self.mark_synced(handle)?;
                tracing::info!(component = %handle.identity, %sync_id, "Asset sync complete");
                Ok(diff)
            }
            Ok(Ok(SyncReply::Failed(reason))) => Err(self.failed(handle, reason)),
            Ok(Err(_)) => {
                tracing::debug!(component = %handle.identity, %sync_id, "Asset sync cancelled");
                Err(SyncError::Cancelled {
                    component: handle.identity.clone(),
                })
            }
            Err(_) => {
                if !self.forget(&handle.identity, sync_id) {
                    tracing::debug!(component = %handle.identity, %sync_id, "Superseded asset sync expired");
                    return Err(SyncError::Cancelled {
                        component: handle.identity.clone(),
                    });
                }
                self.mark_failed(handle);
                tracing::warn!(
                    component = %handle.identity,
                    %sync_id,
                    after = ?self.timeout,
                    "Asset sync timed out"
                );
                Err(SyncError::Timeout {
                    component: handle.identity.clone(),
                    after: self.timeout,
                })
            }
        }
    }

    /// Deliver `AssetSyncComplete`
    ///
    /// Returns false if no matching round is pending (stale or unknown id).
    pub fn complete(
        &self,
        handle: &ComponentHandle,
        sync_id: SyncId,
        assets: Vec<ReportedAsset>,
    ) -> bool {
        self.reply(handle, sync_id, SyncReply::Complete(assets))
    }

    /// Deliver `AssetSyncFailed`
    ///
    /// Returns false if no matching round is pending.
    pub fn fail(&self, handle: &ComponentHandle, sync_id: SyncId, reason: String) -> bool {
        self.reply(handle, sync_id, SyncReply::Failed(reason))
    }

    /// Whether a round is in flight for `identity`
    #[must_use]
    pub fn is_pending(&self, identity: &ComponentIdentity) -> bool {
        self.pending.contains_key(identity)
    }

    /// Whether the component's last round failed and nothing is in flight
    #[must_use]
    pub fn needs_retry(&self, handle: &ComponentHandle) -> bool {
        self.enabled
            && !self.is_pending(&handle.identity)
            && self
                .registry
                .lookup(&handle.identity)
                .is_ok_and(|s| s.connection == handle.connection && s.sync == SyncStatus::Failed)
    }

    /// Drop the round owned by `handle`'s connection, if any
    pub fn cancel(&self, handle: &ComponentHandle) {
        self.pending
            .remove_if(&handle.identity, |_, p| p.connection == handle.connection);
    }

    fn reply(&self, handle: &ComponentHandle, sync_id: SyncId, reply: SyncReply) -> bool {
        let taken = self.pending.remove_if(&handle.identity, |_, p| {
            p.sync_id == sync_id && p.connection == handle.connection
        });
        match taken {
            Some((_, pending)) => pending.reply.send(reply).is_ok(),
            None => {
                tracing::debug!(component = %handle.identity, %sync_id, "Reply for unknown sync round");
                false
            }
        }
    }

    /// Returns false when the round was no longer pending
    fn forget(&self, identity: &ComponentIdentity, sync_id: SyncId) -> bool {
        self.pending
            .remove_if(identity, |_, p| p.sync_id == sync_id)
            .is_some()
    }

    fn failed(&self, handle: &ComponentHandle, reason: String) -> SyncError {
        self.mark_failed(handle);
        tracing::warn!(component = %handle.identity, reason = %reason, "Asset sync failed");
        SyncError::Failed {
            component: handle.identity.clone(),
            reason,
        }
    }

    /// Synced, and back to ready if an earlier failed round degraded it
    fn mark_synced(&self, handle: &ComponentHandle) -> Result<(), RegistryError> {
        self.registry.set_sync_status(handle, SyncStatus::Synced)?;
        let degraded = self
            .registry
            .lookup(&handle.identity)
            .is_ok_and(|s| s.state == LinkState::Degraded);
        if degraded {
            let _ = self.registry.transition(handle, LinkState::Ready);
        }
        Ok(())
    }

    fn mark_failed(&self, handle: &ComponentHandle) {
        let _ = self.registry.set_sync_status(handle, SyncStatus::Failed);
        let _ = self.registry.transition(handle, LinkState::Degraded);
    }
}
