//! Wire Protocol
//!
//! Messages exchanged between Core and its peers. Components and operator
//! consoles speak the same protocol: the role declared in the handshake decides
//! which messages Core accepts from a connection.
//!
//! # Message Flow
//!
//! ```text
//!   Component                         Core
//!      │── Handshake ──────────────────▶│
//!      │◀──────────────── HandshakeAck ─│
//!      │◀─────── AssetSyncInstruction ──│  (when assets differ)
//!      │── AssetSyncComplete ──────────▶│
//!      │── Heartbeat ──────────────────▶│  (every heartbeat interval)
//!      │◀──────────────── HeartbeatAck ─│
//!      │◀───────────────── CueDispatch ─│
//!      │── CueAck ─────────────────────▶│  (when wait_for_ack)
//! ```
//!
//! Every message is internally tagged (`{"type": "heartbeat", "seq": 3}`).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::assets::{AssetDiff, ReportedAsset};
use crate::engine::ShowSnapshot;
use crate::opus::{AssetSpec, ComponentType};

/// Protocol version spoken by this build
pub const PROTOCOL_VERSION: u32 = 1;

/// Unique identifier for a peer connection
///
/// Assigned by Core on accept; a reconnecting component gets a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Create a new unique connection ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Identifies one cue dispatch, echoed back in `CueAck`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DispatchId(u64);

impl DispatchId {
    /// Allocate the next dispatch ID
    #[must_use]
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Get the raw numeric value
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DispatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dispatch-{}", self.0)
    }
}

/// Identifies one asset reconciliation round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncId(u64);

impl SyncId {
    /// Allocate the next sync ID
    #[must_use]
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl fmt::Display for SyncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sync-{}", self.0)
    }
}

/// Who a component is: its type plus an instance name
///
/// Unique among registered components. A component that reconnects with the
/// same identity replaces its previous registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentIdentity {
    /// Component type, matched against cue targets
    pub component_type: ComponentType,
    /// Instance name, e.g. `stage-left`
    pub instance: String,
}

impl ComponentIdentity {
    /// Create an identity
    pub fn new(component_type: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            component_type: ComponentType::new(component_type),
            instance: instance.into(),
        }
    }
}

impl fmt::Display for ComponentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.component_type, self.instance)
    }
}

/// Role a peer declares in its handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Renders cues; registered and eligible for dispatch
    Component,
    /// Drives the show; receives show state, never cues
    Operator,
}

/// Outcome a component reports for a dispatched cue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    /// The cue was executed
    Ok,
    /// The component could not execute the cue
    Failed,
}

/// Show control commands accepted from operator connections
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OperatorCommand {
    /// Begin the show at the first cue
    Start,
    /// Execute the current cue and move on
    Advance,
    /// Step the cursor back one cue without executing anything
    Back,
    /// Hold the show
    Pause,
    /// Continue a held show
    Resume,
    /// Move the cursor to a scene (and optionally a cue in it)
    Jump {
        /// Scene id
        scene: String,
        /// Cue id, first cue of the scene when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cue: Option<String>,
    },
    /// Return to idle with no cursor
    Reset,
}

impl fmt::Display for OperatorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => f.write_str("start"),
            Self::Advance => f.write_str("advance"),
            Self::Back => f.write_str("back"),
            Self::Pause => f.write_str("pause"),
            Self::Resume => f.write_str("resume"),
            Self::Jump { scene, cue: None } => write!(f, "jump {scene}"),
            Self::Jump {
                scene,
                cue: Some(cue),
            } => write!(f, "jump {scene}/{cue}"),
            Self::Reset => f.write_str("reset"),
        }
    }
}

/// Messages from a peer to Core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ComponentMessage {
    // ============================================
    // Connection Lifecycle
    // ============================================
    /// First frame on every connection
    Handshake {
        /// Must equal [`PROTOCOL_VERSION`]
        protocol_version: u32,
        /// Component or operator
        role: Role,
        /// Who is connecting
        identity: ComponentIdentity,
        /// Free-form capability tags
        #[serde(default)]
        capabilities: Vec<String>,
        /// Assets already cached locally
        #[serde(default)]
        assets: Vec<ReportedAsset>,
    },

    /// Liveness signal, sent every heartbeat interval
    Heartbeat {
        /// Sequence number, echoed in `HeartbeatAck`
        seq: u64,
    },

    /// Peer is closing the connection on purpose
    Goodbye {
        /// Optional reason for the log
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    // ============================================
    // Cues
    // ============================================
    /// Acknowledges a `CueDispatch`
    CueAck {
        /// Dispatch being acknowledged
        dispatch_id: DispatchId,
        /// Cue id, for the log
        cue_id: String,
        /// Outcome
        status: AckStatus,
        /// Failure detail
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    // ============================================
    // Asset Sync
    // ============================================
    /// The component applied an `AssetSyncInstruction`
    AssetSyncComplete {
        /// Round being completed
        sync_id: SyncId,
        /// Full local manifest after applying the diff
        assets: Vec<ReportedAsset>,
    },

    /// The component could not apply an `AssetSyncInstruction`
    AssetSyncFailed {
        /// Round that failed
        sync_id: SyncId,
        /// What went wrong
        reason: String,
    },

    /// The component's cache changed and it wants a fresh reconcile
    ResyncRequest {
        /// Current local manifest
        assets: Vec<ReportedAsset>,
    },

    // ============================================
    // Operator
    // ============================================
    /// Show control (operator role only)
    Command {
        /// What to do
        command: OperatorCommand,
    },
}

impl ComponentMessage {
    /// Short name for logging
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Handshake { .. } => "handshake",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Goodbye { .. } => "goodbye",
            Self::CueAck { .. } => "cue_ack",
            Self::AssetSyncComplete { .. } => "asset_sync_complete",
            Self::AssetSyncFailed { .. } => "asset_sync_failed",
            Self::ResyncRequest { .. } => "resync_request",
            Self::Command { .. } => "command",
        }
    }
}

/// Severity of a `Notice`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    /// Informational
    Info,
    /// Warning
    Warning,
    /// Error
    Error,
}

/// Messages from Core to a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoreMessage {
    /// Handshake accepted
    HandshakeAck {
        /// Connection ID assigned by Core
        connection_id: ConnectionId,
        /// Protocol version Core speaks
        protocol_version: u32,
        /// How often the peer should send `Heartbeat`
        heartbeat_interval_ms: u64,
    },

    /// Handshake refused; Core closes the connection after sending this
    HandshakeRejected {
        /// Why
        reason: String,
    },

    /// Reply to `Heartbeat`
    HeartbeatAck {
        /// Echoed sequence number
        seq: u64,
    },

    /// Execute a cue
    CueDispatch {
        /// Echo this in `CueAck`
        dispatch_id: DispatchId,
        /// Scene the cue belongs to
        scene_id: String,
        /// Cue id
        cue_id: String,
        /// Command name
        cmd: String,
        /// Command parameters, verbatim from the opus
        params: serde_json::Map<String, serde_json::Value>,
        /// Asset the cue plays
        #[serde(default, skip_serializing_if = "Option::is_none")]
        asset: Option<AssetSpec>,
        /// Whether Core is waiting for a `CueAck`
        wait_for_ack: bool,
    },

    /// Bring the local asset cache in line with the opus
    AssetSyncInstruction {
        /// Echo this in `AssetSyncComplete` / `AssetSyncFailed`
        sync_id: SyncId,
        /// What to add, remove and refresh
        diff: AssetDiff,
        /// Manifest entries for everything in `add` and `update`
        specs: Vec<AssetSpec>,
    },

    /// Current show state (operator role)
    ShowState {
        /// Engine snapshot
        snapshot: ShowSnapshot,
    },

    /// Outcome of an operator `Command`
    CommandResult {
        /// Whether the command was applied
        ok: bool,
        /// Human-readable outcome
        message: String,
    },

    /// Out-of-band message for the peer's log
    Notice {
        /// Severity
        level: NoticeLevel,
        /// Text
        message: String,
    },
}

impl CoreMessage {
    /// Build a notice
    pub fn notice(level: NoticeLevel, message: impl Into<String>) -> Self {
        Self::Notice {
            level,
            message: message.into(),
        }
    }

    /// Short name for logging
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::HandshakeAck { .. } => "handshake_ack",
            Self::HandshakeRejected { .. } => "handshake_rejected",
            Self::HeartbeatAck { .. } => "heartbeat_ack",
            Self::CueDispatch { .. } => "cue_dispatch",
            Self::AssetSyncInstruction { .. } => "asset_sync_instruction",
            Self::ShowState { .. } => "show_state",
            Self::CommandResult { .. } => "command_result",
            Self::Notice { .. } => "notice",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_handshake_wire_shape() {
        let raw = json!({
            "type": "handshake",
            "protocol_version": 1,
            "role": "component",
            "identity": { "component_type": "audio", "instance": "main" },
            "assets": [{ "id": "thunder", "checksum": "aaa" }]
        });

        let msg: ComponentMessage = serde_json::from_value(raw).unwrap();
        match msg {
            ComponentMessage::Handshake {
                identity,
                capabilities,
                assets,
                ..
            } => {
                assert_eq!(identity, ComponentIdentity::new("audio", "main"));
                assert!(capabilities.is_empty());
                assert_eq!(assets, vec![ReportedAsset::new("thunder").with_checksum("aaa")]);
            }
            other => panic!("expected handshake, got {other:?}"),
        }
    }

    #[test]
    fn test_operator_command_wire_shape() {
        let raw = json!({
            "type": "command",
            "command": { "op": "jump", "scene": "act-2" }
        });
        let msg: ComponentMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(
            msg,
            ComponentMessage::Command {
                command: OperatorCommand::Jump {
                    scene: "act-2".to_string(),
                    cue: None,
                }
            }
        );
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let raw = json!({ "type": "teleport" });
        assert!(serde_json::from_value::<ComponentMessage>(raw).is_err());
    }

    #[test]
    fn test_cue_dispatch_serializes_tag() {
        let msg = CoreMessage::CueDispatch {
            dispatch_id: DispatchId::next(),
            scene_id: "act-1".to_string(),
            cue_id: "boom".to_string(),
            cmd: "play".to_string(),
            params: serde_json::Map::new(),
            asset: None,
            wait_for_ack: true,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "cue_dispatch");
        assert_eq!(value["cue_id"], "boom");
        assert!(value.get("asset").is_none());
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(DispatchId::next(), DispatchId::next());
        assert_ne!(ConnectionId::new(), ConnectionId::new());
        assert!(ConnectionId::new().to_string().starts_with("conn-"));
    }

    #[test]
    fn test_command_display() {
        let jump = OperatorCommand::Jump {
            scene: "act-2".to_string(),
            cue: Some("storm".to_string()),
        };
        assert_eq!(jump.to_string(), "jump act-2/storm");
        assert_eq!(OperatorCommand::Advance.to_string(), "advance");
    }
}
