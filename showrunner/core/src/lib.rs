//! Showrunner Core - Opus Execution for Live-Performance Rigs
//!
//! This crate loads a declarative show script (the *opus*), keeps track of
//! the peripheral processes (*components*) that render it, and steps through
//! its cues on operator command. It has no knowledge of audio, lighting or
//! video: components interpret cue commands, Core only sequences them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Components & Operators                      │
//! │  ┌─────────┐  ┌──────────┐  ┌─────────┐  ┌───────────────────┐  │
//! │  │  audio  │  │ lighting │  │  video  │  │ operator console  │  │
//! │  └────┬────┘  └────┬─────┘  └────┬────┘  └─────────┬─────────┘  │
//! │       └────────────┴─────────────┴─────────────────┘            │
//! │                            │                                    │
//! │                 ComponentMessage (up)                           │
//! │                    CoreMessage (down)                           │
//! └────────────────────────────┼────────────────────────────────────┘
//!                              │ framed TCP
//! ┌────────────────────────────┼────────────────────────────────────┐
//! │                       SHOWRUNNER CORE                           │
//! │            ┌───────────────┴───────────────┐                    │
//! │            │  ConnectionManager (per conn) │                    │
//! │            └───┬──────────────┬────────────┘                    │
//! │                │              │                                 │
//! │   ┌────────────▼───┐   ┌──────▼─────────┐   ┌────────────────┐  │
//! │   │   Component    │◀──│ SyncCoordinator│   │   ShowEngine   │  │
//! │   │   Registry     │   └────────────────┘   │ (owning task)  │  │
//! │   └────────▲───────┘                        └───────┬────────┘  │
//! │            └──────────── reads recipients ──────────┘           │
//! │                                                                 │
//! │   Opus (immutable, Arc)  ·  AssetIndex (pure)  ·  AckBoard      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Opus`]: Validated, immutable show script
//! - [`ComponentRegistry`]: Who is connected and who may receive cues
//! - [`ShowEngine`]: The cue sequencer, driven through an [`EngineHandle`]
//! - [`ConnectionManager`]: Handshake, heartbeats and message routing per peer
//! - [`SyncCoordinator`]: Asset cache reconciliation
//!
//! # Module Overview
//!
//! - [`opus`]: Opus model, parsing and validation
//! - [`assets`]: Asset requirements and cache diffs
//! - [`registry`]: Component registry and liveness states
//! - [`protocol`]: Wire messages
//! - [`transport`]: Length-prefixed, checksummed framing
//! - [`connection`]: Per-connection lifecycle
//! - [`sync`]: Asset sync coordinator
//! - [`engine`]: Show execution engine
//! - [`config`]: Layered configuration

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod assets;
pub mod config;
pub mod connection;
pub mod engine;
pub mod opus;
pub mod protocol;
pub mod registry;
pub mod sync;
pub mod transport;

// Opus exports
pub use opus::{
    AssetRef, AssetSpec, ComponentType, Cue, CueAction, CuePayload, CuePosition, InternalAction,
    IssueKind, NamedAction, Opus, OpusError, Scene, ValidationError, ValidationFailurePolicy,
    ValidationIssue,
};

// Asset exports
pub use assets::{AssetDiff, AssetIndex, ReportedAsset};

// Registry exports
pub use registry::{
    BroadcastResult, ComponentFilter, ComponentHandle, ComponentRegistry, ComponentSnapshot,
    LinkState, Registration, RegistryError, RegistrySummary, SyncStatus,
};

// Protocol exports
pub use protocol::{
    AckStatus, ComponentIdentity, ComponentMessage, ConnectionId, CoreMessage, DispatchId,
    NoticeLevel, OperatorCommand, Role, SyncId, PROTOCOL_VERSION,
};

// Connection exports
pub use connection::{
    CloseReason, ConnectionContext, ConnectionError, ConnectionManager, ProtocolError,
};

// Engine exports
pub use engine::{
    AckBoard, AckFailure, AckFailurePolicy, AckFailureReason, DispatchReport, EngineConfig,
    EngineError, EngineHandle, RunState, ShowCursor, ShowEngine, ShowSnapshot,
};

// Sync exports
pub use sync::{SyncCoordinator, SyncError};

// Config exports
pub use config::{ConfigError, CoreConfig};
