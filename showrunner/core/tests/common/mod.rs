//! Shared test rig: a fully wired Core served over in-memory duplex streams.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

use showrunner_core::transport::{encode, FrameReader, TransportConfig};
use showrunner_core::{
    AckBoard, AckFailurePolicy, CloseReason, ComponentIdentity, ComponentMessage,
    ComponentRegistry, ConnectionContext, ConnectionError, ConnectionId, ConnectionManager,
    CoreMessage, EngineConfig, EngineHandle, OperatorCommand, Opus, ReportedAsset, Role,
    ShowEngine, ShowSnapshot, SyncCoordinator, PROTOCOL_VERSION,
};

/// Two scenes, two cues each, alternating audio and lighting
pub const TWO_BY_TWO: &str = r"
version: 1
components: [audio, lighting]
scenes:
  - id: act-1
    cues:
      - { id: rain, target: audio, action: { cmd: play } }
      - { id: dim, target: lighting, action: { cmd: fade, params: { level: 20 } } }
  - id: act-2
    cues:
      - { id: thunder, target: audio, action: { cmd: play } }
      - { id: blackout, target: lighting, action: { cmd: fade, params: { level: 0 } } }
";

pub struct RigOptions {
    pub sync_assets: bool,
    pub sync_timeout: Duration,
    pub engine: EngineConfig,
}

impl Default for RigOptions {
    fn default() -> Self {
        Self {
            sync_assets: false,
            sync_timeout: Duration::from_secs(5),
            engine: EngineConfig::default(),
        }
    }
}

pub struct Rig {
    pub manager: ConnectionManager,
    pub registry: ComponentRegistry,
    pub engine: EngineHandle,
    pub acks: AckBoard,
    pub engine_task: JoinHandle<()>,
}

impl Rig {
    pub fn new(opus_yaml: &str) -> Self {
        Self::with_options(opus_yaml, RigOptions::default())
    }

    pub fn with_policy(opus_yaml: &str, ack_policy: AckFailurePolicy) -> Self {
        Self::with_options(
            opus_yaml,
            RigOptions {
                engine: EngineConfig {
                    ack_policy,
                    ..EngineConfig::default()
                },
                ..RigOptions::default()
            },
        )
    }

    pub fn with_options(opus_yaml: &str, options: RigOptions) -> Self {
        init_tracing();
        let opus: Arc<Opus> = Arc::new(showrunner_core::opus::parse(opus_yaml).unwrap());
        let registry = ComponentRegistry::new();
        let acks = AckBoard::new();
        let engine = ShowEngine::new(
            Some(Arc::clone(&opus)),
            registry.clone(),
            acks.clone(),
            options.engine,
        );
        let (engine, engine_task) = EngineHandle::spawn(engine);
        let sync = SyncCoordinator::new(
            registry.clone(),
            Some(Arc::clone(&opus)),
            options.sync_assets,
            options.sync_timeout,
        );
        let manager = ConnectionManager::new(ConnectionContext {
            registry: registry.clone(),
            sync,
            acks: acks.clone(),
            engine: engine.clone(),
            opus: Some(opus),
            config: TransportConfig::default(),
        });
        Self {
            manager,
            registry,
            engine,
            acks,
            engine_task,
        }
    }

    /// Open a connection without handshaking
    pub fn connect(&self) -> Peer {
        let (client, server) = tokio::io::duplex(256 * 1024);
        let manager = self.manager.clone();
        let task = tokio::spawn(async move { manager.serve(ConnectionId::new(), server).await });
        let (read_half, write_half) = tokio::io::split(client);
        Peer {
            reader: FrameReader::new(read_half),
            writer: write_half,
            task,
        }
    }

    /// Connect a component and complete its handshake
    pub async fn component(&self, component_type: &str, instance: &str) -> Peer {
        self.component_with_assets(component_type, instance, vec![])
            .await
    }

    pub async fn component_with_assets(
        &self,
        component_type: &str,
        instance: &str,
        assets: Vec<ReportedAsset>,
    ) -> Peer {
        let mut peer = self.connect();
        peer.send(&ComponentMessage::Handshake {
            protocol_version: PROTOCOL_VERSION,
            role: Role::Component,
            identity: ComponentIdentity::new(component_type, instance),
            capabilities: vec![],
            assets,
        })
        .await;
        assert!(matches!(peer.recv().await, CoreMessage::HandshakeAck { .. }));
        peer
    }

    /// Connect a component and wait until it may receive cues
    pub async fn eligible_component(&self, component_type: &str, instance: &str) -> Peer {
        let peer = self.component(component_type, instance).await;
        self.wait_eligible(&ComponentIdentity::new(component_type, instance))
            .await;
        peer
    }

    pub async fn wait_eligible(&self, identity: &ComponentIdentity) {
        eventually(|| {
            self.registry
                .lookup(identity)
                .is_ok_and(|snapshot| snapshot.is_eligible())
        })
        .await;
    }

    /// Connect an operator and consume the initial show state
    pub async fn operator(&self) -> Operator {
        let mut peer = self.connect();
        peer.send(&ComponentMessage::Handshake {
            protocol_version: PROTOCOL_VERSION,
            role: Role::Operator,
            identity: ComponentIdentity::new("console", "booth"),
            capabilities: vec![],
            assets: vec![],
        })
        .await;
        assert!(matches!(peer.recv().await, CoreMessage::HandshakeAck { .. }));
        let CoreMessage::ShowState { snapshot } = peer.recv().await else {
            panic!("operator should receive the show state first");
        };
        Operator {
            peer,
            last_state: snapshot,
        }
    }
}

pub struct Peer {
    pub reader: FrameReader<ReadHalf<DuplexStream>>,
    pub writer: WriteHalf<DuplexStream>,
    pub task: JoinHandle<Result<CloseReason, ConnectionError>>,
}

impl Peer {
    pub async fn send(&mut self, message: &ComponentMessage) {
        self.send_raw(&encode(message).unwrap()).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    pub async fn recv(&mut self) -> CoreMessage {
        tokio::time::timeout(Duration::from_secs(5), self.reader.next())
            .await
            .expect("timed out waiting for a message")
            .unwrap()
            .expect("connection closed")
    }

    /// Next message other than heartbeat acks and notices
    pub async fn recv_significant(&mut self) -> CoreMessage {
        loop {
            match self.recv().await {
                CoreMessage::HeartbeatAck { .. } | CoreMessage::Notice { .. } => {}
                other => return other,
            }
        }
    }

    /// Next cue dispatch, returning `(dispatch_id, scene/cue)`
    pub async fn recv_cue(&mut self) -> (showrunner_core::DispatchId, String) {
        match self.recv_significant().await {
            CoreMessage::CueDispatch {
                dispatch_id,
                scene_id,
                cue_id,
                ..
            } => (dispatch_id, format!("{scene_id}/{cue_id}")),
            other => panic!("expected a cue dispatch, got {other:?}"),
        }
    }

    /// Assert nothing arrives for a short while
    pub async fn assert_silent(&mut self) {
        let next = tokio::time::timeout(
            Duration::from_millis(100),
            self.reader.next::<CoreMessage>(),
        )
        .await;
        assert!(next.is_err(), "unexpected message: {next:?}");
    }

    pub async fn goodbye(mut self) -> Result<CloseReason, ConnectionError> {
        self.send(&ComponentMessage::Goodbye { reason: None }).await;
        self.task.await.unwrap()
    }
}

pub struct Operator {
    pub peer: Peer,
    pub last_state: ShowSnapshot,
}

impl Operator {
    /// Send a command and return `(ok, message)` from its result
    pub async fn command(&mut self, command: OperatorCommand) -> (bool, String) {
        self.peer
            .send(&ComponentMessage::Command { command })
            .await;
        loop {
            match self.peer.recv().await {
                CoreMessage::CommandResult { ok, message } => return (ok, message),
                CoreMessage::ShowState { snapshot } => self.last_state = snapshot,
                _ => {}
            }
        }
    }
}

/// Route logs to the test harness; filter with `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds (panics after five seconds)
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not reached in time");
}
