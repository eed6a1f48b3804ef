//! Handshake validation
//!
//! The first frame on a connection decides whether Core talks to it at all.

use crate::assets::ReportedAsset;
use crate::protocol::{ComponentIdentity, ComponentMessage, Role, PROTOCOL_VERSION};

/// Protocol violations by a peer
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The first frame was not a handshake
    #[error("expected a handshake as the first frame, got `{kind}`")]
    UnexpectedFirstFrame {
        /// Message type received
        kind: String,
    },

    /// The peer speaks another protocol version
    #[error("protocol version {got} is not supported (expected {expected})")]
    VersionMismatch {
        /// Version Core speaks
        expected: u32,
        /// Version the peer sent
        got: u32,
    },

    /// Type or instance name is blank
    #[error("component identity must have a non-empty type and instance")]
    EmptyIdentity,

    /// The peer claimed the reserved `internal` type
    #[error("component type `internal` is reserved for Core")]
    ReservedComponentType,

    /// A component-role connection sent an operator command
    #[error("component {identity} may not send operator commands")]
    CommandFromComponent {
        /// Offending component
        identity: ComponentIdentity,
    },

    /// The frame could not be decoded as a message
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The peer hung up before sending a handshake
    #[error("connection closed before handshake")]
    ClosedBeforeHandshake,
}

/// An accepted handshake
#[derive(Debug, Clone, PartialEq)]
pub struct Handshake {
    /// Declared role
    pub role: Role,
    /// Declared identity
    pub identity: ComponentIdentity,
    /// Capability tags
    pub capabilities: Vec<String>,
    /// Locally cached assets
    pub assets: Vec<ReportedAsset>,
}

/// Check the first frame of a connection
///
/// # Errors
///
/// `UnexpectedFirstFrame`, `VersionMismatch`, `EmptyIdentity` or
/// `ReservedComponentType`.
pub fn validate_handshake(message: ComponentMessage) -> Result<Handshake, ProtocolError> {
    let (protocol_version, role, identity, capabilities, assets) = match message {
        ComponentMessage::Handshake {
            protocol_version,
            role,
            identity,
            capabilities,
            assets,
        } => (protocol_version, role, identity, capabilities, assets),
        other => {
            return Err(ProtocolError::UnexpectedFirstFrame {
                kind: other.kind().to_string(),
            })
        }
    };

    if protocol_version != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            got: protocol_version,
        });
    }
    if identity.component_type.as_str().trim().is_empty() || identity.instance.trim().is_empty() {
        return Err(ProtocolError::EmptyIdentity);
    }
    if role == Role::Component && identity.component_type.is_internal() {
        return Err(ProtocolError::ReservedComponentType);
    }

    Ok(Handshake {
        role,
        identity,
        capabilities,
        assets,
    })
}
