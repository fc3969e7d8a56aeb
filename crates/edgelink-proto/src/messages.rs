//! Control message types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier for one logical connection multiplexed over the control
/// channel.
///
/// Issued by the edge server, opaque to the client, unique for the
/// lifetime of the connection and never reused while still mapped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Registration acknowledgment data carried by `HostRegistered`.
///
/// The edge server may attach further fields; anything beyond these is
/// opaque to the client core and dropped at this boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRegistration {
    pub hostname: String,
    #[serde(default)]
    pub uid: Option<String>,
}

/// Control protocol message enum
///
/// Direction is fixed per kind; a message of an outbound-only kind arriving
/// from the edge server is a peer bug and handled as a logged no-op.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ControlMessage {
    /// Client → edge: announce which hostname this client serves. Sent
    /// exactly once per connection episode.
    RegisterServer {
        hostname: String,
        server_type: String,
    },

    /// Edge → client: a new logical connection was accepted upstream;
    /// open the local side for it.
    CreateConnection { connection_id: ConnectionId },

    /// Both directions: one ordered chunk of payload for a connection.
    Data {
        connection_id: ConnectionId,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },

    /// Edge → client: the edge-side socket for this connection failed.
    SocketError { connection_id: ConnectionId },

    /// Edge → client: end a connection after a short grace. A missing id
    /// is ignored.
    End { connection_id: Option<ConnectionId> },

    /// Client → edge: the local side closed; release the peer socket.
    DisconnectClient { connection_id: ConnectionId },

    /// Client → edge: abandon the peer socket immediately, no close
    /// handshake will follow.
    CutClient { connection_id: ConnectionId },

    /// Client → edge: report a local failure for this connection.
    ConnectionError {
        connection_id: ConnectionId,
        error: String,
    },

    /// Edge → client: the hostname is live on the edge server.
    HostRegistered { registration: HostRegistration },
}

/// Envelope wrapping every control message on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    /// Error description attached by the sender, if any.
    pub error: Option<String>,
    pub payload: ControlMessage,
}

impl Envelope {
    pub fn new(payload: ControlMessage) -> Self {
        Self {
            error: None,
            payload,
        }
    }

    pub fn with_error(payload: ControlMessage, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            payload,
        }
    }
}

impl From<ControlMessage> for Envelope {
    fn from(payload: ControlMessage) -> Self {
        Self::new(payload)
    }
}

// Custom serde helper for byte payloads
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}
