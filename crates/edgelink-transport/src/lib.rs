//! Transport abstraction for the control channel
//!
//! The tunnel core never talks to a socket for its control session; it
//! consumes a [`ControlTransport`], a reliable, ordered, message-oriented
//! session with its own framing and reconnection logic. Reconnection is
//! the implementation's duty and surfaces here only as alternating
//! [`ChannelEvent::Connected`] / [`ChannelEvent::Disconnected`] events.
//!
//! The bundled [`memory`] transport connects a client to a scripted peer
//! inside one process; it backs the test suites and embedders that host
//! both ends themselves.

use async_trait::async_trait;
use std::fmt::Debug;
use thiserror::Error;

use edgelink_proto::Envelope;

pub mod memory;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Transport closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Events surfaced by a control transport.
#[derive(Debug)]
pub enum ChannelEvent {
    /// The session to the edge server is established (or re-established).
    Connected,

    /// The session dropped; the transport keeps retrying in the
    /// background and will report `Connected` again on success.
    Disconnected,

    /// One inbound control message.
    Message(Envelope),

    /// The transport is permanently closed and produces no more events.
    Closed,
}

/// One persistent control session to an edge server.
///
/// Implementations must deliver messages in order and own their
/// reconnection policy.
#[async_trait]
pub trait ControlTransport: Send + Debug {
    /// Wait for the next transport event.
    async fn next_event(&mut self) -> TransportResult<ChannelEvent>;

    /// Send one envelope to the edge server.
    async fn send(&mut self, envelope: Envelope) -> TransportResult<()>;
}

/// Client identity material presented at the transport level.
///
/// Opaque PEM blobs; issuance and storage live outside this system.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    pub ca_pem: Option<Vec<u8>>,
}

/// Establishes control sessions to an edge server.
#[async_trait]
pub trait ControlConnector: Send + Sync + Debug {
    /// Dial `edge_hostname`, presenting the optional client identity at
    /// the transport level.
    async fn connect(
        &self,
        edge_hostname: &str,
        identity: Option<&ClientIdentity>,
    ) -> TransportResult<Box<dyn ControlTransport>>;
}
