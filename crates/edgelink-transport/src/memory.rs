//! In-process control transport
//!
//! [`pair`] connects a [`MemoryTransport`] (the client end) to a
//! [`MemoryPeer`] (the edge end) over unbounded channels. The peer side
//! scripts the edge server: it injects session events and inbound
//! messages, and collects everything the client sends.

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use edgelink_proto::Envelope;

use crate::{
    ChannelEvent, ClientIdentity, ControlConnector, ControlTransport, TransportError,
    TransportResult,
};

/// Create a connected transport/peer pair.
pub fn pair() -> (MemoryTransport, MemoryPeer) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    (
        MemoryTransport {
            events: event_rx,
            outbound: outbound_tx,
        },
        MemoryPeer {
            events: event_tx,
            outbound: outbound_rx,
        },
    )
}

/// Client end of an in-process control session.
#[derive(Debug)]
pub struct MemoryTransport {
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    outbound: mpsc::UnboundedSender<Envelope>,
}

#[async_trait]
impl ControlTransport for MemoryTransport {
    async fn next_event(&mut self) -> TransportResult<ChannelEvent> {
        // A dropped peer is a permanent close.
        Ok(self.events.recv().await.unwrap_or(ChannelEvent::Closed))
    }

    async fn send(&mut self, envelope: Envelope) -> TransportResult<()> {
        self.outbound
            .send(envelope)
            .map_err(|_| TransportError::Closed)
    }
}

/// Edge end of an in-process control session.
#[derive(Debug)]
pub struct MemoryPeer {
    events: mpsc::UnboundedSender<ChannelEvent>,
    outbound: mpsc::UnboundedReceiver<Envelope>,
}

impl MemoryPeer {
    /// Signal that the session is established.
    pub fn connect_session(&self) {
        let _ = self.events.send(ChannelEvent::Connected);
    }

    /// Signal that the session dropped.
    pub fn disconnect_session(&self) {
        let _ = self.events.send(ChannelEvent::Disconnected);
    }

    /// Signal a permanent transport close.
    pub fn close_session(&self) {
        let _ = self.events.send(ChannelEvent::Closed);
    }

    /// Deliver one inbound message to the client.
    pub fn send(&self, message: impl Into<Envelope>) {
        let _ = self.events.send(ChannelEvent::Message(message.into()));
    }

    /// Receive the next envelope the client sent, or `None` once the
    /// client end is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.outbound.recv().await
    }

    /// Receive without waiting.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.outbound.try_recv().ok()
    }
}

/// Connector handing a pre-built [`MemoryTransport`] to the first dial.
#[derive(Debug)]
pub struct MemoryConnector {
    transport: Mutex<Option<MemoryTransport>>,
}

impl MemoryConnector {
    pub fn new(transport: MemoryTransport) -> Self {
        Self {
            transport: Mutex::new(Some(transport)),
        }
    }
}

#[async_trait]
impl ControlConnector for MemoryConnector {
    async fn connect(
        &self,
        edge_hostname: &str,
        _identity: Option<&ClientIdentity>,
    ) -> TransportResult<Box<dyn ControlTransport>> {
        debug!(edge_hostname = %edge_hostname, "Dialing in-process transport");

        self.transport
            .lock()
            .await
            .take()
            .map(|transport| Box::new(transport) as Box<dyn ControlTransport>)
            .ok_or_else(|| {
                TransportError::Connection("in-process transport already taken".to_string())
            })
    }
}
