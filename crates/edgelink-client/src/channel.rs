//! Control channel
//!
//! Owns the single persistent session to the edge server: dispatches
//! inbound control messages, funnels every outbound message through one
//! place, and recovers table state when the session drops.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use edgelink_proto::{ConnectionId, ControlMessage, Envelope, HostRegistration};
use edgelink_transport::{ChannelEvent, ControlTransport};

use crate::config::TunnelConfig;
use crate::connector::LocalConnector;
use crate::table::ConnectionTable;

/// Connection state of the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    /// `register_server` has been sent for the current episode. Purely
    /// advisory for observers; no behavior gates on it.
    Registered,
}

/// Lifecycle callbacks exposed to the embedding application.
///
/// Each hook fires at most once per the cardinality of its event:
/// `on_connect` and `on_local_server_created` once per connection
/// episode, `on_connection` once per created connection.
#[derive(Clone, Default)]
pub struct TunnelEvents {
    pub(crate) on_connect: Option<Arc<dyn Fn() + Send + Sync>>,
    pub(crate) on_local_server_created: Option<Arc<dyn Fn(HostRegistration) + Send + Sync>>,
    pub(crate) on_connection: Option<Arc<dyn Fn(ConnectionId) + Send + Sync>>,
}

impl TunnelEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invoked when the channel (re)connects to the edge server.
    pub fn on_connect(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(hook));
        self
    }

    /// Invoked when the edge server confirms the hostname is live.
    pub fn on_local_server_created(
        mut self,
        hook: impl Fn(HostRegistration) + Send + Sync + 'static,
    ) -> Self {
        self.on_local_server_created = Some(Arc::new(hook));
        self
    }

    /// Invoked for every logical connection opened on the local side.
    pub fn on_connection(mut self, hook: impl Fn(ConnectionId) + Send + Sync + 'static) -> Self {
        self.on_connection = Some(Arc::new(hook));
        self
    }
}

impl std::fmt::Debug for TunnelEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelEvents")
            .field("on_connect", &self.on_connect.is_some())
            .field(
                "on_local_server_created",
                &self.on_local_server_created.is_some(),
            )
            .field("on_connection", &self.on_connection.is_some())
            .finish()
    }
}

/// Manages the persistent control session for one tunnel client.
pub struct ControlChannel {
    config: TunnelConfig,
    table: ConnectionTable,
    connector: LocalConnector,
    events: TunnelEvents,
    state_tx: watch::Sender<ChannelState>,
    shutdown: CancellationToken,
    /// `hostRegistered` one-shot for the current connection episode.
    host_registered_fired: bool,
}

impl ControlChannel {
    pub(crate) fn new(
        config: TunnelConfig,
        table: ConnectionTable,
        connector: LocalConnector,
        events: TunnelEvents,
        state_tx: watch::Sender<ChannelState>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            table,
            connector,
            events,
            state_tx,
            shutdown,
            host_registered_fired: false,
        }
    }

    fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ChannelState) {
        let _ = self.state_tx.send(state);
    }

    /// Run the channel until shutdown or permanent transport close.
    pub(crate) async fn run(
        mut self,
        mut transport: Box<dyn ControlTransport>,
        mut outbound_rx: mpsc::UnboundedReceiver<ControlMessage>,
    ) {
        let shutdown = self.shutdown.clone();
        self.set_state(ChannelState::Connecting);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Control channel shutting down");
                    break;
                }

                event = transport.next_event() => match event {
                    Ok(ChannelEvent::Connected) => self.handle_connected(&mut *transport).await,
                    Ok(ChannelEvent::Disconnected) => self.handle_disconnected(),
                    Ok(ChannelEvent::Message(envelope)) => self.handle_message(envelope).await,
                    Ok(ChannelEvent::Closed) => {
                        info!("Control transport closed");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "Control transport failed");
                        break;
                    }
                },

                Some(message) = outbound_rx.recv() => {
                    self.send_outbound(&mut *transport, message).await;
                }
            }
        }

        self.set_state(ChannelState::Disconnected);

        // The channel is gone for good; anything still mapped would leak.
        for (id, handle) in self.table.drain_all().await {
            debug!(connection_id = %id, "Force-closing connection at channel teardown");
            handle.force_terminate();
        }
    }

    async fn handle_connected(&mut self, transport: &mut dyn ControlTransport) {
        if matches!(
            self.state(),
            ChannelState::Connected | ChannelState::Registered
        ) {
            // Duplicate connect notification from the transport; the
            // episode is already set up.
            debug!("Ignoring duplicate connect event");
            return;
        }

        self.set_state(ChannelState::Connected);
        self.host_registered_fired = false;

        let registration = &self.config.registration;
        info!(
            hostname = %registration.server_fqdn,
            server_type = %registration.server_type,
            "Control channel connected, registering server"
        );

        let register = ControlMessage::RegisterServer {
            hostname: registration.server_fqdn.clone(),
            server_type: registration.server_type.clone(),
        };
        match transport.send(register.into()).await {
            Ok(()) => self.set_state(ChannelState::Registered),
            // Transient; the transport's next Disconnected event recovers.
            Err(e) => warn!(error = %e, "Failed to send register_server"),
        }

        if let Some(hook) = &self.events.on_connect {
            hook();
        }
    }

    fn handle_disconnected(&self) {
        info!("Control channel disconnected");
        self.set_state(ChannelState::Disconnected);

        // Coarse recovery: anything still mapped once the grace window
        // elapses is force-closed so a dropped channel cannot leak local
        // handles. Each drained entry closes by its own identity.
        let table = self.table.clone();
        let grace = self.config.disconnect_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            for (id, handle) in table.drain_all().await {
                debug!(connection_id = %id, "Force-closing connection after channel loss");
                handle.force_terminate();
            }
        });
    }

    async fn handle_message(&mut self, envelope: Envelope) {
        if let Some(error) = &envelope.error {
            warn!(error = %error, "Edge server attached an error to message");
        }

        match envelope.payload {
            ControlMessage::CreateConnection { connection_id } => {
                if self.state() == ChannelState::Disconnected {
                    // Raced with session teardown; nothing may be inserted
                    // while disconnected.
                    warn!(
                        connection_id = %connection_id,
                        "Ignoring create_connection while disconnected"
                    );
                    return;
                }

                debug!(connection_id = %connection_id, "Opening local connection");
                match self.connector.open(connection_id.clone()).await {
                    Ok(()) => {
                        if let Some(hook) = &self.events.on_connection {
                            hook(connection_id);
                        }
                    }
                    Err(e) => {
                        warn!(connection_id = %connection_id, error = %e, "Rejected create_connection");
                    }
                }
            }

            ControlMessage::Data {
                connection_id,
                payload,
            } => match self.table.lookup(&connection_id).await {
                Some(handle) => {
                    // Handed to the connection's own task, never written
                    // inside this event turn. An empty chunk would read as
                    // the close signal there, so it is not forwarded.
                    if !payload.is_empty() && !handle.deliver(Bytes::from(payload)) {
                        debug!(connection_id = %connection_id, "Connection task gone, dropping data");
                    }
                }
                // The peer may already consider the connection gone.
                None => debug!(connection_id = %connection_id, "Dropping data for unknown connection"),
            },

            ControlMessage::SocketError { connection_id } => {
                debug!(connection_id = %connection_id, "Edge server reported socket error");
                // The peer already knows its side failed; no acknowledgment.
                self.table.remove_and_close(&connection_id).await;
            }

            ControlMessage::End {
                connection_id: None,
            } => {
                debug!("Ignoring _end without connection id");
            }

            ControlMessage::End {
                connection_id: Some(connection_id),
            } => {
                debug!(connection_id = %connection_id, "Edge server ended connection");
                // Deferred so in-flight writes drain before teardown.
                let table = self.table.clone();
                let grace = self.config.end_grace;
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    table.remove_and_close(&connection_id).await;
                });
            }

            ControlMessage::HostRegistered { registration } => {
                if self.host_registered_fired {
                    debug!("Ignoring repeated hostRegistered");
                    return;
                }
                self.host_registered_fired = true;

                info!(hostname = %registration.hostname, "Host registered on edge server");
                if let Some(hook) = &self.events.on_local_server_created {
                    hook(registration);
                }
            }

            // Outbound-direction kinds arriving here are a peer bug.
            other @ (ControlMessage::RegisterServer { .. }
            | ControlMessage::DisconnectClient { .. }
            | ControlMessage::CutClient { .. }
            | ControlMessage::ConnectionError { .. }) => {
                warn!(message = ?other, "Unexpected outbound-direction message from edge server");
            }
        }
    }

    async fn send_outbound(&mut self, transport: &mut dyn ControlTransport, message: ControlMessage) {
        if self.state() == ChannelState::Disconnected {
            // Dropped by design; the embedding application treats the
            // absence of effect as feedback.
            debug!("Dropping outbound message while disconnected");
            return;
        }

        if let Err(e) = transport.send(message.into()).await {
            warn!(error = %e, "Failed to send control message");
        }
    }
}
