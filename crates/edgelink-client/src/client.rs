//! Tunnel client
//!
//! Composition root: resolves credentials for the configured fqdn, dials
//! the edge server, and runs exactly one control channel bound to the
//! registration parameters.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use edgelink_transport::{ControlConnector, TransportError};

use crate::channel::{ChannelState, ControlChannel, TunnelEvents};
use crate::config::TunnelConfig;
use crate::connector::LocalConnector;
use crate::creds::{CredentialError, CredentialResolver};
use crate::table::ConnectionTable;

/// Errors that can occur in the tunnel client
#[derive(Debug, Error)]
pub enum ClientError {
    /// Credential or endpoint resolution failed. Fatal to starting this
    /// instance, not to the process.
    #[error("credential resolution failed: {0}")]
    CredentialResolution(#[from] CredentialError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("client already started")]
    AlreadyStarted,
}

/// One tunnel client instance.
pub struct TunnelClient {
    config: TunnelConfig,
    resolver: Arc<dyn CredentialResolver>,
    connector: Arc<dyn ControlConnector>,
    events: TunnelEvents,
    table: ConnectionTable,
    state_tx: Option<watch::Sender<ChannelState>>,
    state_rx: watch::Receiver<ChannelState>,
    shutdown: CancellationToken,
    channel_task: Option<JoinHandle<()>>,
}

impl TunnelClient {
    pub fn new(
        config: TunnelConfig,
        resolver: Arc<dyn CredentialResolver>,
        connector: Arc<dyn ControlConnector>,
        events: TunnelEvents,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ChannelState::Disconnected);

        Self {
            config,
            resolver,
            connector,
            events,
            table: ConnectionTable::new(),
            state_tx: Some(state_tx),
            state_rx,
            shutdown: CancellationToken::new(),
            channel_task: None,
        }
    }

    /// Resolve credentials, dial the edge server, and start the control
    /// channel.
    ///
    /// A resolution failure leaves the client in its non-started state;
    /// nothing has been dialed and no channel exists.
    pub async fn start(&mut self) -> Result<(), ClientError> {
        if self.channel_task.is_some() {
            return Err(ClientError::AlreadyStarted);
        }

        let fqdn = self.config.registration.server_fqdn.clone();
        info!(server_fqdn = %fqdn, "Starting tunnel client");

        let creds = match self.resolver.resolve(&fqdn).await {
            Ok(creds) => creds,
            Err(e) => {
                error!(server_fqdn = %fqdn, error = %e, "Credential resolution failed, client not started");
                return Err(e.into());
            }
        };

        info!(
            server_fqdn = %fqdn,
            edge_hostname = %creds.edge_hostname,
            "Resolved edge endpoint"
        );

        let transport = self
            .connector
            .connect(&creds.edge_hostname, creds.identity.as_ref())
            .await?;

        let state_tx = match self.state_tx.take() {
            Some(state_tx) => state_tx,
            // A previous channel consumed the state sender; the instance
            // cannot be started again.
            None => return Err(ClientError::AlreadyStarted),
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let registration = &self.config.registration;
        let local = LocalConnector::new(
            registration.target_host.clone(),
            registration.target_port,
            self.table.clone(),
            outbound_tx,
        );

        let channel = ControlChannel::new(
            self.config.clone(),
            self.table.clone(),
            local,
            self.events.clone(),
            state_tx,
            self.shutdown.clone(),
        );
        self.channel_task = Some(tokio::spawn(channel.run(transport, outbound_rx)));

        Ok(())
    }

    /// Stop the channel and close every outstanding connection.
    ///
    /// Outstanding entries are drained rather than left to leak; sends
    /// attempted afterwards are no-ops.
    pub async fn shutdown(&mut self) {
        info!("Shutting down tunnel client");
        self.shutdown.cancel();

        if let Some(task) = self.channel_task.take() {
            let _ = task.await;
        }
    }

    /// Current channel state.
    pub fn state(&self) -> ChannelState {
        *self.state_rx.borrow()
    }

    /// Watch channel state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ChannelState> {
        self.state_rx.clone()
    }

    /// Number of currently mapped logical connections.
    pub async fn active_connections(&self) -> usize {
        self.table.count().await
    }
}
