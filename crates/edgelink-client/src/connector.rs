//! Local connector
//!
//! Bridges one logical connection to one outbound TCP connection against
//! the fixed local target. Each connection runs as its own task; a
//! failure there is contained to its id and never reaches the control
//! channel or another connection.

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use edgelink_proto::{ConnectionId, ControlMessage};

use crate::table::{ConnectionTable, LocalHandle, TableError};

const READ_BUFFER_SIZE: usize = 8192;

/// How one connection's bridge loop ended; decides which terminal
/// messages go to the edge server.
enum BridgeOutcome {
    /// The local side closed cleanly.
    LocalClosed,
    /// The local side failed while reading or writing.
    LocalError(std::io::Error),
    /// Close was requested through the handle (edge-initiated teardown);
    /// the peer already knows, so nothing is reported.
    CloseRequested,
    /// Forced termination, no close handshake.
    Cancelled,
}

/// Opens outbound connections to the local target and wires their data,
/// error, and close events to the control channel.
#[derive(Debug, Clone)]
pub struct LocalConnector {
    target_host: String,
    target_port: u16,
    table: ConnectionTable,
    outbound: mpsc::UnboundedSender<ControlMessage>,
}

impl LocalConnector {
    pub(crate) fn new(
        target_host: String,
        target_port: u16,
        table: ConnectionTable,
        outbound: mpsc::UnboundedSender<ControlMessage>,
    ) -> Self {
        Self {
            target_host,
            target_port,
            table,
            outbound,
        }
    }

    /// Open the local side of connection `id`.
    ///
    /// The `Connecting` entry is inserted before the connect call is
    /// issued, so inbound data or error events for `id` always find the
    /// table aware of it. Fails with [`TableError::DuplicateConnection`]
    /// if the id is already mapped; the existing entry is left untouched.
    pub async fn open(&self, id: ConnectionId) -> Result<(), TableError> {
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        self.table
            .insert(id.clone(), LocalHandle::new(data_tx, cancel.clone()))
            .await?;

        let connector = self.clone();
        tokio::spawn(async move {
            connector.run_connection(id, data_rx, cancel).await;
        });

        Ok(())
    }

    fn send(&self, message: ControlMessage) {
        // The channel task gates sends on its own state; if it is gone the
        // client is shutting down and the message has nowhere to go.
        if self.outbound.send(message).is_err() {
            debug!("Control channel gone, dropping outbound message");
        }
    }

    async fn run_connection(
        self,
        id: ConnectionId,
        mut data_rx: mpsc::UnboundedReceiver<Bytes>,
        cancel: CancellationToken,
    ) {
        let target = format!("{}:{}", self.target_host, self.target_port);

        let connect = tokio::select! {
            _ = cancel.cancelled() => {
                self.table.remove_and_close(&id).await;
                return;
            }
            result = TcpStream::connect(&target) => result,
        };

        let stream = match connect {
            Ok(stream) => stream,
            Err(e) => {
                error!(
                    connection_id = %id,
                    target = %target,
                    error = %e,
                    "Failed to connect to local target"
                );
                self.send(ControlMessage::ConnectionError {
                    connection_id: id.clone(),
                    error: e.to_string(),
                });
                if e.kind() == std::io::ErrorKind::ConnectionRefused {
                    // The target refused outright: tell the edge to abandon
                    // its peer socket immediately, and do not follow up
                    // with a disconnect for the same failure.
                    self.send(ControlMessage::CutClient {
                        connection_id: id.clone(),
                    });
                    cancel.cancel();
                } else {
                    self.send(ControlMessage::DisconnectClient {
                        connection_id: id.clone(),
                    });
                }
                self.table.remove_and_close(&id).await;
                return;
            }
        };

        self.table.mark_open(&id).await;
        debug!(connection_id = %id, target = %target, "Connected to local target");

        let (mut read_half, mut write_half) = stream.into_split();
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];

        let outcome = loop {
            tokio::select! {
                _ = cancel.cancelled() => break BridgeOutcome::Cancelled,

                read = read_half.read(&mut buffer) => match read {
                    Ok(0) => break BridgeOutcome::LocalClosed,
                    Ok(n) => {
                        // One outbound data message per chunk, receipt order.
                        self.send(ControlMessage::Data {
                            connection_id: id.clone(),
                            payload: buffer[..n].to_vec(),
                        });
                    }
                    Err(e) => break BridgeOutcome::LocalError(e),
                },

                chunk = data_rx.recv() => match chunk {
                    Some(chunk) if chunk.is_empty() => break BridgeOutcome::CloseRequested,
                    Some(chunk) => {
                        if let Err(e) = write_half.write_all(&chunk).await {
                            break BridgeOutcome::LocalError(e);
                        }
                    }
                    // All handles dropped; treat as a close request.
                    None => break BridgeOutcome::CloseRequested,
                },
            }
        };

        match outcome {
            BridgeOutcome::LocalClosed => {
                debug!(connection_id = %id, "Local target closed connection");
                self.send(ControlMessage::DisconnectClient {
                    connection_id: id.clone(),
                });
            }
            BridgeOutcome::LocalError(e) => {
                error!(connection_id = %id, error = %e, "Local connection failed");
                self.send(ControlMessage::ConnectionError {
                    connection_id: id.clone(),
                    error: e.to_string(),
                });
                self.send(ControlMessage::DisconnectClient {
                    connection_id: id.clone(),
                });
            }
            BridgeOutcome::CloseRequested => {
                // Queued chunks were written before the close signal (same
                // ordered channel); flush the FIN and go.
                let _ = write_half.shutdown().await;
                debug!(connection_id = %id, "Closed local connection");
            }
            BridgeOutcome::Cancelled => {
                debug!(connection_id = %id, "Local connection force-terminated");
            }
        }

        self.table.remove_and_close(&id).await;
    }
}
