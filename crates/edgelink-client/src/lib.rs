//! Tunnel multiplexing client
//!
//! Exposes a locally running server to the public internet through an
//! edge server, without the local host accepting inbound connections.
//! One persistent control channel carries an unbounded number of
//! multiplexed logical connections, each backed by its own outbound TCP
//! connection to the local target.
//!
//! The control channel's wire transport is consumed behind
//! [`edgelink_transport::ControlTransport`]; this crate owns connection
//! lifecycle, message correlation, and failure isolation.

pub mod channel;
pub mod client;
pub mod config;
pub mod connector;
pub mod creds;
pub mod table;

pub use channel::{ChannelState, TunnelEvents};
pub use client::{ClientError, TunnelClient};
pub use config::{ServerRegistration, TunnelConfig, TunnelConfigBuilder};
pub use connector::LocalConnector;
pub use creds::{
    CredentialError, CredentialResolver, DirCredentialStore, ResolvedCredentials,
    StaticCredentials,
};
pub use table::{ConnectionState, ConnectionTable, LocalHandle, TableError};

pub use edgelink_proto::{ConnectionId, ControlMessage, Envelope, HostRegistration};
