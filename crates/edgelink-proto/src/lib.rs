//! Control-channel protocol definitions
//!
//! This crate defines the message model exchanged between a tunnel client
//! and its edge server: the closed set of control messages, the envelope
//! wrapping every message, and the identifier correlating the logical
//! connections multiplexed over one channel.

pub mod messages;

pub use messages::{ConnectionId, ControlMessage, Envelope, HostRegistration};
