//! The framed messaging transport.
//!
//! Connection-oriented, length-prefixed, tagged, chunked messages over
//! stream sockets: the wire that carries API requests between the node and
//! its satellite processes. Includes priority queueing for control
//! traffic, lazy reconnect with backoff, keepalive pings, and ban scoring
//! for misbehaving peers.

#![allow(clippy::unit_arg)]

pub mod connection;
pub mod constants;
pub mod error;
pub mod manager;
pub mod protocol;

pub use connection::{ConnectionId, Priority};
pub use error::Error;
pub use manager::{EndPoint, NetworkConfig, NetworkManager, NetworkService};
pub use protocol::message::{Message, TagValue};
