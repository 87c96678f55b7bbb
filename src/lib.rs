//! A pluggable NBD (Network Block Device) server: a chain of composable
//! filter layers terminating in a plugin, driven by a per-connection
//! protocol state machine.
//!
//! - [`proto`] is the wire format: handshake, option negotiation, and
//!   transmission-phase requests/replies.
//! - [`chain`] is the filter/plugin composition runtime (§4.1) plus the
//!   concrete filters and plugins built on top of it.
//! - [`capability`] holds the per-export capability set the dispatcher
//!   negotiates once and then reuses for the life of a connection.
//! - [`error`] is the internal `ChainError`, mapped to wire error codes
//!   at the transmission boundary.
//! - [`server`] is the connection state machine and request dispatcher.
//! - [`transport`] is the listener abstraction (TCP/Unix/VSOCK/stdin).
//! - [`client`] is a minimal wire-protocol client, used by the `client`
//!   binary and the integration tests.
//! - [`device_size`], [`size`], [`once`] are small standalone utilities
//!   used by plugins and the CLI.

pub mod capability;
pub mod chain;
pub mod client;
pub mod device_size;
pub mod error;
pub mod once;
pub mod proto;
pub mod server;
pub mod size;
pub mod transport;
