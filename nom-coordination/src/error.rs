//! Error types shared by the coordinator, its sessions and the replica.
//!
//! Everything here is recoverable at the boundary that detects it. Transport
//! failures that end a session travel as `anyhow::Error` instead, since the
//! only thing a session can do with them is clean up and stop.

use thiserror::Error;

/// A message that could not be turned into a handshake or request.
/// Logged and discarded; the connection stays open.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("handshake carries an empty identity")]
    EmptyIdentity,
}

/// Failure to hand an update to one client's outbound queue.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// The client is not draining its queue fast enough.
    #[error("outbound queue is full")]
    Full,

    /// The session behind the channel has already gone away.
    #[error("channel is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("initial_state cannot be represented as JSON: {0}")]
    InitialState(#[from] serde_json::Error),
}
