//! Error taxonomy for the session core. Each variant maps to a recovery action
//! described alongside it; session-internal tasks convert these into state
//! transitions (detach/destroy) rather than letting them propagate.

use thiserror::Error;

/// Close code sent to a Connection Handler's channel, matching the codes in
/// the wire protocol's external interface.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const INTERNAL_ERROR: u16 = 1011;
    pub const RESTART: u16 = 4000;
    pub const HEARTBEAT: u16 = 4001;
    pub const REPLACED: u16 = 4002;
    pub const HANDSHAKE_TIMEOUT: u16 = 4003;
}

/// Malformed control JSON, unknown control `type`, or invalid handshake
/// dimensions. Recovery: close the channel with 1002, or for binary frames,
/// drop the frame and continue.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed control message: {0}")]
    MalformedControl(#[from] serde_json::Error),
    #[error("unknown control message type: {0}")]
    UnknownControlType(String),
    #[error("invalid dimensions: columns={columns} rows={rows}")]
    InvalidDimensions { columns: i64, rows: i64 },
    #[error("empty binary frame")]
    EmptyFrame,
}

/// `reconnect` named a session that does not exist, or is dead. Recovery:
/// send an `error` control message; the client is expected to redo the
/// handshake.
#[derive(Debug, Error)]
#[error("session {0} not found")]
pub struct SessionMissing(pub String);

/// The PTY or shell process failed to start. Recovery: log, close the
/// handler with 1011, and never leave a half-initialized session registered.
#[derive(Debug, Error)]
#[error("failed to spawn shell: {0}")]
pub struct SpawnFailure(pub String);

/// A resource-bound wait expired: handshake not received before
/// `HANDSHAKE_TIMEOUT`, or pong not received before `HEARTBEAT_TIMEOUT`.
#[derive(Debug, Error)]
pub enum ResourceTimeout {
    #[error("handshake not received within timeout")]
    Handshake,
    #[error("heartbeat pong not received within timeout")]
    Heartbeat,
}

/// Top-level error enum used at task boundaries where a single `?`-friendly
/// type is convenient; process-level call sites mostly use `anyhow` instead.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    SessionMissing(#[from] SessionMissing),
    #[error(transparent)]
    SpawnFailure(#[from] SpawnFailure),
    #[error(transparent)]
    ResourceTimeout(#[from] ResourceTimeout),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
