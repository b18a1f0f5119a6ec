//! Error types shared by the overlay, the version store and the sync engine.

use thiserror::Error;

/// A frame or message that violates the wire protocol.
///
/// The connection that produced it is dropped and the peer marked offline;
/// nothing retries automatically.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("frame length mismatch: prefix says {declared} bytes, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("truncated frame: {0} bytes is shorter than the length prefix")]
    Truncated(usize),

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),

    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: &'static str, reason: String },

    #[error("expected hello during handshake, got {0}")]
    HandshakeViolation(String),

    #[error("io error while framing: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection-level failures, surfaced to callers of `connect`/`request`.
///
/// The sync engine treats these as transient and retries on its next pass.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection to {addr} refused or failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("connection closed by peer")]
    Closed,

    #[error("peer {0} is not connected")]
    NotConnected(String),

    #[error("endpoint is not running")]
    NotRunning,

    #[error("request {0} was cancelled")]
    Cancelled(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the version store and its persistence collaborator.
///
/// Raised from `replay`, one of these is a replay error: it is logged, the
/// record is skipped, and the rest of the batch still applies.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("table {0} is not versioned")]
    UnknownTable(String),

    #[error("record {id} already exists in {table}")]
    DuplicateRecord { table: String, id: String },

    #[error("record {id} not found in {table}")]
    RecordNotFound { table: String, id: String },

    #[error("failed to persist version store: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode version store: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures of a sync pass.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("authority request failed: {0}")]
    Authority(String),

    #[error("unexpected response from {source_name}: {reason}")]
    BadResponse { source_name: String, reason: String },

    #[error("no version source reachable")]
    NoSource,

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
