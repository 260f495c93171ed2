//! Cluster error types.

use std::fmt;

use crate::codec::EncodingError;

/// Failure of a replication send
///
/// Transport failures are reported to the caller of a synchronous send and
/// never retried at this layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// Peer did not answer and the failure detector suspects it
    PeerSuspected(String),
    /// Peer is alive but did not answer before the deadline
    PeerTimeout(String),
    /// Peer answered with a failure
    RemoteFailure { peer: String, cause: String },
    /// Work queue could not be framed
    Encoding(String),
    /// Transport has been stopped
    Stopped,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::PeerSuspected(peer) => write!(f, "peer {} is suspected", peer),
            SendError::PeerTimeout(peer) => write!(f, "peer {} timed out", peer),
            SendError::RemoteFailure { peer, cause } => {
                write!(f, "peer {} failed to apply work: {}", peer, cause)
            }
            SendError::Encoding(msg) => write!(f, "encoding error: {}", msg),
            SendError::Stopped => write!(f, "transport stopped"),
        }
    }
}

impl std::error::Error for SendError {}

impl From<EncodingError> for SendError {
    fn from(err: EncodingError) -> Self {
        SendError::Encoding(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for SendError {
    fn from(err: bincode::error::EncodeError) -> Self {
        SendError::Encoding(err.to_string())
    }
}

/// Error on a peer connection
#[derive(Debug)]
pub enum RemoteError {
    /// Connection to remote peer failed or was lost
    ConnectionLost(String),
    /// Remote peer rejected the handshake
    Rejected(String),
    /// Operation timed out
    Timeout,
    /// Outbound queue of the peer is full
    QueueFull,
    /// Other error
    Other(String),
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            RemoteError::Rejected(msg) => write!(f, "Rejected: {}", msg),
            RemoteError::Timeout => write!(f, "Operation timed out"),
            RemoteError::QueueFull => write!(f, "Outbound queue full"),
            RemoteError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for RemoteError {}

impl From<std::io::Error> for RemoteError {
    fn from(err: std::io::Error) -> Self {
        RemoteError::ConnectionLost(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for RemoteError {
    fn from(err: bincode::error::EncodeError) -> Self {
        RemoteError::Other(format!("Encode error: {}", err))
    }
}

impl From<bincode::error::DecodeError> for RemoteError {
    fn from(err: bincode::error::DecodeError) -> Self {
        RemoteError::Other(format!("Decode error: {}", err))
    }
}

/// Status of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// Not connected, will attempt to connect
    Disconnected,
    /// Currently connecting
    Connecting,
    /// Connected and operational
    Connected,
    /// Connection failed, backing off before retry
    Backoff,
}
