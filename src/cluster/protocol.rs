//! Cluster Protocol Messages
//!
//! Binary protocol spoken on peer TCP connections. Messages are serialized
//! with bincode and framed with a 4-byte big-endian length prefix. Work
//! queues travel inside `Replicate` as a replication frame built by
//! [`crate::codec`].

use bincode::{Decode, Encode};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::error::RemoteError;

/// Protocol version for compatibility checking
pub const CLUSTER_PROTOCOL_VERSION: u8 = 1;

/// Largest accepted message body
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Messages exchanged between cluster nodes over TCP
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum ClusterMessage {
    /// Handshake sent when connecting to a peer
    Hello {
        /// Node ID of the sender
        node_id: String,
        /// Protocol version
        version: u8,
    },

    /// Handshake acknowledgment
    HelloAck {
        /// Node ID of the responder
        node_id: String,
        /// Protocol version
        version: u8,
    },

    /// Replication frame for one index
    Replicate {
        /// Correlates the acknowledgment of a synchronous send
        request_id: u64,
        /// Whether the sender waits for a `ReplicateAck`
        ack: bool,
        /// Origin node ID (self echo protection)
        origin_node: String,
        /// `[name len][name][work queue]`
        frame: Vec<u8>,
    },

    /// Outcome of a synchronous `Replicate`
    ReplicateAck {
        request_id: u64,
        /// Failure description, `None` when applied or deliberately dropped
        error: Option<String>,
    },

    /// Keep-alive ping
    Ping,

    /// Keep-alive pong
    Pong,

    /// Graceful disconnect notification
    Goodbye,
}

impl ClusterMessage {
    /// Encode message to bytes using bincode
    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::encode_to_vec(self, bincode::config::standard())
    }

    /// Decode message from bytes using bincode
    pub fn decode(data: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        bincode::decode_from_slice(data, bincode::config::standard()).map(|(msg, _)| msg)
    }

    /// Get the message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            ClusterMessage::Hello { .. } => "Hello",
            ClusterMessage::HelloAck { .. } => "HelloAck",
            ClusterMessage::Replicate { .. } => "Replicate",
            ClusterMessage::ReplicateAck { .. } => "ReplicateAck",
            ClusterMessage::Ping => "Ping",
            ClusterMessage::Pong => "Pong",
            ClusterMessage::Goodbye => "Goodbye",
        }
    }
}

/// Frame a message with length prefix for TCP transmission
pub fn frame_message(msg: &ClusterMessage) -> Result<Vec<u8>, bincode::error::EncodeError> {
    let payload = msg.encode()?;
    let len = payload.len() as u32;

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);

    Ok(frame)
}

/// Read frame length from bytes (returns None if not enough data)
pub fn read_frame_length(data: &[u8]) -> Option<u32> {
    if data.len() < 4 {
        return None;
    }
    Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}

/// Reads length-prefixed messages from a stream
///
/// Partial frames stay buffered between calls, so `next` can be raced in
/// `tokio::select!` without losing data.
pub struct MessageReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(64 * 1024),
        }
    }

    /// Next message, or `None` when the peer closed the stream cleanly
    pub async fn next(&mut self) -> Result<Option<ClusterMessage>, RemoteError> {
        loop {
            if let Some(len) = read_frame_length(&self.buf) {
                let len = len as usize;
                if len > MAX_MESSAGE_SIZE {
                    return Err(RemoteError::Other(format!("Frame too large: {} bytes", len)));
                }
                if self.buf.len() >= 4 + len {
                    let frame = self.buf.split_to(4 + len);
                    return Ok(Some(ClusterMessage::decode(&frame[4..])?));
                }
            }

            if self.inner.read_buf(&mut self.buf).await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(RemoteError::ConnectionLost(
                    "Connection closed mid-frame".to_string(),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_hello() {
        let msg = ClusterMessage::Hello {
            node_id: "node1".to_string(),
            version: CLUSTER_PROTOCOL_VERSION,
        };

        let decoded = ClusterMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_encode_decode_replicate() {
        let frame = crate::codec::encode("books", &[1, 2, 3]).unwrap();
        let msg = ClusterMessage::Replicate {
            request_id: 42,
            ack: true,
            origin_node: "node1".to_string(),
            frame: frame.to_vec(),
        };

        match ClusterMessage::decode(&msg.encode().unwrap()).unwrap() {
            ClusterMessage::Replicate {
                request_id,
                ack,
                origin_node,
                frame,
            } => {
                assert_eq!(request_id, 42);
                assert!(ack);
                assert_eq!(origin_node, "node1");
                assert_eq!(crate::codec::decode_index_name(0, &frame).unwrap(), "books");
            }
            other => panic!("Wrong message type: {}", other.type_name()),
        }
    }

    #[test]
    fn test_encode_decode_ack_with_error() {
        let msg = ClusterMessage::ReplicateAck {
            request_id: 7,
            error: Some("index unavailable: disk full".to_string()),
        };
        let decoded = ClusterMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_frame_message() {
        let frame = frame_message(&ClusterMessage::Ping).unwrap();

        // First 4 bytes are length
        let len = read_frame_length(&frame).unwrap();
        assert_eq!(len as usize, frame.len() - 4);

        let decoded = ClusterMessage::decode(&frame[4..]).unwrap();
        assert!(matches!(decoded, ClusterMessage::Ping));
    }

    #[test]
    fn test_read_frame_length_short() {
        assert_eq!(read_frame_length(&[0, 0, 1]), None);
    }

    #[tokio::test]
    async fn test_reader_splits_frames() {
        use tokio::io::AsyncWriteExt;

        let (mut tx, rx) = tokio::io::duplex(16);
        let mut reader = MessageReader::new(rx);

        let writer = tokio::spawn(async move {
            let mut bytes = frame_message(&ClusterMessage::Ping).unwrap();
            bytes.extend(
                frame_message(&ClusterMessage::Hello {
                    node_id: "a-rather-long-node-identifier".to_string(),
                    version: CLUSTER_PROTOCOL_VERSION,
                })
                .unwrap(),
            );
            bytes.extend(frame_message(&ClusterMessage::Goodbye).unwrap());
            tx.write_all(&bytes).await.unwrap();
        });

        assert_eq!(reader.next().await.unwrap(), Some(ClusterMessage::Ping));
        assert!(matches!(
            reader.next().await.unwrap(),
            Some(ClusterMessage::Hello { .. })
        ));
        assert_eq!(reader.next().await.unwrap(), Some(ClusterMessage::Goodbye));
        writer.await.unwrap();
        assert_eq!(reader.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reader_reassembles_split_reads() {
        let frame = frame_message(&ClusterMessage::ReplicateAck {
            request_id: 3,
            error: None,
        })
        .unwrap();

        // Length prefix itself arrives in two pieces
        let stream = tokio_test::io::Builder::new()
            .read(&frame[..2])
            .read(&frame[2..5])
            .read(&frame[5..])
            .build();
        let mut reader = MessageReader::new(stream);

        assert_eq!(
            reader.next().await.unwrap(),
            Some(ClusterMessage::ReplicateAck {
                request_id: 3,
                error: None
            })
        );
        assert_eq!(reader.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reader_truncated_frame() {
        use tokio::io::AsyncWriteExt;

        let (mut tx, rx) = tokio::io::duplex(64);
        let frame = frame_message(&ClusterMessage::Pong).unwrap();
        tx.write_all(&frame[..frame.len() - 1]).await.unwrap();
        drop(tx);

        let mut reader = MessageReader::new(rx);
        assert!(reader.next().await.is_err());
    }

    #[test]
    fn test_type_name() {
        assert_eq!(ClusterMessage::Ping.type_name(), "Ping");
        assert_eq!(ClusterMessage::Goodbye.type_name(), "Goodbye");
        assert_eq!(
            ClusterMessage::ReplicateAck {
                request_id: 0,
                error: None
            }
            .type_name(),
            "ReplicateAck"
        );
    }
}
