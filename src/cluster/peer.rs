//! Cluster Peer
//!
//! Outbound connection to another node of the cluster. Replication frames
//! are queued on a bounded command channel and written by a connection task
//! that reconnects with exponential backoff. Queueing never waits: a full
//! queue is reported to the caller. Acknowledgments of synchronous sends
//! come back on the same connection and are matched by request id.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::error::{PeerStatus, RemoteError};
use super::protocol::{frame_message, ClusterMessage, MessageReader, CLUSTER_PROTOCOL_VERSION};
use super::replication::AckReceiver;

/// Frames waiting for the connection task
const COMMAND_QUEUE_CAPACITY: usize = 1000;

/// Commands sent to the peer connection task
#[derive(Debug)]
enum PeerCommand {
    /// Send a replication frame
    Replicate {
        request_id: u64,
        frame: Bytes,
        ack: Option<oneshot::Sender<Option<String>>>,
    },
}

/// request id -> acknowledgment sender
type PendingAcks = Arc<Mutex<HashMap<u64, oneshot::Sender<Option<String>>>>>;

/// A connection to another cluster node
pub struct ClusterPeer {
    /// Remote node ID
    node_id: String,
    /// Remote peer address for TCP connection
    peer_addr: SocketAddr,
    /// Current connection status
    status: Arc<RwLock<PeerStatus>>,
    /// Command channel for sending operations to the connection task
    command_tx: Option<mpsc::Sender<PeerCommand>>,
    /// Signals the connection task to say goodbye and exit
    shutdown_tx: watch::Sender<bool>,
    /// Our local node ID (for handshake and origin tracking)
    local_node_id: String,
    /// Bound on connection attempts and the handshake
    connect_timeout: Duration,
}

impl ClusterPeer {
    /// Create a new cluster peer
    pub fn new(
        node_id: String,
        peer_addr: SocketAddr,
        local_node_id: String,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            node_id,
            peer_addr,
            status: Arc::new(RwLock::new(PeerStatus::Disconnected)),
            command_tx: None,
            shutdown_tx: watch::channel(false).0,
            local_node_id,
            connect_timeout,
        }
    }

    /// Get the remote node ID
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Get the peer address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Get the current connection status
    pub fn status(&self) -> PeerStatus {
        *self.status.read()
    }

    /// Spawn the connection task and return the peer ready to use
    pub fn spawn(mut self) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        self.command_tx = Some(tx);
        let shutdown_rx = self.shutdown_tx.subscribe();

        let node_id = self.node_id.clone();
        let local_node_id = self.local_node_id.clone();
        let peer_addr = self.peer_addr;
        let status = self.status.clone();
        let connect_timeout = self.connect_timeout;

        tokio::spawn(async move {
            Self::connection_loop(
                node_id,
                local_node_id,
                peer_addr,
                connect_timeout,
                status,
                rx,
                shutdown_rx,
            )
            .await;
        });

        Arc::new(self)
    }

    /// Queue a replication frame
    ///
    /// With `wants_ack` the returned receiver resolves with the peer's
    /// answer; it errors if the connection drops before the answer arrives.
    /// Fails with [`RemoteError::QueueFull`] instead of waiting for room.
    pub fn replicate(
        &self,
        request_id: u64,
        frame: Bytes,
        wants_ack: bool,
    ) -> Result<Option<AckReceiver>, RemoteError> {
        let tx = self
            .command_tx
            .as_ref()
            .ok_or_else(|| RemoteError::ConnectionLost("Peer not started".to_string()))?;

        let (ack, rx) = if wants_ack {
            let (ack_tx, ack_rx) = oneshot::channel();
            (Some(ack_tx), Some(ack_rx))
        } else {
            (None, None)
        };

        tx.try_send(PeerCommand::Replicate {
            request_id,
            frame,
            ack,
        })
        .map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RemoteError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => {
                RemoteError::ConnectionLost("Command channel closed".to_string())
            }
        })?;

        Ok(rx)
    }

    /// Close the connection after saying goodbye
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);
        info!("ClusterPeer '{}': Stopped", self.node_id);
    }

    /// Run the connection loop with reconnection
    async fn connection_loop(
        node_id: String,
        local_node_id: String,
        peer_addr: SocketAddr,
        connect_timeout: Duration,
        status: Arc<RwLock<PeerStatus>>,
        mut command_rx: mpsc::Receiver<PeerCommand>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut retry_interval = Duration::from_secs(1);
        let max_retry = Duration::from_secs(30);
        let pending: PendingAcks = Arc::new(Mutex::new(HashMap::new()));

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            *status.write() = PeerStatus::Connecting;
            debug!("ClusterPeer '{}': Connecting to {}", node_id, peer_addr);

            let result = Self::connect_and_run(
                &node_id,
                &local_node_id,
                peer_addr,
                connect_timeout,
                &status,
                &mut command_rx,
                &mut shutdown_rx,
                &pending,
            )
            .await;

            // Unanswered acks fail now rather than at the sender's deadline
            pending.lock().clear();

            match result {
                Ok(()) => {
                    info!("ClusterPeer '{}': Disconnected gracefully", node_id);
                    break;
                }
                Err(e) => {
                    error!("ClusterPeer '{}': Connection failed: {}", node_id, e);
                    *status.write() = PeerStatus::Backoff;

                    debug!(
                        "ClusterPeer '{}': Reconnecting in {:?}",
                        node_id, retry_interval
                    );

                    if !Self::backoff(&node_id, retry_interval, &mut command_rx, &mut shutdown_rx)
                        .await
                    {
                        info!("ClusterPeer '{}': Shutdown requested", node_id);
                        break;
                    }
                    retry_interval = std::cmp::min(retry_interval * 2, max_retry);
                }
            }
        }

        *status.write() = PeerStatus::Disconnected;
    }

    /// Wait out a backoff interval, dropping every frame queued meanwhile
    ///
    /// Returns false when shutdown was requested.
    async fn backoff(
        node_id: &str,
        interval: Duration,
        command_rx: &mut mpsc::Receiver<PeerCommand>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> bool {
        let sleep = tokio::time::sleep(interval);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                _ = shutdown_rx.changed() => return false,
                cmd = command_rx.recv() => match cmd {
                    // Dropping the ack sender fails a synchronous caller
                    Some(PeerCommand::Replicate { request_id, .. }) => warn!(
                        "ClusterPeer '{}': dropping replicate #{} queued while disconnected",
                        node_id, request_id
                    ),
                    None => return false,
                },
            }
        }
    }

    /// Connect to the peer and run the message loop
    #[allow(clippy::too_many_arguments)]
    async fn connect_and_run(
        node_id: &str,
        local_node_id: &str,
        peer_addr: SocketAddr,
        connect_timeout: Duration,
        status: &Arc<RwLock<PeerStatus>>,
        command_rx: &mut mpsc::Receiver<PeerCommand>,
        shutdown_rx: &mut watch::Receiver<bool>,
        pending: &PendingAcks,
    ) -> Result<(), RemoteError> {
        // Connect with timeout
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(peer_addr))
            .await
            .map_err(|_| RemoteError::Timeout)??;
        stream.set_nodelay(true)?;

        debug!("ClusterPeer '{}': TCP connected", node_id);

        let (read_half, mut write_half) = stream.into_split();
        let mut reader = MessageReader::new(read_half);

        // Send Hello
        let hello = ClusterMessage::Hello {
            node_id: local_node_id.to_string(),
            version: CLUSTER_PROTOCOL_VERSION,
        };
        write_half.write_all(&frame_message(&hello)?).await?;

        // Wait for HelloAck
        let msg = tokio::time::timeout(connect_timeout, reader.next())
            .await
            .map_err(|_| RemoteError::Timeout)??
            .ok_or_else(|| RemoteError::ConnectionLost("Connection closed".to_string()))?;

        match msg {
            ClusterMessage::HelloAck {
                node_id: peer_id,
                version,
            } => {
                if version != CLUSTER_PROTOCOL_VERSION {
                    return Err(RemoteError::Rejected(format!(
                        "Protocol version mismatch: {} vs {}",
                        version, CLUSTER_PROTOCOL_VERSION
                    )));
                }
                info!("ClusterPeer '{}': Connected (peer_id={})", node_id, peer_id);
            }
            other => {
                return Err(RemoteError::Other(format!(
                    "Expected HelloAck, got {}",
                    other.type_name()
                )));
            }
        }

        *status.write() = PeerStatus::Connected;

        // Message loop
        let ping_interval = Duration::from_secs(15);
        let mut ping_timer = tokio::time::interval(ping_interval);
        ping_timer.reset();

        loop {
            tokio::select! {
                // Handle commands from the cluster manager
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(PeerCommand::Replicate { request_id, frame, ack }) => {
                            let wants_ack = ack.is_some();
                            if let Some(ack) = ack {
                                pending.lock().insert(request_id, ack);
                            }
                            let msg = ClusterMessage::Replicate {
                                request_id,
                                ack: wants_ack,
                                origin_node: local_node_id.to_string(),
                                frame: frame.to_vec(),
                            };
                            let bytes = frame_message(&msg)?;
                            if let Err(e) = write_half.write_all(&bytes).await {
                                error!("ClusterPeer '{}': TCP write error: {}", node_id, e);
                                return Err(e.into());
                            }
                            debug!(
                                "ClusterPeer '{}': sent replicate #{} ({} bytes)",
                                node_id, request_id, bytes.len()
                            );
                        }
                        None => {
                            return Self::say_goodbye(&mut write_half).await;
                        }
                    }
                }

                _ = shutdown_rx.changed() => {
                    return Self::say_goodbye(&mut write_half).await;
                }

                // Handle incoming messages from peer
                result = reader.next() => {
                    match result? {
                        None => {
                            return Err(RemoteError::ConnectionLost("Connection closed".to_string()));
                        }
                        Some(ClusterMessage::ReplicateAck { request_id, error }) => {
                            match pending.lock().remove(&request_id) {
                                Some(ack) => {
                                    let _ = ack.send(error);
                                }
                                None => debug!(
                                    "ClusterPeer '{}': late ack for #{}",
                                    node_id, request_id
                                ),
                            }
                        }
                        Some(ClusterMessage::Ping) => {
                            write_half.write_all(&frame_message(&ClusterMessage::Pong)?).await?;
                        }
                        Some(ClusterMessage::Pong) => {
                            debug!("ClusterPeer '{}': Pong received", node_id);
                        }
                        Some(ClusterMessage::Goodbye) => {
                            info!("ClusterPeer '{}': Received Goodbye", node_id);
                            return Err(RemoteError::ConnectionLost("Peer disconnected".to_string()));
                        }
                        Some(other) => {
                            debug!(
                                "ClusterPeer '{}': unexpected {} on outbound connection",
                                node_id,
                                other.type_name()
                            );
                        }
                    }
                }

                // Send periodic ping
                _ = ping_timer.tick() => {
                    write_half.write_all(&frame_message(&ClusterMessage::Ping)?).await?;
                }
            }
        }
    }

    async fn say_goodbye(write_half: &mut OwnedWriteHalf) -> Result<(), RemoteError> {
        if let Ok(bytes) = frame_message(&ClusterMessage::Goodbye) {
            let _ = write_half.write_all(&bytes).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Address nothing listens on
    async fn unreachable_addr() -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    #[tokio::test]
    async fn test_unreachable_peer_never_blocks_callers() {
        let addr = unreachable_addr().await;
        let peer =
            ClusterPeer::new("a".into(), addr, "b".into(), Duration::from_millis(200)).spawn();

        // The connection task cannot run in between, so the queue fills up
        let mut receivers = Vec::new();
        let mut refused = 0;
        for request_id in 0..(2 * COMMAND_QUEUE_CAPACITY as u64) {
            match peer.replicate(request_id, Bytes::from_static(b"frame"), true) {
                Ok(Some(rx)) => receivers.push(rx),
                Ok(None) => panic!("synchronous replicate without receiver"),
                Err(RemoteError::QueueFull) => refused += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(receivers.len(), COMMAND_QUEUE_CAPACITY);
        assert_eq!(refused, COMMAND_QUEUE_CAPACITY);

        // Frames queued while disconnected are dropped during the backoff
        tokio::time::timeout(Duration::from_secs(10), async {
            for rx in receivers {
                assert!(rx.await.is_err());
            }
        })
        .await
        .unwrap();
        assert_eq!(peer.status(), PeerStatus::Backoff);

        tokio::time::timeout(Duration::from_secs(1), peer.stop())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while peer.status() != PeerStatus::Disconnected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}
