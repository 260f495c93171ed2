//! Cluster Manager
//!
//! Coordinates gossip-based membership and work queue replication between
//! indexrelay nodes.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chitchat::transport::UdpTransport;
use chitchat::{
    spawn_chitchat, Chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig,
};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::config::ClusterConfig;
use crate::work::WorkQueue;

use super::error::{PeerStatus, RemoteError, SendError};
use super::listener::ClusterListener;
use super::membership::{ClusterNode, NodeStatus, View};
use super::peer::ClusterPeer;
use super::protocol::{frame_message, ClusterMessage, MessageReader, CLUSTER_PROTOCOL_VERSION};
use super::replication::{
    collect_responses, replication_targets, AckReceiver, ReplicationTransport, SendMode,
};

/// Chitchat state keys
const KEY_PEER_ADDR: &str = "peer_addr";
const KEY_ANNOUNCEMENT: &str = "announcement";
const KEY_LEAVING: &str = "leaving";

/// What a node tells the cluster about itself each time it accepts a view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAnnouncement {
    pub node_id: String,
    pub peer_addr: SocketAddr,
    pub view_id: u64,
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Cluster manager: gossip membership plus replication transport
pub struct ClusterManager {
    /// Our node ID
    node_id: String,
    /// Cluster configuration
    config: ClusterConfig,
    /// Advertised replication address
    peer_addr: SocketAddr,
    /// Chitchat handle, taken on stop
    chitchat: Mutex<Option<ChitchatHandle>>,
    /// Shared chitchat state
    chitchat_state: Arc<tokio::sync::Mutex<Chitchat>>,
    /// Replication listener socket, consumed by `start`
    tcp_listener: Mutex<Option<TcpListener>>,
    /// Outbound peer connections
    peers: Arc<DashMap<String, Arc<ClusterPeer>>>,
    /// Latest accepted view
    view: Arc<RwLock<Arc<View>>>,
    /// Receiver of inbound frames and views
    listener: Arc<dyn ClusterListener>,
    /// Background tasks
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_request_id: AtomicU64,
    stopped: AtomicBool,
}

impl ClusterManager {
    /// Bind the replication socket and join the gossip cluster
    pub async fn new(
        config: ClusterConfig,
        listener: Arc<dyn ClusterListener>,
    ) -> Result<Self, BoxError> {
        let node_id = config.get_node_id();
        let gossip_advertise_addr = config.get_gossip_advertise_addr();

        let tcp_listener = TcpListener::bind(config.peer_addr).await?;
        let mut peer_addr = config.get_peer_advertise_addr();
        if peer_addr.port() == 0 {
            peer_addr.set_port(tcp_listener.local_addr()?.port());
        }

        info!(
            "Starting cluster node: {} (gossip_advertise={}, peer_advertise={})",
            node_id, gossip_advertise_addr, peer_addr
        );

        let chitchat_id = ChitchatId::new(node_id.clone(), 0, gossip_advertise_addr);

        let failure_detector_config = FailureDetectorConfig {
            phi_threshold: 8.0,
            initial_interval: config.gossip_interval,
            ..Default::default()
        };

        let chitchat_config = ChitchatConfig {
            chitchat_id,
            cluster_id: config.cluster_id.clone(),
            gossip_interval: config.gossip_interval,
            listen_addr: config.gossip_addr,
            seed_nodes: config.seeds.clone(),
            failure_detector_config,
            marked_for_deletion_grace_period: config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let initial_kvs = vec![(KEY_PEER_ADDR.to_string(), peer_addr.to_string())];
        let chitchat = spawn_chitchat(chitchat_config, initial_kvs, &UdpTransport).await?;
        let chitchat_state = chitchat.chitchat();

        Ok(Self {
            node_id,
            config,
            peer_addr,
            chitchat: Mutex::new(Some(chitchat)),
            chitchat_state,
            tcp_listener: Mutex::new(Some(tcp_listener)),
            peers: Arc::new(DashMap::new()),
            view: Arc::new(RwLock::new(Arc::new(View::empty()))),
            listener,
            tasks: Mutex::new(Vec::new()),
            next_request_id: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
        })
    }

    /// Get our node ID
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Get the number of peers
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Get the number of connected peers
    pub fn connected_peer_count(&self) -> usize {
        self.peers
            .iter()
            .filter(|p| p.value().status() == PeerStatus::Connected)
            .count()
    }

    /// Start the cluster manager background tasks
    pub fn start(&self) -> Result<(), BoxError> {
        let tcp_listener = self
            .tcp_listener
            .lock()
            .take()
            .ok_or("cluster manager already started")?;

        info!(
            "Cluster manager starting on gossip={}, peer={}",
            self.config.gossip_addr, self.peer_addr
        );

        // Accept replication connections from other nodes
        let listener = self.listener.clone();
        let local_node_id = self.node_id.clone();
        let accept_task = tokio::spawn(async move {
            Self::peer_listener_loop(tcp_listener, listener, local_node_id).await;
        });

        // Turn gossip state into views and peer connections
        let watcher = GossipWatcher {
            chitchat: self.chitchat_state.clone(),
            peers: self.peers.clone(),
            view: self.view.clone(),
            listener: self.listener.clone(),
            local_node_id: self.node_id.clone(),
            local_peer_addr: self.peer_addr,
            gossip_interval: self.config.gossip_interval,
            connect_timeout: self.config.failure_timeout,
        };
        let watch_task = tokio::spawn(watcher.run());

        self.tasks.lock().extend([accept_task, watch_task]);
        Ok(())
    }

    /// Whether a silent peer should be reported as suspected
    fn is_suspected(&self, peer_id: &str) -> bool {
        let gossip_suspects = match self.view.read().node(peer_id) {
            Some(node) => node.status != NodeStatus::Alive,
            None => true,
        };
        let disconnected = match self.peers.get(peer_id) {
            Some(peer) => peer.status() != PeerStatus::Connected,
            None => true,
        };
        gossip_suspects || disconnected
    }

    /// Listen for incoming peer connections
    ///
    /// Connection tasks belong to this loop: aborting it closes every
    /// inbound connection as well.
    async fn peer_listener_loop(
        tcp_listener: TcpListener,
        listener: Arc<dyn ClusterListener>,
        local_node_id: String,
    ) {
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                accepted = tcp_listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("Incoming cluster peer connection from {}", addr);

                        let listener = listener.clone();
                        let node_id = local_node_id.clone();

                        connections.spawn(async move {
                            if let Err(e) = Self::handle_incoming_peer(stream, listener, node_id).await
                            {
                                debug!("Incoming peer connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept peer connection: {}", e);
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
    }

    /// Handle an incoming peer connection
    ///
    /// Frames of one connection are applied in arrival order.
    async fn handle_incoming_peer(
        stream: TcpStream,
        listener: Arc<dyn ClusterListener>,
        local_node_id: String,
    ) -> Result<(), RemoteError> {
        stream.set_nodelay(true)?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = MessageReader::new(read_half);

        // Wait for Hello
        let msg = tokio::time::timeout(Duration::from_secs(10), reader.next())
            .await
            .map_err(|_| RemoteError::Timeout)??
            .ok_or_else(|| RemoteError::ConnectionLost("Connection closed".to_string()))?;

        let peer_node_id = match msg {
            ClusterMessage::Hello { node_id, version } => {
                if version != CLUSTER_PROTOCOL_VERSION {
                    return Err(RemoteError::Rejected(format!(
                        "Protocol version mismatch: {} vs {}",
                        version, CLUSTER_PROTOCOL_VERSION
                    )));
                }
                node_id
            }
            other => {
                return Err(RemoteError::Other(format!(
                    "Expected Hello, got {}",
                    other.type_name()
                )))
            }
        };

        info!("Incoming cluster peer: {}", peer_node_id);

        let ack = ClusterMessage::HelloAck {
            node_id: local_node_id,
            version: CLUSTER_PROTOCOL_VERSION,
        };
        write_half.write_all(&frame_message(&ack)?).await?;

        loop {
            let Some(msg) = reader.next().await? else {
                info!("Cluster peer '{}' disconnected", peer_node_id);
                return Ok(());
            };

            match msg {
                ClusterMessage::Replicate {
                    request_id,
                    ack,
                    origin_node,
                    frame,
                } => {
                    let error = match listener.on_message(&origin_node, &frame).await {
                        Ok(delivery) => {
                            debug!(
                                "Cluster inbound: #{} from '{}': {:?}",
                                request_id, origin_node, delivery
                            );
                            None
                        }
                        Err(e) => {
                            warn!(
                                "Cluster inbound: #{} from '{}' failed: {}",
                                request_id, origin_node, e
                            );
                            Some(e.to_string())
                        }
                    };

                    if ack {
                        let reply = ClusterMessage::ReplicateAck { request_id, error };
                        write_half.write_all(&frame_message(&reply)?).await?;
                    }
                }
                ClusterMessage::Ping => {
                    write_half
                        .write_all(&frame_message(&ClusterMessage::Pong)?)
                        .await?;
                }
                ClusterMessage::Goodbye => {
                    info!("Cluster peer '{}' said goodbye", peer_node_id);
                    return Ok(());
                }
                other => {
                    debug!(
                        "Cluster peer '{}': ignoring {}",
                        peer_node_id,
                        other.type_name()
                    );
                }
            }
        }
    }
}

/// Receiver whose sender is already gone; counts as a missing response
fn unanswered() -> AckReceiver {
    let (_, rx) = oneshot::channel();
    rx
}

#[async_trait]
impl ReplicationTransport for ClusterManager {
    async fn send(
        &self,
        index_name: &str,
        queue: &WorkQueue,
        mode: SendMode,
    ) -> Result<(), SendError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(SendError::Stopped);
        }

        let frame: Bytes = codec::encode(index_name, &queue.encode()?)?;
        let view = self.current_view();
        let wants_ack = matches!(mode, SendMode::Sync { .. });

        let mut pending = Vec::new();
        let mut refused = None;
        for node in replication_targets(&view, &self.node_id) {
            let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            let queued = match self.peers.get(&node.node_id) {
                Some(peer) => peer.value().replicate(request_id, frame.clone(), wants_ack),
                None => Err(RemoteError::ConnectionLost("no connection".to_string())),
            };

            match queued {
                Ok(Some(rx)) => pending.push((node.node_id.clone(), rx)),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        "Replication of '{}' to '{}' not queued: {}",
                        index_name, node.node_id, e
                    );
                    if wants_ack {
                        pending.push((node.node_id.clone(), unanswered()));
                    } else if refused.is_none() {
                        refused = Some(node.node_id.clone());
                    }
                }
            }
        }

        match mode {
            // A frame the transport did not accept is not sent at all
            SendMode::Async => match refused {
                Some(peer) => Err(SendError::PeerSuspected(peer)),
                None => Ok(()),
            },
            SendMode::Sync { timeout } => {
                collect_responses(pending, timeout, |peer| self.is_suspected(peer)).await
            }
        }
    }

    fn local_address(&self) -> ClusterNode {
        ClusterNode::new(self.node_id.clone(), self.peer_addr)
    }

    fn current_view(&self) -> Arc<View> {
        self.view.read().clone()
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Stopping cluster manager");

        // Announce departure and give gossip a round to spread it
        self.chitchat_state
            .lock()
            .await
            .self_node_state()
            .set(KEY_LEAVING.to_string(), "true".to_string());
        tokio::time::sleep(self.config.gossip_interval).await;

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }

        let peers: Vec<Arc<ClusterPeer>> = self.peers.iter().map(|p| p.value().clone()).collect();
        self.peers.clear();
        for peer in peers {
            peer.stop().await;
        }

        let handle = self.chitchat.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.shutdown().await {
                warn!("Gossip shutdown failed: {}", e);
            }
        }
    }
}

/// Background task turning gossip state into views
struct GossipWatcher {
    chitchat: Arc<tokio::sync::Mutex<Chitchat>>,
    peers: Arc<DashMap<String, Arc<ClusterPeer>>>,
    view: Arc<RwLock<Arc<View>>>,
    listener: Arc<dyn ClusterListener>,
    local_node_id: String,
    local_peer_addr: SocketAddr,
    gossip_interval: Duration,
    connect_timeout: Duration,
}

impl GossipWatcher {
    async fn run(self) {
        loop {
            tokio::time::sleep(self.gossip_interval).await;

            let members = self.read_members().await;
            let current = self.view.read().clone();
            let candidate = View::new(current.id() + 1, members);
            if candidate.same_membership(&current) {
                continue;
            }

            self.install(current, Arc::new(candidate)).await;
        }
    }

    /// Members as currently seen through gossip
    async fn read_members(&self) -> Vec<ClusterNode> {
        let cc = self.chitchat.lock().await;
        let dead: HashSet<&str> = cc.dead_nodes().map(|id| id.node_id.as_str()).collect();

        cc.state_snapshot()
            .node_states
            .iter()
            .filter_map(|node_state| {
                let node_id = node_state.chitchat_id().node_id.clone();
                let peer_addr = node_state.get(KEY_PEER_ADDR)?.parse::<SocketAddr>().ok()?;
                let status = if node_state.get(KEY_LEAVING).is_some() {
                    NodeStatus::Departed
                } else if dead.contains(node_id.as_str()) {
                    NodeStatus::Suspected
                } else {
                    NodeStatus::Alive
                };
                Some(ClusterNode::new(node_id, peer_addr).with_status(status))
            })
            .collect()
    }

    async fn install(&self, previous: Arc<View>, view: Arc<View>) {
        info!("Cluster: accepted {}", view);

        self.listener.block();
        for node in view.nodes() {
            let was_suspected = previous
                .node(&node.node_id)
                .map(|n| n.status == NodeStatus::Suspected)
                .unwrap_or(false);
            if node.status == NodeStatus::Suspected && !was_suspected {
                warn!("Cluster: peer '{}' is suspected", node.node_id);
                self.listener.suspect(node);
            }
        }

        self.announce(view.id()).await;
        *self.view.write() = view.clone();
        self.listener.on_view_change(view.clone());
        self.listener.unblock();

        self.reconcile_peers(&view).await;
    }

    /// Publish our identity so peers can recognize us after a restart
    async fn announce(&self, view_id: u64) {
        let announcement = NodeAnnouncement {
            node_id: self.local_node_id.clone(),
            peer_addr: self.local_peer_addr,
            view_id,
        };
        match serde_json::to_string(&announcement) {
            Ok(json) => {
                self.chitchat
                    .lock()
                    .await
                    .self_node_state()
                    .set(KEY_ANNOUNCEMENT.to_string(), json);
            }
            Err(e) => warn!("Cluster: failed to encode announcement: {}", e),
        }
    }

    /// Connect to new members and drop connections to departed ones
    async fn reconcile_peers(&self, view: &View) {
        for node in view.nodes() {
            if node.node_id == self.local_node_id || node.status == NodeStatus::Departed {
                continue;
            }

            let stale = match self.peers.get(&node.node_id) {
                Some(peer) if peer.peer_addr() == node.peer_addr => continue,
                Some(peer) => Some(peer.value().clone()),
                None => None,
            };
            if let Some(stale) = stale {
                info!(
                    "Cluster peer '{}' moved to {}, reconnecting",
                    node.node_id, node.peer_addr
                );
                stale.stop().await;
            }

            info!("Discovered cluster peer: {}", node);
            let peer = ClusterPeer::new(
                node.node_id.clone(),
                node.peer_addr,
                self.local_node_id.clone(),
                self.connect_timeout,
            )
            .spawn();
            self.peers.insert(node.node_id.clone(), peer);
        }

        let gone: Vec<String> = self
            .peers
            .iter()
            .filter(|p| {
                view.node(p.key())
                    .map(|n| n.status == NodeStatus::Departed)
                    .unwrap_or(true)
            })
            .map(|p| p.key().clone())
            .collect();

        for node_id in gone {
            info!("Cluster peer '{}' left the cluster", node_id);
            if let Some((_, peer)) = self.peers.remove(&node_id) {
                peer.stop().await;
            }
        }
    }
}
