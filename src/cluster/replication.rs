//! Replication Transport
//!
//! [`ReplicationTransport`] is the outbound side of replication: broadcast a
//! framed work queue to every other member, either fire-and-forget or
//! waiting for each peer's acknowledgment.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::error::SendError;
use super::membership::{ClusterNode, NodeStatus, View};
use crate::work::WorkQueue;

/// Delivery mode of a replication send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Return once the local transport accepted the frame
    Async,
    /// Wait until every peer acknowledged, or `timeout` elapsed
    Sync { timeout: Duration },
}

/// Outbound replication of work queues to the cluster
#[async_trait]
pub trait ReplicationTransport: Send + Sync {
    /// Broadcast a work queue for `index_name` to all members except self
    async fn send(&self, index_name: &str, queue: &WorkQueue, mode: SendMode)
        -> Result<(), SendError>;

    /// Identity of the local node
    fn local_address(&self) -> ClusterNode;

    /// Most recent membership view
    fn current_view(&self) -> Arc<View>;

    /// Release the transport; safe to call more than once
    async fn stop(&self);
}

/// Receiver of a peer acknowledgment: `None` on success, the failure otherwise
pub type AckReceiver = oneshot::Receiver<Option<String>>;

/// Members a frame is sent to: everyone in the view except the local node
/// and members that announced their departure
pub fn replication_targets<'v>(view: &'v View, local_node_id: &str) -> Vec<&'v ClusterNode> {
    view.nodes()
        .iter()
        .filter(|n| n.node_id != local_node_id && n.status != NodeStatus::Departed)
        .collect()
}

/// Outcome of waiting on one peer
#[derive(Debug)]
enum Response {
    Ok,
    Failed(String),
    Missing,
}

/// Wait for every acknowledgment until a shared deadline, then scan the
/// responses once in the given order and report the first failure
///
/// `is_suspected` is consulted after the deadline to tell a suspected peer
/// from one that is alive but silent.
pub async fn collect_responses<F>(
    pending: Vec<(String, AckReceiver)>,
    timeout: Duration,
    is_suspected: F,
) -> Result<(), SendError>
where
    F: Fn(&str) -> bool,
{
    let deadline = Instant::now() + timeout;

    let mut responses = Vec::with_capacity(pending.len());
    for (peer, rx) in pending {
        let response = match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(None)) => Response::Ok,
            Ok(Ok(Some(cause))) => Response::Failed(cause),
            // Sender dropped: the connection went away before answering
            Ok(Err(_)) | Err(_) => Response::Missing,
        };
        responses.push((peer, response));
    }

    for (peer, response) in responses {
        match response {
            Response::Ok => {}
            Response::Failed(cause) => return Err(SendError::RemoteFailure { peer, cause }),
            Response::Missing if is_suspected(&peer) => {
                return Err(SendError::PeerSuspected(peer))
            }
            Response::Missing => return Err(SendError::PeerTimeout(peer)),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;

    fn node(id: &str, port: u16) -> ClusterNode {
        ClusterNode::new(id, SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[test]
    fn test_targets_exclude_self() {
        let view = View::new(
            1,
            vec![
                node("a", 1),
                node("b", 2),
                node("c", 3).with_status(NodeStatus::Suspected),
                node("d", 4).with_status(NodeStatus::Departed),
            ],
        );
        let targets: Vec<_> = replication_targets(&view, "a")
            .into_iter()
            .map(|n| n.node_id.as_str())
            .collect();
        assert_eq!(targets, vec!["b", "c"]);
    }

    #[test]
    fn test_single_member_has_no_targets() {
        let view = View::new(1, vec![node("a", 1)]);
        assert!(replication_targets(&view, "a").is_empty());
    }

    #[tokio::test]
    async fn test_all_acknowledged() {
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        tx1.send(None).unwrap();
        tx2.send(None).unwrap();

        let result = collect_responses(
            vec![("b".to_string(), rx1), ("c".to_string(), rx2)],
            Duration::from_millis(100),
            |_| false,
        )
        .await;
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn test_no_peers_is_ok() {
        let result = collect_responses(Vec::new(), Duration::from_millis(10), |_| true).await;
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn test_remote_failure() {
        let (tx, rx) = oneshot::channel();
        tx.send(Some("index unavailable: disk full".to_string()))
            .unwrap();

        let result =
            collect_responses(vec![("b".to_string(), rx)], Duration::from_millis(100), |_| false)
                .await;
        assert_eq!(
            result,
            Err(SendError::RemoteFailure {
                peer: "b".to_string(),
                cause: "index unavailable: disk full".to_string()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_live_peer_times_out() {
        let (_tx, rx) = oneshot::channel();
        let result =
            collect_responses(vec![("b".to_string(), rx)], Duration::from_secs(5), |_| false)
                .await;
        assert_eq!(result, Err(SendError::PeerTimeout("b".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_suspected_peer() {
        let (_tx, rx) = oneshot::channel();
        let result =
            collect_responses(vec![("b".to_string(), rx)], Duration::from_secs(5), |p| p == "b")
                .await;
        assert_eq!(result, Err(SendError::PeerSuspected("b".to_string())));
    }

    #[tokio::test]
    async fn test_dropped_connection_counts_as_missing() {
        let (tx, rx) = oneshot::channel::<Option<String>>();
        drop(tx);
        let result =
            collect_responses(vec![("b".to_string(), rx)], Duration::from_secs(5), |_| true)
                .await;
        assert_eq!(result, Err(SendError::PeerSuspected("b".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_order_is_deterministic() {
        // "b" is silent, "c" failed; "b" comes first in view order
        let (_tx_b, rx_b) = oneshot::channel();
        let (tx_c, rx_c) = oneshot::channel();
        tx_c.send(Some("boom".to_string())).unwrap();

        let result = collect_responses(
            vec![("b".to_string(), rx_b), ("c".to_string(), rx_c)],
            Duration::from_secs(1),
            |_| false,
        )
        .await;
        assert_eq!(result, Err(SendError::PeerTimeout("b".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_is_shared() {
        // Two silent peers must not double the wait
        let (_tx1, rx1) = oneshot::channel();
        let (_tx2, rx2) = oneshot::channel();
        let start = Instant::now();
        let _ = collect_responses(
            vec![("b".to_string(), rx1), ("c".to_string(), rx2)],
            Duration::from_secs(2),
            |_| false,
        )
        .await;
        assert!(start.elapsed() < Duration::from_secs(3));
    }
}
