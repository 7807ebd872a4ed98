use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

use super::Frame;

/// Connection ID (unique per hub connection)
pub type ConnectionId = u64;

/// Broadcast partition key
pub type Channel = u32;

pub const DEFAULT_CHANNEL: Channel = 0;

/// Connection lifecycle; only `Open` peers are relay targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Open,
    Closed,
}

struct Peer {
    channel: Channel,
    state: PeerState,
    outbound: mpsc::Sender<Frame>,
}

/// Transport-agnostic set of connections keyed by channel
pub struct ChannelRegistry {
    peers: RwLock<HashMap<ConnectionId, Peer>>,
    next_conn_id: AtomicU64,
    queue_size: usize,
}

impl ChannelRegistry {
    pub fn new(queue_size: usize) -> Arc<Self> {
        Arc::new(Self {
            peers: RwLock::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            queue_size: queue_size.max(1),
        })
    }

    /// Register a connection bound to `channel`. It starts out `Connecting`.
    pub async fn register(&self, channel: Channel) -> (ConnectionId, mpsc::Receiver<Frame>) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.queue_size);

        self.peers.write().await.insert(
            conn_id,
            Peer {
                channel,
                state: PeerState::Connecting,
                outbound: tx,
            },
        );
        log::debug!("Hub connection {} registered on channel {}", conn_id, channel);

        (conn_id, rx)
    }

    pub async fn mark_open(&self, conn_id: ConnectionId) {
        self.set_state(conn_id, PeerState::Open).await;
    }

    pub async fn mark_closed(&self, conn_id: ConnectionId) {
        self.set_state(conn_id, PeerState::Closed).await;
    }

    async fn set_state(&self, conn_id: ConnectionId, state: PeerState) {
        if let Some(peer) = self.peers.write().await.get_mut(&conn_id) {
            peer.state = state;
        }
    }

    pub async fn unregister(&self, conn_id: ConnectionId) {
        let removed = self.peers.write().await.remove(&conn_id);
        if let Some(peer) = removed {
            log::debug!(
                "Hub connection {} unregistered from channel {}",
                conn_id,
                peer.channel
            );
        }
    }

    /// Forward a frame from `from` to the other open peers on its channel.
    /// Returns the number of peers the frame was queued for.
    pub async fn relay(&self, from: ConnectionId, frame: Frame) -> usize {
        let peers = self.peers.read().await;
        let Some(channel) = peers.get(&from).map(|p| p.channel) else {
            log::debug!("Dropping frame from unknown connection {}", from);
            return 0;
        };
        Self::deliver(&peers, channel, Some(from), &frame)
    }

    /// Deliver a frame to every open peer on `channel`
    pub async fn publish(&self, channel: Channel, frame: Frame) -> usize {
        let peers = self.peers.read().await;
        Self::deliver(&peers, channel, None, &frame)
    }

    fn deliver(
        peers: &HashMap<ConnectionId, Peer>,
        channel: Channel,
        exclude: Option<ConnectionId>,
        frame: &Frame,
    ) -> usize {
        let mut sent = 0;
        for (conn_id, peer) in peers.iter() {
            if peer.channel != channel || peer.state != PeerState::Open || Some(*conn_id) == exclude {
                continue;
            }
            // a failing peer never blocks the rest
            match peer.outbound.try_send(frame.clone()) {
                Ok(()) => sent += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!("Hub connection {} queue full, frame dropped", conn_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    log::debug!("Hub connection {} already gone, frame dropped", conn_id);
                }
            }
        }
        sent
    }

    pub async fn connection_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Number of open peers bound to `channel`
    pub async fn channel_population(&self, channel: Channel) -> usize {
        self.peers
            .read()
            .await
            .values()
            .filter(|p| p.channel == channel && p.state == PeerState::Open)
            .count()
    }

    pub async fn channel_of(&self, conn_id: ConnectionId) -> Option<Channel> {
        self.peers.read().await.get(&conn_id).map(|p| p.channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_peer(
        registry: &ChannelRegistry,
        channel: Channel,
    ) -> (ConnectionId, mpsc::Receiver<Frame>) {
        let (id, rx) = registry.register(channel).await;
        registry.mark_open(id).await;
        (id, rx)
    }

    #[tokio::test]
    async fn relay_reaches_same_channel_peers_only() {
        let registry = ChannelRegistry::new(8);
        let (a, mut a_rx) = open_peer(&registry, 2).await;
        let (_b, mut b_rx) = open_peer(&registry, 2).await;
        let (_c, mut c_rx) = open_peer(&registry, 1).await;

        let sent = registry.relay(a, Frame::Text("hello".into())).await;

        assert_eq!(sent, 1);
        assert_eq!(b_rx.recv().await, Some(Frame::Text("hello".into())));
        assert!(a_rx.try_recv().is_err());
        assert!(c_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn binary_frames_stay_binary() {
        let registry = ChannelRegistry::new(8);
        let (a, _a_rx) = open_peer(&registry, 0).await;
        let (_b, mut b_rx) = open_peer(&registry, 0).await;

        registry.relay(a, Frame::Binary(vec![0, 159, 146, 150])).await;
        assert_eq!(b_rx.recv().await, Some(Frame::Binary(vec![0, 159, 146, 150])));
    }

    #[tokio::test]
    async fn connecting_and_closed_peers_are_skipped() {
        let registry = ChannelRegistry::new(8);
        let (a, _a_rx) = open_peer(&registry, 3).await;
        let (_pending, mut pending_rx) = registry.register(3).await;
        let (closing, mut closing_rx) = open_peer(&registry, 3).await;
        registry.mark_closed(closing).await;

        assert_eq!(registry.relay(a, Frame::Text("x".into())).await, 0);
        assert!(pending_rx.try_recv().is_err());
        assert!(closing_rx.try_recv().is_err());
        assert_eq!(registry.channel_population(3).await, 1);
    }

    #[tokio::test]
    async fn dead_peer_does_not_block_delivery() {
        let registry = ChannelRegistry::new(1);
        let (a, _a_rx) = open_peer(&registry, 1).await;
        let (_gone, gone_rx) = open_peer(&registry, 1).await;
        let (_full, _full_rx) = open_peer(&registry, 1).await;
        let (_live, mut live_rx) = open_peer(&registry, 1).await;
        drop(gone_rx);

        // fill the queue of `_full`
        registry.relay(a, Frame::Text("first".into())).await;
        let _ = live_rx.recv().await;

        let sent = registry.relay(a, Frame::Text("second".into())).await;
        assert_eq!(sent, 1);
        assert_eq!(live_rx.recv().await, Some(Frame::Text("second".into())));
    }

    #[tokio::test]
    async fn publish_without_listeners_is_dropped() {
        let registry = ChannelRegistry::new(8);
        assert_eq!(registry.publish(4, Frame::Text("{}".into())).await, 0);

        let (_id, mut rx) = open_peer(&registry, 4).await;
        assert_eq!(registry.publish(4, Frame::Text("{}".into())).await, 1);
        assert_eq!(rx.recv().await, Some(Frame::Text("{}".into())));
    }

    #[tokio::test]
    async fn unregister_forgets_the_binding() {
        let registry = ChannelRegistry::new(8);
        let (id, _rx) = open_peer(&registry, 2).await;
        assert_eq!(registry.channel_of(id).await, Some(2));

        registry.unregister(id).await;
        assert_eq!(registry.channel_of(id).await, None);
        assert_eq!(registry.connection_count().await, 0);
        assert_eq!(registry.relay(id, Frame::Text("late".into())).await, 0);
    }
}
