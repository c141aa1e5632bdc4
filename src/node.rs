//! Node wiring.
//!
//! ```text
//!   UI ──key──► StateFeed ──► MovementBuffer ◄── ProofBatcher
//!                   ▲                                │
//!                   │                    Batch / Idle│
//!                   │                                ▼
//!              Reconciler ◄──── self-batch ───── node loop ────► GossipLayer
//!                   ▲                                ▲               │
//!                   └──────── inbound batches ───────┴───── events ──┘
//! ```
//!
//! Catch-up: a batch ahead of the verified chain, a beacon announcing
//! batches we lack, or a new neighbour makes the loop send a `SyncRequest`.
//! Neighbours answer from their archive.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ConfigError, NodeConfig};
use crate::core::id::PeerId;
use crate::feed::StateFeed;
use crate::movement::{BatcherOutput, MovementBuffer, ProofBatcher};
use crate::network::{
    GossipError, GossipEvent, GossipLayer, GossipStreams, UiServer, UiServerError,
};
use crate::proof::SigmaProofVerifier;
use crate::trail::{ReconcileEvent, ReconcileOutcome, Reconciler};

/// Magnitude of one key press.
const KEY_STEP: i32 = 1;

/// Startup failures.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Peer mesh failed to start.
    #[error("gossip error: {0}")]
    Gossip(#[from] GossipError),

    /// UI server failed to start.
    #[error("UI server error: {0}")]
    Ui(#[from] UiServerError),
}

/// A configured, not yet started node.
pub struct Node {
    local_id: PeerId,
    config: NodeConfig,
    shutdown: broadcast::Sender<()>,
}

/// Handles to a started node.
pub struct RunningNode {
    /// Our peer id.
    pub local_id: PeerId,
    /// Bound peer listen address.
    pub gossip_addr: SocketAddr,
    /// Bound UI address.
    pub ui_addr: SocketAddr,
    /// State feed.
    pub feed: StateFeed,
    /// Trail store.
    pub reconciler: Reconciler,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl Node {
    /// Validate `config` and create a node with a fresh id.
    pub fn new(config: NodeConfig) -> Result<Self, NodeError> {
        Self::with_id(config, PeerId::random())
    }

    /// Validate `config` and create a node with a given id.
    pub fn with_id(config: NodeConfig, local_id: PeerId) -> Result<Self, NodeError> {
        config.validate()?;
        let (shutdown, _) = broadcast::channel(1);
        Ok(Self { local_id, config, shutdown })
    }

    /// Our peer id.
    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Sender that stops the node.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    /// Bind everything and spawn the node tasks.
    #[instrument(skip(self), fields(node = %self.config.node_name, id = %self.local_id))]
    pub async fn start(self) -> Result<RunningNode, NodeError> {
        let Node { local_id, config, shutdown } = self;
        let params = Arc::new(config.params.clone());

        let buffer = MovementBuffer::new(params.bounds(), params.spawn).shared();
        let reconciler = Reconciler::new(
            local_id,
            Arc::clone(&params),
            Arc::new(SigmaProofVerifier),
            config.reconcile_policy(),
        );

        let (batch_tx, batch_rx) = mpsc::channel(16);
        let batcher = ProofBatcher::new(
            local_id,
            Arc::clone(&params),
            Arc::clone(&buffer),
            config.batch_interval,
            batch_tx,
        );
        let feed = StateFeed::new(
            config.node_name.clone(),
            KEY_STEP,
            buffer,
            reconciler.clone(),
            batcher.handle(),
            batcher.activity(),
        );

        let (gossip, streams) = GossipLayer::start(
            local_id,
            config.gossip.clone(),
            config.admission.clone(),
            shutdown.clone(),
        )
        .await?;

        let ui = Arc::new(UiServer::new(config.ui.clone(), feed.clone()));
        let listener = ui.bind().await?;
        let ui_addr = listener.local_addr().map_err(UiServerError::from)?;

        info!(
            "Node {} ({}) up: peers on {} (advertised as {}), UI on {}, admission {}",
            config.node_name,
            local_id.to_uuid_string(),
            gossip.local_addr(),
            gossip.advertise_addr().unwrap_or("nothing"),
            ui_addr,
            if config.admission.is_enforced() { "enforced" } else { "open" }
        );

        tokio::spawn(batcher.run(shutdown.subscribe()));
        tokio::spawn(feed.clone().run(shutdown.subscribe()));
        {
            let ui = Arc::clone(&ui);
            tokio::spawn(async move { ui.serve(listener).await });
        }
        tokio::spawn(run_sweeper(
            reconciler.clone(),
            feed.clone(),
            config.batch_interval,
            shutdown.subscribe(),
        ));

        let gossip_addr = gossip.local_addr();
        let task = tokio::spawn(run_loop(
            gossip,
            streams,
            batch_rx,
            reconciler.clone(),
            feed.clone(),
            ui,
            CatchUp::new(config.batch_interval),
            shutdown.subscribe(),
        ));

        Ok(RunningNode {
            local_id,
            gossip_addr,
            ui_addr,
            feed,
            reconciler,
            shutdown,
            task,
        })
    }

    /// Start and run until shutdown.
    pub async fn run(self) -> Result<(), NodeError> {
        self.start().await?.wait().await;
        Ok(())
    }
}

impl RunningNode {
    /// Stop every task. No partial batch is emitted.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Wait for the node loop to finish.
    pub async fn wait(self) {
        if let Err(e) = self.task.await {
            error!("Node loop failed: {}", e);
        }
    }
}

/// Paces catch-up requests per author.
#[derive(Debug)]
struct CatchUp {
    every: Duration,
    asked: HashMap<PeerId, (u64, Instant)>,
}

impl CatchUp {
    fn new(every: Duration) -> Self {
        Self { every, asked: HashMap::new() }
    }

    /// Whether batches of `author` from `expected` should be requested now.
    /// The same request is repeated at most once per interval.
    fn should_request(&mut self, author: PeerId, expected: u64, now: Instant) -> bool {
        match self.asked.get(&author) {
            Some(&(seq, at)) if seq == expected && now.duration_since(at) < self.every => false,
            _ => {
                self.asked.insert(author, (expected, now));
                true
            }
        }
    }

    /// Ask every neighbour for the batches of `author` from `expected`.
    fn request(&mut self, gossip: &GossipLayer, author: PeerId, expected: u64) {
        if !self.should_request(author, expected, Instant::now()) {
            return;
        }
        match gossip.request_sync(None, vec![(author, expected)]) {
            Ok(links) => debug!("Requested batches of {} from {} on {} links", author, expected, links),
            Err(e) => warn!("Failed to request batches of {}: {}", author, e),
        }
    }
}

/// Route batcher output and gossip traffic.
#[allow(clippy::too_many_arguments)]
async fn run_loop(
    gossip: GossipLayer,
    streams: GossipStreams,
    mut batches: mpsc::Receiver<BatcherOutput>,
    reconciler: Reconciler,
    feed: StateFeed,
    ui: Arc<UiServer>,
    mut catch_up: CatchUp,
    mut shutdown: broadcast::Receiver<()>,
) {
    let GossipStreams { mut inbound, mut events } = streams;
    let mut outcomes = reconciler.subscribe();

    loop {
        tokio::select! {
            Some(output) = batches.recv() => {
                match output {
                    BatcherOutput::Batch(batch) => {
                        match gossip.broadcast(&batch) {
                            Ok(links) => debug!("Batch {} sent on {} links", batch.batch_seq, links),
                            Err(e) => warn!("Failed to broadcast batch {}: {}", batch.batch_seq, e),
                        }
                        reconciler.submit(batch);
                    }
                    BatcherOutput::Idle { last_batch_seq } => {
                        if let Err(e) = gossip.announce_beacon(last_batch_seq) {
                            warn!("Failed to announce beacon: {}", e);
                        }
                    }
                }
            }
            Some(received) = inbound.recv() => {
                let (author, seq) = received.batch.id();
                debug!("Batch {} of {} via {}", seq, author, received.from);
                reconciler.submit(received.batch);
            }
            Some(event) = events.recv() => {
                handle_event(event, &gossip, &reconciler, &feed, &mut catch_up).await;
            }
            outcome = outcomes.recv() => {
                match outcome {
                    Ok(ReconcileEvent { peer_id, outcome: ReconcileOutcome::Behind { expected }, .. }) => {
                        catch_up.request(&gossip, peer_id, expected);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("Node loop lagged {} reconcile events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = shutdown.recv() => {
                info!("Node shutting down");
                break;
            }
        }
    }

    ui.shutdown();
}

async fn handle_event(
    event: GossipEvent,
    gossip: &GossipLayer,
    reconciler: &Reconciler,
    feed: &StateFeed,
    catch_up: &mut CatchUp,
) {
    match event {
        GossipEvent::PeerJoined { peer_id, addr } => {
            reconciler.note_peer_joined(peer_id).await;
            info!("Peer {} joined, {} connected", peer_id, gossip.connected_peers().len());
            feed.notify(format!("Peer {} joined ({})", peer_id, addr.as_deref().unwrap_or("inbound")));
            if let Err(e) = gossip.request_sync(Some(peer_id), reconciler.heads().await) {
                warn!("Failed to request catch-up from {}: {}", peer_id, e);
            }
        }
        GossipEvent::SyncRequested { peer_id, heads } => {
            let missing = reconciler.archived_since(&heads, peer_id);
            if missing.is_empty() {
                return;
            }
            match gossip.send_batches(peer_id, &missing) {
                Ok(frames) => debug!("Sent {} batches to {} in {} frames", missing.len(), peer_id, frames),
                Err(e) => warn!("Failed to send catch-up batches to {}: {}", peer_id, e),
            }
        }
        GossipEvent::PeerDisconnected { peer_id } => {
            feed.notify(format!("Peer {} disconnected", peer_id));
        }
        GossipEvent::PeerLost { peer_id, addr } => {
            if let Some(peer_id) = peer_id {
                reconciler.mark_stale(peer_id).await;
            }
            feed.notify(format!("Lost contact with {}", addr));
        }
        GossipEvent::BootstrapExhausted { addr } => {
            warn!("Bootstrap peer {} unreachable; waiting for inbound peers", addr);
            feed.notify(format!("Bootstrap peer {} unreachable", addr));
        }
        GossipEvent::Beacon { peer_id, last_batch_seq } => {
            if let Some(expected) = reconciler.note_beacon(peer_id, last_batch_seq).await {
                catch_up.request(gossip, peer_id, expected);
            }
        }
    }
}

/// Stale silent peers and evict expired trails once per batch interval.
async fn run_sweeper(
    reconciler: Reconciler,
    feed: StateFeed,
    every: std::time::Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = reconciler.sweep(Instant::now()).await;
                for peer_id in report.staled {
                    feed.notify(format!("Peer {} went silent", peer_id));
                }
                for peer_id in report.evicted {
                    feed.notify(format!("Peer {} removed", peer_id));
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::core::point::GridPoint;
    use crate::network::protocol::Key;
    use crate::trail::TrailStatus;

    fn test_config(name: &str, bootstrap: Vec<String>) -> NodeConfig {
        let mut config = NodeConfig {
            node_name: name.into(),
            batch_interval: Duration::from_millis(200),
            ..Default::default()
        };
        config.ui.bind_addr = "127.0.0.1:0".parse().unwrap();
        config.gossip.listen_addr = "127.0.0.1:0".parse().unwrap();
        config.gossip.bootstrap = bootstrap;
        config
    }

    #[test]
    fn test_catch_up_paced_per_author() {
        let a = PeerId::new([0xa; 16]);
        let b = PeerId::new([0xb; 16]);
        let start = Instant::now();
        let mut catch_up = CatchUp::new(Duration::from_secs(1));

        assert!(catch_up.should_request(a, 0, start));
        assert!(!catch_up.should_request(a, 0, start + Duration::from_millis(500)));
        assert!(catch_up.should_request(b, 0, start));
        // Progress asks again at once
        assert!(catch_up.should_request(a, 2, start + Duration::from_millis(500)));
        assert!(catch_up.should_request(a, 2, start + Duration::from_millis(1600)));
    }

    #[test]
    fn test_invalid_config_refused() {
        let mut config = test_config("x", vec![]);
        config.params.max_step = 0;
        assert!(matches!(Node::new(config), Err(NodeError::Config(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_nodes_end_to_end() {
        let a_id = PeerId::new([0xa; 16]);
        let b_id = PeerId::new([0xb; 16]);

        let a = Node::with_id(test_config("alice", vec![]), a_id).unwrap().start().await.unwrap();
        let b = Node::with_id(test_config("bob", vec![a.gossip_addr.to_string()]), b_id)
            .unwrap()
            .start()
            .await
            .unwrap();

        let mut changes = b.reconciler.changes();
        tokio::time::timeout(Duration::from_secs(10), async {
            while b.reconciler.trail(&a_id).await.is_none() {
                changes.changed().await.unwrap();
            }
        })
        .await
        .expect("alice never joined");

        for _ in 0..3 {
            a.feed.apply_command(Key::Right);
        }

        tokio::time::timeout(Duration::from_secs(20), async {
            loop {
                let seen = b.reconciler.trail(&a_id).await;
                if seen.map(|t| t.current_position) == Some(GridPoint::new(3, 0)) {
                    break;
                }
                changes.changed().await.unwrap();
            }
        })
        .await
        .expect("alice's batch never verified at bob");

        let trail = b.reconciler.trail(&a_id).await.unwrap();
        assert_eq!(trail.status, TrailStatus::Verified);
        assert!(!trail.suspect);
        assert!(!trail.verified_points.is_empty());

        let snapshot = b.feed.snapshot().await;
        assert!(snapshot.peers.iter().any(|p| p.peer_id == a_id.to_uuid_string()));

        a.shutdown();
        b.shutdown();
        a.wait().await;
        b.wait().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_late_joiner_catches_up() {
        let a_id = PeerId::new([0xa; 16]);
        let b_id = PeerId::new([0xb; 16]);

        let a = Node::with_id(test_config("alice", vec![]), a_id).unwrap().start().await.unwrap();
        let mut a_changes = a.reconciler.changes();
        a.feed.apply_command(Key::Right);
        tokio::time::timeout(Duration::from_secs(20), async {
            while a.reconciler.local_trail().await.and_then(|t| t.last_verified_seq).is_none() {
                a_changes.changed().await.unwrap();
            }
        })
        .await
        .expect("alice's first batch never verified");

        // Bob never saw batch 0 on the wire
        let b = Node::with_id(test_config("bob", vec![a.gossip_addr.to_string()]), b_id)
            .unwrap()
            .start()
            .await
            .unwrap();
        let mut changes = b.reconciler.changes();
        tokio::time::timeout(Duration::from_secs(10), async {
            while b.reconciler.trail(&a_id).await.is_none() {
                changes.changed().await.unwrap();
            }
        })
        .await
        .expect("alice never joined");

        for _ in 0..3 {
            a.feed.apply_command(Key::Up);
        }

        tokio::time::timeout(Duration::from_secs(20), async {
            loop {
                let seen = b.reconciler.trail(&a_id).await;
                if seen.map(|t| t.current_position) == Some(GridPoint::new(1, 3)) {
                    break;
                }
                changes.changed().await.unwrap();
            }
        })
        .await
        .expect("bob never caught up with alice");

        let trail = b.reconciler.trail(&a_id).await.unwrap();
        assert_eq!(trail.status, TrailStatus::Verified);
        assert!(!trail.suspect);
        assert_eq!(trail.rejected_batches, 0);

        a.shutdown();
        b.shutdown();
        a.wait().await;
        b.wait().await;
    }
}
