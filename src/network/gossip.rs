//! Gossip Layer
//!
//! Flooding gossip over WebSocket links.
//!
//! ```text
//!   broadcast(batch) ──► frames (broadcast) ──► link task ──► remote
//!                              ▲
//!   remote ──► link task ──► SeenSet ──► first time? ──► relay
//!                                            │
//!                                            ▼
//!                                     inbound (mpsc) ──► Reconciler
//! ```
//!
//! Every batch and beacon carries its author and a per-author sequence, so
//! `(author, seq)` identifies it across the mesh. A link task forwards each
//! frame to its remote unless the frame came in on that same peer. The seen
//! set makes the flood loop-free and delivers each batch upward once.
//!
//! Handshake: the dialer sends `Hello`; the acceptor checks admission and
//! answers with its own `Hello` or a `Reject`. Both sides then exchange
//! `Peers` lists and dial whatever they have not seen yet.
//!
//! Catch-up: a `SyncRequest` goes to neighbours only and surfaces as a
//! `SyncRequested` event. The answering `Batches` frames are addressed to
//! the requester alone; their contents go upward even if already seen,
//! since the flooded copy may have been dropped before it was verified.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{accept_async, connect_async, WebSocketStream};
use tracing::{debug, error, info, instrument, warn};

use crate::core::id::PeerId;
use crate::network::auth::{AdmissionConfig, AdmissionError};
use crate::network::link::{Link, LinkError, LinkState, ReconnectPolicy};
use crate::network::protocol::{PeerMessage, WireError};
use crate::proof::MovementBatch;

/// Batches per catch-up frame.
const SYNC_CHUNK: usize = 16;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Gossip configuration.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Listen address for peer links.
    pub listen_addr: SocketAddr,
    /// Address advertised to peers. Defaults to the bound address when that
    /// is not a wildcard.
    pub advertise_addr: Option<String>,
    /// Peers dialed at startup.
    pub bootstrap: Vec<String>,
    /// Reconnect schedule for dialed links.
    pub reconnect: ReconnectPolicy,
    /// Dial and hello exchange deadline.
    pub handshake_timeout: Duration,
    /// Maximum concurrent links.
    pub max_connections: usize,
    /// Dedup window (entries).
    pub seen_capacity: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            advertise_addr: None,
            bootstrap: Vec::new(),
            reconnect: ReconnectPolicy::default(),
            handshake_timeout: Duration::from_secs(5),
            max_connections: 64,
            seen_capacity: 4096,
        }
    }
}

/// Gossip errors.
#[derive(Debug, thiserror::Error)]
pub enum GossipError {
    /// Listener could not bind.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Cause.
        #[source]
        source: std::io::Error,
    },

    /// Bootstrap address does not resolve.
    #[error("cannot resolve bootstrap peer {addr}: {reason}")]
    Resolve {
        /// Address as given.
        addr: String,
        /// Cause.
        reason: String,
    },

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// Bad frame.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Unexpected message during the hello exchange.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Hello exchange did not finish in time.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// Remote refused us.
    #[error("refused by peer: {0}")]
    Refused(String),

    /// We refused the remote.
    #[error("admission refused: {0}")]
    Admission(#[from] AdmissionError),

    /// Link state machine violation.
    #[error(transparent)]
    Link(#[from] LinkError),

    /// Remote closed the link or the node is shutting down.
    #[error("connection closed")]
    Closed,
}

// =============================================================================
// STREAMS
// =============================================================================

/// A first-seen batch and the link it arrived on.
#[derive(Debug, Clone)]
pub struct InboundBatch {
    /// Neighbour that delivered it (not necessarily the author).
    pub from: PeerId,
    /// The batch.
    pub batch: MovementBatch,
}

/// Peer lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipEvent {
    /// First link to a peer became active.
    PeerJoined {
        /// Remote peer.
        peer_id: PeerId,
        /// Its advertised address.
        addr: Option<String>,
    },
    /// Last link to a peer closed.
    PeerDisconnected {
        /// Remote peer.
        peer_id: PeerId,
    },
    /// Reconnect attempts exhausted; the link is dropped.
    PeerLost {
        /// Peer last seen at that address, if any.
        peer_id: Option<PeerId>,
        /// Dialed address.
        addr: String,
    },
    /// A bootstrap peer was never reached.
    BootstrapExhausted {
        /// Dialed address.
        addr: String,
    },
    /// First-seen liveness beacon.
    Beacon {
        /// Beacon author.
        peer_id: PeerId,
        /// Author's last produced batch.
        last_batch_seq: Option<u64>,
    },
    /// A neighbour asked for archived batches.
    SyncRequested {
        /// Requesting neighbour.
        peer_id: PeerId,
        /// Next batch it wants per author.
        heads: Vec<(PeerId, u64)>,
    },
}

/// Receiving ends handed to the node.
pub struct GossipStreams {
    /// First-seen batches.
    pub inbound: mpsc::Receiver<InboundBatch>,
    /// Lifecycle events.
    pub events: mpsc::UnboundedReceiver<GossipEvent>,
}

// =============================================================================
// DEDUP
// =============================================================================

/// Identity of a gossiped item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SeenKey {
    /// `(author, batch_seq)`.
    Batch(PeerId, u64),
    /// `(author, beacon_seq)`.
    Beacon(PeerId, u64),
}

/// Bounded first-seen filter. Oldest entries are forgotten first.
#[derive(Debug)]
pub struct SeenSet {
    capacity: usize,
    set: HashSet<SeenKey>,
    order: VecDeque<SeenKey>,
}

impl SeenSet {
    /// Empty set holding at most `capacity` keys.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            set: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Insert; returns true if the key was not present.
    pub fn insert(&mut self, key: SeenKey) -> bool {
        if !self.set.insert(key) {
            return false;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }

    /// Whether `key` is remembered.
    pub fn contains(&self, key: &SeenKey) -> bool {
        self.set.contains(key)
    }

    /// Remembered keys.
    pub fn len(&self) -> usize {
        self.set.len()
    }

    /// Nothing remembered.
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

// =============================================================================
// LAYER
// =============================================================================

#[derive(Clone)]
struct Frame {
    /// Peer the frame came in from; `None` for our own.
    origin: Option<PeerId>,
    /// Only this neighbour gets the frame.
    target: Option<PeerId>,
    bytes: Arc<Vec<u8>>,
}

struct PeerEntry {
    links: usize,
    addr: Option<String>,
}

enum LinkEnd {
    /// We dialed ourselves.
    SelfLink,
    /// Session with `peer_id` ended, cleanly or not.
    Closed {
        peer_id: PeerId,
        error: Option<GossipError>,
    },
}

struct Shared {
    local_id: PeerId,
    config: GossipConfig,
    admission: AdmissionConfig,
    local_addr: SocketAddr,
    advertise_addr: Option<String>,
    frames: broadcast::Sender<Frame>,
    shutdown: broadcast::Sender<()>,
    inbound_tx: mpsc::Sender<InboundBatch>,
    events_tx: mpsc::UnboundedSender<GossipEvent>,
    discover_tx: mpsc::UnboundedSender<String>,
    seen: Mutex<SeenSet>,
    peers: Mutex<HashMap<PeerId, PeerEntry>>,
    known: Mutex<BTreeSet<String>>,
    dialing: Mutex<HashSet<String>>,
    links: AtomicUsize,
    beacon_seq: AtomicU64,
}

/// Handle to the running gossip layer.
#[derive(Clone)]
pub struct GossipLayer {
    shared: Arc<Shared>,
}

impl GossipLayer {
    /// Bind, resolve bootstrap peers and start the accept loop and dialers.
    ///
    /// Bind and resolve failures are returned; everything after that is
    /// retried or logged.
    #[instrument(skip(config, admission, shutdown), fields(listen = %config.listen_addr))]
    pub async fn start(
        local_id: PeerId,
        config: GossipConfig,
        admission: AdmissionConfig,
        shutdown: broadcast::Sender<()>,
    ) -> Result<(Self, GossipStreams), GossipError> {
        for addr in &config.bootstrap {
            let mut resolved = lookup_host(addr.as_str()).await.map_err(|e| GossipError::Resolve {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;
            if resolved.next().is_none() {
                return Err(GossipError::Resolve {
                    addr: addr.clone(),
                    reason: "no addresses".into(),
                });
            }
        }

        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|source| GossipError::Bind { addr: config.listen_addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| GossipError::Bind { addr: config.listen_addr, source })?;

        let advertise_addr = config
            .advertise_addr
            .clone()
            .or_else(|| (!local_addr.ip().is_unspecified()).then(|| local_addr.to_string()));

        let (frames, _) = broadcast::channel(256);
        let (inbound_tx, inbound) = mpsc::channel(1024);
        let (events_tx, events) = mpsc::unbounded_channel();
        let (discover_tx, discover_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            local_id,
            seen: Mutex::new(SeenSet::new(config.seen_capacity)),
            known: Mutex::new(config.bootstrap.iter().cloned().collect()),
            config,
            admission,
            local_addr,
            advertise_addr,
            frames,
            shutdown,
            inbound_tx,
            events_tx,
            discover_tx,
            peers: Mutex::new(HashMap::new()),
            dialing: Mutex::new(HashSet::new()),
            links: AtomicUsize::new(0),
            beacon_seq: AtomicU64::new(0),
        });

        info!(
            "Gossip listening on {} as {} (advertise {:?})",
            local_addr, local_id, shared.advertise_addr
        );

        tokio::spawn(Arc::clone(&shared).run_accept(listener));
        tokio::spawn(Arc::clone(&shared).run_discovery(discover_rx));
        for addr in shared.config.bootstrap.clone() {
            if shared.dialing.lock().insert(addr.clone()) {
                tokio::spawn(Arc::clone(&shared).run_dialer(addr, true));
            }
        }

        Ok((Self { shared }, GossipStreams { inbound, events }))
    }

    /// Bound listen address.
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Address we advertise to peers.
    pub fn advertise_addr(&self) -> Option<&str> {
        self.shared.advertise_addr.as_deref()
    }

    /// Send a batch to every active link. Returns the number of links.
    pub fn broadcast(&self, batch: &MovementBatch) -> Result<usize, GossipError> {
        let (peer_id, seq) = batch.id();
        self.shared.seen.lock().insert(SeenKey::Batch(peer_id, seq));
        let bytes = PeerMessage::Batch(batch.clone()).to_bytes()?;
        debug!("Broadcasting batch {} ({} bytes)", seq, bytes.len());
        Ok(self.shared.publish(None, bytes))
    }

    /// Send a liveness beacon to every active link.
    pub fn announce_beacon(&self, last_batch_seq: Option<u64>) -> Result<usize, GossipError> {
        let beacon_seq = self.shared.beacon_seq.fetch_add(1, Ordering::Relaxed);
        let local_id = self.shared.local_id;
        self.shared.seen.lock().insert(SeenKey::Beacon(local_id, beacon_seq));
        let bytes = PeerMessage::Beacon { peer_id: local_id, beacon_seq, last_batch_seq }.to_bytes()?;
        Ok(self.shared.publish(None, bytes))
    }

    /// Ask neighbours for batches past `heads`; `None` asks every
    /// neighbour. Returns the number of active links.
    pub fn request_sync(&self, target: Option<PeerId>, heads: Vec<(PeerId, u64)>) -> Result<usize, GossipError> {
        let bytes = PeerMessage::SyncRequest { heads }.to_bytes()?;
        Ok(self.shared.publish_to(None, target, bytes))
    }

    /// Send archived batches to one neighbour. Returns the frames sent.
    pub fn send_batches(&self, target: PeerId, batches: &[MovementBatch]) -> Result<usize, GossipError> {
        let mut sent = 0;
        for chunk in batches.chunks(SYNC_CHUNK) {
            let bytes = PeerMessage::Batches { batches: chunk.to_vec() }.to_bytes()?;
            if self.shared.publish_to(None, Some(target), bytes) == 0 {
                break;
            }
            sent += 1;
        }
        Ok(sent)
    }

    /// Peers with at least one active link.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.shared.peers.lock().keys().copied().collect()
    }

    /// Number of active links.
    pub fn link_count(&self) -> usize {
        self.shared.links.load(Ordering::Relaxed)
    }
}

impl Shared {
    fn publish(&self, origin: Option<PeerId>, bytes: Vec<u8>) -> usize {
        self.publish_to(origin, None, bytes)
    }

    fn publish_to(&self, origin: Option<PeerId>, target: Option<PeerId>, bytes: Vec<u8>) -> usize {
        self.frames
            .send(Frame { origin, target, bytes: Arc::new(bytes) })
            .unwrap_or(0)
    }

    fn emit(&self, event: GossipEvent) {
        let _ = self.events_tx.send(event);
    }

    fn shutting_down(rx: &mut broadcast::Receiver<()>) -> bool {
        !matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Empty))
    }

    /// Returns true for the first active link to `peer_id`.
    fn register(&self, peer_id: PeerId, addr: Option<String>) -> bool {
        self.links.fetch_add(1, Ordering::Relaxed);
        let mut peers = self.peers.lock();
        let entry = peers.entry(peer_id).or_insert(PeerEntry { links: 0, addr: None });
        entry.links += 1;
        if addr.is_some() {
            entry.addr = addr;
        }
        entry.links == 1
    }

    /// Returns true when the last link to `peer_id` closed.
    fn deregister(&self, peer_id: PeerId) -> bool {
        self.links.fetch_sub(1, Ordering::Relaxed);
        let mut peers = self.peers.lock();
        match peers.get_mut(&peer_id) {
            Some(entry) if entry.links > 1 => {
                entry.links -= 1;
                false
            }
            Some(_) => {
                peers.remove(&peer_id);
                true
            }
            None => false,
        }
    }

    fn known_addrs(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self.known.lock().iter().cloned().collect();
        if let Some(own) = &self.advertise_addr {
            if !addrs.contains(own) {
                addrs.push(own.clone());
            }
        }
        addrs
    }

    /// Queue `addr` for dialing unless we already reach it.
    fn discover(&self, addr: String) {
        if self.advertise_addr.as_deref() == Some(addr.as_str()) {
            return;
        }
        let linked = self.peers.lock().values().any(|p| p.addr.as_deref() == Some(addr.as_str()));
        if linked || self.dialing.lock().contains(&addr) {
            return;
        }
        self.known.lock().insert(addr.clone());
        let _ = self.discover_tx.send(addr);
    }

    // -------------------------------------------------------------------------
    // Tasks
    // -------------------------------------------------------------------------

    async fn run_accept(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.links.load(Ordering::Relaxed) >= self.config.max_connections {
                                warn!("Link limit reached, rejecting {}", addr);
                                continue;
                            }
                            debug!("Inbound link from {}", addr);
                            tokio::spawn(Arc::clone(&self).handle_inbound(stream, addr));
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Gossip listener shutting down");
                    break;
                }
            }
        }
    }

    async fn run_discovery(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<String>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                addr = rx.recv() => {
                    let Some(addr) = addr else { break };
                    if self.dialing.lock().insert(addr.clone()) {
                        info!("Discovered peer address {}", addr);
                        tokio::spawn(Arc::clone(&self).run_dialer(addr, false));
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }

    async fn handle_inbound(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let ws = match tokio::time::timeout(self.config.handshake_timeout, accept_async(stream)).await {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                debug!("WebSocket handshake failed for {}: {}", addr, e);
                return;
            }
            Err(_) => {
                debug!("WebSocket handshake timed out for {}", addr);
                return;
            }
        };

        match Arc::clone(&self).run_link(ws, addr.to_string(), None).await {
            Ok(LinkEnd::SelfLink) => debug!("Closed self link from {}", addr),
            Ok(LinkEnd::Closed { peer_id, error: Some(e) }) => {
                warn!("Link from {} ({}) closed: {}", addr, peer_id, e)
            }
            Ok(LinkEnd::Closed { peer_id, error: None }) => {
                debug!("Link from {} ({}) closed", addr, peer_id)
            }
            Err(e) => warn!("Inbound link from {} failed: {}", addr, e),
        }
    }

    async fn run_dialer(self: Arc<Self>, addr: String, bootstrap: bool) {
        let mut link = Link::new(addr.clone());
        let mut shutdown = self.shutdown.subscribe();
        let mut last_peer = None;
        let url = format!("ws://{}", addr);

        loop {
            if let Err(e) = link.transition(LinkState::Connecting) {
                error!("Dialer for {}: {}", addr, e);
                break;
            }

            let attempt = tokio::select! {
                r = tokio::time::timeout(self.config.handshake_timeout, connect_async(url.as_str())) => r,
                _ = shutdown.recv() => break,
            };

            let mut self_link = false;
            match attempt {
                Ok(Ok((ws, _))) => {
                    link.transition(LinkState::Connected).ok();
                    match Arc::clone(&self).run_link(ws, addr.clone(), Some(&mut link)).await {
                        Ok(LinkEnd::SelfLink) => self_link = true,
                        Ok(LinkEnd::Closed { peer_id, error }) => {
                            last_peer = Some(peer_id);
                            match error {
                                Some(e) => warn!("Link to {} ({}) lost: {}", addr, peer_id, e),
                                None => info!("Link to {} ({}) closed", addr, peer_id),
                            }
                        }
                        Err(e) => warn!("Link to {} failed: {}", addr, e),
                    }
                }
                Ok(Err(e)) => debug!("Dial {} failed: {}", addr, e),
                Err(_) => debug!("Dial {} timed out", addr),
            }
            link.transition(LinkState::Disconnected).ok();

            if self_link {
                debug!("{} is our own address", addr);
                break;
            }
            if Self::shutting_down(&mut shutdown) {
                break;
            }
            if self.config.reconnect.exhausted(link.failures()) {
                warn!("Giving up on {} after {} attempts", addr, link.failures());
                self.emit(GossipEvent::PeerLost { peer_id: last_peer, addr: addr.clone() });
                if bootstrap && last_peer.is_none() {
                    self.emit(GossipEvent::BootstrapExhausted { addr: addr.clone() });
                }
                break;
            }

            let delay = self.config.reconnect.backoff(link.failures().max(1));
            debug!("Redialing {} in {:?}", addr, delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.recv() => break,
            }
        }

        self.dialing.lock().remove(&addr);
    }

    // -------------------------------------------------------------------------
    // Link session
    // -------------------------------------------------------------------------

    fn hello(&self) -> PeerMessage {
        PeerMessage::Hello {
            peer_id: self.local_id,
            advertise_addr: self.advertise_addr.clone(),
            admission_token: self.admission.token.clone(),
        }
    }

    /// Run one link. `link` is set for dialed links, which send `Hello` first.
    async fn run_link<S>(
        self: Arc<Self>,
        ws: WebSocketStream<S>,
        remote: String,
        mut link: Option<&mut Link>,
    ) -> Result<LinkEnd, GossipError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (mut sink, mut stream) = ws.split();
        let dialer = link.is_some();

        if dialer {
            sink.send(Message::Binary(self.hello().to_bytes()?)).await?;
        }

        let first = tokio::time::timeout(self.config.handshake_timeout, next_message(&mut stream))
            .await
            .map_err(|_| GossipError::HandshakeTimeout)??;

        let (peer_id, advertised) = match first {
            PeerMessage::Hello { peer_id, advertise_addr, admission_token } => {
                if peer_id == self.local_id {
                    if !dialer {
                        let _ = sink.send(Message::Binary(self.hello().to_bytes()?)).await;
                    }
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(LinkEnd::SelfLink);
                }
                if let Err(e) = self.admission.admit(admission_token.as_deref()) {
                    let reject = PeerMessage::Reject { reason: e.to_string() };
                    let _ = sink.send(Message::Binary(reject.to_bytes()?)).await;
                    let _ = sink.send(Message::Close(None)).await;
                    return Err(e.into());
                }
                (peer_id, advertise_addr)
            }
            PeerMessage::Reject { reason } => return Err(GossipError::Refused(reason)),
            other => {
                return Err(GossipError::Handshake(format!("expected hello, got {}", other.kind())))
            }
        };

        if !dialer {
            sink.send(Message::Binary(self.hello().to_bytes()?)).await?;
        }
        if let Some(link) = link.as_deref_mut() {
            link.transition(LinkState::Active)?;
        }

        // Subscribe before announcing so no frame published after the join is missed
        let mut frames = self.frames.subscribe();
        let mut shutdown = self.shutdown.subscribe();

        if let Some(addr) = &advertised {
            self.known.lock().insert(addr.clone());
        }
        if self.register(peer_id, advertised.clone()) {
            self.emit(GossipEvent::PeerJoined { peer_id, addr: advertised.clone() });
        }
        info!("Link to {} via {} active", peer_id, remote);

        let peers = PeerMessage::Peers { addrs: self.known_addrs() };
        let error = match sink.send(Message::Binary(peers.to_bytes()?)).await {
            Err(e) => Some(GossipError::WebSocket(e)),
            Ok(()) => loop {
                tokio::select! {
                    msg = stream.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                match self.handle_frame(peer_id, data).await {
                                    Ok(()) => {}
                                    Err(e @ (GossipError::Refused(_) | GossipError::Closed)) => break Some(e),
                                    Err(e) => debug!("Dropping frame from {}: {}", peer_id, e),
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break None,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => break Some(GossipError::WebSocket(e)),
                        }
                    }
                    frame = frames.recv() => {
                        match frame {
                            Ok(frame) => {
                                let addressed = frame.target.map_or(true, |t| t == peer_id);
                                if addressed && frame.origin != Some(peer_id) {
                                    if let Err(e) = sink.send(Message::Binary((*frame.bytes).clone())).await {
                                        break Some(GossipError::WebSocket(e));
                                    }
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!("Link to {} lagged, {} frames dropped", peer_id, n);
                            }
                            Err(broadcast::error::RecvError::Closed) => break None,
                        }
                    }
                    _ = shutdown.recv() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break None;
                    }
                }
            },
        };

        if self.deregister(peer_id) {
            self.emit(GossipEvent::PeerDisconnected { peer_id });
        }
        Ok(LinkEnd::Closed { peer_id, error })
    }

    /// Handle one frame from an active link.
    async fn handle_frame(&self, from: PeerId, data: Vec<u8>) -> Result<(), GossipError> {
        match PeerMessage::from_bytes(&data)? {
            PeerMessage::Batch(batch) => {
                let (author, seq) = batch.id();
                if author == self.local_id || !self.seen.lock().insert(SeenKey::Batch(author, seq)) {
                    return Ok(());
                }
                debug!("Batch {} from {} via {}", seq, author, from);
                self.publish(Some(from), data);
                self.inbound_tx
                    .send(InboundBatch { from, batch })
                    .await
                    .map_err(|_| GossipError::Closed)?;
            }
            PeerMessage::Beacon { peer_id, beacon_seq, last_batch_seq } => {
                if peer_id == self.local_id || !self.seen.lock().insert(SeenKey::Beacon(peer_id, beacon_seq)) {
                    return Ok(());
                }
                self.publish(Some(from), data);
                self.emit(GossipEvent::Beacon { peer_id, last_batch_seq });
            }
            PeerMessage::Peers { addrs } => {
                for addr in addrs {
                    self.discover(addr);
                }
            }
            PeerMessage::SyncRequest { heads } => {
                debug!("Sync request from {} ({} heads)", from, heads.len());
                self.emit(GossipEvent::SyncRequested { peer_id: from, heads });
            }
            PeerMessage::Batches { batches } => {
                debug!("{} catch-up batches from {}", batches.len(), from);
                for batch in batches {
                    let (author, seq) = batch.id();
                    if author == self.local_id {
                        continue;
                    }
                    self.seen.lock().insert(SeenKey::Batch(author, seq));
                    self.inbound_tx
                        .send(InboundBatch { from, batch })
                        .await
                        .map_err(|_| GossipError::Closed)?;
                }
            }
            PeerMessage::Reject { reason } => return Err(GossipError::Refused(reason)),
            PeerMessage::Hello { .. } => debug!("Ignoring repeated hello from {}", from),
        }
        Ok(())
    }
}

/// Next binary frame as a peer message.
async fn next_message<S>(stream: &mut SplitStream<WebSocketStream<S>>) -> Result<PeerMessage, GossipError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(msg) = stream.next().await {
        match msg? {
            Message::Binary(data) => return Ok(PeerMessage::from_bytes(&data)?),
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(GossipError::Closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::point::GridPoint;
    use crate::proof::{genesis_commitment, prove_batch, CircuitParameters};

    const A: PeerId = PeerId::new([0xa; 16]);
    const B: PeerId = PeerId::new([0xb; 16]);
    const C: PeerId = PeerId::new([0xc; 16]);

    fn config(bootstrap: Vec<String>) -> GossipConfig {
        GossipConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            bootstrap,
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                max_attempts: 2,
            },
            ..Default::default()
        }
    }

    async fn node(
        id: PeerId,
        bootstrap: Vec<String>,
        admission: AdmissionConfig,
    ) -> (GossipLayer, GossipStreams, broadcast::Sender<()>) {
        let (shutdown, _) = broadcast::channel(1);
        let (layer, streams) = GossipLayer::start(id, config(bootstrap), admission, shutdown.clone())
            .await
            .unwrap();
        (layer, streams, shutdown)
    }

    async fn wait_joined(events: &mut mpsc::UnboundedReceiver<GossipEvent>, peer: PeerId) {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match events.recv().await {
                    Some(GossipEvent::PeerJoined { peer_id, .. }) if peer_id == peer => break,
                    Some(_) => {}
                    None => panic!("event stream closed"),
                }
            }
        })
        .await
        .expect("peer never joined");
    }

    fn batch(author: PeerId, moves: &[(i32, i32)]) -> MovementBatch {
        prove_batch(&CircuitParameters::default(), author, 0, genesis_commitment(), GridPoint::ORIGIN, moves)
            .unwrap()
    }

    #[test]
    fn test_seen_set_dedup_and_capacity() {
        let mut seen = SeenSet::new(2);
        assert!(seen.insert(SeenKey::Batch(A, 0)));
        assert!(!seen.insert(SeenKey::Batch(A, 0)));
        assert!(seen.insert(SeenKey::Beacon(A, 0)));
        assert!(seen.insert(SeenKey::Batch(A, 1)));
        assert_eq!(seen.len(), 2);
        assert!(!seen.contains(&SeenKey::Batch(A, 0)));
        assert!(seen.contains(&SeenKey::Batch(A, 1)));
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let (a, _streams, _shutdown) = node(A, vec![], AdmissionConfig::default()).await;
        let (shutdown, _) = broadcast::channel(1);
        let taken = GossipConfig { listen_addr: a.local_addr(), ..config(vec![]) };
        let result = GossipLayer::start(B, taken, AdmissionConfig::default(), shutdown).await;
        assert!(matches!(result, Err(GossipError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_unresolvable_bootstrap_is_fatal() {
        let (shutdown, _) = broadcast::channel(1);
        let result = GossipLayer::start(
            A,
            config(vec!["not an address".into()]),
            AdmissionConfig::default(),
            shutdown,
        )
        .await;
        assert!(matches!(result, Err(GossipError::Resolve { .. })));
    }

    #[tokio::test]
    async fn test_batch_delivered_once() {
        let (a, mut a_streams, shutdown_a) = node(A, vec![], AdmissionConfig::default()).await;
        let (_b, mut b_streams, shutdown_b) =
            node(B, vec![a.local_addr().to_string()], AdmissionConfig::default()).await;

        wait_joined(&mut a_streams.events, B).await;
        wait_joined(&mut b_streams.events, A).await;

        let sent = batch(A, &[(1, 0); 3]);
        assert_eq!(a.broadcast(&sent).unwrap(), 1);
        a.broadcast(&sent).unwrap();

        let got = tokio::time::timeout(Duration::from_secs(10), b_streams.inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.from, A);
        assert_eq!(got.batch, sent);

        let again = tokio::time::timeout(Duration::from_millis(300), b_streams.inbound.recv()).await;
        assert!(again.is_err(), "duplicate delivered");

        let _ = shutdown_a.send(());
        let _ = shutdown_b.send(());
    }

    #[tokio::test]
    async fn test_relay_and_beacon() {
        let (a, mut a_streams, _sa) = node(A, vec![], AdmissionConfig::default()).await;
        let (b, mut b_streams, _sb) =
            node(B, vec![a.local_addr().to_string()], AdmissionConfig::default()).await;
        wait_joined(&mut a_streams.events, B).await;
        wait_joined(&mut b_streams.events, A).await;

        let (_c, mut c_streams, _sc) =
            node(C, vec![b.local_addr().to_string()], AdmissionConfig::default()).await;
        wait_joined(&mut c_streams.events, B).await;
        wait_joined(&mut b_streams.events, C).await;

        let sent = batch(A, &[(0, 1); 2]);
        a.broadcast(&sent).unwrap();

        let got = tokio::time::timeout(Duration::from_secs(10), c_streams.inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.batch.id(), (A, 0));
        let again = tokio::time::timeout(Duration::from_millis(300), c_streams.inbound.recv()).await;
        assert!(again.is_err(), "duplicate delivered");

        b.announce_beacon(Some(4)).unwrap();
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Some(GossipEvent::Beacon { peer_id, last_batch_seq }) = a_streams.events.recv().await {
                    assert_eq!(peer_id, B);
                    assert_eq!(last_batch_seq, Some(4));
                    break;
                }
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_sync_request_and_catch_up_batches() {
        let (a, mut a_streams, _sa) = node(A, vec![], AdmissionConfig::default()).await;
        let (b, mut b_streams, _sb) =
            node(B, vec![a.local_addr().to_string()], AdmissionConfig::default()).await;
        wait_joined(&mut a_streams.events, B).await;
        wait_joined(&mut b_streams.events, A).await;

        let sent = batch(A, &[(1, 0)]);
        a.broadcast(&sent).unwrap();
        let first = tokio::time::timeout(Duration::from_secs(10), b_streams.inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.batch, sent);

        assert_eq!(b.request_sync(Some(A), vec![(A, 0)]).unwrap(), 1);
        let heads = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match a_streams.events.recv().await {
                    Some(GossipEvent::SyncRequested { peer_id, heads }) => {
                        assert_eq!(peer_id, B);
                        break heads;
                    }
                    Some(_) => {}
                    None => panic!("event stream closed"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(heads, vec![(A, 0)]);

        // Already seen, still delivered: the flooded copy may have been lost upstream
        let own = batch(B, &[(0, 1)]);
        assert_eq!(a.send_batches(B, &[sent.clone(), own]).unwrap(), 1);
        let again = tokio::time::timeout(Duration::from_secs(10), b_streams.inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.from, A);
        assert_eq!(again.batch, sent);
        let own_copy = tokio::time::timeout(Duration::from_millis(300), b_streams.inbound.recv()).await;
        assert!(own_copy.is_err(), "own batch delivered");
    }

    #[tokio::test]
    async fn test_catch_up_batches_reach_only_the_target() {
        let (a, mut a_streams, _sa) = node(A, vec![], AdmissionConfig::default()).await;
        let (_b, mut b_streams, _sb) =
            node(B, vec![a.local_addr().to_string()], AdmissionConfig::default()).await;
        let (_c, mut c_streams, _sc) =
            node(C, vec![a.local_addr().to_string()], AdmissionConfig::default()).await;
        wait_joined(&mut b_streams.events, A).await;
        wait_joined(&mut c_streams.events, A).await;
        tokio::time::timeout(Duration::from_secs(10), async {
            while a.connected_peers().len() < 2 {
                a_streams.events.recv().await;
            }
        })
        .await
        .unwrap();

        a.send_batches(C, &[batch(A, &[(1, 0)])]).unwrap();
        let got = tokio::time::timeout(Duration::from_secs(10), c_streams.inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.batch.id(), (A, 0));

        let leaked = tokio::time::timeout(Duration::from_millis(300), b_streams.inbound.recv()).await;
        assert!(leaked.is_err(), "catch-up frame reached a bystander");
    }

    #[tokio::test]
    async fn test_admission_refusal_exhausts_bootstrap() {
        let gate = AdmissionConfig {
            secret: Some("lobby-secret-key-256-bits-long!!".into()),
            ..Default::default()
        };
        let (a, _a_streams, _sa) = node(A, vec![], gate).await;
        let (_b, mut b_streams, _sb) =
            node(B, vec![a.local_addr().to_string()], AdmissionConfig::default()).await;

        let addr = a.local_addr().to_string();
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match b_streams.events.recv().await {
                    Some(GossipEvent::BootstrapExhausted { addr: exhausted }) => {
                        assert_eq!(exhausted, addr);
                        break;
                    }
                    Some(GossipEvent::PeerJoined { .. }) => panic!("refused peer joined"),
                    Some(_) => {}
                    None => panic!("event stream closed"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(a.link_count(), 0);
    }
}
