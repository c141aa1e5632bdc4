//! UI WebSocket Server
//!
//! Serves the state feed to browser clients and accepts key presses.
//! Clients get a snapshot on connect and afterwards only when the snapshot
//! actually changed.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::interval;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn, error, debug, instrument};

use crate::feed::{StateFeed, StateSnapshot};
use crate::network::protocol::{UiClientMessage, UiServerMessage};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent UI connections.
    pub max_connections: usize,
    /// Idle clients are dropped after this long.
    pub idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3001)),
            max_connections: 16,
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// UI server errors.
#[derive(Debug, thiserror::Error)]
pub enum UiServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection limit reached.
    #[error("Connection limit reached")]
    ConnectionLimitReached,
}

/// Connected client state.
struct ConnectedClient {
    /// Connection time.
    connected_at: Instant,
    /// Last inbound message.
    last_activity: Instant,
}

/// The UI server.
pub struct UiServer {
    config: ServerConfig,
    feed: StateFeed,
    clients: Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl UiServer {
    /// Create a new UI server over `feed`.
    pub fn new(config: ServerConfig, feed: StateFeed) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            feed,
            clients: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_tx,
        }
    }

    /// Bind the listener. Separate from `serve` so bind errors surface at startup.
    pub async fn bind(&self) -> Result<TcpListener, UiServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("UI server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept clients on `listener` until shutdown.
    #[instrument(skip(self, listener))]
    pub async fn serve(&self, listener: TcpListener) {
        let cleanup_clients = self.clients.clone();
        let idle_timeout = self.config.idle_timeout;
        let cleanup_handle = tokio::spawn(async move {
            Self::run_cleanup_loop(cleanup_clients, idle_timeout).await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.clients.read().await.len();
                            if clients_count >= self.config.max_connections {
                                warn!("{}, rejecting {}", UiServerError::ConnectionLimitReached, addr);
                                continue;
                            }

                            info!("New UI connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("UI server shutting down");
                    break;
                }
            }
        }

        cleanup_handle.abort();
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let clients = self.clients.clone();
        let feed = self.feed.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<UiServerMessage>(64);

            {
                let mut clients = clients.write().await;
                clients.insert(addr, ConnectedClient {
                    connected_at: Instant::now(),
                    last_activity: Instant::now(),
                });
            }

            // Spawn message sender task
            let sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                let _ = ws_sender.close().await;
            });

            let mut changes = feed.changes();
            let mut notices = feed.notices();
            let mut last_sent: Option<StateSnapshot> = None;
            Self::push_snapshot(&feed, &msg_tx, &mut last_sent, true).await;

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                {
                                    let mut clients = clients.write().await;
                                    if let Some(client) = clients.get_mut(&addr) {
                                        client.last_activity = Instant::now();
                                    }
                                }

                                match UiClientMessage::from_json(&text) {
                                    Ok(UiClientMessage::KeyPress { key }) => {
                                        debug!("Key {:?} from {}", key, addr);
                                        feed.apply_command(key);
                                    }
                                    Ok(UiClientMessage::SyncRequest) => {
                                        Self::push_snapshot(&feed, &msg_tx, &mut last_sent, true).await;
                                    }
                                    Err(e) => {
                                        debug!("Invalid message from {}: {}", addr, e);
                                        let _ = msg_tx.send(UiServerMessage::Error {
                                            message: "Invalid message format".to_string(),
                                        }).await;
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("UI client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                error!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        Self::push_snapshot(&feed, &msg_tx, &mut last_sent, false).await;
                    }
                    notice = notices.recv() => {
                        match notice {
                            Ok(message) => {
                                let _ = msg_tx.send(UiServerMessage::PeerEvent { message }).await;
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                debug!("UI client {} missed {} notices", addr, n);
                            }
                            Err(broadcast::error::RecvError::Closed) => {}
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }

            drop(msg_tx);
            let _ = tokio::time::timeout(Duration::from_secs(1), sender_task).await;

            let session = clients.write().await.remove(&addr);
            if let Some(client) = session {
                info!("UI client {} cleaned up after {:?}", addr, client.connected_at.elapsed());
            }
        });
    }

    /// Send the current snapshot unless it equals the last one sent.
    async fn push_snapshot(
        feed: &StateFeed,
        sender: &mpsc::Sender<UiServerMessage>,
        last_sent: &mut Option<StateSnapshot>,
        force: bool,
    ) {
        let snapshot = feed.snapshot().await;
        if !force && last_sent.as_ref() == Some(&snapshot) {
            return;
        }
        *last_sent = Some(snapshot.clone());
        let _ = sender.send(UiServerMessage::StateUpdate(snapshot)).await;
    }

    /// Drop clients that have been silent too long.
    async fn run_cleanup_loop(
        clients: Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>,
        idle_timeout: Duration,
    ) {
        let mut interval = interval(Duration::from_secs(60));

        loop {
            interval.tick().await;

            let now = Instant::now();
            let mut clients = clients.write().await;
            clients.retain(|addr, c| {
                let idle = now.duration_since(c.last_activity) > idle_timeout;
                if idle {
                    info!("Removed idle UI client {}", addr);
                }
                !idle
            });
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }
}
