//! WebSocket transport for the relay.
//!
//! Architecture:
//! ```text
//! Device A ──┐                          ┌── AtomStore
//!            ├── socket task ──► CausalRepoServer ──┼── UpdatesStore
//! Device B ──┘      ▲                   └── ConnectionStore
//!                   │                         │
//!                   └── mpsc ◄── ChannelMessenger
//! ```
//!
//! Each socket task owns one connection: it assigns a connection id,
//! registers an outbound queue with the messenger, waits for `login`, then
//! feeds every decoded frame to the relay one at a time. Closing the socket
//! (or the messenger dropping the queue) disconnects the device.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 8

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::messenger::ChannelMessenger;
use crate::protocol::ClientMessage;
use crate::relay::CausalRepoServer;
use crate::runtime::{Clock, SystemClock};
use crate::storage::{
    AtomStore, ConnectionStore, MemoryAtomStore, MemoryConnectionStore, MemoryUpdatesStore,
    UpdatesStore,
};

pub const ENV_BIND: &str = "CAUSAL_RELAY_BIND";
pub const ENV_MAX_UPDATE_BYTES: &str = "CAUSAL_RELAY_MAX_UPDATE_BYTES";
pub const ENV_CHANNEL_CAPACITY: &str = "CAUSAL_RELAY_CHANNEL_CAPACITY";

/// Server configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound frames buffered per connection before it is dropped
    pub channel_capacity: usize,
    /// Cumulative update bytes allowed per branch (None = unlimited)
    pub max_update_bytes: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            channel_capacity: 256,
            max_update_bytes: None,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `CAUSAL_RELAY_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(bind) = lookup(ENV_BIND) {
            config.bind_addr = bind;
        }
        if let Some(raw) = lookup(ENV_CHANNEL_CAPACITY) {
            match raw.parse::<usize>() {
                Ok(capacity) if capacity > 0 => config.channel_capacity = capacity,
                _ => log::warn!("Ignoring invalid {ENV_CHANNEL_CAPACITY}={raw}"),
            }
        }
        if let Some(raw) = lookup(ENV_MAX_UPDATE_BYTES) {
            match raw.parse::<usize>() {
                Ok(limit) => config.max_update_bytes = Some(limit),
                Err(e) => log::warn!("Ignoring invalid {ENV_MAX_UPDATE_BYTES}={raw}: {e}"),
            }
        }

        config
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_messages: u64,
}

/// Per-connection handles shared by every socket task.
#[derive(Clone)]
struct Shared {
    relay: CausalRepoServer,
    messenger: Arc<ChannelMessenger>,
    clock: Arc<dyn Clock>,
    stats: Arc<RwLock<ServerStats>>,
}

/// The relay behind a WebSocket listener.
pub struct RelayServer {
    config: ServerConfig,
    shared: Shared,
}

impl RelayServer {
    /// Relay over in-memory stores.
    pub fn new(config: ServerConfig) -> Self {
        let updates: Arc<dyn UpdatesStore> = match config.max_update_bytes {
            Some(limit) => Arc::new(MemoryUpdatesStore::with_max_bytes(limit)),
            None => Arc::new(MemoryUpdatesStore::new()),
        };
        Self::with_stores(
            config,
            Arc::new(MemoryAtomStore::new()),
            updates,
            Arc::new(MemoryConnectionStore::new()),
        )
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn with_stores(
        config: ServerConfig,
        atoms: Arc<dyn AtomStore>,
        updates: Arc<dyn UpdatesStore>,
        connections: Arc<dyn ConnectionStore>,
    ) -> Self {
        let messenger = Arc::new(ChannelMessenger::new(config.channel_capacity));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let relay = CausalRepoServer::new(atoms, updates, connections, messenger.clone())
            .with_clock(clock.clone());

        Self {
            config,
            shared: Shared {
                relay,
                messenger,
                clock,
                stats: Arc::new(RwLock::new(ServerStats::default())),
            },
        }
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Causal relay listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        shared: Shared,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let connection_id = Uuid::new_v4().to_string();
        let mut outbound = shared.messenger.register(&connection_id).await;
        log::info!("WebSocket connection {connection_id} established from {addr}");

        {
            let mut s = shared.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut logged_in = false;
        let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            let received_at = shared.clock.now();
                            {
                                let mut s = shared.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += text.len() as u64;
                            }

                            let message = match ClientMessage::decode(&text) {
                                Ok(message) => message,
                                Err(e) => {
                                    log::warn!("Failed to decode frame from {connection_id}: {e}");
                                    shared.stats.write().await.rejected_messages += 1;
                                    continue;
                                }
                            };

                            let is_login = matches!(message, ClientMessage::Login(_));
                            if !logged_in && !is_login {
                                log::warn!("Dropping {} from {connection_id} before login", message.name());
                                shared.stats.write().await.rejected_messages += 1;
                                continue;
                            }
                            logged_in |= is_login;

                            if let Err(e) = shared
                                .relay
                                .handle_message(&connection_id, message, received_at)
                                .await
                            {
                                log::error!("Relay failed handling message from {connection_id}: {e}");
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection {connection_id} closed from {addr}");
                            break Ok(());
                        }

                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                break Err(e.into());
                            }
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break Err(e.into());
                        }

                        _ => {}
                    }
                }

                frame = outbound.recv() => {
                    match frame {
                        Some(text) => {
                            if let Err(e) = ws_sender.send(Message::Text(text.to_string().into())).await {
                                break Err(e.into());
                            }
                        }
                        None => {
                            log::warn!("Outbound queue for {connection_id} closed, dropping connection");
                            break Ok(());
                        }
                    }
                }
            }
        };

        shared.messenger.unregister(&connection_id).await;
        if logged_in {
            if let Err(e) = shared.relay.disconnect(&connection_id).await {
                log::error!("Failed to disconnect {connection_id}: {e}");
            }
        }

        {
            let mut s = shared.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }

        result
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// The relay, for calls that do not come from a socket (webhooks,
    /// branch data).
    pub fn relay(&self) -> &CausalRepoServer {
        &self.shared.relay
    }
}
