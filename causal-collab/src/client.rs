//! WebSocket client for talking to the relay.
//!
//! Provides:
//! - Connection lifecycle (connect, login, disconnect)
//! - Typed send/receive of protocol messages
//! - Offline queue for messages sent while disconnected
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ClientMessage, Login, ProtocolError, ServerMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Login acknowledged by the relay
    Connected { connection_id: String },
    /// Connection lost
    Disconnected,
    /// Any other relay message
    Message(ServerMessage),
}

/// Messages sent while disconnected, replayed in order on reconnect.
pub struct OfflineQueue {
    queue: VecDeque<ClientMessage>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Returns false when the queue is full.
    pub fn enqueue(&mut self, message: ClientMessage) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(message);
        true
    }

    pub fn drain(&mut self) -> Vec<ClientMessage> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// Relay client.
pub struct RelayClient {
    login: Login,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    offline_queue: Arc<Mutex<OfflineQueue>>,
    outgoing_tx: Option<mpsc::Sender<String>>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    event_tx: mpsc::Sender<ClientEvent>,
}

impl RelayClient {
    pub fn new(login: Login, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            login,
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect, log in and replay the offline queue.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok(connected) => connected,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        out_tx
            .send(ClientMessage::Login(self.login.clone()).encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        {
            let mut queue = self.offline_queue.lock().await;
            let queued = queue.drain();
            if !queued.is_empty() {
                log::info!("Replaying {} queued messages", queued.len());
            }
            for message in queued {
                out_tx
                    .send(message.encode()?)
                    .await
                    .map_err(|_| ProtocolError::ConnectionClosed)?;
            }
        }
        self.outgoing_tx = Some(out_tx);
        *self.state.write().await = ConnectionState::Connected;

        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        let message = match ServerMessage::decode(&text) {
                            Ok(message) => message,
                            Err(e) => {
                                log::warn!("Failed to decode relay frame: {e}");
                                continue;
                            }
                        };
                        let event = match message {
                            ServerMessage::LoginResult(result) => ClientEvent::Connected {
                                connection_id: result.connection_id,
                            },
                            other => ClientEvent::Message(other),
                        };
                        if event_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Send a message, queueing it while disconnected.
    pub async fn send(&self, message: ClientMessage) -> Result<(), ProtocolError> {
        let state = *self.state.read().await;
        let Some(tx) = self.outgoing_tx.as_ref().filter(|_| state == ConnectionState::Connected)
        else {
            let mut queue = self.offline_queue.lock().await;
            if !queue.enqueue(message) {
                return Err(ProtocolError::ConnectionClosed);
            }
            return Ok(());
        };

        tx.send(message.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Close the connection. Later sends are queued.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}
