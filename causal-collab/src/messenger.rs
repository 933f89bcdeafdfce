//! Fan-out delivery of relay messages to connections.
//!
//! A send encodes the message once and hands the shared text to each
//! recipient's outbound queue. One failing recipient never aborts the batch;
//! it is reported as stale so the relay can purge it from the stores.
//!
//! ```text
//!                 ┌──► conn A  mpsc ──► socket task A
//! ServerMessage ──┼──► conn B  mpsc ──► socket task B
//!   (encoded)     └──╳ conn C  closed  → DeliveryReport.stale
//! ```
//!
//! Reference: Kleppmann, Chapter 8 — Broadcast Protocols

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};

use crate::protocol::{ProtocolError, ServerMessage};

/// Outcome of one fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    /// Recipients that could not be reached and should be purged.
    pub stale: Vec<String>,
}

#[async_trait]
pub trait Messenger: Send + Sync {
    /// Deliver `message` to every id in `connection_ids` except `exclude`.
    async fn send_message(
        &self,
        connection_ids: &[String],
        message: &ServerMessage,
        exclude: Option<&str>,
    ) -> Result<DeliveryReport, ProtocolError>;
}

// ─── Channel messenger ──────────────────────────────────────

/// Statistics for monitoring delivery health.
#[derive(Debug, Clone, Default)]
pub struct MessengerStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_connections: usize,
}

/// Delivers to per-connection tokio mpsc queues owned by socket tasks.
///
/// A closed or full queue marks the recipient stale.
pub struct ChannelMessenger {
    senders: RwLock<HashMap<String, mpsc::Sender<Arc<str>>>>,
    capacity: usize,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl ChannelMessenger {
    /// `capacity` is the number of frames buffered per connection.
    pub fn new(capacity: usize) -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    /// Register a connection and return the receiving end of its queue.
    pub async fn register(&self, connection_id: &str) -> mpsc::Receiver<Arc<str>> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.senders
            .write()
            .await
            .insert(connection_id.to_string(), tx);
        rx
    }

    pub async fn unregister(&self, connection_id: &str) -> bool {
        self.senders.write().await.remove(connection_id).is_some()
    }

    pub async fn is_registered(&self, connection_id: &str) -> bool {
        self.senders.read().await.contains_key(connection_id)
    }

    pub async fn stats(&self) -> MessengerStats {
        MessengerStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            active_connections: self.senders.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[async_trait]
impl Messenger for ChannelMessenger {
    async fn send_message(
        &self,
        connection_ids: &[String],
        message: &ServerMessage,
        exclude: Option<&str>,
    ) -> Result<DeliveryReport, ProtocolError> {
        let encoded: Arc<str> = Arc::from(message.encode()?);
        let mut report = DeliveryReport::default();
        let mut closed = Vec::new();

        {
            let senders = self.senders.read().await;
            for id in connection_ids {
                if exclude == Some(id.as_str()) {
                    continue;
                }
                let Some(sender) = senders.get(id) else {
                    log::debug!("No outbound queue for {id}");
                    report.stale.push(id.clone());
                    continue;
                };
                match sender.try_send(encoded.clone()) {
                    Ok(()) => report.delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        log::warn!("Outbound queue full for {id}, dropping connection");
                        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
                        report.stale.push(id.clone());
                        closed.push(id.clone());
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
                        report.stale.push(id.clone());
                        closed.push(id.clone());
                    }
                }
            }
        }

        if !closed.is_empty() {
            let mut senders = self.senders.write().await;
            for id in &closed {
                senders.remove(id);
            }
        }

        self.messages_sent
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        Ok(report)
    }
}

// ─── Memory messenger ───────────────────────────────────────

/// Records every delivered message. Recipients can be marked failing.
#[derive(Default)]
pub struct MemoryMessenger {
    sent: RwLock<Vec<(String, ServerMessage)>>,
    failing: RwLock<HashSet<String>>,
}

impl MemoryMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliveries to `connection_id` will be reported stale.
    pub async fn fail(&self, connection_id: &str) {
        self.failing.write().await.insert(connection_id.to_string());
    }

    /// Messages delivered to one connection, in order.
    pub async fn messages_for(&self, connection_id: &str) -> Vec<ServerMessage> {
        self.sent
            .read()
            .await
            .iter()
            .filter(|(id, _)| id == connection_id)
            .map(|(_, msg)| msg.clone())
            .collect()
    }

    /// Every delivery as `(connection id, message)`.
    pub async fn all_messages(&self) -> Vec<(String, ServerMessage)> {
        self.sent.read().await.clone()
    }

    pub async fn clear(&self) {
        self.sent.write().await.clear();
    }
}

#[async_trait]
impl Messenger for MemoryMessenger {
    async fn send_message(
        &self,
        connection_ids: &[String],
        message: &ServerMessage,
        exclude: Option<&str>,
    ) -> Result<DeliveryReport, ProtocolError> {
        let failing = self.failing.read().await;
        let mut sent = self.sent.write().await;
        let mut report = DeliveryReport::default();

        for id in connection_ids {
            if exclude == Some(id.as_str()) {
                continue;
            }
            if failing.contains(id) {
                report.stale.push(id.clone());
                continue;
            }
            sent.push((id.clone(), message.clone()));
            report.delivered += 1;
        }

        Ok(report)
    }
}
