//! # causal-collab — Branch-sync relay and client partition
//!
//! Replicates causal branches between devices through a central relay.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐    WebSocket     ┌──────────────────┐
//! │ CausalPartition  │ ◄──────────────► │ RelayServer      │
//! │ (per device)     │    JSON frames   │ (socket tasks)   │
//! └────────┬─────────┘                  └────────┬─────────┘
//!          │                                     │
//!          ▼                                     ▼
//! ┌──────────────────┐                  ┌──────────────────┐
//! │ Weave / BotsDoc  │                  │ CausalRepoServer │
//! │ (causal-core)    │                  │ watch · GC · fan │
//! └──────────────────┘                  └────────┬─────────┘
//!                                                │
//!                              ┌─────────────────┼─────────────────┐
//!                              ▼                 ▼                 ▼
//!                         AtomStore        UpdatesStore     ConnectionStore
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire messages (`{name, data}` frames)
//! - [`storage`] — Store traits and in-memory implementations
//! - [`messenger`] — Fan-out to connections, stale recipient reporting
//! - [`presence`] — Namespaces and device-side presence tracking
//! - [`runtime`] — Injected clock and random source
//! - [`relay`] — The relay protocol engine
//! - [`server`] — WebSocket transport for the relay
//! - [`client`] — WebSocket client with offline queue
//! - [`partition`] — Client-side apply/diff engine

pub mod client;
pub mod messenger;
pub mod partition;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod runtime;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use client::{ClientEvent, ConnectionState, OfflineQueue, RelayClient};
pub use messenger::{ChannelMessenger, DeliveryReport, MemoryMessenger, Messenger, MessengerStats};
pub use partition::{
    CausalPartition, PartitionConfig, PartitionDriver, PartitionEvent, PartitionHandle,
};
pub use presence::{BranchDevices, PresenceChange};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage, SyncProtocol};
pub use relay::{BranchData, CausalRepoServer, RelayError, WebhookRequest, WebhookStatus};
pub use runtime::{Clock, ManualClock, RandomSource, SystemClock};
pub use server::{RelayServer, ServerConfig, ServerStats};
pub use storage::{
    AtomStore, ConnectionStore, DeviceConnection, MemoryAtomStore, MemoryConnectionStore,
    MemoryUpdatesStore, NamespaceConnection, StoreError, UpdatesStore,
};
