//! Store interfaces the relay is built on.
//!
//! Architecture:
//! ```text
//! ┌──────────────────┐  atoms    ┌──────────────┐
//! │                  │ ────────► │ AtomStore    │  namespace → atoms by hash
//! │ CausalRepoServer │  updates  ┌──────────────┐
//! │ (stateless)      │ ────────► │ UpdatesStore │  branch → (update, timestamp)*
//! │                  │  members  ┌────────────────┐
//! │                  │ ────────► │ConnectionStore │  connections + memberships
//! └──────────────────┘           └────────────────┘
//! ```
//!
//! All cross-request state lives behind these traits, so several relay
//! instances can share one backend. Counts used for garbage collection are
//! always read back from the store after a mutation.
//!
//! The [`memory`] implementations are single-process only.

pub mod memory;

use async_trait::async_trait;
use causal_core::Atom;
use serde::{Deserialize, Serialize};

use crate::protocol::{DeviceInfo, SyncProtocol};

pub use memory::{MemoryAtomStore, MemoryConnectionStore, MemoryUpdatesStore};

/// A device connected to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConnection {
    pub connection_id: String,
    pub session_id: String,
    pub username: String,
    /// Opaque, passed through untouched.
    pub token: Option<String>,
}

impl DeviceConnection {
    pub fn new(
        connection_id: impl Into<String>,
        session_id: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            session_id: session_id.into(),
            username: username.into(),
            token: None,
        }
    }

    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            connection_id: self.connection_id.clone(),
            session_id: self.session_id.clone(),
            username: self.username.clone(),
        }
    }
}

/// Membership of a connection in a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceConnection {
    pub connection_id: String,
    pub session_id: String,
    pub username: String,
    pub token: Option<String>,
    pub namespace: String,
    pub temporary: bool,
    pub protocol: SyncProtocol,
}

impl NamespaceConnection {
    pub fn new(
        connection: &DeviceConnection,
        namespace: impl Into<String>,
        temporary: bool,
        protocol: SyncProtocol,
    ) -> Self {
        Self {
            connection_id: connection.connection_id.clone(),
            session_id: connection.session_id.clone(),
            username: connection.username.clone(),
            token: connection.token.clone(),
            namespace: namespace.into(),
            temporary,
            protocol,
        }
    }

    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            connection_id: self.connection_id.clone(),
            session_id: self.session_id.clone(),
            username: self.username.clone(),
        }
    }
}

/// Updates of a branch with their server-assigned timestamps, index-aligned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredUpdates {
    pub updates: Vec<String>,
    pub timestamps: Vec<u64>,
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Backend failure
    Backend(String),
    /// Write would exceed the configured size of a branch
    LimitExceeded { branch: String, limit: usize },
    /// Record could not be encoded or decoded
    SerializationError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Backend(e) => write!(f, "Store backend error: {e}"),
            StoreError::LimitExceeded { branch, limit } => {
                write!(f, "Branch {branch} exceeds the {limit} byte limit")
            }
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Atoms per namespace, addressed by hash.
#[async_trait]
pub trait AtomStore: Send + Sync {
    /// Saving an atom whose hash is already stored is a no-op.
    async fn save_atoms(&self, namespace: &str, atoms: &[Atom]) -> Result<(), StoreError>;

    /// All atoms ordered by `(timestamp, site)`; empty for unknown namespaces.
    async fn load_atoms(&self, namespace: &str) -> Result<Vec<Atom>, StoreError>;

    async fn count_atoms(&self, namespace: &str) -> Result<usize, StoreError>;

    async fn delete_atoms(&self, namespace: &str, hashes: &[String]) -> Result<(), StoreError>;

    async fn clear_namespace(&self, namespace: &str) -> Result<(), StoreError>;
}

/// Opaque updates per branch.
#[async_trait]
pub trait UpdatesStore: Send + Sync {
    /// Append updates, all stamped with `timestamp`.
    async fn add_updates(
        &self,
        branch: &str,
        updates: &[String],
        timestamp: u64,
    ) -> Result<(), StoreError>;

    async fn get_updates(&self, branch: &str) -> Result<StoredUpdates, StoreError>;

    async fn clear_updates(&self, branch: &str) -> Result<(), StoreError>;
}

/// Connections and their namespace memberships.
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn save_connection(&self, connection: DeviceConnection) -> Result<(), StoreError>;

    async fn get_connection(
        &self,
        connection_id: &str,
    ) -> Result<Option<DeviceConnection>, StoreError>;

    /// Remove the connection and every membership it holds.
    async fn clear_connection(&self, connection_id: &str) -> Result<(), StoreError>;

    async fn save_namespace_connection(
        &self,
        connection: NamespaceConnection,
    ) -> Result<(), StoreError>;

    async fn delete_namespace_connection(
        &self,
        connection_id: &str,
        namespace: &str,
    ) -> Result<(), StoreError>;

    async fn get_namespace_connection(
        &self,
        connection_id: &str,
        namespace: &str,
    ) -> Result<Option<NamespaceConnection>, StoreError>;

    async fn get_connections_by_namespace(
        &self,
        namespace: &str,
    ) -> Result<Vec<NamespaceConnection>, StoreError>;

    async fn count_connections_by_namespace(&self, namespace: &str) -> Result<usize, StoreError>;

    /// Every membership held by one connection.
    async fn get_connections(
        &self,
        connection_id: &str,
    ) -> Result<Vec<NamespaceConnection>, StoreError>;

    /// Number of connected devices.
    async fn count_connections(&self) -> Result<usize, StoreError>;
}
