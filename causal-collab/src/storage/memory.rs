//! In-memory stores backed by tokio `RwLock` maps.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use causal_core::Atom;
use tokio::sync::RwLock;

use super::{
    AtomStore, ConnectionStore, DeviceConnection, NamespaceConnection, StoreError, StoredUpdates,
    UpdatesStore,
};

// ─── Atoms ──────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryAtomStore {
    namespaces: RwLock<HashMap<String, HashMap<String, Atom>>>,
}

impl MemoryAtomStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AtomStore for MemoryAtomStore {
    async fn save_atoms(&self, namespace: &str, atoms: &[Atom]) -> Result<(), StoreError> {
        if atoms.is_empty() {
            return Ok(());
        }
        let mut namespaces = self.namespaces.write().await;
        let stored = namespaces.entry(namespace.to_string()).or_default();
        for atom in atoms {
            stored
                .entry(atom.hash.clone())
                .or_insert_with(|| atom.clone());
        }
        Ok(())
    }

    async fn load_atoms(&self, namespace: &str) -> Result<Vec<Atom>, StoreError> {
        let namespaces = self.namespaces.read().await;
        let mut atoms: Vec<Atom> = namespaces
            .get(namespace)
            .map(|stored| stored.values().cloned().collect())
            .unwrap_or_default();
        atoms.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.hash.cmp(&b.hash)));
        Ok(atoms)
    }

    async fn count_atoms(&self, namespace: &str) -> Result<usize, StoreError> {
        let namespaces = self.namespaces.read().await;
        Ok(namespaces.get(namespace).map_or(0, HashMap::len))
    }

    async fn delete_atoms(&self, namespace: &str, hashes: &[String]) -> Result<(), StoreError> {
        let mut namespaces = self.namespaces.write().await;
        if let Some(stored) = namespaces.get_mut(namespace) {
            for hash in hashes {
                stored.remove(hash);
            }
            if stored.is_empty() {
                namespaces.remove(namespace);
            }
        }
        Ok(())
    }

    async fn clear_namespace(&self, namespace: &str) -> Result<(), StoreError> {
        self.namespaces.write().await.remove(namespace);
        Ok(())
    }
}

// ─── Updates ────────────────────────────────────────────────

#[derive(Default)]
struct BranchUpdates {
    entries: Vec<(String, u64)>,
    bytes: usize,
}

/// Updates store with an optional cumulative byte limit per branch.
#[derive(Default)]
pub struct MemoryUpdatesStore {
    branches: RwLock<HashMap<String, BranchUpdates>>,
    max_bytes: Option<usize>,
}

impl MemoryUpdatesStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject writes that would take a branch past `max_bytes`.
    pub fn with_max_bytes(max_bytes: usize) -> Self {
        Self {
            branches: RwLock::default(),
            max_bytes: Some(max_bytes),
        }
    }
}

#[async_trait]
impl UpdatesStore for MemoryUpdatesStore {
    async fn add_updates(
        &self,
        branch: &str,
        updates: &[String],
        timestamp: u64,
    ) -> Result<(), StoreError> {
        let mut branches = self.branches.write().await;
        let stored = branches.entry(branch.to_string()).or_default();
        let incoming: usize = updates.iter().map(String::len).sum();

        if let Some(limit) = self.max_bytes {
            if stored.bytes + incoming > limit {
                return Err(StoreError::LimitExceeded {
                    branch: branch.to_string(),
                    limit,
                });
            }
        }

        stored.bytes += incoming;
        stored
            .entries
            .extend(updates.iter().map(|u| (u.clone(), timestamp)));
        Ok(())
    }

    async fn get_updates(&self, branch: &str) -> Result<StoredUpdates, StoreError> {
        let branches = self.branches.read().await;
        let Some(stored) = branches.get(branch) else {
            return Ok(StoredUpdates::default());
        };
        let (updates, timestamps) = stored.entries.iter().cloned().unzip();
        Ok(StoredUpdates {
            updates,
            timestamps,
        })
    }

    async fn clear_updates(&self, branch: &str) -> Result<(), StoreError> {
        self.branches.write().await.remove(branch);
        Ok(())
    }
}

// ─── Connections ────────────────────────────────────────────

#[derive(Default)]
struct ConnectionTables {
    connections: HashMap<String, DeviceConnection>,
    /// namespace → connection id → membership
    namespaces: HashMap<String, BTreeMap<String, NamespaceConnection>>,
}

#[derive(Default)]
pub struct MemoryConnectionStore {
    tables: RwLock<ConnectionTables>,
}

impl MemoryConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConnectionStore for MemoryConnectionStore {
    async fn save_connection(&self, connection: DeviceConnection) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables
            .connections
            .insert(connection.connection_id.clone(), connection);
        Ok(())
    }

    async fn get_connection(
        &self,
        connection_id: &str,
    ) -> Result<Option<DeviceConnection>, StoreError> {
        Ok(self.tables.read().await.connections.get(connection_id).cloned())
    }

    async fn clear_connection(&self, connection_id: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables.connections.remove(connection_id);
        tables.namespaces.retain(|_, members| {
            members.remove(connection_id);
            !members.is_empty()
        });
        Ok(())
    }

    async fn save_namespace_connection(
        &self,
        connection: NamespaceConnection,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables
            .namespaces
            .entry(connection.namespace.clone())
            .or_default()
            .insert(connection.connection_id.clone(), connection);
        Ok(())
    }

    async fn delete_namespace_connection(
        &self,
        connection_id: &str,
        namespace: &str,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if let Some(members) = tables.namespaces.get_mut(namespace) {
            members.remove(connection_id);
            if members.is_empty() {
                tables.namespaces.remove(namespace);
            }
        }
        Ok(())
    }

    async fn get_namespace_connection(
        &self,
        connection_id: &str,
        namespace: &str,
    ) -> Result<Option<NamespaceConnection>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .namespaces
            .get(namespace)
            .and_then(|members| members.get(connection_id))
            .cloned())
    }

    async fn get_connections_by_namespace(
        &self,
        namespace: &str,
    ) -> Result<Vec<NamespaceConnection>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .namespaces
            .get(namespace)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn count_connections_by_namespace(&self, namespace: &str) -> Result<usize, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.namespaces.get(namespace).map_or(0, BTreeMap::len))
    }

    async fn get_connections(
        &self,
        connection_id: &str,
    ) -> Result<Vec<NamespaceConnection>, StoreError> {
        let tables = self.tables.read().await;
        let mut memberships: Vec<NamespaceConnection> = tables
            .namespaces
            .values()
            .filter_map(|members| members.get(connection_id).cloned())
            .collect();
        memberships.sort_by(|a, b| a.namespace.cmp(&b.namespace));
        Ok(memberships)
    }

    async fn count_connections(&self) -> Result<usize, StoreError> {
        Ok(self.tables.read().await.connections.len())
    }
}
