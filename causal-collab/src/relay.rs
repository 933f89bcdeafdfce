//! The branch-sync relay.
//!
//! Architecture:
//! ```text
//!  device ── ClientMessage ──► CausalRepoServer ──► AtomStore / UpdatesStore
//!                                    │                   (persist first)
//!                                    ├──► ConnectionStore (memberships)
//!                                    │
//!                                    └──► Messenger ──► other watchers
//!                                             │
//!                                             └── stale ids ──► purge
//! ```
//!
//! The relay holds no state of its own. Every call reads what it needs from
//! the injected stores, so watcher counts used for garbage collection are
//! always the ones the store reports after the mutation.
//!
//! Per-connection lifecycle:
//! ```text
//! CONNECTED ──watch──► WATCHING(branch, protocol, temporary)* ──disconnect──► gone
//! ```
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapters 5 & 8

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use causal_core::{atomize_bot, fold_updates, Atom, AtomOp, BotsState, CoreError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::messenger::{DeliveryReport, Messenger};
use crate::presence::{branch_namespace, watched_branch_namespace, Namespace};
use crate::protocol::{
    AddAtoms, AddUpdates, AtomsReceived, BranchInfo, ClientMessage, DeviceConnected, DeviceCount,
    DeviceDisconnected, DeviceInfo, DeviceSelector, GetUpdates, LoginResult, ProtocolError,
    ReceiveEvent, RemoteAction, SendEvent, ServerMessage, SyncProtocol, SyncTimeRequest,
    SyncTimeResponse, UpdatesReceived, WatchBranch, MAX_SIZE_REACHED, ON_WEBHOOK,
};
use crate::runtime::{Clock, RandomSource, SystemClock, UuidRandom};
use crate::storage::{
    AtomStore, ConnectionStore, DeviceConnection, NamespaceConnection, StoreError, UpdatesStore,
};

/// Version tag of [`BranchData`].
pub const BRANCH_DATA_VERSION: u32 = 1;

/// Inbound webhook call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WebhookRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

impl WebhookRequest {
    fn is_json(&self) -> bool {
        self.headers.iter().any(|(name, value)| {
            name.eq_ignore_ascii_case("content-type") && value.contains("application/json")
        })
    }

    /// Body as JSON when declared so, otherwise as a plain string.
    pub fn parse_body(&self) -> Result<Value, serde_json::Error> {
        match self.body.as_deref() {
            None | Some("") => Ok(Value::Null),
            Some(body) if self.is_json() => serde_json::from_str(body),
            Some(body) => Ok(Value::String(body.to_string())),
        }
    }
}

/// Result of a webhook call, mapped onto HTTP status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookStatus {
    Delivered,
    BadRequest,
    NotFound,
    Unavailable,
}

impl WebhookStatus {
    pub fn code(&self) -> u16 {
        match self {
            WebhookStatus::Delivered => 200,
            WebhookStatus::BadRequest => 400,
            WebhookStatus::NotFound => 404,
            WebhookStatus::Unavailable => 503,
        }
    }
}

/// State of an updates-protocol branch, read without a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchData {
    pub version: u32,
    pub state: BotsState,
}

/// Relay errors.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayError {
    Store(StoreError),
    Protocol(ProtocolError),
    Core(CoreError),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::Store(e) => write!(f, "Store error: {e}"),
            RelayError::Protocol(e) => write!(f, "Protocol error: {e}"),
            RelayError::Core(e) => write!(f, "Data error: {e}"),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<StoreError> for RelayError {
    fn from(e: StoreError) -> Self {
        RelayError::Store(e)
    }
}

impl From<ProtocolError> for RelayError {
    fn from(e: ProtocolError) -> Self {
        RelayError::Protocol(e)
    }
}

impl From<CoreError> for RelayError {
    fn from(e: CoreError) -> Self {
        RelayError::Core(e)
    }
}

/// Branch protocol over injected stores and a messenger.
#[derive(Clone)]
pub struct CausalRepoServer {
    atoms: Arc<dyn AtomStore>,
    updates: Arc<dyn UpdatesStore>,
    connections: Arc<dyn ConnectionStore>,
    messenger: Arc<dyn Messenger>,
    random: Arc<dyn RandomSource>,
    clock: Arc<dyn Clock>,
}

impl CausalRepoServer {
    pub fn new(
        atoms: Arc<dyn AtomStore>,
        updates: Arc<dyn UpdatesStore>,
        connections: Arc<dyn ConnectionStore>,
        messenger: Arc<dyn Messenger>,
    ) -> Self {
        Self {
            atoms,
            updates,
            connections,
            messenger,
            random: Arc::new(UuidRandom),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    // ─── Dispatch ───────────────────────────────────────────

    /// Handle one decoded client message. `received_at` is the clock reading
    /// taken when the frame arrived.
    pub async fn handle_message(
        &self,
        connection_id: &str,
        message: ClientMessage,
        received_at: u64,
    ) -> Result<(), RelayError> {
        log::debug!("{connection_id} → {}", message.name());
        match message {
            ClientMessage::Login(login) => {
                let connection = DeviceConnection {
                    connection_id: connection_id.to_string(),
                    session_id: login.session_id,
                    username: login.username,
                    token: login.token,
                };
                self.connect(connection).await?;
                let reply = ServerMessage::LoginResult(LoginResult {
                    connection_id: connection_id.to_string(),
                });
                self.reply(connection_id, &reply).await
            }
            ClientMessage::WatchBranch(watch) => self.watch_branch(connection_id, watch).await,
            ClientMessage::UnwatchBranch(branch) => {
                self.unwatch_branch(connection_id, &branch).await
            }
            ClientMessage::AddAtoms(add) => self.add_atoms(connection_id, add).await,
            ClientMessage::AddUpdates(add) => self.add_updates(connection_id, add).await,
            ClientMessage::GetUpdates(get) => self.get_updates(connection_id, get).await,
            ClientMessage::SendEvent(send) => self.send_event(connection_id, send).await,
            ClientMessage::WatchBranchDevices(branch) => {
                self.watch_branch_devices(connection_id, &branch).await
            }
            ClientMessage::UnwatchBranchDevices(branch) => {
                self.unwatch_branch_devices(connection_id, &branch).await
            }
            ClientMessage::DeviceCount(branch) => {
                self.device_count(connection_id, branch.as_deref()).await
            }
            ClientMessage::SyncTime(request) => {
                self.sync_time(connection_id, request, received_at).await
            }
        }
    }

    // ─── Connections ────────────────────────────────────────

    /// Record a connection. Reconnecting with the same id replaces it.
    pub async fn connect(&self, connection: DeviceConnection) -> Result<(), RelayError> {
        log::info!(
            "Device {} connected (session {}, user {})",
            connection.connection_id,
            connection.session_id,
            connection.username
        );
        self.connections.save_connection(connection).await?;
        Ok(())
    }

    /// Tear down every membership of a connection, then forget it.
    pub async fn disconnect(&self, connection_id: &str) -> Result<(), RelayError> {
        let memberships = self.connections.get_connections(connection_id).await?;

        // Presence subscriptions first, so the device is not told about itself.
        for membership in &memberships {
            if let Some(Namespace::WatchedBranch(_)) = Namespace::parse(&membership.namespace) {
                self.connections
                    .delete_namespace_connection(connection_id, &membership.namespace)
                    .await?;
            }
        }

        for membership in &memberships {
            if let Some(Namespace::Branch(branch)) = Namespace::parse(&membership.namespace) {
                self.remove_watch(membership, branch).await?;
                self.notify_disconnected(branch, membership.device_info())
                    .await?;
            }
        }

        self.connections.clear_connection(connection_id).await?;
        log::info!("Device {connection_id} disconnected");
        Ok(())
    }

    // ─── Branch watches ─────────────────────────────────────

    pub async fn watch_branch(
        &self,
        connection_id: &str,
        watch: WatchBranch,
    ) -> Result<(), RelayError> {
        let Some(connection) = self.connections.get_connection(connection_id).await? else {
            log::warn!("Ignoring watch of {} from unknown connection {connection_id}", watch.branch);
            return Ok(());
        };

        let namespace = branch_namespace(&watch.branch);
        let already_watching = self
            .connections
            .get_namespace_connection(connection_id, &namespace)
            .await?
            .is_some();

        self.connections
            .save_namespace_connection(NamespaceConnection::new(
                &connection,
                namespace.as_str(),
                watch.temporary,
                watch.protocol,
            ))
            .await?;

        let snapshot = match watch.protocol {
            SyncProtocol::Atoms => {
                let atoms = self.atoms.load_atoms(&namespace).await?;
                ServerMessage::AddAtoms(AddAtoms {
                    branch: Some(watch.branch.clone()),
                    atoms: Some(atoms),
                    removed_atoms: None,
                    initial: Some(true),
                })
            }
            SyncProtocol::Updates => {
                let stored = self.updates.get_updates(&watch.branch).await?;
                ServerMessage::AddUpdates(AddUpdates {
                    branch: watch.branch.clone(),
                    updates: stored.updates,
                    update_id: None,
                    initial: Some(true),
                    timestamps: Some(stored.timestamps),
                })
            }
        };
        let report = self
            .messenger
            .send_message(&[connection_id.to_string()], &snapshot, None)
            .await?;
        if !report.stale.is_empty() {
            // A watch that was never announced leaves without a notice.
            if !already_watching {
                self.connections
                    .delete_namespace_connection(connection_id, &namespace)
                    .await?;
                self.collect_garbage(&watch.branch, watch.temporary).await?;
            }
            self.purge(&report.stale).await?;
            return Ok(());
        }

        log::info!(
            "{connection_id} watching {} ({}, {})",
            watch.branch,
            watch.protocol.as_str(),
            if watch.temporary { "temporary" } else { "persistent" }
        );

        if !already_watching {
            let event = ServerMessage::DeviceConnectedToBranch(DeviceConnected {
                branch: BranchInfo {
                    branch: watch.branch.clone(),
                    temporary: watch.temporary,
                },
                device: connection.device_info(),
            });
            self.notify_presence(&watch.branch, &event).await?;
        }
        Ok(())
    }

    pub async fn unwatch_branch(&self, connection_id: &str, branch: &str) -> Result<(), RelayError> {
        let namespace = branch_namespace(branch);
        let Some(membership) = self
            .connections
            .get_namespace_connection(connection_id, &namespace)
            .await?
        else {
            return Ok(());
        };

        self.remove_watch(&membership, branch).await?;
        log::info!("{connection_id} stopped watching {branch}");
        self.notify_disconnected(branch, membership.device_info())
            .await
    }

    async fn remove_watch(
        &self,
        membership: &NamespaceConnection,
        branch: &str,
    ) -> Result<(), RelayError> {
        self.connections
            .delete_namespace_connection(&membership.connection_id, &membership.namespace)
            .await?;
        self.collect_garbage(branch, membership.temporary).await
    }

    /// Drop a temporary branch's data once nobody watches it.
    async fn collect_garbage(&self, branch: &str, temporary: bool) -> Result<(), RelayError> {
        if !temporary {
            return Ok(());
        }
        let namespace = branch_namespace(branch);
        let watchers = self
            .connections
            .count_connections_by_namespace(&namespace)
            .await?;
        if watchers == 0 {
            self.atoms.clear_namespace(&namespace).await?;
            self.updates.clear_updates(branch).await?;
            log::info!("Cleared temporary branch {branch}");
        }
        Ok(())
    }

    // ─── Atoms ──────────────────────────────────────────────

    pub async fn add_atoms(&self, connection_id: &str, add: AddAtoms) -> Result<(), RelayError> {
        let Some(branch) = add.branch else {
            return Ok(());
        };
        let namespace = branch_namespace(&branch);
        let submitted = add.atoms.unwrap_or_default();
        let removed = add.removed_atoms.unwrap_or_default();

        let mut hashes: Vec<String> = submitted.iter().map(|a| a.hash.clone()).collect();
        hashes.extend(removed.iter().cloned());

        let (seeds, atoms): (Vec<Atom>, Vec<Atom>) = submitted
            .into_iter()
            .partition(|a| matches!(a.op(), AtomOp::SetupBranch { .. }));

        for seed in &seeds {
            self.setup_branch(seed).await?;
        }

        if !atoms.is_empty() {
            self.atoms.save_atoms(&namespace, &atoms).await?;
        }
        if !removed.is_empty() {
            self.atoms.delete_atoms(&namespace, &removed).await?;
        }

        if !atoms.is_empty() || !removed.is_empty() {
            log::debug!(
                "{branch}: +{} -{} atoms from {connection_id}",
                atoms.len(),
                removed.len()
            );
            let watchers = self.watcher_ids(&branch, SyncProtocol::Atoms).await?;
            let broadcast = ServerMessage::AddAtoms(AddAtoms {
                branch: Some(branch.clone()),
                atoms: (!atoms.is_empty()).then_some(atoms),
                removed_atoms: (!removed.is_empty()).then_some(removed),
                initial: None,
            });
            self.send(&watchers, &broadcast, Some(connection_id)).await?;
        }

        let ack = ServerMessage::AtomsReceived(AtomsReceived { branch, hashes });
        self.reply(connection_id, &ack).await
    }

    /// Seed an empty branch with the bot described by a setup atom.
    async fn setup_branch(&self, seed: &Atom) -> Result<(), RelayError> {
        let AtomOp::SetupBranch {
            branch,
            bot_id,
            tags,
        } = seed.op()
        else {
            return Ok(());
        };

        let namespace = branch_namespace(&branch);
        if self.atoms.count_atoms(&namespace).await? > 0 {
            log::debug!("Branch {branch} already has atoms, skipping setup");
            return Ok(());
        }

        let site = Uuid::new_v4().to_string();
        let bot_id = bot_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let atoms = atomize_bot(&site, 1, &bot_id, &tags);
        self.atoms.save_atoms(&namespace, &atoms).await?;
        log::info!("Seeded branch {branch} with bot {bot_id}");

        let watchers = self.watcher_ids(&branch, SyncProtocol::Atoms).await?;
        let message = ServerMessage::AddAtoms(AddAtoms::new(branch, atoms));
        self.send(&watchers, &message, None).await?;
        Ok(())
    }

    // ─── Updates ────────────────────────────────────────────

    pub async fn add_updates(&self, connection_id: &str, add: AddUpdates) -> Result<(), RelayError> {
        let timestamp = self.clock.now();
        match self
            .updates
            .add_updates(&add.branch, &add.updates, timestamp)
            .await
        {
            Ok(()) => {}
            Err(StoreError::LimitExceeded { limit, .. }) => {
                log::warn!(
                    "Rejected updates from {connection_id}: {} is over {limit} bytes",
                    add.branch
                );
                if let Some(update_id) = add.update_id {
                    let ack = ServerMessage::UpdatesReceived(UpdatesReceived {
                        branch: add.branch,
                        update_id,
                        error_code: Some(MAX_SIZE_REACHED.to_string()),
                    });
                    self.reply(connection_id, &ack).await?;
                }
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let watchers = self.watcher_ids(&add.branch, SyncProtocol::Updates).await?;
        let broadcast = ServerMessage::AddUpdates(AddUpdates {
            branch: add.branch.clone(),
            updates: add.updates,
            ..Default::default()
        });
        self.send(&watchers, &broadcast, Some(connection_id)).await?;

        if let Some(update_id) = add.update_id {
            self.ack_updates(connection_id, add.branch, update_id).await?;
        }
        Ok(())
    }

    pub async fn get_updates(&self, connection_id: &str, get: GetUpdates) -> Result<(), RelayError> {
        let stored = self.updates.get_updates(&get.branch).await?;
        let snapshot = ServerMessage::AddUpdates(AddUpdates {
            branch: get.branch.clone(),
            updates: stored.updates,
            update_id: None,
            initial: Some(true),
            timestamps: Some(stored.timestamps),
        });
        self.reply(connection_id, &snapshot).await?;

        if let Some(update_id) = get.update_id {
            self.ack_updates(connection_id, get.branch, update_id).await?;
        }
        Ok(())
    }

    async fn ack_updates(
        &self,
        connection_id: &str,
        branch: String,
        update_id: u64,
    ) -> Result<(), RelayError> {
        let ack = ServerMessage::UpdatesReceived(UpdatesReceived {
            branch,
            update_id,
            error_code: None,
        });
        self.reply(connection_id, &ack).await
    }

    /// Fold a branch's stored updates into bot state.
    pub async fn get_branch_data(&self, branch: &str) -> Result<BranchData, RelayError> {
        let stored = self.updates.get_updates(branch).await?;
        let state = fold_updates(&stored.updates)?;
        Ok(BranchData {
            version: BRANCH_DATA_VERSION,
            state,
        })
    }

    // ─── Remote actions ─────────────────────────────────────

    pub async fn send_event(&self, connection_id: &str, send: SendEvent) -> Result<(), RelayError> {
        let Some(sender) = self.connections.get_connection(connection_id).await? else {
            log::warn!("Ignoring event from unknown connection {connection_id}");
            return Ok(());
        };
        self.route_action(&send.branch, send.action, sender.device_info())
            .await?;
        Ok(())
    }

    /// Deliver a remote action to the selected watchers of `branch`.
    /// Returns the number of devices reached.
    async fn route_action(
        &self,
        branch: &str,
        action: RemoteAction,
        from: DeviceInfo,
    ) -> Result<usize, RelayError> {
        let watchers = self
            .connections
            .get_connections_by_namespace(&branch_namespace(branch))
            .await?;
        let targets = self.select_targets(&watchers, &action.selector);
        if targets.is_empty() {
            log::debug!("No device on {branch} matches the action selector");
            return Ok(0);
        }

        let message = ServerMessage::ReceiveEvent(ReceiveEvent {
            branch: branch.to_string(),
            action: action.into_device_action(from),
        });
        let report = self.send(&targets, &message, None).await?;
        Ok(report.delivered)
    }

    fn select_targets(
        &self,
        watchers: &[NamespaceConnection],
        selector: &DeviceSelector,
    ) -> Vec<String> {
        let matching = |pred: &dyn Fn(&NamespaceConnection) -> bool| -> Vec<String> {
            watchers
                .iter()
                .filter(|w| pred(w))
                .map(|w| w.connection_id.clone())
                .collect()
        };

        if let Some(session_id) = &selector.session_id {
            matching(&|w| &w.session_id == session_id)
        } else if let Some(device_id) = &selector.device_id {
            matching(&|w| &w.connection_id == device_id)
        } else if let Some(username) = &selector.username {
            matching(&|w| &w.username == username)
        } else if selector.broadcast {
            matching(&|_| true)
        } else if watchers.is_empty() {
            Vec::new()
        } else {
            let index = self.random.pick(watchers.len());
            vec![watchers[index].connection_id.clone()]
        }
    }

    /// Relay an inbound webhook to one random watcher of `branch`.
    pub async fn webhook(
        &self,
        branch: &str,
        request: WebhookRequest,
    ) -> Result<WebhookStatus, RelayError> {
        let data = match request.parse_body() {
            Ok(data) => data,
            Err(e) => {
                log::warn!("Malformed webhook body for {branch}: {e}");
                return Ok(WebhookStatus::BadRequest);
            }
        };

        let namespace = branch_namespace(branch);
        if self.atoms.count_atoms(&namespace).await? == 0 {
            return Ok(WebhookStatus::NotFound);
        }
        if self
            .connections
            .count_connections_by_namespace(&namespace)
            .await?
            == 0
        {
            return Ok(WebhookStatus::Unavailable);
        }

        let event = json!({
            "type": ON_WEBHOOK,
            "method": request.method,
            "url": request.url,
            "headers": request.headers,
            "data": data,
        });
        let action = RemoteAction::remote(event, DeviceSelector::default());
        let delivered = self.route_action(branch, action, DeviceInfo::server()).await?;

        if delivered == 0 {
            return Ok(WebhookStatus::Unavailable);
        }
        log::info!("Webhook {} {} relayed to {branch}", request.method, request.url);
        Ok(WebhookStatus::Delivered)
    }

    // ─── Presence ───────────────────────────────────────────

    pub async fn watch_branch_devices(
        &self,
        connection_id: &str,
        branch: &str,
    ) -> Result<(), RelayError> {
        let Some(connection) = self.connections.get_connection(connection_id).await? else {
            return Ok(());
        };

        self.connections
            .save_namespace_connection(NamespaceConnection::new(
                &connection,
                watched_branch_namespace(branch),
                false,
                SyncProtocol::Atoms,
            ))
            .await?;

        let watchers = self
            .connections
            .get_connections_by_namespace(&branch_namespace(branch))
            .await?;
        for watcher in watchers {
            let event = ServerMessage::DeviceConnectedToBranch(DeviceConnected {
                branch: BranchInfo {
                    branch: branch.to_string(),
                    temporary: watcher.temporary,
                },
                device: watcher.device_info(),
            });
            self.reply(connection_id, &event).await?;
        }
        Ok(())
    }

    pub async fn unwatch_branch_devices(
        &self,
        connection_id: &str,
        branch: &str,
    ) -> Result<(), RelayError> {
        self.connections
            .delete_namespace_connection(connection_id, &watched_branch_namespace(branch))
            .await?;
        Ok(())
    }

    async fn notify_disconnected(&self, branch: &str, device: DeviceInfo) -> Result<(), RelayError> {
        let event = ServerMessage::DeviceDisconnectedFromBranch(DeviceDisconnected {
            branch: branch.to_string(),
            device,
        });
        self.notify_presence(branch, &event).await
    }

    async fn notify_presence(&self, branch: &str, event: &ServerMessage) -> Result<(), RelayError> {
        let subscribers = self.presence_subscribers(branch).await?;
        self.send(&subscribers, event, None).await?;
        Ok(())
    }

    async fn presence_subscribers(&self, branch: &str) -> Result<Vec<String>, RelayError> {
        Ok(self
            .connections
            .get_connections_by_namespace(&watched_branch_namespace(branch))
            .await?
            .into_iter()
            .map(|s| s.connection_id)
            .collect())
    }

    pub async fn device_count(
        &self,
        connection_id: &str,
        branch: Option<&str>,
    ) -> Result<(), RelayError> {
        let count = match branch {
            Some(branch) => {
                self.connections
                    .count_connections_by_namespace(&branch_namespace(branch))
                    .await?
            }
            None => self.connections.count_connections().await?,
        };
        let reply = ServerMessage::DeviceCount(DeviceCount {
            branch: branch.map(str::to_string),
            count,
        });
        self.reply(connection_id, &reply).await
    }

    // ─── Time sync ──────────────────────────────────────────

    pub async fn sync_time(
        &self,
        connection_id: &str,
        request: SyncTimeRequest,
        server_receive_time: u64,
    ) -> Result<(), RelayError> {
        let reply = ServerMessage::SyncTime(SyncTimeResponse {
            id: request.id,
            client_request_time: request.client_request_time,
            server_receive_time,
            server_transmit_time: self.clock.now(),
        });
        self.reply(connection_id, &reply).await
    }

    // ─── Delivery ───────────────────────────────────────────

    async fn watcher_ids(
        &self,
        branch: &str,
        protocol: SyncProtocol,
    ) -> Result<Vec<String>, RelayError> {
        Ok(self
            .connections
            .get_connections_by_namespace(&branch_namespace(branch))
            .await?
            .into_iter()
            .filter(|w| w.protocol == protocol)
            .map(|w| w.connection_id)
            .collect())
    }

    async fn reply(&self, connection_id: &str, message: &ServerMessage) -> Result<(), RelayError> {
        self.send(&[connection_id.to_string()], message, None)
            .await?;
        Ok(())
    }

    async fn send(
        &self,
        connection_ids: &[String],
        message: &ServerMessage,
        exclude: Option<&str>,
    ) -> Result<DeliveryReport, RelayError> {
        if connection_ids.is_empty() {
            return Ok(DeliveryReport::default());
        }
        let report = self
            .messenger
            .send_message(connection_ids, message, exclude)
            .await?;
        if !report.stale.is_empty() {
            self.purge(&report.stale).await?;
        }
        Ok(report)
    }

    /// Remove unreachable connections with the same branch garbage
    /// collection as a disconnect, telling presence subscribers each device
    /// left. Subscribers found stale while notifying join the same purge.
    async fn purge(&self, stale: &[String]) -> Result<(), RelayError> {
        let mut pending: VecDeque<String> = stale.iter().cloned().collect();
        let mut purged = HashSet::new();

        while let Some(connection_id) = pending.pop_front() {
            if !purged.insert(connection_id.clone()) {
                continue;
            }
            log::info!("Purging stale connection {connection_id}");
            let memberships = self.connections.get_connections(&connection_id).await?;

            for membership in &memberships {
                if let Some(Namespace::WatchedBranch(_)) = Namespace::parse(&membership.namespace) {
                    self.connections
                        .delete_namespace_connection(&connection_id, &membership.namespace)
                        .await?;
                }
            }

            for membership in &memberships {
                let Some(Namespace::Branch(branch)) = Namespace::parse(&membership.namespace) else {
                    continue;
                };
                self.remove_watch(membership, branch).await?;

                let event = ServerMessage::DeviceDisconnectedFromBranch(DeviceDisconnected {
                    branch: branch.to_string(),
                    device: membership.device_info(),
                });
                let subscribers = self.presence_subscribers(branch).await?;
                if subscribers.is_empty() {
                    continue;
                }
                let report = self
                    .messenger
                    .send_message(&subscribers, &event, None)
                    .await?;
                pending.extend(report.stale);
            }

            self.connections.clear_connection(&connection_id).await?;
        }
        Ok(())
    }
}
