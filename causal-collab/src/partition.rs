//! Client-side partition: folds local bot actions and remote atoms/updates
//! into a materialized [`BotsState`] and reports the exact changes.
//!
//! ```text
//!  apply_events(actions) ──┐                       ┌──► broadcast<PartitionEvent>
//!                          ├──► Weave | BotsDoc ──►┤
//!  handle_message(msg) ────┘          │            └──► outbox<ClientMessage>
//!                                     ▼
//!                                 BotsState
//! ```
//!
//! A partition has a single owner and no internal locking. When local calls
//! and inbound relay messages come from different tasks, run it under a
//! [`PartitionDriver`], which funnels both through one task.
//!
//! Reference: Shapiro et al. — Conflict-free Replicated Data Types (2011)

use std::collections::{BTreeSet, VecDeque};

use causal_core::atom::{delete_op, tag_op, value_op};
use causal_core::{
    atomize_bot, decode_update, diff_bots, diff_states, encode_update, expand_actions, has_value,
    Atom, AtomId, Bot, BotAction, BotTags, BotsDoc, BotsState, CoreError, StateUpdate, UpdatedBot,
    Weave,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::protocol::{
    AddAtoms, AddUpdates, ClientMessage, DeviceAction, ProtocolError, RemoteAction, SendEvent,
    ServerMessage, SyncProtocol, WatchBranch,
};

const EVENT_CAPACITY: usize = 1024;

/// Partition configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionConfig {
    pub branch: String,
    pub protocol: SyncProtocol,
    pub temporary: bool,
    /// Site id stamped on local atoms. A random one is used when unset.
    pub site: Option<String>,
}

impl PartitionConfig {
    pub fn new(branch: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            protocol: SyncProtocol::Atoms,
            temporary: false,
            site: None,
        }
    }

    pub fn temporary(mut self) -> Self {
        self.temporary = true;
        self
    }

    pub fn updates(mut self) -> Self {
        self.protocol = SyncProtocol::Updates;
        self
    }

    pub fn with_site(mut self, site: impl Into<String>) -> Self {
        self.site = Some(site.into());
        self
    }
}

/// Notifications published by a partition.
#[derive(Debug, Clone, PartialEq)]
pub enum PartitionEvent {
    BotsAdded(Vec<Bot>),
    BotsRemoved(Vec<String>),
    BotsUpdated(Vec<UpdatedBot>),
    RemoteAction(DeviceAction),
    /// The initial branch snapshot has been folded in.
    Synced,
}

// ─── Backends ───────────────────────────────────────────────

struct AtomBranch {
    weave: Weave,
    site: String,
    /// Lamport clock
    time: u64,
    /// Hashes sent upstream and not yet acknowledged
    pending: BTreeSet<String>,
}

/// Atoms produced by one local apply.
#[derive(Default)]
struct LocalAtoms {
    added: Vec<Atom>,
    removed: Vec<String>,
    affected: BTreeSet<String>,
}

impl AtomBranch {
    fn new(site: String) -> Self {
        Self {
            weave: Weave::new(),
            site,
            time: 0,
            pending: BTreeSet::new(),
        }
    }

    fn tick(&mut self) -> AtomId {
        self.time = self.time.max(self.weave.max_timestamp()) + 1;
        AtomId::new(self.site.clone(), self.time)
    }

    fn push(&mut self, atom: Atom, out: &mut LocalAtoms) {
        self.weave.insert(atom.clone());
        out.added.push(atom);
    }

    fn apply_local(&mut self, actions: Vec<BotAction>) -> LocalAtoms {
        let mut out = LocalAtoms::default();

        for action in actions {
            match action {
                BotAction::AddBot { id, tags } => {
                    if !self.weave.live_bot_atoms(&id).is_empty() {
                        self.update_tags(&id, tags, &mut out);
                        continue;
                    }
                    let first = self.tick().timestamp;
                    let atoms = atomize_bot(&self.site, first, &id, &tags);
                    if let Some(last) = atoms.last() {
                        self.time = self.time.max(last.id.timestamp);
                    }
                    for atom in atoms {
                        self.push(atom, &mut out);
                    }
                    out.affected.insert(id);
                }
                BotAction::UpdateBot { id, tags } => {
                    if self.weave.live_bot_atoms(&id).is_empty() {
                        log::debug!("Ignoring update for unknown bot {id}");
                        continue;
                    }
                    self.update_tags(&id, tags, &mut out);
                }
                BotAction::RemoveBot { id } => {
                    let live: Vec<AtomId> =
                        self.weave.live_bot_atoms(&id).into_iter().cloned().collect();
                    for bot in live {
                        let atom = Atom::new(self.tick(), Some(bot), delete_op());
                        self.push(atom, &mut out);
                        out.affected.insert(id.clone());
                    }
                }
                BotAction::ApplyState { .. } => {}
            }
        }

        out
    }

    fn update_tags(&mut self, id: &str, tags: BotTags, out: &mut LocalAtoms) {
        let current = self.weave.reduce_bot(id);
        for (name, value) in tags {
            let existing = current.as_ref().and_then(|bot| bot.tag(&name));
            let unchanged = if has_value(&value) {
                existing == Some(&value)
            } else {
                existing.is_none()
            };
            if unchanged {
                continue;
            }

            let tag = match self.weave.tag_atom(id, &name) {
                Some(tag) => tag,
                None => {
                    let Some(bot) = self.weave.live_bot_atoms(id).first().map(|b| (*b).clone())
                    else {
                        continue;
                    };
                    let atom = Atom::new(self.tick(), Some(bot), tag_op(&name));
                    let tag = atom.id.clone();
                    self.push(atom, out);
                    tag
                }
            };

            for hash in self.weave.value_hashes(id, &name) {
                self.weave.remove(&hash);
                out.removed.push(hash);
            }
            let atom = Atom::new(self.tick(), Some(tag), value_op(value));
            self.push(atom, out);
            out.affected.insert(id.to_string());
        }
    }

    fn merge(&mut self, atoms: Vec<Atom>, removed: &[String]) -> BTreeSet<String> {
        let valid: Vec<Atom> = atoms
            .into_iter()
            .filter(|atom| {
                let ok = atom.is_valid();
                if !ok {
                    log::warn!("Dropping atom {} with mismatched hash", atom.id);
                }
                ok
            })
            .collect();
        self.weave.apply(valid, removed)
    }
}

struct UpdateBranch {
    doc: BotsDoc,
    next_update_id: u64,
    pending: BTreeSet<u64>,
}

enum Backend {
    Atoms(AtomBranch),
    Updates(UpdateBranch),
}

// ─── Partition ──────────────────────────────────────────────

/// Materialized view of one branch.
pub struct CausalPartition {
    config: PartitionConfig,
    backend: Backend,
    state: BotsState,
    events: broadcast::Sender<PartitionEvent>,
    outbox: VecDeque<ClientMessage>,
    closed: bool,
    synced: bool,
}

impl CausalPartition {
    pub fn new(config: PartitionConfig) -> Self {
        let backend = match config.protocol {
            SyncProtocol::Atoms => {
                let site = config
                    .site
                    .clone()
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                Backend::Atoms(AtomBranch::new(site))
            }
            SyncProtocol::Updates => Backend::Updates(UpdateBranch {
                doc: BotsDoc::new(),
                next_update_id: 1,
                pending: BTreeSet::new(),
            }),
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            config,
            backend,
            state: BotsState::new(),
            events,
            outbox: VecDeque::new(),
            closed: false,
            synced: false,
        }
    }

    pub fn config(&self) -> &PartitionConfig {
        &self.config
    }

    pub fn branch(&self) -> &str {
        &self.config.branch
    }

    /// Receive events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<PartitionEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> &BotsState {
        &self.state
    }

    pub fn bot(&self, id: &str) -> Option<&Bot> {
        self.state.get(id)
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Local atoms or updates not yet acknowledged by the relay.
    pub fn pending_acks(&self) -> usize {
        match &self.backend {
            Backend::Atoms(branch) => branch.pending.len(),
            Backend::Updates(branch) => branch.pending.len(),
        }
    }

    /// Messages waiting to be sent to the relay, oldest first.
    pub fn take_outbound(&mut self) -> Vec<ClientMessage> {
        self.outbox.drain(..).collect()
    }

    /// Start watching the branch.
    pub fn connect(&mut self) {
        self.closed = false;
        self.outbox.push_back(ClientMessage::WatchBranch(WatchBranch {
            branch: self.config.branch.clone(),
            temporary: self.config.temporary,
            protocol: self.config.protocol,
        }));
    }

    /// Stop watching the branch. No further events are published.
    pub fn unsubscribe(&mut self) {
        self.closed = true;
        self.outbox
            .push_back(ClientMessage::UnwatchBranch(self.config.branch.clone()));
    }

    /// Apply local bot actions, queue them for the relay and publish the
    /// resulting changes.
    pub fn apply_events(&mut self, actions: Vec<BotAction>) -> StateUpdate {
        if actions.is_empty() {
            return StateUpdate::default();
        }
        let actions = expand_actions(actions, &self.state);
        let branch = self.config.branch.clone();

        let affected = match &mut self.backend {
            Backend::Atoms(atoms) => {
                let local = atoms.apply_local(actions);
                if !local.added.is_empty() || !local.removed.is_empty() {
                    atoms
                        .pending
                        .extend(local.added.iter().map(|a| a.hash.clone()));
                    self.outbox.push_back(ClientMessage::AddAtoms(AddAtoms {
                        branch: Some(branch),
                        atoms: Some(local.added),
                        removed_atoms: (!local.removed.is_empty()).then_some(local.removed),
                        initial: None,
                    }));
                }
                Some(local.affected)
            }
            Backend::Updates(updates) => {
                let update = updates.doc.apply_actions(actions);
                let update_id = updates.next_update_id;
                updates.next_update_id += 1;
                updates.pending.insert(update_id);
                self.outbox.push_back(ClientMessage::AddUpdates(AddUpdates {
                    branch,
                    updates: vec![encode_update(&update)],
                    update_id: Some(update_id),
                    ..Default::default()
                }));
                None
            }
        };

        let update = self.refresh(affected);
        self.publish(&update);
        update
    }

    /// Queue remote actions for the relay to route.
    pub fn send_remote_events(&mut self, actions: Vec<RemoteAction>) {
        for action in actions {
            self.outbox.push_back(ClientMessage::SendEvent(SendEvent {
                branch: self.config.branch.clone(),
                action,
            }));
        }
    }

    /// Fold one relay message. Messages for other branches are ignored.
    pub fn handle_message(&mut self, msg: ServerMessage) -> Result<StateUpdate, CoreError> {
        match msg {
            ServerMessage::AddAtoms(add) if add.branch.as_deref() == Some(self.branch()) => {
                let Backend::Atoms(atoms) = &mut self.backend else {
                    log::warn!("Ignoring atoms for updates branch {}", self.config.branch);
                    return Ok(StateUpdate::default());
                };
                let removed = add.removed_atoms.unwrap_or_default();
                let affected = atoms.merge(add.atoms.unwrap_or_default(), &removed);
                let update = self.refresh(Some(affected));
                self.publish(&update);
                if add.initial == Some(true) {
                    self.mark_synced();
                }
                Ok(update)
            }
            ServerMessage::AddUpdates(add) if add.branch == self.config.branch => {
                let Backend::Updates(updates) = &mut self.backend else {
                    log::warn!("Ignoring updates for atoms branch {}", self.config.branch);
                    return Ok(StateUpdate::default());
                };
                let decoded = add
                    .updates
                    .iter()
                    .map(|u| decode_update(u))
                    .collect::<Result<Vec<_>, _>>()?;
                let mut failure = None;
                for bytes in &decoded {
                    if let Err(e) = updates.doc.apply_update(bytes) {
                        failure = Some(e);
                        break;
                    }
                }
                // Updates applied before a failure are already in the doc.
                let update = self.refresh(None);
                self.publish(&update);
                if let Some(e) = failure {
                    return Err(e);
                }
                if add.initial == Some(true) {
                    self.mark_synced();
                }
                Ok(update)
            }
            ServerMessage::ReceiveEvent(event) if event.branch == self.config.branch => {
                self.emit(PartitionEvent::RemoteAction(event.action));
                Ok(StateUpdate::default())
            }
            ServerMessage::AtomsReceived(ack) if ack.branch == self.config.branch => {
                if let Backend::Atoms(atoms) = &mut self.backend {
                    for hash in &ack.hashes {
                        atoms.pending.remove(hash);
                    }
                }
                Ok(StateUpdate::default())
            }
            ServerMessage::UpdatesReceived(ack) if ack.branch == self.config.branch => {
                if let Some(code) = &ack.error_code {
                    log::warn!(
                        "Relay rejected update {} on {}: {code}",
                        ack.update_id,
                        ack.branch
                    );
                }
                if let Backend::Updates(updates) = &mut self.backend {
                    updates.pending.remove(&ack.update_id);
                }
                Ok(StateUpdate::default())
            }
            other => {
                log::debug!("Partition {} ignoring {}", self.config.branch, other.name());
                Ok(StateUpdate::default())
            }
        }
    }

    /// Recompute the given bots (or everything) and diff against the
    /// current state.
    fn refresh(&mut self, affected: Option<BTreeSet<String>>) -> StateUpdate {
        match (&self.backend, affected) {
            (Backend::Atoms(atoms), Some(ids)) => {
                let mut prev = BotsState::new();
                let mut next = BotsState::new();
                for id in &ids {
                    if let Some(bot) = self.state.remove(id) {
                        prev.insert(id.clone(), bot);
                    }
                    if let Some(bot) = atoms.weave.reduce_bot(id) {
                        next.insert(id.clone(), bot);
                    }
                }
                let update = diff_bots(&prev, &next, &ids);
                self.state.extend(next);
                update
            }
            (Backend::Atoms(atoms), None) => {
                let next = atoms.weave.state();
                let update = diff_states(&self.state, &next);
                self.state = next;
                update
            }
            (Backend::Updates(updates), _) => {
                let next = updates.doc.state();
                let update = diff_states(&self.state, &next);
                self.state = next;
                update
            }
        }
    }

    fn mark_synced(&mut self) {
        self.synced = true;
        self.emit(PartitionEvent::Synced);
    }

    fn publish(&self, update: &StateUpdate) {
        if !update.added.is_empty() {
            self.emit(PartitionEvent::BotsAdded(update.added.clone()));
        }
        if !update.removed.is_empty() {
            self.emit(PartitionEvent::BotsRemoved(update.removed.clone()));
        }
        if !update.updated.is_empty() {
            self.emit(PartitionEvent::BotsUpdated(update.updated.clone()));
        }
    }

    fn emit(&self, event: PartitionEvent) {
        if self.closed {
            return;
        }
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

// ─── Driver ─────────────────────────────────────────────────

enum PartitionCommand {
    Apply {
        actions: Vec<BotAction>,
        reply: oneshot::Sender<StateUpdate>,
    },
    SendRemote(Vec<RemoteAction>),
    Connect,
    Unsubscribe,
    State(oneshot::Sender<BotsState>),
}

/// Cloneable handle to a partition running under a [`PartitionDriver`].
#[derive(Clone)]
pub struct PartitionHandle {
    commands: mpsc::Sender<PartitionCommand>,
    events: broadcast::Sender<PartitionEvent>,
}

impl PartitionHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<PartitionEvent> {
        self.events.subscribe()
    }

    pub async fn apply_events(&self, actions: Vec<BotAction>) -> Result<StateUpdate, ProtocolError> {
        let (reply, rx) = oneshot::channel();
        self.command(PartitionCommand::Apply { actions, reply }).await?;
        rx.await.map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub async fn send_remote_events(&self, actions: Vec<RemoteAction>) -> Result<(), ProtocolError> {
        self.command(PartitionCommand::SendRemote(actions)).await
    }

    pub async fn connect(&self) -> Result<(), ProtocolError> {
        self.command(PartitionCommand::Connect).await
    }

    pub async fn unsubscribe(&self) -> Result<(), ProtocolError> {
        self.command(PartitionCommand::Unsubscribe).await
    }

    pub async fn state(&self) -> Result<BotsState, ProtocolError> {
        let (reply, rx) = oneshot::channel();
        self.command(PartitionCommand::State(reply)).await?;
        rx.await.map_err(|_| ProtocolError::ConnectionClosed)
    }

    async fn command(&self, command: PartitionCommand) -> Result<(), ProtocolError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }
}

/// Runs a partition on its own task so local calls and relay messages are
/// applied one at a time.
pub struct PartitionDriver;

impl PartitionDriver {
    /// Spawn the driver. It stops once every handle is dropped and returns
    /// the partition.
    pub fn spawn(
        partition: CausalPartition,
        inbound: mpsc::Receiver<ServerMessage>,
        outbound: mpsc::Sender<ClientMessage>,
    ) -> (PartitionHandle, JoinHandle<CausalPartition>) {
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let handle = PartitionHandle {
            commands: commands_tx,
            events: partition.events.clone(),
        };
        let task = tokio::spawn(Self::run(partition, commands_rx, inbound, outbound));
        (handle, task)
    }

    async fn run(
        mut partition: CausalPartition,
        mut commands: mpsc::Receiver<PartitionCommand>,
        mut inbound: mpsc::Receiver<ServerMessage>,
        outbound: mpsc::Sender<ClientMessage>,
    ) -> CausalPartition {
        let mut inbound_open = true;

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    match command {
                        PartitionCommand::Apply { actions, reply } => {
                            let update = partition.apply_events(actions);
                            let _ = reply.send(update);
                        }
                        PartitionCommand::SendRemote(actions) => partition.send_remote_events(actions),
                        PartitionCommand::Connect => partition.connect(),
                        PartitionCommand::Unsubscribe => partition.unsubscribe(),
                        PartitionCommand::State(reply) => {
                            let _ = reply.send(partition.state().clone());
                        }
                    }
                }
                message = inbound.recv(), if inbound_open => {
                    match message {
                        Some(message) => {
                            if let Err(e) = partition.handle_message(message) {
                                log::warn!("Partition {} failed to fold message: {e}", partition.branch());
                            }
                        }
                        None => {
                            log::debug!("Inbound channel for {} closed", partition.branch());
                            inbound_open = false;
                        }
                    }
                }
            }

            for message in partition.take_outbound() {
                if outbound.send(message).await.is_err() {
                    log::warn!("Outbound channel for {} closed", partition.branch());
                }
            }
        }

        partition
    }
}
