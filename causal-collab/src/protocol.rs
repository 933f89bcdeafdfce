//! JSON wire protocol between devices and the relay.
//!
//! Every frame is a single text message:
//! ```text
//! {"name": "repo/add_atoms", "data": {"branch": "main", "atoms": [...]}}
//!   │                          │
//!   message name               payload, camelCase fields
//! ```
//!
//! Client and server messages are closed enums, so every name is matched
//! exhaustively at the boundary.

use causal_core::Atom;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Device identity used for actions originating from the relay itself.
pub const SERVER_DEVICE_ID: &str = "server";

/// Event type carried by webhook actions.
pub const ON_WEBHOOK: &str = "on_webhook";

/// Error code attached to UPDATES_RECEIVED when the store is full.
pub const MAX_SIZE_REACHED: &str = "max_size_reached";

/// Replication protocol of a single watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncProtocol {
    #[default]
    Atoms,
    Updates,
}

impl SyncProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncProtocol::Atoms => "atoms",
            SyncProtocol::Updates => "updates",
        }
    }
}

/// Public identity of a device, as seen by other devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub connection_id: String,
    pub session_id: String,
    pub username: String,
}

impl DeviceInfo {
    /// Identity of the relay when it originates an action.
    pub fn server() -> Self {
        Self {
            connection_id: SERVER_DEVICE_ID.to_string(),
            session_id: SERVER_DEVICE_ID.to_string(),
            username: SERVER_DEVICE_ID.to_string(),
        }
    }
}

// ─── Payloads ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Login {
    pub session_id: String,
    pub username: String,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResult {
    pub connection_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchBranch {
    pub branch: String,
    #[serde(default)]
    pub temporary: bool,
    #[serde(default)]
    pub protocol: SyncProtocol,
}

impl WatchBranch {
    pub fn new(branch: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            temporary: false,
            protocol: SyncProtocol::Atoms,
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
}

/// Atoms added to and removed from a branch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddAtoms {
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atoms: Option<Vec<Atom>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed_atoms: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<bool>,
}

impl AddAtoms {
    pub fn new(branch: impl Into<String>, atoms: Vec<Atom>) -> Self {
        Self {
            branch: Some(branch.into()),
            atoms: Some(atoms),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AtomsReceived {
    pub branch: String,
    pub hashes: Vec<String>,
}

/// Opaque base64 updates for an updates-protocol branch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddUpdates {
    pub branch: String,
    #[serde(default)]
    pub updates: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamps: Option<Vec<u64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatesReceived {
    pub branch: String,
    pub update_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetUpdates {
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_id: Option<u64>,
}

/// Addresses the device(s) a remote action is routed to.
///
/// Fields are checked in order: session, device (connection id), username,
/// broadcast. With none set, one random watcher receives the action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub broadcast: bool,
}

impl DeviceSelector {
    pub fn session(id: impl Into<String>) -> Self {
        Self {
            session_id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn device(id: impl Into<String>) -> Self {
        Self {
            device_id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn username(name: impl Into<String>) -> Self {
        Self {
            username: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn broadcast() -> Self {
        Self {
            broadcast: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteKind {
    Remote,
    RemoteResult,
    RemoteError,
}

/// Action sent by a device to other devices of a branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAction {
    #[serde(rename = "type")]
    pub kind: RemoteKind,
    /// Event, result or error payload depending on `kind`.
    pub event: Value,
    #[serde(flatten)]
    pub selector: DeviceSelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl RemoteAction {
    pub fn remote(event: Value, selector: DeviceSelector) -> Self {
        Self {
            kind: RemoteKind::Remote,
            event,
            selector,
            task_id: None,
        }
    }

    pub fn result(result: Value, selector: DeviceSelector, task_id: impl Into<String>) -> Self {
        Self {
            kind: RemoteKind::RemoteResult,
            event: result,
            selector,
            task_id: Some(task_id.into()),
        }
    }

    pub fn error(error: Value, selector: DeviceSelector, task_id: impl Into<String>) -> Self {
        Self {
            kind: RemoteKind::RemoteError,
            event: error,
            selector,
            task_id: Some(task_id.into()),
        }
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Convert into the envelope delivered to the receiving device.
    pub fn into_device_action(self, device: DeviceInfo) -> DeviceAction {
        let kind = match self.kind {
            RemoteKind::Remote => DeviceKind::Device,
            RemoteKind::RemoteResult => DeviceKind::DeviceResult,
            RemoteKind::RemoteError => DeviceKind::DeviceError,
        };
        DeviceAction {
            kind,
            event: self.event,
            device,
            task_id: self.task_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Device,
    DeviceResult,
    DeviceError,
}

/// Action as received by a device, tagged with the sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAction {
    #[serde(rename = "type")]
    pub kind: DeviceKind,
    pub event: Value,
    pub device: DeviceInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendEvent {
    pub branch: String,
    pub action: RemoteAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiveEvent {
    pub branch: String,
    pub action: DeviceAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchInfo {
    pub branch: String,
    pub temporary: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConnected {
    pub branch: BranchInfo,
    pub device: DeviceInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDisconnected {
    pub branch: String,
    pub device: DeviceInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCount {
    pub branch: Option<String>,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncTimeRequest {
    pub id: u64,
    pub client_request_time: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncTimeResponse {
    pub id: u64,
    pub client_request_time: u64,
    pub server_receive_time: u64,
    pub server_transmit_time: u64,
}

// ─── Messages ───────────────────────────────────────────────

/// Messages sent by devices to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data")]
pub enum ClientMessage {
    #[serde(rename = "login")]
    Login(Login),
    #[serde(rename = "repo/watch_branch")]
    WatchBranch(WatchBranch),
    #[serde(rename = "repo/unwatch_branch")]
    UnwatchBranch(String),
    #[serde(rename = "repo/add_atoms")]
    AddAtoms(AddAtoms),
    #[serde(rename = "repo/add_updates")]
    AddUpdates(AddUpdates),
    #[serde(rename = "repo/get_updates")]
    GetUpdates(GetUpdates),
    #[serde(rename = "repo/send_event")]
    SendEvent(SendEvent),
    #[serde(rename = "repo/watch_branch_devices")]
    WatchBranchDevices(String),
    #[serde(rename = "repo/unwatch_branch_devices")]
    UnwatchBranchDevices(String),
    #[serde(rename = "repo/device_count")]
    DeviceCount(Option<String>),
    #[serde(rename = "sync/time")]
    SyncTime(SyncTimeRequest),
}

/// Messages sent by the relay to devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data")]
pub enum ServerMessage {
    #[serde(rename = "login_result")]
    LoginResult(LoginResult),
    #[serde(rename = "repo/add_atoms")]
    AddAtoms(AddAtoms),
    #[serde(rename = "repo/atoms_received")]
    AtomsReceived(AtomsReceived),
    #[serde(rename = "repo/add_updates")]
    AddUpdates(AddUpdates),
    #[serde(rename = "repo/updates_received")]
    UpdatesReceived(UpdatesReceived),
    #[serde(rename = "repo/receive_event")]
    ReceiveEvent(ReceiveEvent),
    #[serde(rename = "repo/device_connected_to_branch")]
    DeviceConnectedToBranch(DeviceConnected),
    #[serde(rename = "repo/device_disconnected_from_branch")]
    DeviceDisconnectedFromBranch(DeviceDisconnected),
    #[serde(rename = "repo/device_count")]
    DeviceCount(DeviceCount),
    #[serde(rename = "sync/time/response")]
    SyncTime(SyncTimeResponse),
}

impl ClientMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::Login(_) => "login",
            ClientMessage::WatchBranch(_) => "repo/watch_branch",
            ClientMessage::UnwatchBranch(_) => "repo/unwatch_branch",
            ClientMessage::AddAtoms(_) => "repo/add_atoms",
            ClientMessage::AddUpdates(_) => "repo/add_updates",
            ClientMessage::GetUpdates(_) => "repo/get_updates",
            ClientMessage::SendEvent(_) => "repo/send_event",
            ClientMessage::WatchBranchDevices(_) => "repo/watch_branch_devices",
            ClientMessage::UnwatchBranchDevices(_) => "repo/unwatch_branch_devices",
            ClientMessage::DeviceCount(_) => "repo/device_count",
            ClientMessage::SyncTime(_) => "sync/time",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

impl ServerMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ServerMessage::LoginResult(_) => "login_result",
            ServerMessage::AddAtoms(_) => "repo/add_atoms",
            ServerMessage::AtomsReceived(_) => "repo/atoms_received",
            ServerMessage::AddUpdates(_) => "repo/add_updates",
            ServerMessage::UpdatesReceived(_) => "repo/updates_received",
            ServerMessage::ReceiveEvent(_) => "repo/receive_event",
            ServerMessage::DeviceConnectedToBranch(_) => "repo/device_connected_to_branch",
            ServerMessage::DeviceDisconnectedFromBranch(_) => {
                "repo/device_disconnected_from_branch"
            }
            ServerMessage::DeviceCount(_) => "repo/device_count",
            ServerMessage::SyncTime(_) => "sync/time/response",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    /// Frame was not a text frame
    InvalidFrame,
    /// A message other than `login` arrived before login
    NotLoggedIn,
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidFrame => write!(f, "Invalid frame"),
            Self::NotLoggedIn => write!(f, "Not logged in"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
