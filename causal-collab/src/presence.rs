//! Branch presence: which devices are watching which branch.
//!
//! The relay keeps two kinds of membership per connection, distinguished by
//! namespace prefix:
//!
//! ```text
//! /branch/<name>           watching the branch's data (atoms or updates)
//! /watched_branch/<name>   subscribed to the branch's device presence
//! ```
//!
//! On the device side, [`BranchDevices`] folds the presence messages into a
//! live view of each branch's watchers.
//!
//! Reference: Kleppmann, Chapter 8 — Broadcast Protocols

use std::collections::{BTreeMap, HashMap};

use crate::protocol::{DeviceInfo, ServerMessage};

pub const BRANCH_PREFIX: &str = "/branch/";
pub const WATCHED_BRANCH_PREFIX: &str = "/watched_branch/";

/// Namespace holding the data watchers of a branch.
pub fn branch_namespace(branch: &str) -> String {
    format!("{BRANCH_PREFIX}{branch}")
}

/// Namespace holding the presence subscribers of a branch.
pub fn watched_branch_namespace(branch: &str) -> String {
    format!("{WATCHED_BRANCH_PREFIX}{branch}")
}

/// A namespace split into its kind and branch name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace<'a> {
    Branch(&'a str),
    WatchedBranch(&'a str),
}

impl<'a> Namespace<'a> {
    pub fn parse(namespace: &'a str) -> Option<Self> {
        if let Some(branch) = namespace.strip_prefix(WATCHED_BRANCH_PREFIX) {
            Some(Namespace::WatchedBranch(branch))
        } else {
            namespace.strip_prefix(BRANCH_PREFIX).map(Namespace::Branch)
        }
    }
}

// ─── Device-side tracker ────────────────────────────────────

/// A change applied to a [`BranchDevices`] view.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceChange {
    Connected { branch: String, device: DeviceInfo },
    Disconnected { branch: String, device: DeviceInfo },
}

/// Live view of the devices watching each subscribed branch.
#[derive(Debug, Default)]
pub struct BranchDevices {
    /// branch → connection id → device
    branches: HashMap<String, BTreeMap<String, DeviceInfo>>,
    temporary: HashMap<String, bool>,
}

impl BranchDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one relay message. Non-presence messages are ignored.
    pub fn handle_message(&mut self, msg: &ServerMessage) -> Option<PresenceChange> {
        match msg {
            ServerMessage::DeviceConnectedToBranch(event) => {
                let branch = event.branch.branch.clone();
                self.temporary
                    .insert(branch.clone(), event.branch.temporary);
                let previous = self
                    .branches
                    .entry(branch.clone())
                    .or_default()
                    .insert(event.device.connection_id.clone(), event.device.clone());
                if previous.is_some() {
                    return None;
                }
                Some(PresenceChange::Connected {
                    branch,
                    device: event.device.clone(),
                })
            }
            ServerMessage::DeviceDisconnectedFromBranch(event) => {
                let devices = self.branches.get_mut(&event.branch)?;
                let device = devices.remove(&event.device.connection_id)?;
                if devices.is_empty() {
                    self.branches.remove(&event.branch);
                    self.temporary.remove(&event.branch);
                }
                Some(PresenceChange::Disconnected {
                    branch: event.branch.clone(),
                    device,
                })
            }
            _ => None,
        }
    }

    /// Devices watching `branch`, ordered by connection id.
    pub fn devices(&self, branch: &str) -> Vec<&DeviceInfo> {
        self.branches
            .get(branch)
            .map(|devices| devices.values().collect())
            .unwrap_or_default()
    }

    pub fn device_count(&self, branch: &str) -> usize {
        self.branches.get(branch).map_or(0, BTreeMap::len)
    }

    pub fn is_temporary(&self, branch: &str) -> Option<bool> {
        self.temporary.get(branch).copied()
    }

    /// Forget everything, e.g. after the connection drops.
    pub fn clear(&mut self) {
        self.branches.clear();
        self.temporary.clear();
    }
}
