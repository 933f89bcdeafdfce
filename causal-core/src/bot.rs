//! Bots: the entities materialized from a branch, and the diffs between two
//! materializations.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Tag name → tag value.
pub type BotTags = BTreeMap<String, Value>;

/// Materialized state of a branch, keyed by bot id.
pub type BotsState = BTreeMap<String, Bot>;

/// A bot as derived from atoms or updates. Never stored directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bot {
    pub id: String,
    pub tags: BotTags,
}

impl Bot {
    pub fn new(id: impl Into<String>, tags: BotTags) -> Self {
        Self {
            id: id.into(),
            tags,
        }
    }

    pub fn tag(&self, name: &str) -> Option<&Value> {
        self.tags.get(name)
    }
}

/// `null` and the empty string both mean "tag not set".
pub fn has_value(value: &Value) -> bool {
    !(value.is_null() || value.as_str() == Some(""))
}

/// A bot whose tags changed, with exactly the names that changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatedBot {
    pub bot: Bot,
    pub tags: Vec<String>,
}

/// Difference between two materializations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    pub added: Vec<Bot>,
    pub removed: Vec<String>,
    pub updated: Vec<UpdatedBot>,
}

impl StateUpdate {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }
}

/// Names of the tags whose materialized value differs between two bots.
pub fn changed_tags(prev: &Bot, next: &Bot) -> Vec<String> {
    let names: BTreeSet<&String> = prev.tags.keys().chain(next.tags.keys()).collect();
    names
        .into_iter()
        .filter(|name| prev.tags.get(*name) != next.tags.get(*name))
        .cloned()
        .collect()
}

/// Diff only the given bot ids between two states.
pub fn diff_bots<'a, I>(prev: &BotsState, next: &BotsState, ids: I) -> StateUpdate
where
    I: IntoIterator<Item = &'a String>,
{
    let mut update = StateUpdate::default();
    let ids: BTreeSet<&String> = ids.into_iter().collect();

    for id in ids {
        match (prev.get(id), next.get(id)) {
            (None, Some(bot)) => update.added.push(bot.clone()),
            (Some(_), None) => update.removed.push(id.clone()),
            (Some(old), Some(new)) => {
                let tags = changed_tags(old, new);
                if !tags.is_empty() {
                    update.updated.push(UpdatedBot {
                        bot: new.clone(),
                        tags,
                    });
                }
            }
            (None, None) => {}
        }
    }

    update
}

/// Diff two complete states.
pub fn diff_states(prev: &BotsState, next: &BotsState) -> StateUpdate {
    let ids: BTreeSet<&String> = prev.keys().chain(next.keys()).collect();
    diff_bots(prev, next, ids)
}

/// High-level bot mutations accepted by a partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BotAction {
    AddBot {
        id: String,
        #[serde(default)]
        tags: BotTags,
    },
    RemoveBot {
        id: String,
    },
    /// Partial tag update; `null` removes a tag.
    UpdateBot {
        id: String,
        tags: BotTags,
    },
    /// Bulk state: `Some(tags)` adds or updates the bot, `None` removes it.
    ApplyState {
        state: BTreeMap<String, Option<BotTags>>,
    },
}

/// Break `ApplyState` actions into equivalent add/update/remove actions
/// against `state`, taking earlier actions of the same batch into account.
pub fn expand_actions(actions: Vec<BotAction>, state: &BotsState) -> Vec<BotAction> {
    let mut present: BTreeSet<String> = state.keys().cloned().collect();
    let mut expanded = Vec::with_capacity(actions.len());

    for action in actions {
        match action {
            BotAction::ApplyState { state: partial } => {
                for (id, tags) in partial {
                    match tags {
                        Some(tags) if present.contains(&id) => {
                            expanded.push(BotAction::UpdateBot { id, tags });
                        }
                        Some(tags) => {
                            present.insert(id.clone());
                            expanded.push(BotAction::AddBot { id, tags });
                        }
                        None if present.remove(&id) => {
                            expanded.push(BotAction::RemoveBot { id });
                        }
                        None => {}
                    }
                }
            }
            BotAction::AddBot { id, tags } => {
                present.insert(id.clone());
                expanded.push(BotAction::AddBot { id, tags });
            }
            BotAction::RemoveBot { id } => {
                present.remove(&id);
                expanded.push(BotAction::RemoveBot { id });
            }
            update @ BotAction::UpdateBot { .. } => expanded.push(update),
        }
    }

    expanded
}
