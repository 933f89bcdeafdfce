//! Bots document for the updates protocol.
//!
//! Branches on the updates protocol carry opaque yrs v1 updates instead of
//! atoms. Both ends fold them into the same document layout:
//!
//! ```text
//!   Y.Map "bots"   botId            → "1"
//!   Y.Map "tags"   botId ␟ tagName  → JSON-encoded tag value
//! ```
//!
//! Two flat maps keep concurrent edits to different tags of the same bot
//! independent. Tags whose bot key is missing are ignored when reading.
//!
//! Reference: Nicolaescu et al. — Yjs: A Framework for Near Real-Time P2P
//! Shared Editing on Arbitrary Data Types (2015)

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::Value;
use yrs::updates::decoder::Decode;
use yrs::{Any, Doc, Map, MapRef, Out, ReadTxn, StateVector, Transact, TransactionMut, Update};

use crate::bot::{expand_actions, has_value, Bot, BotAction, BotTags, BotsState};
use crate::error::CoreError;

/// Separates bot id and tag name in the `tags` map key.
const TAG_SEP: char = '\u{1f}';
const PRESENT: &str = "1";

fn tag_key(bot_id: &str, name: &str) -> String {
    format!("{bot_id}{TAG_SEP}{name}")
}

/// yrs-backed materialization of an updates-protocol branch.
pub struct BotsDoc {
    doc: Doc,
    bots: MapRef,
    tags: MapRef,
}

impl Default for BotsDoc {
    fn default() -> Self {
        Self::new()
    }
}

impl BotsDoc {
    pub fn new() -> Self {
        Self::from_doc(Doc::new())
    }

    /// Fixed client id, for reproducible updates in tests.
    pub fn with_client_id(client_id: u64) -> Self {
        Self::from_doc(Doc::with_client_id(client_id))
    }

    fn from_doc(doc: Doc) -> Self {
        let bots = doc.get_or_insert_map("bots");
        let tags = doc.get_or_insert_map("tags");
        Self { doc, bots, tags }
    }

    /// Apply one raw v1 update.
    pub fn apply_update(&mut self, update: &[u8]) -> Result<(), CoreError> {
        let update = Update::decode_v1(update)?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| CoreError::InvalidUpdate(e.to_string()))
    }

    /// Apply one base64-encoded v1 update, as carried on the wire.
    pub fn apply_encoded(&mut self, update: &str) -> Result<(), CoreError> {
        let bytes = decode_update(update)?;
        self.apply_update(&bytes)
    }

    /// Apply bot actions in one transaction and return the resulting update.
    pub fn apply_actions(&mut self, actions: Vec<BotAction>) -> Vec<u8> {
        let actions = expand_actions(actions, &self.state());
        let mut txn = self.doc.transact_mut();

        for action in actions {
            match action {
                BotAction::AddBot { id, tags } => {
                    // Tags written concurrently with an earlier removal
                    // outlive their bot and must not come back with it.
                    if !self.bots.contains_key(&txn, &id) {
                        self.clear_tags(&mut txn, &id);
                    }
                    self.bots.insert(&mut txn, id.as_str(), PRESENT.to_string());
                    for (name, value) in &tags {
                        self.write_tag(&mut txn, &id, name, value);
                    }
                }
                BotAction::RemoveBot { id } => {
                    self.bots.remove(&mut txn, &id);
                    self.clear_tags(&mut txn, &id);
                }
                BotAction::UpdateBot { id, tags } => {
                    if !self.bots.contains_key(&txn, &id) {
                        log::debug!("Ignoring update for unknown bot {id}");
                        continue;
                    }
                    for (name, value) in &tags {
                        self.write_tag(&mut txn, &id, name, value);
                    }
                }
                BotAction::ApplyState { .. } => {}
            }
        }

        txn.encode_update_v1()
    }

    fn clear_tags(&self, txn: &mut TransactionMut, bot_id: &str) {
        let prefix = format!("{bot_id}{TAG_SEP}");
        let keys: Vec<String> = self
            .tags
            .keys(&*txn)
            .filter(|key| key.starts_with(&prefix))
            .map(str::to_string)
            .collect();
        for key in keys {
            self.tags.remove(txn, &key);
        }
    }

    fn write_tag(&self, txn: &mut TransactionMut, bot_id: &str, name: &str, value: &Value) {
        let key = tag_key(bot_id, name);
        if has_value(value) {
            self.tags.insert(txn, key, value.to_string());
        } else {
            self.tags.remove(txn, &key);
        }
    }

    /// Current materialized state.
    pub fn state(&self) -> BotsState {
        let txn = self.doc.transact();
        let mut state: BotsState = self
            .bots
            .keys(&txn)
            .map(|id| (id.to_string(), Bot::new(id, BotTags::new())))
            .collect();

        for (key, value) in self.tags.iter(&txn) {
            let Some((bot_id, name)) = key.split_once(TAG_SEP) else {
                continue;
            };
            let Some(bot) = state.get_mut(bot_id) else {
                continue;
            };
            let Out::Any(Any::String(raw)) = value else {
                continue;
            };
            match serde_json::from_str::<Value>(&raw) {
                Ok(value) if has_value(&value) => {
                    bot.tags.insert(name.to_string(), value);
                }
                Ok(_) => {}
                Err(e) => log::warn!("Skipping malformed tag {name} on {bot_id}: {e}"),
            }
        }

        state
    }

    /// Entire document as a single v1 update.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }
}

/// Base64-encode an update for the wire.
pub fn encode_update(update: &[u8]) -> String {
    STANDARD.encode(update)
}

pub fn decode_update(update: &str) -> Result<Vec<u8>, CoreError> {
    Ok(STANDARD.decode(update)?)
}

/// Fold a list of base64 updates into bot state.
pub fn fold_updates<S: AsRef<str>>(updates: &[S]) -> Result<BotsState, CoreError> {
    let mut doc = BotsDoc::new();
    for update in updates {
        doc.apply_encoded(update.as_ref())?;
    }
    Ok(doc.state())
}
