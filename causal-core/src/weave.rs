//! Weave: arena of atoms reduced into bot state.
//!
//! Atoms are held in a hash-indexed arena with two derived indexes, so the
//! causal DAG never needs parent/child pointers:
//!
//! ```text
//!   entries: hash ──► (Atom, AtomOp)
//!   ids:     AtomId ──► hash
//!   children: cause AtomId ──► BTreeSet<AtomId>   (sorted by (timestamp, site))
//!   bots:    bot id ──► BTreeSet<AtomId>           (bot atoms for that id)
//! ```
//!
//! Reduction rules:
//! - a bot exists iff one of its bot atoms has no `Delete` child
//! - each tag takes the value of its greatest value atom by `(timestamp, site)`
//!   across all live bot atoms of the bot
//! - values that are `null` or `""` leave the tag unset
//!
//! Because reduction only reads the arena, the result depends on the set of
//! atoms present and never on the order they arrived in. Atoms whose cause
//! has not arrived yet stay in the arena and are picked up once it does.
//!
//! Reference: Grishchenko — Causal Trees (2010)

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde_json::Value;

use crate::atom::{Atom, AtomId, AtomOp};
use crate::bot::{has_value, Bot, BotTags, BotsState};

/// Limit on cause-chain walks: bot → tag → value is three levels deep.
const MAX_CAUSE_DEPTH: usize = 8;

struct Entry {
    atom: Atom,
    op: AtomOp,
}

/// Outcome of inserting one atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    Added,
    /// Same hash already present.
    Duplicate,
    /// Hash was removed earlier; removals win.
    Tombstoned,
    /// Another atom with the same id and a smaller hash is present.
    Conflict,
}

/// Local materialization of one branch's atom DAG.
#[derive(Default)]
pub struct Weave {
    entries: HashMap<String, Entry>,
    ids: HashMap<AtomId, String>,
    children: HashMap<AtomId, BTreeSet<AtomId>>,
    bots: HashMap<String, BTreeSet<AtomId>>,
    removed: HashSet<String>,
}

impl Weave {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn get(&self, hash: &str) -> Option<&Atom> {
        self.entries.get(hash).map(|e| &e.atom)
    }

    pub fn get_by_id(&self, id: &AtomId) -> Option<&Atom> {
        self.ids.get(id).and_then(|hash| self.get(hash))
    }

    /// Greatest timestamp held, for advancing a Lamport clock.
    pub fn max_timestamp(&self) -> u64 {
        self.ids.keys().map(|id| id.timestamp).max().unwrap_or(0)
    }

    /// All atoms in total order `(timestamp, site)`.
    pub fn atoms(&self) -> Vec<&Atom> {
        let mut ids: Vec<&AtomId> = self.ids.keys().collect();
        ids.sort();
        ids.into_iter().filter_map(|id| self.get_by_id(id)).collect()
    }

    /// Insert one atom into the arena.
    pub fn insert(&mut self, atom: Atom) -> InsertResult {
        if self.entries.contains_key(&atom.hash) {
            return InsertResult::Duplicate;
        }
        if self.removed.contains(&atom.hash) {
            return InsertResult::Tombstoned;
        }
        if let Some(existing) = self.ids.get(&atom.id).cloned() {
            if existing < atom.hash {
                log::warn!(
                    "Atom id {} reused with a different hash, keeping {}",
                    atom.id,
                    existing
                );
                return InsertResult::Conflict;
            }
            self.detach(&existing);
        }

        let op = atom.op();
        if let Some(cause) = &atom.cause {
            self.children
                .entry(cause.clone())
                .or_default()
                .insert(atom.id.clone());
        }
        if let AtomOp::Bot { id } = &op {
            self.bots.entry(id.clone()).or_default().insert(atom.id.clone());
        }
        self.ids.insert(atom.id.clone(), atom.hash.clone());
        self.entries.insert(atom.hash.clone(), Entry { atom, op });
        InsertResult::Added
    }

    /// Remove an atom by hash. Later inserts of the same hash are ignored.
    pub fn remove(&mut self, hash: &str) -> Option<Atom> {
        self.removed.insert(hash.to_string());
        self.detach(hash)
    }

    fn detach(&mut self, hash: &str) -> Option<Atom> {
        let entry = self.entries.remove(hash)?;
        let atom = entry.atom;

        if self.ids.get(&atom.id).map(String::as_str) == Some(hash) {
            self.ids.remove(&atom.id);
        }
        if let Some(cause) = &atom.cause {
            if let Some(siblings) = self.children.get_mut(cause) {
                siblings.remove(&atom.id);
                if siblings.is_empty() {
                    self.children.remove(cause);
                }
            }
        }
        if let AtomOp::Bot { id } = &entry.op {
            if let Some(roots) = self.bots.get_mut(id) {
                roots.remove(&atom.id);
                if roots.is_empty() {
                    self.bots.remove(id);
                }
            }
        }
        Some(atom)
    }

    /// Apply a batch of additions and removals, returning the ids of every
    /// bot whose reduction may have changed.
    pub fn apply(&mut self, added: Vec<Atom>, removed: &[String]) -> BTreeSet<String> {
        let mut affected = BTreeSet::new();

        for hash in removed {
            if let Some(bot) = self.get(hash).and_then(|a| self.bot_of(&a.id)) {
                affected.insert(bot);
            }
            self.remove(hash);
        }

        for atom in added {
            let id = atom.id.clone();
            // An atom displaced by a smaller hash may belong to another bot.
            let displaced = self.bot_of(&id);
            if self.insert(atom) == InsertResult::Added {
                affected.extend(displaced);
                if let Some(bot) = self.bot_of(&id) {
                    affected.insert(bot);
                }
            }
        }

        affected
    }

    /// Walk the cause chain up to the owning bot atom.
    pub fn bot_of(&self, id: &AtomId) -> Option<String> {
        let mut current = id.clone();
        for _ in 0..MAX_CAUSE_DEPTH {
            let entry = self.ids.get(&current).and_then(|h| self.entries.get(h))?;
            match (&entry.op, &entry.atom.cause) {
                (AtomOp::Bot { id }, _) => return Some(id.clone()),
                (_, Some(cause)) => current = cause.clone(),
                (_, None) => return None,
            }
        }
        None
    }

    fn op_of(&self, id: &AtomId) -> Option<&AtomOp> {
        self.ids
            .get(id)
            .and_then(|h| self.entries.get(h))
            .map(|e| &e.op)
    }

    fn children_of(&self, id: &AtomId) -> impl Iterator<Item = &AtomId> {
        self.children.get(id).into_iter().flatten()
    }

    fn is_deleted(&self, bot_atom: &AtomId) -> bool {
        self.children_of(bot_atom)
            .any(|child| matches!(self.op_of(child), Some(AtomOp::Delete)))
    }

    /// Bot atoms for `bot_id` that have not been deleted, in order.
    pub fn live_bot_atoms(&self, bot_id: &str) -> Vec<&AtomId> {
        self.bots
            .get(bot_id)
            .into_iter()
            .flatten()
            .filter(|id| !self.is_deleted(id))
            .collect()
    }

    /// The tag atom new values for `name` should hang off: the earliest tag
    /// atom with that name under any live bot atom.
    pub fn tag_atom(&self, bot_id: &str, name: &str) -> Option<AtomId> {
        self.live_bot_atoms(bot_id)
            .into_iter()
            .flat_map(|bot| self.children_of(bot))
            .filter(|child| matches!(self.op_of(child), Some(AtomOp::Tag { name: n }) if n == name))
            .min()
            .cloned()
    }

    /// Hashes of every value atom currently held for tag `name` of a bot.
    pub fn value_hashes(&self, bot_id: &str, name: &str) -> Vec<String> {
        let mut hashes = Vec::new();
        for bot in self.live_bot_atoms(bot_id) {
            for tag in self.children_of(bot) {
                if !matches!(self.op_of(tag), Some(AtomOp::Tag { name: n }) if n == name) {
                    continue;
                }
                for value in self.children_of(tag) {
                    if let (Some(AtomOp::Value { .. }), Some(hash)) =
                        (self.op_of(value), self.ids.get(value))
                    {
                        hashes.push(hash.clone());
                    }
                }
            }
        }
        hashes
    }

    /// Reduce a single bot.
    pub fn reduce_bot(&self, bot_id: &str) -> Option<Bot> {
        let live = self.live_bot_atoms(bot_id);
        if live.is_empty() {
            return None;
        }

        let mut winners: BTreeMap<&str, (&AtomId, &Value)> = BTreeMap::new();
        for bot in live {
            for tag in self.children_of(bot) {
                let Some(AtomOp::Tag { name }) = self.op_of(tag) else {
                    continue;
                };
                for value_id in self.children_of(tag) {
                    let Some(AtomOp::Value { value }) = self.op_of(value_id) else {
                        continue;
                    };
                    match winners.get(name.as_str()) {
                        Some((current, _)) if *current >= value_id => {}
                        _ => {
                            winners.insert(name.as_str(), (value_id, value));
                        }
                    }
                }
            }
        }

        let tags: BotTags = winners
            .into_iter()
            .filter(|(_, (_, value))| has_value(value))
            .map(|(name, (_, value))| (name.to_string(), value.clone()))
            .collect();

        Some(Bot::new(bot_id, tags))
    }

    /// Reduce every bot in the arena.
    pub fn state(&self) -> BotsState {
        self.bots
            .keys()
            .filter_map(|id| self.reduce_bot(id).map(|bot| (id.clone(), bot)))
            .collect()
    }
}
