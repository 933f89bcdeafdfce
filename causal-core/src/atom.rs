//! Atoms: immutable, hash-addressed causal operations.
//!
//! Every atom carries an id `(site, timestamp)`, an optional cause (the id of
//! its parent atom) and an operation payload. The content hash is computed
//! over a canonical JSON encoding of `[id, cause, value]`:
//!
//! ```text
//! [{"site":"a","timestamp":1},null,{"id":"bot1","type":1}]
//!        │                     │            │
//!        id                  cause        value (keys sorted)
//!                                  │
//!                                  ▼
//!                          hex(sha256(bytes))
//! ```
//!
//! Object keys are sorted at every depth so two independent encoders produce
//! byte-identical input for the digest.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;

use crate::bot::{has_value, BotTags};

/// Operation type codes stored in the `type` field of an atom value.
pub mod op_type {
    pub const BOT: u64 = 1;
    pub const TAG: u64 = 2;
    pub const VALUE: u64 = 3;
    pub const DELETE: u64 = 4;
    pub const SETUP_BRANCH: u64 = 10;
}

/// Identity of an atom: the site that created it and its logical timestamp.
///
/// Ordered by `(timestamp, site)` ascending.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AtomId {
    pub site: String,
    pub timestamp: u64,
}

impl AtomId {
    pub fn new(site: impl Into<String>, timestamp: u64) -> Self {
        Self {
            site: site.into(),
            timestamp,
        }
    }
}

impl Ord for AtomId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.site.cmp(&other.site))
    }
}

impl PartialOrd for AtomId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for AtomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.site, self.timestamp)
    }
}

/// A single causal operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atom {
    pub id: AtomId,
    pub cause: Option<AtomId>,
    pub value: Value,
    pub hash: String,
}

impl Atom {
    /// Create an atom and compute its content hash.
    pub fn new(id: AtomId, cause: Option<AtomId>, value: Value) -> Self {
        let hash = atom_hash(&id, cause.as_ref(), &value);
        Self {
            id,
            cause,
            value,
            hash,
        }
    }

    /// Whether the stored hash matches the atom's content.
    pub fn is_valid(&self) -> bool {
        atom_hash(&self.id, self.cause.as_ref(), &self.value) == self.hash
    }

    /// Decode the operation carried by this atom.
    pub fn op(&self) -> AtomOp {
        AtomOp::from_value(&self.value)
    }
}

/// Compute the content hash of `(id, cause, value)`.
pub fn atom_hash(id: &AtomId, cause: Option<&AtomId>, value: &Value) -> String {
    let mut canonical = String::with_capacity(64);
    canonical.push('[');
    write_id(id, &mut canonical);
    canonical.push(',');
    match cause {
        Some(cause) => write_id(cause, &mut canonical),
        None => canonical.push_str("null"),
    }
    canonical.push(',');
    write_canonical(value, &mut canonical);
    canonical.push(']');

    hex::encode(Sha256::digest(canonical.as_bytes()))
}

fn write_id(id: &AtomId, out: &mut String) {
    out.push_str("{\"site\":");
    out.push_str(&Value::String(id.site.clone()).to_string());
    out.push_str(",\"timestamp\":");
    out.push_str(&id.timestamp.to_string());
    out.push('}');
}

/// Canonical JSON: object keys sorted at every depth, no whitespace.
pub fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Decoded atom operation.
#[derive(Debug, Clone, PartialEq)]
pub enum AtomOp {
    /// Root of a bot's subtree.
    Bot { id: String },
    /// Tag name, child of a bot atom.
    Tag { name: String },
    /// Tag value, child of a tag atom.
    Value { value: Value },
    /// Deletes the bot atom it is attached to.
    Delete,
    /// Request to seed another (empty) branch with a bot.
    SetupBranch {
        branch: String,
        bot_id: Option<String>,
        tags: BotTags,
    },
    /// Any payload the reducer does not understand.
    Unknown,
}

impl AtomOp {
    /// Decode an operation from an atom value.
    pub fn from_value(value: &Value) -> Self {
        let Some(kind) = value.get("type").and_then(Value::as_u64) else {
            return AtomOp::Unknown;
        };
        match kind {
            op_type::BOT => match value.get("id").and_then(Value::as_str) {
                Some(id) => AtomOp::Bot { id: id.to_string() },
                None => AtomOp::Unknown,
            },
            op_type::TAG => match value.get("name").and_then(Value::as_str) {
                Some(name) => AtomOp::Tag {
                    name: name.to_string(),
                },
                None => AtomOp::Unknown,
            },
            op_type::VALUE => AtomOp::Value {
                value: value.get("value").cloned().unwrap_or(Value::Null),
            },
            op_type::DELETE => AtomOp::Delete,
            op_type::SETUP_BRANCH => {
                let Some(branch) = value.get("branch").and_then(Value::as_str) else {
                    return AtomOp::Unknown;
                };
                let tags = value
                    .get("tags")
                    .and_then(Value::as_object)
                    .map(|tags| {
                        tags.iter()
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect::<BotTags>()
                    })
                    .unwrap_or_default();
                AtomOp::SetupBranch {
                    branch: branch.to_string(),
                    bot_id: value
                        .get("botId")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    tags,
                }
            }
            _ => AtomOp::Unknown,
        }
    }

    /// Encode this operation as an atom value.
    pub fn to_value(&self) -> Value {
        match self {
            AtomOp::Bot { id } => bot_op(id),
            AtomOp::Tag { name } => tag_op(name),
            AtomOp::Value { value } => value_op(value.clone()),
            AtomOp::Delete => delete_op(),
            AtomOp::SetupBranch {
                branch,
                bot_id,
                tags,
            } => setup_branch_op(branch, bot_id.as_deref(), tags),
            AtomOp::Unknown => Value::Null,
        }
    }
}

pub fn bot_op(id: &str) -> Value {
    json!({ "type": op_type::BOT, "id": id })
}

pub fn tag_op(name: &str) -> Value {
    json!({ "type": op_type::TAG, "name": name })
}

pub fn value_op(value: Value) -> Value {
    json!({ "type": op_type::VALUE, "value": value })
}

pub fn delete_op() -> Value {
    json!({ "type": op_type::DELETE })
}

pub fn setup_branch_op(branch: &str, bot_id: Option<&str>, tags: &BotTags) -> Value {
    let mut op = Map::new();
    op.insert("type".into(), json!(op_type::SETUP_BRANCH));
    op.insert("branch".into(), json!(branch));
    if let Some(bot_id) = bot_id {
        op.insert("botId".into(), json!(bot_id));
    }
    op.insert(
        "tags".into(),
        Value::Object(tags.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
    );
    Value::Object(op)
}

/// Atomize a whole bot: one bot atom, then a tag atom and a value atom per
/// present tag, with consecutive timestamps starting at `first_timestamp`.
pub fn atomize_bot(site: &str, first_timestamp: u64, bot_id: &str, tags: &BotTags) -> Vec<Atom> {
    let mut timestamp = first_timestamp;
    let bot = Atom::new(AtomId::new(site, timestamp), None, bot_op(bot_id));
    let mut atoms = Vec::with_capacity(1 + tags.len() * 2);

    for (name, value) in tags.iter().filter(|(_, v)| has_value(v)) {
        timestamp += 1;
        let tag = Atom::new(
            AtomId::new(site, timestamp),
            Some(bot.id.clone()),
            tag_op(name),
        );
        timestamp += 1;
        let val = Atom::new(
            AtomId::new(site, timestamp),
            Some(tag.id.clone()),
            value_op(value.clone()),
        );
        atoms.push(tag);
        atoms.push(val);
    }

    atoms.insert(0, bot);
    atoms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atom_id_ordering() {
        let a = AtomId::new("b", 1);
        let b = AtomId::new("a", 2);
        let c = AtomId::new("b", 2);

        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.to_string(), "b@1");
    }

    #[test]
    fn test_hash_is_deterministic() {
        let id = AtomId::new("site", 1);
        let a1 = Atom::new(id.clone(), None, bot_op("bot1"));
        let a2 = Atom::new(id, None, bot_op("bot1"));

        assert_eq!(a1.hash, a2.hash);
        assert_eq!(a1.hash.len(), 64);
        assert!(a1.is_valid());
    }

    #[test]
    fn test_hash_depends_on_cause() {
        let root = Atom::new(AtomId::new("site", 1), None, bot_op("bot1"));
        let with_cause = Atom::new(AtomId::new("site", 2), Some(root.id.clone()), tag_op("color"));
        let without_cause = Atom::new(AtomId::new("site", 2), None, tag_op("color"));

        assert_ne!(with_cause.hash, without_cause.hash);
    }

    #[test]
    fn test_hash_ignores_key_order() {
        let id = AtomId::new("site", 3);
        let v1: Value = serde_json::from_str(r#"{"type":3,"value":{"b":1,"a":[{"y":2,"x":1}]}}"#).unwrap();
        let v2: Value = serde_json::from_str(r#"{"value":{"a":[{"x":1,"y":2}],"b":1},"type":3}"#).unwrap();

        assert_eq!(atom_hash(&id, None, &v1), atom_hash(&id, None, &v2));
    }

    #[test]
    fn test_canonical_encoding() {
        let value: Value = serde_json::from_str(r#"{"z":"q\"uote","a":[1,null,true]}"#).unwrap();
        let mut out = String::new();
        write_canonical(&value, &mut out);
        assert_eq!(out, r#"{"a":[1,null,true],"z":"q\"uote"}"#);
    }

    #[test]
    fn test_tampered_atom_is_invalid() {
        let mut atom = Atom::new(AtomId::new("site", 1), None, bot_op("bot1"));
        atom.value = bot_op("bot2");
        assert!(!atom.is_valid());
    }

    #[test]
    fn test_op_decoding() {
        assert_eq!(AtomOp::from_value(&bot_op("b")), AtomOp::Bot { id: "b".into() });
        assert_eq!(AtomOp::from_value(&tag_op("t")), AtomOp::Tag { name: "t".into() });
        assert_eq!(
            AtomOp::from_value(&value_op(json!(5))),
            AtomOp::Value { value: json!(5) }
        );
        assert_eq!(AtomOp::from_value(&delete_op()), AtomOp::Delete);
        assert_eq!(AtomOp::from_value(&json!({"type": 99})), AtomOp::Unknown);
        assert_eq!(AtomOp::from_value(&json!("plain")), AtomOp::Unknown);
    }

    #[test]
    fn test_setup_branch_op() {
        let mut tags = BotTags::new();
        tags.insert("color".into(), json!("red"));
        let value = setup_branch_op("target", None, &tags);

        match AtomOp::from_value(&value) {
            AtomOp::SetupBranch { branch, bot_id, tags } => {
                assert_eq!(branch, "target");
                assert!(bot_id.is_none());
                assert_eq!(tags.get("color"), Some(&json!("red")));
            }
            other => panic!("Expected SetupBranch, got {other:?}"),
        }
    }

    #[test]
    fn test_atomize_bot_links_causes() {
        let mut tags = BotTags::new();
        tags.insert("color".into(), json!("red"));
        tags.insert("empty".into(), json!(""));
        tags.insert("size".into(), json!(3));

        let atoms = atomize_bot("s", 10, "bot1", &tags);
        // bot + 2 × (tag, value); the empty tag is skipped
        assert_eq!(atoms.len(), 5);
        assert_eq!(atoms[0].cause, None);
        assert_eq!(atoms[1].cause.as_ref(), Some(&atoms[0].id));
        assert_eq!(atoms[2].cause.as_ref(), Some(&atoms[1].id));
        assert_eq!(atoms[3].cause.as_ref(), Some(&atoms[0].id));
        assert_eq!(atoms[4].id.timestamp, 14);
    }
}
