//! # causal-core — Data model for causal branch sync
//!
//! Pure, I/O-free building blocks shared by the relay and the client-side
//! partition.
//!
//! ## Architecture
//!
//! ```text
//!   atoms (atoms protocol)              v1 updates (updates protocol)
//!          │                                     │
//!          ▼                                     ▼
//! ┌─────────────────┐                   ┌─────────────────┐
//! │ Weave           │                   │ BotsDoc         │
//! │ hash arena +    │                   │ yrs maps        │
//! │ cause index     │                   │ bots / tags     │
//! └────────┬────────┘                   └────────┬────────┘
//!          │ reduce                              │ read
//!          └──────────────►  BotsState  ◄────────┘
//!                               │
//!                               ▼ diff
//!                          StateUpdate
//! ```
//!
//! ## Modules
//!
//! - [`atom`] — Atom ids, content hashing, operation payloads
//! - [`bot`] — Bots, state diffs, bot actions
//! - [`weave`] — Causal arena and deterministic reduction
//! - [`doc`] — yrs bots document and update folding

pub mod atom;
pub mod bot;
pub mod doc;
pub mod error;
pub mod weave;

pub use atom::{atom_hash, atomize_bot, Atom, AtomId, AtomOp};
pub use bot::{
    diff_bots, diff_states, expand_actions, has_value, Bot, BotAction, BotTags, BotsState,
    StateUpdate, UpdatedBot,
};
pub use doc::{decode_update, encode_update, fold_updates, BotsDoc};
pub use error::CoreError;
pub use weave::{InsertResult, Weave};
