//! hyperfleet-state — durable state for the fleet controller.
//!
//! Backed by [redb](https://docs.rs/redb). Persists what must survive a
//! restart: group definitions and desired sizes, instance membership and
//! lifecycle records, and the idempotency ledger for orchestrator
//! requests. Host liveness and retry timers are deliberately absent; they
//! are rebuilt in memory after a restart.
//!
//! # Layout
//!
//! All records are JSON-serialized into `&[u8]` value columns. Instances
//! and requests use `{group_id}:{child_id}` keys so a group's children can
//! be found with a prefix scan. Multi-record changes go through
//! [`StateBatch`] and commit in a single write transaction.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{StateBatch, StateStore};
pub use types::*;
