//! Durable queue of pending mutations.
//!
//! Actions created while offline are persisted here until a flush hands them to
//! the backend. The store has no network awareness; see `sync` for draining.

mod action;
mod storage;
mod store;

pub use action::{ActionPayload, ApplyPayload, QueuedAction, UploadPayload};
pub use storage::{KeyValueStore, SqliteKeyValue};
pub use store::ActionStore;
