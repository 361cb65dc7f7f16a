//! Durable action store: the only way to touch the persisted queue.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::action::{ActionPayload, QueuedAction};
use super::storage::KeyValueStore;

/// Key under which the whole queue is persisted as a JSON array.
pub const QUEUE_KEY: &str = "offline-action-queue";

/// The persisted array, split into records this version can read and the rest.
///
/// Unreadable records are never handed out, but every rewrite puts them back so
/// a newer client can still pick them up.
#[derive(Default)]
struct PersistedQueue {
  actions: Vec<QueuedAction>,
  unreadable: Vec<Value>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Record<'a> {
  Action(&'a QueuedAction),
  Raw(&'a Value),
}

/// Ordered, persisted collection of pending actions.
///
/// Every mutation is a read-modify-write of the full list under `write_lock`, so
/// concurrent callers never lose each other's updates.
pub struct ActionStore<K: KeyValueStore> {
  kv: K,
  write_lock: Mutex<()>,
  handler_bound: AtomicBool,
}

impl<K: KeyValueStore> ActionStore<K> {
  pub fn new(kv: K) -> Self {
    Self {
      kv,
      write_lock: Mutex::new(()),
      handler_bound: AtomicBool::new(false),
    }
  }

  /// Append a new action with `retries = 0`.
  ///
  /// Fails only if the queue can't be persisted; the action is not queued then.
  pub fn enqueue(&self, payload: ActionPayload) -> Result<QueuedAction> {
    let _guard = self.lock()?;
    let mut queue = self.read_queue()?;

    let mut action = QueuedAction::new(payload.clone());
    while queue.actions.iter().any(|a| a.id == action.id) {
      action = QueuedAction::new(payload.clone());
    }

    queue.actions.push(action.clone());
    self
      .write_queue(&queue)
      .map_err(|e| eyre!("Failed to enqueue {} action: {}", action.kind(), e))?;

    info!(id = %action.id, kind = action.kind(), pending = queue.actions.len(), "Action queued");

    Ok(action)
  }

  /// Remove the action with `id`. Returns false, without error, if it's not there.
  pub fn dequeue(&self, id: &str) -> Result<bool> {
    let _guard = self.lock()?;
    let mut queue = self.read_queue()?;

    let before = queue.actions.len();
    queue.actions.retain(|a| a.id != id);
    if queue.actions.len() == before {
      debug!(id, "Dequeue of absent action ignored");
      return Ok(false);
    }

    self.write_queue(&queue)?;
    Ok(true)
  }

  /// Snapshot of all pending actions in insertion order.
  ///
  /// Records this version can't parse are logged and left out.
  pub fn get_queue(&self) -> Result<Vec<QueuedAction>> {
    Ok(self.read_queue()?.actions)
  }

  /// Number of pending actions.
  pub fn len(&self) -> Result<usize> {
    Ok(self.read_queue()?.actions.len())
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  /// Increment the retry counter of `id` and return the updated record.
  ///
  /// Returns `None` when the action is no longer queued (e.g. a racing flush
  /// already removed it).
  pub fn record_failure(&self, id: &str) -> Result<Option<QueuedAction>> {
    let _guard = self.lock()?;
    let mut queue = self.read_queue()?;

    let updated = match queue.actions.iter_mut().find(|a| a.id == id) {
      Some(action) => {
        action.retries += 1;
        action.clone()
      }
      None => return Ok(None),
    };

    self.write_queue(&queue)?;
    Ok(Some(updated))
  }

  /// Claim the single handler slot of this store.
  pub(crate) fn bind_handler(&self) -> Result<()> {
    self
      .handler_bound
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .map(|_| ())
      .map_err(|_| eyre!("A sync handler is already bound to this action store"))
  }

  pub(crate) fn release_handler(&self) {
    self.handler_bound.store(false, Ordering::Release);
  }

  fn lock(&self) -> Result<MutexGuard<'_, ()>> {
    self
      .write_lock
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn read_queue(&self) -> Result<PersistedQueue> {
    let Some(text) = self.kv.get(QUEUE_KEY)? else {
      return Ok(PersistedQueue::default());
    };

    let records: Vec<Value> = serde_json::from_str(&text)
      .map_err(|e| eyre!("Failed to parse persisted action queue: {}", e))?;

    let mut queue = PersistedQueue::default();
    for record in records {
      match QueuedAction::deserialize(&record) {
        Ok(action) => queue.actions.push(action),
        Err(e) => {
          warn!(error = %e, "Skipping unreadable queued action");
          queue.unreadable.push(record);
        }
      }
    }

    Ok(queue)
  }

  fn write_queue(&self, queue: &PersistedQueue) -> Result<()> {
    let records: Vec<Record<'_>> = queue
      .actions
      .iter()
      .map(Record::Action)
      .chain(queue.unreadable.iter().map(Record::Raw))
      .collect();

    let text = serde_json::to_string(&records)
      .map_err(|e| eyre!("Failed to serialize action queue: {}", e))?;
    self.kv.set(QUEUE_KEY, &text)
  }
}
