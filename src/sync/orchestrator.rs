//! Drains the action store through a bound handler with bounded retries.

use color_eyre::Result;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::event::SyncEvent;
use crate::queue::{ActionStore, KeyValueStore, QueuedAction};

/// Default retry budget per action.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Delivers one queued action to the backend.
///
/// Implementations must be idempotent: two racing flushes can hand the same
/// action over twice.
pub trait ActionHandler: Send + Sync + 'static {
  fn handle(&self, action: &QueuedAction) -> impl Future<Output = Result<()>> + Send;
}

impl<F, Fut> ActionHandler for F
where
  F: Fn(QueuedAction) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<()>> + Send,
{
  fn handle(&self, action: &QueuedAction) -> impl Future<Output = Result<()>> + Send {
    self(action.clone())
  }
}

/// Outcome counts of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
  pub succeeded: usize,
  pub failed: usize,
  pub dropped: usize,
}

/// Replays queued actions through exactly one handler.
///
/// Holds no state between flushes: every flush starts from a fresh snapshot of
/// the store. Constructing a second orchestrator for the same store fails until
/// the first is dropped.
pub struct SyncOrchestrator<K: KeyValueStore + 'static, H: ActionHandler> {
  store: Arc<ActionStore<K>>,
  handler: H,
  max_retries: u32,
  events: Option<mpsc::UnboundedSender<SyncEvent>>,
}

impl<K: KeyValueStore + 'static, H: ActionHandler> SyncOrchestrator<K, H> {
  /// Bind `handler` to `store`.
  pub fn new(store: Arc<ActionStore<K>>, handler: H, max_retries: u32) -> Result<Self> {
    store.bind_handler()?;

    Ok(Self {
      store,
      handler,
      max_retries,
      events: None,
    })
  }

  /// Publish per-action outcomes on `tx`.
  pub fn with_events(mut self, tx: mpsc::UnboundedSender<SyncEvent>) -> Self {
    self.events = Some(tx);
    self
  }

  pub fn max_retries(&self) -> u32 {
    self.max_retries
  }

  /// Attempt every currently queued action once, in insertion order.
  ///
  /// Actions enqueued while this runs wait for the next flush. A store write that
  /// fails mid-flush is logged and the action is presumed still queued.
  pub async fn flush(&self) -> Result<FlushReport> {
    let snapshot = self.store.get_queue()?;
    let mut report = FlushReport::default();

    if snapshot.is_empty() {
      debug!("Nothing queued, flush is a no-op");
    }

    for action in snapshot {
      let outcome = self.handler.handle(&action).await;
      match outcome {
        Ok(()) => {
          report.succeeded += 1;
          if let Err(e) = self.store.dequeue(&action.id) {
            warn!(id = %action.id, error = %e, "Delivered action could not be removed and may be replayed");
          }
          self.emit(SyncEvent::Succeeded { id: action.id });
        }
        Err(e) if action.retries < self.max_retries => {
          report.failed += 1;
          warn!(id = %action.id, retries = action.retries, error = %e, "Action failed, will retry");

          match self.store.record_failure(&action.id) {
            Ok(Some(updated)) => self.emit(SyncEvent::Retrying {
              id: updated.id,
              retries: updated.retries,
            }),
            Ok(None) => debug!(id = %action.id, "Action left the queue during flush"),
            Err(store_err) => {
              warn!(id = %action.id, error = %store_err, "Retry count not saved, action presumed still queued")
            }
          }
        }
        Err(e) => {
          report.dropped += 1;
          warn!(
            id = %action.id,
            retries = action.retries,
            error = %e,
            "Retry budget exhausted, dropping action"
          );

          if let Err(store_err) = self.store.dequeue(&action.id) {
            warn!(id = %action.id, error = %store_err, "Dropped action could not be removed");
          }
          self.emit(SyncEvent::Dropped(action));
        }
      }
    }

    info!(
      succeeded = report.succeeded,
      failed = report.failed,
      dropped = report.dropped,
      "Flush complete"
    );
    self.emit(SyncEvent::Flushed(report));

    Ok(report)
  }

  /// Flush on every offline → online transition seen on `online`.
  ///
  /// The listener runs until the returned registration is torn down or dropped,
  /// or the connectivity source goes away. Stopping it never cuts a running
  /// flush short: the stop signal is only observed between flushes.
  pub fn register(self: &Arc<Self>, mut online: watch::Receiver<bool>) -> Registration {
    let this = Arc::clone(self);
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
      let mut was_online = *online.borrow_and_update();

      loop {
        tokio::select! {
          biased;
          // Fires on teardown and when the registration is dropped
          _ = &mut stop_rx => {
            debug!("Listener detached");
            break;
          }
          changed = online.changed() => {
            if changed.is_err() {
              debug!("Connectivity source closed, listener stopped");
              break;
            }
          }
        }

        let is_online = *online.borrow_and_update();
        if is_online && !was_online {
          info!("Back online, flushing queued actions");
          if let Err(e) = this.flush().await {
            warn!(error = %e, "Flush after reconnect failed");
          }
        }
        was_online = is_online;
      }
    });

    Registration {
      stop: stop_tx,
      task,
    }
  }

  fn emit(&self, event: SyncEvent) {
    if let Some(tx) = &self.events {
      // Receiver may have been dropped
      let _ = tx.send(event);
    }
  }
}

impl<K: KeyValueStore + 'static, H: ActionHandler> Drop for SyncOrchestrator<K, H> {
  fn drop(&mut self) {
    self.store.release_handler();
  }
}

/// Handle to an attached online-transition listener.
///
/// Dropping it detaches the listener just like `teardown`.
pub struct Registration {
  stop: oneshot::Sender<()>,
  task: JoinHandle<()>,
}

impl Registration {
  /// Detach the listener. A flush already in progress runs to completion.
  pub fn teardown(self) {
    // Err only if the listener already stopped on its own
    let _ = self.stop.send(());
  }

  pub fn is_active(&self) -> bool {
    !self.task.is_finished()
  }
}
