//! Online/offline signal shared between the host runtime and the orchestrator.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// Current connectivity, published over a watch channel.
///
/// Only actual transitions are published; setting the same state twice wakes no one.
pub struct Connectivity {
  tx: watch::Sender<bool>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx }
  }

  /// Record the current state. Returns true if it changed.
  pub fn set_online(&self, online: bool) -> bool {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });

    if changed {
      info!(online, "Connectivity changed");
    }
    changed
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

/// Something that can tell whether the backend is reachable right now.
pub trait Reachability: Send + Sync + 'static {
  fn check(&self) -> impl Future<Output = bool> + Send;
}

/// Poll `probe` every `interval` and feed the result into `connectivity`.
pub fn spawn_probe<R: Reachability>(
  connectivity: Arc<Connectivity>,
  probe: R,
  interval: Duration,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(interval);
    loop {
      ticker.tick().await;
      let reachable = probe.check().await;
      connectivity.set_online(reachable);
    }
  })
}
