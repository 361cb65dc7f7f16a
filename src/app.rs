use crate::api::{BackendHandler, HttpNetwork};
use crate::cache::{CacheManager, CacheSource, Request, SqliteStorage};
use crate::config::Config;
use crate::db::Database;
use crate::event::SyncEvent;
use crate::queue::{ActionPayload, ActionStore, QueuedAction, SqliteKeyValue};
use crate::sync::{spawn_probe, Connectivity, FlushReport, Reachability, SyncOrchestrator};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

/// Wires the cache, the action store and the orchestrator to one database
pub struct App {
  config: Config,
  cache: CacheManager<SqliteStorage, HttpNetwork>,
  store: Arc<ActionStore<SqliteKeyValue>>,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let db = Arc::new(Database::open(Some(config.database_path()?.as_path()))?);
    let network = Arc::new(HttpNetwork::new(&config)?);

    let cache = CacheManager::new(
      Arc::new(SqliteStorage::new(db.clone())),
      network,
      config.namespace(),
    )
    .with_fallback(config.resolve(&config.cache.fallback)?);

    let store = Arc::new(ActionStore::new(SqliteKeyValue::new(db)));

    Ok(Self {
      config,
      cache,
      store,
    })
  }

  fn orchestrator(&self, max_retries: u32) -> Result<SyncOrchestrator<SqliteKeyValue, BackendHandler>> {
    let handler = BackendHandler::new(&self.config)?;
    SyncOrchestrator::new(self.store.clone(), handler, max_retries)
  }

  /// Populate the current namespace and retire every other one
  pub async fn install(&self) -> Result<()> {
    let report = self.cache.install(&self.config.manifest_urls()?).await?;
    let deleted = self.cache.activate()?;

    println!(
      "Installed {} ({} resources)",
      report.namespace, report.entries
    );
    for name in deleted {
      println!("Deleted stale namespace {}", name);
    }
    Ok(())
  }

  /// Serve one request through the cache and describe where it came from
  pub async fn get(
    &self,
    path: &str,
    navigate: bool,
    method: Option<Method>,
    data: Option<String>,
  ) -> Result<()> {
    let url = self.config.resolve(path)?;
    let mut request = if navigate {
      Request::navigate(url)
    } else {
      Request::get(url)
    };
    if let Some(method) = method {
      request = request.with_method(method);
    }
    if let Some(data) = data {
      request = request.with_body(data.into_bytes());
    }

    let result = self.cache.handle(request).await?;
    let source = match result.source {
      CacheSource::Network => "network",
      CacheSource::Cache => "cache",
      CacheSource::Fallback => "fallback",
    };

    println!(
      "{} {} ({} bytes)",
      result.data.status,
      source,
      result.data.body.len()
    );
    if let Some(cached_at) = result.cached_at {
      println!("cached at {}", cached_at.to_rfc3339());
    }
    Ok(())
  }

  pub fn show_cache(&self) -> Result<()> {
    for name in self.cache.namespaces()? {
      let marker = if name == self.cache.namespace() { "*" } else { " " };
      println!("{} {}", marker, name);
    }
    for key in self.cache.keys()? {
      println!("    {}", key);
    }
    Ok(())
  }

  pub fn enqueue(&self, kind: &str, payload: &str) -> Result<()> {
    let payload = serde_json::from_str(payload)
      .map_err(|e| eyre!("Payload is not valid JSON: {}", e))?;
    let action = self
      .store
      .enqueue(ActionPayload::from_parts(kind.to_string(), payload))?;

    println!("{}", action.id);
    Ok(())
  }

  pub fn show_queue(&self) -> Result<()> {
    if self.store.is_empty()? {
      println!("Queue is empty");
      return Ok(());
    }

    let queue = self.store.get_queue()?;
    println!("{} action(s) pending", queue.len());
    for action in &queue {
      print_action(action);
    }
    Ok(())
  }

  pub fn dequeue(&self, id: &str) -> Result<()> {
    if self.store.dequeue(id)? {
      println!("Removed {}", id);
    } else {
      println!("{} was not queued", id);
    }
    Ok(())
  }

  /// Drain the queue once against the backend
  pub async fn flush(&self, max_retries: Option<u32>) -> Result<()> {
    let max_retries = max_retries.unwrap_or(self.config.queue.max_retries);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sync = self.orchestrator(max_retries)?.with_events(tx);

    // The closing Flushed event carries the report
    sync.flush().await?;
    drop(sync);

    while let Some(event) = rx.recv().await {
      print_event(&event);
    }
    Ok(())
  }

  /// Follow connectivity and flush on every reconnect until interrupted
  pub async fn watch(&self) -> Result<()> {
    let network = HttpNetwork::new(&self.config)?;
    let probe = network.probe(self.config.resolve(&self.config.network.probe_path)?);

    let online = probe.check().await;
    let connectivity = Arc::new(Connectivity::new(online));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sync = Arc::new(
      self
        .orchestrator(self.config.queue.max_retries)?
        .with_events(tx),
    );

    info!(
      online,
      pending = self.store.len()?,
      max_retries = sync.max_retries(),
      "Watching connectivity"
    );
    if online {
      sync.flush().await?;
    }

    let registration = sync.register(connectivity.subscribe());
    let probe_task = spawn_probe(
      connectivity.clone(),
      probe,
      self.config.network.probe_interval(),
    );

    loop {
      tokio::select! {
        Some(event) = rx.recv() => print_event(&event),
        _ = tokio::signal::ctrl_c() => break,
      }
    }

    info!(
      online = connectivity.is_online(),
      listening = registration.is_active(),
      "Stopping"
    );
    registration.teardown();
    probe_task.abort();
    Ok(())
  }
}

fn print_action(action: &QueuedAction) {
  println!(
    "{}  {:<8} retries={}  created {}",
    action.id,
    action.kind(),
    action.retries,
    action.created_at.to_rfc3339()
  );
}

fn print_event(event: &SyncEvent) {
  match event {
    SyncEvent::Succeeded { id } => println!("sent     {}", id),
    SyncEvent::Retrying { id, retries } => println!("retry    {} (attempt {} failed)", id, retries),
    SyncEvent::Dropped(action) => println!("DROPPED  {} ({}), gave up after {} retries", action.id, action.kind(), action.retries),
    SyncEvent::Flushed(report) => print_report(report),
  }
}

fn print_report(report: &FlushReport) {
  println!(
    "succeeded={} failed={} dropped={}",
    report.succeeded, report.failed, report.dropped
  );
}
