//! Cache manager that intercepts requests and serves them from the network or the
//! current cache namespace.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::storage::CacheStorage;
use super::traits::{CacheResult, CachedEntry, Network, Request, RequestMode, Response};

/// Build the namespace name for a cache generation.
///
/// The trailing digest covers the critical-resource manifest, so changing the
/// manifest rotates the namespace even when `version` stays the same.
pub fn namespace_name(prefix: &str, version: &str, manifest: &[String]) -> String {
  let mut hasher = Sha256::new();
  for resource in manifest {
    hasher.update(resource.as_bytes());
    hasher.update([0u8]);
  }
  let digest = hex::encode(hasher.finalize());

  format!("{}-{}-{}", prefix, version, &digest[..8])
}

/// Where the manager is in its install/activate lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  /// Critical resources not yet fetched by this instance
  Uninstalled,
  /// Current namespace holds the complete critical set
  Installed,
  /// Stale namespaces have been removed
  Active,
}

/// Outcome of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
  pub namespace: String,
  pub entries: usize,
}

/// Cache manager with per-request-class strategies.
///
/// Navigation requests go network-first and sub-resource reads go cache-first with a
/// background refresh. Anything but GET bypasses the cache entirely.
pub struct CacheManager<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  namespace: String,
  /// Request key served to navigations when nothing better is cached
  fallback_key: Option<String>,
  state: Arc<Mutex<LifecycleState>>,
}

impl<S: CacheStorage, N: Network> CacheManager<S, N> {
  pub fn new(storage: Arc<S>, network: Arc<N>, namespace: impl Into<String>) -> Self {
    Self {
      storage,
      network,
      namespace: namespace.into(),
      fallback_key: None,
      state: Arc::new(Mutex::new(LifecycleState::Uninstalled)),
    }
  }

  /// Set the resource served to navigations that miss both network and cache.
  pub fn with_fallback(mut self, url: impl Into<String>) -> Self {
    self.fallback_key = Some(Request::get(url).cache_key());
    self
  }

  /// Name of the current namespace.
  pub fn namespace(&self) -> &str {
    &self.namespace
  }

  pub fn state(&self) -> LifecycleState {
    self
      .state
      .lock()
      .map(|s| *s)
      .unwrap_or(LifecycleState::Uninstalled)
  }

  fn set_state(&self, state: LifecycleState) -> Result<()> {
    let mut current = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    *current = state;
    Ok(())
  }

  /// Fetch every critical resource and populate the current namespace.
  ///
  /// All resources are fetched before anything is written. Any failed fetch or
  /// non-2xx status aborts the install and leaves storage untouched.
  pub async fn install(&self, manifest: &[String]) -> Result<InstallReport> {
    info!(
      namespace = %self.namespace,
      resources = manifest.len(),
      "Installing cache namespace"
    );

    let requests: Vec<Request> = manifest.iter().map(Request::get).collect();
    let results = join_all(requests.iter().map(|r| self.network.fetch(r))).await;

    let mut entries = Vec::with_capacity(requests.len());
    for (request, result) in requests.iter().zip(results) {
      let response = result
        .map_err(|e| eyre!("Failed to fetch critical resource {}: {}", request.url, e))?;

      if !response.is_success() {
        return Err(eyre!(
          "Critical resource {} returned status {}",
          request.url,
          response.status
        ));
      }

      entries.push((request.cache_key(), response));
    }

    self.storage.put_entries(&self.namespace, &entries)?;
    self.storage.open_namespace(&self.namespace)?;
    self.set_state(LifecycleState::Installed)?;

    info!(namespace = %self.namespace, entries = entries.len(), "Cache namespace installed");

    Ok(InstallReport {
      namespace: self.namespace.clone(),
      entries: entries.len(),
    })
  }

  /// Delete every namespace other than the current one.
  ///
  /// Returns the names that were deleted. Running it again is a no-op.
  pub fn activate(&self) -> Result<Vec<String>> {
    if self.state() == LifecycleState::Uninstalled {
      return Err(eyre!(
        "Cannot activate cache namespace {} before it is installed",
        self.namespace
      ));
    }

    let mut deleted = Vec::new();
    for name in self.storage.namespaces()? {
      if name != self.namespace && self.storage.delete_namespace(&name)? {
        info!(namespace = %name, "Deleted stale cache namespace");
        deleted.push(name);
      }
    }

    self.set_state(LifecycleState::Active)?;

    Ok(deleted)
  }

  /// Serve an intercepted request.
  pub async fn handle(&self, request: Request) -> Result<CacheResult<Response>> {
    if !request.is_cacheable() {
      debug!(method = %request.method, url = %request.url, "Bypassing cache for non-GET request");
      let response = self.network.fetch(&request).await?;
      return Ok(CacheResult::from_network(response));
    }

    match request.mode {
      RequestMode::Navigate => self.network_first(request).await,
      RequestMode::SubResource => self.cache_first(request).await,
    }
  }

  /// Request keys stored in the current namespace.
  pub fn keys(&self) -> Result<Vec<String>> {
    self.storage.keys(&self.namespace)
  }

  /// All namespaces currently in storage.
  pub fn namespaces(&self) -> Result<Vec<String>> {
    self.storage.namespaces()
  }

  /// Network-first: prefer a live response, fall back to cache on failure.
  async fn network_first(&self, request: Request) -> Result<CacheResult<Response>> {
    let key = request.cache_key();

    match self.network.fetch(&request).await {
      Ok(response) if !response.is_server_error() => {
        if response.status == 200 {
          self.store(&key, &response);
        }
        Ok(CacheResult::from_network(response))
      }
      Ok(response) => {
        warn!(url = %request.url, status = response.status, "Navigation failed upstream, trying cache");
        Ok(
          self
            .offline_response(&key)
            .unwrap_or_else(|| CacheResult::from_network(response)),
        )
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "Navigation network error, trying cache");
        self
          .offline_response(&key)
          .ok_or_else(|| eyre!("Network unavailable and {} is not cached: {}", request.url, e))
      }
    }
  }

  /// Cache-first: serve a stored entry immediately and refresh it in the background.
  async fn cache_first(&self, request: Request) -> Result<CacheResult<Response>> {
    let key = request.cache_key();

    if let Some(entry) = self.lookup(&key) {
      self.spawn_refresh(request, key);
      return Ok(CacheResult::from_cache(entry.response, entry.cached_at));
    }

    // No cache, must fetch from network
    let response = self.network.fetch(&request).await?;
    if response.status == 200 {
      self.store(&key, &response);
    }
    Ok(CacheResult::from_network(response))
  }

  fn spawn_refresh(&self, request: Request, key: String) -> JoinHandle<()> {
    let this = self.clone();

    tokio::spawn(async move {
      match this.network.fetch(&request).await {
        Ok(response) if response.status == 200 => this.store(&key, &response),
        Ok(response) => {
          debug!(url = %request.url, status = response.status, "Background refresh not cached")
        }
        Err(e) => debug!(url = %request.url, error = %e, "Background refresh failed"),
      }
    })
  }

  /// Exact-key entry, else the fallback entry.
  fn offline_response(&self, key: &str) -> Option<CacheResult<Response>> {
    if let Some(entry) = self.lookup(key) {
      return Some(CacheResult::from_cache(entry.response, entry.cached_at));
    }

    let fallback = self.fallback_key.as_deref()?;
    self
      .lookup(fallback)
      .map(|entry| CacheResult::fallback(entry.response, entry.cached_at))
  }

  /// Read from the current namespace. Storage errors count as a miss.
  fn lookup(&self, key: &str) -> Option<CachedEntry> {
    match self.storage.get_entry(&self.namespace, key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(key, error = %e, "Cache read failed, treating as miss");
        None
      }
    }
  }

  /// Write to the current namespace. Failures are logged, never returned.
  fn store(&self, key: &str, response: &Response) {
    if let Err(e) = self.storage.put_entry(&self.namespace, key, response) {
      warn!(key, error = %e, "Cache write failed, response still served");
    }
  }
}

impl<S: CacheStorage, N: Network> Clone for CacheManager<S, N> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      network: Arc::clone(&self.network),
      namespace: self.namespace.clone(),
      fallback_key: self.fallback_key.clone(),
      state: Arc::clone(&self.state),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::SqliteStorage;
  use crate::cache::traits::{CacheSource, CachedEntry};
  use crate::db::Database;
  use reqwest::Method;
  use std::collections::HashMap;
  use std::future::Future;
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::time::Duration;

  /// In-memory network: a URL → response table plus an offline switch.
  #[derive(Default)]
  struct MockNetwork {
    responses: Mutex<HashMap<String, Response>>,
    offline: AtomicBool,
    calls: Mutex<Vec<String>>,
  }

  impl MockNetwork {
    fn serve(&self, url: &str, status: u16, body: &str) {
      self
        .responses
        .lock()
        .unwrap()
        .insert(url.to_string(), Response::new(status, body));
    }

    fn set_offline(&self, offline: bool) {
      self.offline.store(offline, Ordering::SeqCst);
    }

    fn calls(&self) -> usize {
      self.calls.lock().unwrap().len()
    }
  }

  impl Network for MockNetwork {
    fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send {
      self.calls.lock().unwrap().push(request.url.clone());

      let result = if self.offline.load(Ordering::SeqCst) {
        Err(eyre!("timed out"))
      } else {
        Ok(
          self
            .responses
            .lock()
            .unwrap()
            .get(&request.url)
            .cloned()
            .unwrap_or_else(|| Response::new(404, "not found")),
        )
      };

      async move { result }
    }
  }

  /// Storage whose writes always fail, as if the quota were exhausted.
  struct FullStorage(SqliteStorage);

  impl CacheStorage for FullStorage {
    fn open_namespace(&self, namespace: &str) -> Result<()> {
      self.0.open_namespace(namespace)
    }
    fn namespaces(&self) -> Result<Vec<String>> {
      self.0.namespaces()
    }
    fn delete_namespace(&self, namespace: &str) -> Result<bool> {
      self.0.delete_namespace(namespace)
    }
    fn get_entry(&self, namespace: &str, key: &str) -> Result<Option<CachedEntry>> {
      self.0.get_entry(namespace, key)
    }
    fn put_entry(&self, _namespace: &str, _key: &str, _response: &Response) -> Result<()> {
      Err(eyre!("quota exceeded"))
    }
    fn put_entries(&self, _namespace: &str, _entries: &[(String, Response)]) -> Result<()> {
      Err(eyre!("quota exceeded"))
    }
    fn keys(&self, namespace: &str) -> Result<Vec<String>> {
      self.0.keys(namespace)
    }
  }

  const ORIGIN: &str = "https://assist.example.org";

  fn url(path: &str) -> String {
    format!("{}{}", ORIGIN, path)
  }

  fn setup(namespace: &str) -> (Arc<SqliteStorage>, Arc<MockNetwork>, CacheManager<SqliteStorage, MockNetwork>) {
    let storage = Arc::new(SqliteStorage::new(Arc::new(
      Database::open_in_memory().unwrap(),
    )));
    let network = Arc::new(MockNetwork::default());
    let manager = CacheManager::new(storage.clone(), network.clone(), namespace)
      .with_fallback(url("/"));
    (storage, network, manager)
  }

  #[test]
  fn test_namespace_name_changes_with_manifest() {
    let v1 = namespace_name("civic", "v1", &["/".to_string()]);
    let v1_again = namespace_name("civic", "v1", &["/".to_string()]);
    let v1_more = namespace_name("civic", "v1", &["/".to_string(), "/new".to_string()]);

    assert_eq!(v1, v1_again);
    assert_ne!(v1, v1_more);
    assert!(v1.starts_with("civic-v1-"));
  }

  #[tokio::test]
  async fn test_install_populates_namespace() {
    let (_, network, manager) = setup("ns-v1");
    network.serve(&url("/"), 200, "<html>");
    network.serve(&url("/manifest"), 200, "{}");

    let report = manager
      .install(&[url("/"), url("/manifest")])
      .await
      .unwrap();

    assert_eq!(report.entries, 2);
    assert_eq!(manager.keys().unwrap().len(), 2);
    assert_eq!(manager.state(), LifecycleState::Installed);
  }

  #[tokio::test]
  async fn test_install_fails_on_missing_critical_resource() {
    let (storage, network, manager) = setup("ns-v1");
    network.serve(&url("/"), 200, "<html>");

    let err = manager
      .install(&[url("/"), url("/missing")])
      .await
      .unwrap_err();

    assert!(err.to_string().contains("/missing"));
    assert!(storage.namespaces().unwrap().is_empty());
    assert_eq!(manager.state(), LifecycleState::Uninstalled);
  }

  #[tokio::test]
  async fn test_install_fails_when_offline() {
    let (storage, network, manager) = setup("ns-v1");
    network.serve(&url("/"), 200, "<html>");
    network.set_offline(true);

    assert!(manager.install(&[url("/")]).await.is_err());
    assert!(storage.namespaces().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_activate_requires_install() {
    let (_, _, manager) = setup("ns-v1");
    assert!(manager.activate().is_err());
  }

  #[tokio::test]
  async fn test_version_bump_rotates_namespace() {
    let (storage, network, v1) = setup("ns-v1");
    network.serve(&url("/"), 200, "<html>");
    network.serve(&url("/manifest"), 200, "{}");
    network.serve(&url("/new"), 200, "new");

    v1.install(&[url("/"), url("/manifest")]).await.unwrap();
    v1.activate().unwrap();

    let v2 = CacheManager::new(storage.clone(), network.clone(), "ns-v2");
    v2.install(&[url("/"), url("/manifest"), url("/new")])
      .await
      .unwrap();
    let deleted = v2.activate().unwrap();

    assert_eq!(deleted, vec!["ns-v1".to_string()]);
    assert_eq!(storage.namespaces().unwrap(), vec!["ns-v2".to_string()]);
    assert_eq!(v2.keys().unwrap().len(), 3);
    assert!(storage.keys("ns-v1").unwrap().is_empty());

    // Second activation has nothing left to delete
    assert!(v2.activate().unwrap().is_empty());
    assert_eq!(v2.state(), LifecycleState::Active);
  }

  #[tokio::test]
  async fn test_navigation_prefers_network() {
    let (_, network, manager) = setup("ns");
    network.serve(&url("/page"), 200, "fresh");

    let result = manager.handle(Request::navigate(url("/page"))).await.unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.body, b"fresh".to_vec());
    assert_eq!(manager.keys().unwrap(), vec![url("/page")]);
  }

  #[tokio::test]
  async fn test_navigation_falls_back_to_exact_entry() {
    let (_, network, manager) = setup("ns");
    network.serve(&url("/page"), 200, "cached");
    manager.handle(Request::navigate(url("/page"))).await.unwrap();

    network.set_offline(true);
    let result = manager.handle(Request::navigate(url("/page"))).await.unwrap();

    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.data.body, b"cached".to_vec());
  }

  #[tokio::test]
  async fn test_navigation_falls_back_to_root() {
    let (_, network, manager) = setup("ns");
    network.serve(&url("/"), 200, "root");
    manager.install(&[url("/")]).await.unwrap();

    network.set_offline(true);
    let result = manager
      .handle(Request::navigate(url("/never-seen")))
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Fallback);
    assert_eq!(result.data.body, b"root".to_vec());
  }

  #[tokio::test]
  async fn test_navigation_server_error_uses_cache() {
    let (_, network, manager) = setup("ns");
    network.serve(&url("/page"), 200, "good");
    manager.handle(Request::navigate(url("/page"))).await.unwrap();

    network.serve(&url("/page"), 503, "down");
    let result = manager.handle(Request::navigate(url("/page"))).await.unwrap();

    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.data.body, b"good".to_vec());
  }

  #[tokio::test]
  async fn test_navigation_server_error_without_cache_is_returned() {
    let (_, network, manager) = setup("ns");
    network.serve(&url("/page"), 502, "bad gateway");

    let result = manager.handle(Request::navigate(url("/page"))).await.unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.status, 502);
    assert!(manager.keys().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_navigation_offline_without_cache_errors() {
    let (_, network, manager) = setup("ns");
    network.set_offline(true);

    assert!(manager.handle(Request::navigate(url("/page"))).await.is_err());
  }

  #[tokio::test]
  async fn test_subresource_cached_on_miss() {
    let (_, network, manager) = setup("ns");
    network.serve(&url("/app.js"), 200, "v1");

    let first = manager.handle(Request::get(url("/app.js"))).await.unwrap();
    assert_eq!(first.source, CacheSource::Network);

    network.set_offline(true);
    let second = manager.handle(Request::get(url("/app.js"))).await.unwrap();
    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(second.data.body, b"v1".to_vec());
  }

  #[tokio::test]
  async fn test_subresource_served_from_cache_when_network_times_out() {
    let (storage, network, manager) = setup("ns");
    storage
      .put_entry("ns", &url("/k"), &Response::new(200, "stored"))
      .unwrap();
    network.set_offline(true);

    let result = manager.handle(Request::get(url("/k"))).await.unwrap();

    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.data.body, b"stored".to_vec());
  }

  #[tokio::test]
  async fn test_subresource_background_refresh_overwrites() {
    let (storage, network, manager) = setup("ns");
    storage
      .put_entry("ns", &url("/data"), &Response::new(200, "old"))
      .unwrap();
    network.serve(&url("/data"), 200, "new");

    let result = manager.handle(Request::get(url("/data"))).await.unwrap();
    assert_eq!(result.data.body, b"old".to_vec());

    // Let the refresh task run
    tokio::time::sleep(Duration::from_millis(10)).await;

    let entry = storage.get_entry("ns", &url("/data")).unwrap().unwrap();
    assert_eq!(entry.response.body, b"new".to_vec());
    assert_eq!(network.calls(), 1);
  }

  #[tokio::test]
  async fn test_background_refresh_ignores_non_200() {
    let (storage, network, manager) = setup("ns");
    storage
      .put_entry("ns", &url("/data"), &Response::new(200, "old"))
      .unwrap();
    network.serve(&url("/data"), 500, "oops");

    manager.handle(Request::get(url("/data"))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let entry = storage.get_entry("ns", &url("/data")).unwrap().unwrap();
    assert_eq!(entry.response.body, b"old".to_vec());
  }

  #[tokio::test]
  async fn test_mutations_are_never_cached() {
    let (_, network, manager) = setup("ns");
    for status in [200, 201, 400, 500] {
      network.serve(&url("/api/applications"), status, "ok");
      let request = Request::get(url("/api/applications"))
        .with_method(Method::POST)
        .with_body(b"{}".to_vec());

      let result = manager.handle(request).await.unwrap();
      assert_eq!(result.source, CacheSource::Network);
    }

    assert!(manager.keys().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_head_does_not_shadow_get() {
    let (_, network, manager) = setup("ns");
    network.serve(&url("/app.js"), 200, "console.log(1)");

    // A real HEAD answer has no body
    network.serve(&url("/app.js"), 200, "");
    let head = manager
      .handle(Request::get(url("/app.js")).with_method(Method::HEAD))
      .await
      .unwrap();
    assert_eq!(head.source, CacheSource::Network);
    assert!(manager.keys().unwrap().is_empty());

    manager
      .handle(Request::navigate(url("/app.js")).with_method(Method::HEAD))
      .await
      .unwrap();
    assert!(manager.keys().unwrap().is_empty());

    network.serve(&url("/app.js"), 200, "console.log(1)");
    let get = manager.handle(Request::get(url("/app.js"))).await.unwrap();
    assert_eq!(get.source, CacheSource::Network);
    assert_eq!(get.data.body.len(), 14);

    network.set_offline(true);
    let cached = manager.handle(Request::get(url("/app.js"))).await.unwrap();
    assert_eq!(cached.source, CacheSource::Cache);
    assert_eq!(cached.data.body, b"console.log(1)".to_vec());
  }

  #[tokio::test]
  async fn test_cache_write_failure_does_not_fail_response() {
    let storage = Arc::new(FullStorage(SqliteStorage::new(Arc::new(
      Database::open_in_memory().unwrap(),
    ))));
    let network = Arc::new(MockNetwork::default());
    network.serve(&url("/app.css"), 200, "body{}");
    let manager = CacheManager::new(storage, network, "ns");

    let result = manager.handle(Request::get(url("/app.css"))).await.unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.body, b"body{}".to_vec());
  }

  #[tokio::test]
  async fn test_install_write_failure_is_fatal() {
    let storage = Arc::new(FullStorage(SqliteStorage::new(Arc::new(
      Database::open_in_memory().unwrap(),
    ))));
    let network = Arc::new(MockNetwork::default());
    network.serve(&url("/"), 200, "root");
    let manager = CacheManager::new(storage, network, "ns");

    assert!(manager.install(&[url("/")]).await.is_err());
    assert_eq!(manager.state(), LifecycleState::Uninstalled);
    assert!(manager.namespaces().unwrap().is_empty());
  }
}
