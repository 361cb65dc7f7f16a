//! Core traits and types for the response cache.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::future::Future;

/// How a request was issued by the client runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
  /// Top-level page load
  Navigate,
  /// Anything a page loads on its own (scripts, API reads, images)
  SubResource,
}

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  /// Absolute URL
  pub url: String,
  pub mode: RequestMode,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn get(url: impl Into<String>) -> Self {
    Self {
      method: Method::GET,
      url: url.into(),
      mode: RequestMode::SubResource,
      body: None,
    }
  }

  pub fn navigate(url: impl Into<String>) -> Self {
    Self {
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  pub fn with_body(mut self, body: Vec<u8>) -> Self {
    self.body = Some(body);
    self
  }

  /// Only GETs go through the cache. A HEAD response has no body and would
  /// shadow the GET stored under the same key.
  pub fn is_cacheable(&self) -> bool {
    self.method == Method::GET
  }

  /// Cache key for this request: the URL with any fragment removed.
  pub fn cache_key(&self) -> String {
    match url::Url::parse(&self.url) {
      Ok(mut parsed) => {
        parsed.set_fragment(None);
        parsed.to_string()
      }
      Err(_) => self
        .url
        .split('#')
        .next()
        .unwrap_or_default()
        .to_string(),
    }
  }
}

/// A response as seen by the requester and as stored in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn is_server_error(&self) -> bool {
    self.status >= 500
  }
}

/// The network as seen by the cache manager.
///
/// Errors mean the request never produced a response (offline, DNS, timeout).
/// HTTP error statuses come back as `Ok` responses.
pub trait Network: Send + Sync + 'static {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send;
}

/// A stored response together with when it was written.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub response: Response,
  pub cached_at: DateTime<Utc>,
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from the entry stored under the request's own key.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result served from the designated fallback entry.
  pub fn fallback(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Fallback,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Exact-key entry from the current namespace
  Cache,
  /// Network unavailable and no exact entry; served the fallback resource
  Fallback,
}
