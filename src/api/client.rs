use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use tracing::debug;

use crate::cache::{Network, Request, Response};
use crate::config::Config;
use crate::sync::Reachability;

/// reqwest-backed network used by the cache manager
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new(config: &Config) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(config.network.timeout())
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }

  /// Probe that reports the backend reachable when `url` answers without a 5xx
  pub fn probe(&self, url: impl Into<String>) -> HttpProbe {
    HttpProbe {
      client: self.client.clone(),
      url: url.into(),
    }
  }

  async fn execute(&self, request: &Request) -> Result<Response> {
    let mut builder = self.client.request(request.method.clone(), &request.url);
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", request.url, e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.to_string(), v.to_string()))
      })
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response from {}: {}", request.url, e))?
      .to_vec();

    debug!(method = %request.method, url = %request.url, status, "Fetched");

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}

impl Network for HttpNetwork {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send {
    self.execute(request)
  }
}

/// Reachability check against a single URL
pub struct HttpProbe {
  client: reqwest::Client,
  url: String,
}

impl Reachability for HttpProbe {
  fn check(&self) -> impl Future<Output = bool> + Send {
    async move {
      match self.client.get(&self.url).send().await {
        Ok(response) => !response.status().is_server_error(),
        Err(e) => {
          debug!(url = %self.url, error = %e, "Probe failed");
          false
        }
      }
    }
  }
}
