use color_eyre::{eyre::eyre, Result};
use reqwest::header::CONTENT_TYPE;
use std::future::Future;
use tracing::debug;

use crate::config::Config;
use crate::queue::{ActionPayload, QueuedAction};
use crate::sync::ActionHandler;

/// Backend path that accepts each action type
fn endpoint_for(payload: &ActionPayload) -> Result<&'static str> {
  match payload {
    ActionPayload::Apply(_) => Ok("/api/applications"),
    ActionPayload::Upload(_) => Ok("/api/documents"),
    ActionPayload::Other { kind, .. } => {
      Err(eyre!("No backend endpoint for action type '{}'", kind))
    }
  }
}

/// Replays queued actions against the assistant backend.
///
/// The action id goes out as `Idempotency-Key` so the backend can discard a
/// duplicate delivery of the same action.
pub struct BackendHandler {
  client: reqwest::Client,
  config: Config,
  token: Option<String>,
}

impl BackendHandler {
  pub fn new(config: &Config) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(config.network.timeout())
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      config: config.clone(),
      token: Config::get_api_token(),
    })
  }

  async fn submit(&self, action: &QueuedAction) -> Result<()> {
    let url = self.config.resolve(endpoint_for(&action.payload)?)?;
    let body = action
      .payload
      .to_json()
      .map_err(|e| eyre!("Failed to serialize {} payload: {}", action.kind(), e))?;

    let mut request = self
      .client
      .post(&url)
      .header(CONTENT_TYPE, "application/json")
      .header("Idempotency-Key", &action.id)
      .header("X-Action-Type", action.kind())
      .body(body);
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }

    let response = request
      .send()
      .await
      .map_err(|e| eyre!("Failed to submit {}: {}", action.id, e))?;

    let status = response.status();
    if !status.is_success() {
      return Err(eyre!("Backend rejected {} with status {}", action.id, status));
    }

    debug!(id = %action.id, status = status.as_u16(), "Action delivered");
    Ok(())
  }
}

impl ActionHandler for BackendHandler {
  fn handle(&self, action: &QueuedAction) -> impl Future<Output = Result<()>> + Send {
    self.submit(action)
  }
}
