//! Small reqwest helpers shared by the REST providers.

use color_eyre::{eyre::eyre, Result};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;

pub fn client() -> Result<Client> {
  Client::builder()
    .user_agent(concat!("tracksync/", env!("CARGO_PKG_VERSION")))
    .build()
    .map_err(|e| eyre!("Failed to create HTTP client: {}", e))
}

/// Send and decode a JSON response. A 404 is `None`; other failures are errors.
pub async fn fetch_optional<T: DeserializeOwned>(request: RequestBuilder, what: &str) -> Result<Option<T>> {
  let response = request
    .send()
    .await
    .map_err(|e| eyre!("Failed to {}: {}", what, e))?;

  let status = response.status();
  if status == StatusCode::NOT_FOUND {
    return Ok(None);
  }
  if !status.is_success() {
    let body = response.text().await.unwrap_or_default();
    return Err(eyre!("Failed to {}: HTTP {} {}", what, status, body.trim()));
  }

  response
    .json()
    .await
    .map(Some)
    .map_err(|e| eyre!("Failed to parse response to {}: {}", what, e))
}

/// Like `fetch_optional`, but a 404 is an error too.
pub async fn fetch<T: DeserializeOwned>(request: RequestBuilder, what: &str) -> Result<T> {
  fetch_optional(request, what)
    .await?
    .ok_or_else(|| eyre!("Failed to {}: not found", what))
}

/// Percent-encode a path segment or query value (`group/app` becomes `group%2Fapp`).
pub fn encode_component(s: &str) -> String {
  url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

/// API root for a source; `default` when the source leaves its base URL empty.
pub fn api_root(base_url: &str, default: &str) -> String {
  let base = base_url.trim().trim_end_matches('/');
  if base.is_empty() {
    default.to_string()
  } else {
    base.to_string()
  }
}
