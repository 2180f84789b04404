//! Resource fetch contract and its HTTP implementation.

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::time::Duration;
use url::Url;

use crate::config::{ApiConfig, Config};
use crate::error::FetchError;

/// One outbound call: a `GET` of `path`, or a `POST` of `body` to `path`.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRequest {
  pub path: String,
  pub body: Option<Value>,
}

impl ResourceRequest {
  pub fn get(path: impl Into<String>) -> Self {
    Self {
      path: path.into(),
      body: None,
    }
  }

  pub fn post(path: impl Into<String>, body: Value) -> Self {
    Self {
      path: path.into(),
      body: Some(body),
    }
  }

  /// Cache key for this request: the path for a `GET`, or a sub-key derived
  /// from the path and a digest of the body for a `POST`.
  pub fn cache_key(&self) -> String {
    match &self.body {
      None => self.path.clone(),
      Some(body) => {
        let mut hasher = Sha256::new();
        hasher.update(body.to_string().as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("{}#{}", self.path, &digest[..16])
      }
    }
  }
}

/// Something that can perform a resource call.
///
/// Implementations report failures as [`FetchError`]; classification into
/// retryable, fallback and hard faults happens in the scheduler.
pub trait ResourceFetcher: Send + Sync + 'static {
  fn fetch(
    &self,
    request: &ResourceRequest,
    timeout: Duration,
  ) -> impl Future<Output = Result<Value, FetchError>> + Send;
}

/// HTTP fetcher resolving resource paths against a base URL.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
  base_url: Url,
  token: Option<String>,
}

impl HttpFetcher {
  pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
    let mut base_url =
      Url::parse(base_url).map_err(|e| eyre!("Invalid API base URL {}: {}", base_url, e))?;
    // Resource paths resolve under the base path, so it must end in a slash
    if !base_url.path().ends_with('/') {
      let path = format!("{}/", base_url.path());
      base_url.set_path(&path);
    }
    let client = reqwest::Client::builder()
      .gzip(true)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      token,
    })
  }

  pub fn from_config(api: &ApiConfig) -> Result<Self> {
    let base_url = api
      .base_url
      .as_deref()
      .ok_or_else(|| eyre!("No API base URL configured. Set api.base_url or pass --base-url."))?;
    Self::new(base_url, Config::get_api_token())
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  /// Resolve a resource path under the base URL, keeping any base path
  /// prefix: `/api/x` against `http://host/dash/` is `http://host/dash/api/x`.
  pub fn resolve(&self, path: &str) -> Result<Url, FetchError> {
    self
      .base_url
      .join(path.trim_start_matches('/'))
      .map_err(|e| FetchError::InvalidRequest(format!("{}: {}", path, e)))
  }
}

impl ResourceFetcher for HttpFetcher {
  async fn fetch(&self, request: &ResourceRequest, timeout: Duration) -> Result<Value, FetchError> {
    let url = self.resolve(&request.path)?;

    let builder = match &request.body {
      None => self.client.get(url),
      Some(body) => self.client.post(url).json(body),
    };
    let builder = match &self.token {
      Some(token) => builder.bearer_auth(token),
      None => builder,
    };

    let response = builder.timeout(timeout).send().await.map_err(|e| {
      if e.is_timeout() {
        FetchError::Timeout
      } else {
        FetchError::Transport(e.to_string())
      }
    })?;

    let status = response.status();
    if !status.is_success() {
      return Err(FetchError::Status(status.as_u16()));
    }

    let bytes = response.bytes().await.map_err(|e| {
      if e.is_timeout() {
        FetchError::Timeout
      } else {
        FetchError::Transport(e.to_string())
      }
    })?;

    serde_json::from_slice(&bytes).map_err(|e| FetchError::Malformed(e.to_string()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;

  /// Serve a single canned HTTP response and return the base URL.
  async fn serve_once(status: &'static str, body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let mut buf = vec![0u8; 8192];
      let _ = socket.read(&mut buf).await;
      let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
      );
      let _ = socket.write_all(response.as_bytes()).await;
      let _ = socket.shutdown().await;
    });
    format!("http://{}/", addr)
  }

  #[test]
  fn test_cache_key_for_get_is_path() {
    assert_eq!(ResourceRequest::get("/api/summary").cache_key(), "/api/summary");
  }

  #[test]
  fn test_cache_key_for_post_depends_on_body() {
    let a = ResourceRequest::post("/api/filtered", json!({"filters": []}));
    let b = ResourceRequest::post("/api/filtered", json!({"filters": [{"field": "x"}]}));
    assert!(a.cache_key().starts_with("/api/filtered#"));
    assert_ne!(a.cache_key(), b.cache_key());
    assert_eq!(a.cache_key(), a.clone().cache_key());
  }

  #[tokio::test]
  async fn test_fetch_success() {
    let base = serve_once("200 OK", r#"{"total": 3}"#).await;
    let fetcher = HttpFetcher::new(&base, None).unwrap();
    let value = fetcher
      .fetch(&ResourceRequest::get("/api/summary"), Duration::from_secs(5))
      .await
      .unwrap();
    assert_eq!(value, json!({"total": 3}));
  }

  #[tokio::test]
  async fn test_fetch_maps_status() {
    let base = serve_once("503 Service Unavailable", "{}").await;
    let fetcher = HttpFetcher::new(&base, None).unwrap();
    let err = fetcher
      .fetch(&ResourceRequest::get("/api/summary"), Duration::from_secs(5))
      .await
      .unwrap_err();
    assert!(matches!(err, FetchError::Status(503)));
  }

  #[tokio::test]
  async fn test_fetch_malformed_body() {
    let base = serve_once("200 OK", "{not json").await;
    let fetcher = HttpFetcher::new(&base, None).unwrap();
    let err = fetcher
      .fetch(&ResourceRequest::get("/api/summary"), Duration::from_secs(5))
      .await
      .unwrap_err();
    assert!(matches!(err, FetchError::Malformed(_)));
  }

  #[test]
  fn test_resolve_keeps_base_path() {
    let fetcher = HttpFetcher::new("http://host/dash", None).unwrap();
    assert_eq!(fetcher.base_url().as_str(), "http://host/dash/");
    assert_eq!(
      fetcher.resolve("/api/x").unwrap().as_str(),
      "http://host/dash/api/x"
    );
    assert_eq!(fetcher.resolve("api/x").unwrap().as_str(), "http://host/dash/api/x");

    let origin = HttpFetcher::new("http://host", None).unwrap();
    assert_eq!(origin.resolve("/api/x").unwrap().as_str(), "http://host/api/x");
  }

  #[test]
  fn test_invalid_base_url() {
    assert!(HttpFetcher::new("not a url", None).is_err());
  }
}
