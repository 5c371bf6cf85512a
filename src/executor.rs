//! The collaborator that actually applies a queued mutation remotely.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use crate::queue::QueuedWrite;

/// Performs a named remote mutation.
///
/// Calls must fail (return `Err`) when the mutation was not applied, and must
/// tolerate being repeated: a drain may re-run an action whose earlier attempt
/// committed remotely but whose response was lost.
pub trait Executor: Send + Sync {
  fn execute<'a>(&'a self, action: &'a str, args: &'a [Value]) -> BoxFuture<'a, Result<Value>>;

  /// Execute a queued write. Implementations that can deduplicate on the
  /// remote side override this to pass along `write.id`.
  fn execute_write<'a>(&'a self, write: &'a QueuedWrite) -> BoxFuture<'a, Result<Value>> {
    self.execute(&write.action, &write.args)
  }
}

/// Executor that POSTs `{"args": [...]}` to `{endpoint}/{action}`.
#[derive(Clone)]
pub struct HttpExecutor {
  client: reqwest::Client,
  endpoint: Url,
  token: Option<String>,
}

impl HttpExecutor {
  pub fn new(endpoint: Url, token: Option<String>) -> Result<Self> {
    let client = reqwest::Client::builder()
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;
    Ok(Self::with_client(client, endpoint, token))
  }

  pub fn with_client(client: reqwest::Client, endpoint: Url, token: Option<String>) -> Self {
    Self {
      client,
      endpoint,
      token,
    }
  }

  fn action_url(&self, action: &str) -> Result<Url> {
    let mut url = self.endpoint.clone();
    url
      .path_segments_mut()
      .map_err(|_| eyre!("Executor endpoint {} cannot take a path", self.endpoint))?
      .pop_if_empty()
      .push(action);
    Ok(url)
  }

  async fn post(&self, action: &str, args: &[Value], idempotency_key: Option<&str>) -> Result<Value> {
    let url = self.action_url(action)?;

    let mut request = self.client.post(url).json(&json!({ "args": args }));
    if let Some(key) = idempotency_key {
      request = request.header("Idempotency-Key", key);
    }
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }

    let response = request
      .send()
      .await
      .map_err(|e| eyre!("Failed to send {}: {}", action, e))?;

    let status = response.status();
    if !status.is_success() {
      return Err(eyre!("{} rejected with HTTP {}", action, status));
    }

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read {} response: {}", action, e))?;
    debug!(action, bytes = body.len(), "Remote mutation applied");

    if body.is_empty() {
      return Ok(Value::Null);
    }
    serde_json::from_slice(&body).map_err(|e| eyre!("Failed to parse {} response: {}", action, e))
  }
}

impl Executor for HttpExecutor {
  fn execute<'a>(&'a self, action: &'a str, args: &'a [Value]) -> BoxFuture<'a, Result<Value>> {
    Box::pin(self.post(action, args, None))
  }

  fn execute_write<'a>(&'a self, write: &'a QueuedWrite) -> BoxFuture<'a, Result<Value>> {
    Box::pin(self.post(&write.action, &write.args, Some(&write.id)))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;
  use tokio::sync::oneshot;

  /// Accept one request, hand its raw text back, answer with `response`.
  async fn serve_once(response: &'static [u8]) -> (Url, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let mut raw = Vec::new();
      let mut buf = [0u8; 4096];
      loop {
        let n = socket.read(&mut buf).await.unwrap();
        if n == 0 {
          break;
        }
        raw.extend_from_slice(&buf[..n]);
        if request_complete(&raw) {
          break;
        }
      }
      let _ = tx.send(String::from_utf8_lossy(&raw).into_owned());
      let _ = socket.write_all(response).await;
    });

    (Url::parse(&format!("http://{}/api/", addr)).unwrap(), rx)
  }

  fn request_complete(raw: &[u8]) -> bool {
    let text = String::from_utf8_lossy(raw);
    let Some(header_end) = text.find("\r\n\r\n") else {
      return false;
    };
    let content_length = text[..header_end]
      .lines()
      .find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name
          .eq_ignore_ascii_case("content-length")
          .then(|| value.trim().parse::<usize>().ok())
          .flatten()
      })
      .unwrap_or(0);
    raw.len() >= header_end + 4 + content_length
  }

  fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
  }

  #[tokio::test]
  async fn test_posts_args_with_idempotency_key() {
    let (url, request) = serve_once(
      b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 11\r\nconnection: close\r\n\r\n{\"ok\":true}",
    )
    .await;
    let executor = HttpExecutor::with_client(client(), url, Some("secret".to_string()));
    let write = QueuedWrite::new("saveChain", vec![json!("warm-vox"), json!({"gain": 3})]);

    let result = executor.execute_write(&write).await.unwrap();
    assert_eq!(result, json!({"ok": true}));

    let raw = request.await.unwrap();
    let lower = raw.to_lowercase();
    assert!(raw.starts_with("POST /api/saveChain HTTP/1.1"));
    assert!(lower.contains(&format!("idempotency-key: {}", write.id)));
    assert!(lower.contains("authorization: bearer secret"));
    assert!(raw.contains(r#"{"args":["warm-vox",{"gain":3}]}"#));
  }

  #[tokio::test]
  async fn test_non_success_status_is_error() {
    let (url, _request) =
      serve_once(b"HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
        .await;
    let executor = HttpExecutor::with_client(client(), url, None);

    let err = executor.execute("deleteChain", &[json!(1)]).await.unwrap_err();
    assert!(err.to_string().contains("500"));
  }

  #[tokio::test]
  async fn test_empty_body_is_null() {
    let (url, _request) =
      serve_once(b"HTTP/1.1 204 No Content\r\nconnection: close\r\n\r\n").await;
    let executor = HttpExecutor::with_client(client(), url, None);

    let result = executor.execute("ping", &[]).await.unwrap();
    assert_eq!(result, Value::Null);
  }

  #[test]
  fn test_action_url_appends_segment() {
    let executor = HttpExecutor::with_client(
      client(),
      Url::parse("https://api.example.com/v1").unwrap(),
      None,
    );
    assert_eq!(
      executor.action_url("rate chain").unwrap().as_str(),
      "https://api.example.com/v1/rate%20chain"
    );
  }
}
