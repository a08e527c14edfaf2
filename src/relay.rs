use std::time::Duration;

use tokio_stream::Stream;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::dialect::request_headers;
use crate::error::GatewayError;
use crate::stream::{fragments, StreamItem};

/// Fixed prompt used to check that a backend answers.
pub const CONNECTION_TEST_PROMPT: &str = "Hello";

/// Outbound side of the gateway. Cloning shares the connection pool.
#[derive(Clone, Default)]
pub struct Relay {
  client: reqwest::Client,
}

impl Relay {
  pub fn new(client: reqwest::Client) -> Self {
    Self { client }
  }

  pub async fn send(
    &self,
    prompt: &str,
    settings: &Settings,
    timeout: Duration,
  ) -> Result<String, GatewayError> {
    let request = self.request(prompt, settings, false)?.timeout(timeout);
    debug!(
      endpoint = %settings.api_endpoint,
      format = %settings.api_format,
      model = %settings.model_name,
      "sending completion request"
    );

    let resp = ensure_success(request.send().await?).await?;
    let body = resp.json::<serde_json::Value>().await?;
    Ok(settings.api_format.decode(&body))
  }

  pub async fn test_connection(&self, settings: &Settings, timeout: Duration) -> Result<(), GatewayError> {
    self.send(CONNECTION_TEST_PROMPT, settings, timeout).await.map(|_| ())
  }

  /// Opens a streaming completion. Errors before the first byte are returned
  /// here; later faults surface as `StreamItem::Failed` in the stream.
  pub async fn open_stream(
    &self,
    prompt: &str,
    settings: &Settings,
    timeout: Duration,
  ) -> Result<impl Stream<Item = StreamItem>, GatewayError> {
    if !settings.api_format.supports_streaming() {
      return Err(GatewayError::StreamingUnsupported(settings.api_format));
    }
    let request = self.request(prompt, settings, true)?;
    debug!(
      endpoint = %settings.api_endpoint,
      model = %settings.model_name,
      "opening completion stream"
    );

    let resp = tokio::time::timeout(timeout, request.send()).await??;
    let resp = ensure_success(resp).await?;
    Ok(fragments(resp.bytes_stream(), timeout))
  }

  fn request(
    &self,
    prompt: &str,
    settings: &Settings,
    stream: bool,
  ) -> Result<reqwest::RequestBuilder, GatewayError> {
    settings.validate()?;
    let headers = request_headers(settings)?;
    let body = settings.api_format.encode(prompt, settings, stream);
    Ok(self.client.post(&settings.api_endpoint).headers(headers).json(&body))
  }
}

async fn ensure_success(resp: reqwest::Response) -> Result<reqwest::Response, GatewayError> {
  if resp.status().is_success() {
    return Ok(resp);
  }
  let status = resp.status().as_u16();
  let body = resp.text().await.unwrap_or_default();
  warn!(status, "backend rejected request");
  Err(GatewayError::UpstreamStatus { status, body })
}
