use axum::http::StatusCode;

use crate::dialect::ApiFormat;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
  #[error("{0}")]
  Validation(String),
  #[error("could not connect to backend: {0}")]
  Connection(String),
  #[error("backend request timed out")]
  Timeout,
  #[error("backend returned {status}: {body}")]
  UpstreamStatus { status: u16, body: String },
  #[error("streaming is not supported for the {0} api format")]
  StreamingUnsupported(ApiFormat),
  #[error("invalid settings: {0}")]
  InvalidSettings(String),
  #[error("invalid backend response: {0}")]
  InvalidResponse(String),
  #[error("{0}")]
  Other(String),
}

impl GatewayError {
  pub fn status_code(&self) -> StatusCode {
    match self {
      GatewayError::Validation(_) | GatewayError::StreamingUnsupported(_) => StatusCode::BAD_REQUEST,
      GatewayError::Connection(_) => StatusCode::SERVICE_UNAVAILABLE,
      GatewayError::Timeout => StatusCode::GATEWAY_TIMEOUT,
      _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }
}

impl From<reqwest::Error> for GatewayError {
  fn from(err: reqwest::Error) -> Self {
    // a connect that times out reports both flags; the timeout wins
    if err.is_timeout() {
      GatewayError::Timeout
    } else if err.is_connect() {
      GatewayError::Connection(err.to_string())
    } else if let Some(status) = err.status() {
      GatewayError::UpstreamStatus {
        status: status.as_u16(),
        body: String::new(),
      }
    } else if err.is_decode() {
      GatewayError::InvalidResponse(err.to_string())
    } else {
      GatewayError::Other(err.to_string())
    }
  }
}

impl From<tokio::time::error::Elapsed> for GatewayError {
  fn from(_: tokio::time::error::Elapsed) -> Self {
    GatewayError::Timeout
  }
}
