use std::convert::Infallible;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Instant;

use async_stream::stream;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::{self, AppConfig, Settings};
use crate::error::GatewayError;
use crate::models::{ChatRequest, ChatResponse, ConnectionStatus, ErrorBody, StreamChunk, TestConnectionRequest};
use crate::prompt::build_prompt;
use crate::relay::Relay;
use crate::stream::StreamItem;

pub struct RouterState {
  pub started_at: Instant,
  pub started_at_utc: DateTime<Utc>,
  pub config: AppConfig,
  pub relay: Relay,
}

impl RouterState {
  pub fn new(config: AppConfig) -> Self {
    Self {
      started_at: Instant::now(),
      started_at_utc: Utc::now(),
      config,
      relay: Relay::new(reqwest::Client::new()),
    }
  }
}

pub fn build_router(state: RouterState) -> Router {
  let static_dir = state.config.static_dir.clone();
  let mut app = Router::new()
    .route("/health", get(health))
    .route("/api/chat", post(chat))
    .route("/api/test-connection", post(test_connection))
    .route("/api/stream", post(stream_chat));

  if let Some(dir) = static_dir {
    app = app.fallback_service(ServeDir::new(dir));
  }

  app
    .layer(TraceLayer::new_for_http())
    .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
    .with_state(Arc::new(state))
}

pub async fn run_router(listener: TcpListener, state: RouterState) -> anyhow::Result<()> {
  listener.set_nonblocking(true)?;
  let listener = tokio::net::TcpListener::from_std(listener)?;
  info!("listening on {}", listener.local_addr()?);

  axum::serve(listener, build_router(state))
    .with_graceful_shutdown(async {
      let _ = tokio::signal::ctrl_c().await;
      info!("shutting down");
    })
    .await?;
  Ok(())
}

async fn health(State(state): State<Arc<RouterState>>) -> Json<serde_json::Value> {
  let uptime = state.started_at.elapsed().as_millis();
  Json(serde_json::json!({
    "status": "ok",
    "version": env!("CARGO_PKG_VERSION"),
    "started_at": state.started_at_utc.to_rfc3339(),
    "uptime_ms": uptime
  }))
}

#[tracing::instrument(skip_all, fields(request_id = %uuid::Uuid::new_v4()))]
async fn chat(State(state): State<Arc<RouterState>>, body: Bytes) -> Response {
  match complete_chat(&state, &body).await {
    Ok(response) => (StatusCode::OK, Json(ChatResponse { response })).into_response(),
    Err(err) => chat_error(err),
  }
}

#[tracing::instrument(skip_all, fields(request_id = %uuid::Uuid::new_v4()))]
async fn test_connection(State(state): State<Arc<RouterState>>, body: Bytes) -> Response {
  match check_backend(&state, &body).await {
    Ok(()) => connection_status(StatusCode::OK, true, "Connection successful!"),
    Err(err) => {
      warn!(error = %err, "connection test failed");
      let message = match &err {
        GatewayError::Connection(_) => "Could not connect to LLM server".to_string(),
        GatewayError::Timeout => "Connection timed out".to_string(),
        other => other.to_string(),
      };
      connection_status(err.status_code(), false, &message)
    }
  }
}

#[tracing::instrument(skip_all, fields(request_id = %uuid::Uuid::new_v4()))]
async fn stream_chat(State(state): State<Arc<RouterState>>, body: Bytes) -> Response {
  let opened = match parse_required(&body).and_then(|req| prepare_chat(req, &state.config.defaults)) {
    Ok((prompt, settings)) => {
      state
        .relay
        .open_stream(&prompt, &settings, state.config.timeouts.stream)
        .await
    }
    Err(err) => Err(err),
  };

  let fragments = match opened {
    Ok(fragments) => fragments,
    Err(err) => return chat_error(err),
  };

  let events = stream! {
    tokio::pin!(fragments);
    while let Some(item) = fragments.next().await {
      let event = match item {
        StreamItem::Fragment(content) => Event::default().json_data(StreamChunk { content }),
        StreamItem::Failed(error) => Event::default().json_data(ErrorBody { error }),
      };
      match event {
        Ok(event) => yield Ok::<_, Infallible>(event),
        Err(err) => warn!(error = %err, "dropping unencodable event"),
      }
    }
    yield Ok(Event::default().data("[DONE]"));
  };

  Sse::new(events)
    .keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(15)))
    .into_response()
}

async fn complete_chat(state: &RouterState, body: &[u8]) -> Result<String, GatewayError> {
  let (prompt, settings) = prepare_chat(parse_required(body)?, &state.config.defaults)?;
  state.relay.send(&prompt, &settings, state.config.timeouts.chat).await
}

async fn check_backend(state: &RouterState, body: &[u8]) -> Result<(), GatewayError> {
  let req: TestConnectionRequest = parse_optional(body)?;
  let settings = config::resolve(req.settings, &state.config.defaults)?;
  state.relay.test_connection(&settings, state.config.timeouts.test).await
}

fn prepare_chat(req: ChatRequest, defaults: &Settings) -> Result<(String, Settings), GatewayError> {
  if req.messages.is_empty() {
    return Err(GatewayError::Validation("No messages provided".to_string()));
  }
  let settings = config::resolve(req.settings, defaults)?;
  let prompt = build_prompt(&req.messages, settings.system_prompt.as_deref());
  Ok((prompt, settings))
}

fn parse_required<T: DeserializeOwned>(body: &[u8]) -> Result<T, GatewayError> {
  if body.iter().all(u8::is_ascii_whitespace) {
    return Err(GatewayError::Validation("No data provided".to_string()));
  }
  serde_json::from_slice(body)
    .map_err(|err| GatewayError::Validation(format!("Invalid request body: {}", err)))
}

fn parse_optional<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, GatewayError> {
  if body.iter().all(u8::is_ascii_whitespace) {
    return Ok(T::default());
  }
  parse_required(body)
}

fn chat_error(err: GatewayError) -> Response {
  let message = match &err {
    GatewayError::Connection(_) => "Could not connect to LLM server. Is it running?".to_string(),
    GatewayError::Timeout => "LLM server request timed out".to_string(),
    other => other.to_string(),
  };
  let status = err.status_code();
  if status.is_server_error() {
    warn!(error = %err, "chat request failed");
  }
  error_response(status, &message)
}

fn error_response(status: StatusCode, message: &str) -> Response {
  let body = Json(ErrorBody {
    error: message.to_string(),
  });
  (status, body).into_response()
}

fn connection_status(status: StatusCode, success: bool, message: &str) -> Response {
  let body = Json(ConnectionStatus {
    success,
    message: message.to_string(),
  });
  (status, body).into_response()
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;
  use crate::config::Timeouts;
  use crate::dialect::ApiFormat;
  use axum::body::Body;
  use axum::http::{header, Request};
  use http_body_util::BodyExt;
  use serde_json::json;
  use tower::ServiceExt;
  use wiremock::matchers::{body_partial_json, method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn state_for(endpoint: String) -> RouterState {
    RouterState::new(AppConfig {
      defaults: Settings {
        api_endpoint: endpoint,
        ..Settings::default()
      },
      timeouts: Timeouts {
        test: Duration::from_millis(300),
        chat: Duration::from_millis(300),
        stream: Duration::from_millis(300),
      },
      static_dir: None,
    })
  }

  fn generate_url(server: &MockServer) -> String {
    format!("{}/api/generate", server.uri())
  }

  fn refused_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{port}/api/generate")
  }

  async fn post(state: RouterState, uri: &str, body: impl Into<Body>) -> (StatusCode, Bytes) {
    let req = Request::builder()
      .method("POST")
      .uri(uri)
      .header(header::CONTENT_TYPE, "application/json")
      .body(body.into())
      .unwrap();
    let resp = build_router(state).oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    (status, bytes)
  }

  async fn post_json(state: RouterState, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
    let (status, bytes) = post(state, uri, body.to_string()).await;
    (status, serde_json::from_slice(&bytes).unwrap())
  }

  fn hello() -> serde_json::Value {
    json!([{ "role": "user", "content": "hi" }])
  }

  #[tokio::test]
  async fn chat_without_messages_is_bad_request() {
    let (status, body) = post_json(state_for(refused_url()), "/api/chat", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "No messages provided");
  }

  #[tokio::test]
  async fn chat_without_body_is_bad_request() {
    let (status, bytes) = post(state_for(refused_url()), "/api/chat", Body::empty()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"], "No data provided");
  }

  #[tokio::test]
  async fn chat_relays_prompt_and_returns_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/api/generate"))
      .and(body_partial_json(json!({
        "model": "llama2",
        "prompt": "System: be kind\n\nUser: hi\n\nAssistant: ",
        "stream": false
      })))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "response": "hello there" })))
      .expect(1)
      .mount(&server)
      .await;

    let (status, body) = post_json(
      state_for(generate_url(&server)),
      "/api/chat",
      json!({ "messages": hello(), "settings": { "system_prompt": "be kind" } }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "response": "hello there" }));
  }

  #[tokio::test]
  async fn chat_uses_openai_dialect_from_settings() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/v1/chat/completions"))
      .and(body_partial_json(json!({ "model": "gpt-4o-mini", "max_tokens": 2048 })))
      .respond_with(
        ResponseTemplate::new(200).set_body_json(json!({ "choices": [{ "message": { "content": "hi" } }] })),
      )
      .mount(&server)
      .await;

    let (status, body) = post_json(
      state_for(refused_url()),
      "/api/chat",
      json!({
        "messages": hello(),
        "settings": {
          "api_endpoint": format!("{}/v1/chat/completions", server.uri()),
          "api_format": "openai",
          "model_name": "gpt-4o-mini"
        }
      }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["response"], "hi");
  }

  #[tokio::test]
  async fn chat_connection_refused_is_service_unavailable() {
    let (status, body) = post_json(state_for(refused_url()), "/api/chat", json!({ "messages": hello() })).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "Could not connect to LLM server. Is it running?");
  }

  #[tokio::test]
  async fn chat_slow_backend_is_gateway_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(
        ResponseTemplate::new(200)
          .set_body_json(json!({ "response": "late" }))
          .set_delay(Duration::from_secs(3)),
      )
      .mount(&server)
      .await;

    let (status, body) = post_json(state_for(generate_url(&server)), "/api/chat", json!({ "messages": hello() })).await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["error"], "LLM server request timed out");
  }

  #[tokio::test]
  async fn chat_backend_error_status_is_internal_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
      .mount(&server)
      .await;

    let (status, body) = post_json(state_for(generate_url(&server)), "/api/chat", json!({ "messages": hello() })).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("boom"));
  }

  #[tokio::test]
  async fn chat_malformed_settings_is_internal_error() {
    let (status, body) = post_json(
      state_for(refused_url()),
      "/api/chat",
      json!({ "messages": hello(), "settings": { "temperature": -2.0 } }),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().starts_with("invalid settings"));
  }

  #[tokio::test]
  async fn chat_wrongly_typed_settings_is_internal_error() {
    for settings in [
      json!({ "temperature": "hot" }),
      json!({ "max_tokens": -5 }),
      json!({ "max_tokens": 1.5 }),
    ] {
      let (status, body) = post_json(
        state_for(refused_url()),
        "/api/chat",
        json!({ "messages": hello(), "settings": settings }),
      )
      .await;
      assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR, "{settings}");
      assert!(body["error"].as_str().unwrap().starts_with("invalid settings"));
    }
  }

  #[tokio::test]
  async fn stream_wrongly_typed_settings_is_internal_error() {
    let (status, body) = post_json(
      state_for(refused_url()),
      "/api/stream",
      json!({ "messages": hello(), "settings": { "temperature": "hot" } }),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().starts_with("invalid settings"));
  }

  #[tokio::test]
  async fn test_connection_wrongly_typed_settings_is_internal_error() {
    let (status, body) = post_json(
      state_for(refused_url()),
      "/api/test-connection",
      json!({ "settings": { "temperature": "hot" } }),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["success"], false);
    assert!(body["message"].as_str().unwrap().starts_with("invalid settings"));
  }

  #[tokio::test]
  async fn chat_messages_of_wrong_type_is_bad_request() {
    let (status, body) = post_json(state_for(refused_url()), "/api/chat", json!({ "messages": "hi" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().starts_with("Invalid request body"));
  }

  #[tokio::test]
  async fn test_connection_reports_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(body_partial_json(json!({ "prompt": "Hello" })))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "response": "hi" })))
      .expect(1)
      .mount(&server)
      .await;

    let (status, bytes) = post(state_for(generate_url(&server)), "/api/test-connection", Body::empty()).await;
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "success": true, "message": "Connection successful!" }));
  }

  #[tokio::test]
  async fn test_connection_refused_mirrors_chat_classification() {
    let (status, body) = post_json(state_for(refused_url()), "/api/test-connection", json!({})).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body, json!({ "success": false, "message": "Could not connect to LLM server" }));
  }

  #[tokio::test]
  async fn test_connection_timeout_is_gateway_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
      .mount(&server)
      .await;

    let (status, body) = post_json(
      state_for(refused_url()),
      "/api/test-connection",
      json!({ "settings": { "api_endpoint": generate_url(&server) } }),
    )
    .await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["success"], false);
    assert_eq!(body["message"], "Connection timed out");
  }

  #[tokio::test]
  async fn stream_relays_fragments_as_events() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(body_partial_json(json!({ "stream": true })))
      .respond_with(ResponseTemplate::new(200).set_body_raw(
        "{\"response\":\"a\"}\ngarbage\n{\"response\":\"b\",\"done\":true}\n{\"response\":\"c\"}\n",
        "application/x-ndjson",
      ))
      .mount(&server)
      .await;

    let req = Request::builder()
      .method("POST")
      .uri("/api/stream")
      .body(Body::from(json!({ "messages": hello() }).to_string()))
      .unwrap();
    let resp = build_router(state_for(generate_url(&server))).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/event-stream");

    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(
      std::str::from_utf8(&bytes).unwrap(),
      "data: {\"content\":\"a\"}\n\ndata: {\"content\":\"b\"}\n\ndata: [DONE]\n\n"
    );
  }

  // Answers one request with a single chunked NDJSON line, then holds the
  // connection open without sending more.
  async fn stalling_backend(line: &'static str) -> String {
    use tokio::io::AsyncWriteExt;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let head = "HTTP/1.1 200 OK\r\ncontent-type: application/x-ndjson\r\ntransfer-encoding: chunked\r\n\r\n";
      let chunk = format!("{:x}\r\n{}\r\n", line.len(), line);
      socket.write_all(head.as_bytes()).await.unwrap();
      socket.write_all(chunk.as_bytes()).await.unwrap();
      socket.flush().await.unwrap();
      tokio::time::sleep(Duration::from_secs(10)).await;
      drop(socket);
    });
    format!("http://{addr}/api/generate")
  }

  #[tokio::test]
  async fn stream_fault_after_start_sends_error_event_then_done() {
    let endpoint = stalling_backend("{\"response\":\"a\"}\n").await;
    let (status, bytes) = post(
      state_for(endpoint),
      "/api/stream",
      json!({ "messages": hello() }).to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
      std::str::from_utf8(&bytes).unwrap(),
      "data: {\"content\":\"a\"}\n\ndata: {\"error\":\"LLM server stream timed out\"}\n\ndata: [DONE]\n\n"
    );
  }

  #[tokio::test]
  async fn stream_without_messages_is_rejected_before_streaming() {
    let (status, body) = post_json(state_for(refused_url()), "/api/stream", json!({ "messages": [] })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "No messages provided");
  }

  #[tokio::test]
  async fn stream_rejects_dialects_without_streaming() {
    let (status, body) = post_json(
      state_for(refused_url()),
      "/api/stream",
      json!({ "messages": hello(), "settings": { "api_format": "openai" } }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "streaming is not supported for the openai api format");
  }

  #[tokio::test]
  async fn stream_backend_error_is_reported_as_json() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(404).set_body_string("model 'llama2' not found"))
      .mount(&server)
      .await;

    let (status, body) = post_json(state_for(generate_url(&server)), "/api/stream", json!({ "messages": hello() })).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("404"));
  }

  #[tokio::test]
  async fn stream_connection_refused_is_service_unavailable() {
    let (status, _) = post_json(state_for(refused_url()), "/api/stream", json!({ "messages": hello() })).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
  }

  #[tokio::test]
  async fn health_reports_ok() {
    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let resp = build_router(state_for(refused_url())).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "ok");
  }

  #[test]
  fn prepare_chat_uses_merged_system_prompt() {
    let req: ChatRequest = serde_json::from_value(json!({ "messages": [{ "role": "user", "content": "q" }] })).unwrap();
    let defaults = Settings {
      system_prompt: Some("sys".to_string()),
      api_format: ApiFormat::Generic,
      ..Settings::default()
    };
    let (prompt, settings) = prepare_chat(req, &defaults).unwrap();
    assert_eq!(prompt, "System: sys\n\nUser: q\n\nAssistant: ");
    assert_eq!(settings.api_format, ApiFormat::Generic);
  }
}
