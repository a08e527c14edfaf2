use std::fmt;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Deserializer, Serialize};

use crate::config::Settings;
use crate::error::GatewayError;
use crate::stream::is_truthy;

/// Backend request/response convention. Unknown names fall back to `Generic`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ApiFormat {
  #[default]
  Ollama,
  #[value(name = "openai")]
  OpenAi,
  Generic,
}

impl ApiFormat {
  pub fn parse_lenient(name: &str) -> Self {
    match name {
      "ollama" => ApiFormat::Ollama,
      "openai" => ApiFormat::OpenAi,
      _ => ApiFormat::Generic,
    }
  }

  pub fn supports_streaming(self) -> bool {
    matches!(self, ApiFormat::Ollama)
  }

  pub fn encode(self, prompt: &str, settings: &Settings, stream: bool) -> RequestBody {
    let model = settings.model_name.clone();
    match self {
      ApiFormat::Ollama => RequestBody::Ollama(OllamaRequest {
        model,
        prompt: prompt.to_string(),
        stream,
        options: OllamaOptions {
          temperature: settings.temperature,
          num_predict: settings.max_tokens,
        },
      }),
      ApiFormat::OpenAi => RequestBody::OpenAi(OpenAiRequest {
        model,
        messages: vec![OpenAiMessage {
          role: "user".to_string(),
          content: prompt.to_string(),
        }],
        temperature: settings.temperature,
        max_tokens: settings.max_tokens,
      }),
      ApiFormat::Generic => RequestBody::Generic(GenericRequest {
        model,
        prompt: prompt.to_string(),
      }),
    }
  }

  /// Pulls generated text out of a backend reply. Never fails; missing fields
  /// degrade to empty text, or for `Generic` to a dump of the whole body.
  pub fn decode(self, body: &serde_json::Value) -> String {
    match self {
      ApiFormat::Ollama => body["response"].as_str().unwrap_or("").to_string(),
      ApiFormat::OpenAi => {
        let choice = &body["choices"][0];
        non_empty_str(&choice["message"]["content"])
          .or_else(|| non_empty_str(&choice["text"]))
          .unwrap_or("")
          .to_string()
      }
      ApiFormat::Generic => ["response", "content", "text", "output"]
        .iter()
        .map(|field| &body[*field])
        .find(|value| is_truthy(value))
        .map(|value| match value.as_str() {
          Some(text) => text.to_string(),
          None => value.to_string(),
        })
        .unwrap_or_else(|| body.to_string()),
    }
  }
}

fn non_empty_str(value: &serde_json::Value) -> Option<&str> {
  value.as_str().filter(|s| !s.is_empty())
}

impl fmt::Display for ApiFormat {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      ApiFormat::Ollama => "ollama",
      ApiFormat::OpenAi => "openai",
      ApiFormat::Generic => "generic",
    };
    f.write_str(name)
  }
}

impl<'de> Deserialize<'de> for ApiFormat {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(ApiFormat::parse_lenient(value.as_str().unwrap_or("")))
  }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum RequestBody {
  Ollama(OllamaRequest),
  OpenAi(OpenAiRequest),
  Generic(GenericRequest),
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct OllamaRequest {
  model: String,
  prompt: String,
  stream: bool,
  options: OllamaOptions,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
struct OllamaOptions {
  temperature: f64,
  num_predict: u32,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct OpenAiRequest {
  model: String,
  messages: Vec<OpenAiMessage>,
  temperature: f64,
  max_tokens: u32,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
struct OpenAiMessage {
  role: String,
  content: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct GenericRequest {
  model: String,
  prompt: String,
}

pub fn request_headers(settings: &Settings) -> Result<HeaderMap, GatewayError> {
  let mut headers = HeaderMap::new();
  headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
  if let Some(key) = settings.api_key.as_deref() {
    let value = HeaderValue::from_str(&format!("Bearer {}", key))
      .map_err(|_| GatewayError::InvalidSettings("api_key is not a valid header value".to_string()))?;
    headers.insert(AUTHORIZATION, value);
  }
  Ok(headers)
}
