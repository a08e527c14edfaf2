use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::dialect::ApiFormat;
use crate::error::GatewayError;

/// Fully resolved backend settings for one request.
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
  pub api_endpoint: String,
  pub model_name: String,
  pub api_format: ApiFormat,
  pub temperature: f64,
  pub max_tokens: u32,
  pub system_prompt: Option<String>,
  pub api_key: Option<String>,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      api_endpoint: "http://localhost:11434/api/generate".to_string(),
      model_name: "llama2".to_string(),
      api_format: ApiFormat::Ollama,
      temperature: 0.7,
      max_tokens: 2048,
      system_prompt: None,
      api_key: None,
    }
  }
}

impl Settings {
  pub fn validate(&self) -> Result<(), GatewayError> {
    if self.api_endpoint.trim().is_empty() {
      return Err(GatewayError::InvalidSettings("api_endpoint is empty".to_string()));
    }
    if !self.temperature.is_finite() || self.temperature < 0.0 {
      return Err(GatewayError::InvalidSettings(format!(
        "temperature must be a non-negative number, got {}",
        self.temperature
      )));
    }
    if self.max_tokens == 0 {
      return Err(GatewayError::InvalidSettings("max_tokens must be positive".to_string()));
    }
    Ok(())
  }
}

/// Per-request settings as sent by the browser. Absent fields come from the
/// process defaults.
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct SettingsOverride {
  pub api_endpoint: Option<String>,
  pub model_name: Option<String>,
  pub api_format: Option<ApiFormat>,
  pub temperature: Option<f64>,
  pub max_tokens: Option<u32>,
  pub system_prompt: Option<String>,
  pub api_key: Option<String>,
}

impl SettingsOverride {
  pub fn merge_onto(self, defaults: &Settings) -> Settings {
    Settings {
      api_endpoint: self.api_endpoint.unwrap_or_else(|| defaults.api_endpoint.clone()),
      model_name: self.model_name.unwrap_or_else(|| defaults.model_name.clone()),
      api_format: self.api_format.unwrap_or(defaults.api_format),
      temperature: self.temperature.unwrap_or(defaults.temperature),
      max_tokens: self.max_tokens.unwrap_or(defaults.max_tokens),
      system_prompt: non_empty(self.system_prompt).or_else(|| defaults.system_prompt.clone()),
      api_key: non_empty(self.api_key).or_else(|| defaults.api_key.clone()),
    }
  }
}

fn non_empty(value: Option<String>) -> Option<String> {
  value.filter(|v| !v.is_empty())
}

/// Merges the raw `settings` object of a request onto the defaults. A value
/// of the wrong shape is a settings error, not a malformed request.
pub fn resolve(settings: Option<serde_json::Value>, defaults: &Settings) -> Result<Settings, GatewayError> {
  let overrides = match settings {
    None | Some(serde_json::Value::Null) => SettingsOverride::default(),
    Some(value) => serde_json::from_value::<SettingsOverride>(value)
      .map_err(|err| GatewayError::InvalidSettings(err.to_string()))?,
  };
  Ok(overrides.merge_onto(defaults))
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Timeouts {
  pub test: Duration,
  pub chat: Duration,
  pub stream: Duration,
}

impl Default for Timeouts {
  fn default() -> Self {
    Self {
      test: Duration::from_secs(10),
      chat: Duration::from_secs(60),
      stream: Duration::from_secs(120),
    }
  }
}

#[derive(Clone, Debug, Default)]
pub struct AppConfig {
  pub defaults: Settings,
  pub timeouts: Timeouts,
  pub static_dir: Option<PathBuf>,
}

/// Command line, with every flag also readable from the environment.
#[derive(clap::Parser, Debug)]
#[command(name = "chatrelay", version, about)]
pub struct Args {
  #[arg(long, env = "HOST", default_value = "0.0.0.0")]
  pub host: String,
  #[arg(long, env = "PORT", default_value_t = 5000)]
  pub port: u16,
  #[arg(long, env = "DEBUG")]
  pub debug: bool,
  /// Directory served for paths outside /api
  #[arg(long, env = "STATIC_DIR")]
  pub static_dir: Option<PathBuf>,

  #[arg(long, env = "LLM_API_ENDPOINT")]
  pub api_endpoint: Option<String>,
  #[arg(long, env = "LLM_MODEL")]
  pub model_name: Option<String>,
  #[arg(long, env = "LLM_API_FORMAT", value_enum)]
  pub api_format: Option<ApiFormat>,
  #[arg(long, env = "LLM_TEMPERATURE")]
  pub temperature: Option<f64>,
  #[arg(long, env = "LLM_MAX_TOKENS")]
  pub max_tokens: Option<u32>,
  #[arg(long, env = "LLM_SYSTEM_PROMPT")]
  pub system_prompt: Option<String>,
  #[arg(long, env = "LLM_API_KEY", hide_env_values = true)]
  pub api_key: Option<String>,

  #[arg(long, env = "TEST_TIMEOUT_SECS", default_value_t = 10)]
  pub test_timeout_secs: u64,
  #[arg(long, env = "CHAT_TIMEOUT_SECS", default_value_t = 60)]
  pub chat_timeout_secs: u64,
  #[arg(long, env = "STREAM_TIMEOUT_SECS", default_value_t = 120)]
  pub stream_timeout_secs: u64,
}

impl Args {
  pub fn app_config(&self) -> Result<AppConfig, GatewayError> {
    let overrides = SettingsOverride {
      api_endpoint: self.api_endpoint.clone(),
      model_name: self.model_name.clone(),
      api_format: self.api_format,
      temperature: self.temperature,
      max_tokens: self.max_tokens,
      system_prompt: self.system_prompt.clone(),
      api_key: self.api_key.clone(),
    };
    let defaults = overrides.merge_onto(&Settings::default());
    defaults.validate()?;

    Ok(AppConfig {
      defaults,
      timeouts: Timeouts {
        test: Duration::from_secs(self.test_timeout_secs),
        chat: Duration::from_secs(self.chat_timeout_secs),
        stream: Duration::from_secs(self.stream_timeout_secs),
      },
      static_dir: self.static_dir.clone(),
    })
  }
}
