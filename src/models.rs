use serde::{Deserialize, Deserializer, Serialize};

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  User,
  #[default]
  Assistant,
}

impl Role {
  pub fn label(self) -> &'static str {
    match self {
      Role::User => "User",
      Role::Assistant => "Assistant",
    }
  }
}

// Anything other than "user" is an assistant turn, malformed values included.
impl<'de> Deserialize<'de> for Role {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(if value.as_str() == Some("user") {
      Role::User
    } else {
      Role::Assistant
    })
  }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
  #[serde(default)]
  pub role: Role,
  #[serde(default)]
  pub content: String,
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct ChatRequest {
  #[serde(default)]
  pub messages: Vec<Message>,
  pub settings: Option<serde_json::Value>,
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct TestConnectionRequest {
  pub settings: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ChatResponse {
  pub response: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorBody {
  pub error: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ConnectionStatus {
  pub success: bool,
  pub message: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct StreamChunk {
  pub content: String,
}
