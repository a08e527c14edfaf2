use crate::models::Message;

/// Flattens a conversation into one completion prompt ending with an open
/// `Assistant: ` turn.
pub fn build_prompt(messages: &[Message], system_prompt: Option<&str>) -> String {
  let mut prompt = String::new();

  if let Some(system) = system_prompt.filter(|s| !s.is_empty()) {
    prompt.push_str(&format!("System: {}\n\n", system));
  }

  for msg in messages {
    prompt.push_str(&format!("{}: {}\n\n", msg.role.label(), msg.content));
  }

  prompt.push_str("Assistant: ");
  prompt
}
