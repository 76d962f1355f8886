//! Prompt assembly: system instruction + history + the new user message.

use super::{Message, Role};
use serde::{Deserialize, Serialize};

/// Built-in persona used when no system prompt is configured.
pub const DEFAULT_SYSTEM_PROMPT: &str = include_str!("../../prompts/system.md");

/// Role of an entry in the prompt sent to the model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    System,
    User,
    Assistant,
}

impl From<Role> for PromptRole {
    fn from(role: Role) -> Self {
        match role {
            Role::User => PromptRole::User,
            Role::Assistant => PromptRole::Assistant,
        }
    }
}

/// One entry of the prompt sent to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: PromptRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Assemble the prompt for one model call.
///
/// Output is the optional system entry, then `history` exactly in the order
/// given, then `user_text` as the final user entry. Nothing is reordered or
/// deduplicated.
pub fn assemble_prompt(
    history: &[Message],
    user_text: &str,
    system_prompt: Option<&str>,
) -> Vec<PromptMessage> {
    let mut prompt = Vec::with_capacity(history.len() + 2);

    if let Some(system) = system_prompt {
        prompt.push(PromptMessage::new(PromptRole::System, system));
    }

    prompt.extend(
        history
            .iter()
            .map(|message| PromptMessage::new(message.role.into(), message.content.clone())),
    );

    prompt.push(PromptMessage::new(PromptRole::User, user_text));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn empty_history_yields_system_then_user() {
        let prompt = assemble_prompt(&[], "hello", Some("be brief"));
        assert_eq!(
            prompt,
            vec![
                PromptMessage::new(PromptRole::System, "be brief"),
                PromptMessage::new(PromptRole::User, "hello"),
            ]
        );

        let bare = assemble_prompt(&[], "hello", None);
        assert_eq!(bare, vec![PromptMessage::new(PromptRole::User, "hello")]);
    }

    #[test]
    fn history_order_is_preserved_verbatim() {
        // Deliberately out of timestamp order and with a duplicate.
        let now = Utc::now();
        let mut late = Message::assistant("later");
        late.timestamp = now;
        let mut early = Message::user("earlier");
        early.timestamp = now - Duration::minutes(5);
        let duplicate = Message::user("earlier");

        let history = vec![late, early, duplicate];
        let prompt = assemble_prompt(&history, "next", Some("system"));

        let roles: Vec<_> = prompt.iter().map(|m| m.role).collect();
        let contents: Vec<_> = prompt.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(
            roles,
            vec![
                PromptRole::System,
                PromptRole::Assistant,
                PromptRole::User,
                PromptRole::User,
                PromptRole::User,
            ]
        );
        assert_eq!(contents, vec!["system", "later", "earlier", "earlier", "next"]);
    }

    #[test]
    fn serializes_roles_lowercase() {
        let json = serde_json::to_value(PromptMessage::new(PromptRole::System, "x")).unwrap();
        assert_eq!(json["role"], "system");
    }

    #[test]
    fn default_prompt_is_present() {
        assert!(!DEFAULT_SYSTEM_PROMPT.trim().is_empty());
    }
}
