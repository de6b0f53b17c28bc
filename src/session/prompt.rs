use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{InferError, Result};
use crate::model::ModelGateway;

/// Cue appended by the plain-text renderer so the model continues as the
/// assistant.
const ASSISTANT_CUE: &str = "Assistant: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    /// Capitalized label used by the plain-text renderer.
    pub fn label(&self) -> &'static str {
        match self {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    #[cfg(test)]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Prompt and history after the resolution rule has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPrompt {
    pub prompt: String,
    pub history: Vec<ChatMessage>,
}

/// Resolve the effective prompt for a turn.
///
/// An absent or empty prompt is taken from the last history entry, which is
/// then dropped from the history.  If nothing non-empty is left the request
/// is rejected with [`InferError::MissingPrompt`].
pub fn resolve(prompt: Option<&str>, mut history: Vec<ChatMessage>) -> Result<ResolvedPrompt> {
    let mut prompt = prompt.unwrap_or_default().to_string();

    if prompt.is_empty() {
        if let Some(last) = history.pop() {
            prompt = last.content;
        }
    }

    if prompt.is_empty() {
        return Err(InferError::MissingPrompt);
    }

    Ok(ResolvedPrompt { prompt, history })
}

/// Build the ordered message list: system intro, history, project files
/// (only when present), then the user's prompt.
pub fn build_messages(
    system_prompt: &str,
    resolved: &ResolvedPrompt,
    file_context: &[String],
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(resolved.history.len() + 3);
    messages.push(ChatMessage::system(system_prompt));
    messages.extend(resolved.history.iter().cloned());

    if !file_context.is_empty() {
        messages.push(ChatMessage::system(format!(
            "Project files:\n{}",
            file_context.join("\n")
        )));
    }

    messages.push(ChatMessage::user(resolved.prompt.clone()));
    messages
}

/// Plain-text fallback: one `"<Role>: <content>\n"` line per message plus a
/// trailing assistant cue.
pub fn render_plain(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    for msg in messages {
        out.push_str(msg.role.label());
        out.push_str(": ");
        out.push_str(&msg.content);
        out.push('\n');
    }
    out.push_str(ASSISTANT_CUE);
    out
}

/// Assemble the model-ready prompt, delegating serialization to the
/// gateway's chat template when it has one.
pub fn build(
    gateway: &dyn ModelGateway,
    system_prompt: &str,
    resolved: &ResolvedPrompt,
    file_context: &[String],
) -> String {
    debug!(
        prompt_len = resolved.prompt.len(),
        history = resolved.history.len(),
        files = file_context.len(),
        "building prompt"
    );

    let messages = build_messages(system_prompt, resolved, file_context);
    match gateway.apply_chat_template(&messages) {
        Some(rendered) => rendered,
        None => render_plain(&messages),
    }
}
