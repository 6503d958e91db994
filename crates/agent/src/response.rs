use std::sync::Arc;
use std::time::Duration;

use leadflow_core::domain::conversation::{ConversationContext, ConversationMessage};
use tracing::warn;

use crate::llm::{ChatTurn, CompletionError, CompletionProvider, CompletionRequest};

/// Customer-facing reply whenever the provider fails. Internal error detail
/// never reaches the transcript.
pub const FALLBACK_REPLY: &str =
    "I'm having trouble processing your message right now. Please try again shortly.";

/// Prior messages included in the transcript block.
pub const HISTORY_LIMIT: usize = 5;

pub struct ResponseGenerator {
    provider: Arc<dyn CompletionProvider>,
    timeout: Duration,
    default_max_tokens: u32,
}

impl ResponseGenerator {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        timeout: Duration,
        default_max_tokens: u32,
    ) -> Self {
        Self { provider, timeout, default_max_tokens }
    }

    /// Always yields reply text; provider errors and timeouts become
    /// [`FALLBACK_REPLY`].
    pub async fn generate(
        &self,
        system_prompt: &str,
        history: &[ConversationMessage],
        latest_message: &str,
        facts: &ConversationContext,
        temperature: f32,
        max_tokens: Option<u32>,
    ) -> String {
        let request = build_request(
            system_prompt,
            history,
            latest_message,
            facts,
            temperature,
            max_tokens.unwrap_or(self.default_max_tokens),
        );

        let completion = self.provider.complete(&request);
        let result = match tokio::time::timeout(self.timeout, completion).await {
            Ok(result) => result,
            Err(_) => Err(CompletionError::timeout(self.timeout)),
        };

        match result {
            Ok(reply) if !reply.trim().is_empty() => reply.trim().to_string(),
            Ok(_) => {
                warn!(event_name = "llm.completion.empty", "provider returned an empty reply");
                FALLBACK_REPLY.to_string()
            }
            Err(error) => {
                warn!(
                    event_name = "llm.completion.fallback",
                    kind = ?error.kind,
                    error = %error,
                    "completion failed; using fallback reply"
                );
                FALLBACK_REPLY.to_string()
            }
        }
    }
}

pub fn build_request(
    system_prompt: &str,
    history: &[ConversationMessage],
    latest_message: &str,
    facts: &ConversationContext,
    temperature: f32,
    max_tokens: u32,
) -> CompletionRequest {
    let start = history.len().saturating_sub(HISTORY_LIMIT);
    let transcript = history[start..]
        .iter()
        .map(|message| format!("{}: {}", message.role.label(), message.content))
        .collect::<Vec<_>>()
        .join("\n");

    let mut user = String::new();
    if !transcript.is_empty() {
        user.push_str("Previous conversation:\n");
        user.push_str(&transcript);
        user.push_str("\n\n");
    }
    if !facts.is_empty() {
        user.push_str("Known facts:\n");
        for (key, value) in facts {
            user.push_str(&format!("- {key}: {value}\n"));
        }
        user.push('\n');
    }
    user.push_str("Latest message from customer: ");
    user.push_str(latest_message);

    CompletionRequest {
        turns: vec![ChatTurn::system(system_prompt), ChatTurn::user(user)],
        temperature,
        max_tokens,
    }
}
