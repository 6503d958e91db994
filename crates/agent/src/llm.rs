use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use leadflow_core::config::{LlmConfig, LlmProvider};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const OLLAMA_BASE_URL: &str = "http://localhost:11434";
const RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: TurnRole,
    pub content: String,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: TurnRole::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: TurnRole::User, content: content.into() }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompletionRequest {
    pub turns: Vec<ChatTurn>,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Error classification for retry logic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionErrorKind {
    /// Connection failures - retryable
    Network,
    /// Provider did not answer in time - retryable
    Timeout,
    /// 429 - retryable
    RateLimit,
    /// 5xx - retryable
    ServerError,
    /// 401/403 - not retryable
    Auth,
    /// Other 4xx - not retryable
    InvalidRequest,
    /// 2xx with no usable text
    MalformedResponse,
}

impl CompletionErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network | Self::Timeout | Self::RateLimit | Self::ServerError)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct CompletionError {
    pub kind: CompletionErrorKind,
    pub message: String,
}

impl CompletionError {
    pub fn new(kind: CompletionErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(CompletionErrorKind::Timeout, format!("no completion after {after:?}"))
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        let kind = match status {
            429 => CompletionErrorKind::RateLimit,
            401 | 403 => CompletionErrorKind::Auth,
            500..=599 => CompletionErrorKind::ServerError,
            _ => CompletionErrorKind::InvalidRequest,
        };
        let snippet = body.chars().take(200).collect::<String>();
        Self::new(kind, format!("provider returned {status}: {snippet}"))
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Chat completion backend: ordered role-tagged turns in, generated text out.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError>;
}

#[derive(Serialize)]
struct ChatCompletionBody<'a> {
    model: &'a str,
    messages: &'a [ChatTurn],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Client for `/v1/chat/completions`, served by OpenAI and by Ollama's
/// compatibility layer alike.
pub struct OpenAiCompatibleClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<SecretString>,
    model: String,
    timeout: Duration,
    max_retries: u32,
}

impl OpenAiCompatibleClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, CompletionError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder().timeout(timeout).build().map_err(|error| {
            CompletionError::new(CompletionErrorKind::Network, error.to_string())
        })?;
        let base_url = config.base_url.clone().unwrap_or_else(|| {
            match config.provider {
                LlmProvider::OpenAi => OPENAI_BASE_URL,
                LlmProvider::Ollama => OLLAMA_BASE_URL,
            }
            .to_string()
        });

        Ok(Self {
            client,
            endpoint: chat_completions_url(&base_url),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            timeout,
            max_retries: config.max_retries,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Wall-clock time a full retry sequence may take: every attempt at its
    /// own timeout plus the delays between them.
    pub fn generation_budget(&self) -> Duration {
        let attempts = self.max_retries.saturating_add(1);
        self.timeout.saturating_mul(attempts) + RETRY_DELAY.saturating_mul(self.max_retries)
    }

    async fn complete_once(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
        let body = ChatCompletionBody {
            model: &self.model,
            messages: &request.turns,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };
        let mut builder = self.client.post(&self.endpoint).json(&body);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key.expose_secret());
        }

        let response = builder.send().await.map_err(|error| {
            if error.is_timeout() {
                CompletionError::timeout(self.timeout)
            } else {
                CompletionError::new(CompletionErrorKind::Network, error.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::from_status(status.as_u16(), &body));
        }

        let parsed = response.json::<ChatCompletionResponse>().await.map_err(|error| {
            CompletionError::new(CompletionErrorKind::MalformedResponse, error.to_string())
        })?;
        first_choice_text(parsed)
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompatibleClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
        with_retries(self.max_retries, RETRY_DELAY, move || self.complete_once(request)).await
    }
}

fn chat_completions_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let base = base.strip_suffix("/v1").unwrap_or(base);
    format!("{base}/v1/chat/completions")
}

fn first_choice_text(response: ChatCompletionResponse) -> Result<String, CompletionError> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .map(|content| content.trim().to_string())
        .filter(|content| !content.is_empty())
        .ok_or_else(|| {
            CompletionError::new(CompletionErrorKind::MalformedResponse, "no completion text")
        })
}

/// Runs `attempt` once plus up to `max_retries` more times while the error is
/// retryable.
async fn with_retries<F, Fut>(
    max_retries: u32,
    delay: Duration,
    mut attempt: F,
) -> Result<String, CompletionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<String, CompletionError>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match attempt().await {
            Ok(text) => return Ok(text),
            Err(error) if error.is_retryable() && attempts <= max_retries => {
                warn!(
                    event_name = "llm.completion.retry",
                    attempt = attempts,
                    kind = ?error.kind,
                    "completion attempt failed; retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use leadflow_core::config::{AppConfig, LlmProvider};
    use serde_json::json;

    use super::{
        chat_completions_url, first_choice_text, with_retries, ChatCompletionResponse, ChatTurn,
        CompletionError, CompletionErrorKind, OpenAiCompatibleClient,
    };

    #[test]
    fn status_codes_classify_retryability() {
        assert!(CompletionError::from_status(429, "slow down").is_retryable());
        assert!(CompletionError::from_status(503, "").is_retryable());
        assert!(!CompletionError::from_status(401, "").is_retryable());
        assert_eq!(
            CompletionError::from_status(400, "bad").kind,
            CompletionErrorKind::InvalidRequest
        );
        assert!(CompletionError::timeout(Duration::from_secs(1)).is_retryable());
    }

    #[test]
    fn endpoint_is_derived_from_base_url() {
        assert_eq!(
            chat_completions_url("http://localhost:11434/"),
            "http://localhost:11434/v1/chat/completions"
        );
        assert_eq!(
            chat_completions_url("https://api.openai.com/v1"),
            "https://api.openai.com/v1/chat/completions"
        );

        let mut config = AppConfig::default().llm;
        config.provider = LlmProvider::OpenAi;
        config.base_url = None;
        let client = OpenAiCompatibleClient::from_config(&config).expect("client");
        assert_eq!(client.endpoint(), "https://api.openai.com/v1/chat/completions");
    }

    #[test]
    fn generation_budget_covers_every_attempt() {
        let mut config = AppConfig::default().llm;
        config.timeout_secs = 10;
        config.max_retries = 2;

        let client = OpenAiCompatibleClient::from_config(&config).expect("client");

        assert_eq!(client.generation_budget(), Duration::from_millis(31_000));
    }

    #[test]
    fn turns_serialize_with_lowercase_roles() {
        let turn = serde_json::to_value(ChatTurn::system("be brief")).expect("serialize");
        assert_eq!(turn, json!({"role": "system", "content": "be brief"}));
    }

    #[test]
    fn first_choice_text_rejects_empty_completions() {
        let parsed: ChatCompletionResponse = serde_json::from_value(json!({
            "choices": [{"message": {"role": "assistant", "content": "  Sure thing!  "}}]
        }))
        .expect("parse");
        assert_eq!(first_choice_text(parsed).expect("text"), "Sure thing!");

        let empty: ChatCompletionResponse =
            serde_json::from_value(json!({"choices": []})).expect("parse");
        assert_eq!(
            first_choice_text(empty).expect_err("empty").kind,
            CompletionErrorKind::MalformedResponse
        );
    }

    #[tokio::test]
    async fn retries_transient_failures_then_succeeds() {
        let calls = AtomicU32::new(0);

        let result = with_retries(2, Duration::ZERO, || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call < 2 {
                    Err(CompletionError::from_status(502, "bad gateway"))
                } else {
                    Ok("hello".to_string())
                }
            }
        })
        .await;

        assert_eq!(result.expect("completion"), "hello");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_auth_failures() {
        let calls = AtomicU32::new(0);

        let result = with_retries(3, Duration::ZERO, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CompletionError::from_status(401, "unauthorized")) }
        })
        .await;

        assert_eq!(result.expect_err("auth").kind, CompletionErrorKind::Auth);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
