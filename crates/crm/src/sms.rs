use std::sync::Arc;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::oauth::{TokenError, TokenManager};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmsReceipt {
    pub message_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum SmsError {
    #[error("sms requires a contact id")]
    MissingContact,
    #[error("sms body is empty")]
    EmptyBody,
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("sms request failed: {0}")]
    Transport(String),
    #[error("crm rejected sms with status {status}")]
    Rejected { status: u16 },
}

/// Outbound SMS to a CRM contact.
#[async_trait]
pub trait SmsSender: Send + Sync {
    async fn send(&self, contact_id: &str, body: &str) -> Result<SmsReceipt, SmsError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutboundMessage<'a> {
    contact_id: &'a str,
    body: &'a str,
    channel_type: &'static str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OutboundMessageResponse {
    #[serde(default)]
    message_id: Option<String>,
}

pub struct HttpSmsSender {
    client: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenManager>,
}

impl HttpSmsSender {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        tokens: Arc<TokenManager>,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url, tokens }
    }

    fn messages_url(&self) -> String {
        format!("{}/conversations/messages", self.base_url)
    }
}

#[async_trait]
impl SmsSender for HttpSmsSender {
    async fn send(&self, contact_id: &str, body: &str) -> Result<SmsReceipt, SmsError> {
        validate_outbound(contact_id, body)?;
        let token = self.tokens.get_valid_token().await?;

        let response = self
            .client
            .post(self.messages_url())
            .bearer_auth(token.expose_secret())
            .json(&OutboundMessage { contact_id, body, channel_type: "sms" })
            .send()
            .await
            .map_err(|error| SmsError::Transport(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            warn!(
                event_name = "crm.sms.rejected",
                contact_id,
                status = status.as_u16(),
                "crm rejected outbound sms"
            );
            return Err(SmsError::Rejected { status: status.as_u16() });
        }

        // Some CRM responses carry no body; a missing id is not a failure.
        let receipt = response
            .json::<OutboundMessageResponse>()
            .await
            .map(|parsed| SmsReceipt { message_id: parsed.message_id })
            .unwrap_or_default();

        info!(
            event_name = "crm.sms.sent",
            contact_id,
            message_id = receipt.message_id.as_deref().unwrap_or("unknown"),
            "outbound sms sent"
        );
        Ok(receipt)
    }
}

fn validate_outbound(contact_id: &str, body: &str) -> Result<(), SmsError> {
    if contact_id.trim().is_empty() {
        return Err(SmsError::MissingContact);
    }
    if body.trim().is_empty() {
        return Err(SmsError::EmptyBody);
    }
    Ok(())
}
