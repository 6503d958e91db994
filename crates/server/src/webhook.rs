use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use leadflow_agent::{ConversationRuntime, InboundMessage, StepOutcome};
use leadflow_core::errors::{ApplicationError, InterfaceError};
use leadflow_crm::SmsSender;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

const CORRELATION_HEADER: &str = "x-correlation-id";

#[derive(Clone)]
pub struct WebhookState {
    runtime: Arc<ConversationRuntime>,
    sms_sender: Option<Arc<dyn SmsSender>>,
}

impl WebhookState {
    pub fn new(runtime: Arc<ConversationRuntime>, sms_sender: Option<Arc<dyn SmsSender>>) -> Self {
        Self { runtime, sms_sender }
    }
}

/// Missing fields deserialize as empty so the runtime rejects them with a
/// correlation id instead of a bare extractor error.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct WebhookRequest {
    #[serde(default)]
    pub customer_id: String,
    #[serde(default)]
    pub message_text: String,
    #[serde(default)]
    pub pipeline_stage: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub reply_text: String,
    pub next_node: String,
    pub pipeline_stage: String,
    pub conversation_id: i64,
    pub delivered: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookError {
    pub error: String,
    pub correlation_id: String,
}

type WebhookResult = Result<Json<WebhookResponse>, (StatusCode, Json<WebhookError>)>;

pub fn router(state: WebhookState) -> Router {
    Router::new().route("/webhook", post(webhook)).with_state(state)
}

pub async fn webhook(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    payload: Result<Json<WebhookRequest>, JsonRejection>,
) -> WebhookResult {
    let correlation_id = correlation_id(&headers);
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            let error = ApplicationError::MalformedInput(rejection.body_text());
            return Err(interface_error(error.into_interface(correlation_id)));
        }
    };

    let customer_id = request.customer_id.trim().to_string();
    let inbound = InboundMessage {
        customer_id: request.customer_id,
        message_text: request.message_text,
        pipeline_stage: request.pipeline_stage,
        correlation_id: correlation_id.clone(),
    };

    let outcome = match state.runtime.handle_inbound(inbound).await {
        Ok(outcome) => outcome,
        Err(runtime_error) => {
            let error = ApplicationError::from(runtime_error);
            return Err(interface_error(error.into_interface(correlation_id)));
        }
    };

    let delivered = deliver_reply(&state, &customer_id, &outcome, &correlation_id).await;
    Ok(Json(WebhookResponse {
        reply_text: outcome.reply_text,
        next_node: outcome.next_node.to_string(),
        pipeline_stage: outcome.pipeline_stage,
        conversation_id: outcome.conversation_id.0,
        delivered,
    }))
}

/// The step is already persisted; a failed send is logged and reported, never
/// rolled back.
async fn deliver_reply(
    state: &WebhookState,
    customer_id: &str,
    outcome: &StepOutcome,
    correlation_id: &str,
) -> bool {
    let Some(sender) = &state.sms_sender else {
        return false;
    };
    if outcome.reply_text.is_empty() {
        return false;
    }

    match sender.send(customer_id, &outcome.reply_text).await {
        Ok(receipt) => {
            info!(
                event_name = "webhook.reply.delivered",
                correlation_id,
                conversation_id = %outcome.conversation_id,
                message_id = receipt.message_id.as_deref().unwrap_or("unknown"),
                "reply delivered over sms"
            );
            true
        }
        Err(error) => {
            error!(
                event_name = "webhook.reply.delivery_failed",
                correlation_id,
                conversation_id = %outcome.conversation_id,
                error = %error,
                "reply could not be delivered over sms"
            );
            false
        }
    }
}

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn interface_error(error: InterfaceError) -> (StatusCode, Json<WebhookError>) {
    let status = match &error {
        InterfaceError::BadRequest { message, .. } => {
            warn!(
                event_name = "webhook.request.rejected",
                correlation_id = error.correlation_id(),
                reason = %message,
                "inbound webhook rejected"
            );
            StatusCode::BAD_REQUEST
        }
        InterfaceError::ServiceUnavailable { message, .. } => {
            error!(
                event_name = "webhook.request.unavailable",
                correlation_id = error.correlation_id(),
                reason = %message,
                "inbound webhook could not be processed"
            );
            StatusCode::SERVICE_UNAVAILABLE
        }
        InterfaceError::Internal { message, .. } => {
            error!(
                event_name = "webhook.request.failed",
                correlation_id = error.correlation_id(),
                reason = %message,
                "inbound webhook hit a configuration error"
            );
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };

    (
        status,
        Json(WebhookError {
            error: error.user_message().to_string(),
            correlation_id: error.correlation_id().to_string(),
        }),
    )
}
