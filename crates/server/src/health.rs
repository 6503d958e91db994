use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use leadflow_core::workflow::WorkflowGraph;
use leadflow_db::{ping, DbPool};
use serde::Serialize;

/// Readiness inputs captured once at startup; only the store is queried per request.
#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    workflow: WorkflowSummary,
    sms_delivery: bool,
}

impl HealthState {
    pub fn new(db_pool: DbPool, graph: &WorkflowGraph, sms_delivery: bool) -> Self {
        let workflow = WorkflowSummary {
            entry_node: graph.entry().to_string(),
            node_count: graph.node_count(),
        };
        Self { db_pool, workflow, sms_delivery }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WorkflowSummary {
    pub entry_node: String,
    pub node_count: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConversationStoreCheck {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_conversations: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub conversation_store: ConversationStoreCheck,
    pub workflow: WorkflowSummary,
    pub sms_delivery: &'static str,
    pub checked_at: String,
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let conversation_store = conversation_store_check(&state.db_pool).await;
    let ready = conversation_store.ready;

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        conversation_store,
        workflow: state.workflow.clone(),
        sms_delivery: if state.sms_delivery { "enabled" } else { "disabled" },
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

/// Ready once the store answers and the conversation schema is migrated.
async fn conversation_store_check(pool: &DbPool) -> ConversationStoreCheck {
    let query = async {
        ping(pool).await?;
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM conversation WHERE is_active = 1")
            .fetch_one(pool)
            .await
    };

    match query.await {
        Ok(active) => ConversationStoreCheck {
            ready: true,
            active_conversations: Some(active),
            error: None,
        },
        Err(error) => ConversationStoreCheck {
            ready: false,
            active_conversations: None,
            error: Some(error.to_string()),
        },
    }
}
