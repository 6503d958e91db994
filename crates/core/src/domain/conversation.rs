use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::NodeId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationId(pub i64);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// External CRM contact identifier. Stable for the customer's lifetime and
/// shared by every conversation that customer ever has.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CustomerId(pub String);

impl fmt::Display for CustomerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    Customer,
    Agent,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Agent => "agent",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Customer => "Customer",
            Self::Agent => "Agent",
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "customer" => Ok(Self::Customer),
            "agent" => Ok(Self::Agent),
            other => Err(format!("unknown message role `{other}`")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

pub type ConversationContext = BTreeMap<String, Value>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub customer_id: CustomerId,
    pub current_node: NodeId,
    pub pipeline_stage: String,
    pub context: ConversationContext,
    pub messages: Vec<ConversationMessage>,
    pub is_active: bool,
}

impl ConversationState {
    pub fn new(
        customer_id: CustomerId,
        entry_node: NodeId,
        pipeline_stage: impl Into<String>,
    ) -> Self {
        Self {
            customer_id,
            current_node: entry_node,
            pipeline_stage: pipeline_stage.into(),
            context: ConversationContext::new(),
            messages: Vec::new(),
            is_active: true,
        }
    }

    /// Appends to the transcript. Timestamps never go backwards within one
    /// conversation even if the wall clock does.
    pub fn push_message(
        &mut self,
        role: MessageRole,
        content: impl Into<String>,
    ) -> &ConversationMessage {
        let timestamp = next_timestamp(self.messages.last().map(|message| message.timestamp));
        self.messages.push(ConversationMessage { role, content: content.into(), timestamp });
        &self.messages[self.messages.len() - 1]
    }

    pub fn set_fact(&mut self, key: impl Into<String>, value: Value) {
        self.context.insert(key.into(), value);
    }

    pub fn fact(&self, key: &str) -> Option<&Value> {
        self.context.get(key)
    }

    /// Routing view of a field: context facts first, then the conversation's
    /// own reserved attributes.
    pub fn routing_value(&self, field: &str) -> Option<Value> {
        if let Some(value) = self.context.get(field) {
            return Some(value.clone());
        }
        match field {
            "pipeline_stage" => Some(Value::String(self.pipeline_stage.clone())),
            "customer_id" => Some(Value::String(self.customer_id.0.clone())),
            _ => None,
        }
    }

    /// The last `limit` messages before the newest one, oldest first.
    pub fn history_window(&self, limit: usize) -> &[ConversationMessage] {
        let prior = self.messages.len().saturating_sub(1);
        let start = prior.saturating_sub(limit);
        &self.messages[start..prior]
    }
}

pub fn next_timestamp(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(previous) if previous > now => previous,
        _ => now,
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub customer_id: CustomerId,
    pub pipeline_stage: String,
    pub current_node: NodeId,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationStats {
    pub unique_customers: i64,
    pub active_conversations: i64,
    pub total_conversations: i64,
    pub pipeline_breakdown: BTreeMap<String, i64>,
}
