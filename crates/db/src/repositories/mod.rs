use async_trait::async_trait;
use thiserror::Error;

use leadflow_core::domain::conversation::{
    ConversationId, ConversationMessage, ConversationState, ConversationStats,
    ConversationSummary, CustomerId, MessageRole,
};
use leadflow_core::workflow::NodeId;

pub mod conversation;
pub mod memory;

pub use conversation::SqlConversationRepository;
pub use memory::InMemoryConversationRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("conversation {0} was not found")]
    NotFound(ConversationId),
    #[error("conflicting conversation state: {0}")]
    Conflict(String),
}

/// Durable conversation state and transcript, keyed by CRM customer id.
///
/// At most one conversation per customer is active at any time. Message logs
/// are append-only; `save_state` only writes messages beyond those already
/// stored, so saving the same state twice never duplicates rows.
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    /// Returns the customer's active conversation, touching its
    /// `last_updated`, or creates one resting at `entry_node`.
    async fn get_or_create(
        &self,
        customer_id: &CustomerId,
        default_stage: &str,
        entry_node: &NodeId,
    ) -> Result<ConversationId, RepositoryError>;

    async fn find_active(
        &self,
        customer_id: &CustomerId,
    ) -> Result<Option<ConversationId>, RepositoryError>;

    async fn append_message(
        &self,
        id: ConversationId,
        role: MessageRole,
        content: &str,
    ) -> Result<ConversationMessage, RepositoryError>;

    async fn load_state(
        &self,
        id: ConversationId,
    ) -> Result<Option<ConversationState>, RepositoryError>;

    async fn save_state(
        &self,
        id: ConversationId,
        state: &ConversationState,
    ) -> Result<(), RepositoryError>;

    async fn deactivate(&self, id: ConversationId) -> Result<(), RepositoryError>;

    /// Every conversation the customer has had, newest first.
    async fn history(
        &self,
        customer_id: &CustomerId,
    ) -> Result<Vec<ConversationSummary>, RepositoryError>;

    async fn stats(&self) -> Result<ConversationStats, RepositoryError>;
}
