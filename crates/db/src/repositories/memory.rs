use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use leadflow_core::domain::conversation::{
    next_timestamp, ConversationId, ConversationMessage, ConversationState, ConversationStats,
    ConversationSummary, CustomerId, MessageRole,
};
use leadflow_core::workflow::NodeId;

use super::{ConversationRepository, RepositoryError};

#[derive(Clone, Debug)]
struct StoredConversation {
    state: ConversationState,
    created_at: DateTime<Utc>,
    last_updated: DateTime<Utc>,
}

#[derive(Default)]
struct Store {
    next_id: i64,
    conversations: HashMap<ConversationId, StoredConversation>,
}

impl Store {
    fn active_for(&self, customer_id: &CustomerId) -> Option<ConversationId> {
        self.conversations
            .iter()
            .filter(|(_, stored)| {
                stored.state.is_active && &stored.state.customer_id == customer_id
            })
            .map(|(id, _)| *id)
            .min()
    }

    fn get_mut(&mut self, id: ConversationId) -> Result<&mut StoredConversation, RepositoryError> {
        self.conversations.get_mut(&id).ok_or(RepositoryError::NotFound(id))
    }
}

/// Process-local store with the same semantics as the SQL repository.
#[derive(Default)]
pub struct InMemoryConversationRepository {
    store: RwLock<Store>,
}

#[async_trait::async_trait]
impl ConversationRepository for InMemoryConversationRepository {
    async fn get_or_create(
        &self,
        customer_id: &CustomerId,
        default_stage: &str,
        entry_node: &NodeId,
    ) -> Result<ConversationId, RepositoryError> {
        let mut store = self.store.write().await;
        let now = Utc::now();

        if let Some(id) = store.active_for(customer_id) {
            store.get_mut(id)?.last_updated = now;
            return Ok(id);
        }

        store.next_id += 1;
        let id = ConversationId(store.next_id);
        let state = ConversationState::new(customer_id.clone(), entry_node.clone(), default_stage);
        store
            .conversations
            .insert(id, StoredConversation { state, created_at: now, last_updated: now });
        Ok(id)
    }

    async fn find_active(
        &self,
        customer_id: &CustomerId,
    ) -> Result<Option<ConversationId>, RepositoryError> {
        Ok(self.store.read().await.active_for(customer_id))
    }

    async fn append_message(
        &self,
        id: ConversationId,
        role: MessageRole,
        content: &str,
    ) -> Result<ConversationMessage, RepositoryError> {
        let mut store = self.store.write().await;
        let stored = store.get_mut(id)?;

        let timestamp = next_timestamp(stored.state.messages.last().map(|m| m.timestamp));
        let message = ConversationMessage { role, content: content.to_string(), timestamp };
        stored.state.messages.push(message.clone());
        stored.last_updated = timestamp;
        Ok(message)
    }

    async fn load_state(
        &self,
        id: ConversationId,
    ) -> Result<Option<ConversationState>, RepositoryError> {
        Ok(self.store.read().await.conversations.get(&id).map(|stored| stored.state.clone()))
    }

    async fn save_state(
        &self,
        id: ConversationId,
        state: &ConversationState,
    ) -> Result<(), RepositoryError> {
        let mut store = self.store.write().await;
        if state.is_active {
            if let Some(active) = store.active_for(&state.customer_id) {
                if active != id {
                    return Err(RepositoryError::Conflict(format!(
                        "customer {} already has active conversation {active}",
                        state.customer_id
                    )));
                }
            }
        }

        let stored = store.get_mut(id)?;
        let already_stored = stored.state.messages.len();
        let new_messages = state.messages.iter().skip(already_stored).cloned().collect::<Vec<_>>();

        stored.state.current_node = state.current_node.clone();
        stored.state.pipeline_stage = state.pipeline_stage.clone();
        stored.state.context = state.context.clone();
        stored.state.is_active = state.is_active;
        stored.state.messages.extend(new_messages);
        stored.last_updated = Utc::now();
        Ok(())
    }

    async fn deactivate(&self, id: ConversationId) -> Result<(), RepositoryError> {
        let mut store = self.store.write().await;
        let stored = store.get_mut(id)?;
        stored.state.is_active = false;
        stored.last_updated = Utc::now();
        Ok(())
    }

    async fn history(
        &self,
        customer_id: &CustomerId,
    ) -> Result<Vec<ConversationSummary>, RepositoryError> {
        let store = self.store.read().await;
        let mut summaries = store
            .conversations
            .iter()
            .filter(|(_, stored)| &stored.state.customer_id == customer_id)
            .map(|(id, stored)| ConversationSummary {
                id: *id,
                customer_id: stored.state.customer_id.clone(),
                pipeline_stage: stored.state.pipeline_stage.clone(),
                current_node: stored.state.current_node.clone(),
                is_active: stored.state.is_active,
                created_at: stored.created_at,
                last_updated: stored.last_updated,
            })
            .collect::<Vec<_>>();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(summaries)
    }

    async fn stats(&self) -> Result<ConversationStats, RepositoryError> {
        let store = self.store.read().await;
        let mut customers = BTreeSet::new();
        let mut pipeline_breakdown = BTreeMap::new();
        let mut active_conversations = 0;

        for stored in store.conversations.values() {
            customers.insert(stored.state.customer_id.clone());
            if stored.state.is_active {
                active_conversations += 1;
                *pipeline_breakdown.entry(stored.state.pipeline_stage.clone()).or_insert(0) += 1;
            }
        }

        Ok(ConversationStats {
            unique_customers: customers.len() as i64,
            active_conversations,
            total_conversations: store.conversations.len() as i64,
            pipeline_breakdown,
        })
    }
}

#[cfg(test)]
mod tests {
    use leadflow_core::domain::conversation::{CustomerId, MessageRole};
    use leadflow_core::workflow::NodeId;

    use crate::repositories::{
        ConversationRepository, InMemoryConversationRepository, RepositoryError,
    };

    #[tokio::test]
    async fn in_memory_get_or_create_is_stable_until_concluded() {
        let repo = InMemoryConversationRepository::default();
        let customer = CustomerId("c1".to_string());
        let entry = NodeId::from("sms_handler");

        let first = repo.get_or_create(&customer, "New Lead", &entry).await.expect("create");
        let again = repo.get_or_create(&customer, "New Lead", &entry).await.expect("get");
        assert_eq!(first, again);

        repo.deactivate(first).await.expect("deactivate");
        let next = repo.get_or_create(&customer, "New Lead", &entry).await.expect("recreate");
        assert_ne!(first, next);
        assert_eq!(repo.history(&customer).await.expect("history")[0].id, next);
    }

    #[tokio::test]
    async fn in_memory_save_state_skips_already_stored_messages() {
        let repo = InMemoryConversationRepository::default();
        let customer = CustomerId("c1".to_string());
        let id = repo
            .get_or_create(&customer, "New Lead", &NodeId::from("sms_handler"))
            .await
            .expect("create");

        repo.append_message(id, MessageRole::Customer, "Hi").await.expect("append");
        let mut state = repo.load_state(id).await.expect("load").expect("exists");
        state.push_message(MessageRole::Agent, "Hello!");

        repo.save_state(id, &state).await.expect("save");
        repo.save_state(id, &state).await.expect("save again");

        let loaded = repo.load_state(id).await.expect("load").expect("exists");
        assert_eq!(loaded.messages.len(), 2);

        let stats = repo.stats().await.expect("stats");
        assert_eq!(stats.total_conversations, 1);
        assert_eq!(stats.pipeline_breakdown.get("New Lead"), Some(&1));
    }

    #[tokio::test]
    async fn in_memory_reactivation_beside_an_active_conversation_conflicts() {
        let repo = InMemoryConversationRepository::default();
        let customer = CustomerId("c1".to_string());
        let entry = NodeId::from("sms_handler");
        let concluded = repo.get_or_create(&customer, "New Lead", &entry).await.expect("create");
        let stale = repo.load_state(concluded).await.expect("load").expect("exists");
        repo.deactivate(concluded).await.expect("deactivate");
        repo.get_or_create(&customer, "New Lead", &entry).await.expect("recreate");

        let result = repo.save_state(concluded, &stale).await;

        assert!(matches!(result, Err(RepositoryError::Conflict(_))));
    }
}
