use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use leadflow_core::domain::conversation::{
    next_timestamp, ConversationContext, ConversationId, ConversationMessage, ConversationState,
    ConversationStats, ConversationSummary, CustomerId, MessageRole,
};
use leadflow_core::workflow::NodeId;

use super::{ConversationRepository, RepositoryError};
use crate::DbPool;

pub struct SqlConversationRepository {
    pool: DbPool,
}

impl SqlConversationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConversationRepository for SqlConversationRepository {
    async fn get_or_create(
        &self,
        customer_id: &CustomerId,
        default_stage: &str,
        entry_node: &NodeId,
    ) -> Result<ConversationId, RepositoryError> {
        let now = format_timestamp(Utc::now());
        let mut tx = self.pool.begin().await?;

        // The partial unique index turns a racing second insert into a no-op.
        sqlx::query(
            "INSERT OR IGNORE INTO conversation (
                customer_id, pipeline_stage, current_node, context_json, is_active,
                created_at, last_updated
             ) VALUES (?, ?, ?, '{}', 1, ?, ?)",
        )
        .bind(&customer_id.0)
        .bind(default_stage)
        .bind(entry_node.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        let id: i64 = sqlx::query_scalar(
            "SELECT id FROM conversation WHERE customer_id = ? AND is_active = 1",
        )
        .bind(&customer_id.0)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("UPDATE conversation SET last_updated = ? WHERE id = ?")
            .bind(&now)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(ConversationId(id))
    }

    async fn find_active(
        &self,
        customer_id: &CustomerId,
    ) -> Result<Option<ConversationId>, RepositoryError> {
        let id: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM conversation WHERE customer_id = ? AND is_active = 1",
        )
        .bind(&customer_id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(id.map(ConversationId))
    }

    async fn append_message(
        &self,
        id: ConversationId,
        role: MessageRole,
        content: &str,
    ) -> Result<ConversationMessage, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM conversation WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(RepositoryError::NotFound(id));
        }

        let last = sqlx::query(
            "SELECT seq, created_at FROM conversation_message
             WHERE conversation_id = ?
             ORDER BY seq DESC
             LIMIT 1",
        )
        .bind(id.0)
        .fetch_optional(&mut *tx)
        .await?;
        let (seq, previous) = match last {
            Some(row) => {
                let seq: i64 = row.try_get("seq")?;
                let created_at = parse_timestamp("created_at", row.try_get("created_at")?)?;
                (seq + 1, Some(created_at))
            }
            None => (0, None),
        };

        let message = ConversationMessage {
            role,
            content: content.to_string(),
            timestamp: next_timestamp(previous),
        };
        insert_message(&mut tx, id, seq, &message).await?;

        sqlx::query("UPDATE conversation SET last_updated = ? WHERE id = ?")
            .bind(format_timestamp(message.timestamp))
            .bind(id.0)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(message)
    }

    async fn load_state(
        &self,
        id: ConversationId,
    ) -> Result<Option<ConversationState>, RepositoryError> {
        let Some(row) = sqlx::query(
            "SELECT customer_id, pipeline_stage, current_node, context_json, is_active
             FROM conversation
             WHERE id = ?",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let context_json: String = row.try_get("context_json")?;
        let context = serde_json::from_str::<ConversationContext>(&context_json).map_err(|e| {
            RepositoryError::Decode(format!("invalid context for conversation {id}: {e}"))
        })?;

        let messages = sqlx::query(
            "SELECT role, content, created_at FROM conversation_message
             WHERE conversation_id = ?
             ORDER BY seq ASC",
        )
        .bind(id.0)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(message_from_row)
        .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(ConversationState {
            customer_id: CustomerId(row.try_get("customer_id")?),
            current_node: NodeId(row.try_get("current_node")?),
            pipeline_stage: row.try_get("pipeline_stage")?,
            context,
            messages,
            is_active: row.try_get::<i64, _>("is_active")? != 0,
        }))
    }

    async fn save_state(
        &self,
        id: ConversationId,
        state: &ConversationState,
    ) -> Result<(), RepositoryError> {
        let context_json = serde_json::to_string(&state.context)
            .map_err(|e| RepositoryError::Decode(format!("unserializable context: {e}")))?;
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE conversation
             SET current_node = ?, pipeline_stage = ?, context_json = ?, is_active = ?,
                 last_updated = ?
             WHERE id = ?",
        )
        .bind(state.current_node.as_str())
        .bind(&state.pipeline_stage)
        .bind(&context_json)
        .bind(i64::from(state.is_active))
        .bind(format_timestamp(Utc::now()))
        .bind(id.0)
        .execute(&mut *tx)
        .await
        .map_err(|error| match error {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                RepositoryError::Conflict(format!(
                    "customer {} already has another active conversation",
                    state.customer_id
                ))
            }
            other => RepositoryError::Database(other),
        })?;
        if updated.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(id));
        }

        let stored: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM conversation_message WHERE conversation_id = ?",
        )
        .bind(id.0)
        .fetch_one(&mut *tx)
        .await?;
        let stored = usize::try_from(stored).unwrap_or(0);

        for (seq, message) in state.messages.iter().enumerate().skip(stored) {
            let seq = i64::try_from(seq)
                .map_err(|_| RepositoryError::Decode(format!("message index {seq} overflows")))?;
            insert_message(&mut tx, id, seq, message).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn deactivate(&self, id: ConversationId) -> Result<(), RepositoryError> {
        let updated =
            sqlx::query("UPDATE conversation SET is_active = 0, last_updated = ? WHERE id = ?")
                .bind(format_timestamp(Utc::now()))
                .bind(id.0)
                .execute(&self.pool)
                .await?;
        if updated.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(id));
        }
        Ok(())
    }

    async fn history(
        &self,
        customer_id: &CustomerId,
    ) -> Result<Vec<ConversationSummary>, RepositoryError> {
        sqlx::query(
            "SELECT id, customer_id, pipeline_stage, current_node, is_active, created_at,
                    last_updated
             FROM conversation
             WHERE customer_id = ?
             ORDER BY created_at DESC, id DESC",
        )
        .bind(&customer_id.0)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(summary_from_row)
        .collect()
    }

    async fn stats(&self) -> Result<ConversationStats, RepositoryError> {
        let totals = sqlx::query(
            "SELECT COUNT(DISTINCT customer_id) AS unique_customers,
                    COALESCE(SUM(is_active), 0) AS active_conversations,
                    COUNT(*) AS total_conversations
             FROM conversation",
        )
        .fetch_one(&self.pool)
        .await?;

        let pipeline_breakdown = sqlx::query(
            "SELECT pipeline_stage, COUNT(*) AS conversations
             FROM conversation
             WHERE is_active = 1
             GROUP BY pipeline_stage",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| -> Result<(String, i64), RepositoryError> {
            Ok((row.try_get("pipeline_stage")?, row.try_get("conversations")?))
        })
        .collect::<Result<BTreeMap<_, _>, _>>()?;

        Ok(ConversationStats {
            unique_customers: totals.try_get("unique_customers")?,
            active_conversations: totals.try_get("active_conversations")?,
            total_conversations: totals.try_get("total_conversations")?,
            pipeline_breakdown,
        })
    }
}

async fn insert_message(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    id: ConversationId,
    seq: i64,
    message: &ConversationMessage,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT OR IGNORE INTO conversation_message (
            conversation_id, seq, role, content, created_at
         ) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(id.0)
    .bind(seq)
    .bind(message.role.as_str())
    .bind(&message.content)
    .bind(format_timestamp(message.timestamp))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn message_from_row(row: SqliteRow) -> Result<ConversationMessage, RepositoryError> {
    let role_raw = row.try_get::<String, _>("role")?;
    let role = role_raw.parse::<MessageRole>().map_err(RepositoryError::Decode)?;

    Ok(ConversationMessage {
        role,
        content: row.try_get("content")?,
        timestamp: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

fn summary_from_row(row: SqliteRow) -> Result<ConversationSummary, RepositoryError> {
    Ok(ConversationSummary {
        id: ConversationId(row.try_get("id")?),
        customer_id: CustomerId(row.try_get("customer_id")?),
        pipeline_stage: row.try_get("pipeline_stage")?,
        current_node: NodeId(row.try_get("current_node")?),
        is_active: row.try_get::<i64, _>("is_active")? != 0,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        last_updated: parse_timestamp("last_updated", row.try_get("last_updated")?)?,
    })
}

// Fixed-width UTC so stored timestamps sort lexically.
fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|value| value.with_timezone(&Utc)).map_err(|error| {
        RepositoryError::Decode(format!("invalid timestamp in `{column}`: {value} ({error})"))
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use leadflow_core::domain::conversation::{CustomerId, MessageRole};
    use leadflow_core::workflow::NodeId;

    use super::SqlConversationRepository;
    use crate::repositories::{ConversationRepository, RepositoryError};
    use crate::{connect_with_settings, migrations};

    async fn repository() -> SqlConversationRepository {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        SqlConversationRepository::new(pool)
    }

    fn customer(id: &str) -> CustomerId {
        CustomerId(id.to_string())
    }

    fn entry() -> NodeId {
        NodeId::from("sms_handler")
    }

    #[tokio::test]
    async fn get_or_create_returns_the_same_active_conversation() {
        let repo = repository().await;

        let first =
            repo.get_or_create(&customer("c1"), "New Lead", &entry()).await.expect("create");
        let second = repo.get_or_create(&customer("c1"), "New Lead", &entry()).await.expect("get");
        let other =
            repo.get_or_create(&customer("c2"), "New Lead", &entry()).await.expect("other");

        assert_eq!(first, second);
        assert_ne!(first, other);

        let state = repo.load_state(first).await.expect("load").expect("state exists");
        assert_eq!(state.current_node, entry());
        assert_eq!(state.pipeline_stage, "New Lead");
        assert!(state.is_active);
        assert!(state.messages.is_empty());
    }

    #[tokio::test]
    async fn deactivated_conversation_is_replaced_on_next_contact() {
        let repo = repository().await;
        let first =
            repo.get_or_create(&customer("c1"), "New Lead", &entry()).await.expect("create");

        repo.deactivate(first).await.expect("deactivate");
        assert_eq!(repo.find_active(&customer("c1")).await.expect("find"), None);

        let second = repo.get_or_create(&customer("c1"), "New Lead", &entry()).await.expect("new");
        assert_ne!(first, second);
        assert_eq!(repo.find_active(&customer("c1")).await.expect("find"), Some(second));

        let history = repo.history(&customer("c1")).await.expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, second);
        assert!(history[0].is_active);
        assert!(!history[1].is_active);
    }

    #[tokio::test]
    async fn reactivating_beside_an_active_conversation_is_a_conflict() {
        let repo = repository().await;
        let concluded =
            repo.get_or_create(&customer("c1"), "New Lead", &entry()).await.expect("create");
        let stale = repo.load_state(concluded).await.expect("load").expect("state");
        repo.deactivate(concluded).await.expect("deactivate");
        let current = repo.get_or_create(&customer("c1"), "New Lead", &entry()).await.expect("new");

        let result = repo.save_state(concluded, &stale).await;

        assert!(matches!(result, Err(RepositoryError::Conflict(_))));
        assert_eq!(repo.find_active(&customer("c1")).await.expect("find"), Some(current));
    }

    #[tokio::test]
    async fn append_message_orders_transcript_with_non_decreasing_timestamps() {
        let repo = repository().await;
        let id = repo.get_or_create(&customer("c1"), "New Lead", &entry()).await.expect("create");

        repo.append_message(id, MessageRole::Customer, "Hi, I need detailing").await.expect("m1");
        repo.append_message(id, MessageRole::Agent, "Happy to help!").await.expect("m2");

        let state = repo.load_state(id).await.expect("load").expect("state exists");
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.messages[0].role, MessageRole::Customer);
        assert_eq!(state.messages[1].content, "Happy to help!");
        assert!(state.messages[1].timestamp >= state.messages[0].timestamp);
    }

    #[tokio::test]
    async fn save_state_is_idempotent_for_messages() {
        let repo = repository().await;
        let id = repo.get_or_create(&customer("c1"), "New Lead", &entry()).await.expect("create");
        let mut state = repo.load_state(id).await.expect("load").expect("state exists");

        state.push_message(MessageRole::Customer, "Hi");
        repo.save_state(id, &state).await.expect("save 1");
        repo.save_state(id, &state).await.expect("save 1 again");

        state.push_message(MessageRole::Agent, "Hello! What car do you drive?");
        state.push_message(MessageRole::Customer, "A 2019 Civic with muddy seats");
        state.current_node = NodeId::from("qualify");
        state.pipeline_stage = "Qualified".to_string();
        state.set_fact("has_car_condition", json!(true));
        repo.save_state(id, &state).await.expect("save 2");
        repo.save_state(id, &state).await.expect("save 2 again");

        let loaded = repo.load_state(id).await.expect("load").expect("state exists");
        assert_eq!(loaded.messages.len(), 3);
        assert_eq!(loaded.current_node, NodeId::from("qualify"));
        assert_eq!(loaded.pipeline_stage, "Qualified");
        assert_eq!(loaded.fact("has_car_condition"), Some(&json!(true)));
        assert_eq!(loaded.messages[2].content, "A 2019 Civic with muddy seats");
    }

    #[tokio::test]
    async fn missing_conversation_is_reported() {
        let repo = repository().await;
        let missing = leadflow_core::ConversationId(999);

        assert!(repo.load_state(missing).await.expect("load").is_none());
        assert!(matches!(
            repo.append_message(missing, MessageRole::Customer, "hi").await,
            Err(RepositoryError::NotFound(_))
        ));
        let state = leadflow_core::ConversationState::new(customer("c9"), entry(), "New Lead");
        let saved = repo.save_state(missing, &state).await;
        assert!(matches!(saved, Err(RepositoryError::NotFound(_))));
        assert!(matches!(repo.deactivate(missing).await, Err(RepositoryError::NotFound(_))));
    }

    #[tokio::test]
    async fn stats_aggregate_customers_and_active_stages() {
        let repo = repository().await;
        let c1 = repo.get_or_create(&customer("c1"), "New Lead", &entry()).await.expect("c1");
        repo.deactivate(c1).await.expect("deactivate");
        repo.get_or_create(&customer("c1"), "New Lead", &entry()).await.expect("c1 again");
        let c2 = repo.get_or_create(&customer("c2"), "New Lead", &entry()).await.expect("c2");

        let mut state = repo.load_state(c2).await.expect("load").expect("state exists");
        state.pipeline_stage = "Qualified".to_string();
        repo.save_state(c2, &state).await.expect("save");

        let stats = repo.stats().await.expect("stats");
        assert_eq!(stats.unique_customers, 2);
        assert_eq!(stats.active_conversations, 2);
        assert_eq!(stats.total_conversations, 3);
        assert_eq!(stats.pipeline_breakdown.get("New Lead"), Some(&1));
        assert_eq!(stats.pipeline_breakdown.get("Qualified"), Some(&1));
    }
}
