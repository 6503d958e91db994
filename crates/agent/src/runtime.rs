use std::sync::Arc;

use leadflow_core::audit::{AuditContext, AuditSink};
use leadflow_core::domain::conversation::{ConversationId, CustomerId, MessageRole};
use leadflow_core::errors::{ApplicationError, DomainError};
use leadflow_core::workflow::engine::TransitionKind;
use leadflow_core::workflow::facts::apply_captures;
use leadflow_core::workflow::{NodeId, NodeKind, WorkflowEngine, WorkflowError};
use leadflow_db::{ConversationRepository, RepositoryError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::prompt::{PromptError, PromptRenderer};
use crate::response::{ResponseGenerator, HISTORY_LIMIT};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub customer_id: String,
    pub message_text: String,
    #[serde(default)]
    pub pipeline_stage: Option<String>,
    #[serde(skip)]
    pub correlation_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub conversation_id: ConversationId,
    /// Empty when the step only routed (e.g. a decision stalled).
    pub reply_text: String,
    pub next_node: NodeId,
    pub pipeline_stage: String,
    pub concluded: bool,
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("malformed inbound message: {0}")]
    MalformedInput(String),
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error(transparent)]
    Prompt(#[from] PromptError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl From<RuntimeError> for ApplicationError {
    fn from(value: RuntimeError) -> Self {
        match value {
            RuntimeError::MalformedInput(message) => Self::MalformedInput(message),
            RuntimeError::Workflow(error) => Self::Domain(DomainError::Workflow(error)),
            RuntimeError::Prompt(error) => Self::Configuration(error.to_string()),
            RuntimeError::Repository(error) => Self::Persistence(error.to_string()),
        }
    }
}

/// Drives one workflow step per inbound customer message.
pub struct ConversationRuntime {
    engine: WorkflowEngine,
    prompts: PromptRenderer,
    generator: ResponseGenerator,
    repository: Arc<dyn ConversationRepository>,
    audit: Arc<dyn AuditSink>,
    default_stage: String,
}

impl ConversationRuntime {
    /// Fails if any prompt template in the graph does not compile.
    pub fn new(
        engine: WorkflowEngine,
        generator: ResponseGenerator,
        repository: Arc<dyn ConversationRepository>,
        audit: Arc<dyn AuditSink>,
        default_stage: impl Into<String>,
    ) -> Result<Self, RuntimeError> {
        let prompts = PromptRenderer::from_graph(engine.graph())?;
        Ok(Self {
            engine,
            prompts,
            generator,
            repository,
            audit,
            default_stage: default_stage.into(),
        })
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    pub async fn handle_inbound(
        &self,
        inbound: InboundMessage,
    ) -> Result<StepOutcome, RuntimeError> {
        let (customer_id, message_text) = validate_inbound(&inbound)?;
        let stage = inbound
            .pipeline_stage
            .as_deref()
            .map(str::trim)
            .filter(|stage| !stage.is_empty())
            .unwrap_or(self.default_stage.as_str());

        let conversation_id = self
            .repository
            .get_or_create(&customer_id, stage, self.engine.entry_node())
            .await?;
        let mut state = self
            .repository
            .load_state(conversation_id)
            .await?
            .ok_or(RepositoryError::NotFound(conversation_id))?;
        let audit = AuditContext::new(
            Some(conversation_id),
            Some(customer_id.clone()),
            inbound.correlation_id.clone(),
            "conversation_runtime",
        );

        state.push_message(MessageRole::Customer, message_text);

        let mut node_id = state.current_node.clone();
        let mut reply_text = String::new();
        let mut concluded = false;
        let mut hops = 0;

        loop {
            hops += 1;
            if hops > self.engine.graph().node_count() {
                return Err(WorkflowError::RoutingCycle { node: node_id, hops }.into());
            }

            let node = self.engine.node(&node_id).map_err(|error| {
                error!(
                    event_name = "conversation.step.unknown_node",
                    correlation_id = %inbound.correlation_id,
                    conversation_id = %conversation_id,
                    node_id = %node_id,
                    "conversation rests at a node the workflow does not define"
                );
                error
            })?;

            let captured = apply_captures(&node.captures, &mut state, message_text);
            if !captured.is_empty() {
                debug!(node_id = %node.id, facts = ?captured, "captured conversation facts");
            }
            if let Some(stage) = &node.pipeline_stage {
                state.pipeline_stage = stage.clone();
            }
            concluded |= node.concludes;

            if let NodeKind::ResponseGenerator(settings) = &node.kind {
                let system_prompt = self.prompts.system_prompt(&node.id, &state)?;
                reply_text = self
                    .generator
                    .generate(
                        &system_prompt,
                        state.history_window(HISTORY_LIMIT),
                        message_text,
                        &state.context,
                        settings.temperature,
                        settings.max_tokens,
                    )
                    .await;
                state.push_message(MessageRole::Agent, reply_text.clone());
            }

            let transition = self.engine.resolve_next_with_audit(
                &node.id,
                &state,
                self.audit.as_ref(),
                &audit,
            )?;
            state.current_node = transition.to.clone();

            let hands_off =
                matches!(transition.kind, TransitionKind::Edge | TransitionKind::Routed { .. });
            if matches!(node.kind, NodeKind::ResponseGenerator(_)) || !hands_off {
                break;
            }
            node_id = transition.to;
        }

        if concluded {
            state.is_active = false;
        }
        self.repository.save_state(conversation_id, &state).await?;

        info!(
            event_name = "conversation.step.completed",
            correlation_id = %inbound.correlation_id,
            customer_id = %customer_id,
            conversation_id = %conversation_id,
            node_id = %state.current_node,
            pipeline_stage = %state.pipeline_stage,
            replied = !reply_text.is_empty(),
            concluded,
            "conversation step completed"
        );

        Ok(StepOutcome {
            conversation_id,
            reply_text,
            next_node: state.current_node,
            pipeline_stage: state.pipeline_stage,
            concluded,
        })
    }
}

fn validate_inbound(inbound: &InboundMessage) -> Result<(CustomerId, &str), RuntimeError> {
    let customer_id = inbound.customer_id.trim();
    if customer_id.is_empty() {
        return Err(RuntimeError::MalformedInput("customer_id is required".to_string()));
    }
    let message_text = inbound.message_text.trim();
    if message_text.is_empty() {
        return Err(RuntimeError::MalformedInput("message_text is required".to_string()));
    }
    Ok((CustomerId(customer_id.to_string()), message_text))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use leadflow_core::audit::InMemoryAuditSink;
    use leadflow_core::domain::conversation::{CustomerId, MessageRole};
    use leadflow_core::errors::{ApplicationError, InterfaceError};
    use leadflow_core::workflow::{NodeId, WorkflowEngine, WorkflowError, WorkflowGraph};
    use leadflow_db::{ConversationRepository, InMemoryConversationRepository};
    use serde_json::json;

    use super::{ConversationRuntime, InboundMessage, RuntimeError};
    use crate::llm::{CompletionError, CompletionProvider, CompletionRequest};
    use crate::response::{ResponseGenerator, FALLBACK_REPLY};

    struct ScriptedProvider {
        delay: Duration,
    }

    #[async_trait]
    impl CompletionProvider for ScriptedProvider {
        async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
            tokio::time::sleep(self.delay).await;
            let system = &request.turns[0].content;
            if system.contains("booking") {
                Ok("Great, does Tuesday at 10am work for you?".to_string())
            } else {
                Ok("Happy to help! What kind of car do you have?".to_string())
            }
        }
    }

    fn graph() -> WorkflowGraph {
        let document = json!({
            "global_prompt": "You are a friendly assistant for a car detailing business.",
            "nodes": [
                {"id": "sms_handler", "type": "entry"},
                {"id": "sales_agent", "type": "response_generator",
                 "prompt": "Stage {{ pipeline_stage }}. Ask about the car."},
                {"id": "qualify", "type": "decision",
                 "captures": [{"fact": "car_condition", "keywords": ["sedan", "suv", "truck"]}],
                 "routes": [{"target": "booking", "field": "car_condition",
                             "operator": "equals", "value": true}]},
                {"id": "booking", "type": "response_generator",
                 "prompt": "Offer a booking slot.", "temperature": 0.7,
                 "pipeline_stage": "Qualified", "concludes": true}
            ],
            "edges": [
                {"source": "sms_handler", "target": "sales_agent"},
                {"source": "sales_agent", "target": "qualify"}
            ]
        });
        WorkflowGraph::from_json_str(&document.to_string()).expect("graph")
    }

    struct Harness {
        runtime: ConversationRuntime,
        repository: Arc<InMemoryConversationRepository>,
        audit: InMemoryAuditSink,
    }

    fn harness(provider_delay: Duration, timeout: Duration) -> Harness {
        let repository = Arc::new(InMemoryConversationRepository::default());
        let audit = InMemoryAuditSink::default();
        let provider = Arc::new(ScriptedProvider { delay: provider_delay });
        let generator = ResponseGenerator::new(provider, timeout, 150);
        let runtime = ConversationRuntime::new(
            WorkflowEngine::new(graph()),
            generator,
            repository.clone(),
            Arc::new(audit.clone()),
            "New Lead",
        )
        .expect("runtime");
        Harness { runtime, repository, audit }
    }

    fn default_harness() -> Harness {
        harness(Duration::ZERO, Duration::from_secs(1))
    }

    fn inbound(customer_id: &str, text: &str) -> InboundMessage {
        InboundMessage {
            customer_id: customer_id.to_string(),
            message_text: text.to_string(),
            pipeline_stage: None,
            correlation_id: "req-test".to_string(),
        }
    }

    #[tokio::test]
    async fn first_message_runs_entry_then_generator_and_persists_both_sides() {
        let harness = default_harness();

        let outcome = harness
            .runtime
            .handle_inbound(inbound("c1", "Hi, I need detailing"))
            .await
            .expect("step");

        assert!(!outcome.reply_text.is_empty());
        assert_eq!(outcome.next_node, NodeId::from("qualify"));
        assert_eq!(outcome.pipeline_stage, "New Lead");
        assert!(!outcome.concluded);

        let state = harness
            .repository
            .load_state(outcome.conversation_id)
            .await
            .expect("load")
            .expect("state");
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.messages[0].role, MessageRole::Customer);
        assert_eq!(state.messages[0].content, "Hi, I need detailing");
        assert_eq!(state.messages[1].role, MessageRole::Agent);
        assert_eq!(state.messages[1].content, outcome.reply_text);
        assert_eq!(state.current_node, NodeId::from("qualify"));

        let events = harness.audit.events();
        assert!(events.iter().all(|event| event.event_type == "workflow.transition_applied"));
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn provider_timeout_falls_back_but_still_advances() {
        let harness = harness(Duration::from_secs(5), Duration::from_millis(20));

        let outcome = harness
            .runtime
            .handle_inbound(inbound("c1", "Hi, I need detailing"))
            .await
            .expect("step");

        assert_eq!(outcome.reply_text, FALLBACK_REPLY);
        assert_eq!(outcome.next_node, NodeId::from("qualify"));
        let state = harness
            .repository
            .load_state(outcome.conversation_id)
            .await
            .expect("load")
            .expect("state");
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.messages[1].content, FALLBACK_REPLY);
    }

    #[tokio::test]
    async fn unmatched_decision_stalls_with_empty_reply() {
        let harness = default_harness();
        let first =
            harness.runtime.handle_inbound(inbound("c1", "Hi there")).await.expect("first");

        let second = harness
            .runtime
            .handle_inbound(inbound("c1", "Not sure yet"))
            .await
            .expect("second");

        assert_eq!(second.conversation_id, first.conversation_id);
        assert_eq!(second.reply_text, "");
        assert_eq!(second.next_node, NodeId::from("qualify"));
        let state = harness
            .repository
            .load_state(second.conversation_id)
            .await
            .expect("load")
            .expect("state");
        assert_eq!(state.messages.len(), 3);
        assert_eq!(state.fact("car_condition"), Some(&json!(false)));
        assert!(harness
            .audit
            .events()
            .iter()
            .any(|event| event.event_type == "workflow.transition_stalled"));
    }

    #[tokio::test]
    async fn qualifying_answer_promotes_stage_and_concludes() {
        let harness = default_harness();
        let first =
            harness.runtime.handle_inbound(inbound("c1", "Hi there")).await.expect("first");

        let booked = harness
            .runtime
            .handle_inbound(inbound("c1", "It's a muddy SUV"))
            .await
            .expect("booking");

        assert_eq!(booked.next_node, NodeId::from("booking"));
        assert_eq!(booked.pipeline_stage, "Qualified");
        assert!(booked.concluded);
        assert!(booked.reply_text.contains("Tuesday"));

        let customer = CustomerId("c1".to_string());
        assert_eq!(harness.repository.find_active(&customer).await.expect("find"), None);

        let next =
            harness.runtime.handle_inbound(inbound("c1", "One more thing")).await.expect("next");
        assert_ne!(next.conversation_id, first.conversation_id);
        assert_eq!(next.pipeline_stage, "New Lead");
    }

    #[tokio::test]
    async fn stale_node_is_reported_and_nothing_is_saved() {
        let harness = default_harness();
        let first =
            harness.runtime.handle_inbound(inbound("c1", "Hi there")).await.expect("first");
        let mut state = harness
            .repository
            .load_state(first.conversation_id)
            .await
            .expect("load")
            .expect("state");
        state.current_node = NodeId::from("retired_node");
        harness.repository.save_state(first.conversation_id, &state).await.expect("save");

        let result = harness.runtime.handle_inbound(inbound("c1", "Hello?")).await;

        assert!(matches!(
            result,
            Err(RuntimeError::Workflow(WorkflowError::UnknownNode { ref node, .. }))
                if node.as_str() == "retired_node"
        ));
        let state = harness
            .repository
            .load_state(first.conversation_id)
            .await
            .expect("load")
            .expect("state");
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.current_node, NodeId::from("retired_node"));
    }

    #[tokio::test]
    async fn malformed_input_never_creates_a_conversation() {
        let harness = default_harness();

        let missing_customer = harness.runtime.handle_inbound(inbound("  ", "Hi")).await;
        let missing_text = harness.runtime.handle_inbound(inbound("c1", "")).await;

        assert!(matches!(missing_customer, Err(RuntimeError::MalformedInput(_))));
        assert!(matches!(missing_text, Err(RuntimeError::MalformedInput(_))));
        assert_eq!(harness.repository.stats().await.expect("stats").total_conversations, 0);
    }

    #[tokio::test]
    async fn pipeline_stage_override_applies_to_new_conversations() {
        let harness = default_harness();
        let mut message = inbound("c2", "Hello");
        message.pipeline_stage = Some("Referral".to_string());

        let outcome = harness.runtime.handle_inbound(message).await.expect("step");

        assert_eq!(outcome.pipeline_stage, "Referral");
    }

    #[tokio::test]
    async fn routing_loop_without_a_generator_is_a_cycle_and_saves_nothing() {
        let looping = WorkflowGraph::from_json_str(
            &json!({
                "nodes": [
                    {"id": "start", "type": "entry"},
                    {"id": "decide", "type": "decision", "routes": [{"target": "start"}]}
                ],
                "edges": [{"source": "start", "target": "decide"}]
            })
            .to_string(),
        )
        .expect("graph");
        let repository = Arc::new(InMemoryConversationRepository::default());
        let provider = Arc::new(ScriptedProvider { delay: Duration::ZERO });
        let runtime = ConversationRuntime::new(
            WorkflowEngine::new(looping),
            ResponseGenerator::new(provider, Duration::from_secs(1), 150),
            repository.clone(),
            Arc::new(InMemoryAuditSink::default()),
            "New Lead",
        )
        .expect("runtime");

        let result = runtime.handle_inbound(inbound("c1", "Hello")).await;

        assert!(matches!(result, Err(RuntimeError::Workflow(WorkflowError::RoutingCycle { .. }))));
        let customer = CustomerId("c1".to_string());
        let conversation_id =
            repository.find_active(&customer).await.expect("find").expect("conversation");
        let state =
            repository.load_state(conversation_id).await.expect("load").expect("state");
        assert!(state.messages.is_empty());
        assert_eq!(state.current_node, NodeId::from("start"));
    }

    #[test]
    fn runtime_errors_map_to_interface_errors() {
        let malformed: ApplicationError =
            RuntimeError::MalformedInput("customer_id is required".to_string()).into();
        assert!(matches!(malformed.into_interface("req-1"), InterfaceError::BadRequest { .. }));

        let workflow: ApplicationError = RuntimeError::Workflow(WorkflowError::UnknownNode {
            node: NodeId::from("ghost"),
            referenced_by: "conversation state".to_string(),
        })
        .into();
        assert!(matches!(workflow.into_interface("req-2"), InterfaceError::Internal { .. }));
    }
}
