use serde_json::Value;

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::domain::conversation::ConversationState;
use crate::workflow::definition::{
    Condition, NodeId, NodeKind, Operator, Route, WorkflowGraph, WorkflowNode,
};
use crate::workflow::WorkflowError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransitionKind {
    /// Followed the node's single outgoing edge.
    Edge,
    Routed { route_index: usize },
    /// Decision node with no matching route; the conversation waits here.
    Stalled,
    /// No outgoing edge; the node is its own resting place.
    Terminal,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub from: NodeId,
    pub to: NodeId,
    pub kind: TransitionKind,
}

impl Transition {
    pub fn moved(&self) -> bool {
        self.from != self.to
    }
}

pub struct WorkflowEngine {
    graph: WorkflowGraph,
}

impl WorkflowEngine {
    pub fn new(graph: WorkflowGraph) -> Self {
        Self { graph }
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    pub fn entry_node(&self) -> &NodeId {
        self.graph.entry()
    }

    pub fn node(&self, id: &NodeId) -> Result<&WorkflowNode, WorkflowError> {
        self.graph.node(id)
    }

    /// Next resting node after `node` has executed against `state`.
    pub fn resolve_next(
        &self,
        node: &NodeId,
        state: &ConversationState,
    ) -> Result<Transition, WorkflowError> {
        let current = self.graph.node(node)?;
        let (to, kind) = match &current.kind {
            NodeKind::Decision { routes } => match evaluate_routes(routes, state) {
                Some((route_index, route)) => {
                    (route.target.clone(), TransitionKind::Routed { route_index })
                }
                None => (current.id.clone(), TransitionKind::Stalled),
            },
            NodeKind::Entry | NodeKind::ResponseGenerator(_) => {
                match self.graph.successor(&current.id) {
                    Some(next) => (next.clone(), TransitionKind::Edge),
                    None => (current.id.clone(), TransitionKind::Terminal),
                }
            }
        };

        Ok(Transition { from: current.id.clone(), to, kind })
    }

    pub fn resolve_next_with_audit<S>(
        &self,
        node: &NodeId,
        state: &ConversationState,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<Transition, WorkflowError>
    where
        S: AuditSink + ?Sized,
    {
        let result = self.resolve_next(node, state);
        match &result {
            Ok(transition) => {
                let (event_type, outcome) = match transition.kind {
                    TransitionKind::Stalled => {
                        ("workflow.transition_stalled", AuditOutcome::Rejected)
                    }
                    _ => ("workflow.transition_applied", AuditOutcome::Success),
                };
                sink.emit(
                    AuditEvent::from_context(audit, event_type, AuditCategory::Workflow, outcome)
                        .with_metadata("from", transition.from.to_string())
                        .with_metadata("to", transition.to.to_string())
                        .with_metadata("kind", format!("{:?}", transition.kind))
                        .with_metadata("pipeline_stage", state.pipeline_stage.clone()),
                );
            }
            Err(error) => {
                sink.emit(
                    AuditEvent::from_context(
                        audit,
                        "workflow.transition_failed",
                        AuditCategory::Workflow,
                        AuditOutcome::Failed,
                    )
                    .with_metadata("from", node.to_string())
                    .with_metadata("error", error.to_string()),
                );
            }
        }
        result
    }
}

/// First route whose conditions all hold, in declaration order.
pub fn evaluate_routes<'a>(
    routes: &'a [Route],
    state: &ConversationState,
) -> Option<(usize, &'a Route)> {
    routes
        .iter()
        .enumerate()
        .find(|(_, route)| {
            route.conditions.iter().all(|condition| condition_holds(condition, state))
        })
}

/// A field absent from the routing view never satisfies a condition.
pub fn condition_holds(condition: &Condition, state: &ConversationState) -> bool {
    let Some(actual) = state.routing_value(&condition.field) else {
        return false;
    };
    match condition.operator {
        Operator::Equals => stringify(&actual) == stringify(&condition.value),
        Operator::GreaterThan => match (as_number(&actual), as_number(&condition.value)) {
            (Some(actual), Some(expected)) => actual > expected,
            _ => false,
        },
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{condition_holds, TransitionKind, WorkflowEngine};
    use crate::audit::{AuditContext, AuditOutcome, InMemoryAuditSink};
    use crate::domain::conversation::{ConversationState, CustomerId};
    use crate::workflow::{Condition, NodeId, Operator, WorkflowError, WorkflowGraph};

    fn engine(routes: serde_json::Value) -> WorkflowEngine {
        let document = json!({
            "nodes": [
                {"id": "start", "type": "entry"},
                {"id": "decide", "type": "decision", "routes": routes},
                {"id": "B", "type": "response_generator", "prompt": "Book them in."}
            ],
            "edges": [{"source": "start", "target": "decide"}]
        });
        let graph = WorkflowGraph::from_json_str(&document.to_string()).expect("graph should load");
        WorkflowEngine::new(graph)
    }

    fn state_with(key: &str, value: serde_json::Value) -> ConversationState {
        let customer = CustomerId("c1".to_string());
        let mut state = ConversationState::new(customer, NodeId::from("decide"), "New Lead");
        state.set_fact(key, value);
        state
    }

    fn condition(field: &str, operator: Operator, value: serde_json::Value) -> Condition {
        Condition { field: field.to_string(), operator, value }
    }

    #[test]
    fn matching_route_moves_to_its_target() {
        let engine = engine(json!([
            {"field": "has_detail", "operator": "equals", "value": true, "target": "B"}
        ]));

        let transition = engine
            .resolve_next(&NodeId::from("decide"), &state_with("has_detail", json!(true)))
            .expect("transition");

        assert_eq!(transition.to, NodeId::from("B"));
        assert_eq!(transition.kind, TransitionKind::Routed { route_index: 0 });
        assert!(transition.moved());
    }

    #[test]
    fn no_matching_route_stays_at_decision_node() {
        let engine = engine(json!([
            {"field": "has_detail", "operator": "equals", "value": true, "target": "B"}
        ]));

        let transition = engine
            .resolve_next(&NodeId::from("decide"), &state_with("has_detail", json!(false)))
            .expect("transition");

        assert_eq!(transition.to, NodeId::from("decide"));
        assert_eq!(transition.kind, TransitionKind::Stalled);
        assert!(!transition.moved());
    }

    #[test]
    fn first_matching_route_wins_and_empty_route_is_a_default() {
        let engine = engine(json!([
            {"target": "start", "conditions": [
                {"field": "score", "operator": "greater than", "value": 5},
                {"field": "has_detail", "operator": "equals", "value": true}
            ]},
            {"target": "B"}
        ]));
        let mut state = state_with("score", json!(9));

        let transition = engine.resolve_next(&NodeId::from("decide"), &state).expect("transition");
        assert_eq!(transition.kind, TransitionKind::Routed { route_index: 1 });

        state.set_fact("has_detail", json!(true));
        let transition = engine.resolve_next(&NodeId::from("decide"), &state).expect("transition");
        assert_eq!(transition.to, NodeId::from("start"));
    }

    #[test]
    fn edges_and_terminal_nodes_resolve_without_routes() {
        let engine = engine(json!([{"target": "B"}]));
        let state = state_with("x", json!(1));

        let entry = engine.resolve_next(&NodeId::from("start"), &state).expect("entry");
        assert_eq!((entry.to.as_str(), entry.kind), ("decide", TransitionKind::Edge));

        let terminal = engine.resolve_next(&NodeId::from("B"), &state).expect("terminal");
        assert_eq!((terminal.to.as_str(), terminal.kind), ("B", TransitionKind::Terminal));
    }

    #[test]
    fn unknown_current_node_is_a_configuration_error() {
        let engine = engine(json!([{"target": "B"}]));

        let error = engine
            .resolve_next(&NodeId::from("retired"), &state_with("x", json!(1)))
            .expect_err("unknown node");

        assert!(matches!(error, WorkflowError::UnknownNode { .. }));
    }

    #[test]
    fn equals_compares_stringified_values() {
        let state = state_with("visits", json!(3));

        assert!(condition_holds(&condition("visits", Operator::Equals, json!("3")), &state));
        assert!(condition_holds(
            &condition("pipeline_stage", Operator::Equals, json!("New Lead")),
            &state
        ));
        assert!(!condition_holds(&condition("missing", Operator::Equals, json!("")), &state));
    }

    #[test]
    fn greater_than_is_numeric_and_missing_fields_never_match() {
        let state = state_with("quote_total", json!("250.5"));

        let above = condition("quote_total", Operator::GreaterThan, json!(200));
        let below = condition("quote_total", Operator::GreaterThan, json!(300));
        assert!(condition_holds(&above, &state));
        assert!(!condition_holds(&below, &state));
        assert!(!condition_holds(&condition("absent", Operator::GreaterThan, json!(0)), &state));
        assert!(!condition_holds(
            &condition("customer_id", Operator::GreaterThan, json!(0)),
            &state
        ));
    }

    #[test]
    fn audited_resolution_records_stalls_and_moves() {
        let engine = engine(json!([
            {"field": "has_detail", "operator": "equals", "value": true, "target": "B"}
        ]));
        let sink = InMemoryAuditSink::default();
        let audit = AuditContext::new(None, Some(CustomerId("c1".to_string())), "req-1", "runtime");

        engine
            .resolve_next_with_audit(
                &NodeId::from("decide"),
                &state_with("has_detail", json!(false)),
                &sink,
                &audit,
            )
            .expect("stall");
        engine
            .resolve_next_with_audit(
                &NodeId::from("decide"),
                &state_with("has_detail", json!(true)),
                &sink,
                &audit,
            )
            .expect("move");

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "workflow.transition_stalled");
        assert_eq!(events[0].outcome, AuditOutcome::Rejected);
        assert_eq!(events[1].event_type, "workflow.transition_applied");
        assert_eq!(events[1].metadata.get("to").map(String::as_str), Some("B"));
        assert_eq!(events[1].correlation_id, "req-1");
    }
}
