pub mod definition;
pub mod engine;
pub mod facts;

use thiserror::Error;

pub use definition::{
    Condition, GeneratorSettings, NodeId, NodeKind, Operator, Route, WorkflowGraph, WorkflowNode,
    DEFAULT_TEMPERATURE,
};
pub use engine::{condition_holds, evaluate_routes, Transition, TransitionKind, WorkflowEngine};
pub use facts::{apply_captures, FactMatcher, FactRule};

/// Errors in the workflow definition or in persisted state that no longer
/// matches it. Always fatal for the operation that hit them.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("could not read workflow definition `{path}`: {message}")]
    Read { path: String, message: String },
    #[error("could not parse workflow definition: {0}")]
    Parse(String),
    #[error("workflow node `{0}` is defined more than once")]
    DuplicateNode(NodeId),
    #[error("workflow has no entry node")]
    MissingEntry,
    #[error("workflow declares several entry nodes: {0:?}")]
    MultipleEntries(Vec<NodeId>),
    #[error("unknown workflow node `{node}` referenced by {referenced_by}")]
    UnknownNode { node: NodeId, referenced_by: String },
    #[error("invalid workflow node `{node}`: {reason}")]
    InvalidNode { node: NodeId, reason: String },
    #[error("invalid edge from `{from}`: {reason}")]
    InvalidEdge { from: NodeId, reason: String },
    #[error("routing from `{node}` visited {hops} nodes without producing a response")]
    RoutingCycle { node: NodeId, hops: usize },
}
