pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod workflow;

pub use audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
pub use domain::conversation::{
    ConversationContext, ConversationId, ConversationMessage, ConversationState,
    ConversationStats, ConversationSummary, CustomerId, MessageRole,
};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use workflow::{NodeId, NodeKind, WorkflowEngine, WorkflowError, WorkflowGraph, WorkflowNode};
