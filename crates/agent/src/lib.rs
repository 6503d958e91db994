//! Conversation runtime for the SMS sales assistant.
//!
//! One inbound customer message drives one workflow step:
//! 1. **State** - load or open the customer's conversation (`leadflow-db`)
//! 2. **Routing** - capture facts and walk the workflow graph (`leadflow-core`)
//! 3. **Generation** - render the node prompt (`prompt`) and ask the completion
//!    provider for a reply (`response`, `llm`)
//! 4. **Persistence** - save the new resting node, stage, facts and transcript
//!
//! # Safety Principle
//!
//! The completion provider only words the reply. Which node the conversation
//! rests at, which stage it is in, and what gets persisted are decided by the
//! workflow graph, never by model output. Provider failures degrade to a fixed
//! fallback reply and never block the state transition.

pub mod llm;
pub mod prompt;
pub mod response;
pub mod runtime;

pub use llm::{
    ChatTurn, CompletionError, CompletionErrorKind, CompletionProvider, CompletionRequest,
    OpenAiCompatibleClient, TurnRole,
};
pub use prompt::{PromptError, PromptRenderer};
pub use response::{ResponseGenerator, FALLBACK_REPLY};
pub use runtime::{ConversationRuntime, InboundMessage, RuntimeError, StepOutcome};
