use leadflow_core::domain::conversation::ConversationState;
use leadflow_core::workflow::{NodeId, NodeKind, WorkflowGraph};
use tera::{Context, Tera};
use thiserror::Error;

const GLOBAL_TEMPLATE: &str = "__global__";

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("prompt template `{name}` is invalid: {message}")]
    Template { name: String, message: String },
    #[error("prompt template `{name}` failed to render: {message}")]
    Render { name: String, message: String },
    #[error("node `{0}` has no prompt template")]
    MissingTemplate(NodeId),
}

/// Compiled global and per-node prompt templates.
///
/// Templates see `pipeline_stage`, `current_node`, `customer_id` and `facts`
/// (the conversation context).
pub struct PromptRenderer {
    tera: Tera,
    has_global: bool,
}

impl PromptRenderer {
    pub fn from_graph(graph: &WorkflowGraph) -> Result<Self, PromptError> {
        let mut tera = Tera::default();
        let has_global = !graph.global_prompt().trim().is_empty();
        if has_global {
            register(&mut tera, GLOBAL_TEMPLATE, graph.global_prompt())?;
        }
        for node in graph.nodes() {
            if let NodeKind::ResponseGenerator(settings) = &node.kind {
                register(&mut tera, node.id.as_str(), &settings.prompt)?;
            }
        }
        Ok(Self { tera, has_global })
    }

    /// Global prompt followed by the node's own prompt.
    pub fn system_prompt(
        &self,
        node: &NodeId,
        state: &ConversationState,
    ) -> Result<String, PromptError> {
        if !self.tera.get_template_names().any(|name| name == node.as_str()) {
            return Err(PromptError::MissingTemplate(node.clone()));
        }
        let context = template_context(node, state);

        let node_prompt = self.render(node.as_str(), &context)?;
        if !self.has_global {
            return Ok(node_prompt);
        }
        let global_prompt = self.render(GLOBAL_TEMPLATE, &context)?;
        Ok(format!("{}\n\n{}", global_prompt.trim_end(), node_prompt.trim()))
    }

    fn render(&self, name: &str, context: &Context) -> Result<String, PromptError> {
        self.tera.render(name, context).map_err(|error| PromptError::Render {
            name: name.to_string(),
            message: error_chain(&error),
        })
    }
}

fn register(tera: &mut Tera, name: &str, source: &str) -> Result<(), PromptError> {
    tera.add_raw_template(name, source).map_err(|error| PromptError::Template {
        name: name.to_string(),
        message: error_chain(&error),
    })
}

fn template_context(node: &NodeId, state: &ConversationState) -> Context {
    let mut context = Context::new();
    context.insert("pipeline_stage", &state.pipeline_stage);
    context.insert("current_node", node.as_str());
    context.insert("customer_id", &state.customer_id.0);
    context.insert("facts", &state.context);
    context
}

// tera nests the useful detail (e.g. the undefined variable) in `source()`.
fn error_chain(error: &tera::Error) -> String {
    let mut message = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
