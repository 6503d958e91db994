use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::facts::FactRule;
use super::WorkflowError;

pub const DEFAULT_TEMPERATURE: f32 = 0.2;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "equals")]
    Equals,
    #[serde(rename = "greater than", alias = "greater_than")]
    GreaterThan,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    pub value: Value,
}

/// A conditional edge out of a decision node. Matches when every condition
/// holds; an empty condition list always matches.
#[derive(Clone, Debug, PartialEq)]
pub struct Route {
    pub target: NodeId,
    pub conditions: Vec<Condition>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GeneratorSettings {
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum NodeKind {
    Entry,
    Decision { routes: Vec<Route> },
    ResponseGenerator(GeneratorSettings),
}

impl NodeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Decision { .. } => "decision",
            Self::ResponseGenerator(_) => "response_generator",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct WorkflowNode {
    pub id: NodeId,
    pub kind: NodeKind,
    pub captures: Vec<FactRule>,
    /// Stage the conversation is promoted to when this node executes.
    pub pipeline_stage: Option<String>,
    pub concludes: bool,
}

/// Immutable node graph, loaded once at startup.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkflowGraph {
    global_prompt: String,
    entry: NodeId,
    nodes: BTreeMap<NodeId, WorkflowNode>,
    edges: BTreeMap<NodeId, NodeId>,
}

impl WorkflowGraph {
    pub fn load(path: &Path) -> Result<Self, WorkflowError> {
        let raw = fs::read_to_string(path).map_err(|error| WorkflowError::Read {
            path: path.display().to_string(),
            message: error.to_string(),
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, WorkflowError> {
        let document: WorkflowDocument =
            serde_json::from_str(raw).map_err(|error| WorkflowError::Parse(error.to_string()))?;
        Self::from_document(document)
    }

    fn from_document(document: WorkflowDocument) -> Result<Self, WorkflowError> {
        let mut nodes = BTreeMap::new();
        for node_document in document.nodes {
            let node = node_document.into_node()?;
            if nodes.contains_key(&node.id) {
                return Err(WorkflowError::DuplicateNode(node.id));
            }
            nodes.insert(node.id.clone(), node);
        }

        let entries = nodes
            .values()
            .filter(|node| matches!(node.kind, NodeKind::Entry))
            .map(|node| node.id.clone())
            .collect::<Vec<_>>();
        let entry = match entries.as_slice() {
            [] => return Err(WorkflowError::MissingEntry),
            [entry] => entry.clone(),
            _ => return Err(WorkflowError::MultipleEntries(entries)),
        };

        let mut edges = BTreeMap::new();
        for edge in document.edges {
            let from = NodeId(edge.source);
            let to = NodeId(edge.target);
            let Some(source_node) = nodes.get(&from) else {
                return Err(WorkflowError::UnknownNode {
                    node: from,
                    referenced_by: "an edge source".to_string(),
                });
            };
            if matches!(source_node.kind, NodeKind::Decision { .. }) {
                return Err(WorkflowError::InvalidEdge {
                    from,
                    reason: "decision nodes leave only through their routes".to_string(),
                });
            }
            if !nodes.contains_key(&to) {
                return Err(WorkflowError::UnknownNode {
                    node: to,
                    referenced_by: format!("the edge from `{from}`"),
                });
            }
            if edges.contains_key(&from) {
                return Err(WorkflowError::InvalidEdge {
                    from,
                    reason: "more than one outgoing edge".to_string(),
                });
            }
            edges.insert(from, to);
        }

        for node in nodes.values() {
            let NodeKind::Decision { routes } = &node.kind else {
                continue;
            };
            if let Some(route) = routes.iter().find(|route| !nodes.contains_key(&route.target)) {
                return Err(WorkflowError::UnknownNode {
                    node: route.target.clone(),
                    referenced_by: format!("a route of `{}`", node.id),
                });
            }
        }

        Ok(Self { global_prompt: document.global_prompt, entry, nodes, edges })
    }

    pub fn entry(&self) -> &NodeId {
        &self.entry
    }

    pub fn global_prompt(&self) -> &str {
        &self.global_prompt
    }

    pub fn node(&self, id: &NodeId) -> Result<&WorkflowNode, WorkflowError> {
        self.nodes.get(id).ok_or_else(|| WorkflowError::UnknownNode {
            node: id.clone(),
            referenced_by: "conversation state".to_string(),
        })
    }

    pub fn successor(&self, id: &NodeId) -> Option<&NodeId> {
        self.edges.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &WorkflowNode> {
        self.nodes.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

#[derive(Debug, Deserialize)]
struct WorkflowDocument {
    #[serde(default)]
    global_prompt: String,
    nodes: Vec<NodeDocument>,
    #[serde(default)]
    edges: Vec<EdgeDocument>,
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum NodeType {
    Entry,
    Decision,
    ResponseGenerator,
}

#[derive(Debug, Deserialize)]
struct NodeDocument {
    id: String,
    #[serde(rename = "type")]
    node_type: NodeType,
    #[serde(default)]
    prompt: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    #[serde(default)]
    routes: Vec<RouteDocument>,
    #[serde(default)]
    captures: Vec<FactRule>,
    pipeline_stage: Option<String>,
    #[serde(default)]
    concludes: bool,
}

#[derive(Debug, Deserialize)]
struct RouteDocument {
    #[serde(alias = "targetNodeId")]
    target: String,
    field: Option<String>,
    operator: Option<Operator>,
    value: Option<Value>,
    #[serde(default)]
    conditions: Vec<Condition>,
}

#[derive(Debug, Deserialize)]
struct EdgeDocument {
    source: String,
    target: String,
}

impl NodeDocument {
    fn into_node(self) -> Result<WorkflowNode, WorkflowError> {
        let id = NodeId(self.id.trim().to_string());
        let invalid = |reason: String| WorkflowError::InvalidNode { node: id.clone(), reason };

        if id.0.is_empty() {
            return Err(invalid("node id must not be empty".to_string()));
        }
        for rule in &self.captures {
            rule.validate().map_err(&invalid)?;
        }
        if !self.routes.is_empty() && !matches!(self.node_type, NodeType::Decision) {
            return Err(invalid("routes are only allowed on decision nodes".to_string()));
        }

        let kind = match self.node_type {
            NodeType::Entry => NodeKind::Entry,
            NodeType::Decision => {
                if self.routes.is_empty() {
                    return Err(invalid("decision node declares no routes".to_string()));
                }
                let routes = self
                    .routes
                    .into_iter()
                    .map(RouteDocument::into_route)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(&invalid)?;
                NodeKind::Decision { routes }
            }
            NodeType::ResponseGenerator => {
                if self.prompt.trim().is_empty() {
                    return Err(invalid("response generator requires a prompt".to_string()));
                }
                let temperature = self.temperature.unwrap_or(DEFAULT_TEMPERATURE);
                if !(0.0..=2.0).contains(&temperature) {
                    return Err(invalid(format!(
                        "temperature {temperature} is outside 0.0..=2.0"
                    )));
                }
                NodeKind::ResponseGenerator(GeneratorSettings {
                    prompt: self.prompt,
                    temperature,
                    max_tokens: self.max_tokens,
                })
            }
        };

        Ok(WorkflowNode {
            id,
            kind,
            captures: self.captures,
            pipeline_stage: self.pipeline_stage.filter(|stage| !stage.trim().is_empty()),
            concludes: self.concludes,
        })
    }
}

impl RouteDocument {
    fn into_route(self) -> Result<Route, String> {
        let mut conditions = Vec::with_capacity(self.conditions.len() + 1);
        match (self.field, self.operator, self.value) {
            (None, None, None) => {}
            (Some(field), Some(operator), Some(value)) => {
                conditions.push(Condition { field, operator, value })
            }
            _ => {
                return Err(format!(
                    "route to `{}` needs field, operator and value together",
                    self.target
                ))
            }
        }
        conditions.extend(self.conditions);

        if conditions.iter().any(|condition| condition.field.trim().is_empty()) {
            return Err(format!("route to `{}` has a condition without a field", self.target));
        }

        Ok(Route { target: NodeId(self.target), conditions })
    }
}
