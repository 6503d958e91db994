use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::conversation::ConversationState;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactMatcher {
    /// Any keyword appears in the lower-cased message.
    Keywords(Vec<String>),
    /// Trimmed message has at least this many characters.
    MinLength(usize),
}

/// Declarative extraction of a boolean fact from the inbound message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactRule {
    pub fact: String,
    #[serde(flatten)]
    pub matcher: FactMatcher,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_as: Option<String>,
}

impl FactRule {
    pub fn validate(&self) -> Result<(), String> {
        if self.fact.trim().is_empty() {
            return Err("capture rule has an empty fact name".to_string());
        }
        match &self.matcher {
            FactMatcher::Keywords(keywords) if keywords.iter().all(|k| k.trim().is_empty()) => {
                Err(format!("capture rule `{}` declares no keywords", self.fact))
            }
            FactMatcher::MinLength(0) => {
                Err(format!("capture rule `{}` needs a min_length above zero", self.fact))
            }
            _ => Ok(()),
        }
    }

    pub fn matches(&self, message: &str) -> bool {
        match &self.matcher {
            FactMatcher::Keywords(keywords) => {
                let normalized = message.to_lowercase();
                keywords
                    .iter()
                    .map(|keyword| keyword.trim().to_lowercase())
                    .any(|keyword| !keyword.is_empty() && normalized.contains(&keyword))
            }
            FactMatcher::MinLength(min_chars) => message.trim().chars().count() >= *min_chars,
        }
    }

    /// Facts are only ever raised: a match sets `true`, a miss initialises an
    /// absent fact to `false` and leaves an existing one alone.
    pub fn apply(&self, state: &mut ConversationState, message: &str) -> bool {
        let already_true = state.fact(&self.fact).and_then(Value::as_bool).unwrap_or(false);

        if self.matches(message) {
            state.set_fact(self.fact.clone(), Value::Bool(true));
            if let Some(key) = &self.capture_as {
                if !already_true {
                    state.set_fact(key.clone(), Value::String(message.trim().to_string()));
                }
            }
            return true;
        }

        if state.fact(&self.fact).is_none() {
            state.set_fact(self.fact.clone(), Value::Bool(false));
        }
        false
    }
}

/// Applies every rule in order and returns the facts that matched.
pub fn apply_captures(
    rules: &[FactRule],
    state: &mut ConversationState,
    message: &str,
) -> Vec<String> {
    rules.iter().filter(|rule| rule.apply(state, message)).map(|rule| rule.fact.clone()).collect()
}
