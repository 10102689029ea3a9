//! Conversation templates: a static definition of ordered items, widgets, and
//! flow flags that lets the agent drive turn-taking (proactive flow).
//!
//! Definitions load from YAML files; the orchestrator walks items in order,
//! streaming text content and waiting on widget answers.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackRule {
    /// No feedback after a widget answer.
    #[default]
    None,
    /// Tell the user immediately whether the answer was correct.
    Immediate,
    /// Summarize at template completion.
    OnCompletion,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WidgetDef {
    pub widget_id: String,
    pub widget_type: String,
    #[serde(default)]
    pub props: Value,
    /// When present, answers are scored server-side against this value.
    #[serde(default)]
    pub correct_answer: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TemplateItem {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub widget: Option<WidgetDef>,
    #[serde(default)]
    pub enable_chat_input: bool,
    #[serde(default)]
    pub time_limit_seconds: Option<u64>,
    #[serde(default)]
    pub warning_message: Option<String>,
    #[serde(default)]
    pub reveal_correct_answer: bool,
    #[serde(default)]
    pub feedback: FeedbackRule,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    /// Proactive templates run before the user's first message.
    #[serde(default)]
    pub agent_starts_first: bool,
    #[serde(default)]
    pub completion_message: Option<String>,
    pub items: Vec<TemplateItem>,
}

impl Template {
    /// Scores a widget answer. `None` when the widget has no expected answer.
    pub fn score_answer(widget: &WidgetDef, value: &Value) -> Option<bool> {
        widget.correct_answer.as_ref().map(|expected| expected == value)
    }
}

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("read template dir: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse template {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
}

/// In-memory template registry loaded from a directory of YAML definitions.
#[derive(Default)]
pub struct TemplateStore {
    templates: HashMap<String, Template>,
    /// conversation template assignment: conversation_id -> template_id.
    assignments: HashMap<String, String>,
}

impl TemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, template: Template) {
        self.templates.insert(template.id.clone(), template);
    }

    pub fn assign(&mut self, conversation_id: impl Into<String>, template_id: impl Into<String>) {
        self.assignments
            .insert(conversation_id.into(), template_id.into());
    }

    pub fn get(&self, template_id: &str) -> Option<&Template> {
        self.templates.get(template_id)
    }

    /// Template assigned to a conversation, if any.
    pub fn for_conversation(&self, conversation_id: &str) -> Option<&Template> {
        self.assignments
            .get(conversation_id)
            .and_then(|id| self.templates.get(id))
    }

    /// Loads every `*.yaml`/`*.yml` file in `dir` as one template each.
    /// A missing directory yields an empty store.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self, TemplateError> {
        let mut store = Self::new();
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Ok(store);
        }
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e == "yaml" || e == "yml")
                .unwrap_or(false);
            if !is_yaml {
                continue;
            }
            let content = std::fs::read_to_string(&path)?;
            let template: Template =
                serde_yaml::from_str(&content).map_err(|source| TemplateError::Parse {
                    path: path.display().to_string(),
                    source,
                })?;
            store.insert(template);
        }
        Ok(store)
    }
}

/// Splits text into fixed-size chunks for paced streaming.
pub fn chunk_text(text: &str, chunk_chars: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(chunk_chars.max(1))
        .map(|c| c.iter().collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TEMPLATE_YAML: &str = r#"
id: onboarding
name: Onboarding quiz
agent_starts_first: true
completion_message: "All done!"
items:
  - id: intro
    title: Welcome
    text: "Welcome to the quiz."
  - id: q1
    title: Question 1
    text: "What is 2+3?"
    widget:
      widget_id: q1-choice
      widget_type: multiple_choice
      props:
        options: ["4", "5", "6"]
      correct_answer: "5"
    time_limit_seconds: 30
    warning_message: "10 seconds left"
    reveal_correct_answer: true
    feedback: immediate
"#;

    #[test]
    fn yaml_template_parses_with_defaults() {
        let template: Template = serde_yaml::from_str(TEMPLATE_YAML).unwrap();
        assert!(template.agent_starts_first);
        assert_eq!(template.items.len(), 2);
        assert!(template.items[0].widget.is_none());
        assert_eq!(template.items[0].feedback, FeedbackRule::None);
        let q1 = &template.items[1];
        assert_eq!(q1.time_limit_seconds, Some(30));
        assert_eq!(q1.feedback, FeedbackRule::Immediate);
        assert_eq!(
            q1.widget.as_ref().unwrap().correct_answer,
            Some(json!("5"))
        );
    }

    #[test]
    fn scoring_compares_against_expected_answer() {
        let template: Template = serde_yaml::from_str(TEMPLATE_YAML).unwrap();
        let widget = template.items[1].widget.as_ref().unwrap();
        assert_eq!(Template::score_answer(widget, &json!("5")), Some(true));
        assert_eq!(Template::score_answer(widget, &json!("4")), Some(false));

        let unscored = WidgetDef {
            widget_id: "w".into(),
            widget_type: "free_text".into(),
            props: json!({}),
            correct_answer: None,
        };
        assert_eq!(Template::score_answer(&unscored, &json!("anything")), None);
    }

    #[test]
    fn chunk_text_splits_on_char_boundaries() {
        let chunks = chunk_text("abcdefghij", 4);
        assert_eq!(chunks, vec!["abcd", "efgh", "ij"]);
        assert!(chunk_text("", 4).is_empty());
        // Multi-byte chars stay intact.
        let chunks = chunk_text("héllo wörld", 3);
        assert_eq!(chunks.concat(), "héllo wörld");
    }

    #[test]
    fn store_load_dir_and_assignment() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("onboarding.yaml"), TEMPLATE_YAML).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let mut store = TemplateStore::load_dir(dir.path()).unwrap();
        assert!(store.get("onboarding").is_some());

        store.assign("conv-1", "onboarding");
        assert_eq!(store.for_conversation("conv-1").unwrap().id, "onboarding");
        assert!(store.for_conversation("conv-2").is_none());
    }
}
