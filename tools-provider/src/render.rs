//! Restricted template rendering for URL/header/body construction: variable
//! interpolation plus the `tojson` filter, strict on unknown variables.

use minijinja::{Environment, UndefinedBehavior};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("invalid {context} template: {message}")]
    Syntax { context: String, message: String },
    #[error("missing variable in {context} template: {message} (available: {})", available.join(", "))]
    Undefined {
        context: String,
        message: String,
        available: Vec<String>,
    },
}

pub struct TemplateRenderer {
    env: Environment<'static>,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        // Unknown variables must fail the call, not render empty strings.
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        Self { env }
    }

    /// Renders `template` against an object of variables. `context` names the
    /// component (url, body, header:<name>) for error messages.
    pub fn render(
        &self,
        template: &str,
        variables: &Value,
        context: &str,
    ) -> Result<String, RenderError> {
        self.env
            .render_str(template, variables)
            .map_err(|e| match e.kind() {
                minijinja::ErrorKind::UndefinedError => RenderError::Undefined {
                    context: context.to_string(),
                    message: e.to_string(),
                    available: variables
                        .as_object()
                        .map(|o| o.keys().cloned().collect())
                        .unwrap_or_default(),
                },
                _ => RenderError::Syntax {
                    context: context.to_string(),
                    message: e.to_string(),
                },
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn interpolates_variables_into_urls() {
        let renderer = TemplateRenderer::new();
        let url = renderer
            .render(
                "https://api.example.com/users/{{ user_id }}?page={{ page }}",
                &json!({"user_id": "u-42", "page": 2}),
                "url",
            )
            .unwrap();
        assert_eq!(url, "https://api.example.com/users/u-42?page=2");
    }

    #[test]
    fn tojson_filter_serializes_values() {
        let renderer = TemplateRenderer::new();
        let body = renderer
            .render(
                r#"{"name": {{ name | tojson }}, "tags": {{ tags | tojson }}}"#,
                &json!({"name": "a \"quoted\" name", "tags": ["x", "y"]}),
                "body",
            )
            .unwrap();
        let parsed: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["name"], "a \"quoted\" name");
        assert_eq!(parsed["tags"], json!(["x", "y"]));
    }

    #[test]
    fn unknown_variable_reports_available_keys() {
        let renderer = TemplateRenderer::new();
        let err = renderer
            .render("{{ missing }}", &json!({"present": 1}), "url")
            .unwrap_err();
        match err {
            RenderError::Undefined { available, context, .. } => {
                assert_eq!(context, "url");
                assert_eq!(available, vec!["present".to_string()]);
            }
            other => panic!("expected Undefined, got {:?}", other),
        }
    }

    #[test]
    fn syntax_error_is_not_an_undefined_error() {
        let renderer = TemplateRenderer::new();
        let err = renderer
            .render("{{ unclosed", &json!({}), "body")
            .unwrap_err();
        assert!(matches!(err, RenderError::Syntax { .. }));
    }
}
