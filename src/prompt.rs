//! Chat prompts, stored as TOML and rendered with Handlebars.

use handlebars::Handlebars;
use serde_json::Map;

use crate::{async_utils::io::JsonObject, prelude::*};

/// Render a prompt as JSON, filling in template values for any string fields.
pub trait RenderTemplate {
    type Output;

    /// Render the template.
    fn render_template(
        &self,
        handlebars: &Handlebars,
        bindings: &JsonObject,
    ) -> Result<Self::Output>;
}

/// A chat completion prompt.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatPrompt {
    /// The developer (aka "system") message, if any.
    pub developer: Option<String>,

    /// Messages.
    pub messages: Vec<Message>,
}

impl ChatPrompt {
    /// Parse a prompt from TOML.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).context("Failed to parse chat prompt")
    }

    /// Render the prompt as a JSON array of chat messages.
    pub fn render_prompt(&self, bindings: &JsonObject) -> Result<Value> {
        let mut handlebars = Handlebars::new();
        // Student answers are full of `<`, `&` and quotes, and none of this is
        // HTML.
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars.set_strict_mode(true);
        self.render_template(&handlebars, bindings)
    }
}

impl RenderTemplate for ChatPrompt {
    type Output = Value;

    fn render_template(
        &self,
        handlebars: &Handlebars,
        bindings: &JsonObject,
    ) -> Result<Self::Output> {
        let mut messages = Vec::new();
        if let Some(developer) = &self.developer {
            messages.push(json!({
                "role": "system",
                "content": handlebars.render_template(developer, bindings)?,
            }));
        }
        for message in &self.messages {
            messages.extend(message.render_template(handlebars, bindings)?);
        }
        Ok(Value::Array(messages))
    }
}

/// A message, and optionally a response (represented as a JSON object).
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Message {
    /// The user message.
    pub user: String,

    /// Images to attach to the user message. Each is a template which should
    /// render to a URL, usually a `data:` URL.
    #[serde(default)]
    pub images: Vec<String>,

    /// Detail level for attached images. A template, so that it can be chosen
    /// per request.
    #[serde(default)]
    pub image_detail: Option<String>,

    /// The assistant response (optional). This is always a JSON object.
    pub assistant: Option<JsonObject>,
}

impl RenderTemplate for Message {
    type Output = Vec<Value>;

    fn render_template(
        &self,
        handlebars: &Handlebars,
        bindings: &JsonObject,
    ) -> Result<Self::Output> {
        let user = handlebars.render_template(&self.user, bindings)?;
        let content = if self.images.is_empty() {
            Value::String(user)
        } else {
            let detail = match &self.image_detail {
                Some(detail) => handlebars.render_template(detail, bindings)?,
                None => "auto".to_owned(),
            };
            let mut parts = vec![json!({ "type": "text", "text": user })];
            for image in &self.images {
                let url = handlebars.render_template(image, bindings)?;
                parts.push(json!({
                    "type": "image_url",
                    "image_url": { "url": url, "detail": detail },
                }));
            }
            Value::Array(parts)
        };
        let mut messages = vec![json!({ "role": "user", "content": content })];
        if let Some(assistant) = &self.assistant {
            let assistant = assistant.render_template(handlebars, bindings)?;
            messages
                .push(json!({ "role": "assistant", "content": assistant.to_string() }));
        }
        Ok(messages)
    }
}

impl RenderTemplate for Value {
    type Output = Value;

    fn render_template(
        &self,
        handlebars: &Handlebars,
        bindings: &JsonObject,
    ) -> Result<Self::Output> {
        match self {
            Value::String(s) => {
                let rendered = handlebars.render_template(s, bindings)?;
                Ok(Value::String(rendered))
            }
            Value::Object(obj) => obj.render_template(handlebars, bindings),
            Value::Array(arr) => {
                let mut output = Vec::new();
                for value in arr {
                    output.push(value.render_template(handlebars, bindings)?);
                }
                Ok(Value::Array(output))
            }
            _ => Ok(self.clone()),
        }
    }
}

impl RenderTemplate for JsonObject {
    type Output = Value;

    fn render_template(
        &self,
        handlebars: &Handlebars,
        bindings: &JsonObject,
    ) -> Result<Self::Output> {
        let mut output = Map::new();
        for (key, value) in self {
            let rendered_value = value.render_template(handlebars, bindings)?;
            output.insert(key.clone(), rendered_value);
        }
        Ok(Value::Object(output))
    }
}

/// Build template bindings from a serializable value, which must serialize to
/// a JSON object.
pub fn bindings_from<T: Serialize>(value: &T) -> Result<JsonObject> {
    match serde_json::to_value(value).context("Failed to serialize prompt bindings")? {
        Value::Object(map) => Ok(map),
        other => Err(anyhow!("Prompt bindings must be an object, got {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_text_prompt_without_escaping() {
        let prompt = ChatPrompt::from_toml(
            r#"
developer = "You grade {{subject}} answers."

[[messages]]
user = "Answer: {{answer}}"

[messages.assistant]
score = "{{example_score}}"

[[messages]]
user = "Again: {{answer}}"
"#,
        )
        .unwrap();
        let bindings = bindings_from(&json!({
            "subject": "chemistry",
            "answer": "x < 3 & y > 2",
            "example_score": "5",
        }))
        .unwrap();
        let rendered = prompt.render_prompt(&bindings).unwrap();
        assert_eq!(
            rendered,
            json!([
                { "role": "system", "content": "You grade chemistry answers." },
                { "role": "user", "content": "Answer: x < 3 & y > 2" },
                { "role": "assistant", "content": "{\"score\":\"5\"}" },
                { "role": "user", "content": "Again: x < 3 & y > 2" },
            ])
        );
    }

    #[test]
    fn test_render_image_prompt() {
        let prompt = ChatPrompt::from_toml(
            r#"
[[messages]]
user = "Transcribe this."
images = ["{{image_url}}"]
image_detail = "{{detail}}"
"#,
        )
        .unwrap();
        let bindings = bindings_from(&json!({
            "image_url": "data:image/png;base64,AAAA",
            "detail": "high",
        }))
        .unwrap();
        let rendered = prompt.render_prompt(&bindings).unwrap();
        assert_eq!(
            rendered[0]["content"][1],
            json!({
                "type": "image_url",
                "image_url": { "url": "data:image/png;base64,AAAA", "detail": "high" },
            })
        );
    }

    #[test]
    fn test_missing_binding_is_an_error() {
        let prompt = ChatPrompt::from_toml("[[messages]]\nuser = \"{{missing}}\"\n").unwrap();
        assert!(prompt.render_prompt(&JsonObject::new()).is_err());
    }
}
