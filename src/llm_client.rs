//! Client for OpenAI-compatible APIs (OpenAI itself, LiteLLM or Ollama).
//!
//! Everything we ask of a language model is a structured completion: we send
//! a rendered [`ChatPrompt`](crate::prompt::ChatPrompt), require a JSON
//! response matching the schema of a Rust type, and validate what comes back.

use std::time::Duration;

use async_openai::{
    Client,
    config::OpenAIConfig,
    error::OpenAIError,
    types::{CreateChatCompletionResponse, FinishReason, ResponseFormatJsonSchema},
};
use keen_retry::{ExponentialJitter, RetryResult};
use leaky_bucket::RateLimiter;
use schemars::{JsonSchema, r#gen::SchemaSettings};
use serde::de::DeserializeOwned;
use tokio::time;

use crate::{
    config::LlmConfig,
    prelude::*,
    retry::{
        IsKnownTransient, resolve, retry_result_fatal, retry_result_ok, try_fatal,
        try_potentially_transient, try_transient,
    },
};

/// Create an OpenAI-compatible client using the standard environment
/// variables.
pub fn create_llm_client() -> Result<Client<OpenAIConfig>> {
    let mut client_config = OpenAIConfig::new();
    if let Ok(api_key) = std::env::var("OPENAI_API_KEY") {
        client_config = client_config.with_api_key(api_key);
    }
    if let Ok(api_base) = std::env::var("OPENAI_API_BASE") {
        client_config = client_config.with_api_base(api_base);
    }
    Ok(Client::with_config(client_config))
}

/// An error which occurred while calling an LLM.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// An error reported by the API client.
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),

    /// The request took too long.
    #[error("LLM request timed out after {0:?}")]
    Timeout(Duration),
}

impl IsKnownTransient for LlmError {
    fn is_known_transient(&self) -> bool {
        match self {
            LlmError::OpenAI(err) => err.is_known_transient(),
            // Runaway LLM responses and some kinds of network timeouts can be
            // retried with hope of a better result.
            LlmError::Timeout(_) => true,
        }
    }
}

/// A model, plus everything we need to call it politely.
pub struct LlmClient {
    /// Our OpenAI client.
    client: Client<OpenAIConfig>,

    /// The model to use.
    model: String,

    /// How long to wait for each response.
    timeout: Duration,

    /// Optional outbound rate limit.
    rate_limiter: Option<RateLimiter>,
}

impl LlmClient {
    /// Create a client from our config and the environment.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        Self::for_model(config, &config.model)
    }

    /// Like [`LlmClient::new`], but with a different model.
    pub fn for_model(config: &LlmConfig, model: &str) -> Result<Self> {
        Ok(Self {
            client: create_llm_client()?,
            model: model.to_owned(),
            timeout: config.timeout(),
            rate_limiter: config.rate_limit.as_ref().map(|r| r.to_rate_limiter()),
        })
    }

    /// The model we're using.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send `messages` (an array of chat messages), and parse the response as
    /// `T`. Transient failures are retried with exponential backoff.
    #[instrument(level = "debug", skip_all, fields(model = %self.model, response_type = %std::any::type_name::<T>()))]
    pub async fn structured_completion<T>(&self, messages: Value) -> Result<T>
    where
        T: DeserializeOwned + JsonSchema,
    {
        let schema = strict_json_schema::<T>()?;
        let validator = jsonschema::validator_for(&schema)?;
        let name = schema
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or("ResponseFormat")
            .to_owned();
        let json_schema = ResponseFormatJsonSchema {
            name,
            schema: Some(schema),
            strict: Some(true),
            description: None,
        };
        let request = json!({
            "model": self.model,
            "messages": messages,
            "response_format": { "type": "json_schema", "json_schema": json_schema },
            "store": false,
            "stream": false,
        });
        trace!(%request, "Request");

        let jitter = ExponentialJitter::FromBackoffRange {
            backoff_range_millis: 1..=30_000,
            re_attempts: 5,
            jitter_ratio: 0.2,
        };
        let result = self
            .completion_attempt(&request, &validator)
            .await
            .retry_with_async(|_| async {
                self.completion_attempt(&request, &validator).await
            })
            .with_exponential_jitter(|| jitter)
            .await;
        let response = resolve("LLM completion", result)?;
        serde_json::from_value::<T>(response).context("Failed to parse LLM response")
    }

    /// Make a single attempt at a completion.
    async fn completion_attempt(
        &self,
        request: &Value,
        validator: &jsonschema::Validator,
    ) -> RetryResult<(), (), Value, anyhow::Error> {
        if let Some(rate_limiter) = &self.rate_limiter {
            rate_limiter.acquire_one().await;
        }

        let chat = self.client.chat();
        let chat_result: Result<Value, LlmError> =
            match time::timeout(self.timeout, chat.create_byot(request.clone())).await {
                Ok(inner) => inner.map_err(LlmError::OpenAI),
                Err(_) => Err(LlmError::Timeout(self.timeout)),
            };
        let chat_result = try_potentially_transient!(chat_result);
        debug!(%chat_result, "OpenAI response");
        let response = try_fatal!(
            serde_json::from_value::<CreateChatCompletionResponse>(chat_result)
                .context("Error parsing OpenAI response")
        );

        let Some(choice) = response.choices.first() else {
            return retry_result_fatal(anyhow!("No choices in OpenAI response"));
        };
        if choice.finish_reason == Some(FinishReason::ContentFilter) {
            return retry_result_fatal(anyhow!("Content filter triggered"));
        }
        if let Some(refusal) = &choice.message.refusal {
            return retry_result_fatal(anyhow!("Model refused: {}", refusal));
        }
        let content = choice.message.content.as_deref().unwrap_or_default();
        // If we didn't get JSON here, it's because the model didn't generate
        // JSON. So give it another chance.
        let response = try_transient!(
            serde_json::from_str::<Value>(content).with_context(|| format!(
                "Error parsing OpenAI response content: {:?}",
                content
            ))
        );

        // Some OpenAI-compatible gateways implement `response_format` loosely,
        // so schema failures get another try too.
        if let Err(err) = validator.validate(&response) {
            return RetryResult::Transient {
                input: (),
                error: anyhow!("Failed to validate {}: {}", response, err),
            };
        }
        retry_result_ok(response)
    }
}

/// Generate a JSON Schema for `T` that OpenAI's strict structured output mode
/// will accept.
///
/// Strict mode wants every object closed (`additionalProperties: false`) with
/// every property listed as required, no `$ref`s, and no numeric `format`s.
pub fn strict_json_schema<T: JsonSchema>() -> Result<Value> {
    let settings = SchemaSettings::draft07().with(|s| {
        s.inline_subschemas = true;
        s.meta_schema = None;
    });
    let schema = settings.into_generator().into_root_schema_for::<T>();
    let mut schema = serde_json::to_value(schema).context("Failed to serialize schema")?;
    make_strict(&mut schema);
    Ok(schema)
}

/// Recursively tighten a schema for strict mode.
fn make_strict(schema: &mut Value) {
    match schema {
        Value::Object(obj) => {
            if obj.contains_key("type") {
                obj.remove("format");
            }
            let required = match obj.get("properties") {
                Some(Value::Object(props)) => Some(
                    props
                        .keys()
                        .map(|k| Value::String(k.clone()))
                        .collect::<Vec<_>>(),
                ),
                _ => None,
            };
            if let Some(required) = required {
                obj.insert("required".to_owned(), Value::Array(required));
                obj.insert("additionalProperties".to_owned(), Value::Bool(false));
            }
            for value in obj.values_mut() {
                make_strict(value);
            }
        }
        Value::Array(values) => {
            for value in values {
                make_strict(value);
            }
        }
        _ => {}
    }
}
