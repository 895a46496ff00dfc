//! Chat request preparation
//!
//! Turns an incoming chat body into the request sent downstream: resolves the
//! prompt and temperature, counts the system prompt once and runs a single
//! window selection over the history.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::context::{select_window, Budget, Message, TokenCounter};
use crate::models::{ModelRef, ModelSpec};

#[derive(Error, Debug)]
pub enum RequestError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid model {0}: token limit must be positive")]
    InvalidModel(String),
}

impl Serialize for RequestError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Incoming chat request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatBody {
    /// Full model description or bare id; absent means the fallback model
    #[serde(default)]
    pub model: Option<ModelRef>,
    /// Full history, oldest first
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing)]
    pub key: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl ChatBody {
    pub fn from_json(json: &str) -> Result<Self, RequestError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// What the downstream streaming call receives
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundRequest {
    pub model: ModelSpec,
    pub system_prompt: String,
    pub temperature: f32,
    /// Selected history, oldest first
    pub messages: Vec<Message>,
    pub running_total: u32,
    pub token_limit: u32,
    /// History messages left out of the window
    pub dropped: usize,
    #[serde(skip_serializing)]
    pub key: Option<String>,
}

impl OutboundRequest {
    /// System prompt followed by the selected history
    pub fn chat_messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.messages.len() + 1);
        messages.push(Message::system(self.system_prompt.clone()));
        messages.extend(self.messages.iter().cloned());
        messages
    }
}

/// Build the outbound request for `body` under `config`.
pub fn prepare_request(
    body: ChatBody,
    config: &Config,
    counter: &dyn TokenCounter,
) -> Result<OutboundRequest, RequestError> {
    let model = ModelSpec::resolve(body.model);
    if model.token_limit == 0 {
        return Err(RequestError::InvalidModel(model.id));
    }

    let system_prompt = match body.prompt {
        Some(prompt) if !prompt.is_empty() => prompt,
        _ => config.default_system_prompt.clone(),
    };
    let temperature = body.temperature.unwrap_or(config.default_temperature);

    let base_tokens = counter.count(&system_prompt);
    let budget = Budget::new(base_tokens, model.token_limit, config.reserved_generation);
    debug!(
        model = %model.id,
        base_tokens,
        available = budget.available(),
        history_len = body.messages.len(),
        "Preparing chat request"
    );

    let selection = select_window(&body.messages, budget, config.policy, counter);

    Ok(OutboundRequest {
        dropped: selection.dropped(body.messages.len()),
        model,
        system_prompt,
        temperature,
        messages: selection.messages,
        running_total: selection.running_total,
        token_limit: selection.token_limit,
        key: body.key,
    })
}
