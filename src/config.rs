//! Deployment configuration
//!
//! Read once at the request boundary and passed explicitly into selection.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

use crate::context::{SelectionPolicy, TokenizerKind};

/// Tokens left for the reply when `MAX_TOKENS` is unset
pub const DEFAULT_RESERVED_GENERATION: u32 = 1000;
pub const DEFAULT_TEMPERATURE: f32 = 1.0;
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are ChatGPT, a large language model trained by OpenAI. Follow the user's instructions carefully. Respond using markdown.";

pub const ENV_RESERVED_GENERATION: &str = "MAX_TOKENS";
pub const ENV_POLICY: &str = "MEMORY_STYLE";
pub const ENV_SYSTEM_PROMPT: &str = "DEFAULT_SYSTEM_PROMPT";
pub const ENV_TEMPERATURE: &str = "DEFAULT_TEMPERATURE";
pub const ENV_TOKENIZER: &str = "TOKENIZER";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

impl Serialize for ConfigError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Settings that shape every request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Tokens kept free for the model's reply
    pub reserved_generation: u32,
    pub policy: SelectionPolicy,
    /// Used when a request has no prompt of its own
    pub default_system_prompt: String,
    pub default_temperature: f32,
    pub tokenizer: TokenizerKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reserved_generation: DEFAULT_RESERVED_GENERATION,
            policy: SelectionPolicy::Default,
            default_system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            default_temperature: DEFAULT_TEMPERATURE,
            tokenizer: TokenizerKind::default(),
        }
    }
}

impl Config {
    /// Load from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key lookup. Unset or empty keys keep their defaults;
    /// an unknown `MEMORY_STYLE` means the default policy.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Config::default();

        if let Some(value) = get(ENV_RESERVED_GENERATION) {
            config.reserved_generation = parse_value(ENV_RESERVED_GENERATION, &value)?;
        }
        config.policy = SelectionPolicy::from_config(get(ENV_POLICY).as_deref());
        if let Some(value) = get(ENV_SYSTEM_PROMPT) {
            config.default_system_prompt = value;
        }
        if let Some(value) = get(ENV_TEMPERATURE) {
            config.default_temperature = parse_value(ENV_TEMPERATURE, &value)?;
        }
        if let Some(value) = get(ENV_TOKENIZER) {
            config.tokenizer = parse_value(ENV_TOKENIZER, &value)?;
        }

        Ok(config)
    }
}

fn parse_value<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}
