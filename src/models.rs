//! Model catalogue
//!
//! Token limits per chat model. A request carries its model description;
//! the catalogue fills it in when only an id is known, and the fallback model
//! stands in when the request names none or an unknown one.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Model used when a request names none, or names one not in the catalogue
pub const FALLBACK_MODEL_ID: &str = "gpt-3.5-turbo";

/// A target chat model and its limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSpec {
    pub id: String,
    pub name: String,
    /// Maximum prompt length in characters accepted from the user
    pub max_length: u32,
    /// Maximum tokens per request, prompt and reply combined
    pub token_limit: u32,
}

struct KnownModel {
    id: &'static str,
    name: &'static str,
    max_length: u32,
    token_limit: u32,
}

const KNOWN_MODELS: &[KnownModel] = &[
    KnownModel {
        id: "gpt-3.5-turbo",
        name: "GPT-3.5",
        max_length: 12_000,
        token_limit: 4_000,
    },
    KnownModel {
        id: "gpt-4",
        name: "GPT-4",
        max_length: 24_000,
        token_limit: 8_000,
    },
    KnownModel {
        id: "gpt-4-32k",
        name: "GPT-4-32K",
        max_length: 96_000,
        token_limit: 32_000,
    },
];

/// Model as given in a request: a full description or just an id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelRef {
    Spec(ModelSpec),
    Id(String),
}

impl ModelRef {
    /// Full description for this reference; unknown ids get the fallback model
    pub fn resolve(self) -> ModelSpec {
        match self {
            ModelRef::Spec(spec) => spec,
            ModelRef::Id(id) => ModelSpec::lookup(&id).unwrap_or_else(|| {
                warn!(model = %id, fallback = FALLBACK_MODEL_ID, "Unknown model, using fallback");
                ModelSpec::fallback()
            }),
        }
    }
}

impl From<ModelSpec> for ModelRef {
    fn from(spec: ModelSpec) -> Self {
        ModelRef::Spec(spec)
    }
}

impl From<&KnownModel> for ModelSpec {
    fn from(model: &KnownModel) -> Self {
        ModelSpec {
            id: model.id.to_string(),
            name: model.name.to_string(),
            max_length: model.max_length,
            token_limit: model.token_limit,
        }
    }
}

impl ModelSpec {
    /// Look up a built-in model by id
    pub fn lookup(id: &str) -> Option<ModelSpec> {
        KNOWN_MODELS.iter().find(|m| m.id == id).map(ModelSpec::from)
    }

    /// All built-in models
    pub fn catalogue() -> Vec<ModelSpec> {
        KNOWN_MODELS.iter().map(ModelSpec::from).collect()
    }

    /// Resolve an optional request model, using the fallback when absent
    pub fn resolve(model: Option<ModelRef>) -> ModelSpec {
        model.map(ModelRef::resolve).unwrap_or_else(ModelSpec::fallback)
    }

    pub fn fallback() -> ModelSpec {
        // FALLBACK_MODEL_ID is always in KNOWN_MODELS
        ModelSpec::from(&KNOWN_MODELS[0])
    }
}
