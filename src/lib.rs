// histwin Library
// Exports window selection and request preparation for the CLI binary

pub mod config;
pub mod context;
pub mod models;
pub mod request;

// Re-export commonly used types for CLI
pub use config::{Config, ConfigError, DEFAULT_RESERVED_GENERATION};
pub use context::{
    count_batch, counter_for, estimate_tokens_quick, select_window, BpeTokenCounter, Budget,
    EstimateTokenCounter, Message, Role, SelectionPolicy, TokenCounter, TokenizerError,
    TokenizerKind, WindowSelection,
};
pub use models::{ModelRef, ModelSpec};
pub use request::{prepare_request, ChatBody, OutboundRequest, RequestError};
