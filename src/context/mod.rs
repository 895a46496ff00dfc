//! Context Window Module
//!
//! Fits conversation history into a model's token limit while keeping room
//! for the reply.

pub mod tokens;
pub mod window;

// Re-export public types for external use
pub use tokens::{
    count_batch, counter_for, estimate_tokens_quick, BpeTokenCounter, EstimateTokenCounter,
    TokenCounter, TokenizerError, TokenizerKind,
};
pub use window::{select_window, Budget, Message, Role, SelectionPolicy, WindowSelection};
