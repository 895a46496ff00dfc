//! Token counting for window selection.
//!
//! The selector only needs `count(text) -> u32`. `BpeTokenCounter` uses
//! tiktoken-rs encodings; `EstimateTokenCounter` is a cheap byte-length heuristic.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use thiserror::Error;
use tiktoken_rs::{cl100k_base, r50k_base, CoreBPE};
use tracing::{debug, warn};

/// Default number of memoized counts per BPE counter
pub const DEFAULT_CACHE_SIZE: usize = 10_000;

#[derive(Error, Debug)]
pub enum TokenizerError {
    #[error("Failed to load {kind} encoding: {message}")]
    Load { kind: TokenizerKind, message: String },
    #[error("Unknown tokenizer: {0}")]
    Unknown(String),
}

impl Serialize for TokenizerError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Maps message text to a token count.
///
/// Implementations must be deterministic. Any closure `Fn(&str) -> u32` is a counter.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> u32;
}

impl<F> TokenCounter for F
where
    F: Fn(&str) -> u32 + Send + Sync,
{
    fn count(&self, text: &str) -> u32 {
        self(text)
    }
}

/// Which tokenizer to count with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenizerKind {
    /// r50k_base, the GPT-3 vocabulary
    #[default]
    Gpt3,
    /// cl100k_base
    Cl100k,
    /// ~4 bytes per token, no vocabulary
    Estimate,
}

impl fmt::Display for TokenizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TokenizerKind::Gpt3 => "gpt3",
            TokenizerKind::Cl100k => "cl100k",
            TokenizerKind::Estimate => "estimate",
        };
        f.write_str(name)
    }
}

impl FromStr for TokenizerKind {
    type Err = TokenizerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gpt3" | "r50k" | "r50k_base" => Ok(TokenizerKind::Gpt3),
            "cl100k" | "cl100k_base" => Ok(TokenizerKind::Cl100k),
            "estimate" => Ok(TokenizerKind::Estimate),
            other => Err(TokenizerError::Unknown(other.to_string())),
        }
    }
}

/// Cache for token counts, keyed by content hash
pub struct TokenCache {
    cache: HashMap<u64, u32>,
    max_size: usize,
}

impl TokenCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            cache: HashMap::with_capacity(max_size.min(DEFAULT_CACHE_SIZE)),
            max_size: max_size.max(1),
        }
    }

    pub fn get(&self, hash: u64) -> Option<u32> {
        self.cache.get(&hash).copied()
    }

    /// Store a count; at capacity, drop half the entries first
    pub fn insert(&mut self, hash: u64, count: u32) {
        if self.cache.len() >= self.max_size {
            let evict = (self.max_size / 2).max(1);
            let keys: Vec<_> = self.cache.keys().take(evict).copied().collect();
            for key in keys {
                self.cache.remove(&key);
            }
        }
        self.cache.insert(hash, count);
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

fn hash_content(content: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    hasher.finish()
}

/// BPE token counter with a per-counter memo cache.
pub struct BpeTokenCounter {
    bpe: CoreBPE,
    cache: RwLock<TokenCache>,
}

impl BpeTokenCounter {
    /// Load the BPE tables for `kind`. `Estimate` has no tables and is rejected.
    pub fn new(kind: TokenizerKind) -> Result<Self, TokenizerError> {
        Self::with_cache_size(kind, DEFAULT_CACHE_SIZE)
    }

    pub fn with_cache_size(kind: TokenizerKind, cache_size: usize) -> Result<Self, TokenizerError> {
        let loaded = match kind {
            TokenizerKind::Gpt3 => r50k_base(),
            TokenizerKind::Cl100k => cl100k_base(),
            TokenizerKind::Estimate => {
                return Err(TokenizerError::Load {
                    kind,
                    message: "estimate has no BPE vocabulary".to_string(),
                })
            }
        };
        let bpe = loaded.map_err(|e| TokenizerError::Load {
            kind,
            message: e.to_string(),
        })?;
        debug!(tokenizer = %kind, cache_size, "Loaded BPE encoding");

        Ok(Self {
            bpe,
            cache: RwLock::new(TokenCache::new(cache_size)),
        })
    }

    /// (cached entries, capacity)
    pub fn cache_stats(&self) -> (usize, usize) {
        let cache = self.cache.read();
        (cache.len(), cache.max_size)
    }

    pub fn clear_cache(&self) {
        self.cache.write().clear();
    }
}

impl TokenCounter for BpeTokenCounter {
    fn count(&self, text: &str) -> u32 {
        if text.is_empty() {
            return 0;
        }

        let content_hash = hash_content(text);
        if let Some(count) = self.cache.read().get(content_hash) {
            return count;
        }

        let count = self.bpe.encode_with_special_tokens(text).len() as u32;
        self.cache.write().insert(content_hash, count);
        count
    }
}

/// Byte-length estimate: ~4 bytes per token, rounded up.
#[derive(Debug, Clone, Copy, Default)]
pub struct EstimateTokenCounter;

impl TokenCounter for EstimateTokenCounter {
    fn count(&self, text: &str) -> u32 {
        estimate_tokens_quick(text)
    }
}

pub fn estimate_tokens_quick(text: &str) -> u32 {
    (text.len() as u64).div_ceil(4).min(u32::MAX as u64) as u32
}

/// Build a counter for `kind`, falling back to the estimate if the BPE cannot load.
pub fn counter_for(kind: TokenizerKind) -> Box<dyn TokenCounter> {
    match kind {
        TokenizerKind::Estimate => Box::new(EstimateTokenCounter),
        _ => match BpeTokenCounter::new(kind) {
            Ok(counter) => Box::new(counter),
            Err(e) => {
                warn!(tokenizer = %kind, error = %e, "Falling back to estimated token counts");
                Box::new(EstimateTokenCounter)
            }
        },
    }
}

/// Count tokens for multiple pieces of text
pub fn count_batch(counter: &dyn TokenCounter, texts: &[&str]) -> Vec<u32> {
    texts.iter().map(|t| counter.count(t)).collect()
}
