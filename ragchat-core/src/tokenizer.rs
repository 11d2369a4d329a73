//! Token estimation and budget checks for context assembly.

use crate::error::{RagchatError, Result};

/// Maximum number of tokens of retrieved context placed in one request.
pub const MAX_CONTEXT_TOKENS: usize = 3500;

/// Estimates the token cost of a piece of text.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;
}

/// Token counter using tiktoken-rs with the GPT-3 (`r50k_base`) encoding.
pub struct TokenCounter {
    bpe: tiktoken_rs::CoreBPE,
}

impl TokenCounter {
    /// Load the GPT-3 BPE ranks.
    pub fn gpt3() -> Result<Self> {
        let bpe = tiktoken_rs::r50k_base().map_err(|e| RagchatError::Tokenizer {
            message: e.to_string(),
        })?;
        Ok(Self { bpe })
    }

    /// Count the number of tokens in a string.
    pub fn count(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}

impl TokenEstimator for TokenCounter {
    fn estimate(&self, text: &str) -> usize {
        self.count(text)
    }
}

/// Whether adding `next_count` tokens to `running_total` stays within `max`.
pub fn within_budget(running_total: usize, next_count: usize, max: usize) -> bool {
    running_total.saturating_add(next_count) <= max
}
