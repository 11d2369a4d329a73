//! Context assembly for retrieval-augmented turns.
//!
//! Ranked search results are concatenated into one bounded context block with
//! a `SOURCE:` line per document. The budget check is over-shoot-then-stop:
//! the document that pushes the running total past the limit is still
//! included, and nothing after it is.

use std::sync::Arc;

use tracing::debug;

use crate::collaborators::{DocumentSearch, SearchRequest};
use crate::config::RetrievalConfig;
use crate::error::TurnError;
use crate::tokenizer::{MAX_CONTEXT_TOKENS, TokenEstimator, within_budget};
use crate::types::RetrievedDocument;

/// Assembled context for one generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledContext {
    pub context_text: String,
    pub question: String,
    /// URLs of the included documents, in inclusion order.
    pub sources: Vec<String>,
    /// Estimated tokens of every included document, the crossing one included.
    pub total_tokens: usize,
    /// Whether the last included document crossed the budget.
    pub over_budget: bool,
}

impl AssembledContext {
    /// The user message sent to the generation backend.
    pub fn render(&self) -> String {
        format!(
            "CONTEXT:\n{}\n\nUSER QUESTION:\n{}\n",
            self.context_text, self.question
        )
    }
}

/// Builds bounded context blocks from similarity search results.
pub struct ContextAssembler {
    search: Arc<dyn DocumentSearch>,
    estimator: Arc<dyn TokenEstimator>,
}

impl ContextAssembler {
    pub fn new(search: Arc<dyn DocumentSearch>, estimator: Arc<dyn TokenEstimator>) -> Self {
        Self { search, estimator }
    }

    /// Search for documents relevant to `question` and assemble them.
    ///
    /// A failed search aborts the turn with the collaborator's error.
    pub async fn assemble(
        &self,
        question: &str,
        retrieval: &RetrievalConfig,
    ) -> Result<AssembledContext, TurnError> {
        let request = SearchRequest {
            message: question.to_string(),
            similarity: retrieval.similarity,
            limit: retrieval.limit,
        };
        let documents = self.search.search(&request).await?;
        let assembled = assemble_documents(
            question,
            &documents,
            self.estimator.as_ref(),
            MAX_CONTEXT_TOKENS,
        );
        debug!(
            candidates = documents.len(),
            included = assembled.sources.len(),
            tokens = assembled.total_tokens,
            over_budget = assembled.over_budget,
            "Context assembled"
        );
        Ok(assembled)
    }
}

/// Concatenate `documents` in order until the running token total exceeds
/// `max_tokens`.
pub fn assemble_documents(
    question: &str,
    documents: &[RetrievedDocument],
    estimator: &dyn TokenEstimator,
    max_tokens: usize,
) -> AssembledContext {
    let mut context_text = String::new();
    let mut sources = Vec::new();
    let mut total_tokens = 0usize;
    let mut over_budget = false;

    for document in documents {
        let content = document.content.trim();
        if content.is_empty() {
            continue;
        }

        let cost = estimator.estimate(&document.content);
        let fits = within_budget(total_tokens, cost, max_tokens);
        total_tokens += cost;

        context_text.push_str(content);
        context_text.push_str("\nSOURCE: ");
        context_text.push_str(&document.url);
        context_text.push_str("\n---\n");
        sources.push(document.url.clone());

        if !fits {
            over_budget = true;
            break;
        }
    }

    AssembledContext {
        context_text,
        question: question.to_string(),
        sources,
        total_tokens,
        over_budget,
    }
}
