//! Query-time retrieval over a [`VectorIndex`].

use std::sync::Arc;

use tracing::debug;

use crate::distance::DistanceMetric;
use crate::document::SearchResult;
use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};
use crate::index::VectorIndex;

/// Embeds a query and returns the nearest chunks from an index.
///
/// `top_k`, the similarity threshold and the metric (taken from the index)
/// are fixed at construction. Errors from the embedder or the index are
/// returned unchanged.
#[derive(Clone)]
pub struct Retriever {
    index: Arc<VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    top_k: usize,
    similarity_threshold: Option<f32>,
}

impl Retriever {
    /// Create a retriever returning at most `top_k` chunks per query.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::InvalidConfiguration`] if `top_k == 0`.
    pub fn new(
        index: Arc<VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        top_k: usize,
    ) -> Result<Self> {
        if top_k == 0 {
            return Err(RagError::InvalidConfiguration("top_k must be greater than zero".to_string()));
        }
        Ok(Self { index, embedder, top_k, similarity_threshold: None })
    }

    /// Drop results scoring below `threshold`.
    pub fn with_similarity_threshold(mut self, threshold: Option<f32>) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    /// Embed `query` and search the index.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::InvalidConfiguration`] for a blank query, and any
    /// error raised by the embedder or [`VectorIndex::search`].
    pub async fn retrieve(&self, query: &str) -> Result<Vec<SearchResult>> {
        if query.trim().is_empty() {
            return Err(RagError::InvalidConfiguration("query must not be empty".to_string()));
        }

        let query_embedding = self.embedder.embed(query).await?;
        let mut results = self.index.search(&query_embedding, self.top_k)?;

        if let Some(threshold) = self.similarity_threshold {
            results.retain(|r| r.score >= threshold);
        }

        debug!(result_count = results.len(), top_k = self.top_k, "retrieved chunks");
        Ok(results)
    }

    /// The index being searched.
    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    /// Maximum number of results per query.
    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// The metric used to rank results.
    pub fn metric(&self) -> DistanceMetric {
        self.index.metric()
    }
}
