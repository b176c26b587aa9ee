//! RAG pipeline orchestrator.
//!
//! The [`RagPipeline`] composes a [`Chunker`], an [`EmbeddingProvider`] and
//! an [`AnswerSynthesizer`] under one [`RagConfig`]. It owns no document
//! state; a [`Session`](crate::session::Session) caches the index it builds.
//!
//! Every backend call made through the pipeline is subject to the
//! configured [`CallPolicy`].
//!
//! # Example
//!
//! ```rust,ignore
//! use docchat_rag::{Document, RagConfig, RagPipeline};
//!
//! let pipeline = RagPipeline::builder()
//!     .config(RagConfig::default())
//!     .embedding_provider(Arc::new(embedder))
//!     .synthesizer(Arc::new(generator))
//!     .build()?;
//!
//! let index = pipeline.build_index(&document).await?;
//! let retriever = pipeline.retriever(Arc::new(index))?;
//! let results = retriever.retrieve("What is this about?").await?;
//! let answer = pipeline.answer(&pipeline.render_prompt(&results, "What is this about?")).await?;
//! ```

use std::sync::Arc;

use tracing::{error, info};

use crate::chunking::Chunker;
use crate::config::RagConfig;
use crate::document::{Chunk, Document, SearchResult};
use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};
use crate::index::{BuildOptions, VectorIndex};
use crate::policy::{CallPolicy, GuardedEmbedder};
use crate::retriever::Retriever;
use crate::synthesizer::{AnswerSynthesizer, PromptTemplate, TextStream};

/// The RAG pipeline orchestrator.
///
/// Coordinates indexing (chunk → embed → index) and answering (retrieve →
/// render prompt → generate). Construct one via [`RagPipeline::builder()`].
pub struct RagPipeline {
    config: RagConfig,
    embedding_provider: Arc<dyn EmbeddingProvider>,
    synthesizer: Arc<dyn AnswerSynthesizer>,
    chunker: Arc<dyn Chunker>,
    template: PromptTemplate,
    policy: CallPolicy,
}

impl RagPipeline {
    /// Create a new [`RagPipelineBuilder`].
    pub fn builder() -> RagPipelineBuilder {
        RagPipelineBuilder::default()
    }

    /// Return a reference to the pipeline configuration.
    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    /// Return a reference to the embedding provider, without the call policy applied.
    pub fn embedding_provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedding_provider
    }

    /// Return a reference to the answer synthesizer.
    pub fn synthesizer(&self) -> &Arc<dyn AnswerSynthesizer> {
        &self.synthesizer
    }

    /// Return the prompt template.
    pub fn template(&self) -> &PromptTemplate {
        &self.template
    }

    /// Return the timeout and retry policy for backend calls.
    pub fn call_policy(&self) -> CallPolicy {
        self.policy
    }

    /// Split a document with the configured chunker.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::EmptyDocument`] if the document has no
    /// non-whitespace text.
    pub fn chunk(&self, document: &Document) -> Result<Vec<Chunk>> {
        self.chunker.chunk(document)
    }

    /// Chunk, embed and index a document.
    ///
    /// # Errors
    ///
    /// Returns the chunking error, or the embedding error after the call
    /// policy's retries are spent.
    pub async fn build_index(&self, document: &Document) -> Result<VectorIndex> {
        let chunks = self.chunk(document)?;
        self.index_chunks(chunks).await.inspect_err(|e| {
            error!(document.id = %document.id, error = %e, "indexing failed");
        })
    }

    /// Embed already chunked text into a new index.
    pub async fn index_chunks(&self, chunks: Vec<Chunk>) -> Result<VectorIndex> {
        let embedder = self.guarded_embedder();
        let index =
            VectorIndex::build(chunks, &embedder, self.config.metric, self.build_options()).await?;
        info!(
            chunk_count = index.len(),
            dimensions = ?index.dimensions(),
            metric = %index.metric(),
            "index built"
        );
        Ok(index)
    }

    /// Create a [`Retriever`] over `index` using the configured `top_k` and
    /// similarity threshold.
    pub fn retriever(&self, index: Arc<VectorIndex>) -> Result<Retriever> {
        Ok(Retriever::new(index, Arc::new(self.guarded_embedder()), self.config.top_k)?
            .with_similarity_threshold(self.config.similarity_threshold))
    }

    /// Render the prompt for `question` over `results`.
    pub fn render_prompt(&self, results: &[SearchResult], question: &str) -> String {
        self.template.render(results, question)
    }

    /// Generate the complete answer for a rendered prompt.
    ///
    /// # Errors
    ///
    /// Returns the synthesizer's error after the call policy's retries are
    /// spent. A failed generation never yields an empty answer.
    pub async fn answer(&self, prompt: &str) -> Result<String> {
        let synthesizer = &self.synthesizer;
        self.policy.run("generate", || synthesizer.generate(prompt)).await.inspect_err(|e| {
            error!(synthesizer = synthesizer.name(), error = %e, "generation failed");
        })
    }

    /// Open a streaming generation for a rendered prompt.
    ///
    /// The call policy covers opening the stream; the caller bounds the wait
    /// for each fragment.
    pub async fn answer_stream(&self, prompt: &str) -> Result<TextStream> {
        let synthesizer = &self.synthesizer;
        self.policy.run("generate", || synthesizer.generate_stream(prompt)).await.inspect_err(|e| {
            error!(synthesizer = synthesizer.name(), error = %e, "generation failed");
        })
    }

    fn guarded_embedder(&self) -> GuardedEmbedder {
        GuardedEmbedder::new(Arc::clone(&self.embedding_provider), self.policy)
    }

    fn build_options(&self) -> BuildOptions {
        BuildOptions {
            batch_size: self.config.embed_batch_size,
            concurrency: self.config.embed_concurrency,
        }
    }
}

/// Builder for constructing a [`RagPipeline`].
///
/// The embedding provider and synthesizer are required. The configuration
/// defaults to [`RagConfig::default()`], the chunker to the one named by the
/// configuration, and the template to [`PromptTemplate::default()`].
///
/// # Example
///
/// ```rust,ignore
/// let pipeline = RagPipeline::builder()
///     .config(config)
///     .embedding_provider(Arc::new(embedder))
///     .synthesizer(Arc::new(generator))
///     .prompt_template(PromptTemplate::new("{context}\n\nQ: {question}\nA:")?)  // optional
///     .build()?;
/// ```
#[derive(Default)]
pub struct RagPipelineBuilder {
    config: Option<RagConfig>,
    embedding_provider: Option<Arc<dyn EmbeddingProvider>>,
    synthesizer: Option<Arc<dyn AnswerSynthesizer>>,
    chunker: Option<Arc<dyn Chunker>>,
    template: Option<PromptTemplate>,
}

impl RagPipelineBuilder {
    /// Set the pipeline configuration.
    pub fn config(mut self, config: RagConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the embedding provider.
    pub fn embedding_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedding_provider = Some(provider);
        self
    }

    /// Set the answer synthesizer.
    pub fn synthesizer(mut self, synthesizer: Arc<dyn AnswerSynthesizer>) -> Self {
        self.synthesizer = Some(synthesizer);
        self
    }

    /// Override the chunker selected by the configuration.
    pub fn chunker(mut self, chunker: Arc<dyn Chunker>) -> Self {
        self.chunker = Some(chunker);
        self
    }

    /// Override the default prompt template.
    pub fn prompt_template(mut self, template: PromptTemplate) -> Self {
        self.template = Some(template);
        self
    }

    /// Build the [`RagPipeline`].
    ///
    /// # Errors
    ///
    /// Returns [`RagError::InvalidConfiguration`] if a required field is
    /// missing or the configuration fails validation.
    pub fn build(self) -> Result<RagPipeline> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let embedding_provider = self.embedding_provider.ok_or_else(|| {
            RagError::InvalidConfiguration("embedding_provider is required".to_string())
        })?;
        let synthesizer = self
            .synthesizer
            .ok_or_else(|| RagError::InvalidConfiguration("synthesizer is required".to_string()))?;
        let chunker = match self.chunker {
            Some(chunker) => chunker,
            None => Arc::from(config.chunking.chunker(config.chunk_size, config.chunk_overlap)?),
        };
        let policy = CallPolicy::from_config(&config);

        Ok(RagPipeline {
            config,
            embedding_provider,
            synthesizer,
            chunker,
            template: self.template.unwrap_or_default(),
            policy,
        })
    }
}
