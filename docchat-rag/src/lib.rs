//! # docchat-rag
//!
//! Retrieval-augmented question answering over a single document, backed by
//! locally hosted models.
//!
//! ## Overview
//!
//! A document is split into overlapping chunks, each chunk is embedded, and
//! the vectors are kept in an in-memory [`VectorIndex`]. For every question
//! the [`Retriever`] returns the most similar chunks, which are rendered into
//! a [`PromptTemplate`] and handed to an [`AnswerSynthesizer`]. A [`Session`]
//! caches the processed document so follow-up questions reuse the index.
//!
//! - [`Chunker`]: [`FixedSizeChunker`] and separator-aware [`RecursiveChunker`]
//! - [`EmbeddingProvider`] / [`AnswerSynthesizer`]: model seams
//! - [`ollama`]: Ollama-backed implementations of both (feature `ollama`)
//! - [`mock`]: deterministic offline backends for tests and demos
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use docchat_rag::ollama::{OllamaConfig, OllamaEmbeddingProvider, OllamaGenerator};
//! use docchat_rag::{Document, RagConfig, RagPipeline, Session};
//! use tokio_util::sync::CancellationToken;
//!
//! let ollama = OllamaConfig::from_env();
//! let pipeline = RagPipeline::builder()
//!     .config(RagConfig::default())
//!     .embedding_provider(Arc::new(OllamaEmbeddingProvider::new(&ollama)?))
//!     .synthesizer(Arc::new(OllamaGenerator::new(&ollama)?))
//!     .build()?;
//!
//! let session = Session::new(Arc::new(pipeline));
//! let cancel = CancellationToken::new();
//! session.ingest(Document::new("notes.txt", text), &cancel).await?;
//! let outcome = session.query("What is this about?", &cancel).await?;
//! ```

pub mod chunking;
pub mod config;
pub mod distance;
pub mod document;
pub mod embedding;
pub mod error;
pub mod index;
pub mod mock;
#[cfg(feature = "ollama")]
pub mod ollama;
pub mod pipeline;
pub mod policy;
pub mod retriever;
pub mod session;
pub mod synthesizer;

pub use chunking::{Chunker, ChunkingStrategy, FixedSizeChunker, RecursiveChunker, chunk_document};
pub use config::{CachePolicy, RagConfig, RagConfigBuilder};
pub use distance::DistanceMetric;
pub use document::{Chunk, Document, SearchResult};
pub use embedding::EmbeddingProvider;
pub use error::{RagError, Result};
pub use index::{BuildOptions, IndexState, VectorIndex};
pub use pipeline::{RagPipeline, RagPipelineBuilder};
pub use policy::{CallPolicy, GuardedEmbedder, cancellable};
pub use retriever::Retriever;
pub use session::{IngestReport, Message, QueryEvent, QueryOutcome, Role, Session, SessionState};
pub use synthesizer::{AnswerSynthesizer, DEFAULT_TEMPLATE, PromptTemplate, TextStream};
