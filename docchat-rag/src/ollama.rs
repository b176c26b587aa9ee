//! Embedding and generation backends for a local Ollama server.
//!
//! This module is only available when the `ollama` feature is enabled.
//!
//! Both backends talk to the server through [`ollama_rs`]:
//! [`OllamaEmbeddingProvider`] uses the batch embeddings API and
//! [`OllamaGenerator`] the completion API, streamed or not.
//!
//! Transport failures (connection refused, reset, timed out) map to
//! [`RagError::BackendUnavailable`] so the pipeline's call policy retries
//! them. Errors reported by the server map to
//! [`RagError::EmbeddingFailure`] or [`RagError::GenerationFailure`].

use std::error::Error as StdError;
use std::iter;

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use ollama_rs::Ollama;
use ollama_rs::error::OllamaError;
use ollama_rs::generation::completion::request::GenerationRequest;
use ollama_rs::generation::embeddings::request::{EmbeddingsInput, GenerateEmbeddingsRequest};
use ollama_rs::models::ModelOptions;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};
use crate::synthesizer::{AnswerSynthesizer, TextStream};

const PROVIDER: &str = "ollama";

/// The default Ollama endpoint.
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Port used when the base URL names none.
pub const DEFAULT_PORT: u16 = 11434;

/// The default embedding model.
pub const DEFAULT_EMBEDDING_MODEL: &str = "nomic-embed-text";

/// The dimensionality of `nomic-embed-text`.
pub const DEFAULT_DIMENSIONS: usize = 768;

/// The default generation model.
pub const DEFAULT_GENERATION_MODEL: &str = "llama3.2:latest";

/// Connection and model settings for an Ollama server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    /// Server base URL, without a trailing slash.
    pub base_url: String,
    /// Model used for embeddings.
    pub embedding_model: String,
    /// Model used for answer generation.
    pub generation_model: String,
    /// Length of the vectors produced by `embedding_model`.
    pub dimensions: usize,
    /// Sampling temperature passed in the model options, if set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            generation_model: DEFAULT_GENERATION_MODEL.to_string(),
            dimensions: DEFAULT_DIMENSIONS,
            temperature: None,
        }
    }
}

impl OllamaConfig {
    /// Defaults overridden by `OLLAMA_HOST`, `DOCCHAT_EMBED_MODEL` and
    /// `DOCCHAT_CHAT_MODEL` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(host) = std::env::var("OLLAMA_HOST") {
            config = config.with_base_url(host);
        }
        if let Ok(model) = std::env::var("DOCCHAT_EMBED_MODEL") {
            config.embedding_model = model;
        }
        if let Ok(model) = std::env::var("DOCCHAT_CHAT_MODEL") {
            config.generation_model = model;
        }
        config
    }

    /// Set the base URL. A bare `host:port` gets an `http://` scheme.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        let url = url.trim().trim_end_matches('/');
        self.base_url = if url.contains("://") { url.to_string() } else { format!("http://{url}") };
        self
    }

    /// Build a client for the configured server.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::InvalidConfiguration`] for an unparseable base URL
    /// or an empty model name.
    fn client(&self) -> Result<Ollama> {
        if self.embedding_model.is_empty() || self.generation_model.is_empty() {
            return Err(RagError::InvalidConfiguration("ollama model names must not be empty".into()));
        }
        let (host, port) = host_and_port(&self.base_url)?;
        Ok(Ollama::new(host, port))
    }
}

/// Split a base URL into the `scheme://host` and port `Ollama::new` expects.
fn host_and_port(base_url: &str) -> Result<(String, u16)> {
    let invalid = |reason: String| {
        RagError::InvalidConfiguration(format!("invalid ollama base_url '{base_url}': {reason}"))
    };
    let url = reqwest::Url::parse(base_url).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
    }
    let host = url.host_str().ok_or_else(|| invalid("missing host".to_string()))?;
    Ok((format!("{}://{host}", url.scheme()), url.port().unwrap_or(DEFAULT_PORT)))
}

#[derive(Debug, Clone, Copy)]
enum Endpoint {
    Embed,
    Generate,
}

impl Endpoint {
    fn failure(self, message: String) -> RagError {
        match self {
            Endpoint::Embed => RagError::EmbeddingFailure { provider: PROVIDER.into(), message },
            Endpoint::Generate => RagError::GenerationFailure { provider: PROVIDER.into(), message },
        }
    }

    /// Classify a client error as a transport outage or a request failure.
    fn error(self, err: OllamaError) -> RagError {
        error!(provider = PROVIDER, endpoint = ?self, error = %err, "request failed");
        if is_transport(&err) {
            RagError::BackendUnavailable { backend: PROVIDER.into(), message: err.to_string() }
        } else {
            self.failure(err.to_string())
        }
    }
}

/// Whether any error in the source chain is a failure to reach the server.
fn is_transport(err: &(dyn StdError + 'static)) -> bool {
    iter::successors(Some(err), |e: &&(dyn StdError + 'static)| (*e).source()).any(|e| {
        if let Some(http) = e.downcast_ref::<reqwest::Error>() {
            return http.is_connect() || http.is_timeout();
        }
        e.is::<std::io::Error>()
    })
}

/// An [`EmbeddingProvider`] backed by Ollama's embeddings API.
///
/// # Example
///
/// ```rust,ignore
/// use docchat_rag::ollama::{OllamaConfig, OllamaEmbeddingProvider};
///
/// let provider = OllamaEmbeddingProvider::new(&OllamaConfig::from_env())?;
/// let embedding = provider.embed("hello world").await?;
/// ```
pub struct OllamaEmbeddingProvider {
    client: Ollama,
    model: String,
    dimensions: usize,
}

impl OllamaEmbeddingProvider {
    /// Create a provider for `config.embedding_model`.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::InvalidConfiguration`] for an invalid base URL or
    /// an empty model name.
    pub fn new(config: &OllamaConfig) -> Result<Self> {
        Ok(Self {
            client: config.client()?,
            model: config.embedding_model.clone(),
            dimensions: config.dimensions,
        })
    }

    /// The embedding model name.
    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbeddingProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let results = self.embed_batch(&[text]).await?;
        results.into_iter().next().ok_or_else(|| {
            Endpoint::Embed.failure("API returned no embeddings".into())
        })
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!(provider = PROVIDER, batch_size = texts.len(), model = %self.model, "embedding batch");

        let input = EmbeddingsInput::Multiple(texts.iter().map(|t| t.to_string()).collect());
        let request = GenerateEmbeddingsRequest::new(self.model.clone(), input);
        let response =
            self.client.generate_embeddings(request).await.map_err(|e| Endpoint::Embed.error(e))?;

        if response.embeddings.len() != texts.len() {
            return Err(Endpoint::Embed.failure(format!(
                "requested {} embeddings, received {}",
                texts.len(),
                response.embeddings.len()
            )));
        }
        Ok(response.embeddings)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// An [`AnswerSynthesizer`] backed by Ollama's completion API.
pub struct OllamaGenerator {
    client: Ollama,
    model: String,
    temperature: Option<f32>,
}

impl OllamaGenerator {
    /// Create a generator for `config.generation_model`.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::InvalidConfiguration`] for an invalid base URL or
    /// an empty model name.
    pub fn new(config: &OllamaConfig) -> Result<Self> {
        Ok(Self {
            client: config.client()?,
            model: config.generation_model.clone(),
            temperature: config.temperature,
        })
    }

    /// The generation model name.
    pub fn model(&self) -> &str {
        &self.model
    }

    fn request(&self, prompt: &str) -> GenerationRequest {
        let request = GenerationRequest::new(self.model.clone(), prompt.to_string());
        match self.temperature {
            Some(temperature) => request.options(ModelOptions::default().temperature(temperature)),
            None => request,
        }
    }
}

#[async_trait]
impl AnswerSynthesizer for OllamaGenerator {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        debug!(provider = PROVIDER, model = %self.model, prompt_len = prompt.len(), "generating");

        let response =
            self.client.generate(self.request(prompt)).await.map_err(|e| Endpoint::Generate.error(e))?;
        Ok(response.response)
    }

    /// Stream answer fragments. The stream ends after the server marks the
    /// response done; a stream that closes before that yields a
    /// [`RagError::GenerationFailure`].
    async fn generate_stream(&self, prompt: &str) -> Result<TextStream> {
        debug!(provider = PROVIDER, model = %self.model, prompt_len = prompt.len(), "streaming generation");

        let mut responses = self
            .client
            .generate_stream(self.request(prompt))
            .await
            .map_err(|e| Endpoint::Generate.error(e))?;

        let fragments = stream! {
            let mut done = false;
            let mut failed = false;
            while let Some(batch) = responses.next().await {
                match batch {
                    Ok(batch) => {
                        for response in batch {
                            done |= response.done;
                            if !response.response.is_empty() {
                                yield Ok(response.response);
                            }
                        }
                    }
                    Err(e) => {
                        failed = true;
                        yield Err(Endpoint::Generate.error(e));
                    }
                }
                if done || failed {
                    break;
                }
            }
            if !done && !failed {
                yield Err(Endpoint::Generate.failure("stream ended before completion".into()));
            }
        };
        Ok(Box::pin(fragments))
    }
}
