//! `docchat`: ask questions about a text document using local models.
//!
//! ```text
//! docchat notes.txt                  # Ollama on localhost:11434
//! docchat --offline notes.txt        # no model server needed
//! docchat --config docchat.json --top-k 5
//! ```

mod repl;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use docchat_rag::mock::{ExtractiveSynthesizer, HashEmbeddingProvider};
use docchat_rag::ollama::{OllamaConfig, OllamaEmbeddingProvider, OllamaGenerator};
use docchat_rag::{
    AnswerSynthesizer, CachePolicy, DistanceMetric, EmbeddingProvider, RagConfig, RagPipeline, Session,
};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "warn,docchat_rag=info";
const OFFLINE_DIMENSIONS: usize = 256;

#[derive(Parser, Debug)]
#[command(name = "docchat", version, about = "Chat with a text document using locally hosted models")]
struct Cli {
    /// Text file to load at startup
    document: Option<PathBuf>,

    /// JSON file with pipeline settings
    #[arg(short, long, env = "DOCCHAT_CONFIG")]
    config: Option<PathBuf>,

    /// Ollama base URL (defaults to OLLAMA_HOST or http://localhost:11434)
    #[arg(long)]
    ollama_host: Option<String>,

    /// Embedding model (defaults to DOCCHAT_EMBED_MODEL or nomic-embed-text)
    #[arg(long)]
    embed_model: Option<String>,

    /// Generation model (defaults to DOCCHAT_CHAT_MODEL or llama3.2:latest)
    #[arg(long)]
    chat_model: Option<String>,

    /// Dimensionality of the embedding model
    #[arg(long)]
    dimensions: Option<usize>,

    /// Number of chunks retrieved per question
    #[arg(short = 'k', long)]
    top_k: Option<usize>,

    /// Maximum chunk size in characters
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Characters shared by consecutive chunks
    #[arg(long)]
    chunk_overlap: Option<usize>,

    /// Similarity metric: cosine, dot_product or euclidean
    #[arg(long)]
    metric: Option<DistanceMetric>,

    /// Rebuild the index before every question
    #[arg(long)]
    recompute: bool,

    /// Save a snapshot here after every load
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,

    /// Use deterministic offline backends instead of Ollama
    #[arg(long)]
    offline: bool,
}

impl Cli {
    fn rag_config(&self) -> Result<RagConfig> {
        let mut config = match &self.config {
            Some(path) => RagConfig::from_json_file(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => RagConfig::default(),
        };

        if let Some(top_k) = self.top_k {
            config.top_k = top_k;
        }
        if let Some(size) = self.chunk_size {
            config.chunk_size = size;
        }
        if let Some(overlap) = self.chunk_overlap {
            config.chunk_overlap = overlap;
        }
        if let Some(metric) = self.metric {
            config.metric = metric;
        }
        if self.recompute {
            config.cache_policy = CachePolicy::RecomputeAlways;
        }
        if let Some(dir) = &self.snapshot_dir {
            config.snapshot_dir = Some(dir.clone());
        }

        config.validate()?;
        Ok(config)
    }

    fn ollama_config(&self) -> OllamaConfig {
        let mut config = OllamaConfig::from_env();
        if let Some(host) = &self.ollama_host {
            config = config.with_base_url(host.as_str());
        }
        if let Some(model) = &self.embed_model {
            config.embedding_model = model.clone();
        }
        if let Some(model) = &self.chat_model {
            config.generation_model = model.clone();
        }
        if let Some(dimensions) = self.dimensions {
            config.dimensions = dimensions;
        }
        config
    }

    fn pipeline(&self) -> Result<RagPipeline> {
        let (embedder, synthesizer): (Arc<dyn EmbeddingProvider>, Arc<dyn AnswerSynthesizer>) =
            if self.offline {
                (
                    Arc::new(HashEmbeddingProvider::new(OFFLINE_DIMENSIONS)),
                    Arc::new(ExtractiveSynthesizer::new()),
                )
            } else {
                let ollama = self.ollama_config();
                tracing::info!(
                    base_url = %ollama.base_url,
                    embedding_model = %ollama.embedding_model,
                    generation_model = %ollama.generation_model,
                    "using ollama"
                );
                (
                    Arc::new(OllamaEmbeddingProvider::new(&ollama)?),
                    Arc::new(OllamaGenerator::new(&ollama)?),
                )
            };

        Ok(RagPipeline::builder()
            .config(self.rag_config()?)
            .embedding_provider(embedder)
            .synthesizer(synthesizer)
            .build()?)
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let session = Arc::new(Session::new(Arc::new(cli.pipeline()?)));
    repl::run(session, cli.document).await
}
