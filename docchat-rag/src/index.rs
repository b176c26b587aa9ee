//! In-memory nearest-neighbour index over embedded chunks.
//!
//! [`VectorIndex`] owns its chunks and their embeddings and answers queries
//! with an exact scan under its [`DistanceMetric`]. Construction is
//! all-or-nothing: chunks are embedded and validated off to the side, and only
//! a fully consistent set is ever installed.
//!
//! Snapshots are directories holding `metadata.json` and `chunks.json`.
//! `f32` values round-trip exactly through JSON, so a loaded index returns the
//! same results as the one that was persisted.

use std::collections::HashMap;
use std::path::Path;

use futures::{StreamExt, TryStreamExt, stream};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::distance::DistanceMetric;
use crate::document::{Chunk, SearchResult};
use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};

const FORMAT_VERSION: u32 = 1;
const METADATA_FILE: &str = "metadata.json";
const CHUNKS_FILE: &str = "chunks.json";

/// Lifecycle state of a [`VectorIndex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    /// No chunks have been inserted.
    Empty,
    /// At least one embedded chunk is present.
    Populated,
}

/// How chunk embeddings are requested while building an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildOptions {
    /// Number of chunk texts per `embed_batch` call.
    pub batch_size: usize,
    /// Maximum number of `embed_batch` calls in flight.
    pub concurrency: usize,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self { batch_size: 16, concurrency: 4 }
    }
}

/// Snapshot header stored next to the chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotMetadata {
    format_version: u32,
    metric: DistanceMetric,
    dimensions: Option<usize>,
    chunk_count: usize,
}

/// An exact nearest-neighbour index over chunk embeddings.
///
/// All vectors in one index share one dimensionality, fixed by the first
/// insertion.
///
/// # Example
///
/// ```rust,ignore
/// use docchat_rag::{BuildOptions, DistanceMetric, VectorIndex};
///
/// let index = VectorIndex::build(chunks, &embedder, DistanceMetric::Cosine, BuildOptions::default()).await?;
/// let results = index.search(&query_embedding, 3)?;
/// index.persist("faiss_index").await?;
/// ```
#[derive(Debug, Clone)]
pub struct VectorIndex {
    metric: DistanceMetric,
    dimensions: Option<usize>,
    chunks: Vec<Chunk>,
    positions: HashMap<String, usize>,
}

impl Default for VectorIndex {
    fn default() -> Self {
        Self::new(DistanceMetric::default())
    }
}

impl VectorIndex {
    /// Create an empty index.
    pub fn new(metric: DistanceMetric) -> Self {
        Self { metric, dimensions: None, chunks: Vec::new(), positions: HashMap::new() }
    }

    /// Embed every chunk and build a populated index.
    ///
    /// # Errors
    ///
    /// Returns the embedder's error if any embedding call fails, and
    /// [`RagError::DimensionMismatch`] if the embedder returns vectors of
    /// different lengths. No index is produced in either case.
    pub async fn build(
        chunks: Vec<Chunk>,
        embedder: &dyn EmbeddingProvider,
        metric: DistanceMetric,
        options: BuildOptions,
    ) -> Result<Self> {
        let mut index = Self::new(metric);
        index.insert(chunks, embedder, options).await?;
        Ok(index)
    }

    /// Embed and add chunks. A chunk whose ID is already present replaces
    /// the existing entry. Returns the number of chunks inserted.
    ///
    /// # Errors
    ///
    /// Same as [`VectorIndex::build`]; on error the index is unchanged.
    pub async fn insert(
        &mut self,
        chunks: Vec<Chunk>,
        embedder: &dyn EmbeddingProvider,
        options: BuildOptions,
    ) -> Result<usize> {
        let embedded = embed_chunks(chunks, embedder, options).await?;
        let dimensions = check_dimensions(self.dimensions, &embedded)?;

        let count = embedded.len();
        for chunk in embedded {
            match self.positions.get(&chunk.id) {
                Some(&pos) => self.chunks[pos] = chunk,
                None => {
                    self.positions.insert(chunk.id.clone(), self.chunks.len());
                    self.chunks.push(chunk);
                }
            }
        }
        if count > 0 {
            self.dimensions = dimensions;
        }

        debug!(inserted = count, total = self.chunks.len(), "index updated");
        Ok(count)
    }

    /// Replace every chunk in the index.
    ///
    /// # Errors
    ///
    /// Same as [`VectorIndex::build`]; on error the index is unchanged.
    pub async fn rebuild(
        &mut self,
        chunks: Vec<Chunk>,
        embedder: &dyn EmbeddingProvider,
        options: BuildOptions,
    ) -> Result<()> {
        *self = Self::build(chunks, embedder, self.metric, options).await?;
        Ok(())
    }

    /// Return the `k` chunks most similar to `query`, most relevant first.
    ///
    /// `k` is clamped to the number of chunks. Ties are broken by
    /// `sequence_index`, then chunk ID, so results are deterministic.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::InvalidConfiguration`] if `k == 0` and
    /// [`RagError::DimensionMismatch`] if `query` has the wrong length.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchResult>> {
        if k == 0 {
            return Err(RagError::InvalidConfiguration("k must be greater than zero".to_string()));
        }
        let Some(dimensions) = self.dimensions else {
            return Ok(Vec::new());
        };
        if query.len() != dimensions {
            return Err(RagError::DimensionMismatch { expected: dimensions, actual: query.len() });
        }

        let mut scored: Vec<(f32, &Chunk)> = self
            .chunks
            .iter()
            .map(|chunk| {
                let score = self.metric.similarity(&chunk.embedding, query);
                (if score.is_nan() { f32::NEG_INFINITY } else { score }, chunk)
            })
            .collect();

        scored.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then_with(|| a.1.sequence_index.cmp(&b.1.sequence_index))
                .then_with(|| a.1.id.cmp(&b.1.id))
        });
        scored.truncate(k);

        Ok(scored.into_iter().map(|(score, chunk)| SearchResult { chunk: chunk.clone(), score }).collect())
    }

    /// Number of chunks in the index.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether the index holds no chunks.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> IndexState {
        if self.chunks.is_empty() { IndexState::Empty } else { IndexState::Populated }
    }

    /// Dimensionality shared by every vector, once known.
    pub fn dimensions(&self) -> Option<usize> {
        self.dimensions
    }

    /// The metric used to rank results.
    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    /// Chunks in insertion order, with embeddings.
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Write a snapshot of this index to `dir`, creating it if needed.
    ///
    /// Files are written to temporary names and renamed into place, with the
    /// metadata last, so a reader never sees a header for missing chunks.
    pub async fn persist(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;

        let chunks_json = serde_json::to_vec(&self.chunks)
            .map_err(|e| RagError::Persistence(format!("failed to serialize chunks: {e}")))?;
        write_replacing(&dir.join(CHUNKS_FILE), &chunks_json).await?;

        let metadata = SnapshotMetadata {
            format_version: FORMAT_VERSION,
            metric: self.metric,
            dimensions: self.dimensions,
            chunk_count: self.chunks.len(),
        };
        let metadata_json = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| RagError::Persistence(format!("failed to serialize metadata: {e}")))?;
        write_replacing(&dir.join(METADATA_FILE), &metadata_json).await?;

        info!(path = %dir.display(), chunk_count = self.chunks.len(), "persisted index");
        Ok(())
    }

    /// Load a snapshot written by [`VectorIndex::persist`].
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Persistence`] if the directory holds no snapshot,
    /// the format version is unknown, or the chunks disagree with the header.
    pub async fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let metadata_path = dir.join(METADATA_FILE);
        if !tokio::fs::try_exists(&metadata_path).await? {
            return Err(RagError::Persistence(format!(
                "no index snapshot at {}",
                dir.display()
            )));
        }

        let raw = tokio::fs::read(&metadata_path).await?;
        let metadata: SnapshotMetadata = serde_json::from_slice(&raw)
            .map_err(|e| RagError::Persistence(format!("failed to parse metadata: {e}")))?;
        if metadata.format_version != FORMAT_VERSION {
            return Err(RagError::Persistence(format!(
                "unsupported snapshot format version {}",
                metadata.format_version
            )));
        }

        let chunks_path = dir.join(CHUNKS_FILE);
        if !tokio::fs::try_exists(&chunks_path).await? {
            return Err(RagError::Persistence(format!(
                "index snapshot at {} has no {CHUNKS_FILE}",
                dir.display()
            )));
        }
        let raw = tokio::fs::read(&chunks_path).await?;
        let chunks: Vec<Chunk> = serde_json::from_slice(&raw)
            .map_err(|e| RagError::Persistence(format!("failed to parse chunks: {e}")))?;
        if chunks.len() != metadata.chunk_count {
            return Err(RagError::Persistence(format!(
                "snapshot lists {} chunks but holds {}",
                metadata.chunk_count,
                chunks.len()
            )));
        }

        let dimensions = check_dimensions(metadata.dimensions, &chunks)
            .map_err(|e| RagError::Persistence(format!("inconsistent snapshot: {e}")))?;

        let mut positions = HashMap::with_capacity(chunks.len());
        for (pos, chunk) in chunks.iter().enumerate() {
            if positions.insert(chunk.id.clone(), pos).is_some() {
                return Err(RagError::Persistence(format!(
                    "duplicate chunk id '{}' in snapshot",
                    chunk.id
                )));
            }
        }

        info!(path = %dir.display(), chunk_count = chunks.len(), "loaded index");
        Ok(Self { metric: metadata.metric, dimensions, chunks, positions })
    }
}

pub(crate) async fn write_replacing(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Embed chunk texts in batches, at most `options.concurrency` at a time,
/// and attach the vectors in chunk order.
async fn embed_chunks(
    mut chunks: Vec<Chunk>,
    embedder: &dyn EmbeddingProvider,
    options: BuildOptions,
) -> Result<Vec<Chunk>> {
    if chunks.is_empty() {
        return Ok(chunks);
    }

    // Owned batches keep the buffered futures `Send` for any caller lifetime.
    let batches: Vec<Vec<String>> = chunks
        .chunks(options.batch_size.max(1))
        .map(|batch| batch.iter().map(|c| c.text.clone()).collect())
        .collect();

    let embeddings: Vec<Vec<Vec<f32>>> = stream::iter(batches)
        .map(|texts| async move {
            let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
            embed_batch_checked(embedder, &refs).await
        })
        .buffered(options.concurrency.max(1))
        .try_collect()
        .await?;

    for (chunk, embedding) in chunks.iter_mut().zip(embeddings.into_iter().flatten()) {
        chunk.embedding = embedding;
    }
    Ok(chunks)
}

async fn embed_batch_checked(
    embedder: &dyn EmbeddingProvider,
    texts: &[&str],
) -> Result<Vec<Vec<f32>>> {
    let vectors = embedder.embed_batch(texts).await?;
    if vectors.len() != texts.len() {
        return Err(RagError::EmbeddingFailure {
            provider: embedder.name().to_string(),
            message: format!("expected {} embeddings, got {}", texts.len(), vectors.len()),
        });
    }
    Ok(vectors)
}

/// Verify every chunk's embedding has the same non-zero length, and that it
/// matches `expected` when the index already has a dimensionality.
fn check_dimensions(expected: Option<usize>, chunks: &[Chunk]) -> Result<Option<usize>> {
    let mut dimensions = expected;
    for chunk in chunks {
        let actual = chunk.embedding.len();
        if actual == 0 {
            return Err(RagError::EmbeddingFailure {
                provider: "index".to_string(),
                message: format!("chunk '{}' has an empty embedding", chunk.id),
            });
        }
        match dimensions {
            Some(expected) if expected != actual => {
                return Err(RagError::DimensionMismatch { expected, actual });
            }
            Some(_) => {}
            None => dimensions = Some(actual),
        }
    }
    Ok(dimensions)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::chunking::chunk_document;
    use crate::document::Document;
    use crate::mock::HashEmbeddingProvider;

    /// Embeds by looking up the first word of each text.
    struct TableEmbedder {
        batches: AtomicUsize,
    }

    impl TableEmbedder {
        fn new() -> Self {
            Self { batches: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for TableEmbedder {
        fn name(&self) -> &str {
            "table"
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            match text.split_whitespace().next().unwrap_or_default() {
                "north" => Ok(vec![1.0, 0.0]),
                "east" => Ok(vec![0.0, 1.0]),
                "northeast" => Ok(vec![0.7, 0.7]),
                "wide" => Ok(vec![1.0, 0.0, 0.0]),
                "broken" => Err(RagError::EmbeddingFailure {
                    provider: "table".into(),
                    message: "cannot embed".into(),
                }),
                _ => Ok(vec![0.0, 0.0]),
            }
        }

        async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
            self.batches.fetch_add(1, Ordering::Relaxed);
            let mut out = Vec::with_capacity(texts.len());
            for text in texts {
                out.push(self.embed(text).await?);
            }
            Ok(out)
        }

        fn dimensions(&self) -> usize {
            2
        }
    }

    fn chunk(id: &str, text: &str, index: usize) -> Chunk {
        Chunk {
            id: id.to_string(),
            text: text.to_string(),
            document_id: "doc".to_string(),
            start_offset: 0,
            sequence_index: index,
            metadata: HashMap::new(),
            embedding: Vec::new(),
        }
    }

    #[tokio::test]
    async fn build_embeds_in_batches_and_preserves_order() {
        let embedder = TableEmbedder::new();
        let chunks = vec![
            chunk("a", "north a", 0),
            chunk("b", "east b", 1),
            chunk("c", "northeast c", 2),
        ];
        let options = BuildOptions { batch_size: 2, concurrency: 2 };
        let index = VectorIndex::build(chunks, &embedder, DistanceMetric::Cosine, options)
            .await
            .unwrap();

        assert_eq!(embedder.batches.load(Ordering::Relaxed), 2);
        assert_eq!(index.state(), IndexState::Populated);
        assert_eq!(index.dimensions(), Some(2));
        assert_eq!(index.chunks()[1].embedding, vec![0.0, 1.0]);
    }

    #[tokio::test]
    async fn search_ranks_and_clamps_k() {
        let embedder = TableEmbedder::new();
        let chunks = vec![
            chunk("a", "north", 0),
            chunk("b", "east", 1),
            chunk("c", "northeast", 2),
        ];
        let index =
            VectorIndex::build(chunks, &embedder, DistanceMetric::Cosine, BuildOptions::default())
                .await
                .unwrap();

        let results = index.search(&[1.0, 0.1], 10).unwrap();
        let ids: Vec<&str> = results.iter().map(|r| r.chunk.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
        assert!(results.windows(2).all(|w| w[0].score >= w[1].score));

        assert_eq!(index.search(&[1.0, 0.0], 1).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn search_rejects_zero_k_and_wrong_dimensions() {
        let embedder = TableEmbedder::new();
        let index = VectorIndex::build(
            vec![chunk("a", "north", 0)],
            &embedder,
            DistanceMetric::Cosine,
            BuildOptions::default(),
        )
        .await
        .unwrap();

        assert!(matches!(index.search(&[1.0, 0.0], 0), Err(RagError::InvalidConfiguration(_))));
        assert!(matches!(
            index.search(&[1.0, 0.0, 0.0], 1),
            Err(RagError::DimensionMismatch { expected: 2, actual: 3 })
        ));
    }

    #[test]
    fn empty_index_returns_no_results() {
        let index = VectorIndex::new(DistanceMetric::Cosine);
        assert_eq!(index.state(), IndexState::Empty);
        assert!(index.search(&[1.0], 3).unwrap().is_empty());
    }

    #[tokio::test]
    async fn mixed_dimensions_fail_the_whole_build() {
        let embedder = TableEmbedder::new();
        let chunks = vec![chunk("a", "north", 0), chunk("b", "wide", 1)];
        let err = VectorIndex::build(chunks, &embedder, DistanceMetric::Cosine, BuildOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::DimensionMismatch { expected: 2, actual: 3 }));
    }

    #[tokio::test]
    async fn failed_insert_leaves_index_unchanged() {
        let embedder = TableEmbedder::new();
        let mut index = VectorIndex::build(
            vec![chunk("a", "north", 0)],
            &embedder,
            DistanceMetric::Cosine,
            BuildOptions::default(),
        )
        .await
        .unwrap();

        let err = index
            .insert(
                vec![chunk("b", "east", 1), chunk("c", "broken", 2)],
                &embedder,
                BuildOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::EmbeddingFailure { .. }));
        assert_eq!(index.len(), 1);

        let err = index
            .insert(vec![chunk("d", "wide", 3)], &embedder, BuildOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::DimensionMismatch { .. }));
        assert_eq!(index.len(), 1);

        let err = index
            .rebuild(vec![chunk("e", "broken", 0)], &embedder, BuildOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::EmbeddingFailure { .. }));
        assert_eq!(index.chunks()[0].id, "a");
    }

    #[tokio::test]
    async fn insert_replaces_chunks_with_the_same_id() {
        let embedder = TableEmbedder::new();
        let mut index = VectorIndex::new(DistanceMetric::Cosine);
        index.insert(vec![chunk("a", "north", 0)], &embedder, BuildOptions::default()).await.unwrap();
        index.insert(vec![chunk("a", "east", 0)], &embedder, BuildOptions::default()).await.unwrap();

        assert_eq!(index.len(), 1);
        assert_eq!(index.chunks()[0].embedding, vec![0.0, 1.0]);
    }

    #[tokio::test]
    async fn persist_and_load_round_trip() {
        let embedder = HashEmbeddingProvider::new(64);
        let document = Document::new("story", "The cat sat. The dog ran. The bird flew away home.");
        let chunks = chunk_document(&document, 16, 4).unwrap();
        let index =
            VectorIndex::build(chunks, &embedder, DistanceMetric::Cosine, BuildOptions::default())
                .await
                .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faiss_index");
        index.persist(&path).await.unwrap();
        let loaded = VectorIndex::load(&path).await.unwrap();

        assert_eq!(loaded.chunks(), index.chunks());
        assert_eq!(loaded.metric(), index.metric());
        assert_eq!(loaded.dimensions(), index.dimensions());

        let query = embedder.embed("where is the dog").await.unwrap();
        assert_eq!(loaded.search(&query, 3).unwrap(), index.search(&query, 3).unwrap());
    }

    #[tokio::test]
    async fn load_rejects_missing_and_corrupt_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let err = VectorIndex::load(dir.path().join("nothing")).await.unwrap_err();
        assert!(matches!(err, RagError::Persistence(_)));

        let embedder = TableEmbedder::new();
        let index = VectorIndex::build(
            vec![chunk("a", "north", 0)],
            &embedder,
            DistanceMetric::Cosine,
            BuildOptions::default(),
        )
        .await
        .unwrap();
        index.persist(dir.path()).await.unwrap();
        tokio::fs::write(dir.path().join(CHUNKS_FILE), b"[]").await.unwrap();

        let err = VectorIndex::load(dir.path()).await.unwrap_err();
        assert!(matches!(err, RagError::Persistence(_)));
    }
}
