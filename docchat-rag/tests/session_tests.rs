//! End-to-end session tests over the offline backends.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use docchat_rag::mock::{ExtractiveSynthesizer, HashEmbeddingProvider};
use docchat_rag::{
    AnswerSynthesizer, CachePolicy, Document, EmbeddingProvider, Message, QueryEvent, RagConfig,
    RagError, RagPipeline, Result, Role, Session, SessionState, TextStream,
};
use futures::stream;
use tokio_util::sync::CancellationToken;

const PETS: &str = "The cat sat. The dog ran. The bird flew.";
const QUESTION: &str = "Where did the dog go?";

fn config() -> RagConfig {
    RagConfig::builder()
        .chunk_size(12)
        .chunk_overlap(4)
        .top_k(1)
        .retries(2, Duration::from_millis(1))
        .build()
        .unwrap()
}

fn session_with(
    config: RagConfig,
    embedder: Arc<dyn EmbeddingProvider>,
    synthesizer: Arc<dyn AnswerSynthesizer>,
) -> Arc<Session> {
    let pipeline = RagPipeline::builder()
        .config(config)
        .embedding_provider(embedder)
        .synthesizer(synthesizer)
        .build()
        .unwrap();
    Arc::new(Session::new(Arc::new(pipeline)))
}

fn offline_session() -> Arc<Session> {
    session_with(
        config(),
        Arc::new(HashEmbeddingProvider::new(128)),
        Arc::new(ExtractiveSynthesizer::new()),
    )
}

/// Fails any text containing "poison"; optionally slow.
struct PoisonEmbedder {
    inner: HashEmbeddingProvider,
    delay: Duration,
}

impl PoisonEmbedder {
    fn new(delay: Duration) -> Self {
        Self { inner: HashEmbeddingProvider::new(128), delay }
    }
}

#[async_trait]
impl EmbeddingProvider for PoisonEmbedder {
    fn name(&self) -> &str {
        "poison"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        tokio::time::sleep(self.delay).await;
        if text.contains("poison") {
            return Err(RagError::EmbeddingFailure { provider: "poison".into(), message: "rejected".into() });
        }
        self.inner.embed(text).await
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }
}

/// Fails the first `failures` calls as unavailable.
struct FlakyEmbedder {
    inner: HashEmbeddingProvider,
    failures: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl EmbeddingProvider for FlakyEmbedder {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(RagError::BackendUnavailable { backend: "flaky".into(), message: "connection refused".into() });
        }
        self.inner.embed(text).await
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }
}

struct FailingSynthesizer;

#[async_trait]
impl AnswerSynthesizer for FailingSynthesizer {
    fn name(&self) -> &str {
        "failing"
    }

    async fn generate(&self, _prompt: &str) -> Result<String> {
        Err(RagError::GenerationFailure { provider: "failing".into(), message: "model crashed".into() })
    }
}

struct StalledSynthesizer;

#[async_trait]
impl AnswerSynthesizer for StalledSynthesizer {
    fn name(&self) -> &str {
        "stalled"
    }

    async fn generate(&self, _prompt: &str) -> Result<String> {
        std::future::pending().await
    }
}

/// Echoes the question back after a delay.
struct SlowEchoSynthesizer {
    delay: Duration,
}

#[async_trait]
impl AnswerSynthesizer for SlowEchoSynthesizer {
    fn name(&self) -> &str {
        "slow-echo"
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        tokio::time::sleep(self.delay).await;
        let question = prompt.lines().find_map(|l| l.strip_prefix("Question: ")).unwrap_or_default();
        Ok(format!("re: {question}"))
    }
}

struct FragmentSynthesizer;

#[async_trait]
impl AnswerSynthesizer for FragmentSynthesizer {
    fn name(&self) -> &str {
        "fragments"
    }

    async fn generate(&self, _prompt: &str) -> Result<String> {
        Ok("The dog ran.".to_string())
    }

    async fn generate_stream(&self, _prompt: &str) -> Result<TextStream> {
        let fragments = ["The ", "dog ", "ran."].map(|f| Ok::<_, RagError>(f.to_string()));
        Ok(Box::pin(stream::iter(fragments)))
    }
}

#[tokio::test]
async fn answers_from_the_most_relevant_chunk() {
    let session = offline_session();
    let cancel = CancellationToken::new();

    let report = session.ingest(Document::new("pets", PETS), &cancel).await.unwrap();
    assert_eq!(report.document_id, "pets");
    assert!(report.chunk_count >= 4);
    assert_eq!(report.dimensions, Some(128));
    assert_eq!(session.state(), SessionState::Ready);

    let outcome = session.query(QUESTION, &cancel).await.unwrap();
    assert_eq!(outcome.results.len(), 1);
    assert!(outcome.results[0].chunk.text.contains("The dog ran."));
    assert!(outcome.answer.contains("ran"));
    assert_eq!(session.history(), vec![Message::user(QUESTION), Message::assistant(outcome.answer)]);
}

#[tokio::test]
async fn query_before_ingest_is_not_ready() {
    let session = offline_session();
    let err = session.query(QUESTION, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, RagError::NotReady { ref state } if state == "empty"));
    assert!(session.history().is_empty());
    assert_eq!(session.state(), SessionState::Empty);
}

#[tokio::test]
async fn blank_query_before_ingest_is_not_ready() {
    let session = offline_session();
    let err = session.query("   ", &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, RagError::NotReady { ref state } if state == "empty"));
    assert!(session.history().is_empty());
}

#[tokio::test]
async fn blank_query_changes_nothing() {
    let session = offline_session();
    let cancel = CancellationToken::new();
    session.ingest(Document::new("pets", PETS), &cancel).await.unwrap();

    let err = session.query("  ", &cancel).await.unwrap_err();
    assert!(matches!(err, RagError::InvalidConfiguration(_)));
    assert!(session.history().is_empty());
}

#[tokio::test]
async fn reingest_replaces_index_and_clears_history() {
    let session = offline_session();
    let cancel = CancellationToken::new();
    session.ingest(Document::new("pets", PETS), &cancel).await.unwrap();
    session.query(QUESTION, &cancel).await.unwrap();

    let geography = "Paris is the capital of France. It sits on the Seine.";
    session.ingest(Document::new("geography", geography), &cancel).await.unwrap();
    assert!(session.history().is_empty());
    assert_eq!(session.document_id().as_deref(), Some("geography"));

    let outcome = session.query(QUESTION, &cancel).await.unwrap();
    assert!(outcome.results.iter().all(|r| r.chunk.document_id == "geography"));
    assert_eq!(session.history().len(), 2);
}

#[tokio::test]
async fn failed_ingest_keeps_previous_document() {
    let session = session_with(
        config(),
        Arc::new(PoisonEmbedder::new(Duration::ZERO)),
        Arc::new(ExtractiveSynthesizer::new()),
    );
    let cancel = CancellationToken::new();
    session.ingest(Document::new("pets", PETS), &cancel).await.unwrap();
    session.query(QUESTION, &cancel).await.unwrap();

    let err = session.ingest(Document::new("bad", "This one has poison in it."), &cancel).await.unwrap_err();
    assert!(matches!(err, RagError::EmbeddingFailure { .. }));
    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(session.document_id().as_deref(), Some("pets"));
    assert_eq!(session.history().len(), 2);

    let outcome = session.query(QUESTION, &cancel).await.unwrap();
    assert_eq!(outcome.results[0].chunk.document_id, "pets");
}

#[tokio::test]
async fn failed_first_ingest_returns_to_empty() {
    let session = session_with(
        config(),
        Arc::new(PoisonEmbedder::new(Duration::ZERO)),
        Arc::new(ExtractiveSynthesizer::new()),
    );
    let err = session.ingest(Document::new("bad", "poison"), &CancellationToken::new()).await;
    assert!(err.is_err());
    assert_eq!(session.state(), SessionState::Empty);
    assert!(session.index().is_none());
}

#[tokio::test]
async fn empty_document_is_rejected_without_state_change() {
    let session = offline_session();
    let err = session.ingest(Document::new("blank", "\n  \n"), &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, RagError::EmptyDocument { .. }));
    assert_eq!(session.state(), SessionState::Empty);
}

#[tokio::test]
async fn cancelled_ingest_rolls_back() {
    let session = session_with(
        config(),
        Arc::new(PoisonEmbedder::new(Duration::from_millis(200))),
        Arc::new(ExtractiveSynthesizer::new()),
    );
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let err = session.ingest(Document::new("pets", PETS), &cancel).await.unwrap_err();
    assert!(matches!(err, RagError::Cancelled));
    assert_eq!(session.state(), SessionState::Empty);
}

#[tokio::test]
async fn query_during_processing_is_not_ready() {
    let session = session_with(
        config(),
        Arc::new(PoisonEmbedder::new(Duration::from_millis(50))),
        Arc::new(ExtractiveSynthesizer::new()),
    );
    let ingesting = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.ingest(Document::new("pets", PETS), &CancellationToken::new()).await })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        while session.state() != SessionState::Processing {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    let err = session.query(QUESTION, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, RagError::NotReady { ref state } if state == "processing"));

    ingesting.await.unwrap().unwrap();
    assert_eq!(session.state(), SessionState::Ready);
    assert!(session.history().is_empty());
}

#[tokio::test]
async fn cancelled_query_keeps_only_the_user_message() {
    let session = session_with(
        config(),
        Arc::new(HashEmbeddingProvider::new(128)),
        Arc::new(StalledSynthesizer),
    );
    session.ingest(Document::new("pets", PETS), &CancellationToken::new()).await.unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let err = session.query(QUESTION, &cancel).await.unwrap_err();
    assert!(matches!(err, RagError::Cancelled));
    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(session.history(), vec![Message::user(QUESTION)]);
}

#[tokio::test]
async fn generation_failure_is_surfaced() {
    let session = session_with(
        config(),
        Arc::new(HashEmbeddingProvider::new(128)),
        Arc::new(FailingSynthesizer),
    );
    let cancel = CancellationToken::new();
    session.ingest(Document::new("pets", PETS), &cancel).await.unwrap();

    let err = session.query(QUESTION, &cancel).await.unwrap_err();
    assert!(matches!(err, RagError::GenerationFailure { ref message, .. } if message == "model crashed"));
    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(session.history(), vec![Message::user(QUESTION)]);
}

#[tokio::test]
async fn unavailable_backend_is_retried() {
    let embedder = Arc::new(FlakyEmbedder {
        inner: HashEmbeddingProvider::new(128),
        failures: 2,
        calls: AtomicUsize::new(0),
    });
    let session = session_with(config(), embedder.clone(), Arc::new(ExtractiveSynthesizer::new()));
    session.ingest(Document::new("pets", PETS), &CancellationToken::new()).await.unwrap();
    assert_eq!(session.state(), SessionState::Ready);
}

#[tokio::test]
async fn retries_stop_at_the_budget() {
    let embedder = Arc::new(FlakyEmbedder {
        inner: HashEmbeddingProvider::new(128),
        failures: 3,
        calls: AtomicUsize::new(0),
    });
    let session = session_with(config(), embedder.clone(), Arc::new(ExtractiveSynthesizer::new()));
    let err = session.ingest(Document::new("pets", PETS), &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, RagError::BackendUnavailable { .. }));
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
    assert_eq!(session.state(), SessionState::Empty);
}

#[tokio::test]
async fn recompute_always_reembeds_on_every_query() {
    let embedder = Arc::new(HashEmbeddingProvider::new(128));
    let mut config = config();
    config.cache_policy = CachePolicy::RecomputeAlways;
    let session = session_with(config, embedder.clone(), Arc::new(ExtractiveSynthesizer::new()));
    let cancel = CancellationToken::new();

    let report = session.ingest(Document::new("pets", PETS), &cancel).await.unwrap();
    let chunks = report.chunk_count;
    assert_eq!(embedder.calls(), chunks);

    session.query(QUESTION, &cancel).await.unwrap();
    session.query(QUESTION, &cancel).await.unwrap();
    assert_eq!(embedder.calls(), chunks + 2 * (chunks + 1));
}

#[tokio::test]
async fn cached_index_is_reused_across_queries() {
    let embedder = Arc::new(HashEmbeddingProvider::new(128));
    let session = session_with(config(), embedder.clone(), Arc::new(ExtractiveSynthesizer::new()));
    let cancel = CancellationToken::new();

    let report = session.ingest(Document::new("pets", PETS), &cancel).await.unwrap();
    session.query(QUESTION, &cancel).await.unwrap();
    session.query("What did the cat do?", &cancel).await.unwrap();
    assert_eq!(embedder.calls(), report.chunk_count + 2);
}

#[tokio::test]
async fn snapshot_restores_without_reembedding() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();

    let original = offline_session();
    original.ingest(Document::new("pets", PETS), &cancel).await.unwrap();
    original.save_snapshot(dir.path()).await.unwrap();

    let embedder = Arc::new(HashEmbeddingProvider::new(128));
    let restored = session_with(config(), embedder.clone(), Arc::new(ExtractiveSynthesizer::new()));
    let report = restored.restore_snapshot(dir.path(), &cancel).await.unwrap();
    assert_eq!(report.document_id, "pets");
    assert_eq!(restored.state(), SessionState::Ready);
    assert_eq!(embedder.calls(), 0);

    let outcome = restored.query(QUESTION, &cancel).await.unwrap();
    assert!(outcome.results[0].chunk.text.contains("The dog ran."));
    assert_eq!(embedder.calls(), 1);
}

#[tokio::test]
async fn restoring_a_missing_snapshot_keeps_state() {
    let dir = tempfile::tempdir().unwrap();
    let session = offline_session();
    let err = session.restore_snapshot(dir.path(), &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, RagError::Persistence(_)));
    assert_eq!(session.state(), SessionState::Empty);
}

#[tokio::test]
async fn ingest_writes_automatic_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let config = RagConfig { snapshot_dir: Some(dir.path().to_path_buf()), ..config() };
    let session = session_with(
        config,
        Arc::new(HashEmbeddingProvider::new(128)),
        Arc::new(ExtractiveSynthesizer::new()),
    );
    session.ingest(Document::new("pets", PETS), &CancellationToken::new()).await.unwrap();

    assert!(dir.path().join("document.json").exists());
    assert!(dir.path().join("index").join("metadata.json").exists());
    assert!(dir.path().join("index").join("chunks.json").exists());
}

#[tokio::test]
async fn spawned_query_streams_events() {
    let session = session_with(
        config(),
        Arc::new(HashEmbeddingProvider::new(128)),
        Arc::new(FragmentSynthesizer),
    );
    session.ingest(Document::new("pets", PETS), &CancellationToken::new()).await.unwrap();

    let mut events = session.spawn_query(QUESTION, CancellationToken::new());
    let mut retrieved = None;
    let mut streamed = String::new();
    let mut completed = None;
    while let Some(event) = events.recv().await {
        match event {
            QueryEvent::Retrieved(results) => retrieved = Some(results),
            QueryEvent::Delta(fragment) => streamed.push_str(&fragment),
            QueryEvent::Completed(outcome) => completed = Some(outcome),
            QueryEvent::Failed(e) => panic!("query failed: {e}"),
        }
    }

    let outcome = completed.expect("query should complete");
    assert_eq!(retrieved.as_deref(), Some(outcome.results.as_slice()));
    assert_eq!(streamed, "The dog ran.");
    assert_eq!(outcome.answer, streamed);
    assert_eq!(session.history().len(), 2);
}

#[tokio::test]
async fn spawned_query_reports_failure() {
    let session = offline_session();
    let mut events = session.spawn_query(QUESTION, CancellationToken::new());
    match events.recv().await {
        Some(QueryEvent::Failed(RagError::NotReady { .. })) => {}
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(events.recv().await.is_none());
}

fn assert_send<T: Send>(_: &T) {}

#[test]
fn session_futures_are_send() {
    let session = offline_session();
    let cancel = CancellationToken::new();
    assert_send(&session.ingest(Document::new("pets", PETS), &cancel));
    assert_send(&session.query(QUESTION, &cancel));
    assert_send(&session.restore_snapshot("snapshot", &cancel));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_queries_take_turns() {
    let session = session_with(
        config(),
        Arc::new(HashEmbeddingProvider::new(128)),
        Arc::new(SlowEchoSynthesizer { delay: Duration::from_millis(50) }),
    );
    session.ingest(Document::new("pets", PETS), &CancellationToken::new()).await.unwrap();

    let tasks: Vec<_> = ["Where did the dog go?", "What did the cat do?"]
        .into_iter()
        .map(|question| {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.query(question, &CancellationToken::new()).await })
        })
        .collect();
    for task in tasks {
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome.answer, format!("re: {}", outcome.query));
    }

    let history = session.history();
    assert_eq!(history.len(), 4);
    for turn in history.chunks(2) {
        assert_eq!(turn[0].role, Role::User);
        assert_eq!(turn[1], Message::assistant(format!("re: {}", turn[0].text)));
    }
}
