//! Per-conversation cache of the processed document.
//!
//! A [`Session`] moves through `Empty -> Processing -> Ready`. Ingesting a
//! document builds its index off to the side and installs it only on
//! success; queries reuse the cached index until the next document arrives
//! (or rebuild it every time under [`CachePolicy::RecomputeAlways`]).
//!
//! # Example
//!
//! ```rust,ignore
//! use docchat_rag::{Document, Session};
//! use tokio_util::sync::CancellationToken;
//!
//! let session = Session::new(Arc::new(pipeline));
//! let cancel = CancellationToken::new();
//! session.ingest(Document::new("notes.txt", text), &cancel).await?;
//! let outcome = session.query("What is this about?", &cancel).await?;
//! println!("{}", outcome.answer);
//! ```

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::config::CachePolicy;
use crate::document::{Document, SearchResult};
use crate::error::{RagError, Result};
use crate::index::{VectorIndex, write_replacing};
use crate::pipeline::RagPipeline;
use crate::policy::cancellable;
use crate::retriever::Retriever;

const DOCUMENT_FILE: &str = "document.json";
const INDEX_DIR: &str = "index";
const EVENT_BUFFER: usize = 64;

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No document has been ingested.
    Empty,
    /// A document is being chunked and embedded.
    Processing,
    /// A document is indexed and queries are accepted.
    Ready,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Empty => "empty",
            SessionState::Processing => "processing",
            SessionState::Ready => "ready",
        })
    }
}

/// Author of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One entry in the conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub text: String,
}

impl Message {
    /// A message from the user.
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, text: text.into() }
    }

    /// A message from the assistant.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, text: text.into() }
    }
}

/// Summary of a successful ingest or snapshot restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub document_id: String,
    pub chunk_count: usize,
    pub dimensions: Option<usize>,
}

/// The result of one answered query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutcome {
    /// The query as submitted.
    pub query: String,
    /// The chunks passed to the synthesizer, most relevant first.
    pub results: Vec<SearchResult>,
    /// The complete generated answer.
    pub answer: String,
}

/// Progress of a query started with [`Session::spawn_query`].
///
/// A stream always ends with exactly one `Completed` or `Failed`.
#[derive(Debug)]
pub enum QueryEvent {
    /// Retrieval finished; generation is starting.
    Retrieved(Vec<SearchResult>),
    /// A fragment of the answer, in order.
    Delta(String),
    /// The query succeeded.
    Completed(QueryOutcome),
    /// The query failed; the session is unchanged apart from the user message.
    Failed(RagError),
}

/// The indexed document of a ready session.
struct Loaded {
    document: Document,
    retriever: Retriever,
}

struct Inner {
    state: SessionState,
    loaded: Option<Arc<Loaded>>,
    history: Vec<Message>,
}

/// A conversation over one document at a time.
///
/// Operations take `&self`; ingests and queries are serialized by an
/// internal turn lock. A query submitted while an ingest is processing fails
/// immediately with [`RagError::NotReady`] instead of waiting.
pub struct Session {
    id: String,
    pipeline: Arc<RagPipeline>,
    inner: Mutex<Inner>,
    turn: tokio::sync::Mutex<()>,
}

impl Session {
    /// Create an empty session.
    pub fn new(pipeline: Arc<RagPipeline>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            pipeline,
            inner: Mutex::new(Inner {
                state: SessionState::Empty,
                loaded: None,
                history: Vec::new(),
            }),
            turn: tokio::sync::Mutex::new(()),
        }
    }

    /// Unique session identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The pipeline this session runs on.
    pub fn pipeline(&self) -> &Arc<RagPipeline> {
        &self.pipeline
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// A copy of the conversation history, oldest first.
    pub fn history(&self) -> Vec<Message> {
        self.lock().history.clone()
    }

    /// ID of the indexed document, if any.
    pub fn document_id(&self) -> Option<String> {
        self.lock().loaded.as_ref().map(|l| l.document.id.clone())
    }

    /// The current index, if any.
    pub fn index(&self) -> Option<Arc<VectorIndex>> {
        self.lock().loaded.as_ref().map(|l| Arc::clone(l.retriever.index()))
    }

    /// Chunk, embed and index `document`, replacing any previous document
    /// and clearing the history.
    ///
    /// # Errors
    ///
    /// Chunking errors are returned before the session changes state. On an
    /// embedding error, cancellation, or if this future is dropped, the
    /// session returns to its previous state with its previous document.
    pub async fn ingest(
        &self,
        document: Document,
        cancel: &CancellationToken,
    ) -> Result<IngestReport> {
        let span = info_span!("session.ingest", session.id = %self.id, document.id = %document.id);
        async move {
            let chunks = self.pipeline.chunk(&document)?;

            let _turn = self.acquire_turn(cancel).await?;
            let processing = ProcessingGuard::enter(self);

            let index = cancellable(cancel, self.pipeline.index_chunks(chunks)).await?;
            let report = IngestReport {
                document_id: document.id.clone(),
                chunk_count: index.len(),
                dimensions: index.dimensions(),
            };
            let retriever = self.pipeline.retriever(Arc::new(index))?;
            let loaded = Arc::new(Loaded { document, retriever });
            processing.commit(Arc::clone(&loaded));
            info!(chunk_count = report.chunk_count, "ingested document");

            if let Some(dir) = &self.pipeline.config().snapshot_dir {
                if let Err(e) = write_snapshot(dir, &loaded).await {
                    warn!(path = %dir.display(), error = %e, "failed to write session snapshot");
                }
            }
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Answer `text` from the indexed document.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::NotReady`] unless the session is `Ready`, then
    /// [`RagError::InvalidConfiguration`] for a blank query; neither changes
    /// the session. Backend errors and cancellation leave the session
    /// `Ready` with the user message recorded and no assistant reply.
    pub async fn query(&self, text: &str, cancel: &CancellationToken) -> Result<QueryOutcome> {
        self.run_query(text, cancel, None).await
    }

    /// Run a query on a Tokio task, reporting progress over a channel.
    ///
    /// Answer fragments are delivered as [`QueryEvent::Delta`] while the
    /// synthesizer streams them. Dropping the receiver does not stop the
    /// query; cancel `cancel` for that.
    pub fn spawn_query(
        self: &Arc<Self>,
        text: impl Into<String>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<QueryEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let session = Arc::clone(self);
        let text = text.into();
        tokio::spawn(async move {
            let event = match session.run_query(&text, &cancel, Some(&tx)).await {
                Ok(outcome) => QueryEvent::Completed(outcome),
                Err(e) => QueryEvent::Failed(e),
            };
            let _ = tx.send(event).await;
        });
        rx
    }

    /// Write the current document and index to `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::NotReady`] if no document is indexed.
    pub async fn save_snapshot(&self, dir: impl AsRef<Path>) -> Result<()> {
        let loaded = self.ready_state()?;
        write_snapshot(dir.as_ref(), &loaded).await
    }

    /// Replace the current document with one saved by
    /// [`save_snapshot`](Session::save_snapshot), without re-embedding.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Persistence`] if `dir` holds no valid snapshot.
    /// Failure and cancellation roll back exactly as for
    /// [`ingest`](Session::ingest).
    pub async fn restore_snapshot(
        &self,
        dir: impl AsRef<Path>,
        cancel: &CancellationToken,
    ) -> Result<IngestReport> {
        let dir = dir.as_ref();
        let span = info_span!("session.restore", session.id = %self.id, path = %dir.display());
        async move {
            let _turn = self.acquire_turn(cancel).await?;
            let processing = ProcessingGuard::enter(self);

            let (document, index) = cancellable(cancel, read_snapshot(dir)).await?;
            let report = IngestReport {
                document_id: document.id.clone(),
                chunk_count: index.len(),
                dimensions: index.dimensions(),
            };
            let retriever = self.pipeline.retriever(Arc::new(index))?;
            processing.commit(Arc::new(Loaded { document, retriever }));
            info!(document.id = %report.document_id, chunk_count = report.chunk_count, "restored session");
            Ok(report)
        }
        .instrument(span)
        .await
    }

    async fn run_query(
        &self,
        text: &str,
        cancel: &CancellationToken,
        events: Option<&mpsc::Sender<QueryEvent>>,
    ) -> Result<QueryOutcome> {
        let span = info_span!("session.query", session.id = %self.id);
        async move {
            self.ready_state()?;
            if text.trim().is_empty() {
                return Err(RagError::InvalidConfiguration("query must not be empty".to_string()));
            }

            let _turn = self.acquire_turn(cancel).await?;
            let loaded = self.ready_state()?;
            self.lock().history.push(Message::user(text));

            let retriever = match self.pipeline.config().cache_policy {
                CachePolicy::CacheUntilNewDocument => loaded.retriever.clone(),
                CachePolicy::RecomputeAlways => self.recompute(&loaded, cancel).await?,
            };

            let results = cancellable(cancel, retriever.retrieve(text)).await?;
            if let Some(tx) = events {
                let _ = tx.send(QueryEvent::Retrieved(results.clone())).await;
            }

            let prompt = self.pipeline.render_prompt(&results, text);
            let answer = match events {
                Some(tx) => self.stream_answer(&prompt, cancel, tx).await?,
                None => cancellable(cancel, self.pipeline.answer(&prompt)).await?,
            };

            self.lock().history.push(Message::assistant(answer.as_str()));
            info!(result_count = results.len(), answer_len = answer.len(), "answered query");
            Ok(QueryOutcome { query: text.to_string(), results, answer })
        }
        .instrument(span)
        .await
    }

    /// Rebuild the index for the loaded document and install it.
    async fn recompute(&self, loaded: &Loaded, cancel: &CancellationToken) -> Result<Retriever> {
        let index = cancellable(cancel, self.pipeline.build_index(&loaded.document)).await?;
        let retriever = self.pipeline.retriever(Arc::new(index))?;
        self.lock().loaded = Some(Arc::new(Loaded {
            document: loaded.document.clone(),
            retriever: retriever.clone(),
        }));
        debug!(document.id = %loaded.document.id, "recomputed index");
        Ok(retriever)
    }

    async fn stream_answer(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<QueryEvent>,
    ) -> Result<String> {
        let mut stream = cancellable(cancel, self.pipeline.answer_stream(prompt)).await?;
        let timeout = self.pipeline.call_policy().timeout;

        let mut answer = String::new();
        loop {
            let next = cancellable(cancel, async {
                tokio::time::timeout(timeout, stream.next()).await.map_err(|_| RagError::Timeout {
                    operation: "generate".to_string(),
                    after: timeout,
                })
            })
            .await?;

            match next {
                Some(fragment) => {
                    let fragment = fragment?;
                    answer.push_str(&fragment);
                    let _ = tx.send(QueryEvent::Delta(fragment)).await;
                }
                None => break,
            }
        }
        Ok(answer)
    }

    async fn acquire_turn(
        &self,
        cancel: &CancellationToken,
    ) -> Result<tokio::sync::MutexGuard<'_, ()>> {
        cancellable(cancel, async { Ok(self.turn.lock().await) }).await
    }

    fn ready_state(&self) -> Result<Arc<Loaded>> {
        let inner = self.lock();
        match (&inner.state, &inner.loaded) {
            (SessionState::Ready, Some(loaded)) => Ok(Arc::clone(loaded)),
            (state, _) => Err(RagError::NotReady { state: state.to_string() }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Holds a session in `Processing` and restores the prior state on drop
/// unless committed.
struct ProcessingGuard<'a> {
    session: &'a Session,
    prior: SessionState,
    committed: bool,
}

impl<'a> ProcessingGuard<'a> {
    fn enter(session: &'a Session) -> Self {
        let mut inner = session.lock();
        let prior = inner.state;
        inner.state = SessionState::Processing;
        Self { session, prior, committed: false }
    }

    fn commit(mut self, loaded: Arc<Loaded>) {
        let mut inner = self.session.lock();
        inner.state = SessionState::Ready;
        inner.loaded = Some(loaded);
        inner.history.clear();
        drop(inner);
        self.committed = true;
    }
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.session.lock().state = self.prior;
            debug!(state = %self.prior, "rolled back session state");
        }
    }
}

async fn write_snapshot(dir: &Path, loaded: &Loaded) -> Result<()> {
    loaded.retriever.index().persist(dir.join(INDEX_DIR)).await?;
    let document = serde_json::to_vec_pretty(&loaded.document)
        .map_err(|e| RagError::Persistence(format!("failed to serialize document: {e}")))?;
    write_replacing(&dir.join(DOCUMENT_FILE), &document).await?;
    info!(path = %dir.display(), document.id = %loaded.document.id, "saved session snapshot");
    Ok(())
}

async fn read_snapshot(dir: &Path) -> Result<(Document, VectorIndex)> {
    let path = dir.join(DOCUMENT_FILE);
    if !tokio::fs::try_exists(&path).await? {
        return Err(RagError::Persistence(format!("no session snapshot at {}", dir.display())));
    }
    let raw = tokio::fs::read(&path).await?;
    let document: Document = serde_json::from_slice(&raw)
        .map_err(|e| RagError::Persistence(format!("failed to parse document: {e}")))?;

    let index = VectorIndex::load(dir.join(INDEX_DIR)).await?;
    if index.is_empty() {
        return Err(RagError::Persistence("snapshot index holds no chunks".to_string()));
    }
    if let Some(stray) = index.chunks().iter().find(|c| c.document_id != document.id) {
        return Err(RagError::Persistence(format!(
            "chunk '{}' belongs to '{}', not '{}'",
            stray.id, stray.document_id, document.id
        )));
    }
    Ok((document, index))
}
