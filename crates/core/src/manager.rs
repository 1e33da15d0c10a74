use crate::cache::{cache_key, CacheTtl, QueryCache};
use crate::chunking::{chunk_pages, ChunkingConfig};
use crate::cleaning::{strip_running_lines, TextCleaner};
use crate::dedup::{deduplicate, DedupStats};
use crate::embeddings::{embed_all, embed_query, Embedder};
use crate::error::RagError;
use crate::extractor::{extract_pages, OcrEndpointConfig};
use crate::generation::AnswerGenerator;
use crate::ingest::digest_file;
use crate::models::{
    collection_name, validate_document_id, BuildReport, Chunk, DeleteReport, Document,
    IndexState, IndexStatus, QueryOutcome, RagOptions, Source, COLLECTION_PREFIX,
};
use crate::retry::RetryPolicy;
use crate::vector_store::{CollectionWriter, VectorStore};
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// External services the manager drives.
pub struct Backends {
    pub store: Arc<dyn VectorStore>,
    pub embedder: Arc<dyn Embedder>,
    pub generator: Arc<dyn AnswerGenerator>,
    pub cache: Arc<dyn QueryCache>,
    pub ocr: Option<OcrEndpointConfig>,
}

/// Owns the per-document collection lifecycle and the cached query path.
///
/// Builds of one document are serialized; builds of different documents run independently.
/// Identical concurrent queries share one computation, which runs detached from any single
/// caller so a caller timing out never cancels it for the others.
#[derive(Clone)]
pub struct IndexManager {
    inner: Arc<Inner>,
}

struct Inner {
    backends: Backends,
    options: RagOptions,
    retry: RetryPolicy,
    ttl: CacheTtl,
    cleaner: TextCleaner,
    building: Mutex<HashMap<String, usize>>,
    build_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Per-document index generation. Readers hold it across a cache write, writers across
    /// the bump and the invalidation, so no stale outcome lands after an invalidation.
    generations: Mutex<HashMap<String, Arc<RwLock<u64>>>>,
    inflight: Mutex<HashMap<String, watch::Receiver<Option<QueryOutcome>>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Marks a document as building for as long as it lives.
struct BuildMark {
    inner: Arc<Inner>,
    document_id: String,
}

impl BuildMark {
    fn new(inner: &Arc<Inner>, document_id: &str) -> Self {
        *lock(&inner.building).entry(document_id.to_string()).or_default() += 1;
        Self {
            inner: Arc::clone(inner),
            document_id: document_id.to_string(),
        }
    }
}

impl Drop for BuildMark {
    fn drop(&mut self) {
        let mut building = lock(&self.inner.building);
        if let Some(count) = building.get_mut(&self.document_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                building.remove(&self.document_id);
            }
        }
    }
}

struct PreparedDocument {
    document: Document,
    chunks: Vec<Chunk>,
    stats: DedupStats,
}

impl IndexManager {
    pub fn new(backends: Backends, options: RagOptions) -> Result<Self, RagError> {
        options.validate()?;
        let retry = RetryPolicy::new(
            options.retry_attempts,
            Duration::from_millis(options.retry_base_delay_ms),
        );
        let ttl = CacheTtl::from(&options);

        Ok(Self {
            inner: Arc::new(Inner {
                backends,
                options,
                retry,
                ttl,
                cleaner: TextCleaner::new()?,
                building: Mutex::new(HashMap::new()),
                build_locks: Mutex::new(HashMap::new()),
                generations: Mutex::new(HashMap::new()),
                inflight: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn options(&self) -> &RagOptions {
        &self.inner.options
    }

    /// Builds (or rebuilds) the index of `document_id` from `path` and waits for it.
    pub async fn build_index(&self, path: &Path, document_id: &str) -> BuildReport {
        if let Err(error) = validate_document_id(document_id) {
            return BuildReport::failed(document_id, &error);
        }
        let mark = BuildMark::new(&self.inner, document_id);
        self.build_marked(path.to_path_buf(), document_id.to_string(), mark)
            .await
    }

    /// Starts a build in the background. `status` reports the document as building
    /// from the moment this returns.
    pub fn spawn_build(&self, path: PathBuf, document_id: String) -> JoinHandle<BuildReport> {
        if let Err(error) = validate_document_id(&document_id) {
            let report = BuildReport::failed(&document_id, &error);
            return tokio::spawn(async move { report });
        }

        let mark = BuildMark::new(&self.inner, &document_id);
        let manager = self.clone();
        tokio::spawn(async move { manager.build_marked(path, document_id, mark).await })
    }

    async fn build_marked(&self, path: PathBuf, document_id: String, _mark: BuildMark) -> BuildReport {
        let build_lock = self.build_lock(&document_id);
        let _guard = build_lock.lock().await;

        info!(document_id = %document_id, path = %path.display(), "index build started");
        match self.run_build(path, &document_id).await {
            Ok(report) => {
                self.advance_generation(&document_id).await;
                info!(
                    document_id = %document_id,
                    total_chunks = report.total_chunks,
                    unique_chunks = report.unique_chunks,
                    "index build finished"
                );
                report
            }
            Err(error) => {
                warn!(document_id = %document_id, stage = error.stage(), %error, "index build failed");
                BuildReport::failed(&document_id, &error)
            }
        }
    }

    async fn run_build(&self, path: PathBuf, document_id: &str) -> Result<BuildReport, RagError> {
        let inner = Arc::clone(&self.inner);
        let owned_id = document_id.to_string();
        let prepared = tokio::task::spawn_blocking(move || inner.prepare(&path, &owned_id))
            .await
            .map_err(|error| RagError::Extraction(format!("preparation worker failed: {error}")))??;

        let PreparedDocument {
            document,
            chunks,
            stats,
        } = prepared;
        let total_pages = document.page_count;
        let name = collection_name(document_id);
        let embedder = self.inner.backends.embedder.as_ref();

        let texts = chunks.iter().map(|chunk| chunk.text.clone()).collect::<Vec<_>>();
        let vectors = embed_all(
            embedder,
            &texts,
            self.inner.options.embed_batch_size,
            &self.inner.retry,
        )
        .await?;

        let mut writer = CollectionWriter::new(&name, embedder.dimensions());
        for (chunk, vector) in chunks.into_iter().zip(vectors) {
            writer.append(chunk, vector)?;
        }
        let collection = writer.seal(document, embedder.model_version())?;
        self.inner.backends.store.replace_collection(collection).await?;

        Ok(BuildReport {
            success: true,
            document_id: document_id.to_string(),
            collection_name: name,
            total_pages,
            total_chunks: stats.total_chunks,
            unique_chunks: stats.unique_chunks,
            dedup_percentage: stats.dedup_percentage,
            message: Some(format!(
                "Successfully indexed {} unique chunks from {total_pages} pages",
                stats.unique_chunks
            )),
            error: None,
            stage: None,
        })
    }

    /// Removes the index and cached answers of a document. Deleting an absent index succeeds.
    pub async fn delete_index(&self, document_id: &str) -> DeleteReport {
        if let Err(error) = validate_document_id(document_id) {
            return DeleteReport {
                success: false,
                message: None,
                error: Some(error.to_string()),
            };
        }

        let build_lock = self.build_lock(document_id);
        let _guard = build_lock.lock().await;

        let name = collection_name(document_id);
        match self.inner.backends.store.drop_collection(&name).await {
            Ok(existed) => {
                let cleared = self.advance_generation(document_id).await;
                let message = if existed {
                    format!("Deleted index {name} and cleared {cleared} cached queries")
                } else {
                    format!("No index {name} to delete")
                };
                info!(document_id, existed, cleared, "index deleted");
                DeleteReport {
                    success: true,
                    message: Some(message),
                    error: None,
                }
            }
            Err(error) => {
                warn!(document_id, %error, "index delete failed");
                DeleteReport {
                    success: false,
                    message: None,
                    error: Some(error.to_string()),
                }
            }
        }
    }

    pub async fn status(&self, document_id: &str) -> IndexStatus {
        let name = collection_name(document_id);
        let absent = IndexStatus {
            indexed: false,
            state: IndexState::Absent,
            collection_name: name.clone(),
            document_count: 0,
        };
        if validate_document_id(document_id).is_err() {
            return absent;
        }

        let building = lock(&self.inner.building).contains_key(document_id);
        let collection = match self.inner.backends.store.load_collection(&name).await {
            Ok(collection) => collection,
            Err(error) => {
                warn!(document_id, %error, "failed to read collection for status");
                None
            }
        };

        let state = match (&collection, building) {
            (Some(_), true) => IndexState::Rebuilding,
            (Some(_), false) => IndexState::Ready,
            (None, true) => IndexState::Building,
            (None, false) => IndexState::Absent,
        };

        IndexStatus {
            indexed: collection.is_some(),
            state,
            collection_name: name,
            document_count: collection.map(|collection| collection.len()).unwrap_or(0),
        }
    }

    /// Status of every document with a persisted index, including ones built by an earlier
    /// process.
    pub async fn list_indexes(&self) -> Result<Vec<IndexStatus>, RagError> {
        let names = self.inner.backends.store.list_collections().await?;
        let mut statuses = Vec::with_capacity(names.len());
        for name in names {
            if let Some(document_id) = name.strip_prefix(COLLECTION_PREFIX) {
                statuses.push(self.status(document_id).await);
            }
        }
        Ok(statuses)
    }

    /// Answers `question` from the document's index. `k` defaults to the configured value.
    pub async fn query(&self, document_id: &str, question: &str, k: Option<usize>) -> QueryOutcome {
        let k = k.unwrap_or(self.inner.options.default_k);
        if let Err(error) = validate_query(document_id, question, k) {
            return QueryOutcome::failed(question, &error);
        }

        let key = cache_key(document_id, question, k);
        match self.inner.backends.cache.get(&key).await {
            Ok(Some(hit)) => {
                debug!(document_id, cache_key = %key, "query cache hit");
                return hit;
            }
            Ok(None) => debug!(document_id, cache_key = %key, "query cache miss"),
            Err(error) => warn!(document_id, %error, "query cache unavailable, computing directly"),
        }

        let mut receiver = self.join_or_start(document_id, question, k, key);
        let wait = async move {
            receiver
                .wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|value| value.clone())
        };

        let shared = match self.inner.options.query_timeout_ms {
            Some(limit) => match tokio::time::timeout(Duration::from_millis(limit), wait).await {
                Ok(shared) => shared,
                Err(_) => {
                    warn!(document_id, timeout_ms = limit, "query wait timed out");
                    return QueryOutcome::failed(question, &RagError::QueryTimeout(limit as u128));
                }
            },
            None => wait.await,
        };

        shared.unwrap_or_else(|| {
            QueryOutcome::failed(
                question,
                &RagError::Generation("query computation ended without a result".to_string()),
            )
        })
    }

    fn join_or_start(
        &self,
        document_id: &str,
        question: &str,
        k: usize,
        key: String,
    ) -> watch::Receiver<Option<QueryOutcome>> {
        let mut inflight = lock(&self.inner.inflight);
        if let Some(receiver) = inflight.get(&key) {
            debug!(document_id, cache_key = %key, "joining in-flight query");
            return receiver.clone();
        }

        let (sender, receiver) = watch::channel(None);
        inflight.insert(key.clone(), receiver.clone());
        drop(inflight);

        let manager = self.clone();
        let document_id = document_id.to_string();
        let question = question.to_string();
        tokio::spawn(async move {
            let gate = manager.generation_gate(&document_id);
            let generation = *gate.read().await;
            let outcome = match manager.compute(&document_id, &question, k).await {
                Ok(outcome) => outcome,
                Err(error) => {
                    warn!(document_id = %document_id, %error, "query failed");
                    QueryOutcome::failed(&question, &error)
                }
            };

            // A build or delete that landed meanwhile makes this outcome stale.
            let current = gate.read().await;
            if *current == generation {
                let ttl = manager.inner.ttl.for_outcome(&outcome);
                if let Err(error) = manager
                    .inner
                    .backends
                    .cache
                    .put(&document_id, &key, &outcome, ttl)
                    .await
                {
                    warn!(document_id = %document_id, %error, "failed to cache query outcome");
                }
            }
            drop(current);

            lock(&manager.inner.inflight).remove(&key);
            // Every waiter may have given up already.
            let _ = sender.send(Some(outcome));
        });

        receiver
    }

    async fn compute(&self, document_id: &str, question: &str, k: usize) -> Result<QueryOutcome, RagError> {
        let backends = &self.inner.backends;
        let options = &self.inner.options;
        let name = collection_name(document_id);

        let collection = backends
            .store
            .load_collection(&name)
            .await?
            .ok_or_else(|| RagError::IndexNotFound(format!("document {document_id} has no index {name}")))?;

        let embedder = backends.embedder.as_ref();
        if collection.manifest().model_version != embedder.model_version() {
            return Err(RagError::Embedding(format!(
                "index {name} was built with model {} but the embedder is {}; rebuild required",
                collection.manifest().model_version,
                embedder.model_version()
            )));
        }

        let query_vector = embed_query(embedder, question, &self.inner.retry).await?;
        let hits = collection.search_mmr(
            &query_vector,
            k,
            k.saturating_mul(options.fetch_multiplier),
            options.mmr_lambda,
        );

        let context = hits.iter().map(|hit| hit.chunk.text.clone()).collect::<Vec<_>>();
        let context = &context[..];
        let generator = backends.generator.as_ref();
        let answer = self
            .inner
            .retry
            .run("generate_answer", move |_| generator.generate(question, context))
            .await?;

        let sources = hits
            .iter()
            .map(|hit| Source::from_chunk(&hit.chunk, options.preview_chars))
            .collect();
        Ok(QueryOutcome::answered(question, answer, sources))
    }

    fn build_lock(&self, document_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = lock(&self.inner.build_locks);
        Arc::clone(locks.entry(document_id.to_string()).or_default())
    }

    fn generation_gate(&self, document_id: &str) -> Arc<RwLock<u64>> {
        let mut generations = lock(&self.inner.generations);
        Arc::clone(generations.entry(document_id.to_string()).or_default())
    }

    /// Moves the document to a new generation and clears its cached outcomes, returning how
    /// many were cleared. In-flight cache writes for the document finish first.
    async fn advance_generation(&self, document_id: &str) -> usize {
        let gate = self.generation_gate(document_id);
        let mut generation = gate.write().await;
        *generation += 1;
        self.invalidate_cached(document_id).await
    }

    async fn invalidate_cached(&self, document_id: &str) -> usize {
        match self.inner.backends.cache.invalidate_document(document_id).await {
            Ok(cleared) => cleared,
            Err(error) => {
                warn!(document_id, %error, "failed to invalidate cached queries");
                0
            }
        }
    }
}

impl Inner {
    /// CPU-bound half of a build: extract, clean, chunk and deduplicate.
    fn prepare(&self, path: &Path, document_id: &str) -> Result<PreparedDocument, RagError> {
        let mut pages = extract_pages(path, self.backends.ocr.as_ref())?;
        let checksum = digest_file(path)?;

        strip_running_lines(&mut pages);
        for page in pages.iter_mut() {
            page.text = self.cleaner.clean(&page.text);
        }

        let config = ChunkingConfig::from(&self.options);
        config.validate()?;
        let raw_chunks = chunk_pages(&pages, config);
        let (chunks, stats) = deduplicate(
            document_id,
            raw_chunks,
            self.options.dedup,
            self.options.min_chunk_length,
        )?;

        debug!(
            document_id,
            pages = pages.len(),
            total_chunks = stats.total_chunks,
            unique_chunks = stats.unique_chunks,
            "document prepared"
        );

        Ok(PreparedDocument {
            document: Document {
                document_id: document_id.to_string(),
                source_path: path.to_string_lossy().to_string(),
                checksum,
                page_count: pages.len(),
                indexed_at: Utc::now(),
            },
            chunks,
            stats,
        })
    }
}

fn validate_query(document_id: &str, question: &str, k: usize) -> Result<(), RagError> {
    validate_document_id(document_id)?;
    if question.trim().is_empty() {
        return Err(RagError::InvalidArgument("question is empty".to_string()));
    }
    if k == 0 {
        return Err(RagError::InvalidArgument("k must be at least 1".to_string()));
    }
    Ok(())
}
