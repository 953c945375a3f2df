//! Crawl orchestration: the composition root and the per-page pipeline.
//!
//! [`Oracle`] owns every collaborator — metadata store, content cache,
//! vector store, embedding provider, fetcher — and drives the pipeline
//! `fetch → extract → chunk → embed → persist` for each page. Per docset
//! there is one crawl runner with shared state (`in_flight`,
//! `next_allowed_fetch_at`, `stop_requested`); the runner spawns a
//! bounded pool of workers that claim pending pages from the metadata
//! store, pass a global per-docset rate limiter, and index pages
//! concurrently. Page failures never poison the docset: 401/403/404 mark
//! the page `skipped`, anything else marks it `error` and bumps the
//! retry counter.
//!
//! Incremental work is skipped twice over: a 304 answer with a known
//! content hash short-circuits before extraction, and an unchanged
//! SHA-256 short-circuits before re-embedding.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::cache::ContentCache;
use crate::chunk::{split_chunks, ChunkOptions};
use crate::config::Config;
use crate::db;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::error::FetchError;
use crate::extract;
use crate::fetch::{HttpFetcher, PageFetcher};
use crate::frontier::Frontier;
use crate::metadata::{CreateDocset, MetadataStore, PageUpdate};
use crate::migrate;
use crate::models::{now_ts, Chunk, Docset, DocsetStatus, Page, PageStatus};
use crate::vector::{VectorMetadata, VectorRecord, VectorStore};

/// Pages stuck mid-pipeline longer than this are reset on recovery.
pub const DEFAULT_STUCK_THRESHOLD_MS: u64 = 5 * 60 * 1000;
/// Errored pages are retried until they hit this many attempts.
pub const DEFAULT_MAX_RETRIES: i64 = 3;
/// Default refresh horizon.
pub const DEFAULT_REFRESH_MAX_AGE_MS: u64 = 24 * 60 * 60 * 1000;

/// Request to index (or re-index) a documentation site.
#[derive(Debug, Clone)]
pub struct IndexRequest {
    pub base_url: String,
    pub seed_path: String,
    pub name: Option<String>,
    pub allowed_paths: Option<Vec<String>>,
}

/// Terminal result of one page pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOutcome {
    /// Extracted, chunked, embedded, persisted.
    Indexed { chunks: usize },
    /// Short-circuited: remote content unchanged.
    Unchanged,
    /// Expected crawl miss (401/403/404).
    Skipped(u16),
    /// Unexpected failure; recorded on the page with a retry bump.
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct RecoveryOptions {
    pub stuck_threshold_ms: u64,
    pub max_retries: i64,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            stuck_threshold_ms: DEFAULT_STUCK_THRESHOLD_MS,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RefreshOptions {
    pub force: bool,
    pub max_age_ms: u64,
    pub full_reindex: bool,
}

impl Default for RefreshOptions {
    fn default() -> Self {
        Self {
            force: false,
            max_age_ms: DEFAULT_REFRESH_MAX_AGE_MS,
            full_reindex: false,
        }
    }
}

/// Per-docset refresh plan, reported to the caller.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshPlan {
    pub docset_id: String,
    pub mode: String,
    pub pages_queued: u64,
    pub preserved_hashes: u64,
    pub cleared_hashes: u64,
    pub skipped: bool,
}

/// Shared state of one docset's crawl runner.
pub struct CrawlState {
    in_flight: AtomicUsize,
    stop_requested: AtomicBool,
    running: AtomicBool,
    next_allowed_fetch_at: Mutex<Instant>,
    frontier: Mutex<Frontier>,
}

impl CrawlState {
    fn new() -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            stop_requested: AtomicBool::new(false),
            running: AtomicBool::new(false),
            next_allowed_fetch_at: Mutex::new(Instant::now()),
            frontier: Mutex::new(Frontier::new()),
        }
    }
}

/// The engine. Construct once with [`Oracle::open`] (or
/// [`Oracle::with_components`] in tests) and share via `Arc`.
pub struct Oracle {
    pub(crate) config: Config,
    pub(crate) store: MetadataStore,
    pub(crate) cache: Arc<ContentCache>,
    pub(crate) vectors: Arc<VectorStore>,
    pub(crate) provider: Arc<dyn EmbeddingProvider>,
    pub(crate) fetcher: Arc<dyn PageFetcher>,
    runners: StdMutex<HashMap<String, Arc<CrawlState>>>,
}

impl Oracle {
    /// Open the engine against the configured data directory, running
    /// migrations on the way.
    pub async fn open(config: Config) -> Result<Arc<Self>> {
        let cache = Arc::new(ContentCache::new(config.cache_dir()));
        let fetcher: Arc<dyn PageFetcher> = Arc::new(HttpFetcher::new(
            Arc::clone(&cache),
            Duration::from_millis(config.crawler.timeout_ms),
            &config.crawler.user_agent,
        ));
        let provider = create_provider(&config.embedding)?;
        Self::build(config, cache, fetcher, provider).await
    }

    /// Construct with injected fetcher/provider; used by the test suite
    /// to stub the network.
    pub async fn with_components(
        config: Config,
        fetcher: Arc<dyn PageFetcher>,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<Arc<Self>> {
        let cache = Arc::new(ContentCache::new(config.cache_dir()));
        Self::build(config, cache, fetcher, provider).await
    }

    async fn build(
        config: Config,
        cache: Arc<ContentCache>,
        fetcher: Arc<dyn PageFetcher>,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<Arc<Self>> {
        if config.vector_store.provider != "local" {
            anyhow::bail!(
                "vector store provider '{}' is not available in this build; use 'local'",
                config.vector_store.provider
            );
        }

        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("failed to create data dir {}", config.data_dir.display()))?;

        let pool = db::connect(&config.db_path()).await?;
        migrate::run_migrations(&pool).await?;

        let vectors = Arc::new(VectorStore::new(config.vectors_dir()));

        Ok(Arc::new(Self {
            store: MetadataStore::new(pool),
            cache,
            vectors,
            provider,
            fetcher,
            config,
            runners: StdMutex::new(HashMap::new()),
        }))
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn vectors(&self) -> &VectorStore {
        &self.vectors
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    fn state(&self, docset_id: &str) -> Arc<CrawlState> {
        let mut runners = self.runners.lock().expect("crawl runner registry poisoned");
        Arc::clone(
            runners
                .entry(docset_id.to_string())
                .or_insert_with(|| Arc::new(CrawlState::new())),
        )
    }

    // ============ Indexing a docset ============

    /// Find-or-create the docset, ensure the seed page exists, optionally
    /// index the seed synchronously, and start the background crawl.
    /// Returns the docset record and whether the seed is indexed.
    pub async fn index_docset(
        self: &Arc<Self>,
        request: IndexRequest,
        wait_for_seed: bool,
    ) -> Result<(Docset, bool)> {
        let docset = match self.store.get_docset_by_url(&request.base_url).await? {
            Some(existing) => existing,
            None => {
                self.store
                    .create_docset(CreateDocset {
                        base_url: request.base_url.clone(),
                        seed_path: request.seed_path.clone(),
                        name: request.name.clone(),
                        allowed_paths: request.allowed_paths.clone(),
                    })
                    .await?
            }
        };

        self.vectors.init(&docset.id).await?;
        self.store.set_docset_status(&docset.id, DocsetStatus::Indexing).await?;

        let seed_url = url::Url::parse(&docset.base_url)
            .and_then(|base| base.join(&docset.seed_path))
            .with_context(|| format!("invalid seed URL for docset {}", docset.id))?;
        let seed = match self.store.get_page_by_url(&docset.id, seed_url.as_str()).await? {
            Some(page) => page,
            None => {
                self.store
                    .create_page(&docset.id, seed_url.as_str(), seed_url.path())
                    .await?
            }
        };

        let mut seed_indexed = seed.status == PageStatus::Indexed;
        if wait_for_seed && !seed_indexed {
            let outcome = self.index_page(&docset, seed).await?;
            seed_indexed = matches!(outcome, PageOutcome::Indexed { .. } | PageOutcome::Unchanged);
        }

        self.start_background_crawl(&docset.id);

        let docset = self
            .store
            .get_docset(&docset.id)
            .await?
            .context("docset vanished during indexing")?;
        Ok((docset, seed_indexed))
    }

    // ============ Indexing a single page ============

    /// Run the page state machine, classifying failures: 401/403/404 ⇒
    /// `skipped`, anything else ⇒ `error` with a retry bump. Store-level
    /// failures still propagate.
    pub async fn index_page(self: &Arc<Self>, docset: &Docset, page: Page) -> Result<PageOutcome> {
        match self.index_page_inner(docset, &page).await {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                if let Some(fetch_error @ FetchError::Status(code)) = error.downcast_ref::<FetchError>() {
                    if fetch_error.is_skippable() {
                        let code = *code;
                        tracing::info!(url = %page.url, code, "page skipped");
                        self.store
                            .update_page(
                                &page.id,
                                PageUpdate {
                                    status: Some(PageStatus::Skipped),
                                    error: Some(Some(format!("HTTP {}", code))),
                                    ..Default::default()
                                },
                            )
                            .await?;
                        return Ok(PageOutcome::Skipped(code));
                    }
                }

                let message = format!("{:#}", error);
                tracing::warn!(url = %page.url, error = %message, "page failed");
                self.store
                    .update_page(
                        &page.id,
                        PageUpdate {
                            status: Some(PageStatus::Error),
                            error: Some(Some(message.clone())),
                            increment_retry: true,
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(PageOutcome::Failed(message))
            }
        }
    }

    async fn index_page_inner(
        self: &Arc<Self>,
        docset: &Docset,
        page: &Page,
    ) -> Result<PageOutcome> {
        self.store
            .update_page(
                &page.id,
                PageUpdate {
                    status: Some(PageStatus::Fetching),
                    last_attempt_at: Some(now_ts()),
                    ..Default::default()
                },
            )
            .await?;

        let fetched = self
            .fetcher
            .fetch(&page.url, page.etag.as_deref(), page.last_modified.as_deref())
            .await?;

        // Short-circuit 1: a 304 with a cached body and a known hash
        // means nothing to re-embed.
        if fetched.status == 304 && fetched.from_cache && page.content_hash.is_some() {
            self.store
                .update_page(
                    &page.id,
                    PageUpdate {
                        status: Some(PageStatus::Indexed),
                        fetched_at: Some(now_ts()),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(PageOutcome::Unchanged);
        }

        // Short-circuit 2: body round-tripped but the hash is unchanged.
        let content_hash = sha256_hex(&fetched.content);
        if page.content_hash.as_deref() == Some(content_hash.as_str()) {
            self.store
                .update_page(
                    &page.id,
                    PageUpdate {
                        status: Some(PageStatus::Indexed),
                        fetched_at: Some(now_ts()),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(PageOutcome::Unchanged);
        }

        self.store
            .update_page(
                &page.id,
                PageUpdate {
                    status: Some(PageStatus::Fetched),
                    content_hash: Some(Some(content_hash)),
                    etag: Some(fetched.etag.clone()),
                    last_modified: Some(fetched.last_modified.clone()),
                    fetched_at: Some(now_ts()),
                    ..Default::default()
                },
            )
            .await?;

        let extracted = extract::extract(&page.url, &fetched.content, fetched.content_kind)?;

        self.store
            .update_page(
                &page.id,
                PageUpdate {
                    status: Some(PageStatus::Indexing),
                    title: Some(extracted.title.clone()),
                    ..Default::default()
                },
            )
            .await?;

        // Grow the frontier from this page's links.
        {
            let state = self.state(&docset.id);
            let mut frontier = state.frontier.lock().await;
            frontier
                .discover_links(
                    &self.store,
                    docset,
                    &page.url,
                    &extracted.links,
                    0,
                    self.config.crawler.max_pages,
                )
                .await?;
        }

        // Replace any prior vectors and chunks for this page.
        let old_chunk_ids = self.store.chunk_ids(&page.id).await?;
        if !old_chunk_ids.is_empty() {
            self.vectors.delete(&docset.id, &old_chunk_ids).await?;
        }
        self.store.delete_chunks(&page.id).await?;

        let pieces = split_chunks(&extracted.content, &extracted.headings, &ChunkOptions::default());
        if pieces.is_empty() {
            self.store
                .update_page(
                    &page.id,
                    PageUpdate {
                        status: Some(PageStatus::Indexed),
                        indexed_at: Some(now_ts()),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(PageOutcome::Indexed { chunks: 0 });
        }

        let created_at = now_ts();
        let chunks: Vec<Chunk> = pieces
            .into_iter()
            .enumerate()
            .map(|(index, piece)| Chunk {
                id: Uuid::new_v4().to_string(),
                page_id: page.id.clone(),
                docset_id: docset.id.clone(),
                content: piece.content,
                heading: piece.heading,
                start_offset: piece.start_offset as i64,
                end_offset: piece.end_offset as i64,
                chunk_index: index as i64,
                embedding_id: None,
                created_at,
            })
            .collect();

        self.store
            .create_chunks(&chunks, &page.url, extracted.title.as_deref())
            .await?;

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let embeddings = self.provider.embed(&texts).await?;
        let records: Vec<VectorRecord> = chunks
            .iter()
            .zip(embeddings)
            .map(|(chunk, vector)| VectorRecord {
                id: chunk.id.clone(),
                vector,
                metadata: VectorMetadata {
                    docset_id: docset.id.clone(),
                    page_id: page.id.clone(),
                    chunk_id: chunk.id.clone(),
                    url: page.url.clone(),
                    title: extracted.title.clone(),
                    heading: chunk.heading.clone(),
                    content: chunk.content.clone(),
                },
            })
            .collect();
        self.vectors.upsert(&docset.id, records).await?;
        self.store.set_embedding_ids(&page.id).await?;

        self.store
            .update_page(
                &page.id,
                PageUpdate {
                    status: Some(PageStatus::Indexed),
                    indexed_at: Some(now_ts()),
                    ..Default::default()
                },
            )
            .await?;

        Ok(PageOutcome::Indexed { chunks: chunks.len() })
    }

    // ============ Background crawl ============

    /// Start the docset's crawl runner; a no-op while one is active.
    pub fn start_background_crawl(self: &Arc<Self>, docset_id: &str) {
        let state = self.state(docset_id);
        if state.running.swap(true, Ordering::SeqCst) {
            return;
        }
        state.stop_requested.store(false, Ordering::SeqCst);

        let oracle = Arc::clone(self);
        let docset_id = docset_id.to_string();
        tokio::spawn(async move {
            let state = oracle.state(&docset_id);
            if let Err(error) = oracle.run_crawl(&docset_id, &state).await {
                tracing::error!(docset = %docset_id, error = %format!("{:#}", error), "crawl runner failed");
            }
            state.running.store(false, Ordering::SeqCst);
        });
    }

    /// Request a stop: workers observe the flag at each loop head, so
    /// outstanding fetches finish but no new work is claimed.
    pub fn stop_background_crawl(&self, docset_id: &str) {
        let state = self.state(docset_id);
        state.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_crawling(&self, docset_id: &str) -> bool {
        self.state(docset_id).running.load(Ordering::SeqCst)
    }

    async fn run_crawl(self: &Arc<Self>, docset_id: &str, state: &Arc<CrawlState>) -> Result<()> {
        let Some(docset) = self.store.get_docset(docset_id).await? else {
            return Ok(());
        };

        {
            let mut frontier = state.frontier.lock().await;
            frontier.load_pending_pages(&self.store, docset_id).await?;
        }

        let mut workers = tokio::task::JoinSet::new();
        for worker in 0..self.config.crawler.concurrency {
            let oracle = Arc::clone(self);
            let state = Arc::clone(state);
            let docset = docset.clone();
            workers.spawn(async move {
                oracle.crawl_worker(docset, state, worker).await;
            });
        }
        while workers.join_next().await.is_some() {}

        if !state.stop_requested.load(Ordering::SeqCst)
            && state.in_flight.load(Ordering::SeqCst) == 0
            && !self.store.has_pending(docset_id).await?
        {
            self.store.set_docset_status(docset_id, DocsetStatus::Ready).await?;
            tracing::info!(docset = %docset_id, "crawl drained, docset ready");
        }
        Ok(())
    }

    async fn crawl_worker(self: Arc<Self>, docset: Docset, state: Arc<CrawlState>, worker: usize) {
        loop {
            if state.stop_requested.load(Ordering::SeqCst) {
                break;
            }
            if state.in_flight.load(Ordering::SeqCst) >= self.config.crawler.concurrency {
                tokio::time::sleep(Duration::from_millis(20)).await;
                continue;
            }

            let claimed = match self.store.claim_next_pending(&docset.id).await {
                Ok(claimed) => claimed,
                Err(error) => {
                    tracing::warn!(worker, error = %format!("{:#}", error), "claim failed");
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    continue;
                }
            };

            match claimed {
                Some(page) => {
                    state.in_flight.fetch_add(1, Ordering::SeqCst);
                    self.wait_for_rate_limit(&state).await;
                    match self.index_page(&docset, page).await {
                        Ok(outcome) => {
                            tracing::debug!(worker, ?outcome, "page processed");
                        }
                        Err(error) => {
                            tracing::warn!(worker, error = %format!("{:#}", error), "page pass failed");
                        }
                    }
                    state.in_flight.fetch_sub(1, Ordering::SeqCst);
                }
                None => {
                    // Nothing pending right now. Keep the frontier warm and
                    // wait for in-flight pages that may still discover links.
                    {
                        let mut frontier = state.frontier.lock().await;
                        if frontier.is_empty() {
                            if let Err(error) =
                                frontier.load_pending_pages(&self.store, &docset.id).await
                            {
                                tracing::warn!(worker, error = %format!("{:#}", error), "hydrate failed");
                            }
                        }
                    }
                    if state.in_flight.load(Ordering::SeqCst) == 0 {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }

    /// Global per-docset rate limiter: the check-and-update of
    /// `next_allowed_fetch_at` is serialised, bounding host QPS to
    /// `1 / request_delay` regardless of worker count.
    async fn wait_for_rate_limit(&self, state: &CrawlState) {
        let delay = Duration::from_millis(self.config.crawler.request_delay_ms);
        if delay.is_zero() {
            return;
        }
        let wait = {
            let mut next_allowed = state.next_allowed_fetch_at.lock().await;
            let now = Instant::now();
            let wait = next_allowed.saturating_duration_since(now);
            *next_allowed = now.max(*next_allowed) + delay;
            wait
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Wait until the docset's runner has drained, bounded by `timeout`.
    pub async fn wait_for_crawl(&self, docset_id: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if !self.is_crawling(docset_id) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        false
    }

    // ============ Deletion ============

    /// Stop the crawl, wait for the runner to unwind, then delete the
    /// docset's rows and vector namespace.
    pub async fn delete_docset(&self, docset_id: &str) -> Result<bool> {
        self.stop_background_crawl(docset_id);
        let state = self.state(docset_id);
        for _ in 0..200 {
            if !state.running.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let deleted = self.store.delete_docset(docset_id).await?;
        self.vectors.clear(docset_id).await?;
        self.runners
            .lock()
            .expect("crawl runner registry poisoned")
            .remove(docset_id);
        Ok(deleted)
    }

    // ============ Crash recovery ============

    /// On process start: reset stuck pages, requeue retryable errors, and
    /// resume crawls for docsets with pending work.
    pub async fn recover_from_crash(self: &Arc<Self>, options: RecoveryOptions) -> Result<()> {
        let threshold_secs = (options.stuck_threshold_ms / 1000) as i64;
        for docset in self.store.list_docsets().await? {
            let stuck = self.store.reset_stuck_pages(&docset.id, threshold_secs).await?;
            let retried = self.store.reset_error_pages(&docset.id, options.max_retries).await?;
            if stuck > 0 || retried > 0 {
                tracing::info!(docset = %docset.id, stuck, retried, "recovered pages");
            }
            if self.store.has_pending(&docset.id).await? {
                self.store.set_docset_status(&docset.id, DocsetStatus::Indexing).await?;
                self.start_background_crawl(&docset.id);
            }
        }
        Ok(())
    }

    // ============ Refresh ============

    /// Queue a docset for re-crawl. Incremental mode preserves content
    /// hashes and conditional headers so unchanged pages short-circuit;
    /// `full_reindex` clears them so every page re-embeds. Returns `None`
    /// for an unknown docset.
    pub async fn refresh_docset(
        self: &Arc<Self>,
        docset_id: &str,
        options: &RefreshOptions,
    ) -> Result<Option<RefreshPlan>> {
        let Some(docset) = self.store.get_docset(docset_id).await? else {
            return Ok(None);
        };

        let mode = if options.full_reindex { "full" } else { "incremental" };
        let max_age_secs = (options.max_age_ms / 1000) as i64;
        if !options.force && now_ts() - docset.updated_at < max_age_secs {
            return Ok(Some(RefreshPlan {
                docset_id: docset.id,
                mode: mode.to_string(),
                pages_queued: 0,
                preserved_hashes: 0,
                cleared_hashes: 0,
                skipped: true,
            }));
        }

        let (queued, preserved, cleared) = self
            .store
            .reset_pages_for_refresh(&docset.id, options.full_reindex)
            .await?;
        self.store.set_docset_status(&docset.id, DocsetStatus::Indexing).await?;
        self.start_background_crawl(&docset.id);

        Ok(Some(RefreshPlan {
            docset_id: docset.id,
            mode: mode.to_string(),
            pages_queued: queued,
            preserved_hashes: preserved,
            cleared_hashes: cleared,
            skipped: false,
        }))
    }

    pub async fn refresh_all(self: &Arc<Self>, options: &RefreshOptions) -> Result<Vec<RefreshPlan>> {
        let mut plans = Vec::new();
        for docset in self.store.list_docsets().await? {
            if let Some(plan) = self.refresh_docset(&docset.id, options).await? {
                plans.push(plan);
            }
        }
        Ok(plans)
    }
}

fn sha256_hex(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}
