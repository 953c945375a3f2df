//! Metadata store: docsets, pages, chunks, and the full-text mirror.
//!
//! This is the single source of truth for crawl state. All multi-row
//! writes are transactional; deleting a docset cascades pages → chunks →
//! FTS rows. Page claims go through [`MetadataStore::claim_next_pending`],
//! a conditional update-and-return that hands each pending page to
//! exactly one worker.
//!
//! Keyword search runs over the `chunks_fts` FTS5 table, which mirrors
//! chunk text together with denormalised page URL, page title, and chunk
//! heading. BM25 rank orders results (ascending, best first) and is
//! mapped to a bounded score via `1 / (1 + max(0, bm25))`.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use crate::migrate::sections_from_path;
use crate::models::{now_ts, Chunk, Docset, DocsetStatus, IndexStatus, Page, PageStatus};

/// Input for docset creation. `name` defaults to the base URL host and
/// `allowed_paths` to the directory of the seed path.
#[derive(Debug, Clone)]
pub struct CreateDocset {
    pub base_url: String,
    pub seed_path: String,
    pub name: Option<String>,
    pub allowed_paths: Option<Vec<String>>,
}

/// Partial page update: only the provided fields are written. The parent
/// docset's `updated_at` is not touched here.
#[derive(Debug, Clone, Default)]
pub struct PageUpdate {
    pub status: Option<PageStatus>,
    pub title: Option<Option<String>>,
    pub content_hash: Option<Option<String>>,
    pub etag: Option<Option<String>>,
    pub last_modified: Option<Option<String>>,
    pub error: Option<Option<String>>,
    pub fetched_at: Option<i64>,
    pub indexed_at: Option<i64>,
    pub last_attempt_at: Option<i64>,
    pub increment_retry: bool,
}

/// One keyword search result from the FTS mirror.
#[derive(Debug, Clone)]
pub struct KeywordHit {
    pub chunk_id: String,
    pub docset_id: String,
    pub page_id: String,
    pub url: String,
    pub title: Option<String>,
    pub heading: Option<String>,
    pub content: String,
    pub keyword_score: f64,
}

pub struct MetadataStore {
    pool: SqlitePool,
    fts_checked: AtomicBool,
}

impl MetadataStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            fts_checked: AtomicBool::new(false),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ============ Docsets ============

    pub async fn create_docset(&self, input: CreateDocset) -> Result<Docset> {
        let name = input.name.unwrap_or_else(|| host_of(&input.base_url));
        let allowed_paths = input
            .allowed_paths
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| vec![parent_of(&input.seed_path)]);

        let docset = Docset {
            id: Uuid::new_v4().to_string(),
            name,
            base_url: input.base_url,
            seed_path: input.seed_path,
            allowed_paths,
            status: DocsetStatus::Pending,
            created_at: now_ts(),
            updated_at: now_ts(),
        };

        sqlx::query(
            r#"
            INSERT INTO docsets (id, name, base_url, seed_path, allowed_paths, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&docset.id)
        .bind(&docset.name)
        .bind(&docset.base_url)
        .bind(&docset.seed_path)
        .bind(serde_json::to_string(&docset.allowed_paths)?)
        .bind(docset.status.as_str())
        .bind(docset.created_at)
        .bind(docset.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(docset)
    }

    pub async fn get_docset(&self, id: &str) -> Result<Option<Docset>> {
        let row = sqlx::query("SELECT * FROM docsets WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(docset_from_row).transpose()
    }

    pub async fn get_docset_by_url(&self, base_url: &str) -> Result<Option<Docset>> {
        let row = sqlx::query("SELECT * FROM docsets WHERE base_url = ? ORDER BY rowid LIMIT 1")
            .bind(base_url)
            .fetch_optional(&self.pool)
            .await?;
        row.map(docset_from_row).transpose()
    }

    pub async fn list_docsets(&self) -> Result<Vec<Docset>> {
        let rows = sqlx::query("SELECT * FROM docsets ORDER BY created_at, rowid")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(docset_from_row).collect()
    }

    pub async fn set_docset_status(&self, id: &str, status: DocsetStatus) -> Result<()> {
        sqlx::query("UPDATE docsets SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now_ts())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete a docset and everything under it. Pages and chunks cascade
    /// via foreign keys; the FTS mirror has no foreign keys and is
    /// cleared explicitly in the same transaction.
    pub async fn delete_docset(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks_fts WHERE docset_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM docsets WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    // ============ Pages ============

    pub async fn create_page(&self, docset_id: &str, url: &str, path: &str) -> Result<Page> {
        let (section, subsection) = sections_from_path(path);
        let page = Page {
            id: Uuid::new_v4().to_string(),
            docset_id: docset_id.to_string(),
            url: url.to_string(),
            path: path.to_string(),
            title: None,
            content_hash: None,
            etag: None,
            last_modified: None,
            status: PageStatus::Pending,
            error: None,
            retry_count: 0,
            last_attempt_at: None,
            fetched_at: None,
            indexed_at: None,
            section,
            subsection,
        };

        sqlx::query(
            r#"
            INSERT INTO pages (id, docset_id, url, path, status, retry_count, section, subsection)
            VALUES (?, ?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(&page.id)
        .bind(&page.docset_id)
        .bind(&page.url)
        .bind(&page.path)
        .bind(page.status.as_str())
        .bind(&page.section)
        .bind(&page.subsection)
        .execute(&self.pool)
        .await?;

        Ok(page)
    }

    pub async fn get_page(&self, id: &str) -> Result<Option<Page>> {
        let row = sqlx::query("SELECT * FROM pages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(page_from_row).transpose()
    }

    /// Exact URL match; no normalisation beyond the canonical form the
    /// extractor produces.
    pub async fn get_page_by_url(&self, docset_id: &str, url: &str) -> Result<Option<Page>> {
        let row = sqlx::query("SELECT * FROM pages WHERE docset_id = ? AND url = ?")
            .bind(docset_id)
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        row.map(page_from_row).transpose()
    }

    pub async fn page_exists(&self, docset_id: &str, url: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pages WHERE docset_id = ? AND url = ?")
            .bind(docset_id)
            .bind(url)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    pub async fn count_pages(&self, docset_id: &str) -> Result<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM pages WHERE docset_id = ?")
                .bind(docset_id)
                .fetch_one(&self.pool)
                .await?,
        )
    }

    /// Earliest-inserted page still in `pending`, without reserving it.
    pub async fn get_next_pending_page(&self, docset_id: &str) -> Result<Option<Page>> {
        let row = sqlx::query(
            "SELECT * FROM pages WHERE docset_id = ? AND status = 'pending' ORDER BY rowid LIMIT 1",
        )
        .bind(docset_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(page_from_row).transpose()
    }

    /// Atomically claim the earliest pending page: moves it to `fetching`
    /// and stamps `last_attempt_at` in one statement, so concurrent
    /// workers never claim the same page.
    pub async fn claim_next_pending(&self, docset_id: &str) -> Result<Option<Page>> {
        let row = sqlx::query(
            r#"
            UPDATE pages SET status = 'fetching', last_attempt_at = ?
            WHERE id = (
                SELECT id FROM pages
                WHERE docset_id = ? AND status = 'pending'
                ORDER BY rowid LIMIT 1
            ) AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(now_ts())
        .bind(docset_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(page_from_row).transpose()
    }

    pub async fn update_page(&self, id: &str, update: PageUpdate) -> Result<()> {
        enum Bind {
            Text(Option<String>),
            Int(i64),
        }

        let mut sets: Vec<&'static str> = Vec::new();
        let mut binds: Vec<Bind> = Vec::new();

        if let Some(status) = update.status {
            sets.push("status = ?");
            binds.push(Bind::Text(Some(status.as_str().to_string())));
        }
        if let Some(title) = update.title {
            sets.push("title = ?");
            binds.push(Bind::Text(title));
        }
        if let Some(hash) = update.content_hash {
            sets.push("content_hash = ?");
            binds.push(Bind::Text(hash));
        }
        if let Some(etag) = update.etag {
            sets.push("etag = ?");
            binds.push(Bind::Text(etag));
        }
        if let Some(lm) = update.last_modified {
            sets.push("last_modified = ?");
            binds.push(Bind::Text(lm));
        }
        if let Some(error) = update.error {
            sets.push("error = ?");
            binds.push(Bind::Text(error));
        }
        if let Some(ts) = update.fetched_at {
            sets.push("fetched_at = ?");
            binds.push(Bind::Int(ts));
        }
        if let Some(ts) = update.indexed_at {
            sets.push("indexed_at = ?");
            binds.push(Bind::Int(ts));
        }
        if let Some(ts) = update.last_attempt_at {
            sets.push("last_attempt_at = ?");
            binds.push(Bind::Int(ts));
        }
        if update.increment_retry {
            sets.push("retry_count = retry_count + 1");
        }

        if sets.is_empty() {
            return Ok(());
        }

        let sql = format!("UPDATE pages SET {} WHERE id = ?", sets.join(", "));
        let mut query = sqlx::query(&sql);
        for bind in binds {
            query = match bind {
                Bind::Text(v) => query.bind(v),
                Bind::Int(v) => query.bind(v),
            };
        }
        query.bind(id).execute(&self.pool).await?;
        Ok(())
    }

    /// Pages of a docset, optionally filtered by status. Ordered by
    /// `indexed_at` descending with NULLs last (portable form).
    pub async fn list_pages(
        &self,
        docset_id: &str,
        status: Option<PageStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Page>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    r#"
                    SELECT * FROM pages WHERE docset_id = ? AND status = ?
                    ORDER BY (indexed_at IS NULL) ASC, indexed_at DESC, rowid ASC
                    LIMIT ? OFFSET ?
                    "#,
                )
                .bind(docset_id)
                .bind(status.as_str())
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT * FROM pages WHERE docset_id = ?
                    ORDER BY (indexed_at IS NULL) ASC, indexed_at DESC, rowid ASC
                    LIMIT ? OFFSET ?
                    "#,
                )
                .bind(docset_id)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(page_from_row).collect()
    }

    /// All pending pages in insertion order, for frontier hydration.
    pub async fn pending_pages(&self, docset_id: &str) -> Result<Vec<Page>> {
        let rows = sqlx::query(
            "SELECT * FROM pages WHERE docset_id = ? AND status = 'pending' ORDER BY rowid",
        )
        .bind(docset_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(page_from_row).collect()
    }

    pub async fn has_pending(&self, docset_id: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pages WHERE docset_id = ? AND status = 'pending'",
        )
        .bind(docset_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// Pages stuck mid-pipeline past the threshold.
    pub async fn stuck_pages(&self, docset_id: &str, threshold_secs: i64) -> Result<Vec<Page>> {
        let cutoff = now_ts() - threshold_secs;
        let rows = sqlx::query(
            r#"
            SELECT * FROM pages
            WHERE docset_id = ? AND status IN ('fetching', 'fetched', 'indexing')
              AND (last_attempt_at IS NULL OR last_attempt_at < ?)
            ORDER BY rowid
            "#,
        )
        .bind(docset_id)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(page_from_row).collect()
    }

    /// Recovery step 1: move stuck pages back to `pending`, incrementing
    /// the retry counter.
    pub async fn reset_stuck_pages(&self, docset_id: &str, threshold_secs: i64) -> Result<u64> {
        let cutoff = now_ts() - threshold_secs;
        let result = sqlx::query(
            r#"
            UPDATE pages SET status = 'pending', retry_count = retry_count + 1
            WHERE docset_id = ? AND status IN ('fetching', 'fetched', 'indexing')
              AND (last_attempt_at IS NULL OR last_attempt_at < ?)
            "#,
        )
        .bind(docset_id)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Recovery step 2: give errored pages under the retry cap another go.
    pub async fn reset_error_pages(&self, docset_id: &str, max_retries: i64) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE pages SET status = 'pending' WHERE docset_id = ? AND status = 'error' AND retry_count < ?",
        )
        .bind(docset_id)
        .bind(max_retries)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Queue every page of a docset for re-crawl. In incremental mode the
    /// content hashes and conditional headers survive so unchanged pages
    /// short-circuit; a full reindex clears them. Returns
    /// `(queued, preserved_hashes, cleared_hashes)`.
    pub async fn reset_pages_for_refresh(
        &self,
        docset_id: &str,
        full_reindex: bool,
    ) -> Result<(u64, u64, u64)> {
        let with_hash: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pages WHERE docset_id = ? AND content_hash IS NOT NULL",
        )
        .bind(docset_id)
        .fetch_one(&self.pool)
        .await?;

        let queued = if full_reindex {
            sqlx::query(
                r#"
                UPDATE pages SET status = 'pending', content_hash = NULL, etag = NULL,
                                 last_modified = NULL, error = NULL
                WHERE docset_id = ?
                "#,
            )
            .bind(docset_id)
            .execute(&self.pool)
            .await?
            .rows_affected()
        } else {
            sqlx::query("UPDATE pages SET status = 'pending', error = NULL WHERE docset_id = ?")
                .bind(docset_id)
                .execute(&self.pool)
                .await?
                .rows_affected()
        };

        if full_reindex {
            Ok((queued, 0, with_hash as u64))
        } else {
            Ok((queued, with_hash as u64, 0))
        }
    }

    // ============ Chunks ============

    pub async fn chunk_ids(&self, page_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query_scalar("SELECT id FROM chunks WHERE page_id = ? ORDER BY chunk_index")
            .bind(page_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn chunks_for_page(&self, page_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query("SELECT * FROM chunks WHERE page_id = ? ORDER BY chunk_index")
            .bind(page_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(chunk_from_row).collect()
    }

    /// Insert chunk rows and their FTS mirror rows in one transaction.
    /// The mirror carries the page URL and title denormalised so keyword
    /// results need no second lookup.
    pub async fn create_chunks(&self, chunks: &[Chunk], url: &str, title: Option<&str>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, page_id, docset_id, content, heading, start_offset,
                                    end_offset, chunk_index, embedding_id, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.page_id)
            .bind(&chunk.docset_id)
            .bind(&chunk.content)
            .bind(&chunk.heading)
            .bind(chunk.start_offset)
            .bind(chunk.end_offset)
            .bind(chunk.chunk_index)
            .bind(&chunk.embedding_id)
            .bind(chunk.created_at)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO chunks_fts (chunk_id, docset_id, page_id, url, title, heading, content)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.docset_id)
            .bind(&chunk.page_id)
            .bind(url)
            .bind(title)
            .bind(&chunk.heading)
            .bind(&chunk.content)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Remove a page's chunks and their FTS rows.
    pub async fn delete_chunks(&self, page_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks_fts WHERE page_id = ?")
            .bind(page_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE page_id = ?")
            .bind(page_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Stamp `embedding_id = chunk id` for every chunk of a page once its
    /// vectors have been upserted.
    pub async fn set_embedding_ids(&self, page_id: &str) -> Result<()> {
        sqlx::query("UPDATE chunks SET embedding_id = id WHERE page_id = ?")
            .bind(page_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count_chunks(&self, docset_id: &str) -> Result<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE docset_id = ?")
                .bind(docset_id)
                .fetch_one(&self.pool)
                .await?,
        )
    }

    // ============ Keyword search ============

    /// Full-text search over chunk text. The query is lowercased,
    /// stripped of punctuation, and each remaining token gets a `*`
    /// suffix for prefix matching.
    pub async fn search_keyword(
        &self,
        query: &str,
        docset_ids: Option<&[String]>,
        top_k: usize,
    ) -> Result<Vec<KeywordHit>> {
        self.ensure_fts_mirror().await?;

        let Some(match_expr) = normalize_fts_query(query) else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query(
            r#"
            SELECT chunk_id, docset_id, page_id, url, title, heading, content, rank
            FROM chunks_fts WHERE chunks_fts MATCH ?
            ORDER BY rank LIMIT ?
            "#,
        )
        .bind(&match_expr)
        .bind(top_k as i64)
        .fetch_all(&self.pool)
        .await?;

        let hits = rows
            .into_iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                KeywordHit {
                    chunk_id: row.get("chunk_id"),
                    docset_id: row.get("docset_id"),
                    page_id: row.get("page_id"),
                    url: row.get("url"),
                    title: row.get("title"),
                    heading: row.get("heading"),
                    content: row.get("content"),
                    keyword_score: 1.0 / (1.0 + rank.max(0.0)),
                }
            })
            .filter(|hit| match docset_ids {
                Some(ids) => ids.iter().any(|id| *id == hit.docset_id),
                None => true,
            })
            .collect();

        Ok(hits)
    }

    /// Rebuild the FTS mirror from the chunks table if it is empty while
    /// chunks exist (e.g. after a schema migration). Checked once per
    /// process, on the first keyword search.
    async fn ensure_fts_mirror(&self) -> Result<()> {
        if self.fts_checked.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let fts_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks_fts")
            .fetch_one(&self.pool)
            .await?;
        if fts_count > 0 {
            return Ok(());
        }
        let chunk_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        if chunk_count == 0 {
            return Ok(());
        }

        tracing::info!(chunks = chunk_count, "rebuilding empty FTS mirror");
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO chunks_fts (chunk_id, docset_id, page_id, url, title, heading, content)
            SELECT c.id, c.docset_id, c.page_id, p.url, p.title, c.heading, c.content
            FROM chunks c JOIN pages p ON p.id = c.page_id
            "#,
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    // ============ Status ============

    pub async fn get_index_status(&self, docset_id: &str) -> Result<IndexStatus> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM pages WHERE docset_id = ? GROUP BY status")
            .bind(docset_id)
            .fetch_all(&self.pool)
            .await?;

        let mut status = IndexStatus::default();
        for row in rows {
            let state: String = row.get("status");
            let n: i64 = row.get("n");
            status.total_pages += n;
            match PageStatus::parse(&state) {
                PageStatus::Pending => status.pending_pages += n,
                PageStatus::Fetching | PageStatus::Fetched | PageStatus::Indexing => {
                    status.fetching_pages += n
                }
                PageStatus::Indexed => status.indexed_pages += n,
                PageStatus::Error => status.error_pages += n,
                PageStatus::Skipped => status.skipped_pages += n,
            }
        }
        status.total_chunks = self.count_chunks(docset_id).await?;
        Ok(status)
    }
}

// ============ Helpers ============

fn host_of(base_url: &str) -> String {
    url::Url::parse(base_url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .unwrap_or_else(|| base_url.to_string())
}

/// Directory of the seed path: the seed with its final segment removed,
/// or `/` if that would be empty.
fn parent_of(seed_path: &str) -> String {
    let trimmed = seed_path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => trimmed[..idx].to_string(),
    }
}

/// Lowercase, strip punctuation, drop tokens of one character or less,
/// and append `*` to each for prefix matching.
fn normalize_fts_query(query: &str) -> Option<String> {
    let cleaned: String = query
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let tokens: Vec<String> = cleaned
        .split_whitespace()
        .filter(|t| t.chars().count() > 1)
        .map(|t| format!("{}*", t))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" "))
    }
}

fn docset_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Docset> {
    let allowed_raw: String = row.get("allowed_paths");
    let status: String = row.get("status");
    Ok(Docset {
        id: row.get("id"),
        name: row.get("name"),
        base_url: row.get("base_url"),
        seed_path: row.get("seed_path"),
        allowed_paths: serde_json::from_str(&allowed_raw)?,
        status: DocsetStatus::parse(&status),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn page_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Page> {
    let status: String = row.get("status");
    Ok(Page {
        id: row.get("id"),
        docset_id: row.get("docset_id"),
        url: row.get("url"),
        path: row.get("path"),
        title: row.get("title"),
        content_hash: row.get("content_hash"),
        etag: row.get("etag"),
        last_modified: row.get("last_modified"),
        status: PageStatus::parse(&status),
        error: row.get("error"),
        retry_count: row.get("retry_count"),
        last_attempt_at: row.get("last_attempt_at"),
        fetched_at: row.get("fetched_at"),
        indexed_at: row.get("indexed_at"),
        section: row.get("section"),
        subsection: row.get("subsection"),
    })
}

fn chunk_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Chunk> {
    Ok(Chunk {
        id: row.get("id"),
        page_id: row.get("page_id"),
        docset_id: row.get("docset_id"),
        content: row.get("content"),
        heading: row.get("heading"),
        start_offset: row.get("start_offset"),
        end_offset: row.get("end_offset"),
        chunk_index: row.get("chunk_index"),
        embedding_id: row.get("embedding_id"),
        created_at: row.get("created_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::migrate;

    async fn store() -> MetadataStore {
        let pool = db::connect_memory().await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        MetadataStore::new(pool)
    }

    fn make_chunk(page_id: &str, docset_id: &str, index: i64, content: &str) -> Chunk {
        Chunk {
            id: Uuid::new_v4().to_string(),
            page_id: page_id.to_string(),
            docset_id: docset_id.to_string(),
            content: content.to_string(),
            heading: None,
            start_offset: 0,
            end_offset: content.len() as i64,
            chunk_index: index,
            embedding_id: None,
            created_at: now_ts(),
        }
    }

    #[test]
    fn test_parent_of() {
        assert_eq!(parent_of("/docs/start"), "/docs");
        assert_eq!(parent_of("/start"), "/");
        assert_eq!(parent_of("/"), "/");
        assert_eq!(parent_of("/docs/guides/intro"), "/docs/guides");
    }

    #[test]
    fn test_normalize_fts_query() {
        assert_eq!(
            normalize_fts_query("Hello, World!"),
            Some("hello* world*".to_string())
        );
        assert_eq!(normalize_fts_query("a b c"), None);
        assert_eq!(normalize_fts_query("!!!"), None);
        assert_eq!(
            normalize_fts_query("async/await"),
            Some("async* await*".to_string())
        );
    }

    #[tokio::test]
    async fn test_create_docset_defaults() {
        let store = store().await;
        let docset = store
            .create_docset(CreateDocset {
                base_url: "https://docs.example.com".to_string(),
                seed_path: "/docs/start".to_string(),
                name: None,
                allowed_paths: None,
            })
            .await
            .unwrap();

        assert_eq!(docset.name, "docs.example.com");
        assert_eq!(docset.allowed_paths, vec!["/docs".to_string()]);
        assert_eq!(docset.status, DocsetStatus::Pending);

        let found = store.get_docset_by_url("https://docs.example.com").await.unwrap();
        assert_eq!(found.unwrap().id, docset.id);
    }

    #[tokio::test]
    async fn test_claim_next_pending_is_exclusive() {
        let store = store().await;
        let docset = store
            .create_docset(CreateDocset {
                base_url: "https://docs.example.com".to_string(),
                seed_path: "/start".to_string(),
                name: None,
                allowed_paths: None,
            })
            .await
            .unwrap();

        store
            .create_page(&docset.id, "https://docs.example.com/a", "/a")
            .await
            .unwrap();
        store
            .create_page(&docset.id, "https://docs.example.com/b", "/b")
            .await
            .unwrap();

        let first = store.claim_next_pending(&docset.id).await.unwrap().unwrap();
        assert_eq!(first.url, "https://docs.example.com/a");
        assert_eq!(first.status, PageStatus::Fetching);
        assert!(first.last_attempt_at.is_some());

        let second = store.claim_next_pending(&docset.id).await.unwrap().unwrap();
        assert_eq!(second.url, "https://docs.example.com/b");

        assert!(store.claim_next_pending(&docset.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partial_update_leaves_other_fields() {
        let store = store().await;
        let docset = store
            .create_docset(CreateDocset {
                base_url: "https://docs.example.com".to_string(),
                seed_path: "/start".to_string(),
                name: None,
                allowed_paths: None,
            })
            .await
            .unwrap();
        let page = store
            .create_page(&docset.id, "https://docs.example.com/a", "/a")
            .await
            .unwrap();

        store
            .update_page(
                &page.id,
                PageUpdate {
                    title: Some(Some("A".to_string())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let reloaded = store.get_page(&page.id).await.unwrap().unwrap();
        assert_eq!(reloaded.title.as_deref(), Some("A"));
        assert_eq!(reloaded.status, PageStatus::Pending);
        assert!(reloaded.content_hash.is_none());
    }

    #[tokio::test]
    async fn test_retry_count_monotonic() {
        let store = store().await;
        let docset = store
            .create_docset(CreateDocset {
                base_url: "https://docs.example.com".to_string(),
                seed_path: "/start".to_string(),
                name: None,
                allowed_paths: None,
            })
            .await
            .unwrap();
        let page = store
            .create_page(&docset.id, "https://docs.example.com/a", "/a")
            .await
            .unwrap();

        for expected in 1..=3 {
            store
                .update_page(
                    &page.id,
                    PageUpdate {
                        increment_retry: true,
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            let reloaded = store.get_page(&page.id).await.unwrap().unwrap();
            assert_eq!(reloaded.retry_count, expected);
        }
    }

    #[tokio::test]
    async fn test_delete_docset_cascades() {
        let store = store().await;
        let docset = store
            .create_docset(CreateDocset {
                base_url: "https://docs.example.com".to_string(),
                seed_path: "/start".to_string(),
                name: None,
                allowed_paths: None,
            })
            .await
            .unwrap();
        let page = store
            .create_page(&docset.id, "https://docs.example.com/a", "/a")
            .await
            .unwrap();
        let chunks = vec![make_chunk(&page.id, &docset.id, 0, "alpha content here")];
        store
            .create_chunks(&chunks, &page.url, Some("A"))
            .await
            .unwrap();

        assert!(store.delete_docset(&docset.id).await.unwrap());

        assert!(store.get_page(&page.id).await.unwrap().is_none());
        assert_eq!(store.count_chunks(&docset.id).await.unwrap(), 0);
        let fts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks_fts")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(fts, 0);
    }

    #[tokio::test]
    async fn test_keyword_search_exact_token() {
        let store = store().await;
        let docset = store
            .create_docset(CreateDocset {
                base_url: "https://docs.example.com".to_string(),
                seed_path: "/start".to_string(),
                name: None,
                allowed_paths: None,
            })
            .await
            .unwrap();
        let page = store
            .create_page(&docset.id, "https://docs.example.com/a", "/a")
            .await
            .unwrap();
        store
            .create_chunks(
                &[
                    make_chunk(&page.id, &docset.id, 0, "alpha content about tokio runtimes"),
                    make_chunk(&page.id, &docset.id, 1, "beta content about sqlite storage"),
                ],
                &page.url,
                Some("A"),
            )
            .await
            .unwrap();

        let hits = store.search_keyword("tokio", None, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.contains("tokio"));
        assert!(hits[0].keyword_score > 0.0 && hits[0].keyword_score <= 1.0);

        // Prefix matching: "sqli" should reach "sqlite".
        let hits = store.search_keyword("sqli", None, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.contains("sqlite"));
    }

    #[tokio::test]
    async fn test_keyword_search_docset_filter() {
        let store = store().await;
        let d1 = store
            .create_docset(CreateDocset {
                base_url: "https://one.example.com".to_string(),
                seed_path: "/start".to_string(),
                name: None,
                allowed_paths: None,
            })
            .await
            .unwrap();
        let d2 = store
            .create_docset(CreateDocset {
                base_url: "https://two.example.com".to_string(),
                seed_path: "/start".to_string(),
                name: None,
                allowed_paths: None,
            })
            .await
            .unwrap();
        let p1 = store
            .create_page(&d1.id, "https://one.example.com/a", "/a")
            .await
            .unwrap();
        let p2 = store
            .create_page(&d2.id, "https://two.example.com/a", "/a")
            .await
            .unwrap();
        store
            .create_chunks(&[make_chunk(&p1.id, &d1.id, 0, "shared keyword here")], &p1.url, None)
            .await
            .unwrap();
        store
            .create_chunks(&[make_chunk(&p2.id, &d2.id, 0, "shared keyword there")], &p2.url, None)
            .await
            .unwrap();

        let hits = store
            .search_keyword("shared", Some(&[d1.id.clone()]), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].docset_id, d1.id);
    }

    #[tokio::test]
    async fn test_fts_bootstrap_rebuilds_empty_mirror() {
        let store = store().await;
        let docset = store
            .create_docset(CreateDocset {
                base_url: "https://docs.example.com".to_string(),
                seed_path: "/start".to_string(),
                name: None,
                allowed_paths: None,
            })
            .await
            .unwrap();
        let page = store
            .create_page(&docset.id, "https://docs.example.com/a", "/a")
            .await
            .unwrap();
        store
            .create_chunks(&[make_chunk(&page.id, &docset.id, 0, "bootstrap target text")], &page.url, None)
            .await
            .unwrap();

        // Simulate a migration that recreated the mirror empty.
        sqlx::query("DELETE FROM chunks_fts")
            .execute(store.pool())
            .await
            .unwrap();

        let hits = store.search_keyword("bootstrap", None, 10).await.unwrap();
        assert_eq!(hits.len(), 1, "mirror should be rebuilt from chunks");
    }

    #[tokio::test]
    async fn test_index_status_aggregates() {
        let store = store().await;
        let docset = store
            .create_docset(CreateDocset {
                base_url: "https://docs.example.com".to_string(),
                seed_path: "/start".to_string(),
                name: None,
                allowed_paths: None,
            })
            .await
            .unwrap();
        for (i, status) in ["indexed", "indexed", "pending", "error"].iter().enumerate() {
            let page = store
                .create_page(
                    &docset.id,
                    &format!("https://docs.example.com/p{}", i),
                    &format!("/p{}", i),
                )
                .await
                .unwrap();
            store
                .update_page(
                    &page.id,
                    PageUpdate {
                        status: Some(PageStatus::parse(status)),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }

        let status = store.get_index_status(&docset.id).await.unwrap();
        assert_eq!(status.total_pages, 4);
        assert_eq!(status.indexed_pages, 2);
        assert_eq!(status.pending_pages, 1);
        assert_eq!(status.error_pages, 1);
    }
}
