//! Database schema migrations.
//!
//! Creates the docsets/pages/chunks tables and the `chunks_fts` FTS5
//! mirror, and applies additive migrations when an older database is
//! missing `retry_count`, `last_attempt_at`, the section fields, or the
//! mirror itself. Section fields are backfilled deterministically from
//! the URL path. Idempotent — safe to run on every open.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS docsets (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            base_url TEXT NOT NULL,
            seed_path TEXT NOT NULL,
            allowed_paths TEXT NOT NULL DEFAULT '[]',
            status TEXT NOT NULL DEFAULT 'pending',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pages (
            id TEXT PRIMARY KEY,
            docset_id TEXT NOT NULL,
            url TEXT NOT NULL,
            path TEXT NOT NULL,
            title TEXT,
            content_hash TEXT,
            etag TEXT,
            last_modified TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            error TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_attempt_at INTEGER,
            fetched_at INTEGER,
            indexed_at INTEGER,
            section TEXT,
            subsection TEXT,
            UNIQUE(docset_id, url),
            FOREIGN KEY (docset_id) REFERENCES docsets(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            page_id TEXT NOT NULL,
            docset_id TEXT NOT NULL,
            content TEXT NOT NULL,
            heading TEXT,
            start_offset INTEGER NOT NULL DEFAULT 0,
            end_offset INTEGER NOT NULL DEFAULT 0,
            chunk_index INTEGER NOT NULL,
            embedding_id TEXT,
            created_at INTEGER NOT NULL,
            UNIQUE(page_id, chunk_index),
            FOREIGN KEY (page_id) REFERENCES pages(id) ON DELETE CASCADE,
            FOREIGN KEY (docset_id) REFERENCES docsets(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Additive migrations for databases created before these columns
    // existed. SQLite cannot add columns conditionally, so check first.
    for (column, ddl) in [
        ("retry_count", "ALTER TABLE pages ADD COLUMN retry_count INTEGER NOT NULL DEFAULT 0"),
        ("last_attempt_at", "ALTER TABLE pages ADD COLUMN last_attempt_at INTEGER"),
        ("section", "ALTER TABLE pages ADD COLUMN section TEXT"),
        ("subsection", "ALTER TABLE pages ADD COLUMN subsection TEXT"),
    ] {
        if !page_column_exists(pool, column).await? {
            sqlx::query(ddl).execute(pool).await?;
            if column == "subsection" {
                backfill_sections(pool).await?;
            }
        }
    }

    // FTS5 virtual table over chunk text with denormalised page fields
    // (not idempotent natively, check first).
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                chunk_id UNINDEXED,
                docset_id UNINDEXED,
                page_id UNINDEXED,
                url,
                title,
                heading,
                content
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_pages_docset_status ON pages(docset_id, status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_page_id ON chunks(page_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_docset_id ON chunks(docset_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_docsets_base_url ON docsets(base_url)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn page_column_exists(pool: &SqlitePool, column: &str) -> Result<bool> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM pragma_table_info('pages') WHERE name = ?")
            .bind(column)
            .fetch_one(pool)
            .await?;
    Ok(count > 0)
}

/// Derive `(section, subsection)` from a URL path: the first two
/// segments, skipping the `docs` and `api` route prefixes.
pub fn sections_from_path(path: &str) -> (Option<String>, Option<String>) {
    let mut segments = path
        .split('/')
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("docs") && !s.eq_ignore_ascii_case("api"));
    (
        segments.next().map(|s| s.to_string()),
        segments.next().map(|s| s.to_string()),
    )
}

async fn backfill_sections(pool: &SqlitePool) -> Result<()> {
    let rows = sqlx::query("SELECT id, path FROM pages")
        .fetch_all(pool)
        .await?;
    let mut tx = pool.begin().await?;
    for row in rows {
        let id: String = row.get("id");
        let path: String = row.get("path");
        let (section, subsection) = sections_from_path(&path);
        sqlx::query("UPDATE pages SET section = ?, subsection = ? WHERE id = ?")
            .bind(section)
            .bind(subsection)
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}
