//! Core data models used throughout the oracle.
//!
//! These types represent the docsets, pages, and chunks that flow through
//! the crawl and retrieval pipeline. Timestamps are Unix seconds; status
//! enums are stored as their string form in SQLite.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a docset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocsetStatus {
    Pending,
    Indexing,
    Ready,
    Error,
}

impl DocsetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocsetStatus::Pending => "pending",
            DocsetStatus::Indexing => "indexing",
            DocsetStatus::Ready => "ready",
            DocsetStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "indexing" => DocsetStatus::Indexing,
            "ready" => DocsetStatus::Ready,
            "error" => DocsetStatus::Error,
            _ => DocsetStatus::Pending,
        }
    }
}

/// Lifecycle state of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageStatus {
    Pending,
    Fetching,
    Fetched,
    Indexing,
    Indexed,
    Error,
    Skipped,
}

impl PageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageStatus::Pending => "pending",
            PageStatus::Fetching => "fetching",
            PageStatus::Fetched => "fetched",
            PageStatus::Indexing => "indexing",
            PageStatus::Indexed => "indexed",
            PageStatus::Error => "error",
            PageStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "fetching" => PageStatus::Fetching,
            "fetched" => PageStatus::Fetched,
            "indexing" => PageStatus::Indexing,
            "indexed" => PageStatus::Indexed,
            "error" => PageStatus::Error,
            "skipped" => PageStatus::Skipped,
            _ => PageStatus::Pending,
        }
    }
}

/// A single documentation source: one site bounded by host + path prefixes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Docset {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub seed_path: String,
    pub allowed_paths: Vec<String>,
    pub status: DocsetStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One URL under a docset.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub id: String,
    pub docset_id: String,
    pub url: String,
    pub path: String,
    pub title: Option<String>,
    pub content_hash: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub status: PageStatus,
    pub error: Option<String>,
    pub retry_count: i64,
    pub last_attempt_at: Option<i64>,
    pub fetched_at: Option<i64>,
    pub indexed_at: Option<i64>,
    pub section: Option<String>,
    pub subsection: Option<String>,
}

/// A contiguous text slice of a page's plain text.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub id: String,
    pub page_id: String,
    pub docset_id: String,
    pub content: String,
    pub heading: Option<String>,
    pub start_offset: i64,
    pub end_offset: i64,
    pub chunk_index: i64,
    pub embedding_id: Option<String>,
    pub created_at: i64,
}

/// A heading found by the extractor, with its level (1-6) and the
/// approximate character offset into the plain text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heading {
    pub level: u8,
    pub text: String,
    pub offset: usize,
}

/// Extractor output for one fetched page.
#[derive(Debug, Clone)]
pub struct ExtractedPage {
    pub url: String,
    pub title: Option<String>,
    pub content: String,
    pub links: Vec<String>,
    pub headings: Vec<Heading>,
}

/// Aggregated page/chunk counts for a docset.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStatus {
    pub total_pages: i64,
    pub pending_pages: i64,
    pub fetching_pages: i64,
    pub indexed_pages: i64,
    pub error_pages: i64,
    pub skipped_pages: i64,
    pub total_chunks: i64,
}

pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
