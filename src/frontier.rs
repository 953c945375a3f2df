//! Per-docset link frontier: discovered-but-unfetched URLs.
//!
//! The frontier enforces the crawl boundary — same host as the docset's
//! base URL and a path under one of the allowed prefixes — plus the
//! per-docset page cap. Queue order is smallest depth first with a
//! stable insertion-order tie-break.

use anyhow::Result;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use url::Url;

use crate::metadata::MetadataStore;
use crate::models::Docset;

/// One discovered URL awaiting fetch.
#[derive(Debug, Clone)]
pub struct QueuedLink {
    pub url: String,
    pub depth: u32,
    pub from: Option<String>,
}

#[derive(Debug, Default)]
pub struct Frontier {
    queue: BinaryHeap<Reverse<(u32, u64, String, Option<String>)>>,
    visited: HashSet<String>,
    seq: u64,
}

impl Frontier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    fn enqueue(&mut self, url: String, depth: u32, from: Option<String>) {
        self.queue.push(Reverse((depth, self.seq, url, from)));
        self.seq += 1;
    }

    /// Pop the item with smallest depth (insertion order breaks ties).
    pub fn next(&mut self) -> Option<QueuedLink> {
        self.queue.pop().map(|Reverse((depth, _, url, from))| QueuedLink { url, depth, from })
    }

    /// Admit candidate links discovered on `from_url` at `depth`:
    /// unvisited, same-host, under an allowed prefix, not yet known as a
    /// page, and within the docset page cap. Admitted links get a `pending`
    /// page record and are queued at `depth + 1`.
    pub async fn discover_links(
        &mut self,
        store: &MetadataStore,
        docset: &Docset,
        from_url: &str,
        candidates: &[String],
        depth: u32,
        max_pages: i64,
    ) -> Result<usize> {
        let Ok(base) = Url::parse(&docset.base_url) else {
            return Ok(0);
        };

        let mut admitted = 0usize;
        for candidate in candidates {
            if self.visited.contains(candidate) {
                continue;
            }
            self.visited.insert(candidate.clone());

            let Some(confined) = confine(&base, &docset.allowed_paths, candidate) else {
                continue;
            };
            let url = confined.to_string();
            if store.page_exists(&docset.id, &url).await? {
                continue;
            }
            if store.count_pages(&docset.id).await? >= max_pages {
                tracing::debug!(docset = %docset.id, max_pages, "page cap reached, not enqueuing");
                return Ok(admitted);
            }

            store.create_page(&docset.id, &url, confined.path()).await?;
            self.enqueue(url, depth + 1, Some(from_url.to_string()));
            admitted += 1;
        }
        Ok(admitted)
    }

    /// Hydrate the queue from pages still `pending` in the metadata
    /// store, e.g. on resume after restart.
    pub async fn load_pending_pages(&mut self, store: &MetadataStore, docset_id: &str) -> Result<usize> {
        let pages = store.pending_pages(docset_id).await?;
        let mut added = 0usize;
        for page in pages {
            if self.visited.insert(page.url.clone()) {
                self.enqueue(page.url, 0, None);
                added += 1;
            }
        }
        Ok(added)
    }
}

/// Parse a candidate and keep it only when its host matches the base and
/// its path starts with at least one allowed prefix. Fragments are
/// dropped.
pub fn confine(base: &Url, allowed_paths: &[String], candidate: &str) -> Option<Url> {
    let mut url = Url::parse(candidate).ok()?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return None;
    }
    if url.host_str() != base.host_str() {
        return None;
    }
    let path = url.path().to_string();
    if !allowed_paths.iter().any(|prefix| path.starts_with(prefix.as_str())) {
        return None;
    }
    url.set_fragment(None);
    Some(url)
}
