//! Disk-backed content cache for fetched page bodies.
//!
//! Pure key-value store over URL → body + conditional headers. The key is
//! the first 16 hex characters of the SHA-256 of the URL, namespaced by a
//! hostname directory: `cache/<hostname>/<16-hex>.json`. There is no
//! invalidation policy — the fetcher owns freshness via conditional
//! requests.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::models::now_ts;

/// A cached page body with the headers needed for conditional refetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedBody {
    pub url: String,
    pub content: String,
    pub content_type: String,
    pub fetched_at: i64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

pub struct ContentCache {
    root: PathBuf,
}

impl ContentCache {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn get(&self, url: &str) -> Option<CachedBody> {
        let path = self.entry_path(url)?;
        let content = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn has(&self, url: &str) -> bool {
        self.entry_path(url).map(|p| p.exists()).unwrap_or(false)
    }

    pub fn put(
        &self,
        url: &str,
        content: &str,
        content_type: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<()> {
        let path = self
            .entry_path(url)
            .context("URL has no host, cannot cache")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let body = CachedBody {
            url: url.to_string(),
            content: content.to_string(),
            content_type: content_type.to_string(),
            fetched_at: now_ts(),
            etag: etag.map(|s| s.to_string()),
            last_modified: last_modified.map(|s| s.to_string()),
        };

        std::fs::write(&path, serde_json::to_string(&body)?)
            .with_context(|| format!("failed to write cache entry {}", path.display()))?;
        Ok(())
    }

    pub fn delete(&self, url: &str) -> Result<()> {
        if let Some(path) = self.entry_path(url) {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    /// Remove every cached entry.
    pub fn clear(&self) -> Result<()> {
        if self.root.exists() {
            std::fs::remove_dir_all(&self.root)?;
        }
        Ok(())
    }

    fn entry_path(&self, url: &str) -> Option<PathBuf> {
        let host = url::Url::parse(url).ok()?.host_str()?.to_string();
        Some(self.root.join(host).join(format!("{}.json", url_key(url))))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// First 16 hex characters of the SHA-256 of the URL.
fn url_key(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}
