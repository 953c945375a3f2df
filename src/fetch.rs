//! HTTP fetching with conditional requests and cache fallback.
//!
//! [`PageFetcher`] is the seam the orchestrator depends on; tests supply
//! a stub, production uses [`HttpFetcher`]. One GET per call:
//!
//! - conditional headers come from the caller (the page record) or, when
//!   absent, from the content cache;
//! - 304 answers are served from the cached body;
//! - 2xx bodies are written through to the cache;
//! - 4xx/5xx become [`FetchError::Status`];
//! - transport errors fall back to a cached body at `status = 0` when
//!   one exists, else propagate.
//!
//! Content-type detection is content-sniffing: `.md`/`.mdx` URLs, bodies
//! opening with a Markdown heading, and YAML frontmatter are Markdown
//! regardless of the server's Content-Type.
//!
//! This module also hosts the retry policy used by remote embedding
//! calls (not page fetches): exponential backoff with jitter, capped,
//! retrying on transient transport patterns and {429, 500, 502, 503,
//! 504}, honouring `Retry-After` when it is under the cap.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::ContentCache;
use crate::error::FetchError;

/// Content classification used to pick the extraction path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Html,
    Markdown,
}

/// Result of a page fetch.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub content: String,
    pub content_kind: ContentKind,
    /// HTTP status; 304 for a not-modified answer served from cache, 0
    /// for a transport-error fallback to cache.
    pub status: u16,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub from_cache: bool,
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetch one URL. `etag` / `last_modified` override the cached
    /// conditional headers when provided.
    async fn fetch(
        &self,
        url: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<FetchOutcome, FetchError>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
    cache: Arc<ContentCache>,
}

impl HttpFetcher {
    pub fn new(cache: Arc<ContentCache>, timeout: Duration, user_agent: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self { client, cache }
    }

    async fn request(
        &self,
        url: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let mut req = self.client.get(url);
        if let Some(etag) = etag {
            req = req.header(reqwest::header::IF_NONE_MATCH, etag);
        }
        if let Some(lm) = last_modified {
            req = req.header(reqwest::header::IF_MODIFIED_SINCE, lm);
        }
        req.send().await
    }

    async fn consume_success(&self, url: &str, resp: reqwest::Response) -> Result<FetchOutcome, FetchError> {
        let status = resp.status().as_u16();
        let etag = header_string(&resp, reqwest::header::ETAG);
        let last_modified = header_string(&resp, reqwest::header::LAST_MODIFIED);
        let server_type = header_string(&resp, reqwest::header::CONTENT_TYPE);

        let content = resp
            .text()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        let content_kind = sniff_content_kind(url, &content);

        let content_type = server_type.unwrap_or_else(|| match content_kind {
            ContentKind::Markdown => "text/markdown".to_string(),
            ContentKind::Html => "text/html".to_string(),
        });
        if let Err(e) = self.cache.put(
            url,
            &content,
            &content_type,
            etag.as_deref(),
            last_modified.as_deref(),
        ) {
            tracing::warn!(url, error = %e, "failed to write cache entry");
        }

        Ok(FetchOutcome {
            content,
            content_kind,
            status,
            etag,
            last_modified,
            from_cache: false,
        })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<FetchOutcome, FetchError> {
        let cached = self.cache.get(url);
        let etag = etag
            .map(|s| s.to_string())
            .or_else(|| cached.as_ref().and_then(|c| c.etag.clone()));
        let last_modified = last_modified
            .map(|s| s.to_string())
            .or_else(|| cached.as_ref().and_then(|c| c.last_modified.clone()));

        match self.request(url, etag.as_deref(), last_modified.as_deref()).await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if status == 304 {
                    if let Some(c) = cached {
                        return Ok(FetchOutcome {
                            content_kind: sniff_content_kind(url, &c.content),
                            content: c.content,
                            status: 304,
                            etag: c.etag,
                            last_modified: c.last_modified,
                            from_cache: true,
                        });
                    }
                    // 304 without a local body cannot be satisfied;
                    // refetch once unconditionally.
                    let resp = self
                        .request(url, None, None)
                        .await
                        .map_err(|e| FetchError::Transport(e.to_string()))?;
                    if !resp.status().is_success() {
                        return Err(FetchError::Status(resp.status().as_u16()));
                    }
                    return self.consume_success(url, resp).await;
                }
                if resp.status().is_success() {
                    self.consume_success(url, resp).await
                } else {
                    Err(FetchError::Status(status))
                }
            }
            Err(e) => match cached {
                // Graceful degradation: serve the stale body.
                Some(c) => Ok(FetchOutcome {
                    content_kind: sniff_content_kind(url, &c.content),
                    content: c.content,
                    status: 0,
                    etag: c.etag,
                    last_modified: c.last_modified,
                    from_cache: true,
                }),
                None => Err(FetchError::Transport(e.to_string())),
            },
        }
    }
}

fn header_string(resp: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Classify fetched content as Markdown or HTML by sniffing the URL and
/// the body, ignoring the server's Content-Type.
pub fn sniff_content_kind(url: &str, body: &str) -> ContentKind {
    let path = url::Url::parse(url)
        .map(|u| u.path().to_lowercase())
        .unwrap_or_default();
    if path.ends_with(".md") || path.ends_with(".mdx") {
        return ContentKind::Markdown;
    }

    let trimmed = body.trim_start();
    if trimmed.starts_with("# ") || trimmed.starts_with("## ") {
        return ContentKind::Markdown;
    }

    // YAML frontmatter: an opening `---` line with a closing one.
    if (body.starts_with("---\n") || body.starts_with("---\r\n")) && body[3..].contains("\n---") {
        return ContentKind::Markdown;
    }

    ContentKind::Html
}

// ============ Retry policy (remote embedding calls) ============

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Transport errors worth retrying, matched against common transient
/// failure messages.
pub fn is_transient_error(message: &str) -> bool {
    static PATTERNS: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = PATTERNS.get_or_init(|| {
        regex::Regex::new(r"(?i)timeout|timed out|connection reset|connection refused|socket hang up|fetch failed")
            .expect("static regex")
    });
    re.is_match(message)
}

pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

/// Delay before retry `attempt` (0-based): `base · 2^attempt` plus up to
/// one extra `base` of jitter, capped. A server-provided `Retry-After`
/// wins when it is under the cap.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32, retry_after: Option<Duration>) -> Duration {
    if let Some(after) = retry_after {
        if after < policy.max_delay {
            return after;
        }
    }
    let exp = policy.base_delay.as_millis() as u64 * 2u64.saturating_pow(attempt);
    let jitter = (rand::random::<f64>() * policy.base_delay.as_millis() as f64) as u64;
    Duration::from_millis(exp + jitter).min(policy.max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff_markdown_extension() {
        assert_eq!(
            sniff_content_kind("https://docs.example.com/guide.md", "<html>"),
            ContentKind::Markdown
        );
        assert_eq!(
            sniff_content_kind("https://docs.example.com/guide.mdx", "whatever"),
            ContentKind::Markdown
        );
    }

    #[test]
    fn test_sniff_markdown_heading() {
        assert_eq!(
            sniff_content_kind("https://docs.example.com/guide", "# Title\n\nBody"),
            ContentKind::Markdown
        );
        assert_eq!(
            sniff_content_kind("https://docs.example.com/guide", "## Section"),
            ContentKind::Markdown
        );
    }

    #[test]
    fn test_sniff_frontmatter() {
        let body = "---\ntitle: Guide\n---\n\nContent";
        assert_eq!(
            sniff_content_kind("https://docs.example.com/guide", body),
            ContentKind::Markdown
        );
    }

    #[test]
    fn test_sniff_html_default() {
        assert_eq!(
            sniff_content_kind("https://docs.example.com/guide", "<html><body>hi</body></html>"),
            ContentKind::Html
        );
        // A lone dash ruler is not frontmatter.
        assert_eq!(
            sniff_content_kind("https://docs.example.com/guide", "--- broken"),
            ContentKind::Html
        );
    }

    #[test]
    fn test_transient_patterns() {
        assert!(is_transient_error("connection reset by peer"));
        assert!(is_transient_error("operation timed out"));
        assert!(is_transient_error("Socket hang up"));
        assert!(!is_transient_error("invalid API key"));
    }

    #[test]
    fn test_retryable_statuses() {
        for status in [429, 500, 502, 503, 504] {
            assert!(is_retryable_status(status));
        }
        for status in [200, 304, 400, 401, 403, 404, 501] {
            assert!(!is_retryable_status(status));
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        };
        let d0 = backoff_delay(&policy, 0, None);
        assert!(d0 >= Duration::from_millis(100) && d0 <= Duration::from_millis(200));

        let d10 = backoff_delay(&policy, 10, None);
        assert_eq!(d10, Duration::from_secs(2), "capped at max_delay");
    }

    #[test]
    fn test_backoff_honours_retry_after_under_cap() {
        let policy = RetryPolicy::default();
        let d = backoff_delay(&policy, 0, Some(Duration::from_secs(5)));
        assert_eq!(d, Duration::from_secs(5));

        // Above the cap the normal schedule applies.
        let d = backoff_delay(&policy, 0, Some(Duration::from_secs(600)));
        assert!(d <= policy.max_delay);
    }
}
