//! Query path: hybrid retrieval with diversity and budget shaping.
//!
//! A query is embedded once, then the vector phase (exact cosine per
//! target namespace) and the keyword phase (FTS) run concurrently. When
//! hybrid mode is on their scores fuse per chunk:
//! `hybrid = α·clamp(vector) + (1−α)·clamp(keyword)`.
//!
//! Two admission filters shape the ranked list:
//! - **diversity** — at most `max_chunks_per_page` chunks per
//!   `(docset, page)`, stopping once `top_k` results are admitted;
//! - **budget** — a running character total capped at `max_total_chars`,
//!   with one truncated tail snippet when at least 200 characters of
//!   budget remain.
//!
//! Caller-supplied knobs are clamped here as defence in depth on top of
//! config validation.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::ingest::Oracle;

/// Minimum leftover budget for which a truncated tail snippet is still
/// worth emitting.
const MIN_TAIL_BUDGET: usize = 200;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchRequest {
    pub query: String,
    pub docset_ids: Option<Vec<String>>,
    pub top_k: Option<usize>,
    pub min_score: Option<f32>,
    pub max_chunks_per_page: Option<usize>,
    pub max_total_chars: Option<usize>,
    pub format_snippets: Option<bool>,
}

/// A formatted snippet ready for injection into a model context.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snippet {
    pub formatted: String,
    pub title: String,
    pub url: String,
    pub breadcrumb: Option<String>,
    pub content: String,
    pub char_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub chunk_id: String,
    pub docset_id: String,
    pub page_id: String,
    pub url: String,
    pub title: Option<String>,
    pub heading: Option<String>,
    pub content: String,
    pub vector_score: f64,
    pub keyword_score: f64,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<Snippet>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    pub query: String,
    pub total_chars: usize,
    pub truncated: bool,
}

impl Oracle {
    /// Answer a query with fused dense + sparse retrieval.
    pub async fn search(self: &Arc<Self>, request: SearchRequest) -> Result<SearchResponse> {
        let query = request.query.trim().to_string();
        if query.is_empty() {
            return Ok(SearchResponse {
                results: Vec::new(),
                query,
                total_chars: 0,
                truncated: false,
            });
        }

        let retrieval = &self.config.retrieval;
        let hybrid = &self.config.hybrid;

        let top_k = request.top_k.unwrap_or(10).clamp(1, 100);
        let min_score = request.min_score.unwrap_or(0.0).clamp(0.0, 1.0);
        let max_chunks_per_page = request
            .max_chunks_per_page
            .unwrap_or(retrieval.max_chunks_per_page)
            .clamp(1, 20);
        let max_total_chars = request
            .max_total_chars
            .unwrap_or(retrieval.max_total_chars)
            .clamp(1000, 500_000);
        let format_snippets = request.format_snippets.unwrap_or(retrieval.format_snippets);

        let vector_top_k = hybrid.vector_top_k.clamp(1, 1000);
        let keyword_top_k = hybrid.keyword_top_k.clamp(1, 1000);
        let alpha = hybrid.alpha.clamp(0.0, 1.0);
        let min_keyword_score = hybrid.min_keyword_score.clamp(0.0, 1.0);

        let namespaces: Vec<String> = match &request.docset_ids {
            Some(ids) if !ids.is_empty() => ids.clone(),
            _ => self
                .store
                .list_docsets()
                .await?
                .into_iter()
                .map(|d| d.id)
                .collect(),
        };

        let query_vector = self.provider.embed_single(&query).await?;

        let (vector_hits, keyword_hits) = tokio::join!(
            self.vector_phase(&namespaces, &query_vector, vector_top_k, min_score),
            async {
                if hybrid.enabled {
                    self.store
                        .search_keyword(&query, request.docset_ids.as_deref(), keyword_top_k)
                        .await
                } else {
                    Ok(Vec::new())
                }
            }
        );
        let vector_hits = vector_hits?;
        let keyword_hits = keyword_hits?;

        let fused = fuse(vector_hits, keyword_hits, alpha, min_keyword_score);
        let diverse = diversity_filter(fused, max_chunks_per_page, top_k);
        let (results, total_chars, truncated) = budget_filter(
            diverse,
            max_total_chars,
            format_snippets,
            retrieval.snippet_max_chars,
        );

        Ok(SearchResponse {
            results,
            query,
            total_chars,
            truncated,
        })
    }

    /// Exact cosine search per target namespace, merged and cut to
    /// `vector_top_k` overall.
    async fn vector_phase(
        self: &Arc<Self>,
        namespaces: &[String],
        query_vector: &[f32],
        vector_top_k: usize,
        min_score: f32,
    ) -> Result<Vec<crate::vector::VectorHit>> {
        let mut merged = Vec::new();
        for namespace in namespaces {
            let hits = self
                .vectors
                .search(namespace, query_vector, vector_top_k, min_score)
                .await?;
            merged.extend(hits);
        }
        merged.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        merged.truncate(vector_top_k);
        Ok(merged)
    }
}

// ============ Fusion ============

/// Merge vector and keyword hits by chunk id and compute the convex
/// combination of their clamped scores. Keyword hits under
/// `min_keyword_score` are ignored; a chunk found by both signals takes
/// the max keyword score.
fn fuse(
    vector_hits: Vec<crate::vector::VectorHit>,
    keyword_hits: Vec<crate::metadata::KeywordHit>,
    alpha: f64,
    min_keyword_score: f64,
) -> Vec<SearchHit> {
    let mut by_chunk: HashMap<String, SearchHit> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for hit in vector_hits {
        let meta = hit.metadata;
        order.push(meta.chunk_id.clone());
        by_chunk.insert(
            meta.chunk_id.clone(),
            SearchHit {
                chunk_id: meta.chunk_id,
                docset_id: meta.docset_id,
                page_id: meta.page_id,
                url: meta.url,
                title: meta.title,
                heading: meta.heading,
                content: meta.content,
                vector_score: hit.score as f64,
                keyword_score: 0.0,
                score: 0.0,
                snippet: None,
            },
        );
    }

    for hit in keyword_hits {
        if hit.keyword_score < min_keyword_score {
            continue;
        }
        match by_chunk.get_mut(&hit.chunk_id) {
            Some(existing) => {
                existing.keyword_score = existing.keyword_score.max(hit.keyword_score);
            }
            None => {
                order.push(hit.chunk_id.clone());
                by_chunk.insert(
                    hit.chunk_id.clone(),
                    SearchHit {
                        chunk_id: hit.chunk_id,
                        docset_id: hit.docset_id,
                        page_id: hit.page_id,
                        url: hit.url,
                        title: hit.title,
                        heading: hit.heading,
                        content: hit.content,
                        vector_score: 0.0,
                        keyword_score: hit.keyword_score,
                        score: 0.0,
                        snippet: None,
                    },
                );
            }
        }
    }

    let mut fused: Vec<SearchHit> = order
        .into_iter()
        .filter_map(|chunk_id| by_chunk.remove(&chunk_id))
        .map(|mut hit| {
            hit.score = alpha * hit.vector_score.clamp(0.0, 1.0)
                + (1.0 - alpha) * hit.keyword_score.clamp(0.0, 1.0);
            hit
        })
        .collect();

    fused.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    fused
}

// ============ Diversity ============

/// Admit results in score order, at most `max_chunks_per_page` per
/// `(docset, page)`, stopping once `top_k` are admitted.
fn diversity_filter(hits: Vec<SearchHit>, max_chunks_per_page: usize, top_k: usize) -> Vec<SearchHit> {
    let mut per_page: HashMap<(String, String), usize> = HashMap::new();
    let mut admitted = Vec::new();

    for hit in hits {
        if admitted.len() >= top_k {
            break;
        }
        let key = (hit.docset_id.clone(), hit.page_id.clone());
        let count = per_page.entry(key).or_insert(0);
        if *count >= max_chunks_per_page {
            continue;
        }
        *count += 1;
        admitted.push(hit);
    }
    admitted
}

// ============ Budget ============

/// Admit results while the running character total stays within
/// `max_total_chars`. The first result is always admitted (truncated to
/// the budget when snippets are on); afterwards a result that would
/// overflow is included as a truncated tail snippet only when at least
/// [`MIN_TAIL_BUDGET`] characters remain.
fn budget_filter(
    hits: Vec<SearchHit>,
    max_total_chars: usize,
    format_snippets: bool,
    snippet_max_chars: usize,
) -> (Vec<SearchHit>, usize, bool) {
    let mut admitted: Vec<SearchHit> = Vec::new();
    let mut total = 0usize;
    let mut truncated = false;

    for mut hit in hits {
        let remaining = max_total_chars.saturating_sub(total);
        let full_len = hit.content.len().min(snippet_max_chars.max(1));

        if full_len <= remaining {
            if format_snippets {
                let snippet = format_snippet(&hit, full_len);
                total += snippet.content.len();
                hit.snippet = Some(snippet);
            } else {
                total += full_len;
                if hit.content.len() > full_len {
                    hit.content = truncate_at_boundary(&hit.content, full_len);
                }
            }
            admitted.push(hit);
            continue;
        }

        if admitted.is_empty() {
            // A single first result is always admitted.
            let budget = remaining.min(full_len).max(1);
            if format_snippets {
                let snippet = format_snippet(&hit, budget);
                total += snippet.content.len();
                hit.snippet = Some(snippet);
            } else {
                hit.content = truncate_at_boundary(&hit.content, budget);
                total += hit.content.len();
            }
            admitted.push(hit);
            truncated = true;
            break;
        }

        if remaining >= MIN_TAIL_BUDGET && format_snippets {
            let snippet = format_snippet(&hit, remaining);
            total += snippet.content.len();
            hit.snippet = Some(snippet);
            admitted.push(hit);
        }
        truncated = true;
        break;
    }

    (admitted, total, truncated)
}

// ============ Snippets ============

/// Render one result for context injection:
///
/// ```text
/// ## <title or "Untitled">
/// Source: <url>
/// [Section: <breadcrumb>]
///
/// <possibly-truncated content>
/// ```
fn format_snippet(hit: &SearchHit, content_budget: usize) -> Snippet {
    let title = hit.title.clone().unwrap_or_else(|| "Untitled".to_string());
    let breadcrumb = breadcrumb(hit.heading.as_deref(), &hit.url);
    let content = truncate_at_boundary(&hit.content, content_budget);

    let mut formatted = format!("## {}\nSource: {}\n", title, hit.url);
    if let Some(crumb) = &breadcrumb {
        formatted.push_str(&format!("[Section: {}]\n", crumb));
    }
    formatted.push('\n');
    formatted.push_str(&content);

    Snippet {
        char_count: formatted.len(),
        formatted,
        title,
        url: hit.url.clone(),
        breadcrumb,
        content,
    }
}

/// Human-readable section path from the chunk heading and the URL path:
/// up to the last two path segments (excluding `docs` and `api` route
/// prefixes), title-cased. A heading that already names the last segment
/// stands alone.
fn breadcrumb(heading: Option<&str>, url: &str) -> Option<String> {
    let segments: Vec<String> = url::Url::parse(url)
        .ok()
        .map(|u| {
            u.path()
                .split('/')
                .filter(|s| {
                    !s.is_empty() && !s.eq_ignore_ascii_case("docs") && !s.eq_ignore_ascii_case("api")
                })
                .map(title_case)
                .collect()
        })
        .unwrap_or_default();

    let tail: Vec<String> = segments.iter().rev().take(2).rev().cloned().collect();

    match (heading, tail.is_empty()) {
        (Some(heading), false) => {
            let last = tail.last().expect("tail non-empty");
            if heading.to_lowercase().contains(&last.to_lowercase()) {
                Some(heading.to_string())
            } else {
                Some(format!("{} > {}", tail.join(" > "), heading))
            }
        }
        (Some(heading), true) => Some(heading.to_string()),
        (None, false) => Some(tail.join(" > ")),
        (None, true) => None,
    }
}

fn title_case(segment: &str) -> String {
    segment
        .split(['-', '_'])
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Truncate to at most `limit` bytes including the trailing `…`,
/// preferring a paragraph boundary in the last half of the budget, then
/// a sentence boundary in the last half, then a word boundary in the
/// last 30%, else a hard cut. The `…` is omitted only when the content
/// fit whole.
fn truncate_at_boundary(content: &str, limit: usize) -> String {
    if content.len() <= limit {
        return content.to_string();
    }
    let budget = limit.saturating_sub('…'.len_utf8()).max(1);
    let budget = floor_char_boundary(content, budget);
    let window = &content[..budget];

    let half = budget / 2;
    if let Some(pos) = window.rfind("\n\n") {
        if pos >= half {
            return format!("{}…", window[..pos].trim_end());
        }
    }

    let sentence_cut = [". ", "! ", "? "]
        .iter()
        .filter_map(|sep| window.rfind(sep).map(|p| p + 1))
        .max();
    if let Some(pos) = sentence_cut {
        if pos >= half {
            return format!("{}…", window[..pos].trim_end());
        }
    }

    if let Some(pos) = window.rfind(' ') {
        if pos >= budget.saturating_mul(7) / 10 {
            return format!("{}…", window[..pos].trim_end());
        }
    }

    format!("{}…", window.trim_end())
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut index = index;
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::KeywordHit;
    use crate::vector::{VectorHit, VectorMetadata};

    fn vector_hit(chunk_id: &str, page_id: &str, score: f32) -> VectorHit {
        VectorHit {
            id: chunk_id.to_string(),
            score,
            metadata: VectorMetadata {
                docset_id: "d1".to_string(),
                page_id: page_id.to_string(),
                chunk_id: chunk_id.to_string(),
                url: "https://docs.example.com/docs/guides/install".to_string(),
                title: Some("Install".to_string()),
                heading: None,
                content: format!("content for {}", chunk_id),
            },
        }
    }

    fn keyword_hit(chunk_id: &str, page_id: &str, score: f64) -> KeywordHit {
        KeywordHit {
            chunk_id: chunk_id.to_string(),
            docset_id: "d1".to_string(),
            page_id: page_id.to_string(),
            url: "https://docs.example.com/docs/guides/install".to_string(),
            title: Some("Install".to_string()),
            heading: None,
            content: format!("content for {}", chunk_id),
            keyword_score: score,
        }
    }

    fn plain_hit(chunk_id: &str, page_id: &str, score: f64, content: &str) -> SearchHit {
        SearchHit {
            chunk_id: chunk_id.to_string(),
            docset_id: "d1".to_string(),
            page_id: page_id.to_string(),
            url: "https://docs.example.com/docs/guides/install".to_string(),
            title: Some("Install".to_string()),
            heading: None,
            content: content.to_string(),
            vector_score: score,
            keyword_score: 0.0,
            score,
            snippet: None,
        }
    }

    #[test]
    fn test_fuse_convex_combination() {
        let fused = fuse(
            vec![vector_hit("c1", "p1", 0.8)],
            vec![keyword_hit("c1", "p1", 0.5)],
            0.7,
            0.0,
        );
        assert_eq!(fused.len(), 1);
        let expected = 0.7 * 0.8 + 0.3 * 0.5;
        assert!((fused[0].score - expected).abs() < 1e-9);
    }

    #[test]
    fn test_fuse_keyword_only_entry() {
        let fused = fuse(vec![], vec![keyword_hit("c2", "p1", 0.9)], 0.7, 0.0);
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].vector_score, 0.0);
        assert!((fused[0].score - 0.3 * 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_fuse_min_keyword_score_drops() {
        let fused = fuse(vec![], vec![keyword_hit("c2", "p1", 0.1)], 0.7, 0.5);
        assert!(fused.is_empty());
    }

    #[test]
    fn test_fuse_clamps_out_of_range_scores() {
        let fused = fuse(vec![vector_hit("c1", "p1", 1.7)], vec![], 1.0, 0.0);
        assert!((fused[0].score - 1.0).abs() < 1e-9);

        let fused = fuse(vec![vector_hit("c1", "p1", -0.4)], vec![], 1.0, 0.0);
        assert_eq!(fused[0].score, 0.0);
    }

    #[test]
    fn test_fuse_sorted_descending() {
        let fused = fuse(
            vec![vector_hit("low", "p1", 0.2), vector_hit("high", "p2", 0.9)],
            vec![],
            1.0,
            0.0,
        );
        assert_eq!(fused[0].chunk_id, "high");
        assert_eq!(fused[1].chunk_id, "low");
    }

    #[test]
    fn test_diversity_caps_per_page() {
        let hits = vec![
            plain_hit("c1", "p1", 0.9, "x"),
            plain_hit("c2", "p1", 0.8, "x"),
            plain_hit("c3", "p1", 0.7, "x"),
            plain_hit("c4", "p2", 0.6, "x"),
        ];
        let admitted = diversity_filter(hits, 2, 10);
        assert_eq!(admitted.len(), 3);
        let from_p1 = admitted.iter().filter(|h| h.page_id == "p1").count();
        assert_eq!(from_p1, 2);
        assert_eq!(admitted[2].chunk_id, "c4");
    }

    #[test]
    fn test_diversity_stops_at_top_k() {
        let hits: Vec<SearchHit> = (0..10)
            .map(|i| plain_hit(&format!("c{}", i), &format!("p{}", i), 1.0 - i as f64 / 10.0, "x"))
            .collect();
        let admitted = diversity_filter(hits, 3, 4);
        assert_eq!(admitted.len(), 4);
    }

    #[test]
    fn test_budget_sums_content_within_limit() {
        let hits = vec![
            plain_hit("c1", "p1", 0.9, &"a".repeat(500)),
            plain_hit("c2", "p2", 0.8, &"b".repeat(500)),
            plain_hit("c3", "p3", 0.7, &"c".repeat(500)),
        ];
        let (admitted, total, truncated) = budget_filter(hits, 1000, false, 10_000);
        assert_eq!(admitted.len(), 2);
        assert!(total <= 1000);
        assert!(truncated);
    }

    #[test]
    fn test_budget_first_result_always_admitted() {
        let hits = vec![plain_hit("c1", "p1", 0.9, &"a".repeat(5000))];
        let (admitted, total, _) = budget_filter(hits, 1000, false, 10_000);
        assert_eq!(admitted.len(), 1);
        assert!(total <= 1000);
    }

    #[test]
    fn test_budget_tail_snippet_when_enough_room() {
        let hits = vec![
            plain_hit("c1", "p1", 0.9, &"a".repeat(700)),
            plain_hit("c2", "p2", 0.8, &"word ".repeat(200)),
        ];
        let (admitted, total, truncated) = budget_filter(hits, 1000, true, 10_000);
        assert_eq!(admitted.len(), 2, "300 chars of budget remain, tail snippet fits");
        assert!(truncated);
        let tail = admitted[1].snippet.as_ref().unwrap();
        assert!(tail.content.len() <= 300);
        assert!(tail.content.ends_with('…'));
        assert!(total <= 1000 + 3, "content budget respected: {}", total);
    }

    #[test]
    fn test_budget_no_tail_snippet_under_min_budget() {
        let hits = vec![
            plain_hit("c1", "p1", 0.9, &"a".repeat(900)),
            plain_hit("c2", "p2", 0.8, &"b".repeat(500)),
        ];
        let (admitted, _, truncated) = budget_filter(hits, 1000, true, 10_000);
        assert_eq!(admitted.len(), 1, "only 100 chars remain, below the tail threshold");
        assert!(truncated);
    }

    #[test]
    fn test_snippet_shape() {
        let hit = plain_hit("c1", "p1", 0.9, "Install with cargo.");
        let snippet = format_snippet(&hit, 10_000);
        assert!(snippet.formatted.starts_with("## Install\nSource: https://docs.example.com"));
        assert!(snippet.formatted.contains("[Section: "));
        assert!(snippet.formatted.ends_with("Install with cargo."));
        assert_eq!(snippet.char_count, snippet.formatted.len());
    }

    #[test]
    fn test_snippet_untitled() {
        let mut hit = plain_hit("c1", "p1", 0.9, "body");
        hit.title = None;
        let snippet = format_snippet(&hit, 10_000);
        assert!(snippet.formatted.starts_with("## Untitled\n"));
    }

    #[test]
    fn test_breadcrumb_segments_title_cased() {
        let crumb = breadcrumb(None, "https://docs.example.com/docs/getting-started/install").unwrap();
        assert_eq!(crumb, "Getting Started > Install");
    }

    #[test]
    fn test_breadcrumb_excludes_docs_and_api() {
        let crumb = breadcrumb(None, "https://docs.example.com/docs/api/auth").unwrap();
        assert_eq!(crumb, "Auth");
    }

    #[test]
    fn test_breadcrumb_heading_containing_segment_wins() {
        let crumb = breadcrumb(
            Some("Install Guide"),
            "https://docs.example.com/docs/getting-started/install",
        )
        .unwrap();
        assert_eq!(crumb, "Install Guide");
    }

    #[test]
    fn test_breadcrumb_heading_appended_otherwise() {
        let crumb = breadcrumb(
            Some("Advanced Options"),
            "https://docs.example.com/docs/getting-started/install",
        )
        .unwrap();
        assert_eq!(crumb, "Getting Started > Install > Advanced Options");
    }

    #[test]
    fn test_breadcrumb_none_when_nothing() {
        assert_eq!(breadcrumb(None, "https://docs.example.com/"), None);
    }

    #[test]
    fn test_truncate_prefers_paragraph_boundary() {
        let content = format!("{}\n\n{}", "a".repeat(600), "b".repeat(600));
        let cut = truncate_at_boundary(&content, 800);
        assert_eq!(cut, format!("{}…", "a".repeat(600)));
    }

    #[test]
    fn test_truncate_falls_back_to_sentence() {
        let content = format!("{}. {}", "a".repeat(600), "b".repeat(600));
        let cut = truncate_at_boundary(&content, 800);
        assert_eq!(cut, format!("{}.…", "a".repeat(600)));
    }

    #[test]
    fn test_truncate_word_boundary() {
        let content = "word ".repeat(300);
        let cut = truncate_at_boundary(&content, 502);
        assert!(cut.len() <= 502 + '…'.len_utf8());
        assert!(cut.ends_with('…'));
        assert!(!cut.trim_end_matches('…').ends_with("wor"), "no mid-word cut");
    }

    #[test]
    fn test_truncate_hard_cut_last_resort() {
        let content = "x".repeat(1000);
        let cut = truncate_at_boundary(&content, 100);
        assert_eq!(cut, format!("{}…", "x".repeat(97)));
        assert!(cut.len() <= 100);
    }

    #[test]
    fn test_truncate_whole_content_untouched() {
        assert_eq!(truncate_at_boundary("short", 100), "short");
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("getting-started"), "Getting Started");
        assert_eq!(title_case("api_reference"), "Api Reference");
        assert_eq!(title_case("install"), "Install");
    }
}
