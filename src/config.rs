//! Configuration parsing, merging, and validation.
//!
//! The oracle is configured via `<data-dir>/config.json`. The file is a
//! partial: user-provided keys are merged over the built-in defaults by
//! the pure [`merge_config`]. The key set is closed — unknown keys are
//! rejected at parse time — and every numeric range from the contract is
//! checked by [`validate`], which aggregates all offending fields into a
//! single [`ConfigInvalid`] report instead of failing on the first.
//!
//! Runtime clamping of caller-supplied search knobs is kept separately in
//! the query path as defence in depth.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

use crate::error::ConfigInvalid;

/// Fully-resolved configuration (defaults merged with the user file).
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub embedding: EmbeddingConfig,
    pub vector_store: VectorStoreConfig,
    pub worker: WorkerConfig,
    pub crawler: CrawlerConfig,
    pub hybrid: HybridConfig,
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub api_base: Option<String>,
    pub batch_size: usize,
}

#[derive(Debug, Clone)]
pub struct VectorStoreConfig {
    pub provider: String,
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub collection_prefix: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    pub concurrency: usize,
    pub request_delay_ms: u64,
    pub timeout_ms: u64,
    pub max_pages: i64,
    pub user_agent: String,
}

#[derive(Debug, Clone)]
pub struct HybridConfig {
    pub enabled: bool,
    pub alpha: f64,
    pub vector_top_k: usize,
    pub keyword_top_k: usize,
    pub min_keyword_score: f64,
}

#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub max_chunks_per_page: usize,
    pub max_total_chars: usize,
    pub format_snippets: bool,
    pub snippet_max_chars: usize,
}

impl Config {
    /// Built-in defaults rooted at `data_dir`.
    pub fn defaults(data_dir: PathBuf) -> Self {
        Config {
            data_dir,
            embedding: EmbeddingConfig {
                provider: "local".to_string(),
                model: None,
                api_key: None,
                api_base: None,
                batch_size: 100,
            },
            vector_store: VectorStoreConfig {
                provider: "local".to_string(),
                url: None,
                api_key: None,
                collection_prefix: None,
            },
            worker: WorkerConfig {
                port: 7432,
                host: "127.0.0.1".to_string(),
            },
            crawler: CrawlerConfig {
                concurrency: 4,
                request_delay_ms: 1000,
                timeout_ms: 30_000,
                max_pages: 1000,
                user_agent: format!("mem-oracle/{}", env!("CARGO_PKG_VERSION")),
            },
            hybrid: HybridConfig {
                enabled: true,
                alpha: 0.7,
                vector_top_k: 50,
                keyword_top_k: 50,
                min_keyword_score: 0.0,
            },
            retrieval: RetrievalConfig {
                max_chunks_per_page: 3,
                max_total_chars: 20_000,
                format_snippets: true,
                snippet_max_chars: 2000,
            },
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db").join("metadata.sqlite")
    }

    pub fn vectors_dir(&self) -> PathBuf {
        self.data_dir.join("vectors")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }
}

/// The default data directory: `$HOME/.mem-oracle`, falling back to the
/// current directory when no home is known.
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".mem-oracle"))
        .unwrap_or_else(|| PathBuf::from(".mem-oracle"))
}

// ============ User partial (closed key set) ============

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UserConfig {
    pub data_dir: Option<PathBuf>,
    pub embedding: Option<UserEmbedding>,
    pub vector_store: Option<UserVectorStore>,
    pub worker: Option<UserWorker>,
    pub crawler: Option<UserCrawler>,
    pub hybrid: Option<UserHybrid>,
    pub retrieval: Option<UserRetrieval>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UserEmbedding {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub api_base: Option<String>,
    pub batch_size: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UserVectorStore {
    pub provider: Option<String>,
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub collection_prefix: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UserWorker {
    pub port: Option<u16>,
    pub host: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UserCrawler {
    pub concurrency: Option<usize>,
    pub request_delay: Option<u64>,
    pub timeout: Option<u64>,
    pub max_pages: Option<i64>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UserHybrid {
    pub enabled: Option<bool>,
    pub alpha: Option<f64>,
    pub vector_top_k: Option<usize>,
    pub keyword_top_k: Option<usize>,
    pub min_keyword_score: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UserRetrieval {
    pub max_chunks_per_page: Option<usize>,
    pub max_total_chars: Option<usize>,
    pub format_snippets: Option<bool>,
    pub snippet_max_chars: Option<usize>,
}

/// Pure merge of a user partial over the defaults.
pub fn merge_config(defaults: Config, user: UserConfig) -> Config {
    let mut cfg = defaults;

    if let Some(dir) = user.data_dir {
        cfg.data_dir = dir;
    }
    if let Some(e) = user.embedding {
        if let Some(v) = e.provider {
            cfg.embedding.provider = v;
        }
        if e.model.is_some() {
            cfg.embedding.model = e.model;
        }
        if e.api_key.is_some() {
            cfg.embedding.api_key = e.api_key;
        }
        if e.api_base.is_some() {
            cfg.embedding.api_base = e.api_base;
        }
        if let Some(v) = e.batch_size {
            cfg.embedding.batch_size = v;
        }
    }
    if let Some(v) = user.vector_store {
        if let Some(p) = v.provider {
            cfg.vector_store.provider = p;
        }
        if v.url.is_some() {
            cfg.vector_store.url = v.url;
        }
        if v.api_key.is_some() {
            cfg.vector_store.api_key = v.api_key;
        }
        if v.collection_prefix.is_some() {
            cfg.vector_store.collection_prefix = v.collection_prefix;
        }
    }
    if let Some(w) = user.worker {
        if let Some(v) = w.port {
            cfg.worker.port = v;
        }
        if let Some(v) = w.host {
            cfg.worker.host = v;
        }
    }
    if let Some(c) = user.crawler {
        if let Some(v) = c.concurrency {
            cfg.crawler.concurrency = v;
        }
        if let Some(v) = c.request_delay {
            cfg.crawler.request_delay_ms = v;
        }
        if let Some(v) = c.timeout {
            cfg.crawler.timeout_ms = v;
        }
        if let Some(v) = c.max_pages {
            cfg.crawler.max_pages = v;
        }
        if let Some(v) = c.user_agent {
            cfg.crawler.user_agent = v;
        }
    }
    if let Some(h) = user.hybrid {
        if let Some(v) = h.enabled {
            cfg.hybrid.enabled = v;
        }
        if let Some(v) = h.alpha {
            cfg.hybrid.alpha = v;
        }
        if let Some(v) = h.vector_top_k {
            cfg.hybrid.vector_top_k = v;
        }
        if let Some(v) = h.keyword_top_k {
            cfg.hybrid.keyword_top_k = v;
        }
        if let Some(v) = h.min_keyword_score {
            cfg.hybrid.min_keyword_score = v;
        }
    }
    if let Some(r) = user.retrieval {
        if let Some(v) = r.max_chunks_per_page {
            cfg.retrieval.max_chunks_per_page = v;
        }
        if let Some(v) = r.max_total_chars {
            cfg.retrieval.max_total_chars = v;
        }
        if let Some(v) = r.format_snippets {
            cfg.retrieval.format_snippets = v;
        }
        if let Some(v) = r.snippet_max_chars {
            cfg.retrieval.snippet_max_chars = v;
        }
    }

    cfg
}

/// Check every contract range, collecting all violations.
pub fn validate(cfg: &Config) -> Result<(), ConfigInvalid> {
    let mut issues = Vec::new();

    match cfg.embedding.provider.as_str() {
        "local" | "openai" | "voyage" | "cohere" => {}
        other => issues.push(format!(
            "embedding.provider: unknown provider '{}' (expected local, openai, voyage, or cohere)",
            other
        )),
    }
    if !(1..=1000).contains(&cfg.embedding.batch_size) {
        issues.push(format!(
            "embedding.batchSize: {} out of range [1, 1000]",
            cfg.embedding.batch_size
        ));
    }
    if let Some(base) = &cfg.embedding.api_base {
        if url::Url::parse(base).is_err() {
            issues.push(format!("embedding.apiBase: '{}' is not a valid URL", base));
        }
    }

    match cfg.vector_store.provider.as_str() {
        "local" | "qdrant" | "pinecone" => {}
        other => issues.push(format!(
            "vectorStore.provider: unknown provider '{}' (expected local, qdrant, or pinecone)",
            other
        )),
    }

    if cfg.worker.port == 0 {
        issues.push("worker.port: 0 out of range [1, 65535]".to_string());
    }

    if !(1..=50).contains(&cfg.crawler.concurrency) {
        issues.push(format!(
            "crawler.concurrency: {} out of range [1, 50]",
            cfg.crawler.concurrency
        ));
    }
    if cfg.crawler.request_delay_ms > 60_000 {
        issues.push(format!(
            "crawler.requestDelay: {} out of range [0, 60000]",
            cfg.crawler.request_delay_ms
        ));
    }
    if !(1000..=120_000).contains(&cfg.crawler.timeout_ms) {
        issues.push(format!(
            "crawler.timeout: {} out of range [1000, 120000]",
            cfg.crawler.timeout_ms
        ));
    }
    if !(1..=100_000).contains(&cfg.crawler.max_pages) {
        issues.push(format!(
            "crawler.maxPages: {} out of range [1, 100000]",
            cfg.crawler.max_pages
        ));
    }

    if !(0.0..=1.0).contains(&cfg.hybrid.alpha) {
        issues.push(format!(
            "hybrid.alpha: {} out of range [0, 1]",
            cfg.hybrid.alpha
        ));
    }
    if !(1..=1000).contains(&cfg.hybrid.vector_top_k) {
        issues.push(format!(
            "hybrid.vectorTopK: {} out of range [1, 1000]",
            cfg.hybrid.vector_top_k
        ));
    }
    if !(1..=1000).contains(&cfg.hybrid.keyword_top_k) {
        issues.push(format!(
            "hybrid.keywordTopK: {} out of range [1, 1000]",
            cfg.hybrid.keyword_top_k
        ));
    }
    if !(0.0..=1.0).contains(&cfg.hybrid.min_keyword_score) {
        issues.push(format!(
            "hybrid.minKeywordScore: {} out of range [0, 1]",
            cfg.hybrid.min_keyword_score
        ));
    }

    if !(1..=20).contains(&cfg.retrieval.max_chunks_per_page) {
        issues.push(format!(
            "retrieval.maxChunksPerPage: {} out of range [1, 20]",
            cfg.retrieval.max_chunks_per_page
        ));
    }
    if !(1000..=500_000).contains(&cfg.retrieval.max_total_chars) {
        issues.push(format!(
            "retrieval.maxTotalChars: {} out of range [1000, 500000]",
            cfg.retrieval.max_total_chars
        ));
    }
    if !(100..=10_000).contains(&cfg.retrieval.snippet_max_chars) {
        issues.push(format!(
            "retrieval.snippetMaxChars: {} out of range [100, 10000]",
            cfg.retrieval.snippet_max_chars
        ));
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(ConfigInvalid { issues })
    }
}

/// Load the configuration rooted at `data_dir` (or the default root),
/// merging `config.json` if present and validating the result.
pub fn load_config(data_dir: Option<PathBuf>) -> Result<Config> {
    let root = data_dir.unwrap_or_else(default_data_dir);
    let file = root.join("config.json");

    let user = if file.exists() {
        let content = std::fs::read_to_string(&file)
            .with_context(|| format!("failed to read config file: {}", file.display()))?;
        parse_user_config(&content)
            .with_context(|| format!("failed to parse config file: {}", file.display()))?
    } else {
        UserConfig::default()
    };

    let cfg = merge_config(Config::defaults(root), user);
    validate(&cfg)?;
    Ok(cfg)
}

fn parse_user_config(content: &str) -> Result<UserConfig> {
    Ok(serde_json::from_str(content)?)
}
