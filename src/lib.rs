//! # mem-oracle
//!
//! **A local documentation oracle for code-assistant tooling.**
//!
//! mem-oracle crawls public documentation sites, decomposes pages into
//! semantically coherent chunks, embeds those chunks into a vector
//! space, and answers natural-language queries with the most relevant
//! snippets fused from dense (vector) and sparse (keyword) retrieval.
//! It runs as a single-user background service on a developer
//! workstation, serving clients over HTTP and over a JSON-RPC tool
//! protocol on stdio.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────────────┐   ┌───────────────┐
//! │ Frontier │──▶│ fetch → extract → chunk  │──▶│ SQLite (FTS5) │
//! │ per-site │   │       → embed → persist  │   │ + vector files│
//! └──────────┘   └──────────────────────────┘   └───────┬───────┘
//!                                                       │
//!                                  ┌────────────────────┤
//!                                  ▼                    ▼
//!                            ┌──────────┐        ┌────────────┐
//!                            │   HTTP   │        │  JSON-RPC  │
//!                            │  worker  │        │   (stdio)  │
//!                            └──────────┘        └────────────┘
//! ```
//!
//! ## Data flow
//!
//! 1. An index request creates a **docset** (one site bounded by host +
//!    allowed path prefixes) and its seed page.
//! 2. The crawl runner claims pending pages, fetches them with
//!    conditional HTTP (ETag / Last-Modified, disk cache fallback), and
//!    discovers in-bounds links into the [`frontier`].
//! 3. The [`extract`] step reduces HTML or Markdown to plain text with
//!    headings; the [`chunk`] splitter cuts it into size-bounded,
//!    heading-aware chunks.
//! 4. Chunks are mirrored into SQLite FTS5 for keyword search and
//!    embedded ([`embedding`]) into a per-docset vector namespace
//!    ([`vector`]).
//! 5. Queries ([`search`]) fuse cosine and BM25-derived scores, then a
//!    diversity filter and a character-budget filter shape the result
//!    list into formatted snippets.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | `config.json` parsing, merging, validation |
//! | [`error`] | Typed error kinds: fetch, provider, vector store |
//! | [`models`] | Docsets, pages, chunks, status enums |
//! | [`db`] / [`migrate`] | SQLite pool and schema migrations |
//! | [`metadata`] | Relational store + FTS keyword search |
//! | [`cache`] | Disk cache of fetched bodies keyed by URL hash |
//! | [`vector`] | Per-docset vector files with exact cosine search |
//! | [`fetch`] | Conditional HTTP fetcher + retry policy |
//! | [`extract`] | HTML/Markdown → title, text, headings, links |
//! | [`chunk`] | Size-and-heading-aware splitter |
//! | [`embedding`] | Provider capability: local, openai, voyage, cohere |
//! | [`frontier`] | Per-docset crawl queue with host/prefix confinement |
//! | [`ingest`] | Orchestrator: pipeline, worker pool, recovery, refresh |
//! | [`search`] | Hybrid fusion, diversity/budget shaping, snippets |
//! | [`server`] | HTTP worker API (Axum) with CORS |
//! | [`rpc`] | JSON-RPC tool surface over stdio |

pub mod cache;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod frontier;
pub mod ingest;
pub mod metadata;
pub mod migrate;
pub mod models;
pub mod rpc;
pub mod search;
pub mod server;
pub mod vector;
