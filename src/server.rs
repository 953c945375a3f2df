//! HTTP worker API.
//!
//! Loopback JSON API for code-assistant clients (default port 7432).
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Liveness: status, timestamp, version |
//! | `POST` | `/index` | Create/resume indexing of a docset |
//! | `POST` | `/retrieve` | Hybrid search with shaping |
//! | `GET`  | `/status` | All docsets with index status (`?includeStuck=`) |
//! | `GET`  | `/docset/{id}` | One docset |
//! | `DELETE` | `/docset/{id}` | Delete a docset and its vectors |
//! | `GET`  | `/docset/{id}/pages` | Pages (`?status=&limit=&offset=`) |
//! | `POST` | `/refresh` | Queue one docset for re-crawl |
//! | `POST` | `/refresh-all` | Queue every stale docset |
//!
//! Errors serialise as `{"error": "<message>"}` with 400 for validation,
//! 404 for unknown ids, and 500 otherwise. CORS allows any origin;
//! preflight `OPTIONS` is handled by the CORS layer.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::ingest::{IndexRequest, Oracle, RefreshOptions};
use crate::models::{now_ts, Docset, IndexStatus, Page, PageStatus};
use crate::search::SearchRequest;

/// Bind and serve until the process terminates.
pub async fn run_server(oracle: Arc<Oracle>) -> anyhow::Result<()> {
    let addr = format!(
        "{}:{}",
        oracle.config().worker.host,
        oracle.config().worker.port
    );
    let app = router(oracle);

    println!("worker listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(oracle: Arc<Oracle>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/index", post(handle_index))
        .route("/retrieve", post(handle_retrieve))
        .route("/status", get(handle_status))
        .route("/docset/{id}", get(handle_get_docset).delete(handle_delete_docset))
        .route("/docset/{id}/pages", get(handle_list_pages))
        .route("/refresh", post(handle_refresh))
        .route("/refresh-all", post(handle_refresh_all))
        .layer(cors)
        .with_state(oracle)
}

// ============ Error plumbing ============

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

struct AppError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        message: message.into(),
    }
}

fn internal_error(error: anyhow::Error) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        message: format!("{:#}", error),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    timestamp: i64,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: now_ts(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /index ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexBody {
    base_url: String,
    seed_slug: String,
    name: Option<String>,
    allowed_paths: Option<Vec<String>>,
    #[serde(default)]
    wait_for_seed: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IndexResponse {
    docset_id: String,
    status: String,
    seed_indexed: bool,
}

async fn handle_index(
    State(oracle): State<Arc<Oracle>>,
    Json(body): Json<IndexBody>,
) -> Result<Json<IndexResponse>, AppError> {
    if body.base_url.trim().is_empty() {
        return Err(bad_request("baseUrl must not be empty"));
    }
    if url::Url::parse(&body.base_url).is_err() {
        return Err(bad_request(format!("baseUrl is not a valid URL: {}", body.base_url)));
    }
    if body.seed_slug.trim().is_empty() {
        return Err(bad_request("seedSlug must not be empty"));
    }

    let (docset, seed_indexed) = oracle
        .index_docset(
            IndexRequest {
                base_url: body.base_url,
                seed_path: body.seed_slug,
                name: body.name,
                allowed_paths: body.allowed_paths,
            },
            body.wait_for_seed,
        )
        .await
        .map_err(internal_error)?;

    Ok(Json(IndexResponse {
        docset_id: docset.id,
        status: docset.status.as_str().to_string(),
        seed_indexed,
    }))
}

// ============ POST /retrieve ============

async fn handle_retrieve(
    State(oracle): State<Arc<Oracle>>,
    Json(request): Json<SearchRequest>,
) -> Result<Response, AppError> {
    if request.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let response = oracle.search(request).await.map_err(internal_error)?;
    Ok(Json(response).into_response())
}

// ============ GET /status ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusParams {
    docset_id: Option<String>,
    #[serde(default)]
    include_stuck: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DocsetStatusEntry {
    #[serde(flatten)]
    docset: Docset,
    index_status: IndexStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    stuck_pages: Option<Vec<Page>>,
}

#[derive(Serialize)]
struct StatusResponse {
    docsets: Vec<DocsetStatusEntry>,
}

async fn handle_status(
    State(oracle): State<Arc<Oracle>>,
    Query(params): Query<StatusParams>,
) -> Result<Json<StatusResponse>, AppError> {
    let docsets = match &params.docset_id {
        Some(id) => match oracle.store().get_docset(id).await.map_err(internal_error)? {
            Some(docset) => vec![docset],
            None => return Err(not_found(format!("docset not found: {}", id))),
        },
        None => oracle.store().list_docsets().await.map_err(internal_error)?,
    };

    let mut entries = Vec::with_capacity(docsets.len());
    for docset in docsets {
        let index_status = oracle
            .store()
            .get_index_status(&docset.id)
            .await
            .map_err(internal_error)?;
        let stuck_pages = if params.include_stuck {
            Some(
                oracle
                    .store()
                    .stuck_pages(&docset.id, crate::ingest::DEFAULT_STUCK_THRESHOLD_MS as i64 / 1000)
                    .await
                    .map_err(internal_error)?,
            )
        } else {
            None
        };
        entries.push(DocsetStatusEntry {
            docset,
            index_status,
            stuck_pages,
        });
    }

    Ok(Json(StatusResponse { docsets: entries }))
}

// ============ /docset/{id} ============

async fn handle_get_docset(
    State(oracle): State<Arc<Oracle>>,
    Path(id): Path<String>,
) -> Result<Json<DocsetStatusEntry>, AppError> {
    let Some(docset) = oracle.store().get_docset(&id).await.map_err(internal_error)? else {
        return Err(not_found(format!("docset not found: {}", id)));
    };
    let index_status = oracle
        .store()
        .get_index_status(&docset.id)
        .await
        .map_err(internal_error)?;
    Ok(Json(DocsetStatusEntry {
        docset,
        index_status,
        stuck_pages: None,
    }))
}

#[derive(Serialize)]
struct DeleteResponse {
    deleted: bool,
}

async fn handle_delete_docset(
    State(oracle): State<Arc<Oracle>>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    let deleted = oracle.delete_docset(&id).await.map_err(internal_error)?;
    if !deleted {
        return Err(not_found(format!("docset not found: {}", id)));
    }
    Ok(Json(DeleteResponse { deleted }))
}

// ============ GET /docset/{id}/pages ============

#[derive(Deserialize)]
struct PagesParams {
    status: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(Serialize)]
struct PagesResponse {
    pages: Vec<Page>,
}

async fn handle_list_pages(
    State(oracle): State<Arc<Oracle>>,
    Path(id): Path<String>,
    Query(params): Query<PagesParams>,
) -> Result<Json<PagesResponse>, AppError> {
    if oracle.store().get_docset(&id).await.map_err(internal_error)?.is_none() {
        return Err(not_found(format!("docset not found: {}", id)));
    }

    let status = params.status.as_deref().map(PageStatus::parse);
    let limit = params.limit.unwrap_or(100).clamp(1, 1000);
    let offset = params.offset.unwrap_or(0).max(0);

    let pages = oracle
        .store()
        .list_pages(&id, status, limit, offset)
        .await
        .map_err(internal_error)?;
    Ok(Json(PagesResponse { pages }))
}

// ============ POST /refresh, /refresh-all ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshBody {
    docset_id: Option<String>,
    #[serde(default)]
    force: bool,
    max_age: Option<u64>,
    #[serde(default)]
    full_reindex: bool,
}

#[derive(Serialize)]
struct RefreshResponse {
    plans: Vec<crate::ingest::RefreshPlan>,
}

fn refresh_options(body: &RefreshBody) -> RefreshOptions {
    RefreshOptions {
        force: body.force,
        max_age_ms: body.max_age.unwrap_or(crate::ingest::DEFAULT_REFRESH_MAX_AGE_MS),
        full_reindex: body.full_reindex,
    }
}

async fn handle_refresh(
    State(oracle): State<Arc<Oracle>>,
    Json(body): Json<RefreshBody>,
) -> Result<Json<RefreshResponse>, AppError> {
    let Some(docset_id) = body.docset_id.clone() else {
        return Err(bad_request("docsetId is required; use /refresh-all for all docsets"));
    };

    let options = refresh_options(&body);
    match oracle.refresh_docset(&docset_id, &options).await.map_err(internal_error)? {
        Some(plan) => Ok(Json(RefreshResponse { plans: vec![plan] })),
        None => Err(not_found(format!("docset not found: {}", docset_id))),
    }
}

async fn handle_refresh_all(
    State(oracle): State<Arc<Oracle>>,
    Json(body): Json<RefreshBody>,
) -> Result<Json<RefreshResponse>, AppError> {
    let options = refresh_options(&body);
    let plans = oracle.refresh_all(&options).await.map_err(internal_error)?;
    Ok(Json(RefreshResponse { plans }))
}
