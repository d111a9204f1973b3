use crate::{
    context::{ContextError, ContextRecord},
    embedding::EmbeddingError,
    engine::{Engine, EngineError},
    exhibit::Exhibit,
    fetch::FetchError,
    index::SearchFilters,
    resolver::ResolveError,
};
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::signal;

const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

#[derive(Clone)]
struct SharedState {
    engine: Arc<Engine>,
}

async fn start_app(engine: Arc<Engine>) {
    let bind_addr = engine.config().server.bind_addr.clone();
    let shared_state = Arc::new(SharedState {
        engine: engine.clone(),
    });

    async fn shutdown_signal(engine: Arc<Engine>) {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        log::warn!("shutting down, flushing vector index");
        if let Err(err) = engine.save_index() {
            log::error!("failed to flush vector index on shutdown: {err}");
        }
    }

    let signal = shutdown_signal(engine);

    let app = Router::new()
        .route("/api/archive/scrape", post(archive_scrape))
        .route("/api/archive/list", get(archive_list))
        .route("/api/archive/:id", get(archive_get))
        .route("/api/archive/:id", delete(archive_delete))
        .route("/api/search", post(search))
        .route("/api/search/embed", post(search_embed))
        .route("/api/context/generate", post(context_generate))
        .route("/api/context/:exhibit_id", get(context_get))
        .route("/api/health", get(health))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(shared_state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await.unwrap();
    log::info!("listening on {bind_addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(signal)
        .await
        .unwrap();
}

pub fn start_daemon(engine: Arc<Engine>) {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(async { start_app(engine).await });
}

#[derive(Debug)]
enum HttpError {
    Engine(EngineError),
    Unauthorized,
}

impl From<EngineError> for HttpError {
    fn from(err: EngineError) -> Self {
        HttpError::Engine(err)
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let err = match self {
            HttpError::Unauthorized => {
                return (
                    StatusCode::UNAUTHORIZED,
                    json!({"error": "missing or invalid admin token"}).to_string(),
                )
                    .into_response();
            }
            HttpError::Engine(err) => err,
        };

        let status = match &err {
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Resolve(ResolveError::NoSnapshotFound) => StatusCode::NOT_FOUND,
            EngineError::Resolve(ResolveError::UpstreamUnavailable(_)) => StatusCode::BAD_GATEWAY,
            EngineError::Fetch(FetchError::UnsupportedContent(_)) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            EngineError::Fetch(FetchError::Upstream(_)) => StatusCode::BAD_GATEWAY,
            EngineError::Embedding(EmbeddingError::Unavailable(_)) => StatusCode::BAD_GATEWAY,
            EngineError::Embedding(EmbeddingError::DimensionMismatch { .. }) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            EngineError::Context(ContextError::GenerationFailed(_)) => StatusCode::BAD_GATEWAY,
            EngineError::Context(ContextError::NotFound(_)) => StatusCode::NOT_FOUND,
            EngineError::Context(_) | EngineError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        if status.is_server_error() {
            log::error!("{err}");
        }

        (status, json!({"error": err.to_string()}).to_string()).into_response()
    }
}

fn require_admin(state: &SharedState, headers: &HeaderMap) -> Result<(), HttpError> {
    let expected = state
        .engine
        .config()
        .server
        .admin_token
        .as_deref()
        .ok_or(HttpError::Unauthorized)?;
    let provided = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(HttpError::Unauthorized)?;
    if provided != expected {
        return Err(HttpError::Unauthorized);
    }
    Ok(())
}

/// Exhibit as exposed over the API; the stored embedding stays internal.
#[derive(Debug, Serialize)]
pub struct ExhibitView {
    pub id: String,
    pub original_url: String,
    pub archive_snapshot_url: String,
    pub domain: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    pub tags: Vec<String>,
    pub snapshot_timestamp: String,
    pub archived_at: DateTime<Utc>,
    pub content_hash: String,
}

impl From<Exhibit> for ExhibitView {
    fn from(e: Exhibit) -> Self {
        Self {
            id: e.id,
            original_url: e.original_url,
            archive_snapshot_url: e.archive_snapshot_url,
            domain: e.domain,
            title: e.title,
            description: e.description,
            thumbnail_url: e.thumbnail_url,
            tags: e.tags,
            snapshot_timestamp: e.snapshot_timestamp,
            archived_at: e.archived_at,
            content_hash: e.content_hash,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ScrapeRequest {
    pub url: String,
    /// Inclusive range bounds, YYYYMMDD.
    pub from_date: Option<String>,
    pub to_date: Option<String>,
}

#[derive(Serialize)]
pub struct ScrapeResponse {
    pub exhibit: ExhibitView,
    pub created: bool,
}

async fn archive_scrape(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<ScrapeRequest>,
) -> Result<axum::Json<ScrapeResponse>, HttpError> {
    log::debug!("payload: {payload:?}");

    let outcome = state
        .engine
        .archive(
            &payload.url,
            payload.from_date.as_deref(),
            payload.to_date.as_deref(),
        )
        .await?;

    Ok(ScrapeResponse {
        exhibit: outcome.exhibit.into(),
        created: outcome.created,
    }
    .into())
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_per_page")]
    pub per_page: usize,
    pub domain: Option<String>,
}

fn default_page() -> usize {
    1
}
fn default_per_page() -> usize {
    20
}

#[derive(Serialize)]
pub struct ListResponse {
    pub items: Vec<ExhibitView>,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
}

async fn archive_list(
    State(state): State<Arc<SharedState>>,
    Query(query): Query<ListQuery>,
) -> Result<axum::Json<ListResponse>, HttpError> {
    // echo the page size actually used, not the raw request
    let per_page = query
        .per_page
        .clamp(1, state.engine.config().search.max_results);
    let (items, total) = state.engine.list(query.page, per_page, query.domain.as_deref());

    Ok(ListResponse {
        items: items.into_iter().map(Into::into).collect(),
        total,
        page: query.page.max(1),
        per_page,
    }
    .into())
}

async fn archive_get(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<String>,
) -> Result<axum::Json<ExhibitView>, HttpError> {
    Ok(ExhibitView::from(state.engine.get(&id)?).into())
}

async fn archive_delete(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<axum::Json<serde_json::Value>, HttpError> {
    require_admin(&state, &headers)?;
    state.engine.delete(&id)?;
    Ok(json!({"deleted": id}).into())
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default = "default_search_limit")]
    pub limit: usize,
    pub domain: Option<String>,
    pub year_from: Option<u16>,
    pub year_to: Option<u16>,
}

fn default_search_limit() -> usize {
    10
}

#[derive(Serialize)]
pub struct SearchResultItem {
    pub exhibit: ExhibitView,
    pub score: f32,
}

#[derive(Serialize)]
pub struct SearchResults {
    pub results: Vec<SearchResultItem>,
    pub took_ms: u64,
}

async fn search(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<SearchRequest>,
) -> Result<axum::Json<SearchResults>, HttpError> {
    log::debug!("payload: {payload:?}");

    let filters = SearchFilters {
        domain: payload.domain,
        year_from: payload.year_from,
        year_to: payload.year_to,
    };
    let response = state
        .engine
        .search(&payload.query, payload.limit, &filters)
        .await?;

    Ok(SearchResults {
        results: response
            .results
            .into_iter()
            .map(|hit| SearchResultItem {
                exhibit: hit.exhibit.into(),
                score: hit.score,
            })
            .collect(),
        took_ms: response.took_ms,
    }
    .into())
}

#[derive(Debug, Deserialize)]
pub struct EmbedRequest {
    pub text: String,
}

#[derive(Serialize)]
pub struct EmbedResponse {
    pub embedding: Vec<f32>,
    pub dimensions: usize,
    pub model: String,
}

async fn search_embed(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<EmbedRequest>,
) -> Result<axum::Json<EmbedResponse>, HttpError> {
    let embedding = state.engine.embed_text(&payload.text).await?;

    Ok(EmbedResponse {
        dimensions: embedding.len(),
        embedding,
        model: state.engine.config().embedding.model.clone(),
    }
    .into())
}

#[derive(Debug, Deserialize)]
pub struct ContextGenerateRequest {
    pub exhibit_id: String,
}

#[derive(Serialize)]
pub struct ContextResponse {
    pub context: ContextRecord,
    pub cached: bool,
}

async fn context_generate(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<ContextGenerateRequest>,
) -> Result<axum::Json<ContextResponse>, HttpError> {
    log::debug!("payload: {payload:?}");

    let (context, cached) = state.engine.generate_context(&payload.exhibit_id).await?;
    Ok(ContextResponse { context, cached }.into())
}

async fn context_get(
    State(state): State<Arc<SharedState>>,
    Path(exhibit_id): Path<String>,
) -> Result<axum::Json<ContextRecord>, HttpError> {
    Ok(state.engine.cached_context(&exhibit_id)?.into())
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub exhibits: usize,
    pub indexed: usize,
    pub embedding_model: String,
}

async fn health(State(state): State<Arc<SharedState>>) -> axum::Json<HealthResponse> {
    HealthResponse {
        status: "ok",
        exhibits: state.engine.exhibit_count(),
        indexed: state.engine.indexed_count(),
        embedding_model: state.engine.config().embedding.model.clone(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::support::harness;

    #[tokio::test]
    async fn test_list_reports_effective_per_page() {
        let h = harness();
        let state = Arc::new(SharedState {
            engine: h.engine.clone(),
        });

        h.engine
            .archive("http://geocities.example/dino", None, None)
            .await
            .unwrap();

        let response = archive_list(
            State(state),
            Query(ListQuery {
                page: 1,
                per_page: 500,
                domain: None,
            }),
        )
        .await
        .unwrap();

        let max = h.engine.config().search.max_results;
        assert_eq!(response.0.per_page, max);
        assert_eq!(response.0.total, 1);
    }
}
