//! HTTP API Server for Recommendations
//!
//! Thin axum adapter over [`RecommendationEngine`]. Handlers parse query
//! parameters, run the engine on the blocking pool and serialize the result.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::catalog::{CityRecord, PlaceRecord};
use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::feedback::{AbSummary, FeedbackEvent};
use crate::recommendation::engine::{
    EngineStatus, FeedbackInput, MediaFeed, RecommendationEngine, RecommendationRequest,
    RecommendationResponse, Strategy, TrainReport, UserInterests, UserRatings,
};

/// Shared application state
pub struct AppState {
    pub engine: Arc<RecommendationEngine>,
}

/// Query params for recommendation endpoints
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationQuery {
    pub strategy: Option<String>,
    /// Kept as text so a malformed value falls back to the default
    pub limit: Option<String>,
    pub user_id: Option<String>,
    pub city_id: Option<String>,
    pub ip: Option<String>,
    pub version: Option<String>,
    pub media_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaQuery {
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SummaryQuery {
    pub days: Option<String>,
}

/// Health check response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub models_ready: bool,
}

/// Build the router; also used directly by the HTTP tests
pub fn router(state: Arc<AppState>, config: &ApiConfig) -> Router {
    let app = Router::new()
        // Health check
        .route("/health", get(health_check))
        // Catalog
        .route("/api/cities", get(list_cities))
        .route("/api/places/city/:city_id", get(list_city_places))
        .route("/api/media", get(media_feed))
        .route("/api/users/:user_id/interests", get(user_interests))
        .route("/api/users/:user_id/ratings", get(user_ratings))
        // Recommendations
        .route("/api/recommendations", get(recommend_by_query))
        .route("/api/recommendations/feedback", post(record_feedback))
        .route("/api/recommendations/ab/summary", get(ab_summary))
        .route("/api/recommendations/:strategy", get(recommend_by_path))
        // Model admin
        .route("/api/train", post(train_models))
        .route("/api/ml/status", get(ml_status))
        .layer(TimeoutLayer::new(config.request_timeout))
        .layer(TraceLayer::new_for_http());

    let app = if config.cors_enabled {
        app.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    } else {
        app
    };

    app.with_state(state)
}

/// Start the API server and serve until `shutdown` resolves
pub async fn start_server(
    state: Arc<AppState>,
    config: ApiConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = router(state, &config);

    let addr = format!("{}:{}", config.host, config.port);
    info!("🚀 Starting recommendation API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

/// Run a synchronous engine call on the blocking pool
async fn blocking<T, F>(state: &AppState, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&RecommendationEngine) -> Result<T> + Send + 'static,
{
    let engine = state.engine.clone();
    tokio::task::spawn_blocking(move || f(&engine))
        .await
        .map_err(Error::internal)?
}

/// `limit` as sent by the client: unparsable means "use the default"
fn parse_limit(raw: Option<&str>) -> Option<usize> {
    raw.and_then(|value| value.trim().parse::<i64>().ok())
        .map(|value| value.max(0) as usize)
}

/// Client address from the query, else the proxy headers
fn client_ip(query_ip: Option<String>, headers: &HeaderMap) -> Option<String> {
    query_ip.filter(|ip| !ip.trim().is_empty()).or_else(|| {
        headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .or_else(|| {
                headers
                    .get("x-real-ip")
                    .and_then(|value| value.to_str().ok())
            })
            .map(|ip| ip.trim().to_string())
            .filter(|ip| !ip.is_empty())
    })
}

fn to_request(
    strategy: Strategy,
    query: RecommendationQuery,
    headers: &HeaderMap,
) -> RecommendationRequest {
    RecommendationRequest {
        strategy: Some(strategy),
        limit: parse_limit(query.limit.as_deref()),
        user_id: query.user_id,
        city_id: query.city_id,
        client_ip: client_ip(query.ip, headers),
        version: query.version,
        media_id: query.media_id,
    }
}

fn parse_strategy(raw: &str) -> Result<Strategy> {
    Strategy::parse(raw).ok_or_else(|| Error::bad_request(format!("unknown strategy '{raw}'")))
}

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        models_ready: state.engine.models_ready(),
    })
}

async fn list_cities(State(state): State<Arc<AppState>>) -> Result<Json<Vec<CityRecord>>> {
    let cities = blocking(&state, |engine| engine.provider().list_cities()).await?;
    Ok(Json(cities))
}

async fn list_city_places(
    State(state): State<Arc<AppState>>,
    Path(city_id): Path<String>,
) -> Result<Json<Vec<PlaceRecord>>> {
    let places = blocking(&state, move |engine| {
        let provider = engine.provider();
        if !provider.list_cities()?.iter().any(|city| city.city_id == city_id) {
            return Err(Error::not_found("city", city_id));
        }
        provider.list_places(Some(&city_id))
    })
    .await?;
    Ok(Json(places))
}

async fn media_feed(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MediaQuery>,
) -> Result<Json<MediaFeed>> {
    let feed = blocking(&state, move |engine| engine.media_feed(query.user_id.as_deref())).await?;
    Ok(Json(feed))
}

async fn user_interests(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<UserInterests>> {
    let interests = blocking(&state, move |engine| engine.user_interests(&user_id)).await?;
    Ok(Json(interests))
}

async fn user_ratings(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<UserRatings>> {
    let ratings = blocking(&state, move |engine| engine.user_ratings(&user_id)).await?;
    Ok(Json(ratings))
}

/// `GET /api/recommendations/:strategy`
async fn recommend_by_path(
    State(state): State<Arc<AppState>>,
    Path(strategy): Path<String>,
    headers: HeaderMap,
    Query(query): Query<RecommendationQuery>,
) -> Result<Json<RecommendationResponse>> {
    let request = to_request(parse_strategy(&strategy)?, query, &headers);
    let response = blocking(&state, move |engine| engine.recommend(&request)).await?;
    Ok(Json(response))
}

/// `GET /api/recommendations?strategy=...`
async fn recommend_by_query(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<RecommendationQuery>,
) -> Result<Json<RecommendationResponse>> {
    let strategy = match query.strategy.as_deref() {
        Some(raw) => parse_strategy(raw)?,
        None => return Err(Error::bad_request("strategy is required")),
    };
    let request = to_request(strategy, query, &headers);
    let response = blocking(&state, move |engine| engine.recommend(&request)).await?;
    Ok(Json(response))
}

async fn record_feedback(
    State(state): State<Arc<AppState>>,
    Json(input): Json<FeedbackInput>,
) -> Result<(StatusCode, Json<FeedbackEvent>)> {
    let event = blocking(&state, move |engine| engine.record_feedback(input)).await?;
    Ok((StatusCode::CREATED, Json(event)))
}

async fn ab_summary(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SummaryQuery>,
) -> Result<Json<AbSummary>> {
    let days = query.days.as_deref().and_then(|d| d.trim().parse::<i64>().ok());
    let summary = blocking(&state, move |engine| engine.ab_summary(days)).await?;
    Ok(Json(summary))
}

async fn train_models(State(state): State<Arc<AppState>>) -> Result<Json<TrainReport>> {
    let report = blocking(&state, |engine| engine.train()).await?;
    Ok(Json(report))
}

async fn ml_status(State(state): State<Arc<AppState>>) -> Result<Json<EngineStatus>> {
    let status = blocking(&state, |engine| engine.status()).await?;
    Ok(Json(status))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_limit() {
        assert_eq!(parse_limit(Some("7")), Some(7));
        assert_eq!(parse_limit(Some("-3")), Some(0));
        assert_eq!(parse_limit(Some("lots")), None);
        assert_eq!(parse_limit(None), None);
    }

    #[test]
    fn test_client_ip_prefers_query_then_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "5.160.1.1, 10.0.0.1".parse().unwrap());
        assert_eq!(
            client_ip(Some("2.176.0.1".into()), &headers).as_deref(),
            Some("2.176.0.1")
        );
        assert_eq!(client_ip(None, &headers).as_deref(), Some("5.160.1.1"));
        assert_eq!(client_ip(None, &HeaderMap::new()), None);
    }
}
