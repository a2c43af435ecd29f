use axum::{
    extract::{Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{FixedOffset, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::db::models::League;
use crate::db::Database;
use crate::ingestion::{day_bounds, today_in, Ingestor};
use crate::log_buffer::LogBuffer;

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub ingestor: Arc<Ingestor>,
    pub logs: LogBuffer,
    pub admin_secret: String,
    pub leagues: Vec<League>,
    pub utc_offset: FixedOffset,
}

/// Build the Axum router for the diagnostics API.
pub fn router(state: AppState) -> Router {
    let state = Arc::new(state);

    let protected = Router::new()
        .route("/api/games", get(games_handler))
        .route("/api/jobs", get(jobs_handler))
        .route("/api/jobs/summary", get(jobs_summary_handler))
        .route("/api/ingestion-runs", get(ingestion_runs_handler))
        .route("/api/logs", get(logs_handler))
        .route("/api/ingest", post(ingest_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/health", get(health_handler))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Reject requests without `Authorization: Bearer <ADMIN_SECRET>`.
async fn require_admin(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if !is_authorized(req.headers(), &state.admin_secret) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

fn is_authorized(headers: &HeaderMap, secret: &str) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map_or(false, |token| {
            // Constant-time over digests
            let a = Sha256::digest(token.trim().as_bytes());
            let b = Sha256::digest(secret.as_bytes());
            !secret.is_empty() && a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
        })
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<i64>,
}

fn clamp_limit(limit: Option<i64>, default: i64) -> i64 {
    limit.unwrap_or(default).clamp(1, 500)
}

#[derive(Debug, Deserialize)]
struct GamesQuery {
    date: Option<NaiveDate>,
}

fn internal(e: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e))
}

/// GET /health
async fn health_handler() -> impl IntoResponse {
    Json(json!({"status": "ok", "time": Utc::now()}))
}

/// GET /api/games?date=YYYY-MM-DD
async fn games_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<GamesQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let date = query.date.unwrap_or_else(|| today_in(state.utc_offset, Utc::now()));
    let (from, to) = day_bounds(date, state.utc_offset);
    state
        .db
        .list_games_starting_between(from, to, &[])
        .map(Json)
        .map_err(internal)
}

/// GET /api/jobs?limit=50
async fn jobs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    state
        .db
        .list_jobs(clamp_limit(query.limit, 50))
        .map(Json)
        .map_err(internal)
}

/// GET /api/jobs/summary
async fn jobs_summary_handler(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    state.db.queue_snapshot().map(Json).map_err(internal)
}

/// GET /api/ingestion-runs?limit=20
async fn ingestion_runs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    state
        .db
        .list_ingestion_runs(clamp_limit(query.limit, 20))
        .map(Json)
        .map_err(internal)
}

/// GET /api/logs?limit=100
async fn logs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    Json(state.logs.entries(clamp_limit(query.limit, 100) as usize))
}

/// POST /api/ingest: one cycle for today over the configured leagues
async fn ingest_handler(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let date = today_in(state.utc_offset, Utc::now());
    info!("Manual ingestion requested via API for {}", date);
    state
        .ingestor
        .run(&state.leagues, date, "api")
        .await
        .map(Json)
        .map_err(internal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_bearer_check() {
        assert!(is_authorized(&headers("Bearer hunter2"), "hunter2"));
        assert!(!is_authorized(&headers("Bearer hunter3"), "hunter2"));
        assert!(!is_authorized(&headers("hunter2"), "hunter2"));
        assert!(!is_authorized(&HeaderMap::new(), "hunter2"));
        assert!(!is_authorized(&headers("Bearer "), ""));
    }

    #[test]
    fn test_clamp_limit() {
        assert_eq!(clamp_limit(None, 50), 50);
        assert_eq!(clamp_limit(Some(0), 50), 1);
        assert_eq!(clamp_limit(Some(10_000), 50), 500);
    }
}
