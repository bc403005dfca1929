//! Axum JSON API over the validation pipeline.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use pricewatch_adapters::load_record_store;
use pricewatch_core::FairnessVerdict;
use pricewatch_pipeline::{PipelineConfig, ValidationPipeline};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "pricewatch-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<ValidationPipeline>,
}

impl AppState {
    pub fn new(pipeline: ValidationPipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct FairnessQuery {
    verdict: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct TrendQuery {
    vendor: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/stages/a1", get(stage_a1_handler))
        .route("/api/stages/a2", get(stage_a2_handler))
        .route("/api/stages/b1", get(stage_b1_handler))
        .route("/api/stages/b2", get(stage_b2_handler))
        .route("/api/fairness", get(fairness_handler))
        .route("/api/trend", get(trend_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("PRICEWATCH_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = PipelineConfig::load()?;
    let store = load_record_store(&config.dataset_path)?;
    let state = AppState::new(ValidationPipeline::new(store, config));
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "pricewatch api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "status": "ok",
        "counts": state.pipeline.store().counts(),
    }))
    .into_response()
}

async fn stage_a1_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.pipeline.stage_a1()).into_response()
}

async fn stage_a2_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.pipeline.stage_a2()).into_response()
}

async fn stage_b1_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.pipeline.stage_b1()).into_response()
}

async fn stage_b2_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.pipeline.stage_b2()).into_response()
}

async fn fairness_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FairnessQuery>,
) -> Response {
    let wanted = match query.verdict.as_deref().map(parse_verdict) {
        None => None,
        Some(Some(verdict)) => Some(verdict),
        Some(None) => {
            return bad_request(format!(
                "unknown verdict {:?}; expected excellent, acceptable, unacceptable or indeterminate",
                query.verdict.unwrap_or_default()
            ))
        }
    };

    let mut report = state.pipeline.fairness();
    if let Some(verdict) = wanted {
        report.results.retain(|r| r.verdict == verdict);
    }
    Json(report).into_response()
}

async fn trend_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TrendQuery>,
) -> Response {
    let mut report = state.pipeline.trend();
    if let Some(vendor) = query.vendor.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
        report.points.retain(|p| p.vendor_name == vendor);
        report.comparisons.retain(|c| c.vendor_name == vendor);
    }
    Json(report).into_response()
}

fn parse_verdict(text: &str) -> Option<FairnessVerdict> {
    [
        FairnessVerdict::Excellent,
        FairnessVerdict::Acceptable,
        FairnessVerdict::Unacceptable,
        FairnessVerdict::Indeterminate,
    ]
    .into_iter()
    .find(|v| v.as_str().eq_ignore_ascii_case(text.trim()))
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}
