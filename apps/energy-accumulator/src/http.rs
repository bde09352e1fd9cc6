use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::observation::SourceState;
use crate::service::{
    AccumulatorService, AccumulatorSummary, Diagnosis, ResetEntry, ResetRequest, ServiceError,
};
use crate::sources::StateRegistry;

#[derive(Clone)]
pub struct HttpState {
    pub registry: StateRegistry,
    pub service: AccumulatorService,
}

#[derive(Debug, Deserialize)]
struct IncomingState {
    entity_id: String,
    state: String,
    #[serde(default)]
    unit_of_measurement: Option<String>,
    #[serde(default)]
    device_class: Option<String>,
    #[serde(default)]
    last_updated: Option<DateTime<Utc>>,
}

impl IncomingState {
    fn into_source_state(self, received_at: DateTime<Utc>) -> SourceState {
        SourceState {
            source_id: self.entity_id.trim().to_string(),
            state: self.state,
            unit: self.unit_of_measurement,
            device_class: self.device_class,
            updated_at: self.last_updated.unwrap_or(received_at),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatesRequest {
    states: Vec<IncomingState>,
}

#[derive(Debug, Serialize)]
struct StatesResponse {
    accepted: u64,
    dropped: u64,
}

#[derive(Debug, Serialize)]
struct ListResponse {
    accumulators: Vec<AccumulatorSummary>,
}

#[derive(Debug, Serialize)]
struct ResetResponse {
    reset: Vec<ResetEntry>,
}

#[derive(Debug, Serialize)]
struct NotFoundBody {
    error: String,
    available: Vec<String>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        match self {
            ServiceError::NotFound { ref available, .. } => {
                let body = NotFoundBody {
                    error: self.to_string(),
                    available: available.clone(),
                };
                (StatusCode::NOT_FOUND, Json(body)).into_response()
            }
            ServiceError::InvalidResetFactor(_) => {
                (StatusCode::BAD_REQUEST, self.to_string()).into_response()
            }
        }
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn post_states(
    State(state): State<HttpState>,
    Json(payload): Json<StatesRequest>,
) -> Result<Json<StatesResponse>, (StatusCode, String)> {
    if payload.states.iter().any(|s| s.entity_id.trim().is_empty()) {
        return Err((StatusCode::BAD_REQUEST, "entity_id must not be empty".to_string()));
    }
    let received_at = Utc::now();
    let mut accepted = 0u64;
    let mut dropped = 0u64;
    for incoming in payload.states {
        if state
            .registry
            .publish(incoming.into_source_state(received_at))
            .await
        {
            accepted += 1;
        } else {
            dropped += 1;
        }
    }
    Ok(Json(StatesResponse { accepted, dropped }))
}

async fn list_accumulators(State(state): State<HttpState>) -> Json<ListResponse> {
    Json(ListResponse {
        accumulators: state.service.list().await,
    })
}

async fn diagnose_accumulator(
    State(state): State<HttpState>,
    Path(name): Path<String>,
) -> Result<Json<Diagnosis>, ServiceError> {
    Ok(Json(state.service.diagnose(&name).await?))
}

async fn reset_accumulators(
    State(state): State<HttpState>,
    body: Option<Json<ResetRequest>>,
) -> Result<Json<ResetResponse>, ServiceError> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let reset = state.service.reset(&request).await?;
    Ok(Json(ResetResponse { reset }))
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/states", post(post_states))
        .route("/v1/accumulators", get(list_accumulators))
        .route("/v1/accumulators/reset", post(reset_accumulators))
        .route("/v1/accumulators/{name}", get(diagnose_accumulator))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
