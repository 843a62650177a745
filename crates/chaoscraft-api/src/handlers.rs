//! ---
//! cc_section: "05-networking-external-interfaces"
//! cc_subsection: "module"
//! cc_type: "source"
//! cc_scope: "code"
//! cc_description: "Experiment, health and metrics request handlers."
//! cc_version: "v0.1.0"
//! cc_owner: "tbd"
//! ---
use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chaoscraft_core::{LifecycleEngine, LifecycleError};
use chaoscraft_store::{Experiment, ExperimentSpec, ExperimentState, ListFilter};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::ApiError;
use crate::ApiState;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const REPLAYED_HEADER: &str = "idempotent-replayed";

/// Largest page a single list request may ask for.
pub const MAX_LIST_LIMIT: usize = 1000;

#[derive(Debug, Deserialize)]
pub(crate) struct ListQuery {
    state: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ListResponse {
    experiments: Vec<Experiment>,
    /// Records matching the state filter; `limit` only bounds `experiments`.
    total: usize,
}

#[derive(Debug, Serialize)]
pub(crate) struct DeleteResponse {
    id: Uuid,
    message: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct HealthResponse {
    status: &'static str,
    service: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct ReadyResponse {
    status: &'static str,
    store: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct VersionResponse {
    service: String,
    version: String,
    profile: String,
    store_backend: &'static str,
    executor: &'static str,
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::not_found(format!("experiment {} not found", raw)))
}

pub(crate) async fn list_experiments(
    State(state): State<Arc<ApiState>>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<ListResponse>, ApiError> {
    let Query(query) = query?;
    let mut problems = Vec::new();
    let state_filter = match query.state.as_deref() {
        None | Some("") => None,
        Some(raw) => match raw.parse::<ExperimentState>() {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                problems.push(err);
                None
            }
        },
    };
    if let Some(limit) = query.limit {
        if limit == 0 || limit > MAX_LIST_LIMIT {
            problems.push(format!("limit must be between 1 and {}", MAX_LIST_LIMIT));
        }
    }
    if !problems.is_empty() {
        return Err(ApiError::validation(problems));
    }

    let experiments = state
        .engine
        .list(ListFilter {
            state: state_filter,
            limit: query.limit,
        })
        .await?;
    let total = state.engine.count(state_filter).await?;
    Ok(Json(ListResponse { experiments, total }))
}

pub(crate) async fn create_experiment(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    payload: Result<Json<ExperimentSpec>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(spec) = payload?;
    let idempotency_key = match headers.get(IDEMPOTENCY_KEY_HEADER) {
        None => None,
        Some(value) => Some(
            value
                .to_str()
                .map_err(|_| {
                    ApiError::validation(vec![
                        "idempotency key must be visible ASCII".to_owned()
                    ])
                })?
                .to_owned(),
        ),
    };

    let outcome = state.engine.create(spec, idempotency_key).await?;
    let id = outcome.experiment.id;
    let location = HeaderValue::from_str(&format!("/api/v1/experiments/{}", id))
        .map_err(|err| ApiError::internal(err.to_string()))?;
    if outcome.replayed {
        Ok((
            StatusCode::OK,
            [
                (HeaderName::from_static(REPLAYED_HEADER), HeaderValue::from_static("true")),
                (header::LOCATION, location),
            ],
            Json(outcome.experiment),
        )
            .into_response())
    } else {
        Ok((
            StatusCode::CREATED,
            [(header::LOCATION, location)],
            Json(outcome.experiment),
        )
            .into_response())
    }
}

pub(crate) async fn get_experiment(
    State(state): State<Arc<ApiState>>,
    Path(raw_id): Path<String>,
) -> Result<Json<Experiment>, ApiError> {
    let id = parse_id(&raw_id)?;
    Ok(Json(state.engine.get(id).await?))
}

pub(crate) async fn delete_experiment(
    State(state): State<Arc<ApiState>>,
    Path(raw_id): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let id = parse_id(&raw_id)?;
    state.engine.delete(id).await?;
    Ok(Json(DeleteResponse {
        id,
        message: format!("experiment {} deleted", id),
    }))
}

#[derive(Debug, Clone, Copy)]
enum Command {
    Start,
    Stop,
}

/// Run the transition on its own task: once the claim is written the
/// transition must settle even if the client disconnects.
async fn run_detached(
    engine: Arc<LifecycleEngine>,
    command: Command,
    id: Uuid,
) -> Result<Experiment, ApiError> {
    let task = tokio::spawn(async move {
        match command {
            Command::Start => engine.start(id).await,
            Command::Stop => engine.stop(id).await,
        }
    });
    match task.await {
        Ok(result) => result.map_err(ApiError::from),
        Err(err) => {
            warn!(experiment_id = %id, error = %err, "transition task aborted");
            Err(ApiError::internal(format!("transition task aborted: {}", err)))
        }
    }
}

pub(crate) async fn start_experiment(
    State(state): State<Arc<ApiState>>,
    Path(raw_id): Path<String>,
) -> Result<Json<Experiment>, ApiError> {
    let id = parse_id(&raw_id)?;
    run_detached(state.engine.clone(), Command::Start, id)
        .await
        .map(Json)
}

pub(crate) async fn stop_experiment(
    State(state): State<Arc<ApiState>>,
    Path(raw_id): Path<String>,
) -> Result<Json<Experiment>, ApiError> {
    let id = parse_id(&raw_id)?;
    run_detached(state.engine.clone(), Command::Stop, id)
        .await
        .map(Json)
}

pub(crate) async fn get_version(State(state): State<Arc<ApiState>>) -> Json<VersionResponse> {
    Json(VersionResponse {
        service: state.version.service.clone(),
        version: state.version.semver.clone(),
        profile: state.version.profile.clone(),
        store_backend: state.engine.store_backend(),
        executor: state.engine.executor_name(),
    })
}

pub(crate) async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: state.version.service.clone(),
    })
}

pub(crate) async fn ready(State(state): State<Arc<ApiState>>) -> Response {
    let store = state.engine.store_backend();
    match state.engine.ping().await {
        Ok(()) => Json(ReadyResponse {
            status: "ready",
            store,
            error: None,
        })
        .into_response(),
        Err(err) => {
            warn!(error = %err, "readiness probe failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ReadyResponse {
                    status: "unavailable",
                    store,
                    error: Some(describe(&err)),
                }),
            )
                .into_response()
        }
    }
}

fn describe(err: &LifecycleError) -> String {
    format!("{}: {}", err.kind(), err)
}

pub(crate) async fn metrics(State(state): State<Arc<ApiState>>) -> Response {
    let Some(registry) = &state.registry else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics registry unavailable",
        )
            .into_response();
    };

    match chaoscraft_metrics::encode(registry) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, chaoscraft_metrics::content_type())],
            body,
        )
            .into_response(),
        Err(err) => {
            warn!(error = %err, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
