//! Defines the Axum API routes and handlers.

use crate::fleet::{Fleet, FleetError};
use async_stream::stream;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use forge_shared::api_models::{CreateJobRequest, ErrorResponse, GcodeCommandRequest};
use forge_shared::{DeviceSnapshot, JobSnapshot};
use futures_core::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

pub type AppState = Arc<Fleet>;

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

/// Creates the Axum router with all the API endpoints.
pub fn create_router(fleet: AppState) -> Router {
    Router::new()
        .route("/api/v1/devices", get(list_devices))
        .route("/api/v1/devices/{id}", get(get_device))
        .route("/api/v1/devices/{id}/gcode", post(execute_gcode))
        .route("/api/v1/devices/{id}/{action}", post(control_device))
        .route("/api/v1/jobs", get(list_jobs).post(create_job))
        .route("/api/v1/jobs/{id}", get(get_job).delete(delete_job))
        .route("/api/v1/events", get(events))
        .with_state(fleet)
}

fn status_of(error: &FleetError) -> StatusCode {
    match error {
        FleetError::UnknownDevice(_) | FleetError::UnknownJob(_) => StatusCode::NOT_FOUND,
        FleetError::Control(e) if e.is_precondition() => StatusCode::CONFLICT,
        FleetError::Control(_) => StatusCode::SERVICE_UNAVAILABLE,
        FleetError::DuplicateDevice(_) | FleetError::JobActive(_) | FleetError::Job(_) => {
            StatusCode::CONFLICT
        }
        FleetError::File(_) => StatusCode::BAD_REQUEST,
        FleetError::Connection(_) | FleetError::Model(_) | FleetError::Store(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Error body, with the device's unchanged snapshot when there is one.
async fn reject(fleet: &Fleet, device_id: Option<&str>, error: FleetError) -> ApiError {
    let device = match (device_id, &error) {
        (_, FleetError::UnknownDevice(_)) | (None, _) => None,
        (Some(id), _) => fleet.device(id).await.ok(),
    };
    (
        status_of(&error),
        Json(ErrorResponse {
            error: error.to_string(),
            device,
        }),
    )
}

async fn list_devices(State(fleet): State<AppState>) -> Json<Vec<DeviceSnapshot>> {
    Json(fleet.devices().await)
}

async fn get_device(State(fleet): State<AppState>, Path(id): Path<String>) -> ApiResult<DeviceSnapshot> {
    match fleet.device(&id).await {
        Ok(snapshot) => Ok(Json(snapshot)),
        Err(e) => Err(reject(&fleet, Some(&id), e).await),
    }
}

/// `start`, `pause`, `resume` or `cancel` the device's current job.
async fn control_device(
    State(fleet): State<AppState>,
    Path((id, action)): Path<(String, String)>,
) -> ApiResult<DeviceSnapshot> {
    let result = match action.as_str() {
        "start" => fleet.start(&id).await,
        "pause" => fleet.pause(&id).await,
        "resume" => fleet.resume(&id).await,
        "cancel" => fleet.cancel(&id).await,
        other => {
            return Err((
                StatusCode::NOT_FOUND,
                Json(ErrorResponse {
                    error: format!("unknown action '{}'", other),
                    device: None,
                }),
            ));
        }
    };
    match result {
        Ok(snapshot) => Ok(Json(snapshot)),
        Err(e) => Err(reject(&fleet, Some(&id), e).await),
    }
}

/// Handler to queue a single G-code command.
async fn execute_gcode(
    State(fleet): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<GcodeCommandRequest>,
) -> ApiResult<DeviceSnapshot> {
    match fleet.execute(&id, &payload.command).await {
        Ok(snapshot) => Ok(Json(snapshot)),
        Err(e) => Err(reject(&fleet, Some(&id), e).await),
    }
}

async fn list_jobs(State(fleet): State<AppState>) -> Json<Vec<JobSnapshot>> {
    Json(fleet.get_jobs().await)
}

async fn create_job(
    State(fleet): State<AppState>,
    Json(request): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<JobSnapshot>), ApiError> {
    match fleet.create_job(&request.device_id, &request.file).await {
        Ok(job) => Ok((StatusCode::CREATED, Json(job))),
        Err(e) => Err(reject(&fleet, Some(&request.device_id), e).await),
    }
}

async fn get_job(State(fleet): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<JobSnapshot> {
    match fleet.get_job(id).await {
        Ok(job) => Ok(Json(job)),
        Err(e) => Err(reject(&fleet, None, e).await),
    }
}

async fn delete_job(State(fleet): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<JobSnapshot> {
    match fleet.delete_job(id).await {
        Ok(job) => Ok(Json(job)),
        Err(e) => Err(reject(&fleet, None, e).await),
    }
}

/// Every broadcast event, as server-sent events named after their topic.
async fn events(State(fleet): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = fleet.subscribe();
    let stream = stream! {
        loop {
            match rx.recv().await {
                Ok(message) => match Event::default().event(message.topic.as_str()).json_data(&message.event) {
                    Ok(event) => {
                        yield Ok::<Event, Infallible>(event);
                    }
                    Err(e) => tracing::warn!("Cannot encode {} event: {}", message.topic, e),
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event stream subscriber skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}
