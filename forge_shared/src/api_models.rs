//! Shared data models for snapshots, broadcast events and REST bodies.

use crate::device_state::DeviceState;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub e: f64,
}

/// Point-in-time view of one device, returned by every control operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub id: String,
    pub model: String,
    pub state: DeviceState,
    /// Offset-adjusted position captured by the last pause.
    pub paused_position: Option<Position>,
    /// State restored on resume.
    pub pauseable_state: Option<DeviceState>,
    pub current_job: Option<Uuid>,
    pub queue_depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    New,
    Update,
    Delete,
}

/// Payload handed to subscribers on every job change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastEvent {
    pub uuid: String,
    pub event: EventKind,
    pub data: serde_json::Value,
}

/// Request body for creating a job.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CreateJobRequest {
    pub device_id: String,
    pub file: String,
}

/// Represents a request to execute a G-code command.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GcodeCommandRequest {
    pub command: String,
}

/// Error body returned by control endpoints. Carries the unchanged device
/// snapshot when the device exists.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ErrorResponse {
    pub error: String,
    pub device: Option<DeviceSnapshot>,
}
