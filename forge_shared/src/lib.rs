// forge_shared: shared types and collaborator traits for the fleet host

pub mod api_models;
pub mod config;
pub mod device_state;
pub mod event_interface;
pub mod print_job;
pub mod serial_interface;

pub use api_models::{BroadcastEvent, DeviceSnapshot, EventKind, Position};
pub use device_state::{DeviceEvent, DeviceState, StateTransitionError};
pub use print_job::{JobEvent, JobSnapshot, JobState, JobTransitionError};
