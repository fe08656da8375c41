// forge_rs: host for a fleet of serial fabrication devices

pub mod command_queue;
pub mod communication;
pub mod device;
pub mod file_manager;
pub mod fleet;
pub mod job_store;
pub mod orchestrator;
pub mod print_job;
pub mod telemetry;
pub mod web;

pub use fleet::{Fleet, FleetError};
