//! The web module for handling the Axum API.

pub mod api;

pub use api::{create_router, AppState};
