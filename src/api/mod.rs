//! Local control API.
//!
//! Stands in for the operator surface: read and save settings, test the database
//! connection, and follow log/status events over SSE.

mod auth;
mod routes;
mod settings;

pub use routes::{router, serve, AppState};
