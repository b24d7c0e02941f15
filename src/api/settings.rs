//! API endpoints for operator settings.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};

use crate::config::validate_base_url;
use crate::db::{ConnectionTest, DatabaseDescriptor};
use crate::events::LogLevel;
use crate::settings::Settings;

use super::routes::AppState;

/// Create the settings API routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(get_settings).put(save_settings))
        .route("/test-connection", post(test_connection))
}

/// Request to save the operator form.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveSettingsRequest {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub pos_config: Option<DatabaseDescriptor>,
    #[serde(default)]
    pub agent_service_url: Option<String>,
}

/// Response after saving settings.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveSettingsResponse {
    pub settings: Settings,
    /// Whether a fresh agent loop was started.
    pub agent_started: bool,
}

/// GET /api/settings
/// Initial data for the operator surface.
async fn get_settings(State(state): State<Arc<AppState>>) -> Json<Settings> {
    Json(state.settings.get().await)
}

/// PUT /api/settings
/// Persist settings, then cancel the running loop and start a new one.
async fn save_settings(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SaveSettingsRequest>,
) -> Result<Json<SaveSettingsResponse>, (StatusCode, String)> {
    let settings = Settings {
        api_key: req.api_key,
        pos_config: req.pos_config,
        agent_service_url: req.agent_service_url,
    }
    .normalized();

    let mut missing = Vec::new();
    if settings.api_key.is_none() {
        missing.push("apiKey");
    }
    match &settings.pos_config {
        Some(descriptor) => missing.extend(descriptor.missing_fields()),
        None => missing.push("posConfig"),
    }
    if !missing.is_empty() {
        let message = format!(
            "Please complete all configuration fields (missing: {}).",
            missing.join(", ")
        );
        state.session.events().log(LogLevel::Warn, message.clone());
        return Err((StatusCode::BAD_REQUEST, message));
    }

    if let Some(url) = settings.agent_service_url.as_deref() {
        validate_base_url("agentServiceUrl", url)
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    }

    state
        .settings
        .update(settings)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    state.session.events().log(LogLevel::Info, "Settings saved.");

    let agent_started = state.session.restart_from_settings().await;

    Ok(Json(SaveSettingsResponse {
        settings: state.settings.get().await,
        agent_started,
    }))
}

/// POST /api/settings/test-connection
/// Open and close a connection with the submitted descriptor.
async fn test_connection(
    State(state): State<Arc<AppState>>,
    Json(descriptor): Json<DatabaseDescriptor>,
) -> Result<Json<ConnectionTest>, (StatusCode, String)> {
    let missing = descriptor.missing_fields();
    if !missing.is_empty() {
        let message = format!(
            "Complete the database fields to test the connection (missing: {}).",
            missing.join(", ")
        );
        state.session.events().log(LogLevel::Warn, message.clone());
        return Err((StatusCode::BAD_REQUEST, message));
    }

    let result = state.backend.test_connection(&descriptor).await;
    let events = state.session.events();
    match &result.error {
        None => events.log(LogLevel::Success, "Manual connection test succeeded."),
        Some(error) => events.log(
            LogLevel::Error,
            format!("Manual connection test failed: {}", error),
        ),
    }
    Ok(Json(result))
}
