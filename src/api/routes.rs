//! HTTP route handlers and server lifecycle.

use std::convert::Infallible;
use std::sync::Arc;

use axum::middleware;
use axum::{
    extract::State,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::get,
    Router,
};
use futures::stream::Stream;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::agent::{AgentDeps, AgentSession};
use crate::config::Config;
use crate::db::{QueryBackend, SqlBackend};
use crate::events::{AgentEvent, EventSink, LogLevel, StatusSnapshot};
use crate::executor::TaskRegistry;
use crate::remote::HttpTaskChannel;
use crate::settings::{SettingsStore, SharedSettingsStore};

use super::auth;
use super::settings as settings_api;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    /// Operator settings
    pub settings: SharedSettingsStore,
    /// The single agent session
    pub session: Arc<AgentSession>,
    /// Backend used for manual connection tests
    pub backend: Arc<dyn QueryBackend>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    snapshot: StatusSnapshot,
    running: bool,
}

/// Build the control API router.
pub fn router(state: Arc<AppState>) -> Router {
    let public_routes = Router::new().route("/api/health", get(health));

    let protected_routes = Router::new()
        .route("/api/status", get(get_status))
        .route("/api/events", get(stream_events))
        .nest("/api/settings", settings_api::routes())
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_auth,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Wire up the agent, start it if a credential is stored, and serve the control API.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let settings = Arc::new(SettingsStore::new(config.settings_path()).await);
    let backend: Arc<dyn QueryBackend> = Arc::new(SqlBackend);

    let session = Arc::new(AgentSession::new(AgentDeps {
        channel: Arc::new(HttpTaskChannel::new(
            config.poll_timeout,
            config.submit_timeout,
        )),
        registry: Arc::new(TaskRegistry::with_defaults(Arc::clone(&backend))),
        settings: Arc::clone(&settings),
        events: EventSink::new(),
        backoff: config.backoff,
        default_base_url: config.agent_service_url.clone(),
    }));

    if settings.api_key().await.is_some() {
        session.restart_from_settings().await;
    } else {
        session.events().log(
            LogLevel::Warn,
            "Welcome. Configure the API key and database settings.",
        );
        session.start(None).await;
    }

    let state = Arc::new(AppState {
        config: config.clone(),
        settings,
        session: Arc::clone(&session),
        backend,
    });

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Control API listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Stopping agent loop...");
    session.stop().await;
    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

/// Health check endpoint.
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// GET /api/status
async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        snapshot: state.session.events().status(),
        running: state.session.is_running().await,
    })
}

fn to_sse(event: &AgentEvent) -> Option<Event> {
    match Event::default().event(event.name()).json_data(event) {
        Ok(e) => Some(e),
        Err(e) => {
            tracing::warn!("Failed to encode event: {}", e);
            None
        }
    }
}

/// GET /api/events
/// Live log and status events. Starts with the current status; nothing older is replayed.
async fn stream_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = state.session.events();
    let mut rx = events.subscribe();
    let current = events.status();

    let stream = async_stream::stream! {
        let initial = AgentEvent::ConnectionStatus {
            status: current.status,
            message: current.message,
        };
        if let Some(event) = to_sse(&initial) {
            yield Ok(event);
        }

        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(event) = to_sse(&event) {
                        yield Ok(event);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event stream lagged, {} events dropped", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::BackoffPolicy;
    use crate::events::ConnectionStatus;
    use crate::remote::{ChannelError, PollOutcome, RemoteChannel};
    use crate::task::ResultEnvelope;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    /// Platform with nothing to hand out.
    #[derive(Default)]
    struct IdleChannel {
        polls: AtomicUsize,
    }

    #[async_trait]
    impl RemoteChannel for IdleChannel {
        async fn poll(&self, _credential: &str, _base_url: &str, cancel: &CancellationToken) -> PollOutcome {
            self.polls.fetch_add(1, Ordering::SeqCst);
            cancel.cancelled().await;
            PollOutcome::Cancelled
        }

        async fn submit_result(
            &self,
            _credential: &str,
            _base_url: &str,
            _envelope: &ResultEnvelope,
        ) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    struct TestServer {
        _dir: TempDir,
        base: String,
        state: Arc<AppState>,
        channel: Arc<IdleChannel>,
    }

    async fn spawn_api(control_token: Option<&str>) -> TestServer {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::from_lookup(|name| match name {
            "WORKING_DIR" => Some(dir.path().to_string_lossy().to_string()),
            _ => None,
        })
        .unwrap();
        config.control_token = control_token.map(str::to_string);

        let settings = Arc::new(SettingsStore::new(config.settings_path()).await);
        let backend: Arc<dyn QueryBackend> = Arc::new(SqlBackend);
        let channel = Arc::new(IdleChannel::default());
        let session = Arc::new(AgentSession::new(AgentDeps {
            channel: channel.clone(),
            registry: Arc::new(TaskRegistry::with_defaults(Arc::clone(&backend))),
            settings: Arc::clone(&settings),
            events: EventSink::new(),
            backoff: BackoffPolicy::Fixed(Duration::from_millis(50)),
            default_base_url: config.agent_service_url.clone(),
        }));

        let state = Arc::new(AppState {
            config,
            settings,
            session,
            backend,
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(Arc::clone(&state));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        TestServer {
            _dir: dir,
            base: format!("http://{}", addr),
            state,
            channel,
        }
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let server = spawn_api(Some("s3cret")).await;
        let resp = reqwest::get(format!("{}/api/health", server.base)).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_protected_routes_require_token() {
        let server = spawn_api(Some("s3cret")).await;
        let client = reqwest::Client::new();

        let resp = client
            .get(format!("{}/api/status", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);

        let resp = client
            .get(format!("{}/api/status", server.base))
            .bearer_auth("s3cret")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "unconfigured");
        assert_eq!(body["running"], false);
    }

    #[tokio::test]
    async fn test_save_settings_restarts_agent() {
        let server = spawn_api(None).await;
        let client = reqwest::Client::new();

        let resp = client
            .put(format!("{}/api/settings", server.base))
            .json(&json!({
                "apiKey": "tok1",
                "posConfig": {
                    "server": "localhost",
                    "database": "pos",
                    "user": "sa",
                    "password": "pw",
                    "options": { "trustServerCertificate": true },
                    "requestTimeout": 15000
                }
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["agentStarted"], true);
        assert_eq!(body["settings"]["apiKey"], "tok1");

        let initial: serde_json::Value = client
            .get(format!("{}/api/settings", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(initial["posConfig"]["database"], "pos");

        assert!(server.state.session.is_running().await);
        for _ in 0..200 {
            if server.channel.polls.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(server.channel.polls.load(Ordering::SeqCst), 1);
        server.state.session.stop().await;
        assert_eq!(
            server.state.session.events().status().status,
            ConnectionStatus::Disconnected
        );
    }

    #[tokio::test]
    async fn test_save_settings_rejects_incomplete_form() {
        let server = spawn_api(None).await;

        let resp = reqwest::Client::new()
            .put(format!("{}/api/settings", server.base))
            .json(&json!({ "apiKey": "tok1", "posConfig": { "server": "", "database": "pos" } }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let text = resp.text().await.unwrap();
        assert!(text.contains("server"));
        assert!(text.contains("user"));
        assert!(!server.state.session.is_running().await);
    }

    #[tokio::test]
    async fn test_connection_endpoint_reports_failure() {
        let server = spawn_api(None).await;

        let resp = reqwest::Client::new()
            .post(format!("{}/api/settings/test-connection", server.base))
            .json(&json!({ "engine": "sqlite", "database": "/nonexistent/dir/pos.db" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().starts_with("connection failed"));
    }

    #[tokio::test]
    async fn test_event_stream_starts_with_current_status() {
        let server = spawn_api(None).await;
        server
            .state
            .session
            .events()
            .update_status(ConnectionStatus::Connected, "Connected. No pending tasks.");

        let mut resp = reqwest::get(format!("{}/api/events", server.base)).await.unwrap();
        assert_eq!(resp.status(), 200);

        let chunk = tokio::time::timeout(Duration::from_secs(5), resp.chunk())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let text = String::from_utf8_lossy(&chunk).to_string();
        assert!(text.contains("event: connection-status"));
        assert!(text.contains("\"status\":\"connected\""));
    }
}
