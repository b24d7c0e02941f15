//! reqwest implementation of [`RemoteChannel`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tokio_util::sync::CancellationToken;

use super::{endpoint, ChannelError, PollOutcome, RemoteChannel};
use crate::task::{ResultEnvelope, Task};

/// HTTP long-poll client for the task platform.
#[derive(Debug, Clone)]
pub struct HttpTaskChannel {
    client: Client,
    poll_timeout: Duration,
    submit_timeout: Duration,
}

impl HttpTaskChannel {
    /// Create a channel with the given bounds on `/listen` and `/submit-result`.
    pub fn new(poll_timeout: Duration, submit_timeout: Duration) -> Self {
        let client = Client::builder()
            .user_agent(concat!("sitelink/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Falling back to default HTTP client: {}", e);
                Client::new()
            });
        Self {
            client,
            poll_timeout,
            submit_timeout,
        }
    }

    async fn listen(&self, credential: &str, base_url: &str) -> Result<Option<Task>, ChannelError> {
        let timeout = self.poll_timeout;
        let response = self
            .client
            .get(endpoint(base_url, "listen"))
            .bearer_auth(credential)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| ChannelError::from_reqwest(&e, timeout))?;

        match response.status() {
            StatusCode::OK => {
                let body = response
                    .text()
                    .await
                    .map_err(|e| ChannelError::from_reqwest(&e, timeout))?;
                serde_json::from_str::<Task>(&body)
                    .map(Some)
                    .map_err(|e| ChannelError::decode(format!("invalid task body: {}", e)))
            }
            StatusCode::NO_CONTENT => Ok(None),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(ChannelError::status(status.as_u16(), &body))
            }
        }
    }
}

#[async_trait]
impl RemoteChannel for HttpTaskChannel {
    async fn poll(&self, credential: &str, base_url: &str, cancel: &CancellationToken) -> PollOutcome {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => PollOutcome::Cancelled,
            result = self.listen(credential, base_url) => match result {
                Ok(Some(task)) => PollOutcome::Task(task),
                Ok(None) => PollOutcome::Empty,
                Err(e) => PollOutcome::Failed(e),
            },
        }
    }

    async fn submit_result(
        &self,
        credential: &str,
        base_url: &str,
        envelope: &ResultEnvelope,
    ) -> Result<(), ChannelError> {
        let timeout = self.submit_timeout;
        let response = self
            .client
            .post(endpoint(base_url, "submit-result"))
            .bearer_auth(credential)
            .timeout(timeout)
            .json(envelope)
            .send()
            .await
            .map_err(|e| ChannelError::from_reqwest(&e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChannelError::status(status.as_u16(), &body));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::ChannelErrorKind;
    use crate::task::{TaskId, TaskResult};
    use axum::{
        http::{HeaderMap, StatusCode as AxumStatus},
        routing::{get, post},
        Json, Router,
    };
    use std::sync::{Arc, Mutex};

    async fn spawn_platform(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(|v| v == "Bearer tok1")
            .unwrap_or(false)
    }

    fn channel() -> HttpTaskChannel {
        HttpTaskChannel::new(Duration::from_secs(5), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_poll_returns_task_on_200() {
        let app = Router::new().route(
            "/listen",
            get(|headers: HeaderMap| async move {
                if !authorized(&headers) {
                    return (AxumStatus::UNAUTHORIZED, String::new());
                }
                (
                    AxumStatus::OK,
                    r#"{"id":"t1","type":"EXECUTE_QUERY","payload":{"query":"SELECT 1"}}"#.to_string(),
                )
            }),
        );
        let base = spawn_platform(app).await;

        match channel().poll("tok1", &base, &CancellationToken::new()).await {
            PollOutcome::Task(task) => {
                assert_eq!(task.id, TaskId::from("t1"));
                assert_eq!(task.kind.as_str(), "EXECUTE_QUERY");
            }
            other => panic!("expected task, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_poll_204_is_empty() {
        let app = Router::new().route("/listen", get(|| async { AxumStatus::NO_CONTENT }));
        let base = spawn_platform(app).await;

        let outcome = channel().poll("tok1", &base, &CancellationToken::new()).await;
        assert!(matches!(outcome, PollOutcome::Empty));
    }

    #[tokio::test]
    async fn test_poll_other_status_carries_code_and_body() {
        let app = Router::new().route(
            "/listen",
            get(|| async { (AxumStatus::SERVICE_UNAVAILABLE, "maintenance") }),
        );
        let base = spawn_platform(app).await;

        match channel().poll("tok1", &base, &CancellationToken::new()).await {
            PollOutcome::Failed(e) => {
                assert_eq!(e.kind, ChannelErrorKind::Status);
                assert_eq!(e.status, Some(503));
                assert!(e.message.contains("maintenance"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_poll_invalid_body_is_a_failure() {
        let app = Router::new().route("/listen", get(|| async { "not a task" }));
        let base = spawn_platform(app).await;

        match channel().poll("tok1", &base, &CancellationToken::new()).await {
            PollOutcome::Failed(e) => assert_eq!(e.kind, ChannelErrorKind::Decode),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_poll_times_out() {
        let app = Router::new().route(
            "/listen",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                AxumStatus::NO_CONTENT
            }),
        );
        let base = spawn_platform(app).await;
        let channel = HttpTaskChannel::new(Duration::from_millis(200), Duration::from_secs(1));

        match channel.poll("tok1", &base, &CancellationToken::new()).await {
            PollOutcome::Failed(e) => assert_eq!(e.kind, ChannelErrorKind::Timeout),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_aborts_outstanding_poll() {
        let app = Router::new().route(
            "/listen",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                AxumStatus::NO_CONTENT
            }),
        );
        let base = spawn_platform(app).await;
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let outcome = channel().poll("tok1", &base, &cancel).await;
        assert!(matches!(outcome, PollOutcome::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        match channel()
            .poll("tok1", &format!("http://{}", addr), &CancellationToken::new())
            .await
        {
            PollOutcome::Failed(e) => assert_eq!(e.kind, ChannelErrorKind::Connect),
            other => panic!("expected connect failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_submit_result_posts_envelope() {
        let received: Arc<Mutex<Vec<serde_json::Value>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let app = Router::new().route(
            "/submit-result",
            post(move |headers: HeaderMap, Json(body): Json<serde_json::Value>| {
                let sink = Arc::clone(&sink);
                async move {
                    if !authorized(&headers) {
                        return AxumStatus::UNAUTHORIZED;
                    }
                    sink.lock().unwrap().push(body);
                    AxumStatus::OK
                }
            }),
        );
        let base = spawn_platform(app).await;

        let envelope = ResultEnvelope {
            task_id: TaskId::from("t1"),
            result: TaskResult::ok(serde_json::json!([{ "col": 1 }])),
        };
        channel().submit_result("tok1", &base, &envelope).await.unwrap();

        let bodies = received.lock().unwrap().clone();
        assert_eq!(
            bodies,
            vec![serde_json::json!({ "taskId": "t1", "result": { "success": true, "data": [{ "col": 1 }] } })]
        );

        let err = channel()
            .submit_result("wrong", &base, &envelope)
            .await
            .unwrap_err();
        assert_eq!(err.status, Some(401));
    }
}
