//! Access logging stage.
//!
//! Emits one structured log line per completed request. The line itself is
//! written by a dedicated worker task fed through an unbounded channel, so
//! a slow logging sink never blocks a request task.

use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    endpoint::ENDPOINT_HEADER,
    pipeline::{Next, Stage},
    types::{Request, StageResult},
};

#[derive(Debug)]
struct AccessRecord {
    method: String,
    path: String,
    status: u16,
    latency_ms: f64,
    remote_addr: Option<String>,
    user_agent: Option<String>,
    endpoint: Option<String>,
    content_length: Option<u64>,
}

/// Structured access-log stage.
pub struct AccessLog {
    tx: mpsc::UnboundedSender<AccessRecord>,
}

impl AccessLog {
    /// Creates the stage and spawns its log-writer task. Must be called
    /// from within a tokio runtime.
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AccessRecord>();
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                tracing::info!(
                    target: "hibana::access",
                    method = %record.method,
                    path = %record.path,
                    status = record.status,
                    latency_ms = record.latency_ms,
                    remote_addr = record.remote_addr.as_deref().unwrap_or("-"),
                    user_agent = record.user_agent.as_deref().unwrap_or("-"),
                    endpoint = record.endpoint.as_deref().unwrap_or("-"),
                    content_length = record.content_length.unwrap_or(0),
                    "request completed"
                );
            }
        });
        Self { tx }
    }
}

#[async_trait]
impl Stage for AccessLog {
    async fn call(&self, req: Request, next: Next) -> StageResult {
        let method = req.method().to_string();
        let path = req.uri().path().to_string();
        let remote_addr = req
            .extensions()
            .get::<std::net::SocketAddr>()
            .map(|addr| addr.to_string());
        let user_agent = req
            .headers()
            .get(http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let start = Instant::now();
        let result = next.run(req).await;
        let latency_ms = start.elapsed().as_secs_f64() * 1_000.0;

        let (status, endpoint, content_length) = match &result {
            Ok(res) => (
                res.status().as_u16(),
                res.headers()
                    .get(ENDPOINT_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string),
                res.headers()
                    .get(http::header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .or_else(|| {
                        use hyper::body::Body;
                        res.body().size_hint().exact()
                    }),
            ),
            Err(err) => (err.status().as_u16(), None, None),
        };

        let _ = self.tx.send(AccessRecord {
            method,
            path,
            status,
            latency_ms,
            remote_addr,
            user_agent,
            endpoint,
            content_length,
        });

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::HibanaBody;
    use crate::error::Error;
    use crate::pipeline::Pipeline;
    use crate::types::Response;

    #[tokio::test]
    async fn logging_passes_responses_through_untouched() {
        let handler = Pipeline::new()
            .with(AccessLog::new())
            .with_fn(|_req, _next| async move {
                Ok(Response::new(HibanaBody::from("payload")))
            })
            .build()
            .unwrap();

        let res = handler
            .call(
                http::Request::builder()
                    .uri("/logged")
                    .header("user-agent", "test-agent")
                    .body(HibanaBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), http::StatusCode::OK);
    }

    #[tokio::test]
    async fn errors_still_propagate_after_logging() {
        let handler = Pipeline::new()
            .with(AccessLog::new())
            .with_fn(|_req, _next| async move {
                Err(Error::forbidden("nope"))
            })
            .build()
            .unwrap();

        let err = handler
            .call(
                http::Request::builder()
                    .uri("/denied")
                    .body(HibanaBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status(), http::StatusCode::FORBIDDEN);
    }
}
