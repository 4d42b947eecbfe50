//! Request-id stage: every request gets an `X-Request-ID`.
//!
//! Incoming ids are kept (callers and proxies often assign their own);
//! otherwise a uuid is generated. The id is visible to downstream stages via
//! the request headers and mirrored onto the response so clients can quote
//! it in bug reports.

use async_trait::async_trait;
use http::HeaderValue;
use uuid::Uuid;

use crate::{
    pipeline::{Next, Stage},
    types::{Request, StageResult},
};

/// Header carrying the request id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Ensures the request-id header exists and mirrors it onto the response.
pub struct RequestId;

#[async_trait]
impl Stage for RequestId {
    async fn call(&self, mut req: Request, next: Next) -> StageResult {
        if !req.headers().contains_key(REQUEST_ID_HEADER) {
            let id = Uuid::new_v4().to_string();
            if let Ok(value) = HeaderValue::from_str(&id) {
                req.headers_mut().insert(REQUEST_ID_HEADER, value);
            }
        }
        let id = req.headers().get(REQUEST_ID_HEADER).cloned();

        let mut res = next.run(req).await?;
        if let Some(id) = id {
            res.headers_mut().insert(REQUEST_ID_HEADER, id);
        }
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::HibanaBody;
    use crate::pipeline::Pipeline;
    use crate::types::Response;

    fn echo_pipeline() -> crate::handler::BoxHandler {
        Pipeline::new()
            .with(RequestId)
            .with_fn(|req: Request, _next| async move {
                // The id must already be visible downstream.
                assert!(req.headers().contains_key(REQUEST_ID_HEADER));
                Ok(Response::new(HibanaBody::empty()))
            })
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn generates_an_id_when_absent() {
        let res = echo_pipeline()
            .call(
                http::Request::builder()
                    .uri("/")
                    .body(HibanaBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let id = res.headers().get(REQUEST_ID_HEADER).unwrap();
        assert!(Uuid::parse_str(id.to_str().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn preserves_an_existing_id() {
        let res = echo_pipeline()
            .call(
                http::Request::builder()
                    .uri("/")
                    .header(REQUEST_ID_HEADER, "given-by-proxy")
                    .body(HibanaBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            res.headers().get(REQUEST_ID_HEADER).unwrap(),
            "given-by-proxy"
        );
    }
}
