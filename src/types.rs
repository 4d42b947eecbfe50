//! Core type definitions and aliases used throughout the framework.
//!
//! This module provides the fundamental type aliases that standardize request,
//! response, error, and pipeline-stage types across the crate. `Request` and
//! `Response` are both built over [`HibanaBody`](crate::body::HibanaBody) so
//! that a request constructed in a test looks exactly like one produced by the
//! server loop, and so the body can be buffered once and re-read by several
//! pipeline stages.
//!
//! # Examples
//!
//! ```rust
//! use hibana::types::{Request, Response};
//! use hibana::body::HibanaBody;
//!
//! let req: Request = http::Request::builder()
//!     .method("GET")
//!     .uri("/health")
//!     .body(HibanaBody::empty())
//!     .unwrap();
//!
//! let res: Response = Response::new(HibanaBody::from("ok"));
//! assert_eq!(res.status(), 200);
//! ```

use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http_body_util::combinators::UnsyncBoxBody;

use crate::{body::HibanaBody, error::Error, pipeline::Next};

/// HTTP request type shared by the server loop, pipeline stages, and tests.
pub type Request = hyper::Request<HibanaBody>;

/// HTTP response type produced by handlers and stages.
pub type Response = hyper::Response<HibanaBody>;

/// Result of a pipeline stage: either a finished response or a structured
/// error that propagates up to the rescuer stage.
pub type StageResult = Result<Response, Error>;

/// Boxed HTTP body type backing [`HibanaBody`].
pub(crate) type BoxBody = UnsyncBoxBody<Bytes, BoxError>;

/// Boxed error type for thread-safe error handling at the body layer.
pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Boxed pipeline stage function for dynamic composition.
///
/// A stage receives the request and the remainder of the chain. It may
/// short-circuit by returning without invoking [`Next::run`].
pub type BoxStage =
    Arc<dyn Fn(Request, Next) -> BoxFuture<'static, StageResult> + Send + Sync>;

/// Request-extension marker inserted by the TLS listener, so stages can
/// tell a terminated-TLS request from a plain one.
#[derive(Debug, Clone, Copy)]
pub struct TlsConnection;
