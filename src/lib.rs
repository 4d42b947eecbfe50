//! A contract-driven web framework for typed HTTP endpoints and live
//! WebSocket components.
//!
//! Hibana pairs a composable handler pipeline with typed endpoint dispatch:
//! request DTOs are built from bodies or merged parameters, validated
//! field-by-field, handed to a business method, and rendered through content
//! negotiation. A WebSocket-backed component runtime ("Spark") keeps
//! server-rendered HTML fragments live on the page, and a thread-safe
//! metrics engine aggregates request, component, and cache telemetry.
//!
//! # High-level features
//! - Radix-tree routing with `:name` path params, implicit HEAD/OPTIONS, and
//!   duplicate detection at boot
//! - Ordered middleware pipeline with typed error propagation and a rescuer
//!   that renders structured errors (and catches panics)
//! - Typed endpoints: request contracts with field validation, negotiated
//!   multi-format responses, generated path/link/form helpers
//! - CSRF protection (synchronizer, signed double-submit, double-submit),
//!   watch-window throttling, request ids, non-blocking access logs
//! - Live components over a single WebSocket channel with per-component
//!   FIFO event dispatch and garbage-collected lifetimes
//! - Performance monitoring with bounded in-memory metrics and percentile
//!   aggregation
//!
//! # Compatibility
//! - Runtime: `tokio`
//! - HTTP: `hyper` 1.x
//!
//! # Quickstart
//!
//! ```rust,no_run
//! use hibana::{
//!     pipeline::Pipeline,
//!     rescuer::Rescuer,
//!     router::{Dispatch, Router},
//!     handlers::{AccessLog, RequestId},
//! };
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut router = Router::new();
//! router.at(http::Method::GET, "/health", |_req| async {
//!     Ok(hyper::Response::new(hibana::body::HibanaBody::from("ok")))
//! })?;
//!
//! let handler = Pipeline::new()
//!     .with(Rescuer::new())
//!     .with(RequestId)
//!     .with(AccessLog::new())
//!     .with(Dispatch::new(Arc::new(router)))
//!     .build()?;
//!
//! let listener = TcpListener::bind("127.0.0.1:4000").await?;
//! hibana::serve(listener, handler).await;
//! # Ok(())
//! # }
//! ```

/// HTTP request and response body handling utilities.
pub mod body;

/// Cache backend interface and metrics instrumentation.
pub mod cache;

/// Environment-driven configuration with a process-wide container.
pub mod config;

/// Request contracts: DTO construction and field validation.
pub mod contract;

/// CSRF protection strategies and pipeline stage.
pub mod csrf;

/// Typed endpoint dispatch and route helpers.
pub mod endpoint;

/// Structured error taxonomy and boot errors.
pub mod error;

/// Request handler traits and type-erased handler storage.
pub mod handler;

/// Standalone pipeline stages (request id, access log, static files).
pub mod handlers;

/// Thread-safe metric arenas and aggregation.
pub mod metrics;

/// Performance monitoring middleware.
pub mod monitor;

/// Accept-header negotiation and response rendering contracts.
pub mod negotiation;

/// Parameter bags with form → path → query precedence.
pub mod params;

/// Ordered middleware pipeline.
pub mod pipeline;

/// Error-rendering rescuer stage.
pub mod rescuer;

/// Request routing and dispatch.
pub mod router;

/// HTTP server implementation.
mod server;

/// Live-component runtime over WebSocket.
pub mod spark;

/// Template environment built on minijinja.
pub mod templates;

/// Per-client request throttling.
pub mod throttle;

/// Tracing subscriber setup.
pub mod tracing;

/// Core type aliases used throughout the framework.
pub mod types;

/// Uploaded-file temp storage and reaping.
pub mod uploads;

pub use bytes::Bytes;
pub use http::{header, Method, StatusCode};

/// Starts the HTTP server with the given listener and pipeline handler.
pub use server::{serve, serve_with_shutdown, shutdown_channel};

/// TLS/SSL server implementation for secure connections.
#[cfg(feature = "tls")]
pub mod server_tls;

/// Starts the HTTPS server with TLS encryption support.
#[cfg(feature = "tls")]
pub use server_tls::serve_tls;
