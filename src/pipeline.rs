//! Ordered middleware pipeline for request and response processing.
//!
//! A [`Pipeline`] composes stages into a single callable. Stages execute in
//! registration order; each receives the request and a [`Next`] continuation
//! and may short-circuit by returning without invoking it. Response shaping
//! is naturally observed in reverse order: each stage sees the response as
//! returned by the stages inside it. Stage results are `Result`s so
//! structured errors travel up the chain to the rescuer stage instead of
//! being flattened into ad-hoc responses.
//!
//! # Examples
//!
//! ```rust
//! use hibana::pipeline::{Pipeline, Next};
//! use hibana::types::{Request, StageResult};
//!
//! let handler = Pipeline::new()
//!     .with_fn(|req: Request, next: Next| async move {
//!         tracing::debug!(path = %req.uri().path(), "request started");
//!         next.run(req).await
//!     })
//!     .with_fn(|_req: Request, _next: Next| async move {
//!         Ok(hyper::Response::new(hibana::body::HibanaBody::from("ok")))
//!     })
//!     .build()
//!     .unwrap();
//! ```

use std::{future::Future, sync::Arc};

use async_trait::async_trait;

use crate::{
    error::{BootError, Error},
    handler::BoxHandler,
    types::{BoxStage, Request, StageResult},
};

/// A single stage in the request-processing chain.
///
/// Stages must not hold framework locks across `.await` points; anything
/// shared is locked briefly, mutated, and released before suspension.
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    async fn call(&self, req: Request, next: Next) -> StageResult;
}

/// The remainder of the pipeline after the current stage.
#[derive(Clone)]
pub struct Next {
    stages: Arc<Vec<BoxStage>>,
    pos: usize,
}

impl Next {
    /// Runs the rest of the chain.
    ///
    /// A request that falls off the end of the chain was matched by nothing,
    /// which surfaces as `NotFound` for the rescuer to render.
    pub async fn run(self, req: Request) -> StageResult {
        match self.stages.get(self.pos) {
            Some(stage) => {
                let next = Next {
                    stages: self.stages.clone(),
                    pos: self.pos + 1,
                };
                stage(req, next).await
            }
            None => Err(Error::not_found(format!(
                "no handler produced a response for {}",
                req.uri().path()
            ))),
        }
    }
}

/// Builder for an ordered chain of stages.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<BoxStage>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Appends a stage to the chain.
    pub fn with<S: Stage>(mut self, stage: S) -> Self {
        let stage = Arc::new(stage);
        let boxed: BoxStage = Arc::new(move |req, next| {
            let stage = stage.clone();
            Box::pin(async move { stage.call(req, next).await })
        });
        self.stages.push(boxed);
        self
    }

    /// Appends a stage that only runs when `predicate` holds for the request;
    /// otherwise the request passes straight through to the next stage.
    pub fn with_if<P, S>(mut self, predicate: P, stage: S) -> Self
    where
        P: Fn(&Request) -> bool + Send + Sync + 'static,
        S: Stage,
    {
        let stage = Arc::new(stage);
        let boxed: BoxStage = Arc::new(move |req, next| {
            if predicate(&req) {
                let stage = stage.clone();
                Box::pin(async move { stage.call(req, next).await })
            } else {
                Box::pin(next.run(req))
            }
        });
        self.stages.push(boxed);
        self
    }

    /// Appends a closure stage.
    pub fn with_fn<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StageResult> + Send + 'static,
    {
        let boxed: BoxStage = Arc::new(move |req, next| Box::pin(f(req, next)));
        self.stages.push(boxed);
        self
    }

    /// Links the stages into a single handler.
    ///
    /// An empty pipeline is a boot-time misconfiguration and fails with
    /// [`BootError::EmptyPipeline`].
    pub fn build(self) -> Result<BoxHandler, BootError> {
        if self.stages.is_empty() {
            return Err(BootError::EmptyPipeline);
        }
        let stages = Arc::new(self.stages);
        Ok(BoxHandler::new(move |req| {
            let next = Next {
                stages: stages.clone(),
                pos: 0,
            };
            next.run(req)
        }))
    }
}
