//! Request handler traits and type-erased handler storage.
//!
//! Terminal handlers sit at the end of the pipeline: the router stores one
//! per route and calls it once a request has been matched. A handler is any
//! async function from [`Request`] to [`StageResult`]; [`BoxHandler`] erases
//! the concrete type so routes, caches, and the pipeline can hold them
//! uniformly.

use std::{future::Future, sync::Arc};

use futures_util::future::BoxFuture;

use crate::types::{Request, StageResult};

/// Type-erased handler wrapper for dynamic storage and composition.
#[derive(Clone)]
pub struct BoxHandler {
  inner: Arc<dyn Fn(Request) -> BoxFuture<'static, StageResult> + Send + Sync>,
}

impl BoxHandler {
  /// Creates a new boxed handler from an async function or closure.
  ///
  /// # Examples
  ///
  /// ```rust
  /// use hibana::handler::BoxHandler;
  /// use hibana::body::HibanaBody;
  /// use hibana::types::{Request, Response};
  ///
  /// let handler = BoxHandler::new(|_req: Request| async {
  ///   Ok(Response::new(HibanaBody::from("pong")))
  /// });
  /// ```
  pub fn new<F, Fut>(f: F) -> Self
  where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StageResult> + Send + 'static,
  {
    let inner = Arc::new(move |req: Request| {
      Box::pin(f(req)) as BoxFuture<'static, StageResult>
    });
    Self { inner }
  }

  /// Calls the handler with the provided request.
  pub fn call(&self, req: Request) -> BoxFuture<'static, StageResult> {
    (self.inner)(req)
  }
}
