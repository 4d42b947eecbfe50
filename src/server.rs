//! HTTP server implementation and lifecycle management.
//!
//! The server accepts TCP connections, hands each one to a tokio task, and
//! drives requests through the built pipeline handler. Connections are
//! served HTTP/1.1 with upgrade support, which is what carries the Spark
//! WebSocket channel. [`serve_with_shutdown`] adds cooperative shutdown: the
//! accept loop stops when the signal fires, and the same signal is what the
//! periodic tasks (GC sweep, upload reaper) watch.
//!
//! # Examples
//!
//! ```rust,no_run
//! use hibana::{pipeline::Pipeline, router::{Dispatch, Router}, rescuer::Rescuer, serve};
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let router = Router::new();
//! let handler = Pipeline::new()
//!     .with(Rescuer::new())
//!     .with(Dispatch::new(Arc::new(router)))
//!     .build()?;
//!
//! let listener = TcpListener::bind("127.0.0.1:4000").await?;
//! serve(listener, handler).await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use hyper::{server::conn::http1, service::service_fn};
use std::convert::Infallible;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::{
    body::HibanaBody,
    handler::BoxHandler,
    types::Response,
};

/// Creates the shutdown signal pair shared by the server and the periodic
/// background tasks.
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Starts the HTTP server and runs until the process exits.
pub async fn serve(listener: TcpListener, handler: BoxHandler) {
    let (_tx, rx) = shutdown_channel();
    serve_with_shutdown(listener, handler, rx).await;
}

/// Starts the HTTP server and runs until `shutdown` fires.
pub async fn serve_with_shutdown(
    listener: TcpListener,
    handler: BoxHandler,
    mut shutdown: watch::Receiver<bool>,
) {
    let handler = Arc::new(handler);

    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "hibana listening");
    }

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.changed() => break,
        };
        let (stream, addr) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "failed to accept connection");
                continue;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let handler = handler.clone();

        // One task per connection; requests on it are served in order.
        tokio::spawn(async move {
            let svc = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                let handler = handler.clone();
                async move {
                    let mut req = req.map(HibanaBody::new);
                    req.extensions_mut().insert(addr);
                    let response = match handler.call(req).await {
                        Ok(response) => response,
                        // The rescuer renders errors in a well-formed
                        // pipeline; this is the fallback for one without it.
                        Err(err) => {
                            let mut res = Response::new(HibanaBody::from(err.to_json_body(false)));
                            *res.status_mut() = err.status();
                            if let Ok(value) = "application/json".parse() {
                                res.headers_mut().insert(http::header::CONTENT_TYPE, value);
                            }
                            res
                        }
                    };
                    Ok::<_, Infallible>(response)
                }
            });

            let mut http = http1::Builder::new();
            http.keep_alive(true);
            let conn = http.serve_connection(io, svc).with_upgrades();

            if let Err(err) = conn.await {
                tracing::debug!(error = %err, "connection closed with error");
            }
        });
    }
}
