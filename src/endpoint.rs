//! Typed endpoint dispatch: contracts in, negotiated responses out.
//!
//! An [`Endpoint`] binds a request contract, a response type, and a business
//! method. Registration wires the endpoint into the router, records a path
//! helper under the endpoint's name, and installs a handler that builds the
//! DTO (from a JSON body or the merged parameter bags), validates it, runs
//! the business method, and renders the result through content negotiation.
//!
//! # Examples
//!
//! ```rust
//! use async_trait::async_trait;
//! use hibana::contract::{Contract, Rules};
//! use hibana::endpoint::{Context, Endpoint};
//! use hibana::error::Error;
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct ShowUser {
//!     id: u64,
//! }
//!
//! impl Contract for ShowUser {}
//!
//! struct ShowUserEndpoint;
//!
//! #[async_trait]
//! impl Endpoint for ShowUserEndpoint {
//!     type Request = ShowUser;
//!     type Response = String;
//!
//!     fn name(&self) -> &'static str {
//!         "users.show"
//!     }
//!
//!     async fn call(&self, req: ShowUser, _ctx: &mut Context) -> Result<String, Error> {
//!         Ok(format!("user {}", req.id))
//!     }
//! }
//! ```

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use dashmap::DashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use once_cell::sync::Lazy;

use crate::{
    body,
    contract::{self, Contract},
    error::{BootError, Error},
    handler::BoxHandler,
    negotiation::{self, MultiFormat},
    params::{BodyParams, Params},
    pipeline::{Next, Stage},
    router::Router,
    types::{Request, StageResult},
};

/// Response header carrying the endpoint identity for the metrics and
/// logging stages.
pub const ENDPOINT_HEADER: &str = "x-endpoint";

/// Request-scoped context handed to the business method.
pub struct Context {
    /// Merged request parameters.
    pub params: Params,
    /// Request headers.
    pub headers: HeaderMap,
    pub method: Method,
    pub path: String,
    pub remote_addr: Option<SocketAddr>,
    status: Option<StatusCode>,
    response_headers: HeaderMap,
}

impl Context {
    /// Overrides the response status (the default is the negotiated 200/204).
    pub fn set_status(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    /// Adds a header to the response.
    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.response_headers.insert(name, value);
    }

    /// The request id assigned by the pipeline, when present.
    pub fn request_id(&self) -> Option<&str> {
        self.headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
    }
}

/// A handler bound to a route, a request contract, and a response type.
#[async_trait]
pub trait Endpoint: Send + Sync + 'static {
    type Request: Contract;
    type Response: MultiFormat;

    /// Endpoint identity used for the path helper, the `X-Endpoint` header,
    /// and per-endpoint metrics.
    fn name(&self) -> &'static str {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }

    async fn call(
        &self,
        req: Self::Request,
        ctx: &mut Context,
    ) -> Result<Self::Response, Error>;
}

impl Router {
    /// Registers a typed endpoint at `(method, pattern)` and records its
    /// path helper.
    pub fn endpoint<E: Endpoint>(
        &mut self,
        method: Method,
        pattern: &str,
        endpoint: E,
    ) -> Result<(), BootError> {
        let name = endpoint.name();
        register_path_helper(name, method.clone(), pattern);

        let endpoint = Arc::new(endpoint);
        let handler = BoxHandler::new(move |req: Request| {
            let endpoint = endpoint.clone();
            async move { dispatch::<E>(endpoint, req).await }
        });
        self.register_named(method, pattern, handler, name)
    }
}

async fn dispatch<E: Endpoint>(endpoint: Arc<E>, mut req: Request) -> StageResult {
    let is_json = req
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("application/json"))
        .unwrap_or(false);

    let params = Params::load(&mut req).await?;
    let dto: E::Request = if is_json {
        let bytes = body::buffer(&mut req).await?;
        contract::from_json_slice(&bytes)?
    } else {
        contract::from_params(&params)?
    };
    dto.validate().finish()?;

    let accept = req
        .headers()
        .get(http::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let remote_addr = req.extensions().get::<SocketAddr>().copied();

    let mut ctx = Context {
        params,
        headers: req.headers().clone(),
        method: req.method().clone(),
        path: req.uri().path().to_string(),
        remote_addr,
        status: None,
        response_headers: HeaderMap::new(),
    };

    let result = endpoint.call(dto, &mut ctx).await?;
    let mut response = negotiation::negotiate(accept.as_deref(), &result)?;

    if let Some(status) = ctx.status {
        *response.status_mut() = status;
    }
    for (name, value) in ctx.response_headers.iter() {
        response.headers_mut().insert(name.clone(), value.clone());
    }
    response.headers_mut().insert(
        ENDPOINT_HEADER,
        HeaderValue::from_str(endpoint.name())
            .unwrap_or_else(|_| HeaderValue::from_static("endpoint")),
    );
    Ok(response)
}

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

struct PathHelper {
    method: Method,
    pattern: String,
}

static PATH_HELPERS: Lazy<DashMap<String, PathHelper>> = Lazy::new(DashMap::new);

/// Records a named route pattern so templates can build URLs for it.
/// Populated automatically by endpoint registration.
pub fn register_path_helper(name: &str, method: Method, pattern: &str) {
    PATH_HELPERS.insert(
        name.to_string(),
        PathHelper {
            method,
            pattern: pattern.to_string(),
        },
    );
}

/// Clears the helper registry. Test seam.
pub fn reset_path_helpers() {
    PATH_HELPERS.clear();
}

/// Builds the URL for a named route by substituting placeholders.
///
/// Parameters that do not appear in the pattern are appended as a query
/// string. Returns `None` for unknown helpers or missing placeholders.
pub fn path_for(name: &str, params: &[(&str, &str)]) -> Option<String> {
    let helper = PATH_HELPERS.get(name)?;

    let mut leftovers: Vec<(&str, &str)> = Vec::new();
    let mut used = std::collections::HashSet::new();
    let mut segments = Vec::new();
    for segment in helper.pattern.split('/') {
        if let Some(key) = segment.strip_prefix(':') {
            let value = params.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)?;
            segments.push(urlencoding::encode(value).into_owned());
            used.insert(key.to_string());
        } else {
            segments.push(segment.to_string());
        }
    }
    for (k, v) in params {
        if !used.contains(*k) {
            leftovers.push((k, v));
        }
    }

    let mut url = segments.join("/");
    if url.is_empty() {
        url.push('/');
    }
    if !leftovers.is_empty() {
        let query: String = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(leftovers)
            .finish();
        url.push('?');
        url.push_str(&query);
    }
    Some(url)
}

/// Builds an anchor tag pointing at a named route.
pub fn link_to(name: &str, label: &str, params: &[(&str, &str)]) -> Option<String> {
    let href = path_for(name, params)?;
    Some(format!(
        "<a href=\"{href}\">{}</a>",
        html_escape(label)
    ))
}

/// Builds an opening form tag for a named route.
///
/// Browsers only submit GET and POST, so non-GET routes render a POST form
/// with a hidden `_method` field that the override stage rewrites before
/// routing.
pub fn form_for(name: &str, params: &[(&str, &str)]) -> Option<String> {
    let helper = PATH_HELPERS.get(name)?;
    let method = helper.method.clone();
    drop(helper);
    let action = path_for(name, params)?;

    if method == Method::GET {
        return Some(format!("<form action=\"{action}\" method=\"get\">"));
    }

    let mut form = format!("<form action=\"{action}\" method=\"post\">");
    if method != Method::POST {
        form.push_str(&format!(
            "<input type=\"hidden\" name=\"_method\" value=\"{}\">",
            method.as_str().to_ascii_lowercase()
        ));
    }
    Some(form)
}

fn html_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

// ---------------------------------------------------------------------------
// Method override
// ---------------------------------------------------------------------------

/// Rewrites POST requests carrying a form `_method` of PUT, PATCH, or DELETE
/// before routing. JSON bodies are never consulted; clients speaking JSON
/// send the real verb.
pub struct MethodOverride;

#[async_trait]
impl Stage for MethodOverride {
    async fn call(&self, mut req: Request, next: Next) -> StageResult {
        if req.method() == Method::POST && has_form_body(&req) {
            let body = BodyParams::load(&mut req).await?;
            if let Some(overridden) = body.form("_method") {
                match overridden.to_ascii_uppercase().as_str() {
                    "PUT" => *req.method_mut() = Method::PUT,
                    "PATCH" => *req.method_mut() = Method::PATCH,
                    "DELETE" => *req.method_mut() = Method::DELETE,
                    _ => {}
                }
            }
        }
        next.run(req).await
    }
}

fn has_form_body(req: &Request) -> bool {
    req.headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| {
            ct.starts_with("application/x-www-form-urlencoded")
                || ct.starts_with("multipart/form-data")
        })
        .unwrap_or(false)
}
