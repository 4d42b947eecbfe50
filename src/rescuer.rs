//! The rescuer: first stage in the pipeline, last line of defense.
//!
//! Everything the inner stages produce flows through here. Structured
//! [`Error`]s are rendered with content negotiation, preserving their
//! status. Panics are caught, wrapped as internal server errors, and logged
//! with their backtrace. In development mode the HTML rendering is a debug
//! page with the backtrace, request headers, and process environment; in
//! production only the public fields (title, detail, error id) ever leave
//! the process.

use async_trait::async_trait;
use futures_util::FutureExt;

use crate::{
    body::HibanaBody,
    config,
    error::Error,
    negotiation::{preferred_error_format, ErrorFormat},
    pipeline::{Next, Stage},
    types::{Request, Response, StageResult},
};

/// Error-rendering stage.
pub struct Rescuer {
    dev_mode: bool,
    templates: Option<std::sync::Arc<crate::templates::Templates>>,
}

impl Rescuer {
    /// Mode taken from the active configuration.
    pub fn new() -> Self {
        Self {
            dev_mode: config::current().mode.is_development(),
            templates: None,
        }
    }

    pub fn development() -> Self {
        Self {
            dev_mode: true,
            templates: None,
        }
    }

    pub fn production() -> Self {
        Self {
            dev_mode: false,
            templates: None,
        }
    }

    /// Renders the development exception page through the configured
    /// `ERROR_TEMPLATE` instead of the built-in page, when one is set.
    pub fn with_templates(mut self, templates: std::sync::Arc<crate::templates::Templates>) -> Self {
        self.templates = Some(templates);
        self
    }

    fn templated_page(&self, err: &Error, context: &RequestSnapshot) -> Option<String> {
        let templates = self.templates.as_ref()?;
        let name = config::current().error_template.clone()?;
        templates
            .render(
                &name,
                serde_json::json!({
                    "status": err.status().as_u16(),
                    "title": err.title(),
                    "detail": err.detail(),
                    "error_id": err.error_id(),
                    "fingerprint": err.fingerprint(),
                    "backtrace": err.backtrace_text(),
                    "field_errors": err.field_errors(),
                    "method": context.method,
                    "path": context.path,
                }),
            )
            .ok()
    }

    fn render(&self, err: &Error, format: ErrorFormat, context: &RequestSnapshot) -> Response {
        let (content_type, body) = match format {
            ErrorFormat::Json => (
                "application/json",
                err.to_json_body(self.dev_mode),
            ),
            ErrorFormat::Text => ("text/plain", err.to_text(self.dev_mode)),
            ErrorFormat::Html => (
                "text/html",
                if self.dev_mode {
                    self.templated_page(err, context)
                        .unwrap_or_else(|| debug_page(err, context))
                } else {
                    public_page(err)
                },
            ),
        };

        let mut res = Response::new(HibanaBody::from(body));
        *res.status_mut() = err.status();
        if let Ok(value) = content_type.parse() {
            res.headers_mut().insert(http::header::CONTENT_TYPE, value);
        }
        res
    }
}

impl Default for Rescuer {
    fn default() -> Self {
        Self::new()
    }
}

/// Request details captured before the inner stages consume the request,
/// used by the development debug page.
struct RequestSnapshot {
    method: String,
    path: String,
    query: Option<String>,
    headers: Vec<(String, String)>,
    accept: Option<String>,
}

impl RequestSnapshot {
    fn of(req: &Request) -> Self {
        Self {
            method: req.method().to_string(),
            path: req.uri().path().to_string(),
            query: req.uri().query().map(str::to_string),
            headers: req
                .headers()
                .iter()
                .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
                .collect(),
            accept: req
                .headers()
                .get(http::header::ACCEPT)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        }
    }
}

#[async_trait]
impl Stage for Rescuer {
    async fn call(&self, req: Request, next: Next) -> StageResult {
        let snapshot = RequestSnapshot::of(&req);

        let outcome = std::panic::AssertUnwindSafe(next.run(req))
            .catch_unwind()
            .await;

        let err = match outcome {
            Ok(Ok(res)) => return Ok(res),
            Ok(Err(err)) => err,
            Err(panic) => Error::from_panic(panic),
        };

        if err.status().is_server_error() {
            tracing::error!(
                error_id = err.error_id(),
                fingerprint = err.fingerprint(),
                detail = err.detail(),
                backtrace = err.backtrace_text().unwrap_or("-"),
                "request failed"
            );
        } else {
            tracing::debug!(
                error_id = err.error_id(),
                status = err.status().as_u16(),
                detail = err.detail(),
                "request rejected"
            );
        }

        let format = preferred_error_format(snapshot.accept.as_deref());
        Ok(self.render(&err, format, &snapshot))
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Production HTML rendering: public fields only.
fn public_page(err: &Error) -> String {
    format!(
        "<!DOCTYPE html>\n<html><head><title>{status} {title}</title></head>\n\
         <body><h1>{status} {title}</h1><p>{detail}</p>\n\
         <p><small>error id: {id}</small></p></body></html>\n",
        status = err.status().as_u16(),
        title = escape(err.title()),
        detail = escape(err.detail()),
        id = err.error_id(),
    )
}

/// Development HTML rendering: backtrace, request, and environment.
fn debug_page(err: &Error, context: &RequestSnapshot) -> String {
    let mut page = format!(
        "<!DOCTYPE html>\n<html><head><title>{status} {title}</title></head><body>\n\
         <h1>{status} {title}</h1>\n<p>{detail}</p>\n\
         <p><small>error id: {id} &middot; fingerprint: {fingerprint}</small></p>\n\
         <h2>Request</h2>\n<p><code>{method} {path}{query}</code></p>\n",
        status = err.status().as_u16(),
        title = escape(err.title()),
        detail = escape(err.detail()),
        id = err.error_id(),
        fingerprint = err.fingerprint(),
        method = escape(&context.method),
        path = escape(&context.path),
        query = context
            .query
            .as_deref()
            .map(|q| format!("?{}", escape(q)))
            .unwrap_or_default(),
    );

    if !err.field_errors().is_empty() {
        page.push_str("<h2>Field errors</h2>\n<ul>\n");
        for (field, messages) in err.field_errors() {
            page.push_str(&format!(
                "<li><strong>{}</strong>: {}</li>\n",
                escape(field),
                escape(&messages.join(", "))
            ));
        }
        page.push_str("</ul>\n");
    }

    if let Some(backtrace) = err.backtrace_text() {
        page.push_str(&format!(
            "<h2>Backtrace</h2>\n<pre>{}</pre>\n",
            escape(backtrace)
        ));
    }

    page.push_str("<h2>Headers</h2>\n<table>\n");
    for (name, value) in &context.headers {
        page.push_str(&format!(
            "<tr><td>{}</td><td>{}</td></tr>\n",
            escape(name),
            escape(value)
        ));
    }
    page.push_str("</table>\n<h2>Environment</h2>\n<table>\n");
    for (key, value) in std::env::vars() {
        page.push_str(&format!(
            "<tr><td>{}</td><td>{}</td></tr>\n",
            escape(&key),
            escape(&value)
        ));
    }
    page.push_str("</table>\n</body></html>\n");
    page
}
