//! Structured error taxonomy mapped onto HTTP status families.
//!
//! Every recoverable framework error is an [`Error`]: a status-mapped kind
//! plus title, detail, optional offending parameter, field-level messages,
//! and identity metadata. Each instance gets a unique `error_id`, while the
//! `fingerprint` is a stable hash over the kind, the top backtrace frame, and
//! the digit-collapsed detail, so external monitoring can group recurring
//! failures. Server-side kinds (5xx) capture a backtrace at construction;
//! client kinds never do.
//!
//! Fatal boot-time misconfigurations (duplicate routes, empty pipelines) are
//! a separate [`BootError`] type: they abort startup instead of travelling
//! through the pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use http::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Status-mapped error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    Validation,
    TooManyRequests,
    Internal,
    ServiceUnavailable,
}

impl ErrorKind {
    /// HTTP status code for this kind.
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Validation => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Human-readable title for this kind.
    pub fn title(self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "Bad Request",
            ErrorKind::Unauthorized => "Unauthorized",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::NotFound => "Not Found",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::Validation => "Unprocessable Entity",
            ErrorKind::TooManyRequests => "Too Many Requests",
            ErrorKind::Internal => "Internal Server Error",
            ErrorKind::ServiceUnavailable => "Service Unavailable",
        }
    }

    fn is_server(self) -> bool {
        matches!(self, ErrorKind::Internal | ErrorKind::ServiceUnavailable)
    }
}

/// Structured, renderable request-processing error.
#[derive(Debug, thiserror::Error)]
#[error("{title}: {detail}")]
pub struct Error {
    kind: ErrorKind,
    title: String,
    detail: String,
    /// The offending field or parameter, when known.
    source_param: Option<String>,
    field_errors: BTreeMap<String, Vec<String>>,
    backtrace: Option<String>,
    error_id: String,
    fingerprint: String,
    timestamp: DateTime<Utc>,
}

impl Error {
    /// Creates an error of the given kind. Server kinds capture a backtrace.
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let backtrace = if kind.is_server() {
            Some(std::backtrace::Backtrace::force_capture().to_string())
        } else {
            None
        };
        let fingerprint = fingerprint_of(kind, backtrace.as_deref(), &detail);

        Self {
            kind,
            title: kind.title().to_string(),
            detail,
            source_param: None,
            field_errors: BTreeMap::new(),
            backtrace,
            error_id: Uuid::new_v4().to_string(),
            fingerprint,
            timestamp: Utc::now(),
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, detail)
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, detail)
    }

    pub fn forbidden(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, detail)
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, detail)
    }

    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, detail)
    }

    pub fn too_many_requests(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::TooManyRequests, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, detail)
    }

    pub fn service_unavailable(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServiceUnavailable, detail)
    }

    /// Validation failure (422) carrying the full field → messages map.
    pub fn validation(field_errors: BTreeMap<String, Vec<String>>) -> Self {
        let mut err = Self::new(ErrorKind::Validation, "validation failed");
        err.field_errors = field_errors;
        err
    }

    /// Wraps a caught panic payload as an internal server error.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unexpected panic".to_string());
        Self::new(ErrorKind::Internal, detail)
    }

    /// Records the offending field or parameter name.
    pub fn with_source(mut self, param: impl Into<String>) -> Self {
        self.source_param = Some(param.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn status(&self) -> StatusCode {
        self.kind.status()
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }

    pub fn source_param(&self) -> Option<&str> {
        self.source_param.as_deref()
    }

    pub fn field_errors(&self) -> &BTreeMap<String, Vec<String>> {
        &self.field_errors
    }

    pub fn backtrace_text(&self) -> Option<&str> {
        self.backtrace.as_deref()
    }

    /// Unique per-instance identifier, safe to show to end users.
    pub fn error_id(&self) -> &str {
        &self.error_id
    }

    /// Stable grouping hash shared by related error instances.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// MDN reference link for the mapped status code.
    pub fn link(&self) -> String {
        format!(
            "https://developer.mozilla.org/en-US/docs/Web/HTTP/Status/{}",
            self.status().as_u16()
        )
    }

    /// Serializes the wire body. Backtraces are only included when requested
    /// (development mode); production renderings never carry them.
    pub fn to_json_body(&self, include_backtrace: bool) -> String {
        let body = WireError {
            status: self.status().as_u16(),
            link: self.link(),
            title: &self.title,
            detail: &self.detail,
            source: self.source_param.as_deref(),
            errors: &self.field_errors,
            backtrace: if include_backtrace {
                self.backtrace
                    .as_deref()
                    .map(|b| b.lines().map(str::to_string).collect())
            } else {
                None
            },
        };
        // A plain struct with string keys cannot fail to serialize.
        serde_json::to_string(&body).unwrap_or_else(|_| "{}".to_string())
    }

    /// Plain-text rendering used for `text/plain` negotiation.
    pub fn to_text(&self, include_backtrace: bool) -> String {
        let mut out = format!(
            "{} {}\n{}\nerror_id: {}\n",
            self.status().as_u16(),
            self.title,
            self.detail,
            self.error_id
        );
        for (field, messages) in &self.field_errors {
            out.push_str(&format!("  {}: {}\n", field, messages.join(", ")));
        }
        if include_backtrace {
            if let Some(bt) = &self.backtrace {
                out.push('\n');
                out.push_str(bt);
            }
        }
        out
    }
}

/// JSON wire shape for rendered errors.
#[derive(Serialize)]
struct WireError<'a> {
    #[serde(rename = "Status")]
    status: u16,
    #[serde(rename = "Link")]
    link: String,
    #[serde(rename = "Title")]
    title: &'a str,
    #[serde(rename = "Detail")]
    detail: &'a str,
    #[serde(rename = "Source")]
    source: Option<&'a str>,
    #[serde(rename = "Errors")]
    errors: &'a BTreeMap<String, Vec<String>>,
    #[serde(rename = "Backtrace")]
    backtrace: Option<Vec<String>>,
}

/// Stable hash over kind, top frame, and the digit-collapsed detail.
fn fingerprint_of(kind: ErrorKind, backtrace: Option<&str>, detail: &str) -> String {
    let top_frame = backtrace
        .and_then(|bt| bt.lines().find(|l| l.trim_start().starts_with(char::is_numeric)))
        .unwrap_or("");

    let mut hasher = Sha256::new();
    hasher.update(kind.title().as_bytes());
    hasher.update(top_frame.as_bytes());
    hasher.update(collapse_digits(detail).as_bytes());
    let digest = hasher.finalize();

    let mut out = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Collapses digit runs so details differing only in ids share a fingerprint.
fn collapse_digits(detail: &str) -> String {
    let mut out = String::with_capacity(detail.len());
    let mut in_run = false;
    for ch in detail.chars() {
        if ch.is_ascii_digit() {
            if !in_run {
                out.push('#');
                in_run = true;
            }
        } else {
            in_run = false;
            out.push(ch);
        }
    }
    out
}

/// Fatal configuration errors surfaced at startup.
#[derive(Debug, thiserror::Error)]
pub enum BootError {
    /// The `(method, pattern)` pair was already registered.
    #[error("duplicate route: {method} {pattern} (handler {handler})")]
    DuplicateRoute {
        method: http::Method,
        pattern: String,
        handler: String,
    },

    /// `Pipeline::build` was called with no stages.
    #[error("cannot build an empty pipeline")]
    EmptyPipeline,
}
