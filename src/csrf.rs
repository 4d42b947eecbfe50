//! Cross-site request forgery protection.
//!
//! Three token strategies are supported, chosen at construction:
//!
//! | Strategy | Token | Verification |
//! |----------|-------|--------------|
//! | Synchronizer | random 32-byte url-safe value echoed in form/header | constant-time compare against the cookie |
//! | Signed double-submit (default) | `base:ts:base64url(HMAC-SHA256(secret, "base:ts"))` | constant-time compare, then signature and age checks |
//! | Double-submit | random token mirrored in the cookie | constant-time compare against the cookie |
//!
//! Safe methods, configured route prefixes, JSON bodies, and requests
//! carrying a configured AJAX header all bypass verification. Submitted
//! tokens are looked for in the header first, then the form body (read from
//! the shared body buffer, never consuming it), then the query string.
//! Cookies written by this module are `HttpOnly`, `SameSite=Strict`, and
//! `Secure` whenever the request arrived over HTTPS.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use cookie::{Cookie, SameSite};
use hmac::{Hmac, Mac};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::{
    error::Error,
    params::BodyParams,
    pipeline::{Next, Stage},
    types::{Request, StageResult, TlsConnection},
};

type HmacSha256 = Hmac<Sha256>;

/// Token strategy, chosen at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrfStrategy {
    Synchronizer,
    SignedDoubleSubmit,
    DoubleSubmit,
}

/// CSRF protection settings.
#[derive(Debug, Clone)]
pub struct CsrfConfig {
    pub strategy: CsrfStrategy,
    /// HMAC key for the signed strategy.
    pub secret: String,
    pub cookie_name: String,
    pub header_name: String,
    pub field_name: String,
    /// Cookie lifetime; also the maximum accepted signed-token age.
    pub cookie_max_age: Duration,
    /// Route prefixes that bypass verification.
    pub skip_routes: Vec<String>,
    /// Headers whose presence marks a request as a preflighted AJAX call.
    pub ajax_headers: Vec<String>,
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            strategy: CsrfStrategy::SignedDoubleSubmit,
            secret: random_base(),
            cookie_name: "csrf_token".to_string(),
            header_name: "x-csrf-token".to_string(),
            field_name: "_csrf".to_string(),
            cookie_max_age: Duration::from_secs(86_400),
            skip_routes: Vec::new(),
            ajax_headers: vec!["x-requested-with".to_string()],
        }
    }
}

/// 32 random bytes, base64url without padding.
fn random_base() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// CSRF engine and pipeline stage.
#[derive(Clone)]
pub struct Csrf {
    config: Arc<CsrfConfig>,
}

impl Csrf {
    pub fn new(config: CsrfConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &CsrfConfig {
        &self.config
    }

    /// Generates a fresh token for the configured strategy.
    pub fn generate_token(&self) -> String {
        match self.config.strategy {
            CsrfStrategy::Synchronizer | CsrfStrategy::DoubleSubmit => random_base(),
            CsrfStrategy::SignedDoubleSubmit => {
                let base = random_base();
                let ts = unix_now();
                let sig = self.sign(&base, ts);
                format!("{base}:{ts}:{sig}")
            }
        }
    }

    fn sign(&self, base: &str, ts: u64) -> String {
        // The key is framework-chosen, so it can never be rejected for size.
        let mut mac = HmacSha256::new_from_slice(self.config.secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(format!("{base}:{ts}").as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    /// Verifies a submitted token against the cookie-held one.
    pub fn verify(&self, submitted: &str, cookie: &str) -> bool {
        self.verify_at(submitted, cookie, unix_now())
    }

    /// Verification with an explicit clock, so age handling is testable.
    pub(crate) fn verify_at(&self, submitted: &str, cookie: &str, now_unix: u64) -> bool {
        if !constant_time_eq(submitted, cookie) {
            return false;
        }

        match self.config.strategy {
            CsrfStrategy::Synchronizer | CsrfStrategy::DoubleSubmit => true,
            CsrfStrategy::SignedDoubleSubmit => {
                let mut parts = submitted.splitn(3, ':');
                let (Some(base), Some(ts), Some(sig)) =
                    (parts.next(), parts.next(), parts.next())
                else {
                    return false;
                };
                let Ok(ts_value) = ts.parse::<u64>() else {
                    return false;
                };
                let age = now_unix.saturating_sub(ts_value);
                if age > self.config.cookie_max_age.as_secs() {
                    return false;
                }
                constant_time_eq(&self.sign(base, ts_value), sig)
            }
        }
    }

    fn is_bypassed(&self, req: &Request) -> bool {
        let path = req.uri().path();
        if self
            .config
            .skip_routes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
        {
            return true;
        }

        let json_body = req
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("application/json"))
            .unwrap_or(false);
        if json_body {
            return true;
        }

        self.config
            .ajax_headers
            .iter()
            .any(|name| req.headers().contains_key(name.as_str()))
    }

    fn cookie_token(&self, req: &Request) -> Option<String> {
        let header = req.headers().get(http::header::COOKIE)?.to_str().ok()?;
        for cookie in Cookie::split_parse(header.to_string()).flatten() {
            if cookie.name() == self.config.cookie_name {
                return Some(cookie.value().to_string());
            }
        }
        None
    }

    /// Submitted-token extraction: header, then form field, then query.
    async fn submitted_token(&self, req: &mut Request) -> Result<Option<String>, Error> {
        if let Some(value) = req
            .headers()
            .get(self.config.header_name.as_str())
            .and_then(|v| v.to_str().ok())
        {
            return Ok(Some(value.to_string()));
        }

        let body = BodyParams::load(req).await?;
        if let Some(value) = body.form(&self.config.field_name) {
            return Ok(Some(value.to_string()));
        }

        let from_query = req.uri().query().and_then(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .find(|(k, _)| k == self.config.field_name.as_str())
                .map(|(_, v)| v.into_owned())
        });
        Ok(from_query)
    }

    fn build_cookie(&self, token: &str, secure: bool) -> String {
        let max_age = cookie::time::Duration::seconds(self.config.cookie_max_age.as_secs() as i64);
        Cookie::build((self.config.cookie_name.clone(), token.to_string()))
            .path("/")
            .http_only(true)
            .same_site(SameSite::Strict)
            .secure(secure)
            .max_age(max_age)
            .build()
            .to_string()
    }
}

/// True when the request arrived over HTTPS, either on a TLS listener or
/// behind a proxy that set `X-Forwarded-Proto`.
pub fn is_https(req: &Request) -> bool {
    if req.extensions().get::<TlsConnection>().is_some() {
        return true;
    }
    req.headers()
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("https"))
        .unwrap_or(false)
}

/// Defense-in-depth origin check: compares the `Origin` header (falling back
/// to `Referer`) against the scheme and host the request was addressed to.
pub fn validate_origin(req: &Request) -> bool {
    let scheme = if is_https(req) { "https" } else { "http" };
    let Some(host) = req
        .headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let expected = format!("{scheme}://{host}");

    let claimed = req
        .headers()
        .get(http::header::ORIGIN)
        .or_else(|| req.headers().get(http::header::REFERER))
        .and_then(|v| v.to_str().ok());
    let Some(claimed) = claimed else {
        return false;
    };

    match url::Url::parse(claimed) {
        Ok(parsed) => {
            let mut origin = format!("{}://{}", parsed.scheme(), parsed.host_str().unwrap_or(""));
            if let Some(port) = parsed.port() {
                origin.push_str(&format!(":{port}"));
            }
            origin == expected
        }
        Err(_) => false,
    }
}

#[async_trait]
impl Stage for Csrf {
    async fn call(&self, mut req: Request, next: Next) -> StageResult {
        let method = req.method();
        let safe = method == http::Method::GET
            || method == http::Method::HEAD
            || method == http::Method::OPTIONS
            || method == http::Method::TRACE;

        if safe {
            // Issue a token cookie on safe requests so forms can echo it.
            let needs_cookie = self.cookie_token(&req).is_none();
            let secure = is_https(&req);
            let mut res = next.run(req).await?;
            if needs_cookie {
                let cookie = self.build_cookie(&self.generate_token(), secure);
                if let Ok(value) = cookie.parse() {
                    res.headers_mut().append(http::header::SET_COOKIE, value);
                }
            }
            return Ok(res);
        }

        if self.is_bypassed(&req) {
            return next.run(req).await;
        }

        let cookie = self.cookie_token(&req);
        let submitted = self.submitted_token(&mut req).await?;
        match (cookie, submitted) {
            (Some(cookie), Some(submitted)) if self.verify(&submitted, &cookie) => {
                next.run(req).await
            }
            _ => Err(Error::forbidden("CSRF token missing or invalid")),
        }
    }
}

// ---------------------------------------------------------------------------
// Process-wide default instance
// ---------------------------------------------------------------------------

static DEFAULT: Lazy<RwLock<Option<Csrf>>> = Lazy::new(|| RwLock::new(None));

/// Returns the process-wide CSRF instance, initializing it on first use
/// with the default configuration (double-checked under the lock).
pub fn default_instance() -> Csrf {
    if let Some(instance) = DEFAULT.read().clone() {
        return instance;
    }
    let mut guard = DEFAULT.write();
    if let Some(instance) = guard.clone() {
        return instance;
    }
    let instance = Csrf::new(CsrfConfig::default());
    *guard = Some(instance.clone());
    instance
}

/// Replaces the process-wide instance. Call during startup.
pub fn install_default(csrf: Csrf) {
    *DEFAULT.write() = Some(csrf);
}

/// Drops the process-wide instance. Test seam.
pub fn reset_default() {
    *DEFAULT.write() = None;
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
