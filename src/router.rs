//! HTTP request routing: pattern registration, radix matching, and dispatch.
//!
//! Routes pair an HTTP method with a path pattern made of literal segments
//! and `:name` placeholders (`/users/:id`). Matching is radix-tree based, so
//! lookup cost is proportional to the path length and literal segments always
//! win over placeholders. Registering `GET` implicitly registers `HEAD` with
//! the same handler, and any method other than TRACE/CONNECT/OPTIONS/HEAD
//! implicitly registers an `OPTIONS` stub answering with the `Allow` set for
//! that pattern. Duplicate `(method, pattern)` registrations fail at boot
//! with a typed error.
//!
//! WebSocket channels live in their own table under a synthetic `/ws` prefix
//! and are consulted only for upgrade requests.
//!
//! # Examples
//!
//! ```rust
//! use hibana::router::Router;
//! use hibana::body::HibanaBody;
//! use hibana::types::Response;
//! use http::Method;
//!
//! let mut router = Router::new();
//! router
//!     .at(Method::GET, "/users/:id", |_req| async {
//!         Ok(Response::new(HibanaBody::from("user page")))
//!     })
//!     .unwrap();
//!
//! let (_handler, params) = router.find(&Method::GET, "/users/42").unwrap();
//! assert_eq!(params.get("id").map(String::as_str), Some("42"));
//! ```

use std::{collections::HashMap, future::Future, sync::Arc};

use async_trait::async_trait;
use dashmap::DashMap;
use http::Method;
use parking_lot::Mutex;

use crate::{
    body::HibanaBody,
    error::{BootError, Error},
    handler::BoxHandler,
    params::PathParams,
    pipeline::{Next, Stage},
    types::{Request, StageResult},
};

/// A matched route: the handler plus the extracted path parameters, shared
/// so cache hits hand them out without copying.
pub type RouteMatch = (BoxHandler, Arc<HashMap<String, String>>);

/// Bounded memo of recent `(method, path)` lookups.
///
/// The map is keyed per method so lookups borrow the method and the path
/// as-is; together with the `Arc`-shared parameter maps, a cache hit
/// allocates nothing. The route table is immutable after boot, so cached
/// results never go stale. The cache is cleared wholesale when it reaches
/// capacity.
struct RouteCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
}

#[derive(Default)]
struct CacheInner {
    by_method: HashMap<Method, HashMap<String, RouteMatch>>,
    len: usize,
}

impl RouteCache {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            capacity,
        }
    }

    fn get(&self, method: &Method, path: &str) -> Option<RouteMatch> {
        self.inner.lock().by_method.get(method)?.get(path).cloned()
    }

    fn insert(&self, method: Method, path: String, value: RouteMatch) {
        let mut inner = self.inner.lock();
        if inner.len >= self.capacity {
            inner.by_method.clear();
            inner.len = 0;
        }
        if inner
            .by_method
            .entry(method)
            .or_default()
            .insert(path, value)
            .is_none()
        {
            inner.len += 1;
        }
    }
}

/// Method + path router with implicit HEAD/OPTIONS and a channel table.
pub struct Router {
    explicit: HashMap<Method, matchit::Router<BoxHandler>>,
    implicit: HashMap<Method, matchit::Router<BoxHandler>>,
    registered: std::collections::HashSet<(Method, String)>,
    implicit_registered: std::collections::HashSet<(Method, String)>,
    /// Methods registered per pattern, consulted by the OPTIONS stubs.
    allowed: Arc<DashMap<String, Vec<Method>>>,
    channels: matchit::Router<BoxHandler>,
    channel_patterns: std::collections::HashSet<String>,
    cache: RouteCache,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            explicit: HashMap::new(),
            implicit: HashMap::new(),
            registered: std::collections::HashSet::new(),
            implicit_registered: std::collections::HashSet::new(),
            allowed: Arc::new(DashMap::new()),
            channels: matchit::Router::new(),
            channel_patterns: std::collections::HashSet::new(),
            cache: RouteCache::new(1024),
        }
    }

    /// Registers a handler for `(method, pattern)`.
    ///
    /// Fails with [`BootError::DuplicateRoute`] when the pair was already
    /// registered. Implicit HEAD/OPTIONS registrations are derived here and
    /// never themselves fail or shadow explicit ones.
    pub fn register(
        &mut self,
        method: Method,
        pattern: &str,
        handler: BoxHandler,
    ) -> Result<(), BootError> {
        self.register_named(method, pattern, handler, "handler")
    }

    /// Like [`register`](Self::register) but records a handler name for the
    /// duplicate-route diagnostic.
    pub fn register_named(
        &mut self,
        method: Method,
        pattern: &str,
        handler: BoxHandler,
        name: &str,
    ) -> Result<(), BootError> {
        let pattern = normalize_pattern(pattern);
        let key = (method.clone(), pattern.clone());
        if self.registered.contains(&key) {
            return Err(BootError::DuplicateRoute {
                method,
                pattern,
                handler: name.to_string(),
            });
        }

        let tree = self.explicit.entry(method.clone()).or_default();
        tree.insert(to_matchit(&pattern), handler.clone())
            .map_err(|_| BootError::DuplicateRoute {
                method: method.clone(),
                pattern: pattern.clone(),
                handler: name.to_string(),
            })?;
        self.registered.insert(key);
        self.allowed
            .entry(pattern.clone())
            .or_default()
            .push(method.clone());

        if method == Method::GET {
            self.register_implicit(Method::HEAD, &pattern, handler.clone());
        }
        let no_options_stub = method == Method::TRACE
            || method == Method::CONNECT
            || method == Method::OPTIONS
            || method == Method::HEAD;
        if !no_options_stub {
            let stub = options_stub(self.allowed.clone(), pattern.clone());
            self.register_implicit(Method::OPTIONS, &pattern, stub);
        }

        Ok(())
    }

    fn register_implicit(&mut self, method: Method, pattern: &str, handler: BoxHandler) {
        let key = (method.clone(), pattern.to_string());
        if self.implicit_registered.contains(&key) {
            return;
        }
        let tree = self.implicit.entry(method).or_default();
        if tree.insert(to_matchit(pattern), handler).is_ok() {
            self.implicit_registered.insert(key);
        }
    }

    /// Registers an async function as the handler for `(method, pattern)`.
    pub fn at<F, Fut>(&mut self, method: Method, pattern: &str, f: F) -> Result<(), BootError>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StageResult> + Send + 'static,
    {
        self.register(method, pattern, BoxHandler::new(f))
    }

    /// Registers a WebSocket channel under the synthetic `/ws` prefix.
    pub fn register_channel(
        &mut self,
        pattern: &str,
        handler: BoxHandler,
    ) -> Result<(), BootError> {
        let pattern = normalize_pattern(pattern);
        if self.channel_patterns.contains(&pattern) {
            return Err(BootError::DuplicateRoute {
                method: Method::GET,
                pattern: format!("/ws{pattern}"),
                handler: "channel".to_string(),
            });
        }
        self.channels
            .insert(format!("/ws{}", to_matchit(&pattern)), handler)
            .map_err(|_| BootError::DuplicateRoute {
                method: Method::GET,
                pattern: format!("/ws{pattern}"),
                handler: "channel".to_string(),
            })?;
        self.channel_patterns.insert(pattern);
        Ok(())
    }

    /// Looks up the handler and path parameters for `(method, path)`.
    pub fn find(&self, method: &Method, path: &str) -> Option<RouteMatch> {
        let path = strip_trailing_slash(path);

        if let Some(hit) = self.cache.get(method, path) {
            return Some(hit);
        }

        let (handler, params) = self
            .lookup_in(&self.explicit, method, path)
            .or_else(|| self.lookup_in(&self.implicit, method, path))?;
        let matched = (handler, Arc::new(params));

        self.cache
            .insert(method.clone(), path.to_string(), matched.clone());
        Some(matched)
    }

    fn lookup_in(
        &self,
        trees: &HashMap<Method, matchit::Router<BoxHandler>>,
        method: &Method,
        path: &str,
    ) -> Option<(BoxHandler, HashMap<String, String>)> {
        let tree = trees.get(method)?;
        let matched = tree.at(path).ok()?;
        let params = matched
            .params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Some((matched.value.clone(), params))
    }

    /// Looks up a channel handler for an upgrade request path.
    pub fn find_channel(&self, path: &str) -> Option<RouteMatch> {
        let path = strip_trailing_slash(path);
        let ws_path = format!("/ws{path}");
        let matched = self.channels.at(&ws_path).ok()?;
        let params = matched
            .params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Some((matched.value.clone(), Arc::new(params)))
    }

    /// Methods registered for a normalized pattern.
    pub fn allowed_methods(&self, pattern: &str) -> Vec<Method> {
        self.allowed
            .get(&normalize_pattern(pattern))
            .map(|m| m.value().clone())
            .unwrap_or_default()
    }
}

/// Terminal pipeline stage that dispatches matched requests.
pub struct Dispatch {
    router: Arc<Router>,
}

impl Dispatch {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl Stage for Dispatch {
    async fn call(&self, mut req: Request, _next: Next) -> StageResult {
        if is_websocket_upgrade(&req) {
            if let Some((handler, params)) = self.router.find_channel(req.uri().path()) {
                req.extensions_mut().insert(PathParams(params));
                return handler.call(req).await;
            }
        }

        match self.router.find(req.method(), req.uri().path()) {
            Some((handler, params)) => {
                req.extensions_mut().insert(PathParams(params));
                handler.call(req).await
            }
            None => Err(Error::not_found(format!(
                "no route matches {} {}",
                req.method(),
                req.uri().path()
            ))),
        }
    }
}

/// True when the request carries WebSocket upgrade headers.
pub fn is_websocket_upgrade(req: &Request) -> bool {
    let upgrade = req
        .headers()
        .get(http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection = req
        .headers()
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .any(|t| t.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false);
    upgrade && connection
}

fn options_stub(allowed: Arc<DashMap<String, Vec<Method>>>, pattern: String) -> BoxHandler {
    BoxHandler::new(move |_req: Request| {
        let allowed = allowed.clone();
        let pattern = pattern.clone();
        async move {
            let mut methods: Vec<String> = allowed
                .get(&pattern)
                .map(|m| m.iter().map(|m| m.to_string()).collect())
                .unwrap_or_default();
            methods.push("OPTIONS".to_string());
            methods.sort();
            methods.dedup();

            let mut res = http::Response::builder()
                .status(http::StatusCode::NO_CONTENT)
                .body(HibanaBody::empty())
                .map_err(|e| Error::internal(e.to_string()))?;
            res.headers_mut().insert(
                http::header::ALLOW,
                methods
                    .join(", ")
                    .parse()
                    .map_err(|_| Error::internal("invalid Allow header"))?,
            );
            Ok(res)
        }
    })
}

/// Converts `:name` placeholders to the radix tree's `{name}` syntax.
fn to_matchit(pattern: &str) -> String {
    pattern
        .split('/')
        .map(|segment| {
            if let Some(name) = segment.strip_prefix(':') {
                format!("{{{name}}}")
            } else {
                segment.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn normalize_pattern(pattern: &str) -> String {
    strip_trailing_slash(pattern).to_string()
}

fn strip_trailing_slash(path: &str) -> &str {
    if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path
    }
}
