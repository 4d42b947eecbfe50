//! Full-stack pipeline tests: every stage wired the way a real application
//! boots them, driven end to end without a network listener.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::{Method, StatusCode};
use http_body_util::BodyExt;
use serde::Deserialize;

use hibana::body::HibanaBody;
use hibana::contract::{Contract, Rules};
use hibana::csrf::{Csrf, CsrfConfig};
use hibana::endpoint::{Context, Endpoint, MethodOverride};
use hibana::error::Error;
use hibana::handler::BoxHandler;
use hibana::handlers::{AccessLog, RequestId};
use hibana::metrics::MetricsEngine;
use hibana::monitor::PerformanceMonitor;
use hibana::negotiation::{json_of, MultiFormat, Renderable};
use hibana::pipeline::Pipeline;
use hibana::rescuer::Rescuer;
use hibana::router::{Dispatch, Router};
use hibana::throttle::{Throttle, ThrottleConfig};
use hibana::types::{Request, Response};

#[derive(Deserialize)]
struct ShowUser {
    id: u64,
}

impl Contract for ShowUser {}

struct UserCard {
    id: u64,
}

impl Renderable for UserCard {
    fn natural(&self) -> mime::Mime {
        mime::TEXT_HTML
    }

    fn render(&self) -> Result<String, Error> {
        Ok(format!("<article>user {}</article>", self.id))
    }
}

impl MultiFormat for UserCard {
    fn html(&self) -> Option<Result<String, Error>> {
        Some(self.render())
    }

    fn json(&self) -> Option<Result<String, Error>> {
        Some(json_of(&serde_json::json!({ "id": self.id })))
    }
}

struct ShowUserEndpoint;

#[async_trait]
impl Endpoint for ShowUserEndpoint {
    type Request = ShowUser;
    type Response = UserCard;

    fn name(&self) -> &'static str {
        "users.show"
    }

    async fn call(&self, req: ShowUser, _ctx: &mut Context) -> Result<UserCard, Error> {
        if req.id == 0 {
            return Err(Error::not_found("no such user"));
        }
        Ok(UserCard { id: req.id })
    }
}

#[derive(Deserialize)]
struct CreateUser {
    name: String,
}

impl Contract for CreateUser {
    fn validate(&self) -> Rules {
        let mut rules = Rules::new();
        rules.presence("name", &self.name);
        rules.length("name", &self.name, Some(2), Some(40));
        rules
    }
}

struct CreateUserEndpoint;

#[async_trait]
impl Endpoint for CreateUserEndpoint {
    type Request = CreateUser;
    type Response = String;

    fn name(&self) -> &'static str {
        "users.create"
    }

    async fn call(&self, req: CreateUser, ctx: &mut Context) -> Result<String, Error> {
        ctx.set_status(StatusCode::CREATED);
        Ok(format!("created {}", req.name))
    }
}

struct App {
    handler: BoxHandler,
    metrics: Arc<MetricsEngine>,
    csrf: Csrf,
}

fn app(throttle: ThrottleConfig) -> App {
    let mut router = Router::new();
    router
        .endpoint(Method::GET, "/users/:id", ShowUserEndpoint)
        .unwrap();
    router
        .endpoint(Method::POST, "/users", CreateUserEndpoint)
        .unwrap();

    let metrics = Arc::new(MetricsEngine::new());
    let csrf = Csrf::new(CsrfConfig {
        secret: "integration-secret".to_string(),
        ..CsrfConfig::default()
    });

    let handler = Pipeline::new()
        .with(Rescuer::production())
        .with(RequestId)
        .with(AccessLog::new())
        .with(Throttle::new(throttle))
        .with(csrf.clone())
        .with(PerformanceMonitor::new(metrics.clone()))
        .with(MethodOverride)
        .with(Dispatch::new(Arc::new(router)))
        .build()
        .unwrap();

    App {
        handler,
        metrics,
        csrf,
    }
}

fn relaxed_throttle() -> ThrottleConfig {
    ThrottleConfig {
        interval: Duration::from_secs(60),
        duration: Duration::from_secs(60),
        threshold: 10_000,
        whitelist: Vec::new(),
        blacklist: Vec::new(),
    }
}

fn addr(last: u8) -> SocketAddr {
    SocketAddr::new(IpAddr::from([10, 0, 0, last]), 40_000)
}

fn get(path: &str, accept: &str, from: SocketAddr) -> Request {
    let mut req = http::Request::builder()
        .method(Method::GET)
        .uri(path)
        .header("accept", accept)
        .body(HibanaBody::empty())
        .unwrap();
    req.extensions_mut().insert(from);
    req
}

async fn body_string(res: Response) -> String {
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn routed_requests_negotiate_and_carry_identity_headers() {
    let app = app(relaxed_throttle());

    let res = app
        .handler
        .call(get("/users/42", "application/json;q=0.9, text/html;q=0.8", addr(1)))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["content-type"], "application/json");
    assert_eq!(res.headers()["x-endpoint"], "users.show");
    assert!(res.headers().contains_key("x-request-id"));

    let body: serde_json::Value = serde_json::from_str(&body_string(res).await).unwrap();
    assert_eq!(body["id"], 42);

    // The same endpoint serves HTML when the client prefers it.
    let res = app
        .handler
        .call(get("/users/42", "text/html, application/json;q=0.5", addr(1)))
        .await
        .unwrap();
    assert_eq!(res.headers()["content-type"], "text/html");
    assert_eq!(body_string(res).await, "<article>user 42</article>");
}

#[tokio::test]
async fn unmatched_routes_render_the_error_wire_format() {
    let app = app(relaxed_throttle());

    let res = app
        .handler
        .call(get("/nope", "application/json", addr(2)))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let body: serde_json::Value = serde_json::from_str(&body_string(res).await).unwrap();
    assert_eq!(body["Status"], 404);
    assert_eq!(
        body["Link"],
        "https://developer.mozilla.org/en-US/docs/Web/HTTP/Status/404"
    );
    assert!(body["Backtrace"].is_null());
}

#[tokio::test]
async fn business_errors_keep_their_status_through_the_stack() {
    let app = app(relaxed_throttle());

    let res = app
        .handler
        .call(get("/users/0", "application/json", addr(3)))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = serde_json::from_str(&body_string(res).await).unwrap();
    assert_eq!(body["Detail"], "no such user");
}

#[tokio::test]
async fn posts_need_a_csrf_token_and_validation_passes_through() {
    let app = app(relaxed_throttle());
    let token = app.csrf.generate_token();

    // No token: the rescuer renders the 403.
    let mut req = http::Request::builder()
        .method(Method::POST)
        .uri("/users")
        .header("accept", "application/json")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(HibanaBody::from("name=ada"))
        .unwrap();
    req.extensions_mut().insert(addr(4));
    let res = app.handler.call(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    // Token present: the contract is validated and the endpoint runs.
    let mut req = http::Request::builder()
        .method(Method::POST)
        .uri("/users")
        .header("accept", "text/plain")
        .header("content-type", "application/x-www-form-urlencoded")
        .header("cookie", format!("csrf_token={token}"))
        .body(HibanaBody::from(format!("name=ada&_csrf={token}")))
        .unwrap();
    req.extensions_mut().insert(addr(4));
    let res = app.handler.call(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    assert_eq!(body_string(res).await, "created ada");

    // Validation failure surfaces as 422 with the field map.
    let mut req = http::Request::builder()
        .method(Method::POST)
        .uri("/users")
        .header("accept", "application/json")
        .header("content-type", "application/x-www-form-urlencoded")
        .header("cookie", format!("csrf_token={token}"))
        .body(HibanaBody::from(format!("name=a&_csrf={token}")))
        .unwrap();
    req.extensions_mut().insert(addr(4));
    let res = app.handler.call(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: serde_json::Value = serde_json::from_str(&body_string(res).await).unwrap();
    assert!(body["Errors"]["name"].is_array());
}

#[tokio::test]
async fn bursts_past_the_threshold_are_throttled_and_released() {
    let app = app(ThrottleConfig {
        interval: Duration::from_secs(5),
        duration: Duration::from_millis(120),
        threshold: 3,
        whitelist: Vec::new(),
        blacklist: Vec::new(),
    });

    for _ in 0..3 {
        let res = app
            .handler
            .call(get("/users/1", "application/json", addr(5)))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    let res = app
        .handler
        .call(get("/users/1", "application/json", addr(5)))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(res.headers()["content-length"], "0");
    assert!(res.headers().contains_key("retry-after"));

    // Another client is unaffected.
    let res = app
        .handler
        .call(get("/users/1", "application/json", addr(6)))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    // After the block expires the original client is released.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let res = app
        .handler
        .call(get("/users/1", "application/json", addr(5)))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn every_request_lands_in_the_metrics_arena() {
    let app = app(relaxed_throttle());

    for id in 1..=5 {
        let path = format!("/users/{id}");
        app.handler
            .call(get(&path, "application/json", addr(7)))
            .await
            .unwrap();
    }
    app.handler
        .call(get("/missing", "application/json", addr(7)))
        .await
        .unwrap();

    let stats = app.metrics.aggregate(None);
    assert_eq!(stats.count, 6);
    assert_eq!(stats.error_count, 1);

    let endpoint = app.metrics.endpoint_stats("users.show", None);
    assert_eq!(endpoint.count, 5);
    assert_eq!(endpoint.error_count, 0);
}
