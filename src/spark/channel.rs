//! The Spark WebSocket channel: subscribe, event routing, and GC.
//!
//! One channel endpoint serves every live component on a page. The JSON
//! protocol is small and fixed:
//!
//! - client → server: `{"subscribe": "<componentId>"}` or
//!   `{"event": "<name>", "channel": "<componentId>", "data": "<string>"}`
//! - server → client: `{"id": "<componentId>", "content": "<renderedHTML>"}`
//!
//! Events for a component are funneled through a per-component queue drained
//! by a single worker task, so `on_event` for a given id is serialized and
//! fan-in from any number of sockets stays FIFO per component. The channel
//! never reaches a component except by id lookup in the registry, and the
//! component's socket edge is severed on unmount, which keeps the object
//! graph acyclic.
//!
//! A background sweep removes disconnected components on the GC interval
//! (default 10 s); components created during the current sweep window get a
//! one-cycle grace period. The sweep stops when the shutdown signal fires.

use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant},
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use dashmap::DashMap;
use futures_util::{FutureExt, SinkExt, StreamExt};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use sha1::{Digest, Sha1};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{
    tungstenite::{protocol::Role, Message},
    WebSocketStream,
};

use crate::{
    body::HibanaBody,
    error::Error,
    handler::BoxHandler,
    metrics::{ComponentEvent, ComponentMetric, MetricsEngine},
    types::{Request, StageResult},
};

use super::{
    component::SocketHandle,
    registry::{ComponentRegistry, SharedComponent},
};

/// Default sweep interval for disconnected components.
pub const GC_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
struct ClientFrame {
    subscribe: Option<String>,
    event: Option<String>,
    channel: Option<String>,
    data: Option<String>,
}

enum ComponentTask {
    Event { name: String, data: String },
    Refresh,
}

/// WebSocket handler serving all live components in a page.
#[derive(Clone)]
pub struct SparkChannel {
    registry: Arc<ComponentRegistry>,
    queues: Arc<DashMap<String, mpsc::UnboundedSender<ComponentTask>>>,
    metrics: Option<Arc<MetricsEngine>>,
    gc_interval: Duration,
}

impl SparkChannel {
    pub fn new(registry: Arc<ComponentRegistry>) -> Self {
        Self {
            registry,
            queues: Arc::new(DashMap::new()),
            metrics: None,
            gc_interval: GC_INTERVAL,
        }
    }

    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    /// Record component lifecycle metrics into the given engine.
    pub fn with_metrics(mut self, metrics: Arc<MetricsEngine>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    /// Route handler performing the WebSocket upgrade handshake. Register it
    /// with [`Router::register_channel`](crate::router::Router::register_channel).
    pub fn handler(&self) -> BoxHandler {
        let channel = self.clone();
        BoxHandler::new(move |req: Request| {
            let channel = channel.clone();
            async move { channel.upgrade(req) }
        })
    }

    fn upgrade(&self, mut req: Request) -> StageResult {
        let Some(key) = req.headers().get("sec-websocket-key") else {
            return Err(Error::bad_request("missing Sec-WebSocket-Key header"));
        };

        // RFC 6455 accept hash.
        let accept = {
            let mut sha1 = Sha1::new();
            sha1.update(key.as_bytes());
            sha1.update(b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11");
            STANDARD.encode(sha1.finalize())
        };

        let response = http::Response::builder()
            .status(http::StatusCode::SWITCHING_PROTOCOLS)
            .header(http::header::UPGRADE, "websocket")
            .header(http::header::CONNECTION, "Upgrade")
            .header("sec-websocket-accept", accept)
            .body(HibanaBody::empty())
            .map_err(|e| Error::internal(e.to_string()))?;

        if let Some(on_upgrade) = req.extensions_mut().remove::<hyper::upgrade::OnUpgrade>() {
            let channel = self.clone();
            tokio::spawn(async move {
                if let Ok(upgraded) = on_upgrade.await {
                    let io = TokioIo::new(upgraded);
                    let ws = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
                    let _ = std::panic::AssertUnwindSafe(channel.run_connection(ws))
                        .catch_unwind()
                        .await;
                }
            });
        }

        Ok(response)
    }

    async fn run_connection<S>(self, ws: WebSocketStream<S>)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
        });

        let socket = SocketHandle::new(tx);
        let mut attached: HashSet<String> = HashSet::new();

        while let Some(Ok(message)) = stream.next().await {
            match message {
                Message::Text(text) => {
                    self.handle_text(&socket, &mut attached, text.as_ref()).await;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }

        self.disconnect(&socket, &attached);
        drop(socket);
        let _ = writer.await;
    }

    /// Parses and dispatches one client frame. Unparseable frames are
    /// dropped; unknown component ids are ignored (the page may be stale).
    pub(crate) async fn handle_text(
        &self,
        socket: &SocketHandle,
        attached: &mut HashSet<String>,
        text: &str,
    ) {
        let Ok(frame) = serde_json::from_str::<ClientFrame>(text) else {
            return;
        };

        if let Some(id) = frame.subscribe {
            self.subscribe(socket, attached, id);
        } else if let (Some(event), Some(id)) = (frame.event, frame.channel) {
            self.dispatch_event(&id, event, frame.data.unwrap_or_default());
        }
    }

    fn subscribe(&self, socket: &SocketHandle, attached: &mut HashSet<String>, id: String) {
        let Some(shared) = self.registry.get(&id) else {
            return;
        };

        {
            let mut component = shared.lock();
            component.connect(socket.clone());
            let started = Instant::now();
            component.mount();
            self.record(&component, ComponentEvent::Mount, Some(started.elapsed()));
        }

        attached.insert(id.clone());
        self.ensure_worker(id, shared);
    }

    fn ensure_worker(&self, id: String, shared: SharedComponent) {
        if self.queues.contains_key(&id) {
            return;
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<ComponentTask>();
        self.queues.insert(id, tx);

        let channel = self.clone();
        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                // The component mutex is held only across the synchronous
                // view code; the outbound send is queue-based and lock-free.
                let outbound = {
                    let mut component = shared.lock();
                    match task {
                        ComponentTask::Event { name, data } => {
                            let started = Instant::now();
                            let refresh = component.handle_event(&name, &data);
                            channel.record(
                                &component,
                                ComponentEvent::EventHandler,
                                Some(started.elapsed()),
                            );
                            if refresh {
                                channel.record(&component, ComponentEvent::Refresh, None);
                                component.socket().cloned().map(|socket| {
                                    (socket, content_frame(component.id(), &component.render_wrapped()))
                                })
                            } else {
                                None
                            }
                        }
                        ComponentTask::Refresh => {
                            channel.record(&component, ComponentEvent::Refresh, None);
                            component.socket().cloned().map(|socket| {
                                (socket, content_frame(&component.id().to_string(), &component.render_wrapped()))
                            })
                        }
                    }
                };

                if let Some((socket, payload)) = outbound {
                    socket.send_text(payload);
                }
            }
        });
    }

    fn dispatch_event(&self, id: &str, name: String, data: String) {
        if let Some(queue) = self.queues.get(id) {
            let _ = queue.send(ComponentTask::Event { name, data });
        }
    }

    /// Server-side push: re-render a component and send the content frame.
    pub fn refresh(&self, id: &str) {
        if let Some(queue) = self.queues.get(id) {
            let _ = queue.send(ComponentTask::Refresh);
        }
    }

    /// Unmounts and deregisters every component attached to a closing
    /// socket. Components meanwhile claimed by a newer socket are left alone.
    pub(crate) fn disconnect(&self, socket: &SocketHandle, attached: &HashSet<String>) {
        for id in attached {
            let Some(shared) = self.registry.get(id) else {
                continue;
            };
            let owned_by_us = shared
                .lock()
                .socket()
                .map(|s| s.id() == socket.id())
                .unwrap_or(false);
            if !owned_by_us {
                continue;
            }

            self.queues.remove(id);
            if let Some(shared) = self.registry.remove(id) {
                let mut component = shared.lock();
                component.unmount();
                self.record(&component, ComponentEvent::Unmount, None);
            }
        }
    }

    /// Spawns the periodic GC sweep. When the shutdown signal fires the
    /// task unmounts every component still registered (via
    /// [`ComponentRegistry::cleanup_all`]) and exits.
    pub fn spawn_gc(&self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let channel = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(channel.gc_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so newly created
            // components get a full interval before their first sweep.
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        // Unmount hooks are user code; a panicking sweep is
                        // logged and the loop keeps running.
                        let sweep = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                            channel.registry.cleanup_disconnected(channel.gc_interval);
                            channel.prune_queues();
                        }));
                        if sweep.is_err() {
                            tracing::error!("component GC sweep panicked; restarting");
                        }
                    }
                    _ = shutdown.changed() => {
                        let teardown = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                            channel.registry.cleanup_all();
                        }));
                        if teardown.is_err() {
                            tracing::error!("component teardown panicked during shutdown");
                        }
                        channel.queues.clear();
                        break;
                    }
                }
            }
        })
    }

    fn prune_queues(&self) {
        self.queues.retain(|id, _| self.registry.get(id).is_some());
    }

    fn record(
        &self,
        component: &super::component::SparkComponent,
        event: ComponentEvent,
        elapsed: Option<Duration>,
    ) {
        if let Some(metrics) = &self.metrics {
            metrics.record_component(ComponentMetric {
                component_id: component.id().to_string(),
                component_type: component.type_name().to_string(),
                event,
                processing_time_ms: elapsed.map(|d| d.as_secs_f64() * 1_000.0),
                memory_before: None,
                memory_after: None,
                age_at_event_secs: Some(component.age().as_secs_f64()),
                timestamp: Utc::now(),
            });
        }
    }
}

fn content_frame(id: &str, content: &str) -> String {
    serde_json::json!({ "id": id, "content": content }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spark::component::{EventContext, LiveView, SparkComponent};

    struct Counter {
        count: i64,
    }

    impl LiveView for Counter {
        fn render(&self) -> String {
            format!("<span>{}</span>", self.count)
        }

        fn on_event(&mut self, name: &str, _data: &str, ctx: &mut EventContext) {
            if name == "increment" {
                self.count += 1;
                ctx.refresh();
            }
        }
    }

    fn channel() -> (SparkChannel, Arc<ComponentRegistry>) {
        let registry = Arc::new(ComponentRegistry::new());
        (SparkChannel::new(registry.clone()), registry)
    }

    fn socket() -> (SocketHandle, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SocketHandle::new(tx), rx)
    }

    async fn next_text(rx: &mut mpsc::UnboundedReceiver<Message>) -> serde_json::Value {
        let message = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed");
        match message {
            Message::Text(text) => serde_json::from_str(text.as_ref()).unwrap(),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn subscribe_mounts_and_events_refresh_exactly_once() {
        let (channel, registry) = channel();
        registry.register(SparkComponent::with_id("C".into(), Counter { count: 0 }));

        let (handle, mut rx) = socket();
        let mut attached = HashSet::new();

        channel
            .handle_text(&handle, &mut attached, r#"{"subscribe":"C"}"#)
            .await;
        assert!(registry.get("C").unwrap().lock().is_mounted());
        assert!(attached.contains("C"));

        channel
            .handle_text(
                &handle,
                &mut attached,
                r#"{"event":"increment","channel":"C","data":""}"#,
            )
            .await;

        let frame = next_text(&mut rx).await;
        assert_eq!(frame["id"], "C");
        assert_eq!(
            frame["content"],
            "<div data-spark-view=\"C\"><span>1</span></div>"
        );

        // An event that requests no refresh sends nothing.
        channel
            .handle_text(
                &handle,
                &mut attached,
                r#"{"event":"noop","channel":"C","data":""}"#,
            )
            .await;
        channel
            .handle_text(
                &handle,
                &mut attached,
                r#"{"event":"increment","channel":"C","data":""}"#,
            )
            .await;
        let frame = next_text(&mut rx).await;
        assert_eq!(
            frame["content"],
            "<div data-spark-view=\"C\"><span>2</span></div>"
        );
        assert!(rx.try_recv().is_err(), "exactly one frame per refresh");
    }

    #[tokio::test]
    async fn unknown_subscriptions_are_silently_ignored() {
        let (channel, registry) = channel();
        let (handle, _rx) = socket();
        let mut attached = HashSet::new();

        channel
            .handle_text(&handle, &mut attached, r#"{"subscribe":"stale"}"#)
            .await;
        assert!(attached.is_empty());
        assert!(registry.is_empty());

        // Garbage frames are dropped too.
        channel.handle_text(&handle, &mut attached, "not json").await;
    }

    #[tokio::test]
    async fn socket_close_unmounts_and_deregisters() {
        let (channel, registry) = channel();
        registry.register(SparkComponent::with_id("C".into(), Counter { count: 0 }));

        let (handle, _rx) = socket();
        let mut attached = HashSet::new();
        channel
            .handle_text(&handle, &mut attached, r#"{"subscribe":"C"}"#)
            .await;

        channel.disconnect(&handle, &attached);
        assert!(registry.get("C").is_none());
    }

    #[tokio::test]
    async fn components_claimed_by_a_newer_socket_survive_the_old_close() {
        let (channel, registry) = channel();
        registry.register(SparkComponent::with_id("C".into(), Counter { count: 0 }));

        let (old, _old_rx) = socket();
        let mut old_attached = HashSet::new();
        channel
            .handle_text(&old, &mut old_attached, r#"{"subscribe":"C"}"#)
            .await;

        let (new, _new_rx) = socket();
        let mut new_attached = HashSet::new();
        channel
            .handle_text(&new, &mut new_attached, r#"{"subscribe":"C"}"#)
            .await;

        channel.disconnect(&old, &old_attached);
        assert!(registry.get("C").is_some(), "newer socket keeps the component");
    }

    #[tokio::test]
    async fn server_side_refresh_pushes_a_content_frame() {
        let (channel, registry) = channel();
        registry.register(SparkComponent::with_id("C".into(), Counter { count: 7 }));

        let (handle, mut rx) = socket();
        let mut attached = HashSet::new();
        channel
            .handle_text(&handle, &mut attached, r#"{"subscribe":"C"}"#)
            .await;

        channel.refresh("C");
        let frame = next_text(&mut rx).await;
        assert_eq!(
            frame["content"],
            "<div data-spark-view=\"C\"><span>7</span></div>"
        );
    }

    #[tokio::test]
    async fn gc_sweep_collects_stale_components_and_unmounts_the_rest_on_shutdown() {
        let registry = Arc::new(ComponentRegistry::new());
        let channel = SparkChannel::new(registry.clone())
            .with_gc_interval(Duration::from_millis(30));

        registry.register(SparkComponent::with_id("never".into(), Counter { count: 0 }));
        let live = registry.register(SparkComponent::with_id("live".into(), Counter { count: 0 }));
        let (handle, _rx) = socket();
        let mut attached = HashSet::new();
        channel
            .handle_text(&handle, &mut attached, r#"{"subscribe":"live"}"#)
            .await;

        let (tx, rx) = watch::channel(false);
        let gc = channel.spawn_gc(rx);

        // The never-connected component survives its creation window and is
        // collected once its age exceeds the interval; the connected one
        // stays.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(registry.get("never").is_none());
        assert!(registry.get("live").is_some());

        // Shutdown unmounts and drops everything still registered.
        tx.send(true).unwrap();
        gc.await.unwrap();
        assert!(registry.is_empty());
        assert!(!live.lock().is_mounted());
    }

    #[tokio::test]
    async fn lifecycle_metrics_are_recorded_when_attached() {
        let registry = Arc::new(ComponentRegistry::new());
        let metrics = Arc::new(MetricsEngine::new());
        let channel = SparkChannel::new(registry.clone()).with_metrics(metrics.clone());

        registry.register(SparkComponent::with_id("C".into(), Counter { count: 0 }));
        let (handle, mut rx) = socket();
        let mut attached = HashSet::new();
        channel
            .handle_text(&handle, &mut attached, r#"{"subscribe":"C"}"#)
            .await;
        channel
            .handle_text(
                &handle,
                &mut attached,
                r#"{"event":"increment","channel":"C","data":""}"#,
            )
            .await;
        let _ = next_text(&mut rx).await;
        channel.disconnect(&handle, &attached);

        let stats = metrics.component_stats(Some("Counter"), None);
        assert_eq!(stats.mounts, 1);
        assert_eq!(stats.event_handlers, 1);
        assert_eq!(stats.refreshes, 1);
        assert_eq!(stats.unmounts, 1);
    }
}
