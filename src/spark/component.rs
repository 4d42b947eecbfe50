//! Live views and the component wrapper that gives them identity.
//!
//! Applications implement [`LiveView`]; the framework wraps each instance in
//! a [`SparkComponent`] carrying the id, lifecycle flags, creation time, and
//! the (nullable) socket the component is currently attached to. The
//! component→socket edge is cleared on unmount, which is what keeps the
//! channel → registry → component → socket cycle from ever forming.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Handed to event handlers so they can request a re-render.
#[derive(Debug, Default)]
pub struct EventContext {
    refresh_requested: bool,
}

impl EventContext {
    /// Requests a re-render once the handler returns. The channel sends one
    /// content frame per requested refresh.
    pub fn refresh(&mut self) {
        self.refresh_requested = true;
    }
}

/// A server-rendered HTML fragment with identity, lifecycle, and event
/// handlers.
pub trait LiveView: Send + 'static {
    /// Renders the inner HTML fragment. The framework wraps it in the
    /// `data-spark-view` marker.
    fn render(&self) -> String;

    /// Handles a client event. Call [`EventContext::refresh`] to push a
    /// re-render.
    fn on_event(&mut self, _name: &str, _data: &str, _ctx: &mut EventContext) {}

    /// Called when the component is mounted onto a live socket.
    fn mounted(&mut self) {}

    /// Called when the component's lifecycle ends.
    fn unmounted(&mut self) {}
}

/// Write half of a WebSocket connection, shareable across components.
///
/// Sending never blocks: frames go through an unbounded queue drained by the
/// connection's writer task.
#[derive(Clone)]
pub struct SocketHandle {
    id: Uuid,
    sender: mpsc::UnboundedSender<Message>,
}

impl SocketHandle {
    pub(crate) fn new(sender: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
        }
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    /// Queues a text frame. Returns false when the connection is gone.
    pub(crate) fn send_text(&self, text: String) -> bool {
        self.sender.send(Message::Text(text.into())).is_ok()
    }
}

/// Framework wrapper around a [`LiveView`]: identity plus lifecycle state.
pub struct SparkComponent {
    id: String,
    type_name: &'static str,
    created_at: Instant,
    mounted: bool,
    connected: bool,
    socket: Option<SocketHandle>,
    view: Box<dyn LiveView>,
}

impl SparkComponent {
    /// Wraps a view with a fresh uuid identity.
    pub fn new<V: LiveView>(view: V) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), view)
    }

    /// Wraps a view under a caller-chosen id (pages embed the id in their
    /// markup before the socket connects).
    pub fn with_id<V: LiveView>(id: String, view: V) -> Self {
        Self {
            id,
            type_name: short_type_name::<V>(),
            created_at: Instant::now(),
            mounted: false,
            connected: false,
            socket: None,
            view: Box::new(view),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub(crate) fn socket(&self) -> Option<&SocketHandle> {
        self.socket.as_ref()
    }

    /// Attaches a socket and marks the component live.
    pub(crate) fn connect(&mut self, socket: SocketHandle) {
        self.connected = true;
        self.socket = Some(socket);
    }

    /// Marks the component disconnected but keeps it registered; the GC
    /// sweep decides its fate.
    pub(crate) fn disconnect(&mut self) {
        self.connected = false;
        self.socket = None;
    }

    /// Runs the view's mount hook (once).
    pub(crate) fn mount(&mut self) {
        if !self.mounted {
            self.mounted = true;
            self.view.mounted();
        }
    }

    /// Ends the lifecycle: runs the unmount hook and severs the socket edge.
    pub(crate) fn unmount(&mut self) {
        if self.mounted {
            self.view.unmounted();
        }
        self.mounted = false;
        self.disconnect();
    }

    /// Dispatches one event to the view. Returns true when the handler
    /// requested a refresh.
    pub(crate) fn handle_event(&mut self, name: &str, data: &str) -> bool {
        let mut ctx = EventContext::default();
        self.view.on_event(name, data, &mut ctx);
        ctx.refresh_requested
    }

    /// Renders the fragment wrapped in its stable patch marker.
    pub fn render_wrapped(&self) -> String {
        format!(
            "<div data-spark-view=\"{}\">{}</div>",
            self.id,
            self.view.render()
        )
    }
}

fn short_type_name<V>() -> &'static str {
    let full = std::any::type_name::<V>();
    full.rsplit("::").next().unwrap_or(full)
}
