//! Spark: the live-component reactive subsystem over WebSocket.
//!
//! A page renders one or more server-owned components, each wrapped in a
//! stable `data-spark-view` marker. A single WebSocket channel serves every
//! component on the page: the client subscribes with component ids, events
//! are funneled to each component one at a time, and re-renders are pushed
//! back as JSON frames the client patches into the DOM.

/// Live-view trait and the framework-owned component wrapper.
pub mod component;

/// Thread-safe component registry with a per-type recycling pool.
pub mod registry;

/// The WebSocket channel, event routing, and the GC sweep.
pub mod channel;

pub use channel::{SparkChannel, GC_INTERVAL};
pub use component::{EventContext, LiveView, SparkComponent};
pub use registry::ComponentRegistry;
