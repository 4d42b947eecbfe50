//! Standalone pipeline stages for cross-cutting request concerns.

/// Request-id assignment and propagation.
pub mod request_id;

/// Structured, non-blocking access logging.
pub mod logger;

/// Static file serving with ETags, ranges, and compression.
pub mod static_files;

pub use logger::AccessLog;
pub use request_id::{RequestId, REQUEST_ID_HEADER};
pub use static_files::StaticFiles;
