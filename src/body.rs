//! HTTP request and response body handling utilities.
//!
//! This module provides [`HibanaBody`], the boxed body wrapper shared by
//! requests and responses, plus the one-shot request-body buffering used by
//! the pipeline. Several stages may need the body of the same request (the
//! CSRF stage extracts a form token, the endpoint layer builds the request
//! DTO), so the first reader materializes the body into [`Bytes`] once and
//! caches it in the request extensions; every later reader gets a cheap
//! rewindable copy.
//!
//! # Examples
//!
//! ```rust
//! use hibana::body::HibanaBody;
//! use bytes::Bytes;
//! use futures_util::stream;
//!
//! // Static content
//! let body = HibanaBody::from("Hello, World!");
//!
//! // Streaming content
//! let chunks = stream::iter(vec![
//!     Ok::<_, std::convert::Infallible>(Bytes::from("chunk1")),
//!     Ok(Bytes::from("chunk2")),
//! ]);
//! let streamed = HibanaBody::from_stream(chunks);
//!
//! // Empty response body
//! let empty = HibanaBody::empty();
//! ```

use std::{
    fmt::Debug,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::{Body, Frame, SizeHint};

use crate::{
    error::Error,
    types::{BoxError, Request},
};

/// Boxed HTTP body wrapper with streaming and conversion support.
///
/// `HibanaBody` provides a unified interface over static, streaming, and
/// incoming bodies. The server loop wraps `hyper::body::Incoming` into it so
/// the rest of the framework (and the tests) only ever see one body type.
pub struct HibanaBody(crate::types::BoxBody);

impl HibanaBody {
    /// Creates a new body from any type implementing the `Body` trait.
    pub fn new<B>(body: B) -> Self
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        Self(body.map_err(|e| e.into()).boxed_unsync())
    }

    /// Creates a body from a stream of byte results.
    pub fn from_stream<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError> + Debug + 'static,
    {
        let stream = stream.map_err(Into::into).map_ok(Frame::data);
        Self(StreamBody::new(stream).boxed_unsync())
    }

    /// Creates an empty body with no content.
    ///
    /// Useful for responses that only carry status and headers, such as
    /// 204 No Content or 304 Not Modified.
    pub fn empty() -> Self {
        Self::new(Empty::new())
    }
}

impl Default for HibanaBody {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<()> for HibanaBody {
    fn from(_: ()) -> Self {
        Self::empty()
    }
}

impl From<&str> for HibanaBody {
    fn from(buf: &str) -> Self {
        let owned = buf.to_owned();
        Self::new(http_body_util::Full::from(owned))
    }
}

macro_rules! body_from_impl {
    ($ty:ty) => {
        impl From<$ty> for HibanaBody {
            fn from(buf: $ty) -> Self {
                Self::new(http_body_util::Full::from(buf))
            }
        }
    };
}

body_from_impl!(String);
body_from_impl!(Vec<u8>);
body_from_impl!(Bytes);

impl Body for HibanaBody {
    type Data = Bytes;
    type Error = BoxError;

    #[inline]
    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.0).poll_frame(cx)
    }

    #[inline]
    fn size_hint(&self) -> SizeHint {
        self.0.size_hint()
    }

    #[inline]
    fn is_end_stream(&self) -> bool {
        self.0.is_end_stream()
    }
}

/// Cached copy of a fully read request body, stored in request extensions.
#[derive(Clone)]
pub(crate) struct BufferedBody(pub(crate) Bytes);

/// Reads the request body to completion, caching the bytes in the request
/// extensions so later stages can re-read it.
///
/// The first call drains the body; the original body is replaced with an
/// empty one and every call (including the first) returns the buffered bytes.
/// `Bytes` clones are reference-counted, so repeated access is cheap.
///
/// # Examples
///
/// ```rust
/// use hibana::body::{self, HibanaBody};
/// use hibana::types::Request;
///
/// # async fn example() -> Result<(), hibana::error::Error> {
/// let mut req = http::Request::builder()
///     .method("POST")
///     .uri("/widgets")
///     .body(HibanaBody::from("name=lamp"))
///     .unwrap();
///
/// let first = body::buffer(&mut req).await?;
/// let again = body::buffer(&mut req).await?;
/// assert_eq!(first, again);
/// # Ok(())
/// # }
/// ```
pub async fn buffer(req: &mut Request) -> Result<Bytes, Error> {
    if let Some(cached) = req.extensions().get::<BufferedBody>() {
        return Ok(cached.0.clone());
    }

    let body = std::mem::replace(req.body_mut(), HibanaBody::empty());
    let bytes = body
        .collect()
        .await
        .map_err(|e| Error::bad_request(format!("failed to read request body: {e}")))?
        .to_bytes();

    req.extensions_mut().insert(BufferedBody(bytes.clone()));
    Ok(bytes)
}
