//! Accept-header content negotiation and response rendering contracts.
//!
//! A response value implements [`Renderable`] (a natural, single-format
//! rendering) and optionally [`MultiFormat`] to offer html/json/xml/text
//! representations. The negotiator parses the `Accept` header into media
//! ranges sorted by descending `q` (default 1.0, ties broken by order of
//! appearance) and picks the first representation the response implements.
//! Empty or malformed `Accept` headers fall back to the response's natural
//! type, and an empty response renders as 204 No Content.

use mime::Mime;

use crate::{body::HibanaBody, error::Error, types::Response};

/// A value that can serialize itself into a response body.
pub trait Renderable: Send + 'static {
    /// Media type used when the client expresses no usable preference.
    fn natural(&self) -> Mime {
        mime::TEXT_PLAIN
    }

    /// Renders the natural representation.
    fn render(&self) -> Result<String, Error>;
}

/// A response offering several negotiable representations.
///
/// Each method returns `None` when the representation is not implemented;
/// the negotiator skips it and tries the client's next preference.
pub trait MultiFormat: Renderable {
    fn html(&self) -> Option<Result<String, Error>> {
        None
    }

    fn json(&self) -> Option<Result<String, Error>> {
        None
    }

    fn xml(&self) -> Option<Result<String, Error>> {
        None
    }

    fn text(&self) -> Option<Result<String, Error>> {
        None
    }

    /// True when the value renders as 204 No Content with an empty body.
    fn is_empty_response(&self) -> bool {
        false
    }
}

impl Renderable for String {
    fn render(&self) -> Result<String, Error> {
        Ok(self.clone())
    }
}

impl MultiFormat for String {
    fn text(&self) -> Option<Result<String, Error>> {
        Some(Ok(self.clone()))
    }
}

impl Renderable for serde_json::Value {
    fn natural(&self) -> Mime {
        mime::APPLICATION_JSON
    }

    fn render(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|e| Error::internal(e.to_string()))
    }
}

impl MultiFormat for serde_json::Value {
    fn json(&self) -> Option<Result<String, Error>> {
        Some(self.render())
    }
}

impl<T: MultiFormat> Renderable for Option<T> {
    fn natural(&self) -> Mime {
        match self {
            Some(inner) => inner.natural(),
            None => mime::TEXT_PLAIN,
        }
    }

    fn render(&self) -> Result<String, Error> {
        match self {
            Some(inner) => inner.render(),
            None => Ok(String::new()),
        }
    }
}

impl<T: MultiFormat> MultiFormat for Option<T> {
    fn html(&self) -> Option<Result<String, Error>> {
        self.as_ref().and_then(MultiFormat::html)
    }

    fn json(&self) -> Option<Result<String, Error>> {
        self.as_ref().and_then(MultiFormat::json)
    }

    fn xml(&self) -> Option<Result<String, Error>> {
        self.as_ref().and_then(MultiFormat::xml)
    }

    fn text(&self) -> Option<Result<String, Error>> {
        self.as_ref().and_then(MultiFormat::text)
    }

    fn is_empty_response(&self) -> bool {
        self.is_none()
    }
}

/// Serializes a value as its JSON representation. Convenience for
/// `MultiFormat` implementations.
pub fn json_of<T: serde::Serialize>(value: &T) -> Result<String, Error> {
    serde_json::to_string(value).map_err(|e| Error::internal(e.to_string()))
}

/// The negotiable representations, in capability-probe order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Representation {
    Html,
    Json,
    Xml,
    Text,
}

impl Representation {
    fn mime(self) -> Mime {
        match self {
            Representation::Html => mime::TEXT_HTML,
            Representation::Json => mime::APPLICATION_JSON,
            Representation::Xml => "application/xml".parse().unwrap_or(mime::TEXT_XML),
            Representation::Text => mime::TEXT_PLAIN,
        }
    }

    fn probe(self, res: &dyn MultiFormat) -> Option<Result<String, Error>> {
        match self {
            Representation::Html => res.html(),
            Representation::Json => res.json(),
            Representation::Xml => res.xml(),
            Representation::Text => res.text(),
        }
    }

    const ALL: [Representation; 4] = [
        Representation::Html,
        Representation::Json,
        Representation::Xml,
        Representation::Text,
    ];
}

/// Parses an `Accept` header into media ranges sorted by descending `q`.
///
/// Invalid entries are dropped. The sort is stable, so ranges with equal `q`
/// keep their order of appearance.
pub(crate) fn parse_accept(header: &str) -> Vec<(Mime, f32)> {
    let mut ranges: Vec<(Mime, f32)> = header
        .split(',')
        .filter_map(|part| part.trim().parse::<Mime>().ok())
        .map(|m| {
            let q = m
                .get_param("q")
                .and_then(|q| q.as_str().parse::<f32>().ok())
                .unwrap_or(1.0)
                .clamp(0.0, 1.0);
            (m, q)
        })
        .collect();
    ranges.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    ranges
}

fn range_matches(range: &Mime, candidate: &Mime) -> bool {
    (range.type_() == mime::STAR || range.type_() == candidate.type_())
        && (range.subtype() == mime::STAR || range.subtype() == candidate.subtype())
}

/// Renders a response value in the representation negotiated from `accept`.
///
/// An empty response yields 204 with an empty body regardless of the header.
pub fn negotiate(accept: Option<&str>, res: &dyn MultiFormat) -> Result<Response, Error> {
    if res.is_empty_response() {
        let mut out = Response::new(HibanaBody::empty());
        *out.status_mut() = http::StatusCode::NO_CONTENT;
        return Ok(out);
    }

    if let Some(header) = accept {
        for (range, q) in parse_accept(header) {
            if q == 0.0 {
                continue;
            }
            for repr in Representation::ALL {
                if range_matches(&range, &repr.mime()) {
                    if let Some(rendered) = repr.probe(res) {
                        return finish(repr.mime(), rendered?);
                    }
                }
            }
        }
    }

    // No usable preference: fall back to the natural representation.
    finish(res.natural(), res.render()?)
}

fn finish(media: Mime, body: String) -> Result<Response, Error> {
    let mut out = Response::new(HibanaBody::from(body));
    out.headers_mut().insert(
        http::header::CONTENT_TYPE,
        media
            .essence_str()
            .parse()
            .map_err(|_| Error::internal("invalid content type"))?,
    );
    Ok(out)
}

/// Rendering formats for error responses, picked by the rescuer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorFormat {
    Json,
    Html,
    Text,
}

/// Chooses how an error should render for the given `Accept` header.
///
/// Errors are JSON by nature (the wire body is a JSON object), so JSON is
/// the fallback when the header is absent or malformed.
pub fn preferred_error_format(accept: Option<&str>) -> ErrorFormat {
    if let Some(header) = accept {
        for (range, q) in parse_accept(header) {
            if q == 0.0 {
                continue;
            }
            if range_matches(&range, &mime::TEXT_HTML) {
                return ErrorFormat::Html;
            }
            if range_matches(&range, &mime::APPLICATION_JSON) {
                return ErrorFormat::Json;
            }
            if range_matches(&range, &mime::TEXT_PLAIN) {
                return ErrorFormat::Text;
            }
        }
    }
    ErrorFormat::Json
}
