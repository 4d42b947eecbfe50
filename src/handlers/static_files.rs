//! Static file serving stage.
//!
//! Serves files from a configured root with path traversal protection (NUL
//! bytes and `..` segments are rejected outright), ETags derived from the
//! modification time, single `bytes=a-b` range support, and gzip/deflate
//! compression for a configurable set of extensions. Anything other than
//! GET or HEAD answers 405; paths that resolve to no file fall through to
//! the next stage.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::{write::GzEncoder, write::ZlibEncoder, Compression};
use std::io::Write;

use crate::{
    body::HibanaBody,
    error::Error,
    pipeline::{Next, Stage},
    types::{Request, Response, StageResult},
};

/// File server rooted at a directory.
pub struct StaticFiles {
    root: PathBuf,
    mount: String,
    compress_extensions: Vec<String>,
}

impl StaticFiles {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            mount: String::new(),
            compress_extensions: ["html", "css", "js", "mjs", "svg", "txt", "json", "xml"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    /// Prefix stripped from request paths before resolving against the root
    /// (for serving under `/assets` and similar).
    pub fn mounted_at(mut self, prefix: &str) -> Self {
        self.mount = prefix.trim_end_matches('/').to_string();
        self
    }

    /// Replaces the set of extensions eligible for compression.
    pub fn compress_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.compress_extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    /// Resolves a request path inside the root, rejecting traversal.
    fn resolve(&self, request_path: &str) -> Option<PathBuf> {
        if request_path.contains('\0') {
            return None;
        }
        let decoded = urlencoding::decode(request_path).ok()?;
        if decoded.contains('\0') {
            return None;
        }

        let relative = decoded
            .strip_prefix(&self.mount)
            .unwrap_or(&decoded)
            .trim_start_matches('/');
        let candidate = Path::new(relative);
        // Reject any path that steps upward; only plain segments survive.
        if candidate
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return None;
        }
        Some(self.root.join(candidate))
    }

    fn wants_compression(&self, path: &Path, accept_encoding: Option<&str>) -> Option<&'static str> {
        let extension = path.extension()?.to_str()?;
        if !self
            .compress_extensions
            .iter()
            .any(|e| e.eq_ignore_ascii_case(extension))
        {
            return None;
        }
        let accepted = accept_encoding?;
        if accepted.contains("gzip") {
            Some("gzip")
        } else if accepted.contains("deflate") {
            Some("deflate")
        } else {
            None
        }
    }

    async fn serve(
        &self,
        method: &http::Method,
        headers: &http::HeaderMap,
        path: &Path,
    ) -> Result<Option<Response>, Error> {
        let head_only = *method == http::Method::HEAD;
        let if_none_match = headers
            .get(http::header::IF_NONE_MATCH)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let range = headers
            .get(http::header::RANGE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let accept_encoding = headers
            .get(http::header::ACCEPT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let Ok(meta) = tokio::fs::metadata(path).await else {
            return Ok(None);
        };
        if !meta.is_file() {
            return Ok(None);
        }

        let size = meta.len();
        let modified = meta.modified().ok();
        let etag = modified
            .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| format!("\"{:x}-{:x}\"", d.as_secs(), size));

        if let (Some(etag), Some(if_none_match)) = (etag.as_deref(), if_none_match.as_deref()) {
            if if_none_match == "*" || if_none_match.split(',').any(|t| t.trim() == etag) {
                let mut res = Response::new(HibanaBody::empty());
                *res.status_mut() = http::StatusCode::NOT_MODIFIED;
                res.headers_mut()
                    .insert(http::header::ETAG, header_value(etag)?);
                return Ok(Some(res));
            }
        }

        let mime = mime_guess::from_path(path).first_or_octet_stream();

        if let Some(range) = range.as_deref() {
            return match parse_range(range, size) {
                Some((start, end)) => {
                    let contents = tokio::fs::read(path)
                        .await
                        .map_err(|e| Error::internal(format!("failed to read file: {e}")))?;
                    let slice = contents[start as usize..=end as usize].to_vec();
                    let mut res = Response::new(HibanaBody::from(slice));
                    *res.status_mut() = http::StatusCode::PARTIAL_CONTENT;
                    let headers = res.headers_mut();
                    headers.insert(http::header::CONTENT_TYPE, header_value(mime.as_ref())?);
                    headers.insert(
                        http::header::CONTENT_RANGE,
                        header_value(&format!("bytes {start}-{end}/{size}"))?,
                    );
                    headers.insert(http::header::ACCEPT_RANGES, header_value("bytes")?);
                    Ok(Some(res))
                }
                None => {
                    let mut res = Response::new(HibanaBody::empty());
                    *res.status_mut() = http::StatusCode::RANGE_NOT_SATISFIABLE;
                    res.headers_mut().insert(
                        http::header::CONTENT_RANGE,
                        header_value(&format!("bytes */{size}"))?,
                    );
                    Ok(Some(res))
                }
            };
        }

        let contents = tokio::fs::read(path)
            .await
            .map_err(|e| Error::internal(format!("failed to read file: {e}")))?;

        let encoding = self.wants_compression(path, accept_encoding.as_deref());
        let body = match encoding {
            Some("gzip") => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder
                    .write_all(&contents)
                    .map_err(|e| Error::internal(format!("gzip failed: {e}")))?;
                encoder
                    .finish()
                    .map_err(|e| Error::internal(format!("gzip failed: {e}")))?
            }
            Some("deflate") => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder
                    .write_all(&contents)
                    .map_err(|e| Error::internal(format!("deflate failed: {e}")))?;
                encoder
                    .finish()
                    .map_err(|e| Error::internal(format!("deflate failed: {e}")))?
            }
            _ => contents,
        };

        let mut res = Response::new(if head_only {
            HibanaBody::empty()
        } else {
            HibanaBody::from(body)
        });
        let headers = res.headers_mut();
        headers.insert(http::header::CONTENT_TYPE, header_value(mime.as_ref())?);
        headers.insert(http::header::ACCEPT_RANGES, header_value("bytes")?);
        if let Some(etag) = etag {
            headers.insert(http::header::ETAG, header_value(&etag)?);
        }
        if let Some(modified) = modified {
            let formatted = DateTime::<Utc>::from(modified)
                .format("%a, %d %b %Y %H:%M:%S GMT")
                .to_string();
            headers.insert(http::header::LAST_MODIFIED, header_value(&formatted)?);
        }
        if let Some(encoding) = encoding {
            headers.insert(http::header::CONTENT_ENCODING, header_value(encoding)?);
            headers.insert(http::header::VARY, header_value("Accept-Encoding")?);
        }
        Ok(Some(res))
    }
}

fn header_value(value: &str) -> Result<http::HeaderValue, Error> {
    value
        .parse()
        .map_err(|_| Error::internal("invalid header value"))
}

/// Parses a single `bytes=a-b` range (open ends allowed) against a file
/// size. Returns the inclusive byte window, or `None` when unsatisfiable.
fn parse_range(header: &str, size: u64) -> Option<(u64, u64)> {
    if size == 0 {
        return None;
    }
    let window = header.strip_prefix("bytes=")?;
    let (start, end) = window.split_once('-')?;

    match (start.is_empty(), end.is_empty()) {
        // bytes=-n : final n bytes
        (true, false) => {
            let n: u64 = end.parse().ok()?;
            if n == 0 {
                return None;
            }
            Some((size.saturating_sub(n), size - 1))
        }
        // bytes=a- : from a to the end
        (false, true) => {
            let a: u64 = start.parse().ok()?;
            (a < size).then_some((a, size - 1))
        }
        (false, false) => {
            let a: u64 = start.parse().ok()?;
            let b: u64 = end.parse().ok()?;
            (a <= b && a < size).then_some((a, b.min(size - 1)))
        }
        (true, true) => None,
    }
}

#[async_trait]
impl Stage for StaticFiles {
    async fn call(&self, req: Request, next: Next) -> StageResult {
        if req.method() != http::Method::GET && req.method() != http::Method::HEAD {
            let mut res = Response::new(HibanaBody::empty());
            *res.status_mut() = http::StatusCode::METHOD_NOT_ALLOWED;
            res.headers_mut()
                .insert(http::header::ALLOW, header_value("GET, HEAD")?);
            return Ok(res);
        }

        if let Some(path) = self.resolve(req.uri().path()) {
            if let Some(res) = self.serve(req.method(), req.headers(), &path).await? {
                return Ok(res);
            }
        }
        next.run(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use flate2::read::GzDecoder;
    use http_body_util::BodyExt;
    use std::io::Read;

    struct Fixture {
        dir: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = std::env::temp_dir().join(format!("hibana-static-{}", uuid::Uuid::new_v4()));
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("app.css"), "body { margin: 0; }").unwrap();
            std::fs::write(dir.join("data.bin"), b"0123456789").unwrap();
            Self { dir }
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    fn handler(root: &Path) -> crate::handler::BoxHandler {
        Pipeline::new()
            .with(StaticFiles::new(root))
            .with_fn(|_req, _next| async move {
                let mut res = Response::new(HibanaBody::from("fallthrough"));
                *res.status_mut() = http::StatusCode::NOT_FOUND;
                Ok(res)
            })
            .build()
            .unwrap()
    }

    fn get(path: &str) -> Request {
        http::Request::builder()
            .method("GET")
            .uri(path)
            .body(HibanaBody::empty())
            .unwrap()
    }

    async fn body_bytes(res: Response) -> Vec<u8> {
        res.into_body().collect().await.unwrap().to_bytes().to_vec()
    }

    #[tokio::test]
    async fn serves_files_with_etag_and_content_type() {
        let fixture = Fixture::new();
        let res = handler(&fixture.dir).call(get("/app.css")).await.unwrap();
        assert_eq!(res.status(), http::StatusCode::OK);
        assert_eq!(res.headers()[http::header::CONTENT_TYPE], "text/css");
        assert!(res.headers().contains_key(http::header::ETAG));
        assert!(res.headers().contains_key(http::header::LAST_MODIFIED));
    }

    #[tokio::test]
    async fn matching_etag_returns_not_modified() {
        let fixture = Fixture::new();
        let handler = handler(&fixture.dir);
        let first = handler.call(get("/app.css")).await.unwrap();
        let etag = first.headers()[http::header::ETAG].to_str().unwrap().to_string();

        let req = http::Request::builder()
            .method("GET")
            .uri("/app.css")
            .header("if-none-match", etag)
            .body(HibanaBody::empty())
            .unwrap();
        let res = handler.call(req).await.unwrap();
        assert_eq!(res.status(), http::StatusCode::NOT_MODIFIED);
    }

    #[tokio::test]
    async fn traversal_attempts_fall_through() {
        let fixture = Fixture::new();
        let handler = handler(&fixture.dir);

        for path in ["/../etc/passwd", "/%2e%2e/etc/passwd", "/a/../../x"] {
            let res = handler.call(get(path)).await.unwrap();
            assert_eq!(res.status(), http::StatusCode::NOT_FOUND, "path {path}");
        }
    }

    #[tokio::test]
    async fn byte_ranges_yield_partial_content() {
        let fixture = Fixture::new();
        let handler = handler(&fixture.dir);

        let req = http::Request::builder()
            .method("GET")
            .uri("/data.bin")
            .header("range", "bytes=2-5")
            .body(HibanaBody::empty())
            .unwrap();
        let res = handler.call(req).await.unwrap();
        assert_eq!(res.status(), http::StatusCode::PARTIAL_CONTENT);
        assert_eq!(res.headers()[http::header::CONTENT_RANGE], "bytes 2-5/10");
        assert_eq!(body_bytes(res).await, b"2345");

        let req = http::Request::builder()
            .method("GET")
            .uri("/data.bin")
            .header("range", "bytes=50-60")
            .body(HibanaBody::empty())
            .unwrap();
        let res = handler.call(req).await.unwrap();
        assert_eq!(res.status(), http::StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(res.headers()[http::header::CONTENT_RANGE], "bytes */10");
    }

    #[tokio::test]
    async fn configured_extensions_are_gzipped() {
        let fixture = Fixture::new();
        let handler = handler(&fixture.dir);

        let req = http::Request::builder()
            .method("GET")
            .uri("/app.css")
            .header("accept-encoding", "gzip, deflate")
            .body(HibanaBody::empty())
            .unwrap();
        let res = handler.call(req).await.unwrap();
        assert_eq!(res.headers()[http::header::CONTENT_ENCODING], "gzip");

        let compressed = body_bytes(res).await;
        let mut decoder = GzDecoder::new(compressed.as_slice());
        let mut out = String::new();
        decoder.read_to_string(&mut out).unwrap();
        assert_eq!(out, "body { margin: 0; }");

        // Unlisted extensions are served verbatim.
        let req = http::Request::builder()
            .method("GET")
            .uri("/data.bin")
            .header("accept-encoding", "gzip")
            .body(HibanaBody::empty())
            .unwrap();
        let res = handler.call(req).await.unwrap();
        assert!(!res.headers().contains_key(http::header::CONTENT_ENCODING));
    }

    #[tokio::test]
    async fn non_read_methods_are_rejected() {
        let fixture = Fixture::new();
        let req = http::Request::builder()
            .method("POST")
            .uri("/app.css")
            .body(HibanaBody::empty())
            .unwrap();
        let res = handler(&fixture.dir).call(req).await.unwrap();
        assert_eq!(res.status(), http::StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(res.headers()[http::header::ALLOW], "GET, HEAD");
    }

    #[tokio::test]
    async fn head_requests_omit_the_body() {
        let fixture = Fixture::new();
        let req = http::Request::builder()
            .method("HEAD")
            .uri("/app.css")
            .body(HibanaBody::empty())
            .unwrap();
        let res = handler(&fixture.dir).call(req).await.unwrap();
        assert_eq!(res.status(), http::StatusCode::OK);
        assert!(body_bytes(res).await.is_empty());
    }

    #[test]
    fn range_parsing_covers_the_grammar() {
        assert_eq!(parse_range("bytes=0-4", 10), Some((0, 4)));
        assert_eq!(parse_range("bytes=5-", 10), Some((5, 9)));
        assert_eq!(parse_range("bytes=-3", 10), Some((7, 9)));
        assert_eq!(parse_range("bytes=2-100", 10), Some((2, 9)));
        assert_eq!(parse_range("bytes=10-", 10), None);
        assert_eq!(parse_range("bytes=5-2", 10), None);
        assert_eq!(parse_range("items=0-4", 10), None);
        assert_eq!(parse_range("bytes=0-4", 0), None);
    }
}
