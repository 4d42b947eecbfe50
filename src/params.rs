//! Request parameter bags with form → path → query precedence.
//!
//! Parameters come from three disjoint sources: the matched route pattern
//! (path), the URL query string, and the request body (urlencoded form,
//! multipart form, or a JSON object). Body parsing is deferred until the
//! first stage actually asks for parameters, and the parsed body bags are
//! cached in the request extensions so the CSRF stage, the method-override
//! stage, and the endpoint layer all share one parse of the shared body
//! buffer.
//!
//! On key collisions the body wins, then the path, then the query:
//!
//! ```rust
//! use hibana::body::HibanaBody;
//! use hibana::params::Params;
//! use hibana::types::Request;
//!
//! # async fn example() -> Result<(), hibana::error::Error> {
//! let mut req = http::Request::builder()
//!     .method("POST")
//!     .uri("/search?term=from-query")
//!     .header("content-type", "application/x-www-form-urlencoded")
//!     .body(HibanaBody::from("term=from-form"))
//!     .unwrap();
//!
//! let params = Params::load(&mut req).await?;
//! assert_eq!(params.get("term"), Some("from-form"));
//! # Ok(())
//! # }
//! ```

use std::{collections::HashMap, str::FromStr, sync::Arc};

use bytes::Bytes;
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;

use crate::{
    body,
    config,
    error::Error,
    types::Request,
    uploads::{self, UploadedFile},
};

/// Path parameters extracted by the router, stored in request extensions.
/// The map is shared with the router's lookup cache, hence the `Arc`.
#[derive(Clone, Default)]
pub(crate) struct PathParams(pub Arc<HashMap<String, String>>);

/// Parsed request-body bags, cached in request extensions after first parse.
#[derive(Default)]
pub struct BodyParams {
    form: HashMap<String, String>,
    uploads: HashMap<String, UploadedFile>,
    json: Option<Value>,
}

impl BodyParams {
    /// Parses the request body once, according to its content type, and
    /// caches the result in the request extensions.
    ///
    /// The parse reads the shared body buffer, so it never consumes the body
    /// destructively; downstream stages still see the full bytes.
    pub async fn load(req: &mut Request) -> Result<Arc<BodyParams>, Error> {
        if let Some(cached) = req.extensions().get::<Arc<BodyParams>>() {
            return Ok(cached.clone());
        }

        let content_type = req
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let parsed = match content_type.as_deref() {
            Some(ct) if ct.starts_with("application/x-www-form-urlencoded") => {
                let bytes = body::buffer(req).await?;
                Self::from_urlencoded(&bytes)
            }
            Some(ct) if ct.starts_with("multipart/form-data") => {
                let boundary = multer::parse_boundary(ct)
                    .map_err(|e| Error::bad_request(format!("invalid multipart body: {e}")))?;
                let bytes = body::buffer(req).await?;
                Self::from_multipart(bytes, boundary).await?
            }
            Some(ct) if ct.starts_with("application/json") => {
                let bytes = body::buffer(req).await?;
                Self::from_json(&bytes)?
            }
            _ => BodyParams::default(),
        };

        let parsed = Arc::new(parsed);
        req.extensions_mut().insert(parsed.clone());
        Ok(parsed)
    }

    fn from_urlencoded(bytes: &Bytes) -> BodyParams {
        let form = url::form_urlencoded::parse(bytes)
            .into_owned()
            .collect::<HashMap<String, String>>();
        BodyParams {
            form,
            ..BodyParams::default()
        }
    }

    fn from_json(bytes: &Bytes) -> Result<BodyParams, Error> {
        if bytes.is_empty() {
            return Ok(BodyParams::default());
        }
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| Error::bad_request(format!("invalid JSON body: {e}")))?;

        // Top-level scalars feed the form bag so precedence lookups work the
        // same for JSON clients; the raw value is kept for DTO construction.
        let mut form = HashMap::new();
        if let Value::Object(object) = &value {
            for (key, val) in object {
                match val {
                    Value::String(s) => {
                        form.insert(key.clone(), s.clone());
                    }
                    Value::Number(n) => {
                        form.insert(key.clone(), n.to_string());
                    }
                    Value::Bool(b) => {
                        form.insert(key.clone(), b.to_string());
                    }
                    _ => {}
                }
            }
        }

        Ok(BodyParams {
            form,
            uploads: HashMap::new(),
            json: Some(value),
        })
    }

    async fn from_multipart(bytes: Bytes, boundary: String) -> Result<BodyParams, Error> {
        let upload_config = config::current().upload.clone();
        let stream = futures_util::stream::once(async move {
            Ok::<Bytes, std::convert::Infallible>(bytes)
        });
        let mut multipart = multer::Multipart::new(stream, boundary);

        let mut form = HashMap::new();
        let mut uploads = HashMap::new();

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| Error::bad_request(format!("invalid multipart body: {e}")))?
        {
            let name = match field.name() {
                Some(name) => name.to_string(),
                None => continue,
            };

            if field.file_name().is_some() {
                let filename = field.file_name().map(str::to_string);
                let content_type = field.content_type().map(|m| m.to_string());
                let headers = field
                    .headers()
                    .iter()
                    .filter_map(|(k, v)| {
                        v.to_str().ok().map(|v| (k.to_string(), v.to_string()))
                    })
                    .collect();

                let data = field
                    .bytes()
                    .await
                    .map_err(|e| Error::bad_request(format!("invalid multipart part: {e}")))?;
                if data.len() as u64 > upload_config.max_file_size {
                    return Err(Error::bad_request(format!(
                        "uploaded file exceeds {} bytes",
                        upload_config.max_file_size
                    ))
                    .with_source(name));
                }

                let path = uploads::temp_path(&upload_config);
                let mut file = tokio::fs::File::create(&path)
                    .await
                    .map_err(|e| Error::internal(format!("failed to create temp file: {e}")))?;
                file.write_all(&data)
                    .await
                    .map_err(|e| Error::internal(format!("failed to write temp file: {e}")))?;
                file.flush()
                    .await
                    .map_err(|e| Error::internal(format!("failed to flush temp file: {e}")))?;

                uploads.insert(
                    name,
                    UploadedFile {
                        filename,
                        path,
                        size: data.len() as u64,
                        content_type,
                        headers,
                    },
                );
            } else {
                let text = field
                    .text()
                    .await
                    .map_err(|e| Error::bad_request(format!("invalid multipart part: {e}")))?;
                form.insert(name, text);
            }
        }

        Ok(BodyParams {
            form,
            uploads,
            json: None,
        })
    }

    /// Form field value, when present.
    pub fn form(&self, key: &str) -> Option<&str> {
        self.form.get(key).map(String::as_str)
    }

    /// The raw JSON body value, when the body was `application/json`.
    pub fn json(&self) -> Option<&Value> {
        self.json.as_ref()
    }

    /// Uploaded files keyed by field name.
    pub fn uploads(&self) -> &HashMap<String, UploadedFile> {
        &self.uploads
    }
}

/// Merged view over path, query, and body parameters.
pub struct Params {
    path: HashMap<String, String>,
    query: HashMap<String, String>,
    body: Arc<BodyParams>,
}

impl Params {
    /// Builds the merged view for a request, parsing the body on first use.
    pub async fn load(req: &mut Request) -> Result<Params, Error> {
        let body = BodyParams::load(req).await?;
        let path = req
            .extensions()
            .get::<PathParams>()
            .map(|p| p.0.as_ref().clone())
            .unwrap_or_default();
        let query = req
            .uri()
            .query()
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default();

        Ok(Params { path, query, body })
    }

    /// Looks a key up across the three bags: form first, then path, then
    /// query.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.body
            .form(key)
            .or_else(|| self.path.get(key).map(String::as_str))
            .or_else(|| self.query.get(key).map(String::as_str))
    }

    /// Typed fetch of a required parameter.
    ///
    /// Missing values and conversion failures both surface as `BadRequest`
    /// carrying the parameter name.
    pub fn fetch<T: FromStr>(&self, key: &str) -> Result<T, Error> {
        let raw = self
            .get(key)
            .ok_or_else(|| Error::bad_request(format!("missing parameter {key}")).with_source(key))?;
        raw.parse().map_err(|_| {
            Error::bad_request(format!("parameter {key} has an invalid value")).with_source(key)
        })
    }

    /// Typed fetch of an optional parameter. Present-but-invalid values are
    /// still an error.
    pub fn fetch_opt<T: FromStr>(&self, key: &str) -> Result<Option<T>, Error> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| {
                Error::bad_request(format!("parameter {key} has an invalid value")).with_source(key)
            }),
        }
    }

    pub fn path(&self) -> &HashMap<String, String> {
        &self.path
    }

    pub fn query(&self) -> &HashMap<String, String> {
        &self.query
    }

    pub fn uploads(&self) -> &HashMap<String, UploadedFile> {
        self.body.uploads()
    }

    /// The raw JSON body value, when the body was `application/json`.
    pub fn json_body(&self) -> Option<&Value> {
        self.body.json()
    }

    /// Merges all bags (respecting precedence) into a JSON object with
    /// scalar coercion, for deserializing request DTOs.
    pub fn to_json_map(&self) -> Map<String, Value> {
        let mut merged: HashMap<&str, &str> = HashMap::new();
        for (k, v) in &self.query {
            merged.insert(k, v);
        }
        for (k, v) in &self.path {
            merged.insert(k, v);
        }
        for (k, v) in &self.body.form {
            merged.insert(k, v);
        }

        let mut out = Map::new();
        for (k, v) in merged {
            out.insert(k.to_string(), coerce_scalar(v));
        }
        out
    }
}

/// Coerces a string parameter into the narrowest JSON scalar that parses.
fn coerce_scalar(value: &str) -> Value {
    if let Ok(n) = value.parse::<i64>() {
        Value::Number(n.into())
    } else if let Ok(n) = value.parse::<u64>() {
        Value::Number(n.into())
    } else if let Ok(n) = value.parse::<f64>() {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(value.to_string()))
    } else if let Ok(b) = value.parse::<bool>() {
        Value::Bool(b)
    } else {
        Value::String(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::HibanaBody;

    fn form_request(uri: &str, body: &str) -> Request {
        http::Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/x-www-form-urlencoded")
            .body(HibanaBody::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn precedence_is_form_then_path_then_query() {
        let mut req = form_request("/things?key=query&only_query=q", "key=form");
        req.extensions_mut().insert(PathParams(Arc::new(
            [
                ("key".to_string(), "path".to_string()),
                ("only_path".to_string(), "p".to_string()),
            ]
            .into_iter()
            .collect(),
        )));

        let params = Params::load(&mut req).await.unwrap();
        assert_eq!(params.get("key"), Some("form"));
        assert_eq!(params.get("only_path"), Some("p"));
        assert_eq!(params.get("only_query"), Some("q"));
        assert_eq!(params.get("absent"), None);
    }

    #[tokio::test]
    async fn body_parse_is_shared_between_loads() {
        let mut req = form_request("/things", "a=1");
        let first = BodyParams::load(&mut req).await.unwrap();
        let second = BodyParams::load(&mut req).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn typed_fetch_reports_the_field() {
        let mut req = form_request("/things", "count=twelve");
        let params = Params::load(&mut req).await.unwrap();

        let value: Result<u32, _> = params.fetch("count");
        let err = value.unwrap_err();
        assert_eq!(err.status(), http::StatusCode::BAD_REQUEST);
        assert_eq!(err.source_param(), Some("count"));

        let missing: Result<u32, _> = params.fetch("absent");
        assert_eq!(missing.unwrap_err().source_param(), Some("absent"));
    }

    #[tokio::test]
    async fn json_bodies_populate_the_form_bag() {
        let mut req = http::Request::builder()
            .method("POST")
            .uri("/things")
            .header("content-type", "application/json")
            .body(HibanaBody::from(r#"{"name":"lamp","count":3,"nested":{"x":1}}"#))
            .unwrap();

        let params = Params::load(&mut req).await.unwrap();
        assert_eq!(params.get("name"), Some("lamp"));
        assert_eq!(params.get("count"), Some("3"));
        // Non-scalars stay in the raw JSON value only.
        assert_eq!(params.get("nested"), None);
        assert!(params.json_body().is_some());
    }

    #[tokio::test]
    async fn multipart_fields_and_uploads_are_parsed() {
        let boundary = "xyzzy";
        let body = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"title\"\r\n\r\n\
             hello\r\n\
             --{boundary}\r\n\
             Content-Disposition: form-data; name=\"doc\"; filename=\"a.txt\"\r\n\
             Content-Type: text/plain\r\n\r\n\
             file-contents\r\n\
             --{boundary}--\r\n"
        );
        let mut req = http::Request::builder()
            .method("POST")
            .uri("/upload")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(HibanaBody::from(body))
            .unwrap();

        let params = Params::load(&mut req).await.unwrap();
        assert_eq!(params.get("title"), Some("hello"));

        let upload = params.uploads().get("doc").unwrap();
        assert_eq!(upload.filename.as_deref(), Some("a.txt"));
        assert_eq!(upload.size, "file-contents".len() as u64);
        assert_eq!(upload.content_type.as_deref(), Some("text/plain"));
        let written = tokio::fs::read_to_string(&upload.path).await.unwrap();
        assert_eq!(written, "file-contents");
        tokio::fs::remove_file(&upload.path).await.unwrap();
    }

    #[test]
    fn scalar_coercion_prefers_numbers() {
        assert_eq!(coerce_scalar("42"), Value::Number(42.into()));
        assert_eq!(coerce_scalar("true"), Value::Bool(true));
        assert_eq!(coerce_scalar("lamp"), Value::String("lamp".to_string()));
    }
}
