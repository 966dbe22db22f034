//! HTTP/1.1 response building and parsing.
//!
//! Responses flow in both directions through the proxy: upstream replies
//! are *parsed* (and possibly snapshotted into a cache partition), while
//! synthesized offline responses are *built* and serialized back to the
//! intercepted client.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{Headers, StatusCode};

/// Errors that can occur while parsing an upstream HTTP/1.1 response.
#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("response is incomplete — more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing status code in response")]
    MissingStatus,
}

/// An HTTP response, parsed from upstream or synthesized by the proxy.
///
/// # Examples
///
/// ```
/// use offramp::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::OK)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 15\r\n"));
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Bytes,
    keep_alive: bool,
}

impl Response {
    /// Maximum number of headers we support per response.
    const MAX_HEADERS: usize = 64;

    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
            keep_alive: true,
        }
    }

    /// Creates a response from parts, as when rehydrating a cached snapshot.
    pub fn from_parts(status: StatusCode, headers: Headers, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
            keep_alive: true,
        }
    }

    /// Creates a 200 response carrying a JSON payload.
    pub fn json(value: &serde_json::Value) -> Self {
        Self::new(StatusCode::OK)
            .header("Content-Type", "application/json")
            .body(value.to_string())
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the response body from a string.
    ///
    /// The `Content-Length` header is written automatically by [`into_bytes`](Self::into_bytes).
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Bytes::from(body.into());
        self
    }

    /// Sets the response body from raw bytes.
    #[must_use]
    pub fn body_from(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Controls whether `Connection: keep-alive` or `Connection: close` is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the response body bytes.
    pub fn body_bytes(&self) -> &Bytes {
        &self.body
    }

    /// Parse an upstream HTTP/1.1 response from a byte slice.
    ///
    /// Returns the parsed `Response` and the byte offset at which the body
    /// begins. The caller is responsible for having read the full body
    /// (`Content-Length` bytes past the offset, or until EOF).
    ///
    /// # Errors
    ///
    /// - [`ResponseError::Incomplete`] — the status line or headers are not
    ///   fully buffered yet.
    /// - [`ResponseError::Parse`] — malformed response data.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), ResponseError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw = httparse::Response::new(&mut headers);

        let body_offset = match raw.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(ResponseError::Incomplete),
        };

        let status = StatusCode::from_u16(raw.code.ok_or(ResponseError::MissingStatus)?);

        let mut header_map = Headers::with_capacity(raw.headers.len());
        for header in raw.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.insert(header.name, value);
            }
        }

        let body = Bytes::copy_from_slice(&buf[body_offset..]);

        Ok((
            Self {
                status,
                headers: header_map,
                body,
                keep_alive: true,
            },
            body_offset,
        ))
    }

    /// Returns the value of the `Content-Length` header parsed as a `usize`, if present.
    pub fn content_length(&self) -> Option<usize> {
        self.headers.get("content-length")?.parse().ok()
    }

    /// Serializes the response into a `BytesMut` buffer using HTTP/1.1 wire format.
    ///
    /// Automatically adds:
    /// - `Content-Type: text/plain; charset=utf-8` if the body is non-empty and no
    ///   `Content-Type` header was set.
    /// - `Content-Length: <n>` (always written, replacing any parsed one).
    /// - `Connection: keep-alive` or `Connection: close`.
    pub fn into_bytes(mut self) -> BytesMut {
        let content_length = self.body.len();

        if !self.body.is_empty() && !self.headers.contains("content-type") {
            self.headers
                .insert("Content-Type", "text/plain; charset=utf-8");
        }

        // Headers copied from an upstream parse may carry their own framing
        // fields; the serializer owns framing.
        self.headers.remove("content-length");
        self.headers.remove("transfer-encoding");
        self.headers.set(
            "Connection",
            if self.keep_alive { "keep-alive" } else { "close" },
        );

        let estimated_size = 128 + self.headers.len() * 64 + content_length;
        let mut buf = BytesMut::with_capacity(estimated_size);

        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );

        for (name, value) in self.headers.iter() {
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }

        // Content-Length is always the last header before the blank line
        buf.put(format!("Content-Length: {content_length}\r\n").as_bytes());
        buf.put(&b"\r\n"[..]);

        if !self.body.is_empty() {
            buf.put(self.body.as_ref());
        }

        buf
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::OK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_string(bytes: BytesMut) -> String {
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn simple_ok_response() {
        let r = Response::new(StatusCode::OK).body("Hello");
        let s = to_string(r.into_bytes());
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("Content-Length: 5\r\n"));
        assert!(s.ends_with("\r\n\r\nHello"));
    }

    #[test]
    fn json_body_sets_content_type() {
        let r = Response::json(&serde_json::json!({"success": true}));
        assert_eq!(r.status(), StatusCode::OK);
        assert_eq!(r.headers().get("content-type"), Some("application/json"));
        assert_eq!(r.body_bytes().as_ref(), br#"{"success":true}"#);
    }

    #[test]
    fn parse_upstream_response() {
        let raw = b"HTTP/1.1 201 Created\r\nContent-Type: application/json\r\nContent-Length: 2\r\n\r\n{}";
        let (r, offset) = Response::parse(raw).unwrap();
        assert_eq!(r.status().as_u16(), 201);
        assert_eq!(r.content_length(), Some(2));
        assert_eq!(&raw[offset..], b"{}");
    }

    #[test]
    fn parse_incomplete_response() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Ty";
        assert!(matches!(
            Response::parse(raw),
            Err(ResponseError::Incomplete)
        ));
    }

    #[test]
    fn reserialized_response_reframes() {
        // A parsed upstream response must not leak a stale Content-Length.
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
        let (r, offset) = Response::parse(raw).unwrap();
        let r = r.body_from(Bytes::copy_from_slice(&raw[offset..]));
        let s = to_string(r.into_bytes());
        assert_eq!(s.matches("Content-Length").count(), 1);
        assert!(s.contains("Content-Length: 2\r\n"));
    }

    #[test]
    fn connection_close() {
        let r = Response::new(StatusCode::OK).keep_alive(false);
        let s = to_string(r.into_bytes());
        assert!(s.contains("Connection: close\r\n"));
    }
}
