//! HTTP/1.1 request parsing and construction.
//!
//! Intercepted requests arrive as raw bytes and are parsed with the
//! [`httparse`] crate. The proxy also *builds* requests of its own — asset
//! prefetches during install and deferred-write replays — so a small
//! builder API lives alongside the parser.

use bytes::Bytes;
use thiserror::Error;

use super::{Headers, Method};

/// Errors that can occur while parsing an HTTP/1.1 request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete — more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },
}

/// An HTTP request, either intercepted off the wire or built by the proxy.
///
/// The `target` is kept exactly as received: origin-form (`/api/health`)
/// for same-origin traffic, absolute-form (`http://other.example/x`) for
/// proxy-style cross-origin requests, which the cache layer must ignore.
///
/// # Examples
///
/// ```
/// use offramp::http::Request;
///
/// let raw = b"GET /api/models?limit=5 HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let (request, _offset) = Request::parse(raw).unwrap();
///
/// assert_eq!(request.method().as_str(), "GET");
/// assert_eq!(request.path(), "/api/models");
/// assert_eq!(request.query(), Some("limit=5"));
/// assert!(!request.is_absolute_form());
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    target: String,
    headers: Headers,
    body: Bytes,
}

impl Request {
    /// Maximum number of headers we support per request.
    const MAX_HEADERS: usize = 64;

    /// Builds a request programmatically (install prefetch, replay).
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Appends a header, builder-style.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the request body, builder-style.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Parse a raw HTTP/1.1 request from a byte slice.
    ///
    /// Returns the parsed `Request` and the byte offset at which the body
    /// begins in `buf` (immediately after the `\r\n\r\n` terminator).
    ///
    /// The body is framed by `Content-Length`: exactly that many bytes are
    /// captured (fewer if the buffer ends early), never more. Anything past
    /// the declared length belongs to the next pipelined request and stays
    /// with the caller's buffer.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`] — more data is needed to complete the headers.
    /// - [`RequestError::Parse`] — the data is malformed.
    /// - [`RequestError::MissingField`] — method or target is absent.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let body_offset = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let method: Method = raw_req
            .method
            .ok_or(RequestError::MissingField { field: "method" })?
            .parse()
            .unwrap(); // Infallible

        let target = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "target" })?
            .to_owned();

        let mut header_map = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.insert(header.name, value);
            }
        }

        let declared = header_map
            .get("content-length")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);
        let available = buf.len() - body_offset;
        let body = Bytes::copy_from_slice(&buf[body_offset..body_offset + declared.min(available)]);

        Ok((
            Self {
                method,
                target,
                headers: header_map,
                body,
            },
            body_offset,
        ))
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the request target exactly as received.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Returns the path component of the target (query excluded).
    pub fn path(&self) -> &str {
        match self.target.find('?') {
            Some(pos) => &self.target[..pos],
            None => &self.target,
        }
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query(&self) -> Option<&str> {
        self.target.find('?').map(|pos| &self.target[pos + 1..])
    }

    /// Returns `true` if the target is absolute-form (`http://…`), i.e. a
    /// proxy-style request for another origin.
    pub fn is_absolute_form(&self) -> bool {
        self.target.starts_with("http://") || self.target.starts_with("https://")
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the request body bytes.
    pub fn body_bytes(&self) -> &Bytes {
        &self.body
    }

    /// Returns `true` if the connection should be kept alive after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close` is set.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(conn) => !conn.eq_ignore_ascii_case("close"),
            None => true,
        }
    }

    /// Returns the value of the `Content-Length` header parsed as a `usize`, if present.
    pub fn content_length(&self) -> Option<usize> {
        self.headers.get("content-length")?.parse().ok()
    }

    /// Returns `true` if the client advertises that it accepts HTML — the
    /// marker the strategy router uses for page navigations.
    pub fn accepts_html(&self) -> bool {
        self.headers
            .get("accept")
            .is_some_and(|accept| accept.contains("text/html"))
    }

    /// Serializes the request into HTTP/1.1 wire format for an upstream send.
    ///
    /// `Content-Length` is always written; any stale one from the original
    /// parse is replaced.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut headers = self.headers.clone();
        headers.remove("content-length");
        headers.remove("connection");

        let mut out = Vec::with_capacity(128 + headers.len() * 64 + self.body.len());
        out.extend_from_slice(
            format!("{} {} HTTP/1.1\r\n", self.method.as_str(), self.target).as_bytes(),
        );
        for (name, value) in headers.iter() {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        out.extend_from_slice(b"Connection: close\r\n\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}
