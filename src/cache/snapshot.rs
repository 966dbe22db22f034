//! Cache identities and stored response captures.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::http::{Headers, Request, Response, StatusCode};

/// Canonical identity of a cacheable request: method plus target
/// (query string included).
///
/// Two requests with the same method and target always map to the same
/// cached entry.
///
/// # Examples
///
/// ```
/// use offramp::cache::CacheKey;
/// use offramp::http::{Method, Request};
///
/// let req = Request::new(Method::Get, "/api/models?limit=5");
/// let key = CacheKey::for_request(&req);
/// assert_eq!(key.as_str(), "GET /api/models?limit=5");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derives the key for a request.
    pub fn for_request(request: &Request) -> Self {
        Self(format!("{} {}", request.method().as_str(), request.target()))
    }

    /// Derives the key for a GET of the given target, e.g. the application
    /// root document or an install-time asset.
    pub fn for_get(target: &str) -> Self {
        Self(format!("GET {target}"))
    }

    /// Returns the canonical string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable capture of a response at the time it was cached: status,
/// headers, and body.
///
/// Snapshots are owned by their partition; handing one back to a client
/// always goes through [`ResponseSnapshot::to_response`], which copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSnapshot {
    status: StatusCode,
    headers: Headers,
    body: Vec<u8>,
}

impl ResponseSnapshot {
    /// Captures a response.
    pub fn capture(response: &Response) -> Self {
        Self {
            status: response.status(),
            headers: response.headers().clone(),
            body: response.body_bytes().to_vec(),
        }
    }

    /// Builds a snapshot directly from parts (used by cache warming, where
    /// the UI supplies payloads rather than live responses).
    pub fn from_parts(status: StatusCode, headers: Headers, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// Returns the captured status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the captured body bytes.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Rehydrates the snapshot into a servable response.
    pub fn to_response(&self) -> Response {
        Response::from_parts(
            self.status,
            self.headers.clone(),
            Bytes::copy_from_slice(&self.body),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;

    #[test]
    fn key_includes_query() {
        let a = CacheKey::for_request(&Request::new(Method::Get, "/api/models?limit=5"));
        let b = CacheKey::for_request(&Request::new(Method::Get, "/api/models"));
        assert_ne!(a, b);
    }

    #[test]
    fn key_distinguishes_methods() {
        let get = CacheKey::for_request(&Request::new(Method::Get, "/api/messages"));
        let post = CacheKey::for_request(&Request::new(Method::Post, "/api/messages"));
        assert_ne!(get, post);
    }

    #[test]
    fn snapshot_round_trips_body_exactly() {
        let original = Response::new(StatusCode::OK)
            .header("Content-Type", "application/json")
            .body(r#"{"data":[1,2,3]}"#);
        let snap = ResponseSnapshot::capture(&original);
        let restored = snap.to_response();
        assert_eq!(restored.status(), StatusCode::OK);
        assert_eq!(restored.body_bytes(), original.body_bytes());
        assert_eq!(restored.headers(), original.headers());
    }

    #[test]
    fn snapshot_serde_round_trip() {
        let snap = ResponseSnapshot::from_parts(
            StatusCode::OK,
            Headers::from_iter([("Content-Type", "text/css")]),
            b"body { margin: 0 }".to_vec(),
        );
        let json = serde_json::to_string(&snap).unwrap();
        let back: ResponseSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(snap, back);
    }
}
