//! Synthesized offline responses for request paths with known-safe answers.
//!
//! When neither network nor cache can answer an API request, the catalog is
//! consulted by path prefix. Entries are canned JSON payloads that are safe
//! to fabricate offline — a health probe, the model list, the conversation
//! index. Anything else gets the generic 503 offline response.

use serde_json::json;

use crate::http::{Response, StatusCode};

/// Message carried by the generic offline response body.
pub const OFFLINE_MESSAGE: &str = "Offline - this feature requires an internet connection";

/// One catalog entry: a path prefix and the payload synthesized for it.
#[derive(Debug, Clone)]
pub struct FallbackEntry {
    prefix: String,
    payload: serde_json::Value,
}

/// Static mapping from request-path prefixes to synthesized offline payloads.
///
/// Lookup is longest-prefix-wins, so `/api/models/default` can shadow
/// `/api/models` if both are registered.
#[derive(Debug, Clone, Default)]
pub struct FallbackCatalog {
    entries: Vec<FallbackEntry>,
}

impl FallbackCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a catalog pre-populated with the standard application
    /// fallbacks: health, models, and conversations.
    pub fn with_defaults() -> Self {
        let mut catalog = Self::new();
        catalog.insert(
            "/api/health",
            json!({"success": true, "data": {"status": "offline", "offline": true}}),
        );
        catalog.insert("/api/models", json!({"success": true, "data": []}));
        catalog.insert("/api/conversations", json!({"success": true, "data": []}));
        catalog
    }

    /// Registers or replaces the payload for a prefix.
    ///
    /// Replacing lets the UI refresh data-bearing fallbacks (the cached
    /// model names, the last known conversation list) as fresher data is
    /// observed.
    pub fn insert(&mut self, prefix: impl Into<String>, payload: serde_json::Value) {
        let prefix = prefix.into();
        if let Some(existing) = self.entries.iter_mut().find(|e| e.prefix == prefix) {
            existing.payload = payload;
        } else {
            self.entries.push(FallbackEntry { prefix, payload });
        }
    }

    /// Finds the payload for the longest matching prefix, if any.
    pub fn lookup(&self, path: &str) -> Option<&serde_json::Value> {
        self.entries
            .iter()
            .filter(|e| path.starts_with(e.prefix.as_str()))
            .max_by_key(|e| e.prefix.len())
            .map(|e| &e.payload)
    }

    /// Synthesizes the 200 response for a path, if a fallback is registered.
    pub fn respond(&self, path: &str) -> Option<Response> {
        self.lookup(path).map(Response::json)
    }
}

/// Synthesizes the generic offline response: HTTP 503 with a structured
/// body the UI can distinguish from a real backend failure.
pub fn offline_response() -> Response {
    Response::new(StatusCode::SERVICE_UNAVAILABLE)
        .header("Content-Type", "application/json")
        .body(
            json!({
                "success": false,
                "message": OFFLINE_MESSAGE,
                "offline": true,
            })
            .to_string(),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_fallback_shape() {
        let catalog = FallbackCatalog::with_defaults();
        let payload = catalog.lookup("/api/health").unwrap();
        assert_eq!(
            payload,
            &json!({"success": true, "data": {"status": "offline", "offline": true}})
        );
    }

    #[test]
    fn prefix_match_covers_subpaths() {
        let catalog = FallbackCatalog::with_defaults();
        assert!(catalog.lookup("/api/conversations/42").is_some());
        assert!(catalog.lookup("/api/unknown").is_none());
    }

    #[test]
    fn longest_prefix_wins() {
        let mut catalog = FallbackCatalog::new();
        catalog.insert("/api/models", json!({"which": "short"}));
        catalog.insert("/api/models/default", json!({"which": "long"}));
        assert_eq!(
            catalog.lookup("/api/models/default"),
            Some(&json!({"which": "long"}))
        );
        assert_eq!(
            catalog.lookup("/api/models/other"),
            Some(&json!({"which": "short"}))
        );
    }

    #[test]
    fn insert_replaces_existing_prefix() {
        let mut catalog = FallbackCatalog::with_defaults();
        catalog.insert("/api/models", json!({"success": true, "data": ["m1", "m2"]}));
        assert_eq!(
            catalog.lookup("/api/models").unwrap()["data"],
            json!(["m1", "m2"])
        );
    }

    #[test]
    fn offline_response_is_503_with_structured_body() {
        let resp = offline_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value = serde_json::from_slice(resp.body_bytes()).unwrap();
        assert_eq!(body["success"], json!(false));
        assert_eq!(body["offline"], json!(true));
        assert_eq!(body["message"], json!(OFFLINE_MESSAGE));
    }
}
