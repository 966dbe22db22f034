//! Request classification and the per-class serving strategies.
//!
//! Every intercepted request is classified by [`classify`] — a pure
//! function of its method, path, and headers — and dispatched to one of
//! four strategies:
//!
//! | Class        | Strategy                                                  |
//! |--------------|-----------------------------------------------------------|
//! | `Api`        | network-first, runtime cache, fallback catalog, 503        |
//! | `StaticAsset`| cache-first, network on miss, raw error propagation        |
//! | `Navigation` | network, cached root document, inline offline page         |
//! | `Other`      | network, any-partition cache, raw error propagation        |
//!
//! Classification order matters and first match wins; no cache or network
//! state ever influences which strategy runs.

use tracing::{debug, warn};

use crate::cache::{CacheKey, ResponseSnapshot};
use crate::context::{ProxyConfig, ProxyContext};
use crate::fallback;
use crate::http::{Method, Request, Response, StatusCode};
use crate::queue::DeferredWrite;
use crate::upstream::FetchError;

/// File extensions served cache-first as static assets.
const STATIC_EXTENSIONS: [&str; 6] = ["js", "css", "png", "jpg", "svg", "ico"];

/// Self-contained offline page for navigations with no cached document.
/// No external resource references — it must render with nothing else
/// available.
const OFFLINE_PAGE: &str = "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n<title>Offline</title>\n<style>body{font-family:system-ui,sans-serif;display:flex;align-items:center;justify-content:center;height:100vh;margin:0;background:#f5f5f5;color:#333}main{text-align:center}h1{font-size:1.5rem}</style>\n</head>\n<body>\n<main>\n<h1>You are offline</h1>\n<p>This page is not available offline. It will load once the connection returns.</p>\n</main>\n</body>\n</html>\n";

/// The four request classes the router distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    Api,
    StaticAsset,
    Navigation,
    Other,
}

/// Classifies a request. Pure: depends only on the request's method, path,
/// and `Accept` header plus the static configuration, never on cache or
/// network state.
///
/// First match wins, in this order: API prefix, static-asset pattern,
/// page navigation, everything else.
pub fn classify(request: &Request, config: &ProxyConfig) -> RequestClass {
    let path = request.path();

    if path.starts_with(&config.api_prefix) {
        return RequestClass::Api;
    }

    let is_static = path.starts_with(&config.assets_prefix)
        || path == config.manifest_path
        || path
            .rsplit_once('.')
            .is_some_and(|(_, ext)| STATIC_EXTENSIONS.contains(&ext));
    if is_static {
        return RequestClass::StaticAsset;
    }

    if request.method() == &Method::Get && request.accepts_html() {
        return RequestClass::Navigation;
    }

    RequestClass::Other
}

/// Dispatches an intercepted request to its strategy.
///
/// Cross-origin requests (absolute-form targets) bypass classification
/// entirely: they are forwarded through the fetch seam with no cache,
/// fallback, or queue participation, and their transport errors propagate.
///
/// # Errors
///
/// Only the static-asset and passthrough strategies may surface a raw
/// [`FetchError`]; API and navigation always produce a response.
pub async fn handle(ctx: &ProxyContext, request: &Request) -> Result<Response, FetchError> {
    if request.is_absolute_form() {
        debug!(url = request.target(), "cross-origin request passed through un-intercepted");
        return ctx.fetch(request).await;
    }

    let class = classify(request, ctx.config());
    debug!(method = %request.method(), path = request.path(), ?class, "request classified");
    match class {
        RequestClass::Api => Ok(api_strategy(ctx, request).await),
        RequestClass::StaticAsset => static_strategy(ctx, request).await,
        RequestClass::Navigation => Ok(navigation_strategy(ctx, request).await),
        RequestClass::Other => passthrough_strategy(ctx, request).await,
    }
}

/// Network-first. The terminal behavior is always a well-formed response;
/// the raw transport error never reaches the UI.
async fn api_strategy(ctx: &ProxyContext, request: &Request) -> Response {
    let key = CacheKey::for_request(request);
    let runtime = ctx.lifecycle().runtime_partition();

    match ctx.fetch(request).await {
        Ok(response) => {
            if response.status().is_success() {
                // Opportunistic capture; failure to store must not fail the
                // response, and the store already treats its I/O as soft.
                ctx.store()
                    .write(&runtime, key, ResponseSnapshot::capture(&response))
                    .await;
            }
            response
        }
        Err(transport) => {
            debug!(path = request.path(), error = %transport, "api fetch failed — serving offline");

            if request.method().is_mutating() {
                let write = DeferredWrite::from_request(request);
                if let Err(e) = ctx.queue().enqueue(write).await {
                    warn!(path = request.path(), error = %e, "deferred write not journaled");
                }
            }

            if let Some(snapshot) = ctx.store().read(&runtime, &key) {
                return snapshot.to_response();
            }
            if let Some(response) = ctx.fallback_response(request.path()) {
                return response;
            }
            fallback::offline_response()
        }
    }
}

/// Cache-first: `static` then `runtime`, first hit wins with no network
/// attempt. A miss fetches and stores; a transport failure on miss is the
/// one case that propagates raw, since no safe fallback exists for
/// arbitrary assets.
async fn static_strategy(ctx: &ProxyContext, request: &Request) -> Result<Response, FetchError> {
    let key = CacheKey::for_request(request);
    let static_partition = ctx.lifecycle().static_partition();
    let runtime = ctx.lifecycle().runtime_partition();

    if let Some(snapshot) = ctx
        .store()
        .read(&static_partition, &key)
        .or_else(|| ctx.store().read(&runtime, &key))
    {
        return Ok(snapshot.to_response());
    }

    let response = ctx.fetch(request).await?;
    if response.status().is_success() {
        ctx.store()
            .write(&static_partition, key, ResponseSnapshot::capture(&response))
            .await;
    }
    Ok(response)
}

/// Network, then the cached root document, then the inline offline page.
/// Navigation must always render something.
async fn navigation_strategy(ctx: &ProxyContext, request: &Request) -> Response {
    match ctx.fetch(request).await {
        Ok(response) => response,
        Err(transport) => {
            debug!(path = request.path(), error = %transport, "navigation fetch failed");
            let root_key = CacheKey::for_get(&ctx.config().root_document);
            let cached_root = ctx
                .store()
                .read(&ctx.lifecycle().static_partition(), &root_key)
                .or_else(|| ctx.store().read(&ctx.lifecycle().runtime_partition(), &root_key));
            match cached_root {
                Some(snapshot) => snapshot.to_response(),
                None => Response::new(StatusCode::OK)
                    .header("Content-Type", "text/html; charset=utf-8")
                    .body(OFFLINE_PAGE),
            }
        }
    }
}

/// Network attempt, any-partition cache on failure, otherwise the transport
/// error propagates untouched.
async fn passthrough_strategy(ctx: &ProxyContext, request: &Request) -> Result<Response, FetchError> {
    match ctx.fetch(request).await {
        Ok(response) => Ok(response),
        Err(transport) => {
            let key = CacheKey::for_request(request);
            match ctx.store().read_any(&key) {
                Some(snapshot) => Ok(snapshot.to_response()),
                None => Err(transport),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ProxyConfig, ProxyContext};
    use crate::upstream::{Fetch, FetchFuture};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Scriptable fetch double: counts calls and either answers every
    /// request with a canned 200 or fails with a transport error.
    struct FakeNetwork {
        online: bool,
        calls: AtomicUsize,
    }

    impl FakeNetwork {
        fn online() -> Arc<Self> {
            Arc::new(Self {
                online: true,
                calls: AtomicUsize::new(0),
            })
        }

        fn offline() -> Arc<Self> {
            Arc::new(Self {
                online: false,
                calls: AtomicUsize::new(0),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Fetch for FakeNetwork {
        fn fetch(&self, request: &Request) -> FetchFuture {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let online = self.online;
            let target = request.target().to_owned();
            Box::pin(async move {
                if online {
                    Ok(Response::new(StatusCode::OK)
                        .header("Content-Type", "application/json")
                        .body(format!(r#"{{"from":"network","target":"{target}"}}"#)))
                } else {
                    Err(FetchError::Timeout(Duration::from_millis(1)))
                }
            })
        }
    }

    async fn context_with(network: Arc<FakeNetwork>) -> Arc<ProxyContext> {
        let (ctx, _rx) =
            ProxyContext::initialize_with(ProxyConfig::new("127.0.0.1:0"), network)
                .await
                .unwrap();
        ctx
    }

    fn get(target: &str) -> Request {
        Request::new(Method::Get, target)
    }

    #[tokio::test]
    async fn classification_table() {
        let ctx = context_with(FakeNetwork::online()).await;
        let cases = [
            (get("/api/health"), RequestClass::Api),
            (get("/api/conversations?limit=10"), RequestClass::Api),
            (get("/assets/logo.bin"), RequestClass::StaticAsset),
            (get("/app.js"), RequestClass::StaticAsset),
            (get("/styles.css"), RequestClass::StaticAsset),
            (get("/favicon.ico"), RequestClass::StaticAsset),
            (get("/manifest.json"), RequestClass::StaticAsset),
            (get("/inbox").header("Accept", "text/html"), RequestClass::Navigation),
            (get("/inbox").header("Accept", "application/json"), RequestClass::Other),
            (Request::new(Method::Post, "/upload"), RequestClass::Other),
        ];
        for (request, expected) in cases {
            assert_eq!(
                classify(&request, ctx.config()),
                expected,
                "misclassified {} {}",
                request.method(),
                request.target()
            );
        }
    }

    #[tokio::test]
    async fn classification_ignores_cache_state() {
        // Same request classifies identically before and after a cache write.
        let ctx = context_with(FakeNetwork::online()).await;
        let request = get("/api/health");
        let before = classify(&request, ctx.config());
        handle(&ctx, &request).await.unwrap();
        assert_eq!(classify(&request, ctx.config()), before);
    }

    #[tokio::test]
    async fn api_success_is_captured_in_runtime_partition() {
        let ctx = context_with(FakeNetwork::online()).await;
        let request = get("/api/models");
        let response = handle(&ctx, &request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let key = CacheKey::for_request(&request);
        let snap = ctx
            .store()
            .read(&ctx.lifecycle().runtime_partition(), &key)
            .expect("success response captured");
        assert_eq!(snap.body(), response.body_bytes().as_ref());
    }

    #[tokio::test]
    async fn api_offline_serves_cached_snapshot_byte_for_byte() {
        let online = FakeNetwork::online();
        let ctx = context_with(Arc::clone(&online)).await;
        let request = get("/api/models");
        let live = handle(&ctx, &request).await.unwrap();

        let ctx_offline = {
            // Same store contents, network now failing.
            let key = CacheKey::for_request(&request);
            let snap = ctx
                .store()
                .read(&ctx.lifecycle().runtime_partition(), &key)
                .unwrap();
            let ctx2 = context_with(FakeNetwork::offline()).await;
            ctx2.store()
                .write(&ctx2.lifecycle().runtime_partition(), key, snap)
                .await;
            ctx2
        };

        let cached = handle(&ctx_offline, &request).await.unwrap();
        assert_eq!(cached.body_bytes(), live.body_bytes());
    }

    #[tokio::test]
    async fn api_health_fallback_when_no_cache() {
        let ctx = context_with(FakeNetwork::offline()).await;
        let response = handle(&ctx, &get("/api/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(response.body_bytes()).unwrap();
        assert_eq!(
            body,
            serde_json::json!({"success": true, "data": {"status": "offline", "offline": true}})
        );
    }

    #[tokio::test]
    async fn unknown_api_path_offline_gets_503() {
        let ctx = context_with(FakeNetwork::offline()).await;
        let response = handle(&ctx, &get("/api/does-not-exist")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value = serde_json::from_slice(response.body_bytes()).unwrap();
        assert_eq!(body["offline"], serde_json::json!(true));
        assert_eq!(body["success"], serde_json::json!(false));
    }

    #[tokio::test]
    async fn offline_mutating_request_is_deferred() {
        let ctx = context_with(FakeNetwork::offline()).await;
        let request = Request::new(Method::Post, "/api/messages").body(&br#"{"text":"hi"}"#[..]);
        let response = handle(&ctx, &request).await.unwrap();

        // Still answered (503 here — no cache, no fallback for this path)...
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        // ...and preserved for replay.
        assert_eq!(ctx.queue().len(), 1);
        let queued = &ctx.queue().snapshot()[0];
        assert_eq!(queued.path, "/api/messages");
        assert_eq!(queued.payload, br#"{"text":"hi"}"#);
    }

    #[tokio::test]
    async fn offline_read_request_is_not_deferred() {
        let ctx = context_with(FakeNetwork::offline()).await;
        handle(&ctx, &get("/api/does-not-exist")).await.unwrap();
        assert!(ctx.queue().is_empty());
    }

    #[tokio::test]
    async fn static_cache_hit_never_touches_network() {
        let network = FakeNetwork::online();
        let ctx = context_with(Arc::clone(&network)).await;
        let request = get("/app.js");

        // First request misses and populates the static partition.
        handle(&ctx, &request).await.unwrap();
        assert_eq!(network.call_count(), 1);

        // Second request must be served without any fetch.
        let response = handle(&ctx, &request).await.unwrap();
        assert_eq!(network.call_count(), 1);
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn static_miss_offline_propagates_transport_error() {
        let ctx = context_with(FakeNetwork::offline()).await;
        let err = handle(&ctx, &get("/never-seen.css")).await.unwrap_err();
        assert!(matches!(err, FetchError::Timeout(_)));
    }

    #[tokio::test]
    async fn navigation_offline_serves_cached_root() {
        let ctx = context_with(FakeNetwork::offline()).await;
        ctx.store()
            .write(
                &ctx.lifecycle().static_partition(),
                CacheKey::for_get("/"),
                ResponseSnapshot::from_parts(
                    StatusCode::OK,
                    Default::default(),
                    b"<html>app shell</html>".to_vec(),
                ),
            )
            .await;

        let request = get("/conversations/42").header("Accept", "text/html");
        let response = handle(&ctx, &request).await.unwrap();
        assert_eq!(response.body_bytes().as_ref(), b"<html>app shell</html>");
    }

    #[tokio::test]
    async fn navigation_offline_without_cache_renders_offline_page() {
        let ctx = context_with(FakeNetwork::offline()).await;
        let request = get("/anywhere").header("Accept", "text/html");
        let response = handle(&ctx, &request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let html = std::str::from_utf8(response.body_bytes()).unwrap();
        assert!(html.contains("You are offline"));
        // Self-contained: no external scripts, stylesheets, or images.
        assert!(!html.contains("src="));
        assert!(!html.contains("href="));
    }

    #[tokio::test]
    async fn passthrough_offline_without_cache_propagates() {
        let ctx = context_with(FakeNetwork::offline()).await;
        let request = get("/odd-endpoint").header("Accept", "application/json");
        let err = handle(&ctx, &request).await.unwrap_err();
        assert!(matches!(err, FetchError::Timeout(_)));
    }

    #[tokio::test]
    async fn passthrough_offline_with_cache_serves_snapshot() {
        let ctx = context_with(FakeNetwork::offline()).await;
        let request = get("/odd-endpoint").header("Accept", "application/json");
        ctx.store()
            .write(
                crate::cache::WARM_PARTITION,
                CacheKey::for_request(&request),
                ResponseSnapshot::from_parts(StatusCode::OK, Default::default(), b"odd".to_vec()),
            )
            .await;
        let response = handle(&ctx, &request).await.unwrap();
        assert_eq!(response.body_bytes().as_ref(), b"odd");
    }

    #[tokio::test]
    async fn cross_origin_bypasses_cache_entirely() {
        let network = FakeNetwork::online();
        let ctx = context_with(Arc::clone(&network)).await;
        let request = get("http://third.party/api/health");
        handle(&ctx, &request).await.unwrap();

        assert_eq!(network.call_count(), 1);
        // Nothing captured anywhere for a cross-origin target.
        assert!(ctx.store().read_any(&CacheKey::for_request(&request)).is_none());
    }
}
