//! Proxy configuration and the shared context handed to every strategy.
//!
//! All shared state — cache store, fallback catalog, deferred-write queue,
//! lifecycle controller, upstream client — lives in one explicitly
//! constructed [`ProxyContext`]. It is built once when the proxy first
//! loads and passed (as an `Arc`) to each strategy handler; there are no
//! ambient singletons and no teardown, since the process persists until a
//! newer generation supersedes it.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::warn;

use crate::cache::{CacheKey, CacheStore, ResponseSnapshot, WARM_PARTITION};
use crate::fallback::FallbackCatalog;
use crate::http::{Headers, Request, Response, StatusCode};
use crate::lifecycle::Lifecycle;
use crate::queue::{DEFAULT_SYNC_TAG, DeferredWrite, DeferredWriteQueue, RecoveryOutcome};
use crate::upstream::{Fetch, FetchError, HttpUpstream};

/// File name of the deferred-write journal inside the store directory.
const JOURNAL_FILE: &str = "deferred-writes.json";

/// Configuration for one proxy instance.
///
/// Built with defaults that match the application's URL layout and refined
/// builder-style.
///
/// # Examples
///
/// ```
/// use offramp::context::ProxyConfig;
///
/// let config = ProxyConfig::new("127.0.0.1:3000")
///     .generation(2)
///     .required_assets(["/", "/app.js", "/styles.css"])
///     .api_prefix("/api");
/// assert_eq!(config.generation, 2);
/// ```
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Origin server address (`host:port`) for upstream fetches.
    pub upstream_addr: String,
    /// Generation tag of this instance.
    pub generation: u64,
    /// Path prefix classified as API traffic.
    pub api_prefix: String,
    /// Path prefix classified as static assets.
    pub assets_prefix: String,
    /// The web-app manifest path, treated as a static asset.
    pub manifest_path: String,
    /// The application root document, served to offline navigations.
    pub root_document: String,
    /// Assets prefetched at install; install fails if any is unavailable.
    pub required_assets: Vec<String>,
    /// Upstream fetch timeout.
    pub fetch_timeout: Duration,
    /// Directory for cache partitions and the write journal; `None` keeps
    /// everything in memory.
    pub store_dir: Option<PathBuf>,
    /// Recovery-trigger tag the deferred-write queue answers to.
    pub sync_tag: String,
}

impl ProxyConfig {
    /// Creates a configuration for the origin at `upstream_addr`.
    pub fn new(upstream_addr: impl Into<String>) -> Self {
        Self {
            upstream_addr: upstream_addr.into(),
            generation: 1,
            api_prefix: "/api".to_owned(),
            assets_prefix: "/assets".to_owned(),
            manifest_path: "/manifest.json".to_owned(),
            root_document: "/".to_owned(),
            required_assets: vec!["/".to_owned()],
            fetch_timeout: Duration::from_secs(10),
            store_dir: None,
            sync_tag: DEFAULT_SYNC_TAG.to_owned(),
        }
    }

    /// Sets the generation tag.
    #[must_use]
    pub fn generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    /// Sets the API path prefix.
    #[must_use]
    pub fn api_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.api_prefix = prefix.into();
        self
    }

    /// Sets the static-assets path prefix.
    #[must_use]
    pub fn assets_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.assets_prefix = prefix.into();
        self
    }

    /// Sets the install-time required asset list.
    #[must_use]
    pub fn required_assets<I, S>(mut self, assets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_assets = assets.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the upstream fetch timeout.
    #[must_use]
    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Mirrors the cache store and write journal under `dir`.
    #[must_use]
    pub fn store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.store_dir = Some(dir.into());
        self
    }
}

/// One item of a `WARM` command: a GET target and the JSON payload the UI
/// wants guaranteed available offline.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WarmItem {
    pub target: String,
    pub payload: serde_json::Value,
}

/// Shared state for one proxy instance.
///
/// Cheap to share (`Arc`); every strategy handler receives a reference.
pub struct ProxyContext {
    config: ProxyConfig,
    store: CacheStore,
    catalog: RwLock<FallbackCatalog>,
    queue: DeferredWriteQueue,
    lifecycle: Lifecycle,
    upstream: Arc<dyn Fetch>,
    replay_tx: UnboundedSender<DeferredWrite>,
}

impl ProxyContext {
    /// Builds the context: opens (or creates) the cache store, loads the
    /// write journal, and wires the replay-notice channel.
    ///
    /// Returns the context and the receiver on which the UI layer observes
    /// successfully replayed writes.
    pub async fn initialize(
        config: ProxyConfig,
    ) -> std::io::Result<(Arc<Self>, UnboundedReceiver<DeferredWrite>)> {
        let upstream: Arc<dyn Fetch> = Arc::new(HttpUpstream::new(
            config.upstream_addr.clone(),
            config.fetch_timeout,
        ));
        Self::initialize_with(config, upstream).await
    }

    /// Like [`initialize`](Self::initialize) but with a caller-supplied
    /// fetch implementation. This is the seam tests use to script network
    /// behavior.
    pub async fn initialize_with(
        config: ProxyConfig,
        upstream: Arc<dyn Fetch>,
    ) -> std::io::Result<(Arc<Self>, UnboundedReceiver<DeferredWrite>)> {
        let (store, queue) = match &config.store_dir {
            Some(dir) => {
                let store = CacheStore::open(dir).await?;
                let queue =
                    DeferredWriteQueue::load(config.sync_tag.clone(), dir.join(JOURNAL_FILE))
                        .await?;
                (store, queue)
            }
            None => (
                CacheStore::in_memory(),
                DeferredWriteQueue::in_memory(config.sync_tag.clone()),
            ),
        };

        let (replay_tx, replay_rx) = mpsc::unbounded_channel();
        let lifecycle = Lifecycle::new(config.generation);

        let context = Arc::new(Self {
            config,
            store,
            catalog: RwLock::new(FallbackCatalog::with_defaults()),
            queue,
            lifecycle,
            upstream,
            replay_tx,
        });
        Ok((context, replay_rx))
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Returns the cache store.
    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Returns the deferred-write queue.
    pub fn queue(&self) -> &DeferredWriteQueue {
        &self.queue
    }

    /// Returns the lifecycle controller.
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Issues an upstream fetch through the configured implementation.
    pub async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
        self.upstream.fetch(request).await
    }

    /// Returns the upstream fetch seam itself (recovery replays through it).
    pub fn upstream(&self) -> &dyn Fetch {
        self.upstream.as_ref()
    }

    /// Looks up a synthesized fallback response for an API path.
    pub fn fallback_response(&self, path: &str) -> Option<Response> {
        self.catalog
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .respond(path)
    }

    /// Registers or refreshes a fallback payload.
    pub fn set_fallback(&self, prefix: impl Into<String>, payload: serde_json::Value) {
        self.catalog
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(prefix, payload);
    }

    /// Seeds the un-versioned `warm` partition with UI-supplied payloads.
    ///
    /// Warmed entries survive generation changes; only `PURGE` removes them.
    pub async fn warm(&self, items: Vec<WarmItem>) {
        for item in items {
            let snapshot = ResponseSnapshot::from_parts(
                StatusCode::OK,
                Headers::from_iter([("Content-Type", "application/json")]),
                item.payload.to_string().into_bytes(),
            );
            self.store
                .write(WARM_PARTITION, CacheKey::for_get(&item.target), snapshot)
                .await;
        }
    }

    /// Handles a connectivity-restored signal.
    ///
    /// Only a tag matching the queue's own triggers a pass; anything else
    /// is ignored (a different write class, not ours).
    pub async fn notify_online(&self, tag: &str) -> Option<RecoveryOutcome> {
        if tag != self.queue.tag() {
            warn!(tag, expected = self.queue.tag(), "recovery trigger for unknown tag ignored");
            return None;
        }
        Some(self.queue.recover(self.upstream.as_ref(), &self.replay_tx).await)
    }
}

impl std::fmt::Debug for ProxyContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyContext")
            .field("generation", &self.config.generation)
            .field("upstream_addr", &self.config.upstream_addr)
            .field("state", &self.lifecycle.state())
            .finish_non_exhaustive()
    }
}
