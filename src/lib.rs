//! # offramp
//!
//! An offline-first intercepting HTTP proxy, designed to sit next to an
//! application UI and own its network traffic: every request is classified
//! and served from the network, from a persistent cache partition, or from
//! a synthesized fallback — and writes that fail offline are journaled for
//! replay once connectivity returns.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use offramp::context::ProxyConfig;
//! use offramp::proxy::Proxy;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProxyConfig::new("127.0.0.1:3000")
//!         .required_assets(["/", "/app.js", "/styles.css", "/manifest.json"])
//!         .store_dir("/var/lib/offramp");
//!     let proxy = Proxy::bind("127.0.0.1:8080", config).await?;
//!     println!("Intercepting on http://{}", proxy.local_addr());
//!     proxy.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## How requests are served
//!
//! - **API** paths are network-first: live responses are captured into the
//!   generation's `runtime` partition, and transport failures fall back to
//!   cache, then to the fallback catalog, then to a structured 503.
//! - **Static assets** are cache-first: a hit never touches the network;
//!   freshness comes from generation-based eviction at activation.
//! - **Navigations** degrade to the cached root document, then to an
//!   inline offline page.
//! - Everything else passes through, with a best-effort cache fallback.
//!
//! Mutating API requests that fail offline land on a durable FIFO queue
//! and are replayed — in order, one recovery pass at a time — when
//! [`Proxy::notify_online`](proxy::Proxy::notify_online) fires.

pub mod cache;
pub mod context;
pub mod control;
pub mod fallback;
pub mod http;
pub mod lifecycle;
pub mod proxy;
pub mod queue;
pub mod strategy;
pub mod upstream;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cache::{CacheKey, CacheStore, ResponseSnapshot};
pub use context::{ProxyConfig, ProxyContext};
pub use control::{ControlHandle, ControlMessage};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use proxy::{Proxy, ProxyError};
pub use queue::{DeferredWrite, DeferredWriteQueue, RecoveryOutcome};
pub use strategy::RequestClass;
pub use upstream::{Fetch, FetchError, HttpUpstream};
