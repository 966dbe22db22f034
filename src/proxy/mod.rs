//! The intercepting proxy: accept loop, lifecycle bring-up, and dispatch.
//!
//! `Proxy` binds a TCP address, installs and activates its generation, and
//! then serves intercepted HTTP/1.1 requests — one Tokio task per
//! connection, persistent connections supported. Every request goes
//! through the strategy router; the control loop runs alongside on its own
//! task, so cache commands never contend with interception.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::context::{ProxyConfig, ProxyContext};
use crate::control::{self, Command, ControlHandle};
use crate::http::{Request, Response, StatusCode, request::RequestError};
use crate::lifecycle::LifecycleError;
use crate::queue::{DeferredWrite, RecoveryOutcome};
use crate::strategy;
use crate::upstream::Fetch;

/// Errors produced by the proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("lifecycle bring-up failed: {0}")]
    Lifecycle(#[from] LifecycleError),
}

/// Maximum size of a complete intercepted request we will buffer (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// The offline-first intercepting proxy.
///
/// # Examples
///
/// ```rust,no_run
/// use offramp::proxy::Proxy;
/// use offramp::context::ProxyConfig;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = ProxyConfig::new("127.0.0.1:3000")
///         .required_assets(["/", "/app.js", "/styles.css"]);
///     let proxy = Proxy::bind("127.0.0.1:8080", config).await?;
///     proxy.run().await?;
///     Ok(())
/// }
/// ```
pub struct Proxy {
    listener: TcpListener,
    local_addr: SocketAddr,
    ctx: Arc<ProxyContext>,
    control: ControlHandle,
    control_rx: tokio::sync::mpsc::UnboundedReceiver<Command>,
    replay_rx: Option<tokio::sync::mpsc::UnboundedReceiver<DeferredWrite>>,
}

impl Proxy {
    /// Binds the proxy and initializes its shared context (cache store,
    /// write journal, fallback catalog).
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Bind`] if the address cannot be bound, or
    /// [`ProxyError::Io`] if the store directory is unusable.
    pub async fn bind(addr: impl AsRef<str>, config: ProxyConfig) -> Result<Self, ProxyError> {
        let (ctx, replay_rx) = ProxyContext::initialize(config).await?;
        Self::bind_with_context(addr, ctx, replay_rx).await
    }

    /// Like [`bind`](Self::bind) but with a caller-supplied fetch
    /// implementation, for tests that script network behavior.
    pub async fn bind_with(
        addr: impl AsRef<str>,
        config: ProxyConfig,
        upstream: Arc<dyn Fetch>,
    ) -> Result<Self, ProxyError> {
        let (ctx, replay_rx) = ProxyContext::initialize_with(config, upstream).await?;
        Self::bind_with_context(addr, ctx, replay_rx).await
    }

    async fn bind_with_context(
        addr: impl AsRef<str>,
        ctx: Arc<ProxyContext>,
        replay_rx: tokio::sync::mpsc::UnboundedReceiver<DeferredWrite>,
    ) -> Result<Self, ProxyError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: addr.to_owned(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        let (control, control_rx) = control::channel();
        Ok(Self {
            listener,
            local_addr,
            ctx,
            control,
            control_rx,
            replay_rx: Some(replay_rx),
        })
    }

    /// Returns the local address the proxy is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the shared context (mainly useful in tests and tooling).
    pub fn context(&self) -> &Arc<ProxyContext> {
        &self.ctx
    }

    /// Returns a handle for issuing control commands (TAKEOVER, PURGE, WARM).
    pub fn control_handle(&self) -> ControlHandle {
        self.control.clone()
    }

    /// Takes the receiver on which successfully replayed deferred writes
    /// are reported, so the UI layer can reconcile optimistic state.
    /// Yields `Some` only on the first call.
    pub fn replay_notices(
        &mut self,
    ) -> Option<tokio::sync::mpsc::UnboundedReceiver<DeferredWrite>> {
        self.replay_rx.take()
    }

    /// Signals that connectivity has returned, draining the deferred-write
    /// queue whose tag matches. Returns `None` for an unknown tag.
    pub async fn notify_online(&self, tag: &str) -> Option<RecoveryOutcome> {
        self.ctx.notify_online(tag).await
    }

    /// Brings the generation up (install, then activate) and serves
    /// intercepted requests until the process is terminated.
    ///
    /// Activation completes before the first connection is accepted, so no
    /// request is ever served from a partition mid-deletion. An install
    /// failure is fatal to this generation: the error is returned and
    /// nothing was evicted, leaving any previous generation's on-disk
    /// partitions authoritative.
    ///
    /// # Errors
    ///
    /// [`ProxyError::Lifecycle`] if a required asset cannot be installed;
    /// [`ProxyError::Io`] if the TCP listener itself fails.
    pub async fn run(mut self) -> Result<(), ProxyError> {
        let required = self.ctx.config().required_assets.clone();
        self.ctx
            .lifecycle()
            .install(self.ctx.store(), self.ctx.upstream(), &required)
            .await?;
        self.ctx.lifecycle().activate(self.ctx.store()).await?;

        let control_ctx = Arc::clone(&self.ctx);
        let control_rx = std::mem::replace(&mut self.control_rx, {
            // run_loop owns the real receiver; the placeholder is dropped.
            let (_tx, rx) = tokio::sync::mpsc::unbounded_channel();
            rx
        });
        tokio::spawn(control::run_loop(control_ctx, control_rx));

        info!(
            address = %self.local_addr,
            generation = self.ctx.lifecycle().generation(),
            "offramp intercepting"
        );

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let ctx = Arc::clone(&self.ctx);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, ctx).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// Handles a single intercepted connection over its lifetime.
///
/// HTTP/1.1 connections are persistent by default: we loop, reading one
/// request per iteration, until the peer closes the connection or signals
/// `Connection: close`.
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    ctx: Arc<ProxyContext>,
) -> Result<(), std::io::Error> {
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        // Serve every complete request already buffered before reading
        // again, so pipelined requests are never stranded in the buffer.
        while !buf.is_empty() {
            let (request, body_offset) = match Request::parse(&buf) {
                Ok(pair) => pair,
                Err(RequestError::Incomplete) => {
                    // Headers not yet fully received — read more data.
                    break;
                }
                Err(e) => {
                    warn!(peer = %peer_addr, error = %e, "bad request — sending 400");
                    let response = Response::new(StatusCode::BAD_REQUEST)
                        .body(format!("Bad Request: {e}"))
                        .keep_alive(false);
                    stream.write_all(&response.into_bytes()).await?;
                    return Ok(());
                }
            };

            // Wait for the full body to arrive if Content-Length is set.
            let content_length = request.content_length().unwrap_or(0);
            let total_needed = body_offset + content_length;
            if buf.len() < total_needed {
                break;
            }

            let keep_alive = request.is_keep_alive();

            debug!(
                peer = %peer_addr,
                method = %request.method(),
                url = request.target(),
                "intercepted request"
            );

            // Strategies surface raw transport errors only where no safe
            // fallback exists; the wire boundary still owes the client a
            // well-formed response.
            let response = match strategy::handle(&ctx, &request).await {
                Ok(response) => response,
                Err(e) => Response::new(StatusCode::BAD_GATEWAY)
                    .body(format!("Upstream unreachable: {e}")),
            };
            stream
                .write_all(&response.keep_alive(keep_alive).into_bytes())
                .await?;
            stream.flush().await?;

            // Drop the consumed request bytes from the buffer.
            let _ = buf.split_to(total_needed);

            if !keep_alive {
                debug!(peer = %peer_addr, "Connection: close — shutting down");
                return Ok(());
            }
        }

        let bytes_read = stream.read_buf(&mut buf).await?;

        if bytes_read == 0 {
            debug!(peer = %peer_addr, "connection closed by peer");
            break;
        }

        // Guard against excessively large requests.
        if buf.len() > MAX_REQUEST_SIZE {
            warn!(peer = %peer_addr, "request too large — sending 413");
            let response = Response::new(StatusCode::PAYLOAD_TOO_LARGE)
                .body("Request entity too large")
                .keep_alive(false);
            stream.write_all(&response.into_bytes()).await?;
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::DEFAULT_SYNC_TAG;
    use crate::upstream::{FetchError, FetchFuture};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Fetch double whose connectivity can be flipped at runtime.
    struct SwitchableNetwork {
        online: AtomicBool,
    }

    impl SwitchableNetwork {
        fn new(online: bool) -> Arc<Self> {
            Arc::new(Self {
                online: AtomicBool::new(online),
            })
        }

        fn set_online(&self, online: bool) {
            self.online.store(online, Ordering::SeqCst);
        }
    }

    impl Fetch for SwitchableNetwork {
        fn fetch(&self, request: &Request) -> FetchFuture {
            let online = self.online.load(Ordering::SeqCst);
            let target = request.target().to_owned();
            Box::pin(async move {
                if online {
                    Ok(Response::new(StatusCode::OK)
                        .header("Content-Type", "application/json")
                        .body(format!(r#"{{"origin":"{target}"}}"#)))
                } else {
                    Err(FetchError::Timeout(Duration::from_millis(1)))
                }
            })
        }
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    async fn start_proxy(
        network: Arc<SwitchableNetwork>,
    ) -> (
        SocketAddr,
        Arc<ProxyContext>,
        ControlHandle,
        tokio::sync::mpsc::UnboundedReceiver<DeferredWrite>,
    ) {
        init_tracing();
        let config = ProxyConfig::new("127.0.0.1:0").required_assets(["/"]);
        let mut proxy = Proxy::bind_with("127.0.0.1:0", config, network)
            .await
            .unwrap();
        let addr = proxy.local_addr();
        let ctx = Arc::clone(proxy.context());
        let control = proxy.control_handle();
        let replay_rx = proxy.replay_notices().unwrap();
        tokio::spawn(proxy.run());

        // Bring-up (install + activate) precedes the accept loop.
        for _ in 0..100 {
            if ctx.lifecycle().is_active() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(ctx.lifecycle().is_active(), "proxy never activated");
        (addr, ctx, control, replay_rx)
    }

    async fn roundtrip(addr: SocketAddr, raw: &[u8]) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(raw).await.unwrap();
        stream.shutdown().await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8(response).unwrap()
    }

    #[tokio::test]
    async fn serves_api_from_network_then_from_cache_when_offline() {
        let network = SwitchableNetwork::new(true);
        let (addr, _ctx, _control, _replay) = start_proxy(Arc::clone(&network)).await;

        let raw = b"GET /api/models HTTP/1.1\r\nHost: app\r\nConnection: close\r\n\r\n";
        let online_reply = roundtrip(addr, raw).await;
        assert!(online_reply.starts_with("HTTP/1.1 200 OK"));
        assert!(online_reply.contains(r#"{"origin":"/api/models"}"#));

        network.set_online(false);
        let offline_reply = roundtrip(addr, raw).await;
        assert!(offline_reply.starts_with("HTTP/1.1 200 OK"));
        assert!(offline_reply.contains(r#"{"origin":"/api/models"}"#));
    }

    #[tokio::test]
    async fn offline_write_is_deferred_and_replayed_on_recovery() {
        let network = SwitchableNetwork::new(true);
        let (addr, ctx, _control, mut replay) = start_proxy(Arc::clone(&network)).await;

        network.set_online(false);
        let raw = b"POST /api/messages HTTP/1.1\r\nHost: app\r\nContent-Length: 13\r\nConnection: close\r\n\r\n{\"text\":\"hi\"}";
        let reply = roundtrip(addr, raw).await;
        assert!(reply.starts_with("HTTP/1.1 503"));
        assert_eq!(ctx.queue().len(), 1);

        network.set_online(true);
        let outcome = ctx.notify_online(DEFAULT_SYNC_TAG).await.unwrap();
        assert!(matches!(outcome, RecoveryOutcome::Completed(report) if report.delivered == 1));
        assert!(ctx.queue().is_empty());

        let notice = replay.recv().await.unwrap();
        assert_eq!(notice.path, "/api/messages");
        assert_eq!(notice.payload, br#"{"text":"hi"}"#);
    }

    #[tokio::test]
    async fn keep_alive_serves_multiple_requests_per_connection() {
        let network = SwitchableNetwork::new(true);
        let (addr, _ctx, _control, _replay) = start_proxy(network).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        for target in ["/api/health", "/api/models"] {
            let raw = format!("GET {target} HTTP/1.1\r\nHost: app\r\n\r\n");
            stream.write_all(raw.as_bytes()).await.unwrap();

            let mut buf = vec![0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            let reply = String::from_utf8_lossy(&buf[..n]).into_owned();
            assert!(reply.starts_with("HTTP/1.1 200 OK"), "target {target}: {reply}");
            assert!(reply.contains("Connection: keep-alive"));
        }
    }

    #[tokio::test]
    async fn pipelined_requests_are_framed_and_both_served() {
        let network = SwitchableNetwork::new(true);
        let (addr, ctx, _control, _replay) = start_proxy(Arc::clone(&network)).await;
        network.set_online(false);

        // One write carrying a POST (body "hello") and a pipelined GET.
        let batch = b"POST /api/messages HTTP/1.1\r\nHost: app\r\nContent-Length: 5\r\n\r\nhelloGET /api/health HTTP/1.1\r\nHost: app\r\nConnection: close\r\n\r\n";
        let replies = roundtrip(addr, batch).await;

        // Both requests answered in order: the deferred POST, then the
        // health fallback.
        assert_eq!(replies.matches("HTTP/1.1 ").count(), 2, "{replies}");
        assert!(replies.starts_with("HTTP/1.1 503"));
        assert!(replies.contains("HTTP/1.1 200 OK"));

        // The journaled payload is exactly the POST body, not the bytes of
        // the request pipelined behind it.
        assert_eq!(ctx.queue().len(), 1);
        assert_eq!(ctx.queue().snapshot()[0].payload, b"hello");
    }

    #[tokio::test]
    async fn purge_through_the_control_handle() {
        let network = SwitchableNetwork::new(true);
        let (addr, ctx, control, _replay) = start_proxy(network).await;

        // Populate the runtime partition.
        roundtrip(addr, b"GET /api/health HTTP/1.1\r\nHost: app\r\nConnection: close\r\n\r\n").await;
        assert!(!ctx.store().partition_names().is_empty());

        let reply = control.purge().await.unwrap();
        assert!(reply.success);
        assert!(ctx.store().partition_names().is_empty());
    }

    #[tokio::test]
    async fn install_failure_is_fatal_to_run() {
        let network = SwitchableNetwork::new(false);
        let config = ProxyConfig::new("127.0.0.1:0").required_assets(["/", "/app.js"]);
        let proxy = Proxy::bind_with("127.0.0.1:0", config, network).await.unwrap();
        let err = proxy.run().await.unwrap_err();
        assert!(matches!(err, ProxyError::Lifecycle(_)));
    }

    #[tokio::test]
    async fn malformed_request_gets_400() {
        let network = SwitchableNetwork::new(true);
        let (addr, _ctx, _control, _replay) = start_proxy(network).await;
        let reply = roundtrip(addr, b"NOT VALID HTTP\r\n\r\n").await;
        assert!(reply.starts_with("HTTP/1.1 400"));
    }
}
