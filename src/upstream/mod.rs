//! The network side of the proxy: fetching from the origin server.
//!
//! [`Fetch`] is the seam every strategy goes through to reach the network.
//! It is object-safe (boxed futures) so tests can substitute a scripted
//! double and count calls; production uses [`HttpUpstream`], a minimal
//! one-connection-per-request HTTP/1.1 client over Tokio TCP.
//!
//! Only transport-level failures are [`FetchError`]s. An HTTP error status
//! from the origin is a successful fetch — the strategies forward it.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::http::{Request, Response, response::ResponseError};

/// Transport-level fetch failures: the network was unreachable, not the
/// backend unhappy.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to connect to upstream {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("upstream I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("upstream did not respond within {0:?}")]
    Timeout(Duration),

    #[error("malformed upstream response: {0}")]
    Malformed(#[from] ResponseError),

    #[error("upstream response exceeds {max_bytes} bytes")]
    TooLarge { max_bytes: usize },

    #[error("cannot forward {target}: {reason}")]
    BadTarget { target: String, reason: &'static str },
}

/// Boxed future returned by [`Fetch::fetch`].
pub type FetchFuture = Pin<Box<dyn Future<Output = Result<Response, FetchError>> + Send>>;

/// The network-fetch seam.
///
/// Implementations must be cheap to call concurrently; the proxy issues one
/// fetch per intercepted request with no coordination between them.
pub trait Fetch: Send + Sync {
    /// Sends the request to the origin and resolves to its response, or to
    /// a [`FetchError`] on transport failure.
    fn fetch(&self, request: &Request) -> FetchFuture;
}

/// Maximum upstream response size we will buffer (32 MiB).
const MAX_RESPONSE_SIZE: usize = 32 * 1024 * 1024;

/// Initial read buffer capacity per fetch.
const INITIAL_BUF_SIZE: usize = 4096;

/// HTTP/1.1 client for the configured origin server.
///
/// Each fetch opens a fresh connection, sends with `Connection: close`, and
/// reads to EOF. Simple and stateless, which is what a per-request,
/// no-ordering-guarantees fetch seam wants.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    addr: String,
    timeout: Duration,
}

impl HttpUpstream {
    /// Creates a client for the origin at `addr` (host:port).
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    async fn fetch_inner(
        addr: String,
        timeout: Duration,
        wire: Vec<u8>,
    ) -> Result<Response, FetchError> {
        let io = async {
            let mut stream =
                TcpStream::connect(&addr)
                    .await
                    .map_err(|source| FetchError::Connect {
                        addr: addr.clone(),
                        source,
                    })?;
            stream.write_all(&wire).await?;
            stream.flush().await?;

            let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);
            loop {
                let bytes_read = stream.read_buf(&mut buf).await?;
                if bytes_read == 0 {
                    break; // upstream honored Connection: close
                }
                if buf.len() > MAX_RESPONSE_SIZE {
                    return Err(FetchError::TooLarge {
                        max_bytes: MAX_RESPONSE_SIZE,
                    });
                }
            }
            let (response, _body_offset) = Response::parse(&buf)?;
            Ok(response)
        };

        match tokio::time::timeout(timeout, io).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(timeout)),
        }
    }
}

/// Resolves an absolute-form target to the authority it names, rewriting
/// the request into origin-form with a matching `Host` header.
///
/// Only `http://` targets can be forwarded; there is no TLS client here.
fn route_absolute(request: &Request) -> Result<(String, Request), FetchError> {
    let target = request.target();
    let Some(rest) = target.strip_prefix("http://") else {
        return Err(FetchError::BadTarget {
            target: target.to_owned(),
            reason: "only http targets can be forwarded",
        });
    };
    let (authority, path) = match rest.find('/') {
        Some(slash) => (&rest[..slash], &rest[slash..]),
        None => (rest, "/"),
    };
    if authority.is_empty() {
        return Err(FetchError::BadTarget {
            target: target.to_owned(),
            reason: "missing authority",
        });
    }
    let addr = if authority.contains(':') {
        authority.to_owned()
    } else {
        format!("{authority}:80")
    };

    let mut rewritten = Request::new(request.method().clone(), path.to_owned());
    for (name, value) in request.headers().iter() {
        if !name.eq_ignore_ascii_case("host") {
            rewritten = rewritten.header(name, value);
        }
    }
    rewritten = rewritten
        .header("Host", authority)
        .body(request.body_bytes().clone());
    Ok((addr, rewritten))
}

impl Fetch for HttpUpstream {
    fn fetch(&self, request: &Request) -> FetchFuture {
        // Absolute-form targets name their own authority; everything else
        // goes to the configured origin.
        let routed = if request.is_absolute_form() {
            route_absolute(request).map(|(addr, rewritten)| (addr, rewritten.to_wire()))
        } else {
            Ok((self.addr.clone(), request.to_wire()))
        };
        let timeout = self.timeout;
        let method = request.method().clone();
        let target = request.target().to_owned();

        Box::pin(async move {
            let (addr, wire) = routed?;
            debug!(%method, url = %target, upstream = %addr, "fetching upstream");
            let result = Self::fetch_inner(addr, timeout, wire).await;
            if let Err(e) = &result {
                warn!(%method, url = %target, error = %e, "upstream fetch failed");
            }
            result
        })
    }
}
