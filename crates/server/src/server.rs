//! The connection acceptor and the immutable server it runs.

use std::io;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use http::HeaderValue;
use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::compress::{CompressionConfig, Compressors};
use crate::date::{self, DateCache};
use crate::dispatch::{self, ConnContext, ProtocolKind};
use crate::handler::{NotFound, RequestHandler};
use crate::protocol::{Http1x, Protocol};
use crate::recover::{Failure, Recovery, Sentinel};
use crate::tls::TlsSource;
use crate::websocket::{WebSocketOptions, WebSocketProtocol};
use crate::RequestCtx;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {addr}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to read tls material from {}", path.display())]
    TlsFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("tls setup failed: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ServerError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }
}

/// Limits of the built-in HTTP/1.x protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Http1Config {
    /// Largest request body read into memory; bigger requests get 413.
    pub max_body_size: usize,
    pub read_buffer_size: usize,
}

impl Default for Http1Config {
    fn default() -> Self {
        Self { max_body_size: 8 * 1024 * 1024, read_buffer_size: 8 * 1024 }
    }
}

/// PEM files for [`ServerConfig::tls`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
    #[serde(default)]
    pub alpn: Vec<String>,
}

/// The loadable part of the server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub http1: Http1Config,
    pub compression: CompressionConfig,
    pub websocket: Option<WebSocketOptions>,
    pub tls: Option<TlsFiles>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 8080,
            http1: Http1Config::default(),
            compression: CompressionConfig::default(),
            websocket: None,
            tls: None,
        }
    }
}

/// Exponential delay between retries of a failing `accept`.
///
/// Starts at 5ms, doubles on every consecutive failure up to 1s and starts
/// over after the next successful accept.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptBackoff {
    current: Option<Duration>,
}

impl AcceptBackoff {
    pub const MIN: Duration = Duration::from_millis(5);
    pub const MAX: Duration = Duration::from_secs(1);

    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            None => Self::MIN,
            Some(previous) => (previous * 2).min(Self::MAX),
        };
        self.current = Some(delay);
        delay
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

const ENOMEM: i32 = 12;
const ENFILE: i32 = 23;
const EMFILE: i32 = 24;
#[cfg(target_os = "linux")]
const ENOBUFS: i32 = 105;
#[cfg(not(target_os = "linux"))]
const ENOBUFS: i32 = 55;

/// Whether a failed `accept` is worth retrying after a pause.
pub fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::OutOfMemory
    ) || matches!(e.raw_os_error(), Some(EMFILE | ENFILE | ENOBUFS | ENOMEM))
}

pub struct ServerBuilder {
    host: String,
    port: u16,
    handler: Option<Arc<dyn RequestHandler>>,
    http1: Option<Arc<dyn Protocol>>,
    http2: Option<Arc<dyn Protocol>>,
    websocket: Option<WebSocketOptions>,
    compression: CompressionConfig,
    http1_config: Http1Config,
    tls: Option<TlsSource>,
    alpn: Vec<Vec<u8>>,
    cancel: Option<CancellationToken>,
    recovery: Recovery,
}

impl ServerBuilder {
    fn new() -> Self {
        let mut recovery = Recovery::new();
        recovery.register_well_known();
        let defaults = ServerConfig::default();
        Self {
            host: defaults.host,
            port: defaults.port,
            handler: None,
            http1: Some(Arc::new(Http1x)),
            http2: None,
            websocket: None,
            compression: defaults.compression,
            http1_config: defaults.http1,
            tls: None,
            alpn: Vec::new(),
            cancel: None,
            recovery,
        }
    }

    /// Applies a loaded configuration, replacing the values it covers.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.host = config.host;
        self.port = config.port;
        self.http1_config = config.http1;
        self.compression = config.compression;
        if let Some(websocket) = config.websocket {
            self.websocket = Some(websocket);
        }
        if let Some(files) = config.tls {
            self.alpn = files.alpn.into_iter().map(String::into_bytes).collect();
            self.tls = Some(TlsSource::Pem { cert: files.cert, key: files.key, alpn: Vec::new() });
        }
        self
    }

    pub fn address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn handler(mut self, handler: impl RequestHandler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Replaces the built-in [`Http1x`] protocol.
    pub fn http1_protocol(mut self, protocol: impl Protocol + 'static) -> Self {
        self.http1 = Some(Arc::new(protocol));
        self
    }

    pub fn http2_protocol(mut self, protocol: impl Protocol + 'static) -> Self {
        self.http2 = Some(Arc::new(protocol));
        self
    }

    pub fn http1(mut self, config: Http1Config) -> Self {
        self.http1_config = config;
        self
    }

    pub fn websocket(mut self, options: WebSocketOptions) -> Self {
        self.websocket = Some(options);
        self
    }

    pub fn compression(mut self, config: CompressionConfig) -> Self {
        self.compression = config;
        self
    }

    /// Serves TLS with the PEM certificate chain and private key at these paths.
    pub fn tls_pem(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.tls = Some(TlsSource::Pem { cert: cert.into(), key: key.into(), alpn: Vec::new() });
        self
    }

    pub fn tls_config(mut self, config: Arc<tokio_rustls::rustls::ServerConfig>) -> Self {
        self.tls = Some(TlsSource::Config(config));
        self
    }

    /// ALPN identifiers advertised ahead of `http/1.1` when TLS comes from PEM files.
    pub fn alpn<I, P>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        self.alpn = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// The base token; cancelling it stops [`Server::serve`].
    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn recover_value<F>(mut self, sentinel: &'static Sentinel, handler: F) -> Self
    where
        F: Fn(&mut RequestCtx, &Failure) + Send + Sync + 'static,
    {
        self.recovery.on_value(sentinel, handler);
        self
    }

    pub fn recover_kind<T: 'static, F>(mut self, handler: F) -> Self
    where
        F: Fn(&mut RequestCtx, &Failure) + Send + Sync + 'static,
    {
        self.recovery.on_kind::<T, F>(handler);
        self
    }

    pub fn build(self) -> Result<Server, ServerError> {
        if self.http1_config.read_buffer_size == 0 {
            return Err(ServerError::config("http1 read buffer size must be positive"));
        }
        let compressors = Compressors::new(self.compression)?;

        let tls = match self.tls {
            Some(TlsSource::Pem { cert, key, .. }) => Some(TlsSource::Pem { cert, key, alpn: self.alpn }.acceptor()?),
            Some(source) => Some(source.acceptor()?),
            None => None,
        };

        let websocket = self.websocket.map(WebSocketProtocol::new).transpose()?;

        Ok(Server {
            host: self.host,
            port: self.port,
            tls,
            cancel: self.cancel.unwrap_or_default(),
            handler: self.handler.unwrap_or_else(|| Arc::new(NotFound)),
            http1: self.http1,
            http2: self.http2,
            websocket,
            compressors,
            recovery: self.recovery,
            http1_config: self.http1_config,
            date: Arc::new(DateCache::new()),
            next_conn_id: AtomicU64::new(1),
        })
    }
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls.is_some())
            .field("compression", &self.compression)
            .finish_non_exhaustive()
    }
}

/// An embeddable HTTP server, immutable once built.
pub struct Server {
    host: String,
    port: u16,
    tls: Option<TlsAcceptor>,
    cancel: CancellationToken,
    handler: Arc<dyn RequestHandler>,
    http1: Option<Arc<dyn Protocol>>,
    http2: Option<Arc<dyn Protocol>>,
    websocket: Option<WebSocketProtocol>,
    compressors: Compressors,
    recovery: Recovery,
    http1_config: Http1Config,
    date: Arc<DateCache>,
    next_conn_id: AtomicU64,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn http1_config(&self) -> Http1Config {
        self.http1_config
    }

    pub fn websocket(&self) -> Option<&WebSocketProtocol> {
        self.websocket.as_ref()
    }

    pub fn recovery(&self) -> &Recovery {
        &self.recovery
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Stops accepting; in-flight connections finish their current request.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn date_header(&self) -> HeaderValue {
        self.date.header_value()
    }

    pub(crate) fn tls_acceptor(&self) -> Option<&TlsAcceptor> {
        self.tls.as_ref()
    }

    pub(crate) fn compressors(&self) -> &Compressors {
        &self.compressors
    }

    pub fn protocol(&self, kind: ProtocolKind) -> Option<&Arc<dyn Protocol>> {
        match kind {
            ProtocolKind::Http1x => self.http1.as_ref(),
            ProtocolKind::Http2 => self.http2.as_ref(),
        }
    }

    /// Binds the configured host and port.
    pub async fn listen(&self) -> Result<TcpListener, ServerError> {
        let addr = self.address();
        let listener = TcpListener::bind(&addr).await.map_err(|source| ServerError::Bind { addr: addr.clone(), source })?;
        info!(address = %addr, tls = self.tls.is_some(), "start listening");
        Ok(listener)
    }

    pub async fn listen_and_serve(self: Arc<Self>) -> Result<(), ServerError> {
        let listener = self.listen().await?;
        self.serve(listener).await
    }

    /// Accepts connections until the base token is cancelled, then waits for
    /// the in-flight connections to finish.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        let tracker = TaskTracker::new();
        tracker.spawn(Arc::clone(&self.date).run_refresher(date::REFRESH_INTERVAL, self.cancel.clone()));

        let mut backoff = AcceptBackoff::new();
        loop {
            let accepted = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => {
                    backoff.reset();
                    accepted
                }
                Err(e) if is_transient(&e) => {
                    let delay = backoff.next_delay();
                    warn!(cause = %e, delay_ms = delay.as_millis(), "failed to accept, retrying");
                    tokio::select! {
                        () = self.cancel.cancelled() => break,
                        () = tokio::time::sleep(delay) => continue,
                    }
                }
                Err(e) => {
                    warn!(cause = %e, "failed to accept");
                    continue;
                }
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!(cause = %e, "failed to set TCP_NODELAY");
            }

            let ctx = ConnContext {
                id: self.next_conn_id.fetch_add(1, Ordering::Relaxed),
                peer: Some(peer),
                cancel: self.cancel.child_token(),
            };
            debug!(conn = ctx.id, peer = %peer, "accepted connection");
            tracker.spawn(dispatch::dispatch(Arc::clone(&self), ctx, stream));
        }

        tracker.close();
        info!(tasks = tracker.len(), "stop accepting, draining connections");
        tracker.wait().await;
        info!("server stopped");
        Ok(())
    }

    /// Runs the request handler and recovers from whatever it raised.
    pub(crate) async fn handle(&self, ctx: &mut RequestCtx) {
        let result = AssertUnwindSafe(self.handler.invoke(ctx)).catch_unwind().await;
        let failure = match result {
            Ok(Ok(())) => return,
            Ok(Err(failure)) => failure,
            Err(payload) => Failure::panic(payload),
        };

        if ctx.is_hijacked() {
            debug!(cause = %failure, "hijacked handler failed");
            return;
        }
        self.recovery.recover(ctx, &failure);
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("address", &self.address())
            .field("tls", &self.tls.is_some())
            .field("http2", &self.http2.is_some())
            .field("websocket", &self.websocket)
            .field("recovery", &self.recovery)
            .finish_non_exhaustive()
    }
}
