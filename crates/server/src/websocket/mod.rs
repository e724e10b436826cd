//! WebSocket upgrade.
//!
//! [`WebSocketProtocol::handshake`] validates an upgrade request, answers it
//! with `101 Switching Protocols` written straight to the connection, and
//! [`WebSocketProtocol::hijack`] then takes the raw connection away from the
//! HTTP/1.x loop and wraps it in a [`WebSocketConn`]. [`websocket_handler`]
//! strings both together behind an ordinary [`RequestHandler`].
//!
//! Plain sessions are framed by `tokio-tungstenite`; sessions that negotiated
//! permessage-deflate use the frame codec from `suna-http`.

mod conn;
mod deflate;

pub use conn::{Message, WebSocketConn, WebSocketError};

use std::fmt;
use std::mem;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use http::header::{
    CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL,
    SEC_WEBSOCKET_VERSION, UPGRADE,
};
use http::{HeaderValue, Request, StatusCode};
use serde::Deserialize;
use sha1::{Digest, Sha1};
use suna_http::protocol::{ResponseBody, SendError};
use thiserror::Error;
use tracing::debug;

use crate::pool::Pool;
use crate::{Failure, RequestCtx, RequestHandler, ServerError};

const GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const WEBSOCKET: &str = "websocket";
const EXT_COMPRESS: &str = "permessage-deflate";
const EXT_RESPONSE: &str = "permessage-deflate; server_no_context_takeover; client_no_context_takeover";
const MAX_IDLE_BUFFERS: usize = 256;

/// Picks a subprotocol for an upgrade request.
pub type SubprotocolSelector = Arc<dyn Fn(&RequestCtx) -> Option<String> + Send + Sync>;

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct WebSocketOptions {
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    /// Accept permessage-deflate when the client offers it.
    pub enable_compression: bool,
    /// Largest reassembled (and inflated) message accepted from a client.
    pub max_message_size: usize,
    #[serde(skip)]
    pub select_subprotocol: Option<SubprotocolSelector>,
}

impl Default for WebSocketOptions {
    fn default() -> Self {
        Self {
            read_buffer_size: 2048,
            write_buffer_size: 2048,
            enable_compression: true,
            max_message_size: 16 * 1024 * 1024,
            select_subprotocol: None,
        }
    }
}

impl WebSocketOptions {
    pub fn with_subprotocol<F>(mut self, select: F) -> Self
    where
        F: Fn(&RequestCtx) -> Option<String> + Send + Sync + 'static,
    {
        self.select_subprotocol = Some(Arc::new(select));
        self
    }
}

impl fmt::Debug for WebSocketOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketOptions")
            .field("read_buffer_size", &self.read_buffer_size)
            .field("write_buffer_size", &self.write_buffer_size)
            .field("enable_compression", &self.enable_compression)
            .field("max_message_size", &self.max_message_size)
            .field("select_subprotocol", &self.select_subprotocol.is_some())
            .finish()
    }
}

/// What a successful handshake agreed on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Handshake {
    pub subprotocol: Option<String>,
    pub compression: bool,
}

#[derive(Error, Debug)]
pub enum UpgradeError {
    #[error("unsupported websocket version")]
    UnsupportedVersion,
    #[error("missing websocket key")]
    MissingKey,
    #[error("connection is not available for upgrade")]
    NoConnection,
    #[error("failed to flush handshake response: {0}")]
    Flush(#[from] SendError),
}

/// Computes `Sec-WebSocket-Accept` for a client key.
pub fn accept_key(key: &[u8]) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(GUID);
    STANDARD.encode(sha1.finalize())
}

#[derive(Debug)]
pub struct WebSocketProtocol {
    options: WebSocketOptions,
    write_buffers: Pool<Vec<u8>>,
}

impl WebSocketProtocol {
    pub fn new(options: WebSocketOptions) -> Result<Self, ServerError> {
        if options.read_buffer_size == 0 || options.write_buffer_size == 0 {
            return Err(ServerError::config("websocket buffer sizes must be positive"));
        }
        let write_buffer_size = options.write_buffer_size;
        let write_buffers = Pool::new(MAX_IDLE_BUFFERS, move || Vec::with_capacity(write_buffer_size));
        Ok(Self { options, write_buffers })
    }

    pub fn options(&self) -> &WebSocketOptions {
        &self.options
    }

    /// Validates the upgrade request and flushes the `101` response.
    ///
    /// Rejections leave status 400 on `ctx` for the HTTP/1.x loop to send. If
    /// the `101` cannot be flushed the connection is taken off the context and
    /// dropped.
    pub async fn handshake(&self, ctx: &mut RequestCtx) -> Result<Handshake, UpgradeError> {
        let headers = ctx.request().headers();
        if headers.get(SEC_WEBSOCKET_VERSION).is_none_or(|version| version.as_bytes() != b"13") {
            ctx.set_status(StatusCode::BAD_REQUEST);
            return Err(UpgradeError::UnsupportedVersion);
        }

        let key = match headers.get(SEC_WEBSOCKET_KEY) {
            Some(key) if !key.is_empty() => key.clone(),
            _ => {
                ctx.set_status(StatusCode::BAD_REQUEST);
                return Err(UpgradeError::MissingKey);
            }
        };

        let compression = self.options.enable_compression
            && headers
                .get_all(SEC_WEBSOCKET_EXTENSIONS)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .any(|value| value.contains(EXT_COMPRESS));

        let subprotocol = self.options.select_subprotocol.as_ref().and_then(|select| select(ctx));

        if ctx.io_mut().is_none() {
            return Err(UpgradeError::NoConnection);
        }

        ctx.set_status(StatusCode::SWITCHING_PROTOCOLS);
        let date = ctx.server().date_header();
        let response_headers = ctx.response_mut().headers_mut();
        response_headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        response_headers.insert(UPGRADE, HeaderValue::from_static(WEBSOCKET));
        if let Ok(accept) = HeaderValue::from_str(&accept_key(key.as_bytes())) {
            response_headers.insert(SEC_WEBSOCKET_ACCEPT, accept);
        }
        if compression {
            response_headers.insert(SEC_WEBSOCKET_EXTENSIONS, HeaderValue::from_static(EXT_RESPONSE));
        }
        if let Some(protocol) = subprotocol.as_deref().and_then(|p| HeaderValue::from_str(p).ok()) {
            response_headers.insert(SEC_WEBSOCKET_PROTOCOL, protocol);
        }
        response_headers.insert(http::header::DATE, date);

        let head = ctx.head();
        let Some(io) = ctx.io_mut() else {
            return Err(UpgradeError::NoConnection);
        };
        if let Err(e) = io.send((head, ResponseBody::empty())).await {
            drop(ctx.hijack());
            return Err(e.into());
        }

        Ok(Handshake { subprotocol, compression })
    }

    /// Takes the connection over for WebSocket framing.
    pub async fn hijack(&self, ctx: &mut RequestCtx, handshake: Handshake) -> Result<WebSocketConn, UpgradeError> {
        let (conn, leftover) = ctx.hijack().ok_or(UpgradeError::NoConnection)?;
        Ok(WebSocketConn::new(conn, leftover, handshake, &self.options, &self.write_buffers).await)
    }
}

/// A [`RequestHandler`] that upgrades every request and runs `f` on the connection.
pub struct WebSocketHandler<F> {
    f: F,
}

impl<F> fmt::Debug for WebSocketHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketHandler").finish_non_exhaustive()
    }
}

pub fn websocket_handler<F, Fut>(f: F) -> WebSocketHandler<F>
where
    F: Fn(WebSocketConn, Request<Bytes>) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    WebSocketHandler { f }
}

#[async_trait]
impl<F, Fut> RequestHandler for WebSocketHandler<F>
where
    F: Fn(WebSocketConn, Request<Bytes>) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn invoke(&self, ctx: &mut RequestCtx) -> Result<(), Failure> {
        if ctx.upgrade_protocol() != Some(WEBSOCKET) {
            ctx.set_status(StatusCode::BAD_REQUEST);
            return Ok(());
        }

        let server = Arc::clone(ctx.server());
        let Some(protocol) = server.websocket() else {
            ctx.set_status(StatusCode::BAD_REQUEST);
            return Ok(());
        };

        let handshake = match protocol.handshake(ctx).await {
            Ok(handshake) => handshake,
            Err(e) => {
                debug!(cause = %e, "websocket handshake failed");
                return Ok(());
            }
        };

        let conn = protocol.hijack(ctx, handshake).await?;
        let request = mem::replace(ctx.request_mut(), Request::new(Bytes::new()));
        (self.f)(conn, request).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConnContext, Connection, Http1x, Protocol, Server};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};
    use tokio_util::sync::CancellationToken;

    fn ctx_with(headers: &[(&str, &str)]) -> RequestCtx {
        let server = Arc::new(Server::builder().websocket(WebSocketOptions::default()).build().unwrap());
        let mut request = Request::builder().uri("/ws");
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        RequestCtx::new(server, request.body(Bytes::new()).unwrap())
    }

    #[test]
    fn accept_key_vector() {
        assert_eq!(accept_key(b"dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[tokio::test]
    async fn rejects_wrong_version() {
        for version in ["12", "130", "1", " 13"] {
            let mut ctx = ctx_with(&[("sec-websocket-version", version), ("sec-websocket-key", "abc")]);
            let protocol = WebSocketProtocol::new(WebSocketOptions::default()).unwrap();
            let err = protocol.handshake(&mut ctx).await.unwrap_err();
            assert!(matches!(err, UpgradeError::UnsupportedVersion));
            assert_eq!(ctx.status(), StatusCode::BAD_REQUEST);
            assert!(!ctx.response().headers().contains_key(SEC_WEBSOCKET_ACCEPT));
        }

        let mut ctx = ctx_with(&[("sec-websocket-key", "abc")]);
        let protocol = WebSocketProtocol::new(WebSocketOptions::default()).unwrap();
        assert!(protocol.handshake(&mut ctx).await.is_err());
        assert_eq!(ctx.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn rejects_empty_key() {
        let protocol = WebSocketProtocol::new(WebSocketOptions::default()).unwrap();
        for headers in [vec![("sec-websocket-version", "13")], vec![("sec-websocket-version", "13"), ("sec-websocket-key", "")]] {
            let mut ctx = ctx_with(&headers);
            let err = protocol.handshake(&mut ctx).await.unwrap_err();
            assert!(matches!(err, UpgradeError::MissingKey));
            assert_eq!(ctx.status(), StatusCode::BAD_REQUEST);
            assert!(!ctx.response().headers().contains_key(SEC_WEBSOCKET_ACCEPT));
        }
    }

    #[tokio::test]
    async fn missing_connection_leaves_response_untouched() {
        let mut ctx = ctx_with(&[("sec-websocket-version", "13"), ("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")]);
        let protocol = WebSocketProtocol::new(WebSocketOptions::default()).unwrap();
        let err = protocol.handshake(&mut ctx).await.unwrap_err();

        assert!(matches!(err, UpgradeError::NoConnection));
        assert_eq!(ctx.status(), StatusCode::OK);
        assert!(ctx.response().headers().is_empty());
    }

    #[test]
    fn zero_buffers_are_rejected() {
        let options = WebSocketOptions { read_buffer_size: 0, ..Default::default() };
        assert!(WebSocketProtocol::new(options).is_err());
    }

    #[test]
    fn options_from_json() {
        let options: WebSocketOptions = serde_json::from_str(r#"{ "enable_compression": false }"#).unwrap();
        assert!(!options.enable_compression);
        assert_eq!(options.read_buffer_size, 2048);
        assert!(options.select_subprotocol.is_none());
    }

    fn echo_server(options: WebSocketOptions) -> Arc<Server> {
        let handler = websocket_handler(|mut conn: WebSocketConn, _request| async move {
            while let Ok(Some(message)) = conn.recv().await {
                if matches!(message, Message::Close(_)) {
                    break;
                }
                if conn.send(message).await.is_err() {
                    break;
                }
            }
        });
        Arc::new(Server::builder().websocket(options).handler(handler).build().unwrap())
    }

    fn start(server: Arc<Server>) -> DuplexStream {
        let (client, server_side) = duplex(64 * 1024);
        let ctx = ConnContext { id: 3, peer: None, cancel: CancellationToken::new() };
        tokio::spawn(async move { Http1x.serve(ctx, server, Connection::new(server_side, None, None)).await });
        client
    }

    async fn read_head(client: &mut DuplexStream) -> String {
        let mut head = Vec::new();
        while !head.ends_with(b"\r\n\r\n") {
            head.push(client.read_u8().await.unwrap());
        }
        String::from_utf8(head).unwrap()
    }

    fn masked_text(payload: &[u8]) -> Vec<u8> {
        let mask = [1u8, 2, 3, 4];
        let mut frame = vec![0x81, 0x80 | u8::try_from(payload.len()).unwrap()];
        frame.extend_from_slice(&mask);
        frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
        frame
    }

    #[tokio::test]
    async fn upgrade_and_echo() {
        let options = WebSocketOptions::default().with_subprotocol(|ctx| {
            let offered = ctx.request().headers().get(SEC_WEBSOCKET_PROTOCOL)?.to_str().ok()?;
            offered.split(',').map(str::trim).find(|p| *p == "chat").map(str::to_owned)
        });
        let mut client = start(echo_server(options));

        let request = "GET /ws HTTP/1.1\r\n\
            Host: localhost\r\n\
            Connection: Upgrade\r\n\
            Upgrade: websocket\r\n\
            Sec-WebSocket-Version: 13\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Sec-WebSocket-Protocol: superchat, chat\r\n\
            Sec-WebSocket-Extensions: permessage-deflate; client_max_window_bits\r\n\r\n";
        client.write_all(request.as_bytes()).await.unwrap();

        let head = read_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(head.contains("sec-websocket-accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(head.contains("sec-websocket-protocol: chat\r\n"));
        assert!(head.contains(
            "sec-websocket-extensions: permessage-deflate; server_no_context_takeover; client_no_context_takeover\r\n"
        ));
        assert!(!head.contains("content-length"));

        client.write_all(&masked_text(b"ping me")).await.unwrap();
        let mut first = [0u8; 2];
        client.read_exact(&mut first).await.unwrap();
        // compression was negotiated, so the echo comes back deflated
        assert_eq!(first[0], 0xC1);
    }

    #[tokio::test]
    async fn plain_echo_without_compression() {
        let options = WebSocketOptions { enable_compression: false, ..Default::default() };
        let mut client = start(echo_server(options));

        let request = "GET /ws HTTP/1.1\r\n\
            Connection: keep-alive, Upgrade\r\n\
            Upgrade: websocket\r\n\
            Sec-WebSocket-Version: 13\r\n\
            Sec-WebSocket-Key: x3JJHMbDL1EzLkh9GBhXDw==\r\n\
            Sec-WebSocket-Extensions: permessage-deflate\r\n\r\n";
        client.write_all(request.as_bytes()).await.unwrap();

        let head = read_head(&mut client).await;
        assert!(head.contains("sec-websocket-accept: HSmrc0sMlYUkAGmm5OPpG2HaGWk=\r\n"));
        assert!(!head.contains("sec-websocket-extensions"));
        assert!(!head.contains("sec-websocket-protocol"));

        client.write_all(&masked_text(b"hello")).await.unwrap();
        let mut echoed = [0u8; 7];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"\x81\x05hello");
    }

    #[tokio::test]
    async fn non_upgrade_request_gets_400() {
        let mut client = start(echo_server(WebSocketOptions::default()));
        client.write_all(b"GET /ws HTTP/1.1\r\nConnection: close\r\n\r\n").await.unwrap();
        let head = read_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn missing_websocket_protocol_gets_400() {
        let server = Arc::new(
            Server::builder().handler(websocket_handler(|_conn: WebSocketConn, _request| async {})).build().unwrap(),
        );
        let mut client = start(server);
        let request = "GET /ws HTTP/1.1\r\nConnection: Upgrade, close\r\nUpgrade: websocket\r\n\
            Sec-WebSocket-Version: 13\r\nSec-WebSocket-Key: abc\r\n\r\n";
        client.write_all(request.as_bytes()).await.unwrap();
        let head = read_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }
}
