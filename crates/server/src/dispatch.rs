//! Per-connection protocol dispatch.
//!
//! An accepted stream is optionally taken through a TLS handshake, then the
//! negotiated ALPN identifier picks the [`Protocol`](crate::Protocol) that
//! serves it. Anything that cannot be served is dropped without writing a
//! byte.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::Server;

/// Byte streams a [`Connection`] can wrap.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// An accepted transport stream, plain or TLS.
pub struct Connection {
    io: Box<dyn Io>,
    alpn: Option<Vec<u8>>,
    peer: Option<SocketAddr>,
}

impl Connection {
    pub fn new<S: Io + 'static>(io: S, alpn: Option<Vec<u8>>, peer: Option<SocketAddr>) -> Self {
        Self { io: Box::new(io), alpn, peer }
    }

    /// The protocol identifier agreed on during the TLS handshake.
    pub fn alpn(&self) -> Option<&[u8]> {
        self.alpn.as_deref()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("alpn", &self.alpn.as_deref().map(String::from_utf8_lossy))
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for Connection {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.io).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.io).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }
}

/// Identity of one accepted connection.
#[derive(Debug, Clone)]
pub struct ConnContext {
    pub id: u64,
    pub peer: Option<SocketAddr>,
    /// Child of the server's base token; cancelled when the server stops.
    pub cancel: CancellationToken,
}

/// Application protocols the dispatcher can route to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    Http1x,
    Http2,
}

/// Maps a negotiated ALPN identifier to a protocol.
///
/// No identifier (plain TCP, or TLS without ALPN), `""`, `http/1.0` and
/// `http/1.1` are HTTP/1.x; `http/2.0` is HTTP/2; anything else is refused.
pub fn select_protocol(alpn: Option<&[u8]>) -> Option<ProtocolKind> {
    match alpn {
        None | Some(b"" | b"http/1.0" | b"http/1.1") => Some(ProtocolKind::Http1x),
        Some(b"http/2.0") => Some(ProtocolKind::Http2),
        Some(_) => None,
    }
}

/// Runs an accepted stream to completion.
pub(crate) async fn dispatch<S>(server: Arc<Server>, ctx: ConnContext, stream: S)
where
    S: Io + 'static,
{
    let conn = match server.tls_acceptor() {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls) => {
                let alpn = tls.get_ref().1.alpn_protocol().map(<[u8]>::to_vec);
                Connection::new(tls, alpn, ctx.peer)
            }
            Err(e) => {
                debug!(conn = ctx.id, cause = %e, "tls handshake failed, dropping connection");
                return;
            }
        },
        None => Connection::new(stream, None, ctx.peer),
    };

    route(server, ctx, conn).await;
}

/// Hands `conn` to the protocol its ALPN identifier selects.
pub(crate) async fn route(server: Arc<Server>, ctx: ConnContext, conn: Connection) {
    let Some(kind) = select_protocol(conn.alpn()) else {
        debug!(conn = ctx.id, alpn = ?conn.alpn().map(String::from_utf8_lossy), "unsupported protocol, dropping connection");
        return;
    };

    let Some(protocol) = server.protocol(kind).cloned() else {
        debug!(conn = ctx.id, protocol = ?kind, "no handler for protocol, dropping connection");
        return;
    };

    protocol.serve(ctx, server, conn).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MockProtocol;
    use crate::ServerBuilder;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};
    use tokio_rustls::TlsConnector;
    use tokio_rustls::rustls::pki_types::ServerName;
    use tokio_rustls::rustls::{ClientConfig, RootCertStore};

    fn ctx() -> ConnContext {
        ConnContext { id: 1, peer: None, cancel: CancellationToken::new() }
    }

    fn expect_serve(times: usize) -> MockProtocol {
        let mut protocol = MockProtocol::new();
        protocol.expect_serve().times(times).returning(|_, _, _| ());
        protocol
    }

    async fn route_with(builder: ServerBuilder, alpn: Option<&[u8]>) -> Vec<u8> {
        let server = Arc::new(builder.build().unwrap());
        let (mut client, server_side): (DuplexStream, DuplexStream) = duplex(1024);
        route(server, ctx(), Connection::new(server_side, alpn.map(<[u8]>::to_vec), None)).await;

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        received
    }

    #[test]
    fn alpn_selection() {
        assert_eq!(select_protocol(None), Some(ProtocolKind::Http1x));
        assert_eq!(select_protocol(Some(b"")), Some(ProtocolKind::Http1x));
        assert_eq!(select_protocol(Some(b"http/1.0")), Some(ProtocolKind::Http1x));
        assert_eq!(select_protocol(Some(b"http/1.1")), Some(ProtocolKind::Http1x));
        assert_eq!(select_protocol(Some(b"http/2.0")), Some(ProtocolKind::Http2));
        assert_eq!(select_protocol(Some(b"h2")), None);
        assert_eq!(select_protocol(Some(b"HTTP/1.1")), None);
    }

    #[tokio::test]
    async fn unknown_alpn_closes_silently() {
        let builder = Server::builder().http1_protocol(expect_serve(0)).http2_protocol(expect_serve(0));
        assert!(route_with(builder, Some(b"spdy/3")).await.is_empty());
    }

    #[tokio::test]
    async fn missing_handler_closes_silently() {
        let builder = Server::builder().http1_protocol(expect_serve(0));
        assert!(route_with(builder, Some(b"http/2.0")).await.is_empty());
    }

    #[tokio::test]
    async fn routes_to_selected_protocol() {
        let builder = Server::builder().http1_protocol(expect_serve(0)).http2_protocol(expect_serve(1));
        route_with(builder, Some(b"http/2.0")).await;

        let builder = Server::builder().http1_protocol(expect_serve(1)).http2_protocol(expect_serve(0));
        route_with(builder, None).await;
    }

    #[tokio::test]
    async fn plain_stream_is_http1() {
        let server = Arc::new(Server::builder().http1_protocol(expect_serve(1)).build().unwrap());
        let (_client, server_side) = duplex(64);
        dispatch(server, ctx(), server_side).await;
    }

    /// A TLS server advertising `http/2.0`, and a client config trusting its certificate.
    fn tls_pair(http1: MockProtocol, http2: MockProtocol) -> (Arc<Server>, ClientConfig) {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()]).unwrap();
        let config = crate::tls::server_config(
            certified.cert.pem().as_bytes(),
            certified.key_pair.serialize_pem().as_bytes(),
            vec![b"http/2.0".to_vec()],
        )
        .unwrap();
        let server = Server::builder()
            .tls_config(Arc::new(config))
            .http1_protocol(http1)
            .http2_protocol(http2)
            .build()
            .unwrap();

        let mut roots = RootCertStore::empty();
        roots.add(certified.cert.der().clone()).unwrap();
        let client = ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();
        (Arc::new(server), client)
    }

    #[tokio::test]
    async fn failed_tls_handshake_drops_connection() {
        let (server, _) = tls_pair(expect_serve(0), expect_serve(0));
        let (mut client, server_side) = duplex(4096);
        client.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").await.unwrap();

        dispatch(server, ctx(), server_side).await;

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert!(!received.windows(5).any(|w| w == b"HTTP/"));
    }

    #[tokio::test]
    async fn negotiated_alpn_selects_http2() {
        let mut http2 = MockProtocol::new();
        http2
            .expect_serve()
            .times(1)
            .withf(|_, _, conn| conn.alpn() == Some(&b"http/2.0"[..]))
            .returning(|_, _, _| ());
        let (server, mut client_config) = tls_pair(expect_serve(0), http2);
        client_config.alpn_protocols = vec![b"http/2.0".to_vec()];

        let (client, server_side) = duplex(16 * 1024);
        let connector = TlsConnector::from(Arc::new(client_config));
        let name = ServerName::try_from("localhost").unwrap();
        let (tls, ()) = tokio::join!(
            async { connector.connect(name, client).await.unwrap() },
            dispatch(server, ctx(), server_side),
        );
        assert_eq!(tls.get_ref().1.alpn_protocol(), Some(&b"http/2.0"[..]));
    }

    #[tokio::test]
    async fn tls_without_client_alpn_is_http1() {
        let mut http1 = MockProtocol::new();
        http1.expect_serve().times(1).withf(|_, _, conn| conn.alpn().is_none()).returning(|_, _, _| ());
        let (server, client_config) = tls_pair(http1, expect_serve(0));

        let (client, server_side) = duplex(16 * 1024);
        let connector = TlsConnector::from(Arc::new(client_config));
        let name = ServerName::try_from("localhost").unwrap();
        tokio::join!(async { connector.connect(name, client).await.unwrap() }, dispatch(server, ctx(), server_side));
    }
}
