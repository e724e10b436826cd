//! The transport and protocol core of an embeddable HTTP server.
//!
//! A [`Server`] is put together with [`ServerBuilder`] and never changes
//! afterwards. Serving it accepts TCP connections, runs the optional TLS
//! handshake, picks the application protocol from the negotiated ALPN
//! identifier and hands every request to the application's
//! [`RequestHandler`] through a [`RequestCtx`].
//!
//! Around the handler the core provides:
//!
//! - [`compress`]: `Accept-Encoding` negotiation and pooled gzip, deflate and
//!   brotli encoders
//! - [`recover`]: turning returned failures and panics into error responses
//! - [`websocket`]: the upgrade handshake and a framed duplex connection
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use suna::{Server, handler_fn};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), suna::ServerError> {
//!     let server = Server::builder()
//!         .address("127.0.0.1", 8080)
//!         .handler(handler_fn(|ctx| Box::pin(async move {
//!             ctx.select_encoding()?;
//!             ctx.write_str("hello world")?;
//!             Ok(())
//!         })))
//!         .build()?;
//!
//!     Arc::new(server).listen_and_serve().await
//! }
//! ```

pub mod compress;
mod context;
mod date;
mod dispatch;
mod handler;
pub mod pool;
mod protocol;
pub mod recover;
mod server;
pub mod tls;
pub mod websocket;

pub use compress::{CompressionConfig, Encoding};
pub use context::{PathParams, RequestCtx, Response};
pub use dispatch::{ConnContext, Connection, Io, ProtocolKind, select_protocol};
pub use handler::{FnHandler, HandlerFuture, NotFound, RequestHandler, handler_fn};
pub use protocol::{Http1x, Protocol};
pub use recover::{Failure, HttpFault, HttpResponseError, HttpStatusError, Recovery, Sentinel};
pub use server::{AcceptBackoff, Http1Config, Server, ServerBuilder, ServerConfig, ServerError, TlsFiles, is_transient};
pub use websocket::{Message, WebSocketConn, WebSocketOptions, websocket_handler};
