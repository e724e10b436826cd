//! Wire-level building blocks for the suna server core.
//!
//! This crate knows nothing about sockets, handlers or TLS. It turns bytes
//! into typed messages and back:
//!
//! - [`codec`]: `tokio_util` decoders and encoders for HTTP/1.x requests and
//!   responses, and for WebSocket frames
//! - [`protocol`]: the types those codecs produce and consume, plus their errors
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use suna_http::codec::RequestDecoder;
//! use suna_http::protocol::Message;
//! use tokio_util::codec::Decoder;
//!
//! let mut buf = BytesMut::from("GET /hello HTTP/1.1\r\nHost: localhost\r\n\r\n");
//! let mut decoder = RequestDecoder::new();
//!
//! match decoder.decode(&mut buf).unwrap() {
//!     Some(Message::Header((header, _size))) => assert_eq!(header.uri().path(), "/hello"),
//!     _ => unreachable!(),
//! }
//! ```
//!
//! # Limitations
//!
//! - HTTP/1.0 and HTTP/1.1 only
//! - Maximum header size: 8KB
//! - Maximum number of headers: 64

pub mod codec;
pub mod protocol;

mod utils;
pub(crate) use utils::ensure;
