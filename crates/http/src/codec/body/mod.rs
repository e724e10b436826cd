//! Request body decoding.
//!
//! - [`ChunkedDecoder`]: `Transfer-Encoding: chunked` bodies (RFC 9112 section 7.1)
//! - [`LengthDecoder`]: `Content-Length` bodies
//! - [`PayloadDecoder`]: picks one of the above from a [`PayloadSize`](crate::protocol::PayloadSize)

mod chunked_decoder;
mod length_decoder;
mod payload_decoder;

pub use payload_decoder::PayloadDecoder;
