//! HTTP/1.x head processing.
//!
//! - [`HeaderDecoder`]: parses a request head and picks the body framing
//! - [`HeaderEncoder`]: writes a status line and header fields, adding the
//!   framing headers the status allows

mod header_decoder;
mod header_encoder;

pub use header_decoder::HeaderDecoder;
pub use header_decoder::MAX_HEADER_BYTES;
pub use header_decoder::MAX_HEADER_NUM;
pub use header_encoder::HeaderEncoder;
