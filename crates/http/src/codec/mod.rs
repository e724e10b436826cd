//! Codecs for the wire formats the server speaks.
//!
//! - [`RequestDecoder`]: HTTP/1.x request heads followed by their payload,
//!   framed by `Content-Length` or chunked transfer coding
//! - [`ResponseEncoder`]: a buffered HTTP/1.x response, head and body
//! - [`FrameCodec`]: server-side WebSocket frames
//!
//! All of them plug into `tokio_util::codec::{FramedRead, FramedWrite, Framed}`.

mod body;
mod frame_codec;
mod header;
mod request_decoder;
mod response_encoder;

pub use frame_codec::FrameCodec;
pub use header::{MAX_HEADER_BYTES, MAX_HEADER_NUM};
pub use request_decoder::RequestDecoder;
pub use response_encoder::ResponseEncoder;
