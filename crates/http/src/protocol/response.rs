//! HTTP response header handling.
//!
//! Responses are always fully buffered by the server core, so the encoder
//! takes the head together with the complete body.

use bytes::Bytes;
use http::Response;

/// The header portion of a response, before the body is attached.
pub type ResponseHead = Response<()>;

/// What follows a response head on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    /// Sent after the head; `Content-Length` is set from its length.
    Full(Bytes),
    /// Nothing follows the head and its `Content-Length`, if any, is kept as
    /// given. Answers to `HEAD` and `304 Not Modified` describe a body that
    /// is never sent.
    Omitted,
}

impl ResponseBody {
    pub fn empty() -> Self {
        Self::Full(Bytes::new())
    }

    /// Bytes to write after the head.
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Full(bytes) => bytes,
            Self::Omitted => &[],
        }
    }
}

impl From<Bytes> for ResponseBody {
    fn from(bytes: Bytes) -> Self {
        Self::Full(bytes)
    }
}

/// A response head paired with its complete body.
pub type FullResponse = (ResponseHead, ResponseBody);
