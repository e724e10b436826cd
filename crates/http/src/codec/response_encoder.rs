//! HTTP/1.x response encoder.
//!
//! Responses are buffered by the server core, so the head and the complete
//! body are encoded together; the head gets a matching `Content-Length`
//! unless the body is [`ResponseBody::Omitted`].

use bytes::BytesMut;
use tokio_util::codec::Encoder;

use crate::codec::header::HeaderEncoder;
use crate::protocol::{FullResponse, ResponseBody, SendError};

#[derive(Debug, Default)]
pub struct ResponseEncoder {
    header_encoder: HeaderEncoder,
}

impl ResponseEncoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Encoder<FullResponse> for ResponseEncoder {
    type Error = SendError;

    fn encode(&mut self, item: FullResponse, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (head, body) = item;
        let body_len = match &body {
            ResponseBody::Full(bytes) => Some(bytes.len() as u64),
            ResponseBody::Omitted => None,
        };
        self.header_encoder.encode((head, body_len), dst)?;
        dst.extend_from_slice(body.bytes());
        Ok(())
    }
}
