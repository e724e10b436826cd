//! HTTP request decoder.
//!
//! A two-phase state machine: while `payload_decoder` is `None` the decoder
//! parses a request head with [`HeaderDecoder`]; once a head is produced it
//! switches to the matching [`PayloadDecoder`] until the body's `Eof`.

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::codec::body::PayloadDecoder;
use crate::codec::header::HeaderDecoder;
use crate::protocol::{Message, ParseError, PayloadItem, PayloadSize, RequestHeader};

#[derive(Debug, Default)]
pub struct RequestDecoder {
    header_decoder: HeaderDecoder,
    payload_decoder: Option<PayloadDecoder>,
}

impl RequestDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for RequestDecoder {
    type Item = Message<(RequestHeader, PayloadSize)>;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(payload_decoder) = &mut self.payload_decoder {
            return Ok(match payload_decoder.decode(src)? {
                Some(item @ PayloadItem::Chunk(_)) => Some(Message::Payload(item)),
                Some(PayloadItem::Eof) => {
                    self.payload_decoder = None;
                    Some(Message::Payload(PayloadItem::Eof))
                }
                None => None,
            });
        }

        Ok(self.header_decoder.decode(src)?.map(|(header, payload_size)| {
            self.payload_decoder = Some(payload_size.into());
            Message::Header((header, payload_size))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use indoc::indoc;

    #[test]
    fn pipelined_requests() {
        let str = indoc! {r##"
        POST /echo HTTP/1.1
        Content-Length: 5

        helloGET /next HTTP/1.1
        Host: a

        "##};
        let mut src = BytesMut::from(str);
        let mut decoder = RequestDecoder::new();

        let Some(Message::Header((header, size))) = decoder.decode(&mut src).unwrap() else { panic!("expect header") };
        assert_eq!(header.uri().path(), "/echo");
        assert_eq!(size, PayloadSize::Length(5));

        let chunk = decoder.decode(&mut src).unwrap().unwrap();
        assert!(matches!(chunk, Message::Payload(PayloadItem::Chunk(ref b)) if b == &Bytes::from_static(b"hello")));
        assert!(matches!(decoder.decode(&mut src).unwrap(), Some(Message::Payload(PayloadItem::Eof))));

        let Some(Message::Header((header, size))) = decoder.decode(&mut src).unwrap() else { panic!("expect header") };
        assert_eq!(header.uri().path(), "/next");
        assert!(size.is_empty());
        assert!(matches!(decoder.decode(&mut src).unwrap(), Some(Message::Payload(PayloadItem::Eof))));
        assert!(decoder.decode(&mut src).unwrap().is_none());
    }
}
