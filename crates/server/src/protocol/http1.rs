//! The HTTP/1.x keep-alive loop.
//!
//! Each request on a connection is read in full (head, then body up to
//! [`Http1Config::max_body_size`](crate::Http1Config::max_body_size)), handed
//! to the server's request handler through a [`RequestCtx`], and answered with
//! one buffered response. Requests on one connection are strictly sequential.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use http::{HeaderValue, Response, StatusCode, Version, header};
use suna_http::codec::{RequestDecoder, ResponseEncoder};
use suna_http::protocol::{
    FullResponse, HttpError, Message, ParseError, PayloadItem, PayloadSize, ResponseBody, SendError,
};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::protocol::Protocol;
use crate::{ConnContext, Connection, RequestCtx, Server};

/// Built-in HTTP/1.0 and HTTP/1.1 protocol.
#[derive(Debug, Default, Clone, Copy)]
pub struct Http1x;

#[async_trait]
impl Protocol for Http1x {
    async fn serve(&self, ctx: ConnContext, server: Arc<Server>, conn: Connection) {
        match process(&ctx, &server, conn).await {
            Ok(()) => debug!(conn = ctx.id, "finished process, connection shutdown"),
            Err(e) => info!(conn = ctx.id, cause = %e, "connection closed on error"),
        }
    }
}

/// The framed halves of an HTTP/1.x connection.
pub(crate) struct Http1Io {
    reader: FramedRead<ReadHalf<Connection>, RequestDecoder>,
    writer: FramedWrite<WriteHalf<Connection>, ResponseEncoder>,
}

impl Http1Io {
    pub(crate) fn new(conn: Connection, read_buffer_size: usize) -> Self {
        let (reader, writer) = tokio::io::split(conn);
        Self {
            reader: FramedRead::with_capacity(reader, RequestDecoder::new(), read_buffer_size),
            writer: FramedWrite::new(writer, ResponseEncoder::new()),
        }
    }

    /// Encodes and flushes one response.
    pub(crate) async fn send(&mut self, response: FullResponse) -> Result<(), SendError> {
        self.writer.send(response).await
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), SendError> {
        let io = self.writer.get_mut();
        io.write_all(bytes).await?;
        io.flush().await?;
        Ok(())
    }

    /// Reassembles the raw connection, with the bytes read past the last request.
    pub(crate) fn into_parts(mut self) -> (Connection, BytesMut) {
        let leftover = self.reader.read_buffer_mut().split();
        let conn = self.reader.into_inner().unsplit(self.writer.into_inner());
        (conn, leftover)
    }
}

impl std::fmt::Debug for Http1Io {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http1Io").field("buffered", &self.reader.read_buffer().len()).finish_non_exhaustive()
    }
}

async fn process(ctx: &ConnContext, server: &Arc<Server>, conn: Connection) -> Result<(), HttpError> {
    let config = server.http1_config();
    let mut io = Http1Io::new(conn, config.read_buffer_size);

    loop {
        let next = tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => {
                debug!(conn = ctx.id, "server stopping, closing idle connection");
                return Ok(());
            }
            next = io.reader.next() => next,
        };

        let (header, payload_size) = match next {
            Some(Ok(Message::Header(head))) => head,
            Some(Ok(Message::Payload(_))) => {
                send_status(&mut io, server, StatusCode::BAD_REQUEST).await?;
                return Err(ParseError::invalid_body("need header while receive body").into());
            }
            Some(Err(e)) => {
                warn!(conn = ctx.id, cause = %e, "can't receive next request");
                send_status(&mut io, server, StatusCode::BAD_REQUEST).await?;
                return Err(e.into());
            }
            None => {
                debug!(conn = ctx.id, "cant read more request, break this connection down");
                return Ok(());
            }
        };

        if let PayloadSize::Length(length) = payload_size
            && length > config.max_body_size as u64
        {
            send_status(&mut io, server, StatusCode::PAYLOAD_TOO_LARGE).await?;
            return Err(ParseError::too_large_body(config.max_body_size).into());
        }

        if header.expects_continue() && !payload_size.is_empty() {
            io.write_raw(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
            debug!(conn = ctx.id, "receive expect request header, sent continue response");
        }

        let body = match read_body(&mut io.reader, config.max_body_size).await {
            Ok(body) => body,
            Err(e) => {
                let status = match e {
                    ParseError::TooLargeBody { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                    _ => StatusCode::BAD_REQUEST,
                };
                send_status(&mut io, server, status).await?;
                return Err(e.into());
            }
        };

        let keep_alive = header.keep_alive();
        let mut request_ctx = RequestCtx::new(Arc::clone(server), header.body(body)).with_io(io);
        server.handle(&mut request_ctx).await;

        let Some(mut returned) = request_ctx.take_io() else {
            debug!(conn = ctx.id, "connection hijacked");
            return Ok(());
        };

        let response = match request_ctx.finish_response() {
            Ok(response) => response,
            Err(e) => {
                warn!(conn = ctx.id, cause = %e, "failed to finish response body");
                send_status(&mut returned, server, StatusCode::INTERNAL_SERVER_ERROR).await?;
                return Err(SendError::io(e).into());
            }
        };
        returned.send(response).await?;

        if !keep_alive {
            return Ok(());
        }
        io = returned;
    }
}

/// Collects the payload of the current request, consuming its `Eof` marker.
async fn read_body<R>(reader: &mut FramedRead<R, RequestDecoder>, max_body_size: usize) -> Result<Bytes, ParseError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut body = BytesMut::new();
    loop {
        match reader.next().await {
            Some(Ok(Message::Payload(PayloadItem::Chunk(bytes)))) => {
                if body.len() + bytes.len() > max_body_size {
                    return Err(ParseError::too_large_body(max_body_size));
                }
                body.extend_from_slice(&bytes);
            }
            Some(Ok(Message::Payload(PayloadItem::Eof))) => return Ok(body.freeze()),
            Some(Ok(Message::Header(_))) => return Err(ParseError::invalid_body("need body while receive header")),
            Some(Err(e)) => return Err(e),
            None => return Err(ParseError::invalid_body("connection closed before body finished")),
        }
    }
}

/// Answers with an empty body and closes the exchange.
async fn send_status(io: &mut Http1Io, server: &Server, status: StatusCode) -> Result<(), SendError> {
    let mut head = Response::new(());
    *head.status_mut() = status;
    *head.version_mut() = Version::HTTP_11;
    let headers = head.headers_mut();
    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    headers.insert(header::DATE, server.date_header());
    io.send((head, ResponseBody::empty())).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Failure, ServerBuilder, handler_fn};
    use indoc::indoc;
    use tokio::io::{AsyncReadExt, DuplexStream, duplex};
    use tokio_util::sync::CancellationToken;

    fn echo() -> ServerBuilder {
        Server::builder().handler(handler_fn(|ctx| {
            Box::pin(async move {
                let body = ctx.request().body().clone();
                if body.as_ref() == b"fail" {
                    return Err(Failure::status(StatusCode::UNPROCESSABLE_ENTITY, "refused"));
                }
                let path = ctx.request().uri().path().to_owned();
                ctx.write_str(&path)?;
                ctx.write(&body)?;
                Ok(())
            })
        }))
    }

    fn start(builder: ServerBuilder) -> (DuplexStream, tokio::task::JoinHandle<()>) {
        let server = Arc::new(builder.build().unwrap());
        let (client, server_side) = duplex(64 * 1024);
        let ctx = ConnContext { id: 7, peer: None, cancel: CancellationToken::new() };
        let task = tokio::spawn(async move { Http1x.serve(ctx, server, Connection::new(server_side, None, None)).await });
        (client, task)
    }

    async fn exchange(builder: ServerBuilder, request: &str) -> String {
        let (mut client, task) = start(builder);
        client.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        task.await.unwrap();
        String::from_utf8(response).unwrap()
    }

    #[tokio::test]
    async fn keep_alive_serves_pipelined_requests() {
        let request = indoc! {"
            POST /a HTTP/1.1\r
            Content-Length: 3\r
            \r
            123GET /b HTTP/1.1\r
            Connection: close\r
            \r
        "};
        let response = exchange(echo(), request).await;

        assert_eq!(response.matches("HTTP/1.1 200 OK\r\n").count(), 2);
        assert!(response.contains("content-length: 5\r\n"));
        assert!(response.contains("\r\n\r\n/a123HTTP/1.1"));
        assert!(response.ends_with("\r\n\r\n/b"));
        assert!(response.contains("date: "));
    }

    #[tokio::test]
    async fn http10_closes_after_response() {
        let response = exchange(echo(), "GET /old HTTP/1.0\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(response.ends_with("/old"));
    }

    #[tokio::test]
    async fn chunked_body_is_collected() {
        let request = indoc! {"
            POST /c HTTP/1.1\r
            Transfer-Encoding: chunked\r
            Connection: close\r
            \r
            3\r
            abc\r
            2\r
            de\r
            0\r
            \r
        "};
        let response = exchange(echo(), request).await;
        assert!(response.ends_with("/cabcde"));
    }

    #[tokio::test]
    async fn head_reports_length_without_body() {
        let response = exchange(echo(), "HEAD /head HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("content-length: 5\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn malformed_request_gets_400() {
        let response = exchange(echo(), "GARBAGE GARBAGE GARBAGE\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(response.contains("connection: close\r\n"));
    }

    #[tokio::test]
    async fn oversized_body_gets_413() {
        let mut builder = echo();
        builder = builder.http1(crate::Http1Config { max_body_size: 4, ..Default::default() });
        let response = exchange(builder, "POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n0123456789").await;
        assert!(response.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
    }

    #[tokio::test]
    async fn expect_continue_is_answered() {
        let request = "POST /e HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok";
        let response = exchange(echo(), request).await;
        assert!(response.starts_with("HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("/eok"));
    }

    #[tokio::test]
    async fn handler_failure_is_recovered() {
        let request = "POST /f HTTP/1.1\r\nContent-Length: 4\r\nConnection: close\r\n\r\nfail";
        let response = exchange(echo(), request).await;
        assert!(response.starts_with("HTTP/1.1 422 Unprocessable Entity\r\n"));
        assert!(response.ends_with("\r\n\r\nrefused"));
    }

    #[tokio::test]
    async fn cancelled_token_closes_idle_connection() {
        let server = Arc::new(echo().build().unwrap());
        let (mut client, server_side) = duplex(1024);
        let cancel = CancellationToken::new();
        let ctx = ConnContext { id: 9, peer: None, cancel: cancel.clone() };
        let task = tokio::spawn(async move { Http1x.serve(ctx, server, Connection::new(server_side, None, None)).await });

        cancel.cancel();
        task.await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
