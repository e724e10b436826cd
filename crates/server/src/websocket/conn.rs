//! The server end of an established WebSocket connection.

use std::string::FromUtf8Error;

use bytes::{Bytes, BytesMut};
use flate2::{CompressError, DecompressError};
use futures::{SinkExt, StreamExt};
use suna_http::protocol::FrameError;
use thiserror::Error;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::error::{CapacityError, ProtocolError};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role, WebSocketConfig};
use tracing::debug;

use crate::Connection;
use crate::pool::Pool;
use crate::websocket::deflate::DeflateStream;
use crate::websocket::{Handshake, WebSocketOptions};

const NORMAL_CLOSURE: u16 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    /// The peer's close code and reason, if it sent one.
    Close(Option<(u16, String)>),
}

#[derive(Error, Debug)]
pub enum WebSocketError {
    #[error("websocket transport error: {0}")]
    Transport(Box<tungstenite::Error>),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    #[error("text message is not utf-8: {0}")]
    InvalidUtf8(#[from] FromUtf8Error),
    #[error("message exceeds {max_size} bytes")]
    TooLarge { max_size: usize },
    #[error("failed to inflate message: {0}")]
    Inflate(#[from] DecompressError),
    #[error("failed to deflate message: {0}")]
    Deflate(#[from] CompressError),
    #[error("connection already closed")]
    Closed,
}

impl From<tungstenite::Error> for WebSocketError {
    fn from(e: tungstenite::Error) -> Self {
        match e {
            tungstenite::Error::Capacity(CapacityError::MessageTooLong { max_size, .. }) => Self::TooLarge { max_size },
            e => Self::Transport(Box::new(e)),
        }
    }
}

enum Transport {
    Plain(WebSocketStream<Connection>),
    Deflate(DeflateStream),
}

/// A hijacked connection speaking RFC 6455 frames.
///
/// Pings are answered while receiving and a close frame from the peer is
/// echoed before it is handed to the caller.
pub struct WebSocketConn {
    transport: Transport,
    subprotocol: Option<String>,
    compression: bool,
    closed: bool,
}

impl WebSocketConn {
    pub(crate) async fn new(
        conn: Connection,
        leftover: BytesMut,
        handshake: Handshake,
        options: &WebSocketOptions,
        write_buffers: &Pool<Vec<u8>>,
    ) -> Self {
        let transport = if handshake.compression {
            let mut write_buffer = write_buffers.checkout();
            write_buffer.clear();
            Transport::Deflate(DeflateStream::new(conn, leftover, options, write_buffer))
        } else {
            let stream =
                WebSocketStream::from_partially_read(conn, leftover.to_vec(), Role::Server, Some(config(options))).await;
            Transport::Plain(stream)
        };

        Self { transport, subprotocol: handshake.subprotocol, compression: handshake.compression, closed: false }
    }

    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// Whether permessage-deflate was negotiated.
    pub fn compression(&self) -> bool {
        self.compression
    }

    /// Waits for the next data or close message.
    ///
    /// Returns `Ok(None)` once the peer has gone away or the close exchange
    /// has completed.
    pub async fn recv(&mut self) -> Result<Option<Message>, WebSocketError> {
        if self.closed {
            return Ok(None);
        }

        let message = match &mut self.transport {
            Transport::Plain(stream) => recv_plain(stream).await?,
            Transport::Deflate(stream) => stream.recv().await?,
        };
        if matches!(message, None | Some(Message::Close(_))) {
            self.closed = true;
        }
        Ok(message)
    }

    pub async fn send(&mut self, message: Message) -> Result<(), WebSocketError> {
        if self.closed {
            return Err(WebSocketError::Closed);
        }

        if let Message::Close(reason) = message {
            let (code, reason) = reason.unwrap_or((NORMAL_CLOSURE, String::new()));
            return self.close(code, &reason).await;
        }
        match &mut self.transport {
            Transport::Deflate(stream) => stream.send(message).await,
            Transport::Plain(stream) => {
                stream.send(into_tungstenite(message)).await?;
                Ok(())
            }
        }
    }

    /// Starts the closing handshake and waits for the peer's close frame.
    pub async fn close(&mut self, code: u16, reason: &str) -> Result<(), WebSocketError> {
        if self.closed {
            return Err(WebSocketError::Closed);
        }
        self.closed = true;

        match &mut self.transport {
            Transport::Deflate(stream) => stream.close(code, reason).await,
            Transport::Plain(stream) => {
                stream.close(Some(CloseFrame { code: CloseCode::from(code), reason: reason.to_owned().into() })).await?;
                while let Some(next) = stream.next().await {
                    match next {
                        Ok(tungstenite::Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            debug!(cause = %e, "error while waiting for close frame");
                            break;
                        }
                    }
                }
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for WebSocketConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConn")
            .field("subprotocol", &self.subprotocol)
            .field("compression", &self.compression)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

fn into_tungstenite(message: Message) -> tungstenite::Message {
    match message {
        Message::Text(text) => tungstenite::Message::Text(text.into()),
        Message::Binary(data) => tungstenite::Message::Binary(data),
        Message::Ping(data) => tungstenite::Message::Ping(data),
        Message::Pong(data) => tungstenite::Message::Pong(data),
        Message::Close(reason) => tungstenite::Message::Close(
            reason.map(|(code, reason)| CloseFrame { code: CloseCode::from(code), reason: reason.into() }),
        ),
    }
}

fn config(options: &WebSocketOptions) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.write_buffer_size = options.write_buffer_size;
    config.max_message_size = Some(options.max_message_size);
    config.max_frame_size = Some(options.max_message_size);
    config
}

/// Reads until a data or close message arrives. Pongs for received pings are
/// queued by the stream and written on the next read.
async fn recv_plain(stream: &mut WebSocketStream<Connection>) -> Result<Option<Message>, WebSocketError> {
    loop {
        let Some(next) = stream.next().await else {
            debug!("websocket peer went away");
            return Ok(None);
        };

        match next {
            Ok(tungstenite::Message::Text(text)) => return Ok(Some(Message::Text(text.as_str().to_owned()))),
            Ok(tungstenite::Message::Binary(data)) => return Ok(Some(Message::Binary(data))),
            Ok(tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) | tungstenite::Message::Frame(_)) => {}
            Ok(tungstenite::Message::Close(frame)) => {
                // the echoed close frame is queued; push it out before handing over
                match stream.flush().await {
                    Ok(()) | Err(tungstenite::Error::ConnectionClosed) => {}
                    Err(e) => return Err(e.into()),
                }
                let reason = frame.map(|frame| (u16::from(frame.code), frame.reason.as_str().to_owned()));
                return Ok(Some(Message::Close(reason)));
            }
            Err(
                tungstenite::Error::ConnectionClosed
                | tungstenite::Error::AlreadyClosed
                | tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake),
            ) => {
                debug!("websocket peer went away");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }
    }
}
