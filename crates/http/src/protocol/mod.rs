//! Core protocol types shared by the codecs and the server core.
//!
//! - **Message Handling** ([`Message`], [`PayloadItem`], [`PayloadSize`]):
//!   the pieces the request decoder yields
//! - **Request Processing** ([`RequestHeader`]): parsed request head plus the
//!   keep-alive / continue / upgrade questions asked about it
//! - **Response Processing** ([`ResponseHead`], [`ResponseBody`], [`FullResponse`])
//! - **WebSocket** ([`Frame`], [`OpCode`])
//! - **Error Handling** ([`HttpError`], [`ParseError`], [`SendError`], [`FrameError`])

mod message;
pub use message::Message;
pub use message::PayloadItem;
pub use message::PayloadSize;

mod request;
pub use request::RequestHeader;
pub use request::header_contains_token;

mod response;
pub use response::FullResponse;
pub use response::ResponseBody;
pub use response::ResponseHead;

mod frame;
pub use frame::Frame;
pub use frame::OpCode;

mod error;
pub use error::FrameError;
pub use error::HttpError;
pub use error::ParseError;
pub use error::SendError;
