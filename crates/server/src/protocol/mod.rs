//! Application protocols a connection can be handed to.
//!
//! A [`Protocol`] owns the connection from dispatch until it closes: framing,
//! keep-alive and repeated calls into the request handler are its job.
//! [`Http1x`] is built in; the HTTP/2 slot is filled by the embedding
//! application through [`ServerBuilder::http2_protocol`](crate::ServerBuilder::http2_protocol).

mod http1;

pub use http1::Http1x;
pub(crate) use http1::Http1Io;

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::{ConnContext, Connection, Server};

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Protocol: Send + Sync {
    async fn serve(&self, ctx: ConnContext, server: Arc<Server>, conn: Connection);
}
