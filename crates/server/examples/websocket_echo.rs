use std::sync::Arc;

use suna::{Message, Server, ServerError, WebSocketConn, WebSocketOptions, websocket_handler};
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

async fn echo(mut conn: WebSocketConn, request: http::Request<bytes::Bytes>) {
    info!(path = request.uri().path(), subprotocol = ?conn.subprotocol(), "websocket connected");
    loop {
        match conn.recv().await {
            Ok(Some(Message::Close(reason))) => {
                info!(?reason, "websocket closed by peer");
                break;
            }
            Ok(Some(message)) => {
                if let Err(e) = conn.send(message).await {
                    warn!(cause = %e, "failed to echo message");
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(cause = %e, "websocket error");
                break;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::DEBUG).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let options = WebSocketOptions::default().with_subprotocol(|ctx| {
        let offered = ctx.request().headers().get(http::header::SEC_WEBSOCKET_PROTOCOL)?.to_str().ok()?;
        offered.split(',').map(str::trim).find(|p| *p == "echo").map(str::to_owned)
    });

    let server = Server::builder().address("127.0.0.1", 8081).websocket(options).handler(websocket_handler(echo)).build()?;
    Arc::new(server).listen_and_serve().await
}
