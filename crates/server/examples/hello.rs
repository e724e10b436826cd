use std::sync::Arc;

use http::StatusCode;
use suna::recover::NOT_FOUND;
use suna::{Failure, Server, ServerError, handler_fn};
use tokio_util::sync::CancellationToken;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let cancel = CancellationToken::new();
    let server = Server::builder()
        .address("127.0.0.1", 8080)
        .cancellation_token(cancel.clone())
        .recover_value(&NOT_FOUND, |ctx, _| {
            ctx.set_status(StatusCode::NOT_FOUND);
            let _ = ctx.write_str("nothing here\n");
        })
        .handler(handler_fn(|ctx| {
            Box::pin(async move {
                let path = ctx.request().uri().path().to_owned();
                match path.as_str() {
                    "/" => {
                        ctx.select_encoding()?;
                        ctx.set_content_type(&mime::TEXT_PLAIN_UTF_8);
                        ctx.write_str("Hello World!\n")?;
                        Ok(())
                    }
                    "/teapot" => Err(Failure::status(StatusCode::IM_A_TEAPOT, "short and stout")),
                    _ => Err(Failure::from(&NOT_FOUND)),
                }
            })
        }))
        .build()?;

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
            cancel.cancel();
        }
    });

    Arc::new(server).listen_and_serve().await
}
