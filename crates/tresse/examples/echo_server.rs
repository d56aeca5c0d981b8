//! Echo server example for tresse.
//!
//! This example demonstrates how to create a server that:
//! - Registers an echo service covering two call shapes
//! - Binds a TCP listener and starts the channel accept loop
//! - Serves calls until interrupted
//!
//! Run this before running the echo_client example:
//!
//! ```text
//! cargo run --example echo_server
//! ```

use tresse::prelude::*;
use tresse_transport_stream::TcpListenerAdapter;

const ADDR: &str = "127.0.0.1:8888";

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let router = Router::builder()
        // Unary-unary: echo the single request back.
        .route(Method::new(
            "echo.Echo.Unary",
            CallKind::UnaryUnary,
            |ctx| async move {
                let request = ctx.recv_message().await?.unwrap_or_default();
                ctx.send_message(request, false).await?;
                Ok(())
            },
        ))
        // Stream-stream: echo every request message in order.
        .route(Method::new(
            "echo.Echo.Duplex",
            CallKind::StreamStream,
            |ctx| async move {
                while let Some(message) = ctx.recv_message().await? {
                    ctx.send_message(message, false).await?;
                }
                Ok(())
            },
        ))
        .build();

    let channel = Channel::new("echo-server", router, ChannelConfig::default());
    channel.listen(TcpListenerAdapter::bind(ADDR).await?);
    channel.start()?;
    println!("echo server listening on {ADDR}, ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    println!("shutting down");
    channel.close(None).await;
    channel.join().await;
    Ok(())
}
