//! Echo client example for tresse.
//!
//! This example demonstrates how to create a client that:
//! - Dials the echo server over TCP
//! - Issues a unary call and a duplex streaming call
//! - Verifies the echoes match what was sent
//!
//! Run echo_server first, then run this client:
//!
//! ```text
//! cargo run --example echo_client
//! ```

use std::sync::Arc;

use tresse::prelude::*;
use tresse::Role;
use tresse_transport_stream::TcpTransport;

const ADDR: &str = "127.0.0.1:8888";

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let transport = TcpTransport::connect(ADDR).await?;
    let conn = Connection::establish(
        "echo-client",
        AnyTransport::new(transport),
        Role::Initiator,
        Arc::new(Router::empty()),
        ConnectionConfig::default(),
    );

    // Unary call.
    let unary = MethodStub::unary_unary("echo.Echo.Unary");
    let reply = unary.unary(&conn, Bytes::from_static(b"hello, tresse")).await?;
    println!("unary echo: {:?}", std::str::from_utf8(&reply)?);
    assert_eq!(reply, "hello, tresse");

    // Duplex streaming call.
    let duplex = MethodStub::stream_stream("echo.Echo.Duplex");
    let ctx = duplex.duplex(&conn)?;
    let messages = ["one", "two", "three"];
    for (i, message) in messages.iter().enumerate() {
        ctx.send_message(Bytes::from_static(message.as_bytes()), i + 1 == messages.len())
            .await?;
    }
    let mut seen = Vec::new();
    while let Some(message) = ctx.recv_message().await? {
        println!("duplex echo: {:?}", std::str::from_utf8(&message)?);
        seen.push(message);
    }
    ctx.close(None).await;
    assert_eq!(seen, messages.map(|m| Bytes::from_static(m.as_bytes())));

    conn.close(None).await;
    println!("done");
    Ok(())
}
