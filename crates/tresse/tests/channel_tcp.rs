//! Channel lifecycle and admission control over the TCP transport.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tresse::{
    AnyTransport, ChannelConfig, ChannelState, Connection, ConnectionConfig, Listener, Role,
    Router, RpcError, Channel,
};
use tresse_testkit::{self as testkit, EchoService, unary_stub};
use tresse_transport_stream::{TcpListenerAdapter, TcpTransport};

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

async fn serve(name: &str, max_connections: usize) -> (Channel, String) {
    let config = ChannelConfig {
        max_connections,
        ..ChannelConfig::default()
    };
    let channel = Channel::new(name, EchoService::new().router(), config);
    let listener = TcpListenerAdapter::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    channel.listen(listener);
    channel.start().unwrap();
    (channel, addr)
}

async fn dial(addr: &str) -> Connection {
    let transport = TcpTransport::connect(addr).await.unwrap();
    Connection::establish(
        "client",
        AnyTransport::new(transport),
        Role::Initiator,
        Arc::new(Router::empty()),
        ConnectionConfig::default(),
    )
}

#[tokio::test]
async fn echo_round_trips_over_tcp() {
    testkit::init_tracing();
    let (channel, addr) = serve("tcp-echo", 16).await;

    let client = dial(&addr).await;
    let payload = Bytes::from(vec![b'a'; 8000]);
    let reply = unary_stub().unary(&client, payload.clone()).await.unwrap();
    assert_eq!(reply, payload);

    client.close(None).await;
    channel.close(None).await;
    channel.join().await;
}

#[tokio::test]
async fn third_connection_waits_until_capacity_frees_up() {
    testkit::init_tracing();
    let (channel, addr) = serve("tcp-admission", 2).await;

    let c1 = dial(&addr).await;
    let c2 = dial(&addr).await;
    // Sanity calls prove both are admitted.
    unary_stub().unary(&c1, Bytes::from_static(b"1")).await.unwrap();
    unary_stub().unary(&c2, Bytes::from_static(b"2")).await.unwrap();
    wait_until(|| channel.is_full()).await;

    // The third socket connects at the kernel level but is never admitted,
    // so its call sees no response until capacity frees up.
    let c3 = dial(&addr).await;
    let err = unary_stub()
        .unary_with_timeout(&c3, Bytes::from_static(b"3"), Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout));

    // Freeing one slot resumes the accept loop and admits the waiter.
    c1.close(None).await;
    wait_until(|| !channel.is_full()).await;
    let reply = unary_stub().unary(&c3, Bytes::from_static(b"3")).await.unwrap();
    assert_eq!(reply, "3");

    c2.close(None).await;
    c3.close(None).await;
    channel.close(None).await;
    channel.join().await;
}

#[tokio::test]
async fn channel_close_cascades_and_finalizes() {
    testkit::init_tracing();
    let (channel, addr) = serve("tcp-close", 16).await;

    let client = dial(&addr).await;
    unary_stub().unary(&client, Bytes::from_static(b"hi")).await.unwrap();
    assert_eq!(channel.len(), 1);

    channel.close(None).await;
    channel.join().await;
    assert_eq!(channel.state(), ChannelState::Closed);
    assert!(channel.is_empty());

    // The peer observes the teardown as its own close.
    wait_until(|| client.is_closed()).await;
}

#[tokio::test]
async fn dialing_through_a_channel_applies_admission_control() {
    testkit::init_tracing();
    let (server, addr) = serve("tcp-server", 16).await;

    let config = ChannelConfig {
        max_connections: 1,
        ..ChannelConfig::default()
    };
    let dialer = Channel::new("dialer", Router::empty(), config);
    dialer.start().unwrap();

    let t1 = TcpTransport::connect(&addr).await.unwrap();
    let conn = dialer.connect(AnyTransport::new(t1)).unwrap();
    let reply = unary_stub().unary(&conn, Bytes::from_static(b"via channel")).await.unwrap();
    assert_eq!(reply, "via channel");

    let t2 = TcpTransport::connect(&addr).await.unwrap();
    assert!(matches!(
        dialer.connect(AnyTransport::new(t2)),
        Err(RpcError::Call(e)) if e.code == tresse::code::CONNECTION_LIMIT
    ));

    dialer.close(None).await;
    dialer.join().await;
    server.close(None).await;
    server.join().await;
}
