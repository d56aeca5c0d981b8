//! End-to-end call-shape scenarios over the in-process transport.

use std::time::Duration;

use bytes::Bytes;
use tresse::{
    CallKind, ConnectionConfig, ContractViolation, DispatchMode, Method, MethodStub, Router,
    RpcError, code,
};
use tresse_testkit::{
    self as testkit, EchoService, duplex_stub, fail_stub, gather_stub, notify_stub, spread_stub,
    unary_stub,
};

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn unary_echo_round_trips_an_8000_byte_payload() {
    testkit::init_tracing();
    let (client, _server) = testkit::mem_pair(EchoService::new().router(), ConnectionConfig::default());

    let payload = Bytes::from(vec![b'a'; 8000]);
    let reply = unary_stub().unary(&client, payload.clone()).await.unwrap();
    assert_eq!(reply, payload);
}

#[tokio::test]
async fn server_streaming_delivers_in_order_with_an_end_marker() {
    testkit::init_tracing();
    let (client, _server) = testkit::mem_pair(EchoService::new().router(), ConnectionConfig::default());

    let ctx = spread_stub()
        .server_streaming(&client, Bytes::from_static(b"5"))
        .await
        .unwrap();
    let mut seen = Vec::new();
    while let Some(message) = ctx.recv_message().await.unwrap() {
        seen.push(String::from_utf8(message.to_vec()).unwrap());
    }
    ctx.close(None).await;
    assert_eq!(seen, vec!["0", "1", "2", "3", "4"]);
}

#[tokio::test]
async fn client_streaming_gathers_every_request() {
    testkit::init_tracing();
    let (client, _server) = testkit::mem_pair(EchoService::new().router(), ConnectionConfig::default());

    let reply = gather_stub()
        .client_streaming(
            &client,
            vec![
                Bytes::from_static(b"ab"),
                Bytes::from_static(b"cd"),
                Bytes::from_static(b"ef"),
            ],
        )
        .await
        .unwrap();
    assert_eq!(reply, "abcdef");
}

#[tokio::test]
async fn duplex_streams_preserve_order_both_ways() {
    testkit::init_tracing();
    let (client, _server) = testkit::mem_pair(EchoService::new().router(), ConnectionConfig::default());

    let ctx = duplex_stub().duplex(&client).unwrap();
    let messages = [b"m1".as_slice(), b"m2", b"m3"];
    for (i, message) in messages.iter().enumerate() {
        ctx.send_message(Bytes::copy_from_slice(message), i == messages.len() - 1)
            .await
            .unwrap();
    }

    let mut seen = Vec::new();
    while let Some(message) = ctx.recv_message().await.unwrap() {
        seen.push(message);
    }
    ctx.close(None).await;
    assert_eq!(seen, vec![&b"m1"[..], b"m2", b"m3"]);
}

#[tokio::test]
async fn second_send_on_a_unary_call_is_rejected() {
    testkit::init_tracing();
    let (client, _server) = testkit::mem_pair(EchoService::new().router(), ConnectionConfig::default());

    let ctx = unary_stub().open(&client, None).unwrap();
    ctx.send_message(Bytes::from_static(b"one"), false)
        .await
        .unwrap();
    assert!(matches!(
        ctx.send_message(Bytes::from_static(b"two"), false).await,
        Err(RpcError::Contract(
            ContractViolation::RequestAlreadySent { .. }
        ))
    ));
    ctx.close(None).await;
}

#[tokio::test]
async fn call_error_resolves_the_call_and_leaves_the_connection_open() {
    testkit::init_tracing();
    let (client, _server) = testkit::mem_pair(EchoService::new().router(), ConnectionConfig::default());

    let err = fail_stub()
        .unary(&client, Bytes::from_static(b"x"))
        .await
        .unwrap_err();
    match err {
        RpcError::Call(e) => assert_eq!(e.code, testkit::ECHO_FAIL_CODE),
        other => panic!("expected a call error, got {other}"),
    }

    // The same connection still serves calls.
    let reply = unary_stub()
        .unary(&client, Bytes::from_static(b"still here"))
        .await
        .unwrap();
    assert_eq!(reply, "still here");
    assert!(!client.is_closed());
}

#[tokio::test]
async fn unknown_method_yields_a_structured_not_found_error() {
    testkit::init_tracing();
    let (client, _server) = testkit::mem_pair(EchoService::new().router(), ConnectionConfig::default());

    let err = MethodStub::unary_unary("no.Such.Method")
        .unary(&client, Bytes::from_static(b"x"))
        .await
        .unwrap_err();
    match err {
        RpcError::Call(e) => assert_eq!(e.code, code::NOT_FOUND),
        other => panic!("expected a call error, got {other}"),
    }
    assert!(!client.is_closed());
}

#[tokio::test]
async fn timeout_resolves_only_the_context_that_timed_out() {
    testkit::init_tracing();
    let router = Router::builder()
        .route(Method::new(
            "test.Sleepy.Hang",
            CallKind::UnaryUnary,
            |ctx| async move {
                let _ = ctx.recv_message().await?;
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            },
        ))
        .route(Method::new(
            "test.Sleepy.Ping",
            CallKind::UnaryUnary,
            |ctx| async move {
                let request = ctx.recv_message().await?.unwrap_or_default();
                ctx.send_message(request, false).await?;
                Ok(())
            },
        ))
        .build();
    // Parallel dispatch, so the hanging call does not block its sibling.
    let config = ConnectionConfig {
        dispatch: DispatchMode::parallel(),
        ..ConnectionConfig::default()
    };
    let (client, _server) = testkit::mem_pair(router, config);

    let hung = {
        let client = client.clone();
        tokio::spawn(async move {
            MethodStub::unary_unary("test.Sleepy.Hang")
                .unary_with_timeout(&client, Bytes::from_static(b"x"), Duration::from_millis(50))
                .await
        })
    };

    let reply = MethodStub::unary_unary("test.Sleepy.Ping")
        .unary(&client, Bytes::from_static(b"alive"))
        .await
        .unwrap();
    assert_eq!(reply, "alive");

    assert!(matches!(hung.await.unwrap(), Err(RpcError::Timeout)));
    assert!(!client.is_closed());
}

#[tokio::test]
async fn closing_a_connection_cancels_every_outstanding_context() {
    testkit::init_tracing();
    let (client, _server) = testkit::mem_pair(EchoService::new().router(), ConnectionConfig::default());

    let contexts: Vec<_> = (0..3)
        .map(|_| unary_stub().open(&client, None).unwrap())
        .collect();
    assert_eq!(client.manager().len(), 3);

    let waiters: Vec<_> = contexts
        .iter()
        .map(|ctx| {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.recv_message().await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(10)).await;

    client.close(None).await;

    for waiter in waiters {
        assert!(matches!(
            waiter.await.unwrap(),
            Err(RpcError::ConnectionClosed)
        ));
    }
    assert!(client.manager().is_empty());
}

#[tokio::test]
async fn both_endpoints_allocate_from_disjoint_id_spaces() {
    testkit::init_tracing();
    let service = EchoService::new();
    let (client, server) = testkit::pair_with_routers(
        service.router(),
        service.router(),
        ConnectionConfig::default(),
    );

    let client_ctxs: Vec<_> = (0..5)
        .map(|_| unary_stub().open(&client, None).unwrap())
        .collect();
    let server_ctxs: Vec<_> = (0..5)
        .map(|_| unary_stub().open(&server, None).unwrap())
        .collect();

    let client_ids: Vec<u32> = client_ctxs.iter().map(|c| c.transmission_id()).collect();
    let server_ids: Vec<u32> = server_ctxs.iter().map(|c| c.transmission_id()).collect();

    assert_eq!(client_ids, vec![1, 3, 5, 7, 9]);
    assert_eq!(server_ids, vec![2, 4, 6, 8, 10]);
    assert!(client_ids.iter().all(|id| !server_ids.contains(id)));

    for ctx in client_ctxs.iter().chain(&server_ctxs) {
        ctx.close(None).await;
    }
}

#[tokio::test]
async fn calls_flow_in_both_directions_on_one_connection() {
    testkit::init_tracing();
    let service = EchoService::new();
    let (client, server) = testkit::pair_with_routers(
        service.router(),
        service.router(),
        ConnectionConfig::default(),
    );

    let from_client = unary_stub()
        .unary(&client, Bytes::from_static(b"ping"))
        .await
        .unwrap();
    let from_server = unary_stub()
        .unary(&server, Bytes::from_static(b"pong"))
        .await
        .unwrap();
    assert_eq!(from_client, "ping");
    assert_eq!(from_server, "pong");
}

#[tokio::test]
async fn shutdown_drains_work_already_submitted() {
    testkit::init_tracing();
    let router = Router::builder()
        .route(Method::new(
            "test.Slow.Echo",
            CallKind::UnaryUnary,
            |ctx| async move {
                let request = ctx.recv_message().await?.unwrap_or_default();
                tokio::time::sleep(Duration::from_millis(50)).await;
                ctx.send_message(request, false).await?;
                Ok(())
            },
        ))
        .build();
    let (client, server) = testkit::mem_pair(router, ConnectionConfig::default());

    let call = {
        let client = client.clone();
        tokio::spawn(async move {
            MethodStub::unary_unary("test.Slow.Echo")
                .unary(&client, Bytes::from_static(b"drain me"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    server.shutdown();
    // New outbound work is refused while draining.
    assert!(matches!(
        unary_stub().open(&server, None),
        Err(RpcError::Shutdown)
    ));

    // The call submitted before the shutdown still completes.
    assert_eq!(call.await.unwrap().unwrap(), "drain me");
    wait_until(|| server.is_closed()).await;
}

#[tokio::test]
async fn void_methods_resolve_without_a_response_frame() {
    testkit::init_tracing();
    let service = EchoService::new();
    let (client, _server) = testkit::mem_pair(service.router(), ConnectionConfig::default());

    let reply = notify_stub()
        .unary(&client, Bytes::from_static(b"fire and forget"))
        .await
        .unwrap();
    assert!(reply.is_empty());

    let notifications = service.notifications.clone();
    wait_until(move || notifications.load(std::sync::atomic::Ordering::SeqCst) == 1).await;
}
