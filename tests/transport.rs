//! End-to-end transport tests over loopback sockets.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream;
use tokio::sync::broadcast;
use tokio::time::timeout;

use peerwire::{
    CloseOptions, Connection, DialOptions, Direction, EventBus, EventSink, ListenerState,
    NodeInfo, Signal, TcpTransport, TransportConfig, TransportError, TransportEvent,
};

fn local_node() -> NodeInfo {
    NodeInfo {
        id: "test-node".into(),
        ip: "127.0.0.1".parse().unwrap(),
        port: 0,
    }
}

fn transport_with_bus(config: TransportConfig) -> (TcpTransport, Arc<EventBus>) {
    init_tracing();
    let bus = Arc::new(EventBus::default());
    let sink: Arc<dyn EventSink> = bus.clone();
    let transport = TcpTransport::new(config, sink);
    (transport, bus)
}

/// Honor RUST_LOG when debugging a failing scenario.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Wait for the next inbound `connection:open` event.
async fn next_inbound(rx: &mut broadcast::Receiver<TransportEvent>) -> Connection {
    loop {
        match rx.recv().await.expect("event bus closed") {
            TransportEvent::ConnectionOpened { connection }
                if connection.direction() == Direction::Inbound =>
            {
                return connection;
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn dial_exchange_and_close() {
    let (transport, bus) = transport_with_bus(TransportConfig::default());
    let mut events = bus.subscribe();

    let listener = transport.listen(&local_node()).await.unwrap();
    let address = listener.local_addr().to_string();

    let client = transport
        .dial(&address, DialOptions::default())
        .await
        .unwrap();
    assert_eq!(client.direction(), Direction::Outbound);
    assert_eq!(client.remote_addr(), address);

    let server = timeout(Duration::from_secs(5), next_inbound(&mut events))
        .await
        .expect("no inbound connection surfaced");

    client
        .sink(stream::iter(vec![Bytes::from_static(b"Hello")]))
        .await
        .unwrap();

    let mut source = server.source();
    let received = source.read_to_end().await.unwrap();
    assert_eq!(received, b"Hello");

    client.close(CloseOptions::default()).await;

    // The remote FIN already terminated the server side when its source
    // ended; the client side closed gracefully just now.
    timeout(Duration::from_secs(1), server.closed())
        .await
        .expect("server connection did not close");

    for conn in [&client, &server] {
        let open = conn.timeline().open();
        let close = conn.timeline().close().expect("close timestamp missing");
        assert!(open <= close);
    }
}

#[tokio::test]
async fn one_open_event_per_accepted_socket() {
    let (transport, bus) = transport_with_bus(TransportConfig::default());
    let mut events = bus.subscribe();

    let listener = transport.listen(&local_node()).await.unwrap();
    let address = listener.local_addr().to_string();

    let first = transport
        .dial(&address, DialOptions::default())
        .await
        .unwrap();
    let second = transport
        .dial(&address, DialOptions::default())
        .await
        .unwrap();

    let inbound_a = timeout(Duration::from_secs(5), next_inbound(&mut events))
        .await
        .unwrap();
    let inbound_b = timeout(Duration::from_secs(5), next_inbound(&mut events))
        .await
        .unwrap();
    assert_ne!(inbound_a.id(), inbound_b.id());

    // No third inbound event shows up uninvited.
    let extra = timeout(Duration::from_millis(300), next_inbound(&mut events)).await;
    assert!(extra.is_err());

    first.abort(TransportError::Aborted);
    second.abort(TransportError::Aborted);
}

#[tokio::test]
async fn stopped_listener_surfaces_no_connections() {
    let (transport, bus) = transport_with_bus(TransportConfig::default());
    let mut events = bus.subscribe();

    let listener = transport.listen(&local_node()).await.unwrap();
    let address = listener.local_addr().to_string();

    listener.stop();
    assert_eq!(listener.state(), ListenerState::Inactive);

    // A `close` notification is published exactly once.
    let closed = timeout(Duration::from_secs(1), async {
        loop {
            if let TransportEvent::Closed = events.recv().await.unwrap() {
                return;
            }
        }
    })
    .await;
    assert!(closed.is_ok());

    // The raw connect may still succeed against the OS backlog, but no
    // connection is adapted and no event fires.
    let _ = tokio::net::TcpStream::connect(&address).await;
    let surfaced = timeout(Duration::from_millis(300), next_inbound(&mut events)).await;
    assert!(surfaced.is_err());
}

#[tokio::test]
async fn idle_connection_times_out() {
    let config = TransportConfig {
        inactivity_timeout_ms: 100,
        ..Default::default()
    };
    let (transport, bus) = transport_with_bus(config);
    let mut events = bus.subscribe();

    let listener = transport.listen(&local_node()).await.unwrap();
    let address = listener.local_addr().to_string();

    let client = transport
        .dial(&address, DialOptions::default())
        .await
        .unwrap();
    let server = timeout(Duration::from_secs(5), next_inbound(&mut events))
        .await
        .unwrap();

    // Neither side sends a byte; both watchdogs fire.
    timeout(Duration::from_secs(2), client.closed())
        .await
        .expect("client watchdog did not fire");
    timeout(Duration::from_secs(2), server.closed())
        .await
        .expect("server watchdog did not fire");

    let open = client.timeline().open();
    let close = client.timeline().close().unwrap();
    assert!(close - open >= 100);
    assert!(close - open < 2_000);
}

#[tokio::test]
async fn listener_pauses_at_limit_and_resumes() {
    let config = TransportConfig {
        max_connections: 1,
        ..Default::default()
    };
    let (transport, bus) = transport_with_bus(config);
    let mut events = bus.subscribe();

    let listener = transport.listen(&local_node()).await.unwrap();
    let address = listener.local_addr().to_string();

    let first = transport
        .dial(&address, DialOptions::default())
        .await
        .unwrap();
    let inbound = timeout(Duration::from_secs(5), next_inbound(&mut events))
        .await
        .unwrap();
    assert_eq!(listener.connection_count(), 1);

    // The second accept trips the limit: socket destroyed, listener paused,
    // no event.
    let second = transport
        .dial(&address, DialOptions::default())
        .await
        .unwrap();
    let surfaced = timeout(Duration::from_millis(500), next_inbound(&mut events)).await;
    assert!(surfaced.is_err());
    assert_eq!(listener.state(), ListenerState::Paused);

    // Drain the inbound source so the server observes the client's FIN.
    let mut source = inbound.source();
    tokio::spawn(async move { while let Ok(Some(_)) = source.next_chunk().await {} });

    first.close(CloseOptions::default()).await;
    timeout(Duration::from_secs(1), inbound.closed())
        .await
        .expect("tracked connection did not close");

    // Headroom returned; the cleanup task resumes the listener.
    let mut resumed = false;
    for _ in 0..50 {
        if listener.state() == ListenerState::Active {
            resumed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(resumed, "listener did not resume after headroom returned");
    assert_eq!(listener.connection_count(), 0);

    second.abort(TransportError::Aborted);
}

#[tokio::test]
async fn stop_leaves_accepted_connections_usable() {
    let (transport, bus) = transport_with_bus(TransportConfig::default());
    let mut events = bus.subscribe();

    let listener = transport.listen(&local_node()).await.unwrap();
    let address = listener.local_addr().to_string();

    let client = transport
        .dial(&address, DialOptions::default())
        .await
        .unwrap();
    let server = timeout(Duration::from_secs(5), next_inbound(&mut events))
        .await
        .unwrap();

    listener.stop();

    // The accepted connection's lifecycle is independent of the listener's.
    client
        .sink(stream::iter(vec![Bytes::from_static(b"still here")]))
        .await
        .unwrap();
    let mut source = server.source();
    let received = source.read_to_end().await.unwrap();
    assert_eq!(received, b"still here");
}

#[tokio::test]
async fn dial_with_prefired_signal_aborts() {
    let (transport, _bus) = transport_with_bus(TransportConfig::default());

    let signal = Signal::new();
    signal.trigger();

    let err = transport
        .dial(
            "127.0.0.1:1",
            DialOptions {
                signal: Some(signal.handle()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Aborted));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn dial_dead_port_rejects_with_the_address() {
    let (transport, _bus) = transport_with_bus(TransportConfig::default());

    let vacant = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = vacant.local_addr().unwrap().to_string();
    drop(vacant);

    let err = transport
        .dial(&address, DialOptions::default())
        .await
        .unwrap_err();
    match &err {
        TransportError::Connection { address: annotated, .. } => {
            assert_eq!(annotated, &address);
        }
        other => panic!("expected connection error, got {other:?}"),
    }
    assert!(err.is_retryable());
}

#[tokio::test]
async fn close_flushes_inflight_sink_before_fin() {
    let (transport, bus) = transport_with_bus(TransportConfig::default());
    let mut events = bus.subscribe();

    let listener = transport.listen(&local_node()).await.unwrap();
    let address = listener.local_addr().to_string();

    let client = transport
        .dial(&address, DialOptions::default())
        .await
        .unwrap();
    let server = timeout(Duration::from_secs(5), next_inbound(&mut events))
        .await
        .unwrap();

    // The sink is still producing chunks when close() starts; the graceful
    // drain must wait it out and only then send the FIN.
    let sinker = client.clone();
    let sink_task = tokio::spawn(async move {
        let chunks = Box::pin(stream::unfold(0u8, |n| async move {
            if n == 3 {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            Some((Bytes::from_static(b"abc"), n + 1))
        }));
        sinker.sink(chunks).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    client.close(CloseOptions::default()).await;
    sink_task.await.unwrap();
    assert!(client.timeline().close().is_some());

    let mut source = server.source();
    assert_eq!(source.read_to_end().await.unwrap(), b"abcabcabc");
}

#[tokio::test]
async fn close_times_out_when_sink_stalls() {
    let config = TransportConfig {
        close_timeout_ms: 100,
        ..Default::default()
    };
    let (transport, bus) = transport_with_bus(config);
    let mut events = bus.subscribe();

    let listener = transport.listen(&local_node()).await.unwrap();
    let address = listener.local_addr().to_string();

    let client = transport
        .dial(&address, DialOptions::default())
        .await
        .unwrap();
    let _server = timeout(Duration::from_secs(5), next_inbound(&mut events))
        .await
        .unwrap();

    // A sink that never yields keeps the write half away from the drain;
    // the close deadline must fall back to abort instead of waiting.
    let sinker = client.clone();
    let sink_task = tokio::spawn(async move {
        sinker.sink(stream::pending::<Bytes>()).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let started = std::time::Instant::now();
    timeout(
        Duration::from_secs(2),
        client.close(CloseOptions::default()),
    )
    .await
    .expect("close did not fall back to abort");

    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(client.is_closed());
    assert!(client.timeline().close().is_some());
    sink_task.await.unwrap();
}

#[tokio::test]
async fn close_with_supplied_signal_still_terminates() {
    let (transport, bus) = transport_with_bus(TransportConfig::default());
    let mut events = bus.subscribe();

    let listener = transport.listen(&local_node()).await.unwrap();
    let address = listener.local_addr().to_string();

    let client = transport
        .dial(&address, DialOptions::default())
        .await
        .unwrap();
    let _server = timeout(Duration::from_secs(5), next_inbound(&mut events))
        .await
        .unwrap();

    let signal = Signal::new();
    signal.trigger();
    client
        .close(CloseOptions {
            signal: Some(signal.handle()),
        })
        .await;

    assert!(client.is_closed());
    assert!(client.timeline().close().is_some());
}

#[tokio::test]
async fn bulk_close_of_tracked_connections() {
    let (transport, bus) = transport_with_bus(TransportConfig::default());
    let mut events = bus.subscribe();

    let listener = transport.listen(&local_node()).await.unwrap();
    let address = listener.local_addr().to_string();

    let mut clients = Vec::new();
    let mut inbound = Vec::new();
    for _ in 0..3 {
        clients.push(transport.dial(&address, DialOptions::default()).await.unwrap());
        inbound.push(
            timeout(Duration::from_secs(5), next_inbound(&mut events))
                .await
                .unwrap(),
        );
    }
    assert_eq!(listener.connection_count(), 3);

    listener.close_connections().await;

    for conn in &inbound {
        timeout(Duration::from_secs(1), conn.closed())
            .await
            .expect("tracked connection did not close");
        assert!(conn.timeline().close().is_some());
    }
}
