mod common;
use common::*;
use omnik_bridge::omnik::listener::ListenerEvent;
use omnik_bridge::omnik::ListenerState;
use omnik_bridge::prelude::*;

use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

async fn connect(port: u16) -> TcpStream {
    TcpStream::connect(("127.0.0.1", port)).await.unwrap()
}

#[test]
fn rejects_out_of_range_ports() {
    let (tx, _rx) = mpsc::unbounded_channel();

    for port in [0, 65536, 100_000] {
        match Listener::new("bad", port, tx.clone()) {
            Err(Error::InvalidPort(p)) => assert_eq!(p, port),
            Err(e) => panic!("port {} gave {}", port, e),
            Ok(_) => panic!("port {} accepted", port),
        }
    }

    assert!(Listener::new("ok", 1, tx.clone()).is_ok());
    assert!(Listener::new("ok", 65535, tx).is_ok());
}

#[tokio::test]
async fn client_lifecycle() {
    let port = free_port();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut listener = Listener::new("push", port as u32, tx).unwrap();

    assert_eq!(listener.state(), ListenerState::Stopped);
    listener.start().await.unwrap();
    assert!(listener.is_listening());

    match next_message(&mut rx).await {
        ListenerEvent::Ready(info) => {
            assert_eq!(info.name, "push");
            assert_eq!(info.port, port);
        }
        other => panic!("unexpected {:?}", other),
    }

    let mut client = connect(port).await;
    let local = client.local_addr().unwrap();

    let handle = match next_message(&mut rx).await {
        ListenerEvent::ClientConnected(handle) => handle,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(handle.remote, local);
    assert_eq!(handle.listener.name, "push");
    assert_eq!(listener.connection_count(), 1);
    assert_eq!(listener.connections(), vec![handle.clone()]);

    client.write_all(b"hello").await.unwrap();
    match next_message(&mut rx).await {
        ListenerEvent::DataReceived(data, h) => {
            assert_eq!(&data[..], b"hello");
            assert_eq!(h, handle);
        }
        other => panic!("unexpected {:?}", other),
    }

    drop(client);
    match next_message(&mut rx).await {
        ListenerEvent::ClientDisconnected(remote, info) => {
            assert_eq!(remote, local);
            assert_eq!(info.port, port);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(listener.connection_count(), 0);

    listener.stop().await;
    assert_eq!(listener.state(), ListenerState::Stopped);
}

#[tokio::test]
async fn stop_drains_every_connection() {
    let port = free_port();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut listener = Listener::new("push", port as u32, tx).unwrap();
    listener.start().await.unwrap();
    assert!(matches!(next_message(&mut rx).await, ListenerEvent::Ready(_)));

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(connect(port).await);
        assert!(matches!(
            next_message(&mut rx).await,
            ListenerEvent::ClientConnected(_)
        ));
    }
    assert_eq!(listener.connection_count(), 3);

    listener.stop().await;

    let mut disconnected = 0;
    while let Ok(event) = rx.try_recv() {
        if let ListenerEvent::ClientDisconnected(..) = event {
            disconnected += 1;
        }
    }
    assert_eq!(disconnected, 3);
    assert_eq!(listener.connection_count(), 0);
    assert!(!listener.is_listening());

    // socket released
    let rebound = tokio::net::TcpListener::bind(("0.0.0.0", port)).await;
    assert!(rebound.is_ok());
}

#[tokio::test]
async fn stop_is_idempotent() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut listener = Listener::new("push", free_port() as u32, tx).unwrap();

    listener.stop().await;
    listener.start().await.unwrap();
    listener.stop().await;
    listener.stop().await;

    assert_eq!(listener.state(), ListenerState::Stopped);
}

#[tokio::test]
async fn restart_when_already_listening() {
    let port = free_port();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut listener = Listener::new("push", port as u32, tx).unwrap();

    listener.start().await.unwrap();
    listener.start().await.unwrap();

    assert!(matches!(next_message(&mut rx).await, ListenerEvent::Ready(_)));
    assert!(matches!(next_message(&mut rx).await, ListenerEvent::Ready(_)));
    assert!(listener.is_listening());

    let _client = connect(port).await;
    assert!(matches!(
        next_message(&mut rx).await,
        ListenerEvent::ClientConnected(_)
    ));

    listener.stop().await;
}

#[tokio::test]
async fn bind_failure_carries_port() {
    let blocker = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
    let port = blocker.local_addr().unwrap().port();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut listener = Listener::new("taken", port as u32, tx).unwrap();

    match listener.start().await {
        Err(e @ Error::BindFailed { .. }) => {
            assert_eq!(e.port(), Some(port));
            if let Error::BindFailed { name, .. } = e {
                assert_eq!(name, "taken");
            }
        }
        other => panic!("unexpected {:?}", other),
    }

    assert!(!listener.is_listening());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn idle_clients_are_disconnected() {
    let port = free_port();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut listener = Listener::new("push", port as u32, tx)
        .unwrap()
        .with_idle_timeout(Some(Duration::from_millis(200)));
    listener.start().await.unwrap();

    let _client = connect(port).await;

    assert!(matches!(next_message(&mut rx).await, ListenerEvent::Ready(_)));
    assert!(matches!(
        next_message(&mut rx).await,
        ListenerEvent::ClientConnected(_)
    ));
    assert!(matches!(
        next_message(&mut rx).await,
        ListenerEvent::ClientDisconnected(..)
    ));
    assert_eq!(listener.connection_count(), 0);

    listener.stop().await;
}

#[tokio::test]
async fn logs_through_injected_sink() {
    let log = CapturedLog::default();
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut listener = Listener::new("push", free_port() as u32, tx)
        .unwrap()
        .with_logger(log.logger());

    listener.start().await.unwrap();
    listener.stop().await;

    assert!(log.contains(Level::Info, "listening on push"));
    assert!(log.contains(Level::Info, "has been closed"));
}
