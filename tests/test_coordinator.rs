mod common;
use common::*;
use omnik_bridge::prelude::*;

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn options() -> CoordinatorOptions {
    CoordinatorOptions {
        timeouts: Timeouts {
            connect: Some(Duration::from_secs(2)),
            read: Some(Duration::from_millis(500)),
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn push_frame_becomes_statistics() {
    let (coordinator, mut events) = start_coordinator(options());
    let port = free_port();

    coordinator
        .start_listeners([("push", port as u32)])
        .await
        .unwrap();
    match next_event(&mut events).await {
        Event::ListenerReady(info) => assert_eq!(info.name, "push"),
        other => panic!("unexpected {:?}", other),
    }

    let mut device = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        Event::ClientConnected(_)
    ));

    device.write_all(&Factory::push_frame()).await.unwrap();

    match next_event(&mut events).await {
        Event::PushDataReceived(data, handle) => {
            assert_eq!(data.len(), 139);
            assert_eq!(handle.listener.port, port);
        }
        other => panic!("unexpected {:?}", other),
    }
    match next_event(&mut events).await {
        Event::StatisticsAvailable(stats) => {
            assert_eq!(stats.temperature(), 10.0);
            assert_eq!(stats.ac_frequency(), 50.0);
            assert_eq!(stats.inverter_serial_number(), Factory::INVERTER_SERIAL);
        }
        other => panic!("unexpected {:?}", other),
    }

    coordinator.stop_listeners().await;
    assert!(matches!(
        wait_for(&mut events, |e| matches!(e, Event::ClientDisconnected { .. })).await,
        Event::ClientDisconnected { .. }
    ));

    let stats = coordinator.stats();
    assert_eq!(stats.push_frames_received, 1);
    assert_eq!(stats.statistics_decoded, 1);
    assert_eq!(stats.clients_connected, 1);
    assert_eq!(stats.clients_disconnected, 1);

    coordinator.stop();
}

#[tokio::test]
async fn odd_sized_push_is_forwarded_raw() {
    let (coordinator, mut events) = start_coordinator(options());
    let port = free_port();
    coordinator
        .start_listeners([("push", port as u32)])
        .await
        .unwrap();

    let mut device = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    wait_for(&mut events, |e| matches!(e, Event::ClientConnected(_))).await;

    device.write_all(b"not a frame").await.unwrap();
    match next_event(&mut events).await {
        Event::PushDataReceived(data, _) => assert_eq!(&data[..], b"not a frame"),
        other => panic!("unexpected {:?}", other),
    }

    drop(device);
    match next_event(&mut events).await {
        Event::ClientDisconnected { .. } => {}
        other => panic!("unexpected {:?}", other),
    }

    let stats = coordinator.stats();
    assert_eq!(stats.statistics_decoded, 0);
    assert_eq!(stats.decode_errors, 0);

    coordinator.stop_listeners().await;
    coordinator.stop();
}

#[tokio::test]
async fn pull_data_decodes_reply() {
    let device = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = device.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut socket, _) = device.accept().await.unwrap();
        let mut request = [0u8; 16];
        socket.read_exact(&mut request).await.unwrap();
        socket.write_all(&Factory::frame_with_len(145)).await.unwrap();
    });

    let (coordinator, mut events) = start_coordinator(options());
    let session = coordinator.pull_data("127.0.0.1", port, "602119744");
    assert_eq!(session.port, port);

    let mut pulled = 0;
    let stats = loop {
        match next_event(&mut events).await {
            Event::PullDataReceived(data, info) => {
                assert_eq!(info, session);
                pulled += data.len();
            }
            Event::StatisticsAvailable(stats) => break stats,
            other => panic!("unexpected {:?}", other),
        }
    };
    assert_eq!(pulled, 145);
    assert_eq!(stats.wifi_module_serial_number(), Factory::WIFI_SERIAL.to_string());

    // the session winds down once the device hangs up
    for _ in 0..50 {
        if coordinator.in_flight_sessions().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(coordinator.in_flight_sessions().is_empty());

    let counters = coordinator.stats();
    assert_eq!(counters.pull_sessions_started, 1);
    assert_eq!(counters.pull_sessions_completed, 1);
    assert_eq!(counters.pull_frames_received, 1);

    coordinator.stop();
}

#[tokio::test]
async fn pull_from_closed_port_fails_once() {
    let (coordinator, mut events) = start_coordinator(options());
    let port = free_port();

    let session = coordinator.pull_data("127.0.0.1", port, "1234");

    match next_event(&mut events).await {
        Event::PullSessionFailed { session: s, .. } => assert_eq!(s, session),
        other => panic!("unexpected {:?}", other),
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    for event in drain(&mut events) {
        assert!(
            !matches!(
                event,
                Event::PullSessionFailed { .. } | Event::PullDataReceived(..)
            ),
            "unexpected {:?}",
            event
        );
    }
    assert_eq!(coordinator.stats().pull_sessions_failed, 1);

    coordinator.stop();
}

#[tokio::test]
async fn duplicate_listener_names_rejected() {
    let (coordinator, mut events) = start_coordinator(options());

    let result = coordinator
        .start_listeners([("push", free_port() as u32), ("push", free_port() as u32)])
        .await;
    assert!(matches!(result, Err(Error::Configuration(_))));

    let result = coordinator.start_listeners([("", free_port() as u32)]).await;
    assert!(matches!(result, Err(Error::Configuration(_))));

    assert!(coordinator.listener_names().await.is_empty());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(drain(&mut events).is_empty());

    coordinator.stop();
}

#[tokio::test]
async fn invalid_port_rejected_before_any_start() {
    let (coordinator, mut events) = start_coordinator(options());

    let result = coordinator
        .start_listeners([("a", free_port() as u32), ("b", 70000)])
        .await;
    assert!(matches!(result, Err(Error::InvalidPort(70000))));

    let result = coordinator
        .start_listeners([("a", free_port() as u32), ("b", 0)])
        .await;
    assert!(matches!(result, Err(Error::InvalidPort(0))));

    assert!(coordinator.listener_names().await.is_empty());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(drain(&mut events).is_empty());

    coordinator.stop();
}

#[tokio::test]
async fn bind_failure_aborts_remaining_listeners() {
    let blocker = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
    let taken = blocker.local_addr().unwrap().port();

    let (coordinator, mut events) = start_coordinator(options());
    let first = free_port();

    let result = coordinator
        .start_listeners([
            ("first", first as u32),
            ("second", taken as u32),
            ("third", free_port() as u32),
        ])
        .await;

    match result {
        Err(e @ Error::BindFailed { .. }) => assert_eq!(e.port(), Some(taken)),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(coordinator.listener_names().await, vec!["first".to_string()]);

    match wait_for(&mut events, |e| matches!(e, Event::BindFailed { .. })).await {
        Event::BindFailed { name, port } => {
            assert_eq!(name, "second");
            assert_eq!(port, taken);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(coordinator.stats().bind_failures, 1);

    coordinator.stop_listeners().await;
    assert!(coordinator.listener_names().await.is_empty());
    coordinator.stop();
}

#[tokio::test]
async fn stop_listeners_disconnects_everyone() {
    let (coordinator, mut events) = start_coordinator(CoordinatorOptions {
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        ..options()
    });
    let port = free_port();
    coordinator
        .start_listeners([("push", port as u32)])
        .await
        .unwrap();

    let mut devices = Vec::new();
    for _ in 0..2 {
        devices.push(TcpStream::connect(("127.0.0.1", port)).await.unwrap());
        wait_for(&mut events, |e| matches!(e, Event::ClientConnected(_))).await;
    }

    coordinator.stop_listeners().await;

    for _ in 0..2 {
        match next_event(&mut events).await {
            Event::ClientDisconnected { listener, .. } => assert_eq!(listener.name, "push"),
            other => panic!("unexpected {:?}", other),
        }
    }

    coordinator.stop();
    assert!(matches!(
        wait_for(&mut events, |e| matches!(e, Event::Shutdown)).await,
        Event::Shutdown
    ));
}
