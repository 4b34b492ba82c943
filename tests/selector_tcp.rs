//! TCP selector against real sockets on 127.0.0.1.
//!
//! Peers are plain blocking `std::net` servers on their own threads, so each
//! test controls exactly how bytes reach the selector.

mod common;

use common::*;
use netmux::prelude::*;
use netmux::{SelectorSettings, TcpSelector};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const DEADLINE: Duration = Duration::from_secs(10);

// ============================================================================
// Peer Helpers
// ============================================================================

fn read_frame(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len)?;
    let mut payload = vec![0u8; u32::from_be_bytes(len) as usize];
    stream.read_exact(&mut payload)?;
    Ok(payload)
}

/// Echoes every frame back, dribbling the reply out in small pieces.
fn spawn_split_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.set_nodelay(true).unwrap();
        while let Ok(payload) = read_frame(&mut stream) {
            let reply = frame(&payload);
            let (prefix, body) = reply.split_at(4);
            let (first, second) = body.split_at(body.len() / 2);
            let pieces = [&prefix[..1], &prefix[1..3], &prefix[3..], first, second];
            for piece in pieces {
                if stream.write_all(piece).is_err() {
                    return;
                }
                thread::sleep(Duration::from_millis(10));
            }
        }
    });

    addr
}

/// Writes `bytes` once on accept, then waits for the client to go away.
fn spawn_writing_server(bytes: Vec<u8>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let _ = stream.write_all(&bytes);
        let _ = stream.read_to_end(&mut Vec::new());
    });

    addr
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn echo_with_split_reply() {
    init_tracing();
    println!("=== TCP Echo With Split Reply ===\n");

    let server = spawn_split_echo_server();
    let (mut selector, metrics) = new_tcp_selector(SelectorSettings::default());

    let id = selector
        .connect(server, 0, 0, PortType::Plaintext)
        .expect("connect failed");
    println!("Connecting {id}");
    assert_eq!(selector.connection_state(&id), ConnectionState::Connecting);

    // Queued while still connecting, written once the connection is up.
    let send = NetworkSend::new(id.clone(), Box::new(ByteBufferSend::framed(b"hello, selector")));
    let collected = poll_until(&mut selector, vec![send], DEADLINE, |c| {
        !c.completed_receives.is_empty() || !c.disconnected.is_empty()
    });
    println!("{collected:?}");

    assert_eq!(collected.connected, vec![id.clone()]);
    assert!(collected.disconnected.is_empty());
    assert_eq!(collected.completed_sends.len(), 1);
    assert_eq!(collected.completed_sends[0].connection_id(), &id);

    assert_eq!(collected.completed_receives.len(), 1);
    let receive = &collected.completed_receives[0];
    assert_eq!(receive.connection_id(), &id);
    assert_eq!(receive.payload(), b"hello, selector");
    assert_eq!(receive.frame_length(), 15);
    assert_eq!(selector.connection_state(&id), ConnectionState::Connected);

    let snapshot = metrics.snapshot();
    println!("{snapshot:?}");
    assert_eq!(snapshot.connections_created, 1);
    assert_eq!(snapshot.bytes_sent, 19);
    assert_eq!(snapshot.bytes_received, 19);
    assert_eq!(snapshot.receives_timed, 1);
    assert!(snapshot.select_calls > 0);
}

#[test]
fn frames_arriving_together_complete_in_order() {
    init_tracing();

    let mut wire = Vec::new();
    for payload in [&b"one"[..], b"two", b"", b"four"] {
        wire.extend(frame(payload));
    }
    let server = spawn_writing_server(wire);
    let (mut selector, _) = new_tcp_selector(SelectorSettings::default());

    let id = selector
        .connect(server, 0, 0, PortType::Plaintext)
        .expect("connect failed");
    let collected = poll_until(&mut selector, Vec::new(), DEADLINE, |c| {
        c.completed_receives.len() >= 4 || !c.disconnected.is_empty()
    });

    let payloads: Vec<&[u8]> = collected
        .completed_receives
        .iter()
        .map(|receive| receive.payload())
        .collect();
    assert_eq!(payloads, vec![&b"one"[..], b"two", b"", b"four"]);
    assert!(collected
        .completed_receives
        .iter()
        .all(|receive| receive.connection_id() == &id));
}

#[test]
fn oversized_frame_disconnects_only_the_offender() {
    init_tracing();

    let settings = SelectorSettings {
        max_frame_size: 1024,
        ..Default::default()
    };
    let good_server = spawn_split_echo_server();
    let bad_server = spawn_writing_server(2048u32.to_be_bytes().to_vec());
    let (mut selector, metrics) = new_tcp_selector(settings);

    let good = selector
        .connect(good_server, 0, 0, PortType::Plaintext)
        .expect("connect failed");
    let bad = selector
        .connect(bad_server, 0, 0, PortType::Plaintext)
        .expect("connect failed");

    let send = NetworkSend::new(good.clone(), Box::new(ByteBufferSend::framed(b"still here")));
    let collected = poll_until(&mut selector, vec![send], DEADLINE, |c| {
        !c.completed_receives.is_empty() && !c.disconnected.is_empty()
    });

    assert_eq!(collected.disconnected, vec![bad.clone()]);
    assert_eq!(collected.completed_receives.len(), 1);
    assert_eq!(collected.completed_receives[0].connection_id(), &good);
    assert_eq!(collected.completed_receives[0].payload(), b"still here");

    assert_eq!(selector.connection_state(&bad), ConnectionState::Disconnected);
    assert_eq!(selector.connection_state(&good), ConnectionState::Connected);
    assert_eq!(metrics.snapshot().faults, 1);
}

#[test]
fn peer_close_is_reported_as_disconnect() {
    init_tracing();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        drop(stream);
    });

    let (mut selector, metrics) = new_tcp_selector(SelectorSettings::default());
    let id = selector
        .connect(addr, 0, 0, PortType::Plaintext)
        .expect("connect failed");

    let collected = poll_until(&mut selector, Vec::new(), DEADLINE, |c| {
        !c.disconnected.is_empty()
    });
    assert_eq!(collected.disconnected, vec![id.clone()]);
    assert!(collected.completed_receives.is_empty());
    assert_eq!(selector.connection_count(), 0);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.connections_closed, 1);
    assert_eq!(snapshot.faults, 1);
}

#[test]
fn refused_connection_fails_now_or_disconnects_later() {
    init_tracing();

    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let (mut selector, _) = new_tcp_selector(SelectorSettings::default());

    match selector.connect(addr, 0, 0, PortType::Plaintext) {
        Err(Error::Connect { addr: failed, .. }) => {
            assert_eq!(failed, addr);
            assert_eq!(selector.connection_count(), 0);
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(id) => {
            let collected = poll_until(&mut selector, Vec::new(), DEADLINE, |c| {
                !c.disconnected.is_empty()
            });
            assert_eq!(collected.disconnected, vec![id]);
            assert!(collected.connected.is_empty());
        }
    }
}

#[test]
fn stalled_connect_times_out() {
    init_tracing();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let clock = Arc::new(ManualClock::new());
    let metrics = Arc::new(InMemoryMetrics::new());
    let settings = SelectorSettings {
        connect_timeout: Duration::from_secs(1),
        ..Default::default()
    };
    let mut selector =
        TcpSelector::new(settings, metrics.clone(), clock.clone()).expect("selector failed");

    let id = selector
        .connect(addr, 0, 0, PortType::Plaintext)
        .expect("connect failed");

    // Expiry is checked before the readiness wait, so the handshake never
    // gets a chance to finish.
    clock.advance(Duration::from_secs(2));
    selector.poll(Duration::ZERO, Vec::new()).unwrap();

    assert_eq!(selector.disconnected(), vec![id.clone()]);
    assert!(selector.connected().is_empty());
    assert_eq!(selector.connection_state(&id), ConnectionState::Disconnected);
    assert_eq!(metrics.snapshot().faults, 1);
    drop(listener);
}

#[test]
fn connect_within_limit_is_not_expired() {
    init_tracing();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let clock = Arc::new(ManualClock::new());
    let settings = SelectorSettings {
        connect_timeout: Duration::from_secs(1),
        ..Default::default()
    };
    let mut selector = TcpSelector::new(settings, Arc::new(NoopMetrics), clock.clone())
        .expect("selector failed");

    let id = selector
        .connect(addr, 0, 0, PortType::Plaintext)
        .expect("connect failed");
    clock.advance(Duration::from_millis(999));
    wait_connected(&mut selector, &id);
    drop(listener);
}

#[test]
fn close_discards_send_in_flight() {
    init_tracing();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (done_tx, done_rx) = mpsc::channel::<()>();
    thread::spawn(move || {
        // Hold the connection open without ever reading from it.
        let (_stream, _) = listener.accept().unwrap();
        let _ = done_rx.recv();
    });

    let (mut selector, _) = new_tcp_selector(SelectorSettings::default());
    let id = selector
        .connect(addr, 4096, 4096, PortType::Plaintext)
        .expect("connect failed");
    wait_connected(&mut selector, &id);

    let payload = vec![0xAB; 32 * 1024 * 1024];
    let send = NetworkSend::new(id.clone(), Box::new(ByteBufferSend::framed(&payload)));
    selector
        .poll(Duration::from_millis(50), vec![send])
        .unwrap();
    assert!(selector.completed_sends().is_empty());

    // One send in flight per connection.
    let again = NetworkSend::from_bytes(id.clone(), b"more".to_vec());
    match selector.poll(Duration::ZERO, vec![again]) {
        Err(Error::DuplicateSend { id: dup }) => assert_eq!(dup, id.to_string()),
        other => panic!("expected duplicate send error, got {other:?}"),
    }

    selector.close_connection(&id);
    selector.poll(Duration::ZERO, Vec::new()).unwrap();
    assert_eq!(selector.disconnected(), vec![id.clone()]);
    assert!(selector.completed_sends().is_empty());

    // Closing an identifier that is already gone is a no-op.
    selector.close_connection(&id);
    selector.poll(Duration::ZERO, Vec::new()).unwrap();
    assert!(selector.disconnected().is_empty());

    let _ = done_tx.send(());
}

#[test]
fn interface_connects_from_another_thread_and_wakes_poll() {
    init_tracing();

    let server = spawn_split_echo_server();
    let (mut selector, _) = new_tcp_selector(SelectorSettings::default());
    let interface = selector.interface();

    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        interface
            .connect(server, 0, 0, PortType::Plaintext)
            .expect("connect failed")
    });

    let start = Instant::now();
    let mut collected = Collected::default();
    selector
        .poll(Duration::from_secs(30), Vec::new())
        .unwrap();
    collected.drain_from(&mut selector);
    let elapsed = start.elapsed();
    println!("first poll returned after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(10), "poll was not woken");

    let id = handle.join().unwrap();
    let rest = poll_until(&mut selector, Vec::new(), DEADLINE, |c| {
        !c.connected.is_empty() || !c.disconnected.is_empty()
    });
    collected.connected.extend(rest.connected);
    assert_eq!(collected.connected, vec![id]);
}

#[test]
fn interface_close_all_is_applied_on_next_poll() {
    init_tracing();

    let first = spawn_split_echo_server();
    let second = spawn_split_echo_server();
    let (mut selector, metrics) = new_tcp_selector(SelectorSettings::default());

    let a = selector
        .connect(first, 0, 0, PortType::Plaintext)
        .expect("connect failed");
    let b = selector
        .connect(second, 0, 0, PortType::Ssl)
        .expect("connect failed");
    assert_eq!(selector.port_type(&b), Some(PortType::Ssl));

    selector.interface().close_all();
    selector.poll(Duration::ZERO, Vec::new()).unwrap();

    let mut disconnected = selector.disconnected();
    disconnected.sort();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(disconnected, expected);
    assert_eq!(selector.connection_count(), 0);
    assert_eq!(metrics.snapshot().connections_closed, 2);
}

#[test]
fn closed_selector_rejects_connect_and_poll() {
    init_tracing();

    let server = spawn_split_echo_server();
    let (mut selector, _) = new_tcp_selector(SelectorSettings::default());
    let _id = selector
        .connect(server, 0, 0, PortType::Plaintext)
        .expect("connect failed");

    selector.close();
    assert_eq!(selector.connection_count(), 0);
    assert!(matches!(
        selector.poll(Duration::ZERO, Vec::new()),
        Err(Error::SelectorClosed)
    ));
    assert!(matches!(
        selector.connect(server, 0, 0, PortType::Plaintext),
        Err(Error::SelectorClosed)
    ));
    assert!(selector.disconnected().is_empty());
}

#[test]
fn interface_connect_after_close_opens_no_socket() {
    init_tracing();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();

    let (mut selector, metrics) = new_tcp_selector(SelectorSettings::default());
    let interface = selector.interface();
    assert!(!interface.is_closed());

    selector.close();
    assert!(interface.is_closed());
    assert!(selector.interface().is_closed());

    let result = interface.connect(addr, 0, 0, PortType::Plaintext);
    println!("interface connect after close: {result:?}");
    assert!(matches!(result, Err(Error::SelectorClosed)), "got {result:?}");

    // Queued closes are dropped rather than left waiting.
    interface.close_all();
    interface.wakeup();

    thread::sleep(Duration::from_millis(50));
    match listener.accept() {
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
        other => panic!("peer saw a connection: {other:?}"),
    }
    assert_eq!(metrics.snapshot().connections_created, 0);
    assert!(matches!(
        selector.poll(Duration::ZERO, Vec::new()),
        Err(Error::SelectorClosed)
    ));
}

#[test]
fn receive_latency_is_measured_from_first_byte() {
    init_tracing();
    println!("=== Receive Latency ===\n");

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (resume_tx, resume_rx) = mpsc::channel::<()>();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.set_nodelay(true).unwrap();
        let wire = frame(b"0123456789");
        let (head, tail) = wire.split_at(6);
        stream.write_all(head).unwrap();
        if resume_rx.recv().is_ok() {
            let _ = stream.write_all(tail);
        }
        let _ = stream.read_to_end(&mut Vec::new());
    });

    let clock = Arc::new(ManualClock::new());
    clock.set(Duration::from_secs(5));
    let metrics = Arc::new(InMemoryMetrics::new());
    let mut selector = TcpSelector::new(SelectorSettings::default(), metrics.clone(), clock.clone())
        .expect("selector failed");

    let id = selector
        .connect(addr, 0, 0, PortType::Plaintext)
        .expect("connect failed");
    let head = poll_until(&mut selector, Vec::new(), DEADLINE, |_| {
        metrics.snapshot().bytes_received >= 6
    });
    assert!(head.completed_receives.is_empty());
    assert!(head.disconnected.is_empty());
    assert_eq!(metrics.snapshot().bytes_received, 6);

    clock.advance(Duration::from_millis(250));
    resume_tx.send(()).unwrap();
    let tail = poll_until(&mut selector, Vec::new(), DEADLINE, |c| {
        !c.completed_receives.is_empty() || !c.disconnected.is_empty()
    });

    assert_eq!(tail.completed_receives.len(), 1);
    let receive = &tail.completed_receives[0];
    assert_eq!(receive.connection_id(), &id);
    assert_eq!(receive.payload(), b"0123456789");
    assert_eq!(receive.started_at(), Duration::from_secs(5));

    let snapshot = metrics.snapshot();
    println!("{snapshot:?}");
    assert_eq!(snapshot.receives_timed, 1);
    assert_eq!(snapshot.total_receive_latency, Duration::from_millis(250));
}
