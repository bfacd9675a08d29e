//! Connection FSM: lifecycle, retry classification, backoff, liveness,
//! epoch and signal semantics — driven through a scripted transport.
mod common;

use std::time::Duration;

use common::{mock_handle, MockHandle, MockTransport, MOCK_URL};
use kraken_stream::connection::{Connection, ConnectionConfig, Signal};
use kraken_stream::telemetry;
use kraken_stream::websocket::ControlEvent;
use kraken_stream::ErrorKind;

fn new_connection(handle: &MockHandle) -> Connection<MockTransport> {
    Connection::new(handle.clone(), telemetry::noop(), ConnectionConfig::default())
}

fn drain_signals(conn: &mut Connection<MockTransport>) -> Vec<Signal> {
    let mut out = Vec::new();
    let mut sig = Signal::None;
    while conn.poll_signal(&mut sig) {
        out.push(sig);
    }
    out
}

fn inject_peer_drop(handle: &MockHandle) {
    let mut state = handle.lock().unwrap();
    state
        .events
        .push_back(ControlEvent::Error(ErrorKind::RemoteClosed));
    state.events.push_back(ControlEvent::Close);
}

// -----------------------------------------------------------------------------
// Lifecycle
// -----------------------------------------------------------------------------

#[test]
fn test_open_connects_and_bumps_epoch() {
    let handle = mock_handle();
    let mut conn = new_connection(&handle);

    assert_eq!(conn.epoch(), 0);
    assert!(conn.open(MOCK_URL).is_ok());
    assert_eq!(conn.epoch(), 1);
    assert!(conn.is_active());
    assert_eq!(drain_signals(&mut conn), vec![Signal::Connected]);
}

#[test]
fn test_open_while_connected_is_invalid_state() {
    let handle = mock_handle();
    let mut conn = new_connection(&handle);

    assert!(conn.open(MOCK_URL).is_ok());
    assert_eq!(conn.open(MOCK_URL), Err(ErrorKind::InvalidState));
    assert_eq!(conn.epoch(), 1);
    assert_eq!(handle.lock().unwrap().connects, 1);
}

#[test]
fn test_open_with_invalid_url_never_touches_transport() {
    let handle = mock_handle();
    let mut conn = new_connection(&handle);

    assert_eq!(conn.open("http://not-ws.example"), Err(ErrorKind::InvalidUrl));
    assert_eq!(handle.lock().unwrap().connects, 0);
    assert!(!conn.is_active());
}

#[test]
fn test_send_gated_on_connected_state() {
    let handle = mock_handle();
    let mut conn = new_connection(&handle);

    assert!(!conn.send("too early"));
    assert!(conn.open(MOCK_URL).is_ok());
    assert!(conn.send("hello"));
    assert_eq!(conn.tx_messages(), 1);
    assert_eq!(handle.lock().unwrap().sent, vec!["hello".to_string()]);
}

#[test]
fn test_local_close_does_not_retry() {
    let handle = mock_handle();
    let mut conn = new_connection(&handle);

    assert!(conn.open(MOCK_URL).is_ok());
    drain_signals(&mut conn);

    conn.close();
    conn.close(); // idempotent

    // The transport's close completion arrives as a Close event.
    handle.lock().unwrap().events.push_back(ControlEvent::Close);
    conn.poll();

    assert_eq!(drain_signals(&mut conn), vec![Signal::Disconnected]);
    assert!(!conn.is_active());
    // No reconnect was attempted.
    conn.poll();
    assert_eq!(handle.lock().unwrap().connects, 1);
    assert_eq!(conn.epoch(), 1);
}

// -----------------------------------------------------------------------------
// Retry classification & backoff
// -----------------------------------------------------------------------------

#[test]
fn test_non_retriable_connect_failure_settles_disconnected() {
    let handle = mock_handle();
    handle
        .lock()
        .unwrap()
        .connect_results
        .push_back(Err(ErrorKind::ProtocolError));
    let mut conn = new_connection(&handle);

    assert_eq!(conn.open(MOCK_URL), Err(ErrorKind::ProtocolError));
    conn.poll();
    conn.poll();

    assert!(!conn.is_active());
    assert_eq!(conn.epoch(), 0);
    assert_eq!(handle.lock().unwrap().connects, 1);
    assert!(drain_signals(&mut conn).is_empty());
}

#[test]
fn test_retriable_connect_failure_retries_immediately() {
    let handle = mock_handle();
    handle
        .lock()
        .unwrap()
        .connect_results
        .push_back(Err(ErrorKind::ConnectionFailed));
    let mut conn = new_connection(&handle);

    assert_eq!(conn.open(MOCK_URL), Err(ErrorKind::ConnectionFailed));
    assert!(conn.is_active());
    assert_eq!(drain_signals(&mut conn), vec![Signal::RetryImmediate]);

    // The immediate retry runs on the next poll and succeeds.
    conn.poll();
    assert_eq!(conn.epoch(), 1);
    assert_eq!(drain_signals(&mut conn), vec![Signal::Connected]);
    assert_eq!(handle.lock().unwrap().connects, 2);
}

#[test]
fn test_failed_reconnect_schedules_backoff() {
    let handle = mock_handle();
    {
        let mut state = handle.lock().unwrap();
        state
            .connect_results
            .push_back(Err(ErrorKind::ConnectionFailed));
        state
            .connect_results
            .push_back(Err(ErrorKind::ConnectionFailed));
    }
    let mut conn = new_connection(&handle);

    assert!(conn.open(MOCK_URL).is_err());
    conn.poll(); // immediate retry -> fails -> backoff scheduled

    let signals = drain_signals(&mut conn);
    assert!(signals.contains(&Signal::RetryImmediate));
    assert!(signals.contains(&Signal::RetryScheduled));
    assert_eq!(handle.lock().unwrap().connects, 2);

    // The scheduled retry is not due yet.
    conn.poll();
    assert_eq!(handle.lock().unwrap().connects, 2);
    assert!(conn.is_idle());

    // ConnectionFailed is in the moderate class: 100ms * 2^2 = 400ms.
    std::thread::sleep(Duration::from_millis(450));
    assert!(!conn.is_idle());
    conn.poll();
    assert_eq!(handle.lock().unwrap().connects, 3);
    assert_eq!(conn.epoch(), 1);
}

#[test]
fn test_peer_drop_while_connected_reconnects() {
    let handle = mock_handle();
    let mut conn = new_connection(&handle);

    assert!(conn.open(MOCK_URL).is_ok());
    drain_signals(&mut conn);

    inject_peer_drop(&handle);
    conn.poll();

    let signals = drain_signals(&mut conn);
    assert_eq!(
        signals,
        vec![Signal::Disconnected, Signal::RetryImmediate, Signal::Connected]
    );
    assert_eq!(conn.epoch(), 2);
}

#[test]
fn test_disconnected_count_bounded_by_connected_count() {
    let handle = mock_handle();
    let mut conn = new_connection(&handle);
    assert!(conn.open(MOCK_URL).is_ok());

    let mut connected = 0u32;
    let mut disconnected = 0u32;
    for _ in 0..5 {
        inject_peer_drop(&handle);
        conn.poll();
        for sig in drain_signals(&mut conn) {
            match sig {
                Signal::Connected => connected += 1,
                Signal::Disconnected => disconnected += 1,
                _ => {}
            }
        }
        assert!(disconnected <= connected + 1);
    }
    assert_eq!(conn.epoch(), 6);
}

#[test]
fn test_backpressure_event_surfaces_as_signal() {
    let handle = mock_handle();
    let mut conn = new_connection(&handle);
    assert!(conn.open(MOCK_URL).is_ok());
    drain_signals(&mut conn);

    handle
        .lock()
        .unwrap()
        .events
        .push_back(ControlEvent::Backpressure);
    conn.poll();

    assert_eq!(drain_signals(&mut conn), vec![Signal::BackpressureDetected]);
    // Informational only: the connection stays up.
    assert!(conn.is_active());
    assert_eq!(conn.epoch(), 1);
}

// -----------------------------------------------------------------------------
// Liveness
// -----------------------------------------------------------------------------

fn short_liveness_config() -> ConnectionConfig {
    ConnectionConfig {
        heartbeat_timeout: Duration::from_millis(50),
        message_timeout: Duration::from_millis(50),
        liveness_warning_ratio: 0.8,
    }
}

#[test]
fn test_liveness_expiry_forces_reconnect() {
    let handle = mock_handle();
    let mut conn = Connection::<MockTransport>::new(
        handle.clone(),
        telemetry::noop(),
        short_liveness_config(),
    );

    assert!(conn.open(MOCK_URL).is_ok());
    drain_signals(&mut conn);

    // Total silence: both activity signals go stale.
    std::thread::sleep(Duration::from_millis(60));
    conn.poll();

    let signals = drain_signals(&mut conn);
    assert!(signals.contains(&Signal::LivenessThreatened));
    assert_eq!(handle.lock().unwrap().closes, 1);

    // Transport close completion, then the retry cycle begins.
    handle.lock().unwrap().events.push_back(ControlEvent::Close);
    conn.poll();

    let signals = drain_signals(&mut conn);
    assert!(signals.contains(&Signal::Disconnected));
    assert!(signals.contains(&Signal::RetryImmediate));
    assert!(signals.contains(&Signal::Connected));
    assert_eq!(conn.epoch(), 2);
}

#[test]
fn test_single_stale_signal_does_not_force_close() {
    let handle = mock_handle();
    let mut conn = Connection::<MockTransport>::new(
        handle.clone(),
        telemetry::noop(),
        ConnectionConfig {
            heartbeat_timeout: Duration::from_secs(60),
            message_timeout: Duration::from_millis(50),
            liveness_warning_ratio: 0.8,
        },
    );

    assert!(conn.open(MOCK_URL).is_ok());
    drain_signals(&mut conn);

    // Messages go stale but heartbeats are still within their window.
    std::thread::sleep(Duration::from_millis(60));
    conn.poll();

    assert!(drain_signals(&mut conn).is_empty());
    assert!(conn.is_active());
    assert_eq!(conn.epoch(), 1);
    assert_eq!(handle.lock().unwrap().closes, 0);
}

// -----------------------------------------------------------------------------
// Data plane & idle
// -----------------------------------------------------------------------------

#[test]
fn test_peek_release_counts_rx_messages() {
    let handle = mock_handle();
    let mut conn = new_connection(&handle);
    assert!(conn.open(MOCK_URL).is_ok());

    handle
        .lock()
        .unwrap()
        .frames
        .push_back(b"{\"channel\":\"heartbeat\"}".to_vec());
    conn.poll(); // pumps the frame into the ring

    assert_eq!(conn.rx_messages(), 0);
    {
        let block = conn.peek_message().unwrap();
        assert_eq!(block.payload(), b"{\"channel\":\"heartbeat\"}");
    }
    conn.release_message();
    assert_eq!(conn.rx_messages(), 1);
    assert!(conn.peek_message().is_none());
}

#[test]
fn test_is_idle_tracks_pending_signals() {
    let handle = mock_handle();
    let mut conn = new_connection(&handle);

    assert!(conn.open(MOCK_URL).is_ok());
    assert!(!conn.is_idle()); // Connected signal not yet drained
    drain_signals(&mut conn);
    assert!(conn.is_idle());
}

#[test]
fn test_reopen_after_local_close() {
    let handle = mock_handle();
    let mut conn = new_connection(&handle);

    assert!(conn.open(MOCK_URL).is_ok());
    drain_signals(&mut conn);

    conn.close();
    handle.lock().unwrap().events.push_back(ControlEvent::Close);
    conn.poll();
    drain_signals(&mut conn);
    assert!(!conn.is_active());

    // A fresh open on the same connection starts a new epoch.
    assert!(conn.open(MOCK_URL).is_ok());
    assert_eq!(conn.epoch(), 2);
    assert_eq!(drain_signals(&mut conn), vec![Signal::Connected]);
}

#[test]
fn test_send_after_close_is_rejected() {
    let handle = mock_handle();
    let mut conn = new_connection(&handle);

    assert!(conn.open(MOCK_URL).is_ok());
    conn.close();
    assert!(!conn.send("late"));
    assert_eq!(conn.tx_messages(), 0);
}

#[test]
fn test_close_while_waiting_reconnect_cancels_retry() {
    let handle = mock_handle();
    handle
        .lock()
        .unwrap()
        .connect_results
        .push_back(Err(ErrorKind::ConnectionFailed));
    let mut conn = new_connection(&handle);

    assert!(conn.open(MOCK_URL).is_err());
    // Waiting for the immediate retry; close instead.
    conn.close();
    conn.poll();
    assert!(!conn.is_active());
    assert_eq!(handle.lock().unwrap().connects, 1);
}
