#![cfg(feature = "integration")]
//! End-to-end tests against an in-process mock websocket server.
//!
//! These exercise the real transport (tokio-tungstenite, receive task,
//! message ring) without hitting the exchange. The session is driven from
//! a plain thread, exactly like production; only the mock server lives on
//! a tokio runtime.
//!
//! Run with: cargo test --features integration --test websocket_tests
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use serial_test::serial;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::sync::Mutex;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as WsMsg;

use kraken_stream::{Session, TradeResponse, TradeSubscribe};

/// Spawn a server that ACKs every subscribe request and then emits one
/// trade update per subscribed symbol. Returns its URL.
async fn spawn_acking_server(received: Arc<Mutex<Vec<String>>>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let received = received.clone();
            tokio::spawn(async move {
                let Ok(ws_stream) = accept_async(stream).await else {
                    return;
                };
                let (mut sender, mut receiver) = ws_stream.split();

                while let Some(Ok(msg)) = receiver.next().await {
                    match msg {
                        WsMsg::Text(text) => {
                            received.lock().await.push(text.to_string());
                            let Ok(req) = serde_json::from_str::<serde_json::Value>(&text) else {
                                continue;
                            };
                            if req.get("method").and_then(|m| m.as_str()) != Some("subscribe") {
                                continue;
                            }
                            let req_id = req.get("req_id").cloned().unwrap_or(json!(null));
                            let symbols: Vec<String> = req["params"]["symbol"]
                                .as_array()
                                .map(|a| {
                                    a.iter()
                                        .filter_map(|s| s.as_str().map(String::from))
                                        .collect()
                                })
                                .unwrap_or_default();
                            for symbol in symbols {
                                let ack = json!({
                                    "method": "subscribe",
                                    "success": true,
                                    "result": {"channel": "trade", "symbol": symbol, "snapshot": true},
                                    "req_id": req_id,
                                });
                                let _ = sender.send(WsMsg::Text(ack.to_string())).await;
                                let trade = json!({
                                    "channel": "trade",
                                    "type": "update",
                                    "data": [{
                                        "symbol": symbol,
                                        "side": "buy",
                                        "price": 100.0,
                                        "qty": 1.0,
                                        "trade_id": 1,
                                        "timestamp": "2025-12-20T07:39:28.809188Z",
                                    }],
                                });
                                let _ = sender.send(WsMsg::Text(trade.to_string())).await;
                            }
                        }
                        WsMsg::Ping(data) => {
                            let _ = sender.send(WsMsg::Pong(data)).await;
                        }
                        WsMsg::Close(_) => break,
                        _ => {}
                    }
                }
            });
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    format!("ws://{addr}")
}

/// Spawn a server that drops the first connection right after the first
/// text message, then behaves like the acking server.
async fn spawn_flaky_server(received: Arc<Mutex<Vec<String>>>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut connection_num = 0usize;
        while let Ok((stream, _)) = listener.accept().await {
            connection_num += 1;
            let is_first = connection_num == 1;
            let received = received.clone();
            tokio::spawn(async move {
                let Ok(ws_stream) = accept_async(stream).await else {
                    return;
                };
                let (mut sender, mut receiver) = ws_stream.split();

                while let Some(Ok(msg)) = receiver.next().await {
                    match msg {
                        WsMsg::Text(text) => {
                            received.lock().await.push(text.to_string());
                            if is_first {
                                // Abrupt drop, no close handshake: the
                                // client must classify this as a peer
                                // drop and retry.
                                drop(sender);
                                return;
                            }
                            let Ok(req) = serde_json::from_str::<serde_json::Value>(&text) else {
                                continue;
                            };
                            if req.get("method").and_then(|m| m.as_str()) == Some("subscribe") {
                                let symbol = req["params"]["symbol"][0]
                                    .as_str()
                                    .unwrap_or("")
                                    .to_string();
                                let ack = json!({
                                    "method": "subscribe",
                                    "success": true,
                                    "result": {"channel": "trade", "symbol": symbol, "snapshot": true},
                                    "req_id": req.get("req_id").cloned().unwrap_or(json!(null)),
                                });
                                let _ = sender.send(WsMsg::Text(ack.to_string())).await;
                            }
                        }
                        WsMsg::Ping(data) => {
                            let _ = sender.send(WsMsg::Pong(data)).await;
                        }
                        WsMsg::Close(_) => break,
                        _ => {}
                    }
                }
            });
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    format!("ws://{addr}")
}

fn poll_until<F: FnMut(&mut Session) -> bool>(
    session: &mut Session,
    timeout: Duration,
    mut done: F,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        session.poll();
        if done(session) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
#[serial]
fn test_subscribe_ack_and_trade_delivery() {
    let server_rt = Runtime::new().unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    let url = server_rt.block_on(spawn_acking_server(received.clone()));

    let mut session = Session::new().unwrap();
    assert!(session.connect(&url));
    assert_eq!(session.transport_epoch(), 1);

    let req_id = session.subscribe(TradeSubscribe::new(vec!["BTC/USD".into()]));

    assert!(
        poll_until(&mut session, Duration::from_secs(5), |s| {
            s.trade_subscriptions().active_symbols() == 1
        }),
        "subscription was not acknowledged"
    );
    assert_eq!(session.trade_subscriptions().pending_requests(), 0);
    assert!(req_id >= kraken_stream::PROTOCOL_BASE_REQ_ID);

    let mut trade = TradeResponse::default();
    assert!(
        poll_until(&mut session, Duration::from_secs(5), |s| {
            s.pop_trade_message(&mut trade)
        }),
        "no trade message delivered"
    );
    assert_eq!(trade.trades[0].symbol.as_str(), "BTC/USD");
    assert!(session.rx_messages() >= 2);

    session.close();
}

#[test]
#[serial]
fn test_server_drop_triggers_reconnect_and_replay() {
    let server_rt = Runtime::new().unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    let url = server_rt.block_on(spawn_flaky_server(received.clone()));

    let mut session = Session::new().unwrap();
    assert!(session.connect(&url));

    session.subscribe(TradeSubscribe::new(vec!["BTC/USD".into()]));

    // The first connection dies after the subscribe; the session retries,
    // replays the stored intent and converges on the second connection.
    assert!(
        poll_until(&mut session, Duration::from_secs(10), |s| {
            s.transport_epoch() >= 2 && s.trade_subscriptions().active_symbols() == 1
        }),
        "session did not reconnect and converge"
    );

    // The server saw the subscribe twice: original plus replay.
    let seen = server_rt.block_on(async {
        received
            .lock()
            .await
            .iter()
            .filter(|m| m.contains("\"method\":\"subscribe\""))
            .count()
    });
    assert!(seen >= 2, "expected original + replayed subscribe, saw {seen}");

    session.close();
}

#[test]
#[serial]
fn test_connect_to_dead_endpoint_fails() {
    // Bind a port and close it again so nothing is listening.
    let server_rt = Runtime::new().unwrap();
    let addr = server_rt.block_on(async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    });

    let mut session = Session::new().unwrap();
    assert!(!session.connect(&format!("ws://{addr}")));
    assert_eq!(session.transport_epoch(), 0);
    session.close();
}
