//! Minimal trade subscription: connect, subscribe, poll, print.
//!
//! Run with: cargo run --example minimal_trade_subscription
use std::time::Duration;

use kraken_stream::{Session, TradeResponse, TradeSubscribe, TradeUnsubscribe};

fn main() -> Result<(), kraken_stream::ErrorKind> {
    // Session setup: connect to the Kraken WebSocket API v2.
    let mut session = Session::new()?;
    if !session.connect("wss://ws.kraken.com/v2") {
        eprintln!("failed to connect");
        return Ok(());
    }

    // Subscribe to BTC/EUR trade updates.
    session.subscribe(TradeSubscribe::new(vec!["BTC/EUR".into()]));

    // Main polling loop: stop after ten trade messages.
    let mut trade = TradeResponse::default();
    let mut messages_received = 0;
    while messages_received < 10 {
        session.poll(); // REQUIRED to process incoming messages
        while session.pop_trade_message(&mut trade) {
            for t in &trade.trades {
                println!(" -> {} {} {} @ {}", t.symbol, t.side.as_str(), t.qty, t.price);
            }
            messages_received += 1;
        }
        session.drain_rejections(|notice| eprintln!(" !! {}", notice.error));
        std::thread::sleep(Duration::from_millis(10));
    }

    // Unsubscribe and drain toward quiescence (bounded, ~2 seconds).
    session.unsubscribe(TradeUnsubscribe::new(vec!["BTC/EUR".into()]));
    for _ in 0..200 {
        if session.is_idle() {
            break;
        }
        session.poll();
        session.drain_rejections(|_| {});
        std::thread::sleep(Duration::from_millis(10));
    }

    println!("heartbeats received so far: {}", session.heartbeat_total());
    Ok(())
}
