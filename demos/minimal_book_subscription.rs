//! Minimal order-book subscription: depth-25 book for BTC/EUR.
//!
//! Run with: cargo run --example minimal_book_subscription
use std::time::Duration;

use kraken_stream::{BookResponse, BookSubscribe, Session};

fn main() -> Result<(), kraken_stream::ErrorKind> {
    let mut session = Session::new()?;
    if !session.connect("wss://ws.kraken.com/v2") {
        eprintln!("failed to connect");
        return Ok(());
    }

    session.subscribe(BookSubscribe::new(vec!["BTC/EUR".into()]).with_depth(25));

    let mut book = BookResponse::default();
    let mut messages_received = 0;
    while messages_received < 10 {
        let epoch = session.poll();
        while session.pop_book_message(&mut book) {
            let best_bid = book.book.bids.first();
            let best_ask = book.book.asks.first();
            println!(
                " -> [{}] {} {:?} bid={:?} ask={:?} checksum={}",
                epoch,
                book.book.symbol,
                book.kind,
                best_bid.map(|l| l.price),
                best_ask.map(|l| l.price),
                book.book.checksum,
            );
            messages_received += 1;
        }
        session.drain_rejections(|notice| eprintln!(" !! {}", notice.error));
        std::thread::sleep(Duration::from_millis(10));
    }

    session.close();
    Ok(())
}
