//! Low-latency Rust client for the Kraken WebSocket v2 market-data API.
//!
//! A poll-driven streaming core: one secure websocket connection, typed
//! subscriptions to the trade and book channels, deterministic ordering,
//! correctness under reconnection, and bounded resource use.
//!
//! # What This Crate Provides
//!
//! - A pull-based protocol session: [`Session`]
//! - Connection lifecycle with automatic retry and liveness detection:
//!   [`connection::Connection`]
//! - Intent-based subscription replay across reconnects:
//!   [`replay::ReplayDatabase`]
//! - Strong domain models for trades, books, acknowledgements and
//!   rejections
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use kraken_stream::{Session, TradeSubscribe};
//!
//! fn main() -> Result<(), kraken_stream::ErrorKind> {
//!     let mut session = Session::new()?;
//!
//!     if !session.connect("wss://ws.kraken.com/v2") {
//!         return Ok(());
//!     }
//!     let req_id = session.subscribe(TradeSubscribe::new(vec!["BTC/USD".into()]));
//!     println!("subscribed with req_id {req_id}");
//!
//!     let mut trade = kraken_stream::TradeResponse::default();
//!     loop {
//!         let _epoch = session.poll();
//!         while session.pop_trade_message(&mut trade) {
//!             for t in &trade.trades {
//!                 println!("{} {} {} @ {}", t.symbol, t.side.as_str(), t.qty, t.price);
//!             }
//!         }
//!         session.drain_rejections(|notice| {
//!             eprintln!("rejected: {}", notice.error);
//!         });
//!     }
//! }
//! ```
//!
//! # The Event Loop
//!
//! The application loop is strictly pull-based: [`Session::poll`] advances
//! the connection, runs the parser and processes acknowledgements; the
//! `pop_*` / `drain_*` methods then surface typed messages. The session
//! never calls back into user code and user code never blocks the
//! transport — the receive task and the application thread meet only at
//! bounded rings.
//!
//! Progress is observed through *facts*, not states: the transport epoch
//! (completed successful connections), the rx/tx/heartbeat counters, and
//! edge-triggered [`connection::Signal`]s. An epoch advance means a
//! reconnect happened and the stored subscription intent was replayed.
//!
//! # Reconnection & Replay
//!
//! Every subscribe persists *intent* in a replay database keyed by
//! `(channel, symbol)`. Intent is removed only by server truth: a
//! confirmed unsubscribe or a rejection of the original subscribe. After
//! any reconnect the session clears its per-channel bookkeeping and
//! resubmits each stored intent exactly once, so the subscription set
//! converges back to what the user asked for — silent requests included.
//!
//! # Logging
//!
//! This crate emits diagnostics through the [`log`](https://docs.rs/log/)
//! facade. Configure any compatible logger in your binary and set
//! `RUST_LOG=debug` to inspect connection flow, parsing and replay.
//!
//! # Errors
//!
//! Fallible operations report an [`ErrorKind`] from a single closed set.
//! Transport failures are classified for retry (see
//! [`ErrorKind::is_retryable`]); schema problems are not errors — the
//! parser drops malformed messages with a diagnostic log. Server-side
//! *semantic* errors arrive as [`RejectionNotice`] values through
//! [`Session::pop_rejection`] and must be drained.
//!
//! # Guides
//!
//! The [`guides`] module covers common workflows:
//!
//! - [`guides::event_loop`] — structuring the poll/pop loop
//! - [`guides::subscriptions`] — subscription lifecycle and ACK tracking
//! - [`guides::reconnection`] — epochs, retry policy and intent replay
//! - [`guides::error_handling`] — rejection notices and error kinds

pub mod channel;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod errors;
pub mod guides;
pub mod models;
pub mod parser;
pub mod replay;
pub mod ring;
pub mod session;
pub mod telemetry;
pub mod websocket;

// Re-export primary types for convenience.
pub use config::{
    BackpressureMode, BackpressurePolicy, HardSymbolLimits, NoSymbolLimits, Relaxed, ReqId,
    Strict, SymbolLimitPolicy, ZeroTolerance, INVALID_REQ_ID, PING_REQ_ID, PROTOCOL_BASE_REQ_ID,
};
pub use connection::{Connection, ConnectionConfig, DisconnectReason, Signal};
pub use endpoint::Endpoint;
pub use errors::ErrorKind;
pub use models::{
    BookLevel, BookPayload, BookResponse, BookSubscribe, BookSubscribeAck, BookUnsubscribe,
    BookUnsubscribeAck, Channel, Method, OrderType, PayloadType, Ping, Pong, RejectionNotice,
    Side, StatusUpdate, Symbol, SystemState, Timestamp, Trade, TradeResponse, TradeSubscribe,
    TradeSubscribeAck, TradeUnsubscribe, TradeUnsubscribeAck,
};
pub use session::{Liveness, Session, SessionConfig};
pub use telemetry::{Metric, TelemetrySink};
pub use websocket::{ControlEvent, DataBlock, Transport, WsTransport};
