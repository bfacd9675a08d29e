//! Shared test harness: a scripted transport plus a session wrapper.
//!
//! The mock transport is composed into a session through the public
//! [`Transport`] seam — no global state, every test owns its script.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde_json::json;

use kraken_stream::connection::ConnectionConfig;
use kraken_stream::telemetry;
use kraken_stream::websocket::{ControlEvent, DataBlock, MessageRing, Transport};
use kraken_stream::{
    BookSubscribe, BookUnsubscribe, Endpoint, ErrorKind, NoSymbolLimits, RejectionNotice, ReqId,
    Session, SymbolLimitPolicy, TradeSubscribe, TradeUnsubscribe,
};

/// Script and observation shared between a test and its transports.
///
/// Transport instances come and go across reconnects; the state lives in
/// the test and is threaded through as the transport config.
#[derive(Default)]
pub struct MockState {
    /// Outcome of the next connect calls; exhausted entries mean Ok.
    pub connect_results: VecDeque<Result<(), ErrorKind>>,
    /// Frames waiting to be pumped into the message ring.
    pub frames: VecDeque<Vec<u8>>,
    /// Control events waiting to be delivered.
    pub events: VecDeque<ControlEvent>,
    /// Everything the session transmitted, in order.
    pub sent: Vec<String>,
    /// When set, send() reports failure.
    pub fail_sends: bool,
    pub connects: usize,
    pub closes: usize,
}

pub type MockHandle = Arc<Mutex<MockState>>;

pub fn mock_handle() -> MockHandle {
    Arc::new(Mutex::new(MockState::default()))
}

/// Scripted transport. Delivers queued frames into the message ring on
/// every event poll, so one `Session::poll` sees everything injected
/// beforehand.
pub struct MockTransport {
    state: MockHandle,
    ring: Arc<MessageRing>,
    connected: bool,
}

impl MockTransport {
    fn pump_frames(&self) {
        let mut state = self.state.lock().unwrap();
        while let Some(frame) = state.frames.front() {
            let Some(slot) = self.ring.try_acquire_producer_slot() else {
                break;
            };
            slot.write(frame);
            self.ring.commit_producer_slot();
            state.frames.pop_front();
        }
    }
}

impl Transport for MockTransport {
    type Config = MockHandle;

    fn create(cfg: &MockHandle, ring: Arc<MessageRing>, _telemetry: telemetry::Telemetry) -> Self {
        Self {
            state: Arc::clone(cfg),
            ring,
            connected: false,
        }
    }

    fn connect(&mut self, _endpoint: &Endpoint) -> Result<(), ErrorKind> {
        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        let result = state.connect_results.pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            self.connected = true;
        }
        result
    }

    fn send(&mut self, text: &str) -> bool {
        if !self.connected {
            return false;
        }
        let mut state = self.state.lock().unwrap();
        if state.fail_sends {
            return false;
        }
        state.sent.push(text.to_string());
        true
    }

    fn close(&mut self) {
        self.connected = false;
        self.state.lock().unwrap().closes += 1;
    }

    fn poll_event(&mut self) -> Option<ControlEvent> {
        self.pump_frames();
        self.state.lock().unwrap().events.pop_front()
    }

    fn peek_message(&self) -> Option<&DataBlock> {
        self.ring.peek_consumer_slot()
    }

    fn release_message(&self) {
        self.ring.release_consumer_slot();
    }
}

pub const MOCK_URL: &str = "wss://mock.exchange.test/v2";

/// Session-plus-script wrapper used by the protocol tests.
pub struct SessionHarness<L: SymbolLimitPolicy = NoSymbolLimits> {
    pub state: MockHandle,
    pub session: Session<MockTransport, L>,
}

impl SessionHarness<NoSymbolLimits> {
    pub fn new() -> Self {
        Self::with_limits()
    }
}

impl<L: SymbolLimitPolicy> SessionHarness<L> {
    pub fn with_limits() -> Self {
        let state = mock_handle();
        let session = Session::<MockTransport, L>::with_transport(
            Arc::clone(&state),
            telemetry::noop(),
            ConnectionConfig::default(),
        );
        Self { state, session }
    }

    pub fn connect(&mut self) {
        assert!(self.session.connect(MOCK_URL));
        // Surface the Connected signal.
        self.drain();
    }

    pub fn drain(&mut self) -> u64 {
        self.session.poll()
    }

    pub fn drain_rejections(&mut self) -> Vec<RejectionNotice> {
        let mut notices = Vec::new();
        self.session.drain_rejections(|n| notices.push(n.clone()));
        notices
    }

    pub fn inject_json(&mut self, value: serde_json::Value) {
        self.state
            .lock()
            .unwrap()
            .frames
            .push_back(value.to_string().into_bytes());
    }

    pub fn inject_raw(&mut self, raw: &[u8]) {
        self.state.lock().unwrap().frames.push_back(raw.to_vec());
    }

    /// Simulate a peer drop; the connection retries immediately and the
    /// epoch advances within the same poll.
    pub fn force_reconnect(&mut self) -> u64 {
        {
            let mut state = self.state.lock().unwrap();
            state
                .events
                .push_back(ControlEvent::Error(ErrorKind::RemoteClosed));
            state.events.push_back(ControlEvent::Close);
        }
        self.drain();
        self.session.transport_epoch()
    }

    pub fn sent_messages(&self) -> Vec<String> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn clear_sent(&mut self) {
        self.state.lock().unwrap().sent.clear();
    }

    // -------------------------------------------------------------------------
    // Requests
    // -------------------------------------------------------------------------

    pub fn subscribe_trade(&mut self, symbol: &str) -> ReqId {
        self.session
            .subscribe(TradeSubscribe::new(vec![symbol.into()]))
    }

    pub fn subscribe_trade_many(&mut self, symbols: &[&str]) -> ReqId {
        self.session.subscribe(TradeSubscribe::new(
            symbols.iter().map(|s| (*s).into()).collect(),
        ))
    }

    pub fn unsubscribe_trade(&mut self, symbol: &str) -> ReqId {
        self.session
            .unsubscribe(TradeUnsubscribe::new(vec![symbol.into()]))
    }

    pub fn subscribe_book(&mut self, symbol: &str, depth: u32) -> ReqId {
        self.session
            .subscribe(BookSubscribe::new(vec![symbol.into()]).with_depth(depth))
    }

    pub fn unsubscribe_book(&mut self, symbol: &str, depth: u32) -> ReqId {
        self.session
            .unsubscribe(BookUnsubscribe::new(vec![symbol.into()]).with_depth(depth))
    }

    // -------------------------------------------------------------------------
    // Server-side responses
    // -------------------------------------------------------------------------

    pub fn confirm_trade_subscription(&mut self, req_id: ReqId, symbol: &str) {
        self.inject_json(json!({
            "method": "subscribe",
            "success": true,
            "result": {"channel": "trade", "symbol": symbol, "snapshot": true},
            "req_id": req_id,
        }));
        self.drain();
    }

    pub fn reject_trade_subscription(&mut self, req_id: ReqId, symbol: &str) {
        self.inject_json(json!({
            "method": "subscribe",
            "success": false,
            "error": "Bad symbol",
            "req_id": req_id,
            "symbol": symbol,
        }));
        self.drain();
    }

    pub fn confirm_trade_unsubscription(&mut self, req_id: ReqId, symbol: &str) {
        self.inject_json(json!({
            "method": "unsubscribe",
            "success": true,
            "result": {"channel": "trade", "symbol": symbol},
            "req_id": req_id,
        }));
        self.drain();
    }

    pub fn reject_trade_unsubscription(&mut self, req_id: ReqId, symbol: &str) {
        self.inject_json(json!({
            "method": "unsubscribe",
            "success": false,
            "error": "Subscription Not Found",
            "req_id": req_id,
            "symbol": symbol,
        }));
        self.drain();
    }

    pub fn confirm_book_subscription(&mut self, req_id: ReqId, symbol: &str, depth: u32) {
        self.inject_json(json!({
            "method": "subscribe",
            "success": true,
            "result": {"channel": "book", "symbol": symbol, "depth": depth, "snapshot": true},
            "req_id": req_id,
        }));
        self.drain();
    }

    pub fn reject_book_subscription(&mut self, req_id: ReqId, symbol: &str) {
        self.inject_json(json!({
            "method": "subscribe",
            "success": false,
            "error": "Bad symbol",
            "req_id": req_id,
            "symbol": symbol,
        }));
        self.drain();
    }

    pub fn confirm_book_unsubscription(&mut self, req_id: ReqId, symbol: &str, depth: u32) {
        self.inject_json(json!({
            "method": "unsubscribe",
            "success": true,
            "result": {"channel": "book", "symbol": symbol, "depth": depth},
            "req_id": req_id,
        }));
        self.drain();
    }
}
