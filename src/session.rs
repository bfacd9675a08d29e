/// The Kraken protocol session: the public surface of the crate.
///
/// A `Session` composes a [`Connection`], the per-channel subscription
/// managers, the replay database, the parser router and the user-facing
/// message rings. It exposes a *protocol-oriented* API — subscribe,
/// unsubscribe, ping, poll, pop — and intentionally hides the transport
/// mechanics underneath.
///
/// Data-plane model:
/// - Protocol messages are exposed exactly as received.
/// - Messages are delivered through bounded rings.
/// - No callbacks, observers or implicit dispatch: consumers explicitly
///   pull or drain messages after `poll()`.
///
/// Each session is owned by one application thread. `poll()` must be
/// called to advance the session and populate the message rings; calling
/// `pop_*` or `drain_*` without polling will not make progress.
use std::marker::PhantomData;
use std::time::Duration;

use crate::channel::ChannelManager;
use crate::config::{
    BackpressurePolicy, NoSymbolLimits, ReqId, SymbolLimitPolicy, INVALID_REQ_ID,
    PING_REQ_ID, PROTOCOL_BASE_REQ_ID, REJECTION_RING,
};
use crate::connection::{Connection, ConnectionConfig, Signal};
use crate::errors::ErrorKind;
use crate::models::{
    BookResponse, Channel, Ping, Pong, RejectionNotice, Request, StatusUpdate, TradeResponse,
    TradeSubscribeAck, TradeUnsubscribeAck, Unsubscription,
};
use crate::models::{BookSubscribeAck, BookUnsubscribeAck};
use crate::parser::{Context, ParseOutcome, Router};
use crate::replay::{ReplayDatabase, ReplayableSubscription};
use crate::ring::LocalRing;
use crate::telemetry::{self, Telemetry};
use crate::websocket::{Transport, WsTransport};

/// Liveness policy: how the session reacts to `LivenessThreatened`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Liveness {
    /// Observe only (default).
    #[default]
    Passive,
    /// Issue a ping when liveness is threatened.
    Active,
}

/// Session-wide configuration.
pub struct SessionConfig {
    pub connection: ConnectionConfig,
    pub telemetry: Telemetry,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            telemetry: telemetry::noop(),
        }
    }
}

/// The public session type. Generic over the transport (swappable for
/// tests) and the compile-time symbol-limit policy.
pub struct Session<T: Transport = WsTransport, L: SymbolLimitPolicy = NoSymbolLimits> {
    // Field order matters: the connection must drop before the runtime so
    // transport teardown can still block on it.
    connection: Connection<T>,
    router: Router,
    ctx: Context,

    // Sequence for user-visible request ids.
    next_req_id: ReqId,

    liveness_policy: Liveness,

    // User-visible rejection queue, decoupled from internal protocol
    // processing so user behavior cannot affect core correctness.
    user_rejection_buffer: LocalRing<RejectionNotice, REJECTION_RING>,

    trade_manager: ChannelManager,
    book_manager: ChannelManager,
    replay_db: ReplayDatabase,

    runtime: Option<tokio::runtime::Runtime>,
    _limits: PhantomData<L>,
}

impl Session {
    /// Build a session with the production websocket transport, default
    /// policies and default configuration. Spawns the single
    /// receive-runtime worker thread.
    pub fn new() -> Result<Self, ErrorKind> {
        Self::build(SessionConfig::default())
    }

    /// Build a default-policy production session with custom
    /// liveness/telemetry settings.
    pub fn with_config(cfg: SessionConfig) -> Result<Self, ErrorKind> {
        Self::build(cfg)
    }
}

impl<B: BackpressurePolicy, L: SymbolLimitPolicy> Session<WsTransport<B>, L> {
    /// Production constructor for explicit backpressure / symbol-limit
    /// policy combinations.
    pub fn build(cfg: SessionConfig) -> Result<Self, ErrorKind> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("kraken-stream-rx")
            .enable_all()
            .build()
            .map_err(|e| {
                log::error!("failed to build receive runtime: {e}");
                ErrorKind::TransportFailure
            })?;
        let mut session =
            Self::with_transport(runtime.handle().clone(), cfg.telemetry, cfg.connection);
        session.runtime = Some(runtime);
        Ok(session)
    }
}

impl<T: Transport, L: SymbolLimitPolicy> Session<T, L> {
    /// Compose a session around an arbitrary transport. This is the seam
    /// tests use to inject a scripted transport.
    pub fn with_transport(
        transport_cfg: T::Config,
        telemetry: Telemetry,
        connection_cfg: ConnectionConfig,
    ) -> Self {
        let connection = Connection::new(transport_cfg, telemetry, connection_cfg);
        let ctx = Context::new(connection.liveness_clock());
        Self {
            connection,
            router: Router::new(),
            ctx,
            next_req_id: PROTOCOL_BASE_REQ_ID,
            liveness_policy: Liveness::Passive,
            user_rejection_buffer: LocalRing::new(),
            trade_manager: ChannelManager::new(Channel::Trade),
            book_manager: ChannelManager::new(Channel::Book),
            replay_db: ReplayDatabase::new(),
            runtime: None,
            _limits: PhantomData,
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Open the connection. Returns true if the session reached the
    /// connected state.
    pub fn connect(&mut self, url: &str) -> bool {
        self.connection.open(url).is_ok()
    }

    /// Close the connection and cancel pending reconnection.
    pub fn close(&mut self) {
        self.connection.close();
    }

    // -------------------------------------------------------------------------
    // Control plane
    // -------------------------------------------------------------------------

    /// Issue an application-level ping with the reserved control id.
    pub fn ping(&mut self) {
        self.send_raw_request(Ping {
            req_id: Some(PING_REQ_ID),
        });
    }

    /// Subscribe to a channel.
    ///
    /// Assigns a fresh request id when the request carries none, persists
    /// the intent for replay, transmits, then registers the pending
    /// request. Returns [`INVALID_REQ_ID`] when the symbol-limit policy
    /// refuses the request or the transmit fails; nothing is registered in
    /// that case.
    pub fn subscribe<R: ReplayableSubscription>(&mut self, mut req: R) -> ReqId {
        log::info!(
            "subscribing to channel '{}' {:?}",
            R::CHANNEL,
            req.symbols()
        );
        // 1) Hard symbol limit enforcement (compile-time removable).
        if L::ENABLED && !self.symbol_limit_allows(R::CHANNEL, req.symbols().len()) {
            return INVALID_REQ_ID;
        }
        // 2) Assign req_id if missing.
        if req.req_id().is_none() {
            let id = self.next_req_id();
            req.set_req_id(id);
        }
        let req_id = req.req_id().expect("assigned above");
        // 3) Store protocol intent for deterministic replay after
        //    reconnect. Only server truth removes it again.
        req.persist(&mut self.replay_db, req_id);
        // 4) Transmit before handing the symbols to the manager.
        let json = req.to_json();
        log::debug!("sending subscribe message: {json}");
        if !self.connection.send(&json) {
            log::error!("failed to send subscription request req_id={req_id}");
            return INVALID_REQ_ID;
        }
        // 5) Await the per-symbol ACKs.
        self.manager_mut(R::CHANNEL)
            .register_subscription(req.into_symbols(), req_id);
        req_id
    }

    /// Unsubscribe from a channel. Same id-assignment and transmit rules
    /// as [`subscribe`](Self::subscribe); intent is only removed once the
    /// server confirms.
    pub fn unsubscribe<R: Unsubscription>(&mut self, mut req: R) -> ReqId {
        log::info!(
            "unsubscribing from channel '{}' {:?}",
            R::CHANNEL,
            req.symbols()
        );
        // 1) Assign req_id if missing.
        if req.req_id().is_none() {
            let id = self.next_req_id();
            req.set_req_id(id);
        }
        let req_id = req.req_id().expect("assigned above");
        // 2) Transmit before handing the symbols to the manager.
        let json = req.to_json();
        log::debug!("sending unsubscribe message: {json}");
        if !self.connection.send(&json) {
            log::error!("failed to send unsubscription request req_id={req_id}");
            return INVALID_REQ_ID;
        }
        // 3) Await the per-symbol ACKs.
        self.manager_mut(R::CHANNEL)
            .register_unsubscription(req.into_symbols(), req_id);
        req_id
    }

    // -------------------------------------------------------------------------
    // Event loop
    // -------------------------------------------------------------------------

    /// Advance the session and populate the message rings. Returns the
    /// current transport epoch; an advance means a reconnect happened and
    /// replay is in flight.
    ///
    /// Ordering guarantee: control-plane events (signals, ACKs,
    /// rejections) are handled before data-plane messages are surfaced to
    /// the user. Trade and book rings are not drained here — they are
    /// exposed verbatim through `pop_*` / `drain_*`.
    pub fn poll(&mut self) -> u64 {
        // === Connection lifecycle, retry and liveness ===
        self.connection.poll();
        let mut signal = Signal::None;
        while self.connection.poll_signal(&mut signal) {
            self.handle_signal(signal);
        }

        // === Raw messages through the parser ===
        loop {
            let outcome = {
                let Some(block) = self.connection.peek_message() else {
                    break;
                };
                self.router.parse_and_route(block.payload(), &mut self.ctx)
            };
            self.connection.release_message();
            if outcome == ParseOutcome::Backpressure {
                log::warn!("typed ring backpressure - message dropped");
            }
        }

        // === Rejection notices (lossless, semantic errors) ===
        // Processed internally for correctness first, then forwarded to
        // the user buffer. Failing to drain that buffer is a user error;
        // after a bounded overflow the session closes defensively.
        let mut notice = RejectionNotice::default();
        while self.ctx.rejection_ring.pop(&mut notice) {
            self.handle_rejection(&notice);
            if self.user_rejection_buffer.push(notice.clone()).is_err() {
                log::error!(
                    "rejection buffer overflow - protocol correctness compromised \
                     (user not draining rejections); closing"
                );
                self.connection.close();
                break;
            }
        }

        // === Trade acknowledgements ===
        let mut ack = TradeSubscribeAck::default();
        while self.ctx.trade_subscribe_ring.pop(&mut ack) {
            match ack.req_id {
                None => log::warn!("subscription ack missing req_id for channel 'trade' {{{}}}", ack.symbol),
                Some(id) => self
                    .trade_manager
                    .process_subscribe_ack(id, &ack.symbol, ack.success),
            }
        }
        let mut ack = TradeUnsubscribeAck::default();
        while self.ctx.trade_unsubscribe_ring.pop(&mut ack) {
            match ack.req_id {
                None => log::warn!("unsubscription ack missing req_id for channel 'trade' {{{}}}", ack.symbol),
                Some(id) => {
                    self.trade_manager
                        .process_unsubscribe_ack(id, &ack.symbol, ack.success);
                    if ack.success {
                        self.replay_db.remove_symbol(Channel::Trade, &ack.symbol);
                    }
                }
            }
        }

        // === Book acknowledgements ===
        let mut ack = BookSubscribeAck::default();
        while self.ctx.book_subscribe_ring.pop(&mut ack) {
            match ack.req_id {
                None => log::warn!("subscription ack missing req_id for channel 'book' {{{}}}", ack.symbol),
                Some(id) => self
                    .book_manager
                    .process_subscribe_ack(id, &ack.symbol, ack.success),
            }
        }
        let mut ack = BookUnsubscribeAck::default();
        while self.ctx.book_unsubscribe_ring.pop(&mut ack) {
            match ack.req_id {
                None => log::warn!("unsubscription ack missing req_id for channel 'book' {{{}}}", ack.symbol),
                Some(id) => {
                    self.book_manager
                        .process_unsubscribe_ack(id, &ack.symbol, ack.success);
                    if ack.success {
                        self.replay_db.remove_symbol(Channel::Book, &ack.symbol);
                    }
                }
            }
        }

        self.connection.epoch()
    }

    // -------------------------------------------------------------------------
    // Message access
    // -------------------------------------------------------------------------

    /// Pop the oldest trade message. FIFO by ring order.
    pub fn pop_trade_message(&mut self, out: &mut TradeResponse) -> bool {
        self.ctx.trade_ring.pop(out)
    }

    /// Drain all available trade messages through a callback.
    pub fn drain_trade_messages<F: FnMut(&TradeResponse)>(&mut self, mut f: F) {
        let mut msg = TradeResponse::default();
        while self.ctx.trade_ring.pop(&mut msg) {
            f(&msg);
        }
    }

    /// Pop the oldest book message. FIFO by ring order.
    pub fn pop_book_message(&mut self, out: &mut BookResponse) -> bool {
        self.ctx.book_ring.pop(out)
    }

    /// Drain all available book messages through a callback.
    pub fn drain_book_messages<F: FnMut(&BookResponse)>(&mut self, mut f: F) {
        let mut msg = BookResponse::default();
        while self.ctx.book_ring.pop(&mut msg) {
            f(&msg);
        }
    }

    /// Pop the oldest rejection notice. Rejections MUST be drained;
    /// letting them accumulate eventually forces a defensive close.
    pub fn pop_rejection(&mut self, out: &mut RejectionNotice) -> bool {
        self.user_rejection_buffer.pop(out)
    }

    /// Drain all pending rejection notices through a callback.
    pub fn drain_rejections<F: FnMut(&RejectionNotice)>(&mut self, mut f: F) {
        let mut notice = RejectionNotice::default();
        while self.user_rejection_buffer.pop(&mut notice) {
            f(&notice);
        }
    }

    /// Load the most recent pong if it changed since the last load.
    /// Last-value semantics: misses are not errors.
    pub fn try_load_pong(&mut self, out: &mut Pong) -> bool {
        self.ctx.pong_slot.try_load(out)
    }

    /// Load the most recent status update if it changed since the last
    /// load. Last-value semantics: misses are not errors.
    pub fn try_load_status(&mut self, out: &mut StatusUpdate) -> bool {
        self.ctx.status_slot.try_load(out)
    }

    // -------------------------------------------------------------------------
    // Policy & configuration
    // -------------------------------------------------------------------------

    /// Set the liveness policy. `Active` issues a ping whenever the
    /// connection signals `LivenessThreatened`.
    pub fn set_policy(&mut self, policy: Liveness) {
        self.liveness_policy = policy;
    }

    /// Reconfigure the liveness windows.
    pub fn set_liveness_timeout(&mut self, heartbeat: Duration, message: Duration) {
        self.connection.set_liveness_timeout(heartbeat, message);
    }

    // -------------------------------------------------------------------------
    // Observation
    // -------------------------------------------------------------------------

    /// Protocol quiescence: no pending signals, no queued messages, no
    /// undrained rejections, no requests awaiting ACKs.
    ///
    /// This is NOT a data-plane signal — active subscriptions may still
    /// exist and produce future data — and it does not imply the transport
    /// is closed.
    pub fn is_idle(&self) -> bool {
        self.connection.is_idle()
            && self.ctx.is_empty()
            && self.user_rejection_buffer.is_empty()
            && !self.trade_manager.has_pending_requests()
            && !self.book_manager.has_pending_requests()
    }

    /// Current transport epoch: completed successful connections. Used
    /// for staleness checks.
    pub fn transport_epoch(&self) -> u64 {
        self.connection.epoch()
    }

    pub fn rx_messages(&self) -> u64 {
        self.connection.rx_messages()
    }

    pub fn tx_messages(&self) -> u64 {
        self.connection.tx_messages()
    }

    pub fn hb_messages(&self) -> u64 {
        self.connection.hb_messages()
    }

    /// Total heartbeats observed by the parser.
    pub fn heartbeat_total(&self) -> u64 {
        self.connection.hb_messages()
    }

    /// True while the logical connection is live or recovering.
    pub fn is_active(&self) -> bool {
        self.connection.is_active()
    }

    /// Subscribe/unsubscribe requests still awaiting complete ACKs.
    pub fn pending_protocol_requests(&self) -> usize {
        self.trade_manager.pending_requests() + self.book_manager.pending_requests()
    }

    /// Symbols still bound to pending requests, across both channels.
    pub fn pending_protocol_symbols(&self) -> usize {
        self.trade_manager.pending_symbols() + self.book_manager.pending_symbols()
    }

    /// Trade channel bookkeeping (read-only).
    pub fn trade_subscriptions(&self) -> &ChannelManager {
        &self.trade_manager
    }

    /// Book channel bookkeeping (read-only).
    pub fn book_subscriptions(&self) -> &ChannelManager {
        &self.book_manager
    }

    /// The intent store (read-only).
    pub fn replay_database(&self) -> &ReplayDatabase {
        &self.replay_db
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn next_req_id(&mut self) -> ReqId {
        let id = self.next_req_id;
        self.next_req_id += 1;
        id
    }

    fn manager_mut(&mut self, channel: Channel) -> &mut ChannelManager {
        match channel {
            Channel::Trade => &mut self.trade_manager,
            Channel::Book => &mut self.book_manager,
            other => unreachable!("no subscription manager for channel '{other}'"),
        }
    }

    fn symbol_limit_allows(&self, channel: Channel, requested: usize) -> bool {
        let trade_now = self.trade_manager.total_symbols();
        let book_now = self.book_manager.total_symbols();
        let global_now = trade_now + book_now;
        match channel {
            Channel::Trade => {
                if L::MAX_TRADE > 0 && trade_now + requested > L::MAX_TRADE {
                    log::warn!(
                        "trade symbol limit exceeded ({} > {})",
                        trade_now + requested,
                        L::MAX_TRADE
                    );
                    return false;
                }
            }
            Channel::Book => {
                if L::MAX_BOOK > 0 && book_now + requested > L::MAX_BOOK {
                    log::warn!(
                        "book symbol limit exceeded ({} > {})",
                        book_now + requested,
                        L::MAX_BOOK
                    );
                    return false;
                }
            }
            _ => {}
        }
        if L::MAX_GLOBAL > 0 && global_now + requested > L::MAX_GLOBAL {
            log::warn!(
                "global symbol limit exceeded ({} > {})",
                global_now + requested,
                L::MAX_GLOBAL
            );
            return false;
        }
        true
    }

    fn send_raw_request<R: Request>(&mut self, mut req: R) {
        if req.req_id().is_none() {
            let id = self.next_req_id();
            req.set_req_id(id);
        }
        let json = req.to_json();
        if !self.connection.send(&json) {
            log::error!("failed to send raw message: {json}");
        }
    }

    fn handle_signal(&mut self, signal: Signal) {
        match signal {
            Signal::Connected => self.handle_connect(),
            Signal::Disconnected => self.handle_disconnect(),
            Signal::LivenessThreatened => {
                if self.liveness_policy == Liveness::Active {
                    self.ping();
                }
            }
            // No user-defined hooks for retry or backpressure edges.
            Signal::RetryImmediate
            | Signal::RetryScheduled
            | Signal::BackpressureDetected
            | Signal::None => {}
        }
    }

    /// On any entry to `Connected` past the first, resubmit every stored
    /// intent through the normal subscribe path. The resubmissions flow
    /// through the pending-request machinery and converge on server truth.
    fn handle_connect(&mut self) {
        log::trace!("handle connect (epoch {})", self.transport_epoch());
        if self.transport_epoch() <= 1 {
            return;
        }
        let trade_subscriptions = self.replay_db.take_trade_subscriptions();
        if trade_subscriptions.is_empty() {
            log::debug!("no trade subscriptions to replay");
        } else {
            log::debug!("replaying {} trade subscription(s)", trade_subscriptions.len());
            for subscription in trade_subscriptions {
                let _ = self.subscribe(subscription);
            }
        }
        let book_subscriptions = self.replay_db.take_book_subscriptions();
        if book_subscriptions.is_empty() {
            log::debug!("no book subscriptions to replay");
        } else {
            log::debug!("replaying {} book subscription(s)", book_subscriptions.len());
            for subscription in book_subscriptions {
                let _ = self.subscribe(subscription);
            }
        }
    }

    /// The transport is gone: pending requests and active sets no longer
    /// reflect anything real. The replay database survives — it records
    /// intent, not server state.
    fn handle_disconnect(&mut self) {
        log::trace!("handle disconnect (epoch {})", self.transport_epoch());
        self.trade_manager.clear_all();
        self.book_manager.clear_all();
    }

    fn handle_rejection(&mut self, notice: &RejectionNotice) {
        log::trace!(
            "handling rejection notice req_id={:?} symbol={:?}: {}",
            notice.req_id,
            notice.symbol,
            notice.error
        );
        let (Some(req_id), Some(symbol)) = (notice.req_id, notice.symbol.as_ref()) else {
            return;
        };
        // The notice does not identify its channel; try both managers.
        let done = self.trade_manager.try_process_rejection(req_id, symbol);
        if !done {
            self.book_manager.try_process_rejection(req_id, symbol);
        }
        self.replay_db.try_process_rejection(req_id, symbol);
    }
}
