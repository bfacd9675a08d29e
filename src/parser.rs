/// Message parsing and routing.
///
/// Three layered roles, each deliberately narrow:
///
/// - **Helpers** enforce JSON structural correctness (object, array, type)
///   and extract primitives. They never perform domain validation and never
///   log.
/// - **Adapters** convert validated primitives into domain types (symbol,
///   side, timestamps) and enforce semantic validity: non-empty strings,
///   known enum values. Unknown enum values are always rejected.
/// - **Message parsers + router** orchestrate field sequences, emit
///   diagnostics, and push typed records into the session context.
///
/// JSON tokenization itself is delegated to `serde_json`; the core owns
/// only the schema layer above it. Malformed or unknown messages are
/// dropped with a diagnostic log — the core is tolerant of unknown fields
/// and forward-compatible shapes.
use std::sync::Arc;

use serde_json::Value;

use crate::config::{
    BOOK_UPDATE_RING, REJECTION_RING, SUBSCRIBE_ACK_RING, TRADE_UPDATE_RING,
    UNSUBSCRIBE_ACK_RING,
};
use crate::connection::LivenessClock;
use crate::models::{
    BookLevel, BookPayload, BookResponse, BookSubscribeAck, BookUnsubscribeAck, Channel, Method,
    OrderType, PayloadType, Pong, RejectionNotice, StatusUpdate, Symbol, SystemState, Timestamp,
    Trade, TradeResponse, TradeSubscribeAck, TradeUnsubscribeAck,
};
use crate::ring::{LastValue, LocalRing};

/// Result tag shared by every parsing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// Structurally and semantically valid.
    Parsed,
    /// Malformed JSON or wrong types.
    InvalidSchema,
    /// Well-formed but semantically invalid (unknown enum, empty symbol).
    InvalidValue,
    /// Recognized but deliberately not handled.
    Ignored,
    /// Parsed and pushed into the matching output pipeline.
    Delivered,
    /// Parsed but the output ring was full.
    Backpressure,
}

// -----------------------------------------------------------------------------
// Helpers: low-level JSON primitives
// -----------------------------------------------------------------------------

mod helper {
    use super::{ParseOutcome, Value};

    pub fn require_object(v: &Value) -> Result<(), ParseOutcome> {
        if v.is_object() {
            Ok(())
        } else {
            Err(ParseOutcome::InvalidSchema)
        }
    }

    pub fn string_required<'a>(v: &'a Value, key: &str) -> Result<&'a str, ParseOutcome> {
        v.get(key)
            .and_then(Value::as_str)
            .ok_or(ParseOutcome::InvalidSchema)
    }

    pub fn string_optional<'a>(v: &'a Value, key: &str) -> Result<Option<&'a str>, ParseOutcome> {
        match v.get(key) {
            None => Ok(None),
            Some(field) => field
                .as_str()
                .map(Some)
                .ok_or(ParseOutcome::InvalidSchema),
        }
    }

    pub fn bool_required(v: &Value, key: &str) -> Result<bool, ParseOutcome> {
        v.get(key)
            .and_then(Value::as_bool)
            .ok_or(ParseOutcome::InvalidSchema)
    }

    pub fn bool_optional(v: &Value, key: &str) -> Result<Option<bool>, ParseOutcome> {
        match v.get(key) {
            None => Ok(None),
            Some(field) => field
                .as_bool()
                .map(Some)
                .ok_or(ParseOutcome::InvalidSchema),
        }
    }

    pub fn u64_required(v: &Value, key: &str) -> Result<u64, ParseOutcome> {
        v.get(key)
            .and_then(Value::as_u64)
            .ok_or(ParseOutcome::InvalidSchema)
    }

    pub fn u64_optional(v: &Value, key: &str) -> Result<Option<u64>, ParseOutcome> {
        match v.get(key) {
            None => Ok(None),
            Some(field) => field.as_u64().map(Some).ok_or(ParseOutcome::InvalidSchema),
        }
    }

    pub fn f64_required(v: &Value, key: &str) -> Result<f64, ParseOutcome> {
        v.get(key)
            .and_then(Value::as_f64)
            .ok_or(ParseOutcome::InvalidSchema)
    }

    pub fn array_required<'a>(v: &'a Value, key: &str) -> Result<&'a Vec<Value>, ParseOutcome> {
        v.get(key)
            .and_then(Value::as_array)
            .ok_or(ParseOutcome::InvalidSchema)
    }

    pub fn object_required<'a>(v: &'a Value, key: &str) -> Result<&'a Value, ParseOutcome> {
        match v.get(key) {
            Some(field) if field.is_object() => Ok(field),
            _ => Err(ParseOutcome::InvalidSchema),
        }
    }

    /// Optional, strict: present-but-wrong-shape is a schema error.
    pub fn string_list_optional(v: &Value, key: &str) -> Result<Vec<String>, ParseOutcome> {
        let Some(field) = v.get(key) else {
            return Ok(Vec::new());
        };
        let arr = field.as_array().ok_or(ParseOutcome::InvalidSchema)?;
        let mut out = Vec::with_capacity(arr.len());
        for item in arr {
            let s = item.as_str().ok_or(ParseOutcome::InvalidSchema)?;
            out.push(s.to_string());
        }
        Ok(out)
    }
}

// -----------------------------------------------------------------------------
// Adapters: domain-aware field parsing
// -----------------------------------------------------------------------------

mod adapter {
    use super::*;

    pub fn method(root: &Value) -> Result<Method, ParseOutcome> {
        let s = helper::string_required(root, "method")?;
        Method::from_wire(s).ok_or(ParseOutcome::InvalidValue)
    }

    pub fn channel(root: &Value) -> Result<Channel, ParseOutcome> {
        let s = helper::string_required(root, "channel")?;
        Channel::from_wire(s).ok_or(ParseOutcome::InvalidValue)
    }

    pub fn symbol_required(obj: &Value, key: &str) -> Result<Symbol, ParseOutcome> {
        let s = helper::string_required(obj, key)?;
        if s.is_empty() {
            return Err(ParseOutcome::InvalidValue);
        }
        Ok(Symbol::new(s))
    }

    pub fn symbol_optional(obj: &Value, key: &str) -> Result<Option<Symbol>, ParseOutcome> {
        match helper::string_optional(obj, key)? {
            None => Ok(None),
            // Present but empty is an invalid value.
            Some("") => Err(ParseOutcome::InvalidValue),
            Some(s) => Ok(Some(Symbol::new(s))),
        }
    }

    pub fn side_required(obj: &Value, key: &str) -> Result<crate::models::Side, ParseOutcome> {
        let s = helper::string_required(obj, key)?;
        crate::models::Side::from_wire(s).ok_or(ParseOutcome::InvalidValue)
    }

    pub fn order_type_optional(obj: &Value, key: &str) -> Result<Option<OrderType>, ParseOutcome> {
        match helper::string_optional(obj, key)? {
            None => Ok(None),
            Some(s) => OrderType::from_wire(s)
                .map(Some)
                .ok_or(ParseOutcome::InvalidValue),
        }
    }

    pub fn payload_type_required(obj: &Value, key: &str) -> Result<PayloadType, ParseOutcome> {
        let s = helper::string_required(obj, key)?;
        if s.is_empty() {
            return Err(ParseOutcome::InvalidValue);
        }
        PayloadType::from_wire(s).ok_or(ParseOutcome::InvalidValue)
    }

    pub fn system_state_required(obj: &Value, key: &str) -> Result<SystemState, ParseOutcome> {
        let s = helper::string_required(obj, key)?;
        if s.is_empty() {
            return Err(ParseOutcome::InvalidValue);
        }
        SystemState::from_wire(s).ok_or(ParseOutcome::InvalidValue)
    }

    pub fn timestamp_required(obj: &Value, key: &str) -> Result<Timestamp, ParseOutcome> {
        let s = helper::string_required(obj, key)?;
        if s.is_empty() {
            return Err(ParseOutcome::InvalidValue);
        }
        Timestamp::parse_rfc3339(s).ok_or(ParseOutcome::InvalidValue)
    }

    pub fn timestamp_optional(obj: &Value, key: &str) -> Result<Option<Timestamp>, ParseOutcome> {
        match helper::string_optional(obj, key)? {
            None => Ok(None),
            Some(s) => Timestamp::parse_rfc3339(s)
                .map(Some)
                .ok_or(ParseOutcome::InvalidValue),
        }
    }
}

// -----------------------------------------------------------------------------
// Message parsers
// -----------------------------------------------------------------------------

fn parse_pong(root: &Value) -> Result<Pong, ParseOutcome> {
    helper::require_object(root)?;
    Ok(Pong {
        req_id: helper::u64_optional(root, "req_id")?,
        time_in: adapter::timestamp_optional(root, "time_in")?,
        time_out: adapter::timestamp_optional(root, "time_out")?,
    })
}

fn parse_status(root: &Value) -> Result<StatusUpdate, ParseOutcome> {
    helper::require_object(root)?;
    let data = helper::array_required(root, "data")?;
    if data.len() != 1 {
        return Err(ParseOutcome::InvalidSchema);
    }
    let status = &data[0];
    helper::require_object(status)?;
    Ok(StatusUpdate {
        api_version: helper::string_required(status, "api_version")?.to_string(),
        connection_id: helper::u64_required(status, "connection_id")?,
        system: adapter::system_state_required(status, "system")?,
        version: helper::string_required(status, "version")?.to_string(),
    })
}

fn parse_rejection(root: &Value) -> Result<RejectionNotice, ParseOutcome> {
    helper::require_object(root)?;
    Ok(RejectionNotice {
        req_id: helper::u64_optional(root, "req_id")?,
        symbol: adapter::symbol_optional(root, "symbol")?,
        error: helper::string_required(root, "error")?.to_string(),
        time_in: adapter::timestamp_optional(root, "time_in")?,
        time_out: adapter::timestamp_optional(root, "time_out")?,
    })
}

/// Fields common to all four acknowledgement shapes.
#[derive(Default)]
struct AckCommon {
    success: bool,
    symbol: Symbol,
    error: Option<String>,
    req_id: Option<u64>,
    time_in: Option<Timestamp>,
    time_out: Option<Timestamp>,
    snapshot: Option<bool>,
    warnings: Vec<String>,
    depth: Option<u32>,
}

/// Shared ack skeleton. On success the `result` block is required and must
/// carry the symbol; on failure only `error` is guaranteed and `result`
/// must be absent (the exchange omits it).
fn parse_ack_common(root: &Value, subscribe_extras: bool) -> Result<AckCommon, ParseOutcome> {
    helper::require_object(root)?;
    let mut out = AckCommon {
        success: helper::bool_required(root, "success")?,
        ..AckCommon::default()
    };

    if out.success {
        let result = helper::object_required(root, "result")?;
        out.symbol = adapter::symbol_required(result, "symbol")?;
        out.depth = helper::u64_optional(result, "depth")?.map(|d| d as u32);
        if subscribe_extras {
            out.snapshot = helper::bool_optional(result, "snapshot")?;
            out.warnings = helper::string_list_optional(result, "warnings")?;
        }
        // error must NOT exist alongside a successful result
        if root.get("error").is_some() {
            return Err(ParseOutcome::InvalidSchema);
        }
    } else {
        out.error = Some(helper::string_required(root, "error")?.to_string());
        // result must NOT exist on a failed ack
        if root.get("result").is_some() {
            return Err(ParseOutcome::InvalidSchema);
        }
    }

    out.req_id = helper::u64_optional(root, "req_id")?;
    out.time_in = adapter::timestamp_optional(root, "time_in")?;
    out.time_out = adapter::timestamp_optional(root, "time_out")?;
    Ok(out)
}

fn parse_trade_subscribe_ack(root: &Value) -> Result<TradeSubscribeAck, ParseOutcome> {
    let ack = parse_ack_common(root, true)?;
    Ok(TradeSubscribeAck {
        success: ack.success,
        symbol: ack.symbol,
        snapshot: ack.snapshot,
        warnings: ack.warnings,
        error: ack.error,
        req_id: ack.req_id,
        time_in: ack.time_in,
        time_out: ack.time_out,
    })
}

fn parse_trade_unsubscribe_ack(root: &Value) -> Result<TradeUnsubscribeAck, ParseOutcome> {
    let ack = parse_ack_common(root, false)?;
    Ok(TradeUnsubscribeAck {
        success: ack.success,
        symbol: ack.symbol,
        error: ack.error,
        req_id: ack.req_id,
        time_in: ack.time_in,
        time_out: ack.time_out,
    })
}

fn parse_book_subscribe_ack(root: &Value) -> Result<BookSubscribeAck, ParseOutcome> {
    let ack = parse_ack_common(root, true)?;
    Ok(BookSubscribeAck {
        success: ack.success,
        symbol: ack.symbol,
        depth: ack.depth,
        snapshot: ack.snapshot,
        warnings: ack.warnings,
        error: ack.error,
        req_id: ack.req_id,
        time_in: ack.time_in,
        time_out: ack.time_out,
    })
}

fn parse_book_unsubscribe_ack(root: &Value) -> Result<BookUnsubscribeAck, ParseOutcome> {
    let ack = parse_ack_common(root, false)?;
    Ok(BookUnsubscribeAck {
        success: ack.success,
        symbol: ack.symbol,
        depth: ack.depth,
        error: ack.error,
        req_id: ack.req_id,
        time_in: ack.time_in,
        time_out: ack.time_out,
    })
}

fn parse_trade_response(root: &Value) -> Result<TradeResponse, ParseOutcome> {
    helper::require_object(root)?;
    let kind = adapter::payload_type_required(root, "type")?;
    let data = helper::array_required(root, "data")?;
    let mut trades = Vec::with_capacity(data.len());
    for entry in data {
        helper::require_object(entry)?;
        trades.push(Trade {
            symbol: adapter::symbol_required(entry, "symbol")?,
            side: adapter::side_required(entry, "side")?,
            price: helper::f64_required(entry, "price")?,
            qty: helper::f64_required(entry, "qty")?,
            ord_type: adapter::order_type_optional(entry, "ord_type")?,
            trade_id: helper::u64_required(entry, "trade_id")?,
            timestamp: adapter::timestamp_required(entry, "timestamp")?,
        });
    }
    Ok(TradeResponse { kind, trades })
}

fn parse_book_levels(book: &Value, key: &str) -> Result<(Vec<BookLevel>, bool), ParseOutcome> {
    let Some(levels) = book.get(key) else {
        return Ok((Vec::new(), false)); // optional side
    };
    let arr = levels.as_array().ok_or(ParseOutcome::InvalidSchema)?;
    let mut out = Vec::with_capacity(arr.len());
    for level in arr {
        helper::require_object(level)?;
        out.push(BookLevel {
            price: helper::f64_required(level, "price")?,
            qty: helper::f64_required(level, "qty")?,
        });
    }
    Ok((out, true))
}

fn parse_book_response(root: &Value) -> Result<BookResponse, ParseOutcome> {
    helper::require_object(root)?;
    let kind = adapter::payload_type_required(root, "type")?;

    // data array carries exactly one element per book message
    let data = helper::array_required(root, "data")?;
    if data.len() != 1 {
        return Err(ParseOutcome::InvalidSchema);
    }
    let payload = &data[0];
    helper::require_object(payload)?;

    let symbol = adapter::symbol_required(payload, "symbol")?;
    let (asks, has_asks) = parse_book_levels(payload, "asks")?;
    let (bids, has_bids) = parse_book_levels(payload, "bids")?;
    // Exchange invariant: at least one side present.
    if !has_asks && !has_bids {
        return Err(ParseOutcome::InvalidSchema);
    }
    let checksum = helper::u64_required(payload, "checksum")? as u32;
    let timestamp = adapter::timestamp_optional(payload, "timestamp")?;

    Ok(BookResponse {
        kind,
        book: BookPayload {
            symbol,
            asks,
            bids,
            checksum,
            timestamp,
        },
    })
}

// -----------------------------------------------------------------------------
// Context: output pipelines the router writes into
// -----------------------------------------------------------------------------

/// Shared state and output pipelines used by the router. The session owns
/// the rings and drains them after `poll()`.
pub struct Context {
    /// Heartbeat facts shared with the connection's liveness logic.
    pub liveness: Arc<LivenessClock>,

    /// Last-value slots: freshness over history.
    pub pong_slot: LastValue<Pong>,
    pub status_slot: LastValue<StatusUpdate>,

    /// Control-plane rings.
    pub rejection_ring: LocalRing<RejectionNotice, REJECTION_RING>,
    pub trade_subscribe_ring: LocalRing<TradeSubscribeAck, SUBSCRIBE_ACK_RING>,
    pub trade_unsubscribe_ring: LocalRing<TradeUnsubscribeAck, UNSUBSCRIBE_ACK_RING>,
    pub book_subscribe_ring: LocalRing<BookSubscribeAck, SUBSCRIBE_ACK_RING>,
    pub book_unsubscribe_ring: LocalRing<BookUnsubscribeAck, UNSUBSCRIBE_ACK_RING>,

    /// Data-plane rings.
    pub trade_ring: LocalRing<TradeResponse, TRADE_UPDATE_RING>,
    pub book_ring: LocalRing<BookResponse, BOOK_UPDATE_RING>,
}

impl Context {
    pub fn new(liveness: Arc<LivenessClock>) -> Self {
        Self {
            liveness,
            pong_slot: LastValue::new(),
            status_slot: LastValue::new(),
            rejection_ring: LocalRing::new(),
            trade_subscribe_ring: LocalRing::new(),
            trade_unsubscribe_ring: LocalRing::new(),
            book_subscribe_ring: LocalRing::new(),
            book_unsubscribe_ring: LocalRing::new(),
            trade_ring: LocalRing::new(),
            book_ring: LocalRing::new(),
        }
    }

    /// True when no queued message remains in any ring. Last-value slots
    /// are state, not queues, and do not participate.
    pub fn is_empty(&self) -> bool {
        self.rejection_ring.is_empty()
            && self.trade_subscribe_ring.is_empty()
            && self.trade_unsubscribe_ring.is_empty()
            && self.book_subscribe_ring.is_empty()
            && self.book_unsubscribe_ring.is_empty()
            && self.trade_ring.is_empty()
            && self.book_ring.is_empty()
    }
}

// -----------------------------------------------------------------------------
// Router
// -----------------------------------------------------------------------------

/// Dispatches raw messages by `method` (control plane) first, then by
/// `channel` (data plane). Performs no field-level parsing itself.
pub struct Router;

impl Router {
    pub fn new() -> Self {
        Self
    }

    /// Main entry point: one raw websocket message in, typed records out.
    pub fn parse_and_route(&self, raw: &[u8], ctx: &mut Context) -> ParseOutcome {
        let root: Value = match serde_json::from_slice(raw) {
            Ok(v) => v,
            Err(e) => {
                log::warn!(
                    "json parse error: {e} in message: {}",
                    String::from_utf8_lossy(raw)
                );
                return ParseOutcome::InvalidSchema;
            }
        };

        // METHOD DISPATCH (ack / control)
        if let Ok(method) = adapter::method(&root) {
            return self.route_method(method, &root, ctx);
        }
        // CHANNEL DISPATCH (data)
        if let Ok(channel) = adapter::channel(&root) {
            return self.route_channel(channel, &root, ctx);
        }
        ParseOutcome::Ignored
    }

    fn route_method(&self, method: Method, root: &Value, ctx: &mut Context) -> ParseOutcome {
        // Control-scoped messages carry neither `result` nor `channel`.
        // The exchange omits `result` on pong messages; treat this as an
        // intentional exemption.
        if method == Method::Pong {
            return match parse_pong(root) {
                Ok(pong) => {
                    // Intentional overwrite: freshness over history.
                    ctx.pong_slot.store(pong);
                    ParseOutcome::Delivered
                }
                Err(outcome) => outcome,
            };
        }

        // Channel-scoped messages require `result.channel` — except that
        // the exchange omits the whole `result` block on failed
        // subscribe/unsubscribe responses. Resolve what we can and let the
        // rejection parser pick up the rest.
        let channel = match helper::object_required(root, "result") {
            Err(_) => None,
            Ok(result) => match adapter::channel(result) {
                Ok(c) => Some(c),
                Err(_) => {
                    log::warn!("field 'channel' missing or invalid in '{}' message", method.as_str());
                    None
                }
            },
        };

        match method {
            Method::Subscribe => self.route_subscribe_ack(channel, root, ctx),
            Method::Unsubscribe => self.route_unsubscribe_ack(channel, root, ctx),
            Method::Pong => unreachable!("handled above"),
        }
    }

    fn route_subscribe_ack(
        &self,
        channel: Option<Channel>,
        root: &Value,
        ctx: &mut Context,
    ) -> ParseOutcome {
        match channel {
            Some(Channel::Trade) => match parse_trade_subscribe_ack(root) {
                Ok(ack) => {
                    if ctx.trade_subscribe_ring.push(ack).is_err() {
                        log::warn!("trade subscribe ring full - message not delivered");
                        return ParseOutcome::Backpressure;
                    }
                    ParseOutcome::Delivered
                }
                Err(outcome) => {
                    log::warn!("failed to parse trade subscribe ack");
                    outcome
                }
            },
            Some(Channel::Book) => match parse_book_subscribe_ack(root) {
                Ok(ack) => {
                    if ctx.book_subscribe_ring.push(ack).is_err() {
                        log::warn!("book subscribe ring full - message not delivered");
                        return ParseOutcome::Backpressure;
                    }
                    ParseOutcome::Delivered
                }
                Err(outcome) => {
                    log::warn!("failed to parse book subscribe ack");
                    outcome
                }
            },
            // No resolvable channel: protocol-level failure, e.g.
            // {"error":"Already subscribed","method":"subscribe",
            //  "req_id":2,"success":false,"symbol":"BTC/USD",...}
            _ => self.route_rejection(root, ctx),
        }
    }

    fn route_unsubscribe_ack(
        &self,
        channel: Option<Channel>,
        root: &Value,
        ctx: &mut Context,
    ) -> ParseOutcome {
        match channel {
            Some(Channel::Trade) => match parse_trade_unsubscribe_ack(root) {
                Ok(ack) => {
                    if ctx.trade_unsubscribe_ring.push(ack).is_err() {
                        log::warn!("trade unsubscribe ring full - message not delivered");
                        return ParseOutcome::Backpressure;
                    }
                    ParseOutcome::Delivered
                }
                Err(outcome) => {
                    log::warn!("failed to parse trade unsubscribe ack");
                    outcome
                }
            },
            Some(Channel::Book) => match parse_book_unsubscribe_ack(root) {
                Ok(ack) => {
                    if ctx.book_unsubscribe_ring.push(ack).is_err() {
                        log::warn!("book unsubscribe ring full - message not delivered");
                        return ParseOutcome::Backpressure;
                    }
                    ParseOutcome::Delivered
                }
                Err(outcome) => {
                    log::warn!("failed to parse book unsubscribe ack");
                    outcome
                }
            },
            _ => self.route_rejection(root, ctx),
        }
    }

    fn route_rejection(&self, root: &Value, ctx: &mut Context) -> ParseOutcome {
        match parse_rejection(root) {
            Ok(notice) => {
                if ctx.rejection_ring.push(notice).is_err() {
                    log::warn!("rejection ring full - message not delivered");
                    return ParseOutcome::Backpressure;
                }
                ParseOutcome::Delivered
            }
            Err(outcome) => {
                log::warn!("failed to parse rejection notice");
                outcome
            }
        }
    }

    fn route_channel(&self, channel: Channel, root: &Value, ctx: &mut Context) -> ParseOutcome {
        match channel {
            Channel::Trade => match parse_trade_response(root) {
                Ok(response) => {
                    if ctx.trade_ring.push(response).is_err() {
                        return ParseOutcome::Backpressure;
                    }
                    ParseOutcome::Delivered
                }
                Err(outcome) => outcome,
            },
            Channel::Book => match parse_book_response(root) {
                Ok(response) => {
                    if ctx.book_ring.push(response).is_err() {
                        return ParseOutcome::Backpressure;
                    }
                    ParseOutcome::Delivered
                }
                Err(outcome) => outcome,
            },
            Channel::Heartbeat => {
                // Liveness fast path; heartbeats are not propagated.
                ctx.liveness.record_heartbeat();
                ParseOutcome::Delivered
            }
            Channel::Status => match parse_status(root) {
                Ok(update) => {
                    // Intentional overwrite: freshness over history.
                    ctx.status_slot.store(update);
                    ParseOutcome::Delivered
                }
                Err(outcome) => outcome,
            },
            Channel::Ticker => {
                log::warn!("unhandled channel 'ticker' -> ignore");
                ParseOutcome::Ignored
            }
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
