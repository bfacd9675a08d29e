/// Domain models for the Kraken WebSocket v2 API.
///
/// Strongly typed records for every server message the core handles, the
/// request types the session sends, and the small domain primitives
/// (symbol, timestamp, protocol enums) the parser adapters produce.
///
/// Records mirror the wire schema; prices and quantities are `f64` because
/// the exchange encodes them as plain JSON numbers.
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::ReqId;

// -----------------------------------------------------------------------------
// Symbol
// -----------------------------------------------------------------------------

/// An exchange-defined market identifier like "BTC/USD".
///
/// Opaque to the core; compared by value equality.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<str> for Symbol {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Symbol {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// -----------------------------------------------------------------------------
// Timestamp
// -----------------------------------------------------------------------------

/// Server timestamp, nanoseconds since the Unix epoch.
///
/// The exchange sends RFC3339 strings; they are parsed once at the adapter
/// layer and carried as a fixed-width integer afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timestamp(i64);

impl Timestamp {
    pub fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    pub fn as_nanos(&self) -> i64 {
        self.0
    }

    /// Parse an RFC3339 string like "2025-12-20T07:39:28.809188Z".
    pub fn parse_rfc3339(s: &str) -> Option<Self> {
        let dt = chrono::DateTime::parse_from_rfc3339(s).ok()?;
        dt.timestamp_nanos_opt().map(Self)
    }

    /// Render back to RFC3339 for diagnostics.
    pub fn to_rfc3339(&self) -> String {
        chrono::DateTime::from_timestamp_nanos(self.0).to_rfc3339()
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_rfc3339())
    }
}

// -----------------------------------------------------------------------------
// Protocol enums
//
// Decoding lives in the parser adapters; unknown wire values are rejected
// there, so the enums themselves carry no Unknown variant.
// -----------------------------------------------------------------------------

/// Top-level `method` field of control-plane messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Subscribe,
    Unsubscribe,
    Pong,
}

impl Method {
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "subscribe" => Some(Self::Subscribe),
            "unsubscribe" => Some(Self::Unsubscribe),
            "pong" => Some(Self::Pong),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Pong => "pong",
        }
    }
}

/// Named message streams on the data plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Trade,
    Book,
    Ticker,
    Heartbeat,
    Status,
}

impl Channel {
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "trade" => Some(Self::Trade),
            "book" => Some(Self::Book),
            "ticker" => Some(Self::Ticker),
            "heartbeat" => Some(Self::Heartbeat),
            "status" => Some(Self::Status),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trade => "trade",
            Self::Book => "book",
            Self::Ticker => "ticker",
            Self::Heartbeat => "heartbeat",
            Self::Status => "status",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trade aggressor side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Side {
    #[default]
    Buy,
    Sell,
}

impl Side {
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(Self::Buy),
            "sell" => Some(Self::Sell),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

/// Order type attached to a trade record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderType {
    #[default]
    Market,
    Limit,
}

impl OrderType {
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "market" => Some(Self::Market),
            "limit" => Some(Self::Limit),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Market => "market",
            Self::Limit => "limit",
        }
    }
}

/// Snapshot vs incremental payloads on data-plane channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadType {
    #[default]
    Snapshot,
    Update,
}

impl PayloadType {
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "snapshot" => Some(Self::Snapshot),
            "update" => Some(Self::Update),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Snapshot => "snapshot",
            Self::Update => "update",
        }
    }
}

/// Exchange system state from the status channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SystemState {
    #[default]
    Online,
    Maintenance,
    CancelOnly,
    PostOnly,
}

impl SystemState {
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "online" => Some(Self::Online),
            "maintenance" => Some(Self::Maintenance),
            "cancel_only" => Some(Self::CancelOnly),
            "post_only" => Some(Self::PostOnly),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Maintenance => "maintenance",
            Self::CancelOnly => "cancel_only",
            Self::PostOnly => "post_only",
        }
    }
}

// -----------------------------------------------------------------------------
// Server messages
// -----------------------------------------------------------------------------

/// Reply to a session-issued ping. Last-value semantics; no `result` block
/// on the wire (a deliberate exchange exemption the parser tolerates).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Pong {
    pub req_id: Option<ReqId>,
    pub time_in: Option<Timestamp>,
    pub time_out: Option<Timestamp>,
}

/// Exchange status broadcast. Last-value semantics.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StatusUpdate {
    pub api_version: String,
    pub connection_id: u64,
    pub system: SystemState,
    pub version: String,
}

/// Semantic error from the server: a subscribe/unsubscribe the exchange
/// refused. Lossless — routed both through internal reconciliation and the
/// user-visible rejection buffer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RejectionNotice {
    pub req_id: Option<ReqId>,
    pub symbol: Option<Symbol>,
    pub error: String,
    pub time_in: Option<Timestamp>,
    pub time_out: Option<Timestamp>,
}

/// A single executed trade.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Trade {
    pub symbol: Symbol,
    pub side: Side,
    pub price: f64,
    pub qty: f64,
    pub ord_type: Option<OrderType>,
    pub trade_id: u64,
    pub timestamp: Timestamp,
}

/// A trade channel message: one or more trades, snapshot or update.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TradeResponse {
    pub kind: PayloadType,
    pub trades: Vec<Trade>,
}

impl TradeResponse {
    pub fn is_snapshot(&self) -> bool {
        self.kind == PayloadType::Snapshot
    }
}

/// One price level of an order book side.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BookLevel {
    pub price: f64,
    pub qty: f64,
}

/// Order book payload for exactly one symbol. At least one of `asks` /
/// `bids` is present on the wire.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BookPayload {
    pub symbol: Symbol,
    pub asks: Vec<BookLevel>,
    pub bids: Vec<BookLevel>,
    pub checksum: u32,
    pub timestamp: Option<Timestamp>,
}

/// A book channel message.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BookResponse {
    pub kind: PayloadType,
    pub book: BookPayload,
}

impl BookResponse {
    pub fn is_snapshot(&self) -> bool {
        self.kind == PayloadType::Snapshot
    }
}

/// Acknowledgement of a trade subscribe request, one per symbol.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TradeSubscribeAck {
    pub success: bool,
    pub symbol: Symbol,
    pub snapshot: Option<bool>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
    pub req_id: Option<ReqId>,
    pub time_in: Option<Timestamp>,
    pub time_out: Option<Timestamp>,
}

/// Acknowledgement of a trade unsubscribe request, one per symbol.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TradeUnsubscribeAck {
    pub success: bool,
    pub symbol: Symbol,
    pub error: Option<String>,
    pub req_id: Option<ReqId>,
    pub time_in: Option<Timestamp>,
    pub time_out: Option<Timestamp>,
}

/// Acknowledgement of a book subscribe request, one per symbol.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BookSubscribeAck {
    pub success: bool,
    pub symbol: Symbol,
    pub depth: Option<u32>,
    pub snapshot: Option<bool>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
    pub req_id: Option<ReqId>,
    pub time_in: Option<Timestamp>,
    pub time_out: Option<Timestamp>,
}

/// Acknowledgement of a book unsubscribe request, one per symbol.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BookUnsubscribeAck {
    pub success: bool,
    pub symbol: Symbol,
    pub depth: Option<u32>,
    pub error: Option<String>,
    pub req_id: Option<ReqId>,
    pub time_in: Option<Timestamp>,
    pub time_out: Option<Timestamp>,
}

// -----------------------------------------------------------------------------
// Requests
//
// Each request type carries exactly one intent (subscribe, unsubscribe or
// control), expressed as a sealed trait. The session assigns a request id
// when the caller left it empty.
// -----------------------------------------------------------------------------

mod sealed {
    pub trait Sealed {}
}

/// A message the session can transmit.
pub trait Request: sealed::Sealed {
    fn req_id(&self) -> Option<ReqId>;
    fn set_req_id(&mut self, id: ReqId);
    /// Wire representation, ready to send.
    fn to_json(&self) -> String;
}

/// A request that asks the exchange to start a stream.
pub trait Subscription: Request {
    const CHANNEL: Channel;
    fn symbols(&self) -> &[Symbol];
    fn into_symbols(self) -> Vec<Symbol>;
}

/// A request that asks the exchange to stop a stream.
pub trait Unsubscription: Request {
    const CHANNEL: Channel;
    fn symbols(&self) -> &[Symbol];
    fn into_symbols(self) -> Vec<Symbol>;
}

/// A control frame (ping). Never tracked by the channel managers.
pub trait Control: Request {}

/// Subscribe to the trade channel for a set of symbols.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TradeSubscribe {
    pub symbols: Vec<Symbol>,
    pub snapshot: Option<bool>,
    pub req_id: Option<ReqId>,
}

impl TradeSubscribe {
    pub fn new(symbols: Vec<Symbol>) -> Self {
        Self {
            symbols,
            snapshot: None,
            req_id: None,
        }
    }
}

impl sealed::Sealed for TradeSubscribe {}

impl Request for TradeSubscribe {
    fn req_id(&self) -> Option<ReqId> {
        self.req_id
    }

    fn set_req_id(&mut self, id: ReqId) {
        self.req_id = Some(id);
    }

    fn to_json(&self) -> String {
        let mut params = json!({
            "channel": Channel::Trade.as_str(),
            "symbol": self.symbols,
        });
        if let Some(snapshot) = self.snapshot {
            params["snapshot"] = json!(snapshot);
        }
        let mut root = json!({
            "method": Method::Subscribe.as_str(),
            "params": params,
        });
        if let Some(id) = self.req_id {
            root["req_id"] = json!(id);
        }
        root.to_string()
    }
}

impl Subscription for TradeSubscribe {
    const CHANNEL: Channel = Channel::Trade;

    fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    fn into_symbols(self) -> Vec<Symbol> {
        self.symbols
    }
}

/// Unsubscribe from the trade channel for a set of symbols.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TradeUnsubscribe {
    pub symbols: Vec<Symbol>,
    pub req_id: Option<ReqId>,
}

impl TradeUnsubscribe {
    pub fn new(symbols: Vec<Symbol>) -> Self {
        Self {
            symbols,
            req_id: None,
        }
    }
}

impl sealed::Sealed for TradeUnsubscribe {}

impl Request for TradeUnsubscribe {
    fn req_id(&self) -> Option<ReqId> {
        self.req_id
    }

    fn set_req_id(&mut self, id: ReqId) {
        self.req_id = Some(id);
    }

    fn to_json(&self) -> String {
        let mut root = json!({
            "method": Method::Unsubscribe.as_str(),
            "params": {
                "channel": Channel::Trade.as_str(),
                "symbol": self.symbols,
            },
        });
        if let Some(id) = self.req_id {
            root["req_id"] = json!(id);
        }
        root.to_string()
    }
}

impl Unsubscription for TradeUnsubscribe {
    const CHANNEL: Channel = Channel::Trade;

    fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    fn into_symbols(self) -> Vec<Symbol> {
        self.symbols
    }
}

/// Subscribe to the book channel for a set of symbols.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BookSubscribe {
    pub symbols: Vec<Symbol>,
    pub depth: Option<u32>,
    pub snapshot: Option<bool>,
    pub req_id: Option<ReqId>,
}

impl BookSubscribe {
    pub fn new(symbols: Vec<Symbol>) -> Self {
        Self {
            symbols,
            depth: None,
            snapshot: None,
            req_id: None,
        }
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = Some(depth);
        self
    }
}

impl sealed::Sealed for BookSubscribe {}

impl Request for BookSubscribe {
    fn req_id(&self) -> Option<ReqId> {
        self.req_id
    }

    fn set_req_id(&mut self, id: ReqId) {
        self.req_id = Some(id);
    }

    fn to_json(&self) -> String {
        let mut params = json!({
            "channel": Channel::Book.as_str(),
            "symbol": self.symbols,
        });
        if let Some(depth) = self.depth {
            params["depth"] = json!(depth);
        }
        if let Some(snapshot) = self.snapshot {
            params["snapshot"] = json!(snapshot);
        }
        let mut root = json!({
            "method": Method::Subscribe.as_str(),
            "params": params,
        });
        if let Some(id) = self.req_id {
            root["req_id"] = json!(id);
        }
        root.to_string()
    }
}

impl Subscription for BookSubscribe {
    const CHANNEL: Channel = Channel::Book;

    fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    fn into_symbols(self) -> Vec<Symbol> {
        self.symbols
    }
}

/// Unsubscribe from the book channel for a set of symbols.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BookUnsubscribe {
    pub symbols: Vec<Symbol>,
    pub depth: Option<u32>,
    pub req_id: Option<ReqId>,
}

impl BookUnsubscribe {
    pub fn new(symbols: Vec<Symbol>) -> Self {
        Self {
            symbols,
            depth: None,
            req_id: None,
        }
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = Some(depth);
        self
    }
}

impl sealed::Sealed for BookUnsubscribe {}

impl Request for BookUnsubscribe {
    fn req_id(&self) -> Option<ReqId> {
        self.req_id
    }

    fn set_req_id(&mut self, id: ReqId) {
        self.req_id = Some(id);
    }

    fn to_json(&self) -> String {
        let mut params = json!({
            "channel": Channel::Book.as_str(),
            "symbol": self.symbols,
        });
        if let Some(depth) = self.depth {
            params["depth"] = json!(depth);
        }
        let mut root = json!({
            "method": Method::Unsubscribe.as_str(),
            "params": params,
        });
        if let Some(id) = self.req_id {
            root["req_id"] = json!(id);
        }
        root.to_string()
    }
}

impl Unsubscription for BookUnsubscribe {
    const CHANNEL: Channel = Channel::Book;

    fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    fn into_symbols(self) -> Vec<Symbol> {
        self.symbols
    }
}

/// Application-level ping carrying a reserved request id.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Ping {
    pub req_id: Option<ReqId>,
}

impl sealed::Sealed for Ping {}

impl Request for Ping {
    fn req_id(&self) -> Option<ReqId> {
        self.req_id
    }

    fn set_req_id(&mut self, id: ReqId) {
        self.req_id = Some(id);
    }

    fn to_json(&self) -> String {
        let mut root = json!({ "method": "ping" });
        if let Some(id) = self.req_id {
            root["req_id"] = json!(id);
        }
        root.to_string()
    }
}

impl Control for Ping {}
