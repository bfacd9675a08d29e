/// Compile-time configuration: ring sizes, liveness defaults, the reserved
/// request-id range, and the policy marker types for backpressure and
/// symbol limits.
use std::time::Duration;

// -----------------------------------------------------------------------------
// SPSC ring sizes
//
// Sizes are chosen for expected message frequency and burst behavior:
// small control-plane rings, large data-plane rings. All sizes are
// compile-time constants and must be powers of two.
// -----------------------------------------------------------------------------

/// Raw websocket messages in flight between the receive task and `poll()`.
pub const MESSAGE_RING: usize = 1 << 7; // 128

/// Transport control events (close, error, backpressure).
pub const CONTROL_RING: usize = 1 << 4; // 16

/// Edge-triggered connection signals.
pub const SIGNAL_RING: usize = 1 << 4; // 16

/// Rejection notices (control plane, low frequency, must be drained).
pub const REJECTION_RING: usize = 1 << 5; // 32

/// Subscription acknowledgements (very low frequency).
pub const SUBSCRIBE_ACK_RING: usize = 1 << 5; // 32
pub const UNSUBSCRIBE_ACK_RING: usize = 1 << 5; // 32

/// High-throughput market data.
pub const TRADE_UPDATE_RING: usize = 1 << 10; // 1024
pub const BOOK_UPDATE_RING: usize = 1 << 10; // 1024

/// Capacity of a single message slot in the raw message ring. A message
/// larger than this is a protocol error and shuts the transport down.
pub const RX_BUFFER_SIZE: usize = 16 * 1024;

// -----------------------------------------------------------------------------
// Liveness defaults
// -----------------------------------------------------------------------------

/// Default window without heartbeats before liveness is considered stale.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default window without any message before liveness is considered stale.
pub const MESSAGE_TIMEOUT: Duration = Duration::from_secs(15);

/// Warn once this fraction of the liveness window has elapsed.
pub const LIVENESS_WARNING_RATIO: f64 = 0.8;

/// Upper bound on a single websocket connect attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// -----------------------------------------------------------------------------
// Request-id space
//
// A small low range is reserved for control frames; user-visible ids are
// assigned from the protocol base upward.
// -----------------------------------------------------------------------------

/// Request-id type used on the wire.
pub type ReqId = u64;

/// Sentinel returned when a request could not be sent or was refused
/// locally (symbol limit, transmit failure).
pub const INVALID_REQ_ID: ReqId = 0;

/// Reserved id for session-issued ping frames.
pub const PING_REQ_ID: ReqId = 1;

/// First id handed out to user requests.
pub const PROTOCOL_BASE_REQ_ID: ReqId = 10;

// -----------------------------------------------------------------------------
// Backpressure policy (transport receive path)
// -----------------------------------------------------------------------------

/// Behavior of the receive task when the message ring is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureMode {
    /// Emit the backpressure event, then fail the transport immediately.
    ZeroTolerance,
    /// Emit the backpressure event once, yield cooperatively, retry.
    Strict,
    /// Tolerate a bounded number of attempts before signaling; mix yields
    /// with short sleeps. Resets on the next successful acquisition.
    Relaxed,
}

/// Attempts tolerated by [`Relaxed`](BackpressureMode::Relaxed) before the
/// backpressure event is emitted.
pub const BACKPRESSURE_THRESHOLD: u32 = 50;

/// Compile-time selection of a [`BackpressureMode`]. Implemented by
/// zero-sized marker types; no runtime polymorphism.
pub trait BackpressurePolicy: Send + Sync + 'static {
    const MODE: BackpressureMode;
}

/// Fail the transport as soon as the ring is full.
pub struct ZeroTolerance;
impl BackpressurePolicy for ZeroTolerance {
    const MODE: BackpressureMode = BackpressureMode::ZeroTolerance;
}

/// Signal immediately, then spin cooperatively until a slot frees up.
pub struct Strict;
impl BackpressurePolicy for Strict {
    const MODE: BackpressureMode = BackpressureMode::Strict;
}

/// Default: tolerate short bursts before signaling.
pub struct Relaxed;
impl BackpressurePolicy for Relaxed {
    const MODE: BackpressureMode = BackpressureMode::Relaxed;
}

// -----------------------------------------------------------------------------
// Symbol-limit policy (session subscribe path)
//
// Limits are enforced at the session level; the channel managers and the
// replay database remain policy-agnostic.
// -----------------------------------------------------------------------------

/// Compile-time subscription symbol limits. A limit of zero means that
/// dimension is unbounded.
pub trait SymbolLimitPolicy: Send + Sync + 'static {
    const ENABLED: bool;
    const MAX_TRADE: usize;
    const MAX_BOOK: usize;
    const MAX_GLOBAL: usize;
}

/// No limits enforced (default).
pub struct NoSymbolLimits;
impl SymbolLimitPolicy for NoSymbolLimits {
    const ENABLED: bool = false;
    const MAX_TRADE: usize = 0;
    const MAX_BOOK: usize = 0;
    const MAX_GLOBAL: usize = 0;
}

/// Reject subscribe requests that would exceed any of the three limits.
pub struct HardSymbolLimits<const TRADE: usize, const BOOK: usize, const GLOBAL: usize>;
impl<const TRADE: usize, const BOOK: usize, const GLOBAL: usize> SymbolLimitPolicy
    for HardSymbolLimits<TRADE, BOOK, GLOBAL>
{
    const ENABLED: bool = true;
    const MAX_TRADE: usize = TRADE;
    const MAX_BOOK: usize = BOOK;
    const MAX_GLOBAL: usize = GLOBAL;
}
