/// Telemetry boundary.
///
/// The core only *emits* counter increments; storage, aggregation and
/// export live outside the crate. Implement [`TelemetrySink`] to wire the
/// counters into whatever metrics backend the application uses.
use std::sync::Arc;

/// Counters emitted by the transport and the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    // Caller intent
    OpenCalls,
    CloseCalls,
    SendCalls,
    SendRejected,
    // Connection facts
    ConnectSuccess,
    ConnectFailure,
    DisconnectEvents,
    RetryCyclesStarted,
    RetryAttempts,
    RetrySuccess,
    RetryFailure,
    LivenessTimeouts,
    MessagesForwarded,
    // Transport facts
    BytesRx,
    BytesTx,
    MessagesRx,
    MessagesTx,
    ReceiveErrors,
    CloseEvents,
    BackpressureEvents,
}

/// Thin counter sink. Implementations must be cheap and non-blocking; the
/// transport calls this from its receive task.
pub trait TelemetrySink: Send + Sync {
    fn increment(&self, metric: Metric, value: u64);
}

/// Discards all increments. The default sink.
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn increment(&self, _metric: Metric, _value: u64) {}
}

/// Shared handle to a telemetry sink.
pub type Telemetry = Arc<dyn TelemetrySink>;

/// Convenience constructor for the default sink.
pub fn noop() -> Telemetry {
    Arc::new(NoopTelemetry)
}
