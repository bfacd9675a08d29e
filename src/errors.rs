/// Error taxonomy for the streaming core.
///
/// A single closed set of error kinds is used across the transport, the
/// connection state machine and the session. Parsing problems are not
/// errors in this sense: malformed messages are dropped with a diagnostic
/// log (see `parser::ParseOutcome`).
use thiserror::Error;

/// The primary error kind used throughout the crate.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// URL is not a valid `ws://` or `wss://` endpoint.
    #[error("invalid websocket url")]
    InvalidUrl,

    /// Operation called in a state that does not allow it.
    #[error("invalid connection state")]
    InvalidState,

    /// TCP connect or DNS resolution failed.
    #[error("connection failed")]
    ConnectionFailed,

    /// HTTP upgrade or TLS negotiation failed.
    #[error("websocket handshake failed")]
    HandshakeFailed,

    /// Connect attempt or liveness window timed out.
    #[error("timed out")]
    Timeout,

    /// Peer dropped the connection without a close frame.
    #[error("connection closed by peer")]
    RemoteClosed,

    /// Consumer is not draining fast enough; a bounded ring overflowed.
    #[error("backpressure")]
    Backpressure,

    /// Unclassified transport failure.
    #[error("transport failure")]
    TransportFailure,

    /// Protocol violation (oversized message, malformed framing).
    #[error("protocol error")]
    ProtocolError,

    /// Operation was cancelled before completion.
    #[error("cancelled")]
    Cancelled,

    /// Receive unblocked by a local `close()`. Expected during shutdown.
    #[error("local shutdown")]
    LocalShutdown,
}

impl ErrorKind {
    /// Returns true if this kind represents a transient, external failure
    /// that reconnection may resolve. Caller misuse, protocol corruption and
    /// intentional shutdowns are never retryable.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::ConnectionFailed
                | ErrorKind::HandshakeFailed
                | ErrorKind::Timeout
                | ErrorKind::Backpressure
                | ErrorKind::RemoteClosed
                // "unknown but bad" -> retry (conservative default)
                | ErrorKind::TransportFailure
        )
    }
}
