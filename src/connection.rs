/// Transport-level connection abstraction, generic over a [`Transport`].
///
/// A `Connection` represents a *logical* connection whose identity remains
/// stable across transient transport failures and automatic reconnections.
/// It owns the transport lifecycle (connect, disconnect, retry), detects
/// liveness failure deterministically, and exposes only observable
/// consequences: edge-triggered [`Signal`]s plus the progress counters
/// (`epoch`, `rx_messages`, `tx_messages`, `hb_messages`). The internal
/// state machine is never exposed.
///
/// All logic is poll-driven on the application thread; the only other
/// thread involved is the transport receive task.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{
    HEARTBEAT_TIMEOUT, LIVENESS_WARNING_RATIO, MESSAGE_TIMEOUT, SIGNAL_RING,
};
use crate::endpoint::Endpoint;
use crate::errors::ErrorKind;
use crate::ring::LocalRing;
use crate::telemetry::{Metric, Telemetry};
use crate::websocket::{ControlEvent, DataBlock, MessageRing, Transport};

/// Externally observable, edge-triggered connection facts.
///
/// Signals are single-shot per occurrence, best-effort and informational;
/// progress must be inferred from the epoch and the rx/tx counters, which
/// are authoritative. Signals are not replayed across transport lifetimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Signal {
    /// No externally observable signal.
    #[default]
    None,
    /// A websocket connection was established. Increments the epoch.
    Connected,
    /// The logical connection went fully down. Once per transport lifetime.
    Disconnected,
    /// A reconnection attempt will happen on the next poll, without delay.
    RetryImmediate,
    /// Entered an automatic retry cycle with backoff.
    RetryScheduled,
    /// Observable activity is approaching the liveness deadline.
    LivenessThreatened,
    /// The transport reported receive-side backpressure.
    BackpressureDetected,
}

/// Why the connection last left `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisconnectReason {
    #[default]
    None,
    LocalClose,
    LivenessTimeout,
    TransportError,
}

/// Connection lifecycle states. Internal; callers observe signals and
/// progress counters instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    WaitingReconnect,
}

/// FSM event alphabet: caller intents, transport facts, timer and liveness
/// edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    OpenRequested,
    TransportConnected,
    TransportConnectFailed,
    TransportReconnectFailed,
    TransportClosed,
    CloseRequested,
    RetryTimerExpired,
    LivenessOutdated,
    LivenessExpired,
}

/// Heartbeat facts shared between the parser (writer) and the connection
/// (reader). Both run on the application thread, so relaxed ordering is
/// sufficient; the atomics exist so the parser context can hold a shared
/// handle without borrowing the connection.
pub struct LivenessClock {
    origin: Instant,
    heartbeat_total: AtomicU64,
    last_heartbeat_nanos: AtomicU64,
}

impl Default for LivenessClock {
    fn default() -> Self {
        Self::new()
    }
}

impl LivenessClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            heartbeat_total: AtomicU64::new(0),
            last_heartbeat_nanos: AtomicU64::new(0),
        }
    }

    /// Called by the parser for every heartbeat message.
    pub fn record_heartbeat(&self) {
        self.heartbeat_total.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Reset the heartbeat timestamp without counting a message.
    pub fn touch(&self) {
        let nanos = self.origin.elapsed().as_nanos() as u64;
        self.last_heartbeat_nanos.store(nanos, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.heartbeat_total.load(Ordering::Relaxed)
    }

    /// Time since the last recorded heartbeat.
    pub fn last_heartbeat_age(&self) -> Duration {
        let now = self.origin.elapsed();
        let last = Duration::from_nanos(self.last_heartbeat_nanos.load(Ordering::Relaxed));
        now.saturating_sub(last)
    }
}

/// Liveness and retry configuration for a connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub heartbeat_timeout: Duration,
    pub message_timeout: Duration,
    pub liveness_warning_ratio: f64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: HEARTBEAT_TIMEOUT,
            message_timeout: MESSAGE_TIMEOUT,
            liveness_warning_ratio: LIVENESS_WARNING_RATIO,
        }
    }
}

/// The logical connection: lifecycle, retry, liveness, progress.
pub struct Connection<T: Transport> {
    transport_cfg: T::Config,
    telemetry: Telemetry,
    message_ring: Arc<MessageRing>,
    transport: Option<T>,

    last_url: String,
    // Invariant: present whenever the FSM has left Disconnected, so
    // reconnection needs no re-parse.
    endpoint: Option<Endpoint>,

    // Exposed progress facts. Epoch increments only on entry to Connected,
    // never on retries, attempts or disconnections.
    epoch: u64,
    rx_messages: u64,
    tx_messages: u64,

    // Liveness tracking: two independent activity signals.
    liveness: Arc<LivenessClock>,
    last_message_ts: Instant,
    heartbeat_timeout: Duration,
    message_timeout: Duration,
    liveness_warning_ratio: f64,
    liveness_danger_window: Duration,
    liveness_warning_emitted: bool,
    liveness_timeout_emitted: bool,

    // Error tracking for reconnection logic.
    last_error: Option<ErrorKind>,
    retry_root_error: Option<ErrorKind>,
    disconnect_reason: DisconnectReason,

    // State machine. `retry_attempts` is the ordinal of the next attempt.
    state: State,
    next_retry: Option<Instant>,
    retry_attempts: u32,

    signals: LocalRing<Signal, SIGNAL_RING>,
}

impl<T: Transport> Connection<T> {
    pub fn new(transport_cfg: T::Config, telemetry: Telemetry, cfg: ConnectionConfig) -> Self {
        let mut conn = Self {
            transport_cfg,
            telemetry,
            message_ring: Arc::new(MessageRing::new()),
            transport: None,
            last_url: String::new(),
            endpoint: None,
            epoch: 0,
            rx_messages: 0,
            tx_messages: 0,
            liveness: Arc::new(LivenessClock::new()),
            last_message_ts: Instant::now(),
            heartbeat_timeout: cfg.heartbeat_timeout,
            message_timeout: cfg.message_timeout,
            liveness_warning_ratio: cfg.liveness_warning_ratio,
            liveness_danger_window: Duration::ZERO,
            liveness_warning_emitted: false,
            liveness_timeout_emitted: false,
            last_error: None,
            retry_root_error: None,
            disconnect_reason: DisconnectReason::None,
            state: State::Disconnected,
            next_retry: None,
            retry_attempts: 0,
            signals: LocalRing::new(),
        };
        conn.recompute_liveness_windows();
        conn
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Open the logical connection. Precondition: currently disconnected or
    /// waiting to reconnect.
    pub fn open(&mut self, url: &str) -> Result<(), ErrorKind> {
        log::debug!("connecting to {url}");
        self.telemetry.increment(Metric::OpenCalls, 1);

        if self.state != State::Disconnected && self.state != State::WaitingReconnect {
            log::warn!("open() called while not disconnected - ignoring");
            return Err(ErrorKind::InvalidState);
        }
        self.last_url = url.to_string();
        self.endpoint = Some(Endpoint::parse(url)?);

        // All preconditions satisfied: enter the FSM.
        self.transition(Event::OpenRequested, None);
        self.create_transport();
        let endpoint = self.endpoint.clone().expect("endpoint parsed above");
        match self
            .transport
            .as_mut()
            .expect("transport created above")
            .connect(&endpoint)
        {
            Ok(()) => {
                self.telemetry.increment(Metric::ConnectSuccess, 1);
                self.transition(Event::TransportConnected, None);
                log::info!("connected to {}", self.last_url);
                Ok(())
            }
            Err(kind) => {
                log::error!("connection failed ({kind})");
                self.last_error = Some(kind);
                self.transition(Event::TransportConnectFailed, Some(kind));
                Err(kind)
            }
        }
    }

    /// Unconditional shutdown of the logical connection; cancels pending
    /// reconnection. Idempotent.
    pub fn close(&mut self) {
        self.telemetry.increment(Metric::CloseCalls, 1);
        match self.state {
            State::Disconnected | State::Disconnecting => return,
            _ => {}
        }
        self.transition(Event::CloseRequested, None);
        if self.state == State::Disconnected {
            // No transport-close event will arrive; tear down now.
            if let Some(mut t) = self.transport.take() {
                t.close();
            }
        }
    }

    /// Send a text message. Gated on the connected state.
    pub fn send(&mut self, text: &str) -> bool {
        self.telemetry.increment(Metric::SendCalls, 1);
        if self.state != State::Connected {
            log::warn!("send() called while not connected - ignoring");
            self.telemetry.increment(Metric::SendRejected, 1);
            return false;
        }
        let Some(transport) = self.transport.as_mut() else {
            return false;
        };
        if transport.send(text) {
            self.tx_messages += 1;
            true
        } else {
            false
        }
    }

    // -------------------------------------------------------------------------
    // Event loop
    // -------------------------------------------------------------------------

    /// Drive the connection: drain transport events, run the retry timer,
    /// evaluate liveness. Call regularly from the application thread.
    pub fn poll(&mut self) {
        // === Drain transport control events ===
        loop {
            let event = match self.transport.as_mut() {
                Some(t) => t.poll_event(),
                None => None,
            };
            match event {
                Some(ControlEvent::Close) => self.on_transport_closed(),
                Some(ControlEvent::Error(kind)) => self.on_transport_error(kind),
                Some(ControlEvent::Backpressure) => self.emit(Signal::BackpressureDetected),
                None => break,
            }
        }

        // === Reconnection timer ===
        if self.state == State::WaitingReconnect {
            let due = match self.next_retry {
                None => true, // immediate retry armed
                Some(at) => Instant::now() >= at,
            };
            if due {
                let _ = self.reconnect();
            }
        }

        // === Liveness ===
        // Evaluated only while connected; once a timeout forces
        // disconnection, reconnection logic takes over.
        if self.state == State::Connected {
            let remaining = self.liveness_remaining();
            if !self.liveness_warning_emitted {
                if remaining <= self.liveness_danger_window {
                    log::trace!("liveness warning: {}ms remaining", remaining.as_millis());
                    self.liveness_warning_emitted = true;
                    self.transition(Event::LivenessOutdated, None);
                }
            } else if remaining > self.liveness_danger_window {
                // Activity restored liveness above the danger window;
                // re-arm the warning edge.
                self.liveness_warning_emitted = false;
            }

            if !self.liveness_timeout_emitted && self.is_liveness_stale() {
                log::debug!("liveness timeout: no protocol traffic within window, forcing reconnect");
                self.liveness_timeout_emitted = true;
                self.transition(Event::LivenessExpired, Some(ErrorKind::Timeout));
            }
        }
    }

    /// Pull the next pending edge-triggered signal.
    pub fn poll_signal(&mut self, out: &mut Signal) -> bool {
        self.signals.pop(out)
    }

    // -------------------------------------------------------------------------
    // Data plane
    // -------------------------------------------------------------------------

    /// Peek the oldest raw message. Updates the rx counter and the
    /// last-message timestamp.
    pub fn peek_message(&mut self) -> Option<&DataBlock> {
        self.transport.as_ref()?.peek_message()?;
        self.telemetry.increment(Metric::MessagesForwarded, 1);
        self.rx_messages += 1;
        self.last_message_ts = Instant::now();
        self.transport.as_ref().and_then(|t| t.peek_message())
    }

    /// Recycle the slot returned by the last successful peek.
    pub fn release_message(&mut self) {
        if let Some(t) = self.transport.as_ref() {
            t.release_message();
        }
    }

    // -------------------------------------------------------------------------
    // Observation
    // -------------------------------------------------------------------------

    /// Completed transport lifetimes. Strictly increasing; bumped only on
    /// entry to `Connected`.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn rx_messages(&self) -> u64 {
        self.rx_messages
    }

    pub fn tx_messages(&self) -> u64 {
        self.tx_messages
    }

    pub fn hb_messages(&self) -> u64 {
        self.liveness.total()
    }

    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error
    }

    /// Shared heartbeat clock for the parser context.
    pub fn liveness_clock(&self) -> Arc<LivenessClock> {
        Arc::clone(&self.liveness)
    }

    /// True while the logical connection is live or trying to recover.
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            State::Connected | State::Connecting | State::Disconnecting | State::WaitingReconnect
        )
    }

    /// Current quiescence: no pending signals and no retry timer ready to
    /// fire. Does not poll, mutate or perform I/O; new external activity
    /// may arrive immediately after this returns true.
    pub fn is_idle(&self) -> bool {
        if !self.signals.is_empty() {
            return false;
        }
        if self.state == State::WaitingReconnect {
            let due = match self.next_retry {
                None => true,
                Some(at) => Instant::now() >= at,
            };
            if due {
                return false;
            }
        }
        true
    }

    /// Reconfigure the liveness windows.
    pub fn set_liveness_timeout(&mut self, heartbeat: Duration, message: Duration) {
        self.heartbeat_timeout = heartbeat;
        self.message_timeout = message;
        self.recompute_liveness_windows();
    }

    // -------------------------------------------------------------------------
    // State machine
    // -------------------------------------------------------------------------

    fn transition(&mut self, event: Event, error: Option<ErrorKind>) {
        log::trace!("fsm: {:?} --{:?}-->", self.state, event);

        match self.state {
            State::Disconnected => {
                if event == Event::OpenRequested {
                    self.set_state(State::Connecting);
                }
            }

            State::Connecting => match event {
                Event::TransportConnected => {
                    self.set_state(State::Connected);
                    self.emit(Signal::Connected);
                    // Reset retry state.
                    self.retry_attempts = 0;
                    self.retry_root_error = None;
                    // Reset liveness tracking.
                    self.last_message_ts = Instant::now();
                    self.liveness.touch();
                    self.liveness_warning_emitted = false;
                    self.liveness_timeout_emitted = false;
                    self.disconnect_reason = DisconnectReason::None;
                    // Only increment on Connected, never on retries,
                    // attempts or disconnections.
                    self.epoch += 1;
                }
                Event::TransportConnectFailed => {
                    self.telemetry.increment(Metric::ConnectFailure, 1);
                    if should_retry(error) {
                        self.telemetry.increment(Metric::RetryCyclesStarted, 1);
                        self.set_state(State::WaitingReconnect);
                        self.arm_immediate_reconnect(error);
                    } else {
                        self.set_state(State::Disconnected);
                        self.disconnect_reason = DisconnectReason::TransportError;
                    }
                }
                Event::TransportReconnectFailed => {
                    self.telemetry.increment(Metric::RetryFailure, 1);
                    self.disconnect_reason = DisconnectReason::TransportError;
                    if should_retry(error) {
                        self.set_state(State::WaitingReconnect);
                        self.schedule_next_retry();
                    } else {
                        self.set_state(State::Disconnected);
                    }
                }
                Event::TransportClosed | Event::CloseRequested => {
                    self.set_state(State::Disconnected);
                }
                _ => {}
            },

            State::Connected => match event {
                Event::LivenessOutdated => {
                    self.emit(Signal::LivenessThreatened);
                }
                Event::LivenessExpired => {
                    self.telemetry.increment(Metric::LivenessTimeouts, 1);
                    self.last_error = error;
                    self.disconnect_reason = DisconnectReason::LivenessTimeout;
                    self.set_state(State::Disconnecting);
                    // Force transport failure; reconnection follows.
                    if let Some(t) = self.transport.as_mut() {
                        t.close();
                    }
                }
                Event::CloseRequested => {
                    log::debug!("disconnecting from {}", self.last_url);
                    self.disconnect_reason = DisconnectReason::LocalClose;
                    self.set_state(State::Disconnecting);
                    if let Some(t) = self.transport.as_mut() {
                        t.close();
                    }
                    log::info!("disconnected from {}", self.last_url);
                }
                Event::TransportClosed => {
                    if self.disconnect_reason != DisconnectReason::LocalClose
                        && should_retry(self.last_error)
                    {
                        self.telemetry.increment(Metric::RetryCyclesStarted, 1);
                        self.set_state(State::WaitingReconnect);
                        self.arm_immediate_reconnect(self.last_error);
                    } else {
                        self.set_state(State::Disconnected);
                    }
                }
                _ => {}
            },

            State::Disconnecting => {
                if event == Event::TransportClosed {
                    if self.disconnect_reason != DisconnectReason::LocalClose
                        && should_retry(self.last_error)
                    {
                        self.set_state(State::WaitingReconnect);
                        self.arm_immediate_reconnect(self.last_error);
                    } else {
                        self.set_state(State::Disconnected);
                    }
                }
            }

            State::WaitingReconnect => match event {
                Event::RetryTimerExpired => self.set_state(State::Connecting),
                // Explicit open() overrides a pending retry cycle.
                Event::OpenRequested => self.set_state(State::Connecting),
                Event::CloseRequested => self.set_state(State::Disconnected),
                _ => {}
            },
        }
    }

    fn set_state(&mut self, new_state: State) {
        log::trace!("state: {:?} -> {:?}", self.state, new_state);
        self.state = new_state;
    }

    fn emit(&mut self, signal: Signal) {
        log::trace!("emitting signal {signal:?}");
        if self.signals.push(signal).is_ok() {
            return;
        }
        // Signals are informational, but a full ring means the caller is
        // not polling; protocol correctness can no longer be guaranteed.
        log::error!("signal ring overflow while emitting {signal:?} - forcing close");
        self.close();
    }

    // -------------------------------------------------------------------------
    // Reconnection
    // -------------------------------------------------------------------------

    fn reconnect(&mut self) -> bool {
        log::debug!(
            "reconnecting to {} (attempt {})",
            self.last_url,
            self.retry_attempts
        );
        self.telemetry.increment(Metric::RetryAttempts, 1);
        if self.state != State::WaitingReconnect {
            log::warn!("reconnect while not waiting to reconnect - ignoring");
            return false;
        }
        // Invariant: the endpoint survives from the original open().
        let Some(endpoint) = self.endpoint.clone() else {
            log::error!("reconnect without a parsed endpoint");
            self.set_state(State::Disconnected);
            return false;
        };
        self.transition(Event::RetryTimerExpired, None);
        self.create_transport();
        match self
            .transport
            .as_mut()
            .expect("transport created above")
            .connect(&endpoint)
        {
            Ok(()) => {
                self.telemetry.increment(Metric::RetrySuccess, 1);
                self.transition(Event::TransportConnected, None);
                log::info!("connection re-established with {}", self.last_url);
                true
            }
            Err(kind) => {
                log::error!("reconnection failed ({kind})");
                self.last_error = Some(kind);
                self.transition(Event::TransportReconnectFailed, Some(kind));
                false
            }
        }
    }

    /// Fresh transport for a new epoch. The message ring is cleared here so
    /// no message from epoch n is delivered under epoch n+1.
    fn create_transport(&mut self) {
        if let Some(mut old) = self.transport.take() {
            old.close();
        }
        self.message_ring.clear();
        self.transport = Some(T::create(
            &self.transport_cfg,
            Arc::clone(&self.message_ring),
            self.telemetry.clone(),
        ));
    }

    fn arm_immediate_reconnect(&mut self, error: Option<ErrorKind>) {
        log::debug!("scheduling immediate reconnection attempt");
        self.emit(Signal::RetryImmediate);
        self.retry_root_error = error;
        self.retry_attempts = 1;
        // next_retry stays unset: the first retry runs on the next poll.
        self.next_retry = None;
    }

    fn schedule_next_retry(&mut self) {
        self.emit(Signal::RetryScheduled);
        self.retry_attempts += 1;
        let delay = backoff(self.retry_root_error, self.retry_attempts);
        self.next_retry = Some(Instant::now() + delay);
        log::info!("next reconnection attempt in {} ms", delay.as_millis());
    }

    fn on_transport_error(&mut self, kind: ErrorKind) {
        // Do not override an intentional disconnect decision.
        if matches!(
            self.disconnect_reason,
            DisconnectReason::LivenessTimeout | DisconnectReason::LocalClose
        ) {
            return;
        }
        log::warn!("transport error: {kind}");
        self.last_error = Some(kind);
        self.disconnect_reason = DisconnectReason::TransportError;
    }

    fn on_transport_closed(&mut self) {
        // Guard against multiple invocations.
        if self.state == State::Disconnected {
            return;
        }
        // While Connecting, closure is resolved entirely by the FSM.
        if self.state == State::Connecting {
            return;
        }
        self.telemetry.increment(Metric::DisconnectEvents, 1);
        self.emit(Signal::Disconnected);
        self.transition(Event::TransportClosed, self.last_error);
        log::info!(
            "connection closed: {} (reason {:?})",
            self.last_url,
            self.disconnect_reason
        );
    }

    // -------------------------------------------------------------------------
    // Liveness
    // -------------------------------------------------------------------------

    fn recompute_liveness_windows(&mut self) {
        let total = self.message_timeout.max(self.heartbeat_timeout);
        let elapsed_at_warning = total.mul_f64(self.liveness_warning_ratio);
        self.liveness_danger_window = total.saturating_sub(elapsed_at_warning);
    }

    /// Largest remaining time across both activity signals.
    fn liveness_remaining(&self) -> Duration {
        let msg_left = self
            .message_timeout
            .saturating_sub(self.last_message_ts.elapsed());
        let hb_left = self
            .heartbeat_timeout
            .saturating_sub(self.liveness.last_heartbeat_age());
        msg_left.max(hb_left)
    }

    /// Conservative: stale only when BOTH signals exceeded their window.
    fn is_liveness_stale(&self) -> bool {
        let message_stale = self.last_message_ts.elapsed() > self.message_timeout;
        let heartbeat_stale = self.liveness.last_heartbeat_age() > self.heartbeat_timeout;
        message_stale && heartbeat_stale
    }
}

impl<T: Transport> Drop for Connection<T> {
    fn drop(&mut self) {
        // Close the transport and join its receive task; never schedule
        // retries after object lifetime ends.
        self.close();
        if let Some(mut t) = self.transport.take() {
            t.close();
        }
    }
}

/// Determines whether a transport error represents a transient, external
/// failure that should trigger automatic reconnection. Caller misuse,
/// protocol violations and intentional shutdowns are never retried.
fn should_retry(error: Option<ErrorKind>) -> bool {
    error.is_some_and(ErrorKind::is_retryable)
}

/// Exponential backoff with a per-error-class base and cap. The attempt
/// exponent is clamped to avoid overflow and long stalls.
fn backoff(error: Option<ErrorKind>, attempt: u32) -> Duration {
    let attempt = attempt.min(6);
    let (base, max) = match error {
        // Fast retry: the peer was just here a moment ago.
        Some(ErrorKind::RemoteClosed | ErrorKind::Timeout | ErrorKind::Backpressure) => {
            (Duration::from_millis(50), Duration::from_secs(1))
        }
        // Moderate retry: connect/handshake problems.
        Some(ErrorKind::ConnectionFailed | ErrorKind::HandshakeFailed) => {
            (Duration::from_millis(100), Duration::from_secs(5))
        }
        // Conservative retry: unknown transport failures.
        Some(ErrorKind::TransportFailure) => (Duration::from_millis(200), Duration::from_secs(10)),
        // Should never retry.
        _ => return Duration::MAX,
    };
    (base * (1u32 << attempt)).min(max)
}
