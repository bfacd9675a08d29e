/// WebSocket transport.
///
/// A single-connection transport primitive: no retries, no reconnection
/// logic. Recovery policy and subscription replay live in the connection
/// and session layers.
///
/// The production implementation ([`WsTransport`]) owns one receive task on
/// the session's tokio runtime. The task converts incoming frames into
/// message-ring activity and pushes control events (close, error,
/// backpressure) into a bounded control ring. It never blocks on user code
/// and never invokes user callbacks.
///
/// The [`Transport`] trait is the seam for test transports; tests compose a
/// session with a scripted transport and no global state.
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::runtime::Handle;
use tokio::sync::{watch, Mutex};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message as WsMsg;

use crate::config::{
    BackpressureMode, BackpressurePolicy, Relaxed, BACKPRESSURE_THRESHOLD, CONNECT_TIMEOUT,
    CONTROL_RING, MESSAGE_RING, RX_BUFFER_SIZE,
};
use crate::endpoint::Endpoint;
use crate::errors::ErrorKind;
use crate::ring::SpscRing;
use crate::telemetry::{Metric, Telemetry};

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    WsMsg,
>;

type WsStream = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

/// One complete websocket message inside the transport message ring.
///
/// Slots are preallocated and recycled; the producer (receive task) writes
/// the payload and commits, the consumer (application thread) peeks and
/// releases. The slot reference is transient memory — consumers must not
/// retain it beyond the release call.
pub struct DataBlock {
    size: u32,
    data: Box<[u8]>,
}

impl Default for DataBlock {
    fn default() -> Self {
        Self {
            size: 0,
            data: vec![0u8; RX_BUFFER_SIZE].into_boxed_slice(),
        }
    }
}

impl DataBlock {
    /// Number of valid bytes.
    pub fn size(&self) -> usize {
        self.size as usize
    }

    /// Slot capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The message payload, `data[..size]`.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.size as usize]
    }

    /// Producer-side fill. Caller must have checked capacity.
    pub fn write(&mut self, bytes: &[u8]) {
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.size = bytes.len() as u32;
    }
}

/// Control-plane event emitted by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlEvent {
    /// The transport is down. Emitted exactly once per transport lifetime.
    #[default]
    Close,
    /// A classified receive or shutdown error. Always followed by `Close`.
    Error(ErrorKind),
    /// The message ring was full and the configured policy escalated.
    Backpressure,
}

/// Raw message ring shared between the receive task and the consumer.
pub type MessageRing = SpscRing<DataBlock, MESSAGE_RING>;

/// Control-event ring (transport → connection).
pub type ControlRing = SpscRing<ControlEvent, CONTROL_RING>;

/// Transport seam used by the connection layer.
///
/// One instance corresponds to one physical connection attempt; the
/// connection creates a fresh transport on every entry to `Connecting` and
/// destroys it no later than the next attempt.
pub trait Transport {
    /// Environment needed to construct instances (runtime handle for the
    /// production transport, a script handle for test doubles).
    type Config: Clone;

    fn create(cfg: &Self::Config, ring: Arc<MessageRing>, telemetry: Telemetry) -> Self;

    /// Open the websocket and start the receive task. Allowed once per
    /// transport instance.
    fn connect(&mut self, endpoint: &Endpoint) -> Result<(), ErrorKind>;

    /// Send a text message. Allowed only after a successful `connect` and
    /// before `close`. A boolean accepted / not-accepted is the honest
    /// signal; failures surface asynchronously through the control ring.
    fn send(&mut self, text: &str) -> bool;

    /// Stop the receive task and release resources on all exit paths.
    /// Idempotent.
    fn close(&mut self);

    /// Pull interface for control-plane events.
    fn poll_event(&mut self) -> Option<ControlEvent>;

    /// Pull interface for data-plane messages. Peek then release.
    fn peek_message(&self) -> Option<&DataBlock>;
    fn release_message(&self);
}

/// Backpressure bookkeeping for the receive task.
#[derive(Default)]
struct BackpressureState {
    attempts: u32,
    signaled: bool,
}

impl BackpressureState {
    fn reset(&mut self) {
        self.attempts = 0;
        self.signaled = false;
    }
}

/// Production transport over `tokio-tungstenite`.
///
/// The receive task runs on the runtime whose [`Handle`] is supplied as
/// config; the session keeps that runtime at exactly one worker thread so a
/// session is two threads total.
pub struct WsTransport<B: BackpressurePolicy = Relaxed> {
    handle: Handle,
    ring: Arc<MessageRing>,
    control: Arc<ControlRing>,
    telemetry: Telemetry,
    sink: Option<Arc<Mutex<WsSink>>>,
    running: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    recv_task: Option<tokio::task::JoinHandle<()>>,
    _policy: PhantomData<B>,
}

impl<B: BackpressurePolicy> Transport for WsTransport<B> {
    type Config = Handle;

    fn create(cfg: &Handle, ring: Arc<MessageRing>, telemetry: Telemetry) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            handle: cfg.clone(),
            ring,
            control: Arc::new(ControlRing::new()),
            telemetry,
            sink: None,
            running: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            recv_task: None,
            _policy: PhantomData,
        }
    }

    fn connect(&mut self, endpoint: &Endpoint) -> Result<(), ErrorKind> {
        if self.recv_task.is_some() {
            return Err(ErrorKind::InvalidState);
        }
        let url = endpoint.to_url();
        let attempt = self.handle.block_on(async {
            tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(url.as_str()))
                .await
        });
        let ws_stream = match attempt {
            Err(_) => {
                log::warn!("websocket connect timed out: {url}");
                return Err(ErrorKind::Timeout);
            }
            Ok(Err(e)) => {
                let kind = classify_connect_error(&e);
                log::error!("websocket connect failed ({kind}): {e}");
                return Err(kind);
            }
            Ok(Ok((ws, _response))) => ws,
        };
        let (sink, stream) = ws_stream.split();
        self.sink = Some(Arc::new(Mutex::new(sink)));
        self.running.store(true, Ordering::Release);
        self.closed.store(false, Ordering::Release);

        let task = self.handle.spawn(receive_loop::<B>(
            stream,
            self.ring.clone(),
            self.control.clone(),
            self.running.clone(),
            self.closed.clone(),
            self.shutdown_tx.subscribe(),
            self.telemetry.clone(),
        ));
        self.recv_task = Some(task);
        Ok(())
    }

    fn send(&mut self, text: &str) -> bool {
        let Some(sink) = &self.sink else {
            log::error!("send() called on unconnected websocket");
            return false;
        };
        log::trace!("sending message (size {})", text.len());
        let msg = WsMsg::Text(text.to_string());
        let result = self
            .handle
            .block_on(async { sink.lock().await.send(msg).await });
        match result {
            Ok(()) => {
                self.telemetry.increment(Metric::BytesTx, text.len() as u64);
                self.telemetry.increment(Metric::MessagesTx, 1);
                true
            }
            Err(e) => {
                log::error!("websocket send failed: {e}");
                false
            }
        }
    }

    fn close(&mut self) {
        // Stop the receive loop and cancel a blocked receive.
        self.running.store(false, Ordering::Release);
        let _ = self.shutdown_tx.send(true);

        // Best-effort close frame, then release the write half.
        if let Some(sink) = self.sink.take() {
            let _ = self.handle.block_on(async {
                let mut guard = sink.lock().await;
                let _ = guard.send(WsMsg::Close(None)).await;
                guard.close().await
            });
        }

        // Join the receive task so the message ring has no producer left.
        if let Some(task) = self.recv_task.take() {
            let _ = self.handle.block_on(task);
        }
        log::trace!("websocket closed");
    }

    fn poll_event(&mut self) -> Option<ControlEvent> {
        let mut ev = ControlEvent::default();
        if self.control.pop(&mut ev) {
            Some(ev)
        } else {
            None
        }
    }

    fn peek_message(&self) -> Option<&DataBlock> {
        self.ring.peek_consumer_slot()
    }

    fn release_message(&self) {
        self.ring.release_consumer_slot();
    }
}

impl<B: BackpressurePolicy> Drop for WsTransport<B> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.recv_task.take() {
            task.abort();
        }
    }
}

// -----------------------------------------------------------------------------
// Receive path
// -----------------------------------------------------------------------------

async fn receive_loop<B: BackpressurePolicy>(
    mut stream: WsStream,
    ring: Arc<MessageRing>,
    control: Arc<ControlRing>,
    running: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
    telemetry: Telemetry,
) {
    let mut backpressure = BackpressureState::default();

    while running.load(Ordering::Acquire) {
        let msg = tokio::select! {
            _ = shutdown.changed() => {
                // Local shutdown, expected during close().
                log::trace!("receive cancelled (local shutdown)");
                emit_event(&control, ControlEvent::Error(ErrorKind::LocalShutdown));
                break;
            }
            msg = stream.next() => msg,
        };

        match msg {
            Some(Ok(WsMsg::Text(text))) => {
                if deliver::<B>(
                    text.as_bytes(),
                    &ring,
                    &control,
                    &running,
                    &closed,
                    &telemetry,
                    &mut backpressure,
                )
                .await
                .is_none()
                {
                    break;
                }
            }
            Some(Ok(WsMsg::Binary(bytes))) => {
                if deliver::<B>(
                    &bytes,
                    &ring,
                    &control,
                    &running,
                    &closed,
                    &telemetry,
                    &mut backpressure,
                )
                .await
                .is_none()
                {
                    break;
                }
            }
            Some(Ok(WsMsg::Close(_))) => {
                // Normal termination.
                log::debug!("received websocket close frame");
                running.store(false, Ordering::Release);
                break;
            }
            Some(Ok(_)) => {
                // Ping/pong frames are answered by the platform library.
            }
            Some(Err(e)) => {
                telemetry.increment(Metric::ReceiveErrors, 1);
                let kind = classify_receive_error(&e);
                log::warn!("websocket receive failed ({kind}): {e}");
                emit_event(&control, ControlEvent::Error(kind));
                running.store(false, Ordering::Release);
                break;
            }
            None => {
                // Stream ended without a close frame: peer dropped us.
                telemetry.increment(Metric::ReceiveErrors, 1);
                log::debug!("connection closed by peer");
                emit_event(&control, ControlEvent::Error(ErrorKind::RemoteClosed));
                running.store(false, Ordering::Release);
                break;
            }
        }
    }

    signal_close(&control, &closed, &telemetry);
}

/// Copy one complete message into a lazily acquired ring slot and commit
/// it. Returns `None` when the transport must shut down.
async fn deliver<B: BackpressurePolicy>(
    bytes: &[u8],
    ring: &MessageRing,
    control: &ControlRing,
    running: &AtomicBool,
    closed: &AtomicBool,
    telemetry: &Telemetry,
    backpressure: &mut BackpressureState,
) -> Option<()> {
    telemetry.increment(Metric::BytesRx, bytes.len() as u64);

    loop {
        if !running.load(Ordering::Acquire) {
            return None;
        }
        if let Some(slot) = ring.try_acquire_producer_slot() {
            backpressure.reset();
            if bytes.len() > slot.capacity() {
                log::error!(
                    "incoming message exceeds slot capacity ({} > {})",
                    bytes.len(),
                    slot.capacity()
                );
                fatal_shutdown(control, running, closed, telemetry, ErrorKind::ProtocolError);
                return None;
            }
            slot.write(bytes);
            ring.commit_producer_slot();
            telemetry.increment(Metric::MessagesRx, 1);
            return Some(());
        }

        match B::MODE {
            BackpressureMode::ZeroTolerance => {
                log::warn!("message ring full, zero-tolerance policy: forcing close");
                telemetry.increment(Metric::BackpressureEvents, 1);
                emit_event(control, ControlEvent::Backpressure);
                fatal_shutdown(control, running, closed, telemetry, ErrorKind::Backpressure);
                return None;
            }
            BackpressureMode::Strict => {
                if !backpressure.signaled {
                    backpressure.signaled = true;
                    log::warn!("message ring full, strict policy: signaling and retrying");
                    telemetry.increment(Metric::BackpressureEvents, 1);
                    if control.push(ControlEvent::Backpressure).is_err() {
                        fatal_shutdown(control, running, closed, telemetry, ErrorKind::Backpressure);
                        return None;
                    }
                }
                tokio::task::yield_now().await;
            }
            BackpressureMode::Relaxed => {
                backpressure.attempts += 1;
                if !backpressure.signaled && backpressure.attempts >= BACKPRESSURE_THRESHOLD {
                    backpressure.signaled = true;
                    log::warn!("message ring full, relaxed policy: threshold reached");
                    telemetry.increment(Metric::BackpressureEvents, 1);
                    if control.push(ControlEvent::Backpressure).is_err() {
                        fatal_shutdown(control, running, closed, telemetry, ErrorKind::Backpressure);
                        return None;
                    }
                    backpressure.attempts = 0;
                }
                // Light backoff first, stronger after repeated failures.
                if backpressure.attempts < 10 {
                    tokio::task::yield_now().await;
                } else {
                    tokio::time::sleep(Duration::from_micros(10)).await;
                }
            }
        }
    }
}

/// Push a control event; losing one is only tolerable during shutdown.
fn emit_event(control: &ControlRing, event: ControlEvent) {
    if control.push(event).is_err() {
        log::error!("control ring full - event {event:?} lost in transport shutdown");
    }
}

/// Exactly-once close signaling.
fn signal_close(control: &ControlRing, closed: &AtomicBool, telemetry: &Telemetry) {
    if closed.swap(true, Ordering::AcqRel) {
        return;
    }
    telemetry.increment(Metric::CloseEvents, 1);
    emit_event(control, ControlEvent::Close);
}

/// Stop the loop, report the error and guarantee the close event.
fn fatal_shutdown(
    control: &ControlRing,
    running: &AtomicBool,
    closed: &AtomicBool,
    telemetry: &Telemetry,
    kind: ErrorKind,
) {
    if !running.swap(false, Ordering::AcqRel) {
        return; // already shutting down
    }
    log::error!("forcing transport close ({kind})");
    emit_event(control, ControlEvent::Error(kind));
    signal_close(control, closed, telemetry);
}

// -----------------------------------------------------------------------------
// Error classification
// -----------------------------------------------------------------------------

fn classify_connect_error(e: &WsError) -> ErrorKind {
    match e {
        WsError::Url(_) => ErrorKind::InvalidUrl,
        WsError::Io(io) => match io.kind() {
            std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
            _ => ErrorKind::ConnectionFailed,
        },
        WsError::Http(_) | WsError::HttpFormat(_) | WsError::Tls(_) => ErrorKind::HandshakeFailed,
        WsError::Protocol(_) => ErrorKind::ProtocolError,
        _ => ErrorKind::TransportFailure,
    }
}

fn classify_receive_error(e: &WsError) -> ErrorKind {
    use tokio_tungstenite::tungstenite::error::ProtocolError as WsProtocolError;
    match e {
        // Remote closed the connection (with or without a close frame).
        WsError::ConnectionClosed | WsError::AlreadyClosed => ErrorKind::RemoteClosed,
        WsError::Protocol(WsProtocolError::ResetWithoutClosingHandshake) => {
            ErrorKind::RemoteClosed
        }
        WsError::Io(io) => match io.kind() {
            std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof => ErrorKind::RemoteClosed,
            _ => ErrorKind::TransportFailure,
        },
        WsError::Protocol(_) | WsError::Utf8 | WsError::Capacity(_) => ErrorKind::ProtocolError,
        _ => ErrorKind::TransportFailure,
    }
}
