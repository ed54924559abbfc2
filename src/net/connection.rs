//! Socket-to-connection adapter: lifecycle state machine and I/O surface.
//!
//! # Responsibilities
//! - Wrap one `TcpStream` into a `Connection` (sink, source, timeline)
//! - Reconcile the racing termination sources — inactivity timeout, read
//!   error, remote FIN, `close()`, `abort()` — into one recorded close
//! - Preserve buffered data on graceful close, discard it on abort
//! - Generate unique connection IDs for tracing
//!
//! # Design Decisions
//! - A single atomic state machine (Open → Closing → Closed) guards the
//!   transition; `timeline.close` is written exactly once regardless of
//!   which termination source fires first
//! - The adapter owns both socket halves exclusively for the connection's
//!   lifetime; teardown revokes them through the halt signal
//! - Remote FIN closes the connection, matching the default half-open
//!   behavior of the sockets this transport interoperates with

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex as AsyncMutex, Notify};

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::lifecycle::{Signal, SignalHandle};
use crate::observability::metrics;

/// Read buffer growth per chunk.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Global atomic counter for connection IDs.
/// Relaxed ordering is sufficient since we only need uniqueness.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Whether the connection was dialed or accepted. Immutable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection state for lifecycle tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Active and processing I/O.
    Open,
    /// A graceful close is in flight.
    Closing,
    /// Terminated; the socket is destroyed.
    Closed,
}

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Millisecond timestamps of the connection's lifecycle events.
///
/// `close` is written exactly once, by whichever termination path fires
/// first; the write is a compare-exchange so racing paths cannot double-set
/// it. `upgraded` is set by a later protocol layer, if any.
#[derive(Debug)]
pub struct Timeline {
    open: u64,
    upgraded: AtomicU64,
    close: AtomicU64,
}

impl Timeline {
    fn new() -> Self {
        Self {
            open: now_millis(),
            upgraded: AtomicU64::new(0),
            close: AtomicU64::new(0),
        }
    }

    /// When the connection was adapted (ms since Unix epoch).
    pub fn open(&self) -> u64 {
        self.open
    }

    /// When the connection was upgraded by a later layer, if it was.
    pub fn upgraded(&self) -> Option<u64> {
        match self.upgraded.load(Ordering::Acquire) {
            0 => None,
            at => Some(at),
        }
    }

    /// When the connection was closed, if it was.
    pub fn close(&self) -> Option<u64> {
        match self.close.load(Ordering::Acquire) {
            0 => None,
            at => Some(at),
        }
    }

    /// Record the upgrade timestamp. Called by the negotiation layer.
    pub fn record_upgraded(&self) {
        let _ = self
            .upgraded
            .compare_exchange(0, now_millis().max(1), Ordering::AcqRel, Ordering::Acquire);
    }

    /// Record the close timestamp. Returns false if already set.
    fn record_close(&self) -> bool {
        self.close
            .compare_exchange(0, now_millis().max(1), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Options for [`Connection::close`].
#[derive(Debug, Default)]
pub struct CloseOptions {
    /// Cancellation signal bounding the graceful close. When absent, an
    /// internal deadline signal with the configured close timeout is used.
    pub signal: Option<SignalHandle>,
}

struct Shared {
    id: ConnectionId,
    remote_addr: String,
    direction: Direction,
    timeline: Timeline,
    state: AtomicU8,
    /// Set before a timeout-triggered teardown so later handlers suppress
    /// duplicate error logging: the timeout is the cause, not a new fault.
    timed_out: AtomicBool,
    /// The local FIN has been sent (sink completed or close drained).
    write_done: AtomicBool,
    last_read_ms: AtomicU64,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<BufWriter<OwnedWriteHalf>>>,
    /// Woken when the sink finishes or the connection terminates, so a
    /// concurrent `close()` can observe drain progress.
    write_progress: Notify,
    closed_tx: watch::Sender<bool>,
    /// Revokes in-flight I/O when any termination source wins.
    halt: Signal,
    /// Serializes the graceful shutdown sequence.
    close_gate: AsyncMutex<()>,
    close_timeout: Duration,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("direction", &self.direction)
            .field("state", &self.state_value())
            .finish()
    }
}

impl Shared {
    fn state_value(&self) -> ConnectionState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => ConnectionState::Open,
            STATE_CLOSING => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    fn touch_read(&self) {
        self.last_read_ms.store(now_millis(), Ordering::Release);
    }

    fn take_reader(&self) -> Option<OwnedReadHalf> {
        self.reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn take_writer(&self) -> Option<BufWriter<OwnedWriteHalf>> {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// The single convergence point for every termination source.
    ///
    /// Idempotent: the first caller moves the state to `Closed`, records the
    /// close timestamp, destroys any socket halves still parked here and
    /// fires the halt signal; every later caller is a no-op. A half held by
    /// an in-flight sink or source is dropped by that path when it observes
    /// the halt. Returns whether this call performed the transition.
    fn terminate(&self, cause: Option<&TransportError>) -> bool {
        if self.state.swap(STATE_CLOSED, Ordering::AcqRel) == STATE_CLOSED {
            return false;
        }

        self.timeline.record_close();
        drop(self.take_reader());
        drop(self.take_writer());
        self.halt.trigger();
        self.write_progress.notify_waiters();
        self.closed_tx.send_replace(true);

        let reason = match cause {
            None => "clean",
            Some(TransportError::Timeout(_)) => "timeout",
            Some(TransportError::Aborted) => "abort",
            Some(_) => "error",
        };
        metrics::record_connection_closed(reason);

        match cause {
            None => {
                tracing::debug!(
                    connection_id = %self.id,
                    direction = %self.direction,
                    "Connection closed"
                );
            }
            Some(err) => {
                let after_timeout = self.timed_out.load(Ordering::Acquire)
                    && !matches!(err, TransportError::Timeout(_));
                if after_timeout {
                    tracing::trace!(
                        connection_id = %self.id,
                        error = %err,
                        "Suppressing teardown error after timeout"
                    );
                } else {
                    tracing::debug!(
                        connection_id = %self.id,
                        direction = %self.direction,
                        reason,
                        error = %err,
                        "Connection closed"
                    );
                }
            }
        }
        true
    }
}

/// A lifecycle-managed handle over one adapted socket.
///
/// Cheap to clone; all clones share the underlying socket and lifecycle.
#[derive(Debug, Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Adapt a connected socket into a `Connection`.
    ///
    /// Takes exclusive ownership of the stream; no other component may touch
    /// the socket afterwards. Spawns the inactivity watchdog.
    pub fn adapt(
        stream: TcpStream,
        direction: Direction,
        remote_addr: String,
        config: &TransportConfig,
    ) -> Connection {
        let (read_half, write_half) = stream.into_split();
        let (closed_tx, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            id: ConnectionId::new(),
            remote_addr,
            direction,
            timeline: Timeline::new(),
            state: AtomicU8::new(STATE_OPEN),
            timed_out: AtomicBool::new(false),
            write_done: AtomicBool::new(false),
            last_read_ms: AtomicU64::new(now_millis()),
            reader: Mutex::new(Some(read_half)),
            writer: Mutex::new(Some(BufWriter::new(write_half))),
            write_progress: Notify::new(),
            closed_tx,
            halt: Signal::new(),
            close_gate: AsyncMutex::new(()),
            close_timeout: config.close_timeout(),
        });

        tokio::spawn(watchdog(Arc::clone(&shared), config.inactivity_timeout()));

        metrics::record_connection_opened(direction.as_str());
        tracing::debug!(
            connection_id = %shared.id,
            direction = %direction,
            remote_addr = %shared.remote_addr,
            "Connection adapted"
        );

        Connection { shared }
    }

    /// This connection's unique ID.
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// The address of the remote end.
    pub fn remote_addr(&self) -> &str {
        &self.shared.remote_addr
    }

    /// Whether the connection was dialed or accepted.
    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    /// Lifecycle timestamps.
    pub fn timeline(&self) -> &Timeline {
        &self.shared.timeline
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state_value()
    }

    /// Whether the connection has terminated.
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Resolve once the connection has terminated, whichever path wins.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed_tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Take the inbound byte sequence.
    ///
    /// The source is single-pass; a second call yields an already-ended
    /// source.
    pub fn source(&self) -> ConnectionSource {
        ConnectionSource {
            shared: Arc::clone(&self.shared),
            reader: self.shared.take_reader(),
            buf: BytesMut::new(),
        }
    }

    /// Write a finite sequence of chunks, then send the local FIN.
    ///
    /// Anything convertible into [`Bytes`] is coerced. On normal completion
    /// the write half is flushed and shut down so the remote observes
    /// end-of-stream; the read side stays open. Write faults never propagate
    /// past the sink boundary: expected cancellations are swallowed, any
    /// other error is logged and closure is left to the termination paths.
    pub async fn sink<S, B>(&self, chunks: S) -> Result<(), TransportError>
    where
        S: Stream<Item = B> + Unpin,
        B: Into<Bytes>,
    {
        let shared = &self.shared;
        let mut writer = match shared.take_writer() {
            Some(writer) => writer,
            None => {
                // Destroyed, or a previous sink already consumed the write
                // half. Per contract this never throws past the sink.
                tracing::debug!(
                    connection_id = %shared.id,
                    direction = %shared.direction,
                    "Sink called on destroyed or consumed write half"
                );
                return Ok(());
            }
        };

        let halt = shared.halt.handle();
        let mut chunks = chunks;
        let mut halted = false;

        let io_result: std::io::Result<()> = async {
            loop {
                let chunk = tokio::select! {
                    chunk = chunks.next() => chunk,
                    _ = halt.fired() => {
                        halted = true;
                        break;
                    }
                };
                let Some(chunk) = chunk else { break };
                let chunk: Bytes = chunk.into();
                tokio::select! {
                    res = writer.write_all(&chunk) => res?,
                    _ = halt.fired() => {
                        halted = true;
                        break;
                    }
                }
            }
            if halted {
                return Ok(());
            }
            // Input exhausted: flush buffered data and send the local FIN.
            writer.shutdown().await
        }
        .await;

        shared.write_done.store(true, Ordering::Release);
        shared.write_progress.notify_waiters();

        if halted {
            // A termination source won the race; unsent buffered data in
            // the dropped writer is discarded.
            return Ok(());
        }

        match io_result {
            Ok(()) => {
                tracing::trace!(
                    connection_id = %shared.id,
                    "Sink complete, local FIN sent"
                );
                Ok(())
            }
            Err(err) => {
                if !shared.timed_out.load(Ordering::Acquire) && !halt.is_fired() {
                    tracing::warn!(
                        connection_id = %shared.id,
                        direction = %shared.direction,
                        error = %err,
                        "Error in sink"
                    );
                }
                let cause = TransportError::connection(shared.remote_addr.clone(), err);
                shared.terminate(Some(&cause));
                Ok(())
            }
        }
    }

    /// Graceful shutdown: flush unsent buffered data, send the local FIN,
    /// then destroy the socket and record `timeline.close`.
    ///
    /// At most one close sequence runs at a time; concurrent callers await
    /// the same outcome. The drain is bounded by `options.signal`, or by an
    /// internal deadline signal of the configured close timeout. On any
    /// failure or signal expiry the close downgrades to [`Connection::abort`]
    /// instead of leaving the socket half-torn-down.
    pub async fn close(&self, options: CloseOptions) {
        let shared = self.shared.as_ref();
        if shared.state_value() == ConnectionState::Closed {
            tracing::trace!(connection_id = %shared.id, "Close on already closed connection");
            return;
        }

        let _gate = shared.close_gate.lock().await;
        if shared.state_value() == ConnectionState::Closed {
            return;
        }
        let _ = shared.state.compare_exchange(
            STATE_OPEN,
            STATE_CLOSING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        let signal = options
            .signal
            .unwrap_or_else(|| SignalHandle::timeout(shared.close_timeout));

        let drained = tokio::select! {
            res = drain_and_fin(shared) => res,
            _ = signal.fired() => Err(TransportError::Timeout(shared.close_timeout)),
        };

        match drained {
            Ok(()) => {
                // The drain can also conclude because a concurrent abort
                // already terminated the connection; only the winner logs.
                if shared.terminate(None) {
                    tracing::debug!(
                        connection_id = %shared.id,
                        direction = %shared.direction,
                        "Drained, closing gracefully"
                    );
                }
            }
            Err(cause) => self.abort(cause),
        }
    }

    /// Forced shutdown: destroy the socket immediately, discarding any
    /// unsent buffered data, and record `timeline.close`. Never blocks;
    /// idempotent past the first termination.
    pub fn abort(&self, error: TransportError) {
        let shared = &self.shared;
        if shared.state_value() == ConnectionState::Closed {
            tracing::trace!(connection_id = %shared.id, "Abort on already closed connection");
            return;
        }
        shared.terminate(Some(&error));
    }
}

/// Flush and FIN the write half, waiting out an in-flight sink if present.
async fn drain_and_fin(shared: &Shared) -> Result<(), TransportError> {
    loop {
        let notified = shared.write_progress.notified();
        tokio::pin!(notified);
        // Register with the Notify before the checks: notify_waiters only
        // wakes already-registered waiters, so a sink finishing between
        // the check and the await would otherwise be missed.
        notified.as_mut().enable();
        if let Some(mut writer) = shared.take_writer() {
            return writer
                .shutdown()
                .await
                .map_err(|err| TransportError::connection(shared.remote_addr.clone(), err));
        }
        if shared.write_done.load(Ordering::Acquire)
            || shared.state_value() == ConnectionState::Closed
        {
            return Ok(());
        }
        // A sink holds the write half; wait for it to finish the drain.
        notified.await;
    }
}

/// Destroys the socket with a timeout error after the configured span
/// without inbound bytes.
async fn watchdog(shared: Arc<Shared>, timeout: Duration) {
    let halt = shared.halt.handle();
    loop {
        let idle = now_millis().saturating_sub(shared.last_read_ms.load(Ordering::Acquire));
        let remaining = timeout.saturating_sub(Duration::from_millis(idle));
        if remaining.is_zero() {
            shared.timed_out.store(true, Ordering::Release);
            tracing::debug!(
                connection_id = %shared.id,
                direction = %shared.direction,
                "Socket read timeout"
            );
            shared.terminate(Some(&TransportError::Timeout(timeout)));
            return;
        }
        tokio::select! {
            _ = halt.fired() => return,
            _ = tokio::time::sleep(remaining) => {}
        }
    }
}

/// Single-pass inbound byte sequence of a [`Connection`].
#[derive(Debug)]
pub struct ConnectionSource {
    shared: Arc<Shared>,
    reader: Option<OwnedReadHalf>,
    buf: BytesMut,
}

impl ConnectionSource {
    /// Next chunk of inbound bytes.
    ///
    /// Returns `Ok(None)` when the sequence ends: the remote half-closed
    /// (FIN) or the socket was destroyed. A genuine read fault terminates
    /// the connection and surfaces as an error.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        let shared = Arc::clone(&self.shared);
        let halt = shared.halt.handle();
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        if halt.is_fired() {
            self.reader = None;
            return Ok(None);
        }

        self.buf.reserve(READ_CHUNK_SIZE);
        tokio::select! {
            _ = halt.fired() => {
                // Socket destroyed under us; the sequence ends cleanly.
                self.reader = None;
                Ok(None)
            }
            res = reader.read_buf(&mut self.buf) => match res {
                Ok(0) => {
                    tracing::debug!(
                        connection_id = %shared.id,
                        direction = %shared.direction,
                        "Remote half-closed (FIN)"
                    );
                    self.reader = None;
                    shared.terminate(None);
                    Ok(None)
                }
                Ok(_) => {
                    shared.touch_read();
                    Ok(Some(self.buf.split().freeze()))
                }
                Err(err) => {
                    self.reader = None;
                    let cause = TransportError::connection(shared.remote_addr.clone(), err);
                    shared.terminate(Some(&cause));
                    Err(cause)
                }
            }
        }
    }

    /// Collect the remaining chunks until the sequence ends.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut collected = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            collected.extend_from_slice(&chunk);
        }
        Ok(collected)
    }
}
