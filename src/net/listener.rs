//! TCP listener: accept loop, connection limits, tracked connections.
//!
//! # Responsibilities
//! - Bind the server socket and run the accept loop
//! - Adapt each accepted socket into an inbound `Connection`
//! - Enforce the connection limit via semaphore (Active ↔ Paused)
//! - Track the set of live inbound connections for bulk shutdown
//! - Publish `listening` / `connection:open` / `error` / `close` events
//!
//! # Design Decisions
//! - Sockets accepted while not `Active` are destroyed immediately: the
//!   "don't accept before listening" and "reject while paused" policies
//!   share one code path
//! - A permit is held by a per-connection cleanup task, so the slot frees
//!   exactly when the connection terminates
//! - Stopping the listener leaves accepted connections untouched

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::net::{TcpListener as TcpServerSocket, TcpStream};
use tokio::sync::Semaphore;

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::event::{EventSink, TransportEvent};
use crate::lifecycle::Signal;
use crate::net::connection::{CloseOptions, Connection, ConnectionId, Direction};

const STATE_INACTIVE: u8 = 0;
const STATE_ACTIVE: u8 = 1;
const STATE_PAUSED: u8 = 2;

/// Consecutive accept failures treated as an unrecoverable server fault.
const MAX_ACCEPT_FAILURES: u32 = 16;

/// Listener lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Not bound, or explicitly stopped.
    Inactive,
    /// Bound and accepting.
    Active,
    /// Bound but refusing new connections until headroom returns.
    Paused,
}

impl ListenerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerState::Inactive => "inactive",
            ListenerState::Active => "active",
            ListenerState::Paused => "paused",
        }
    }
}

impl std::fmt::Display for ListenerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bound server socket accepting inbound connections.
pub struct Listener {
    shared: Arc<ListenerShared>,
}

struct ListenerShared {
    local_addr: SocketAddr,
    state: AtomicU8,
    connections: DashMap<ConnectionId, Connection>,
    limit: Arc<Semaphore>,
    events: Arc<dyn EventSink>,
    config: TransportConfig,
    stop: Signal,
    closed_emitted: AtomicBool,
}

impl Listener {
    /// Bind a server socket and start accepting.
    ///
    /// On success the listener is `Active` and a `listening` event is
    /// published. On failure an `error` event is published and the bind
    /// error returned; no accept loop starts.
    pub async fn bind(
        addr: SocketAddr,
        config: TransportConfig,
        events: Arc<dyn EventSink>,
    ) -> Result<Listener, TransportError> {
        let socket = match TcpServerSocket::bind(addr).await {
            Ok(socket) => socket,
            Err(err) => {
                tracing::warn!(address = %addr, error = %err, "Failed to bind listener");
                let returned = TransportError::Bind {
                    address: addr.to_string(),
                    source: io::Error::new(err.kind(), err.to_string()),
                };
                events.publish(TransportEvent::Error {
                    error: Arc::new(TransportError::Bind {
                        address: addr.to_string(),
                        source: err,
                    }),
                });
                return Err(returned);
            }
        };

        let local_addr = socket.local_addr().map_err(|err| TransportError::Bind {
            address: addr.to_string(),
            source: err,
        })?;

        let shared = Arc::new(ListenerShared {
            local_addr,
            state: AtomicU8::new(STATE_ACTIVE),
            connections: DashMap::new(),
            limit: Arc::new(Semaphore::new(config.max_connections)),
            events,
            config,
            stop: Signal::new(),
            closed_emitted: AtomicBool::new(false),
        });

        tracing::info!(
            address = %local_addr,
            max_connections = shared.config.max_connections,
            "Listener bound"
        );
        shared.events.publish(TransportEvent::Listening {
            address: local_addr,
        });

        tokio::spawn(accept_loop(socket, Arc::clone(&shared)));

        Ok(Listener { shared })
    }

    /// The local address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Current listener state.
    pub fn state(&self) -> ListenerState {
        self.shared.state_value()
    }

    /// Number of tracked live inbound connections.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    /// Snapshot of the tracked live inbound connections.
    pub fn connections(&self) -> Vec<Connection> {
        self.shared
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Stop accepting and transition to `Inactive`.
    ///
    /// Already-accepted connections are untouched; their lifecycle is
    /// independent of the listener's.
    pub fn stop(&self) {
        self.shared.enter_inactive();
    }

    /// Gracefully close every tracked inbound connection.
    pub async fn close_connections(&self) {
        let connections = self.connections();
        tracing::info!(
            address = %self.shared.local_addr,
            count = connections.len(),
            "Closing tracked connections"
        );
        join_all(
            connections
                .iter()
                .map(|conn| conn.close(CloseOptions::default())),
        )
        .await;
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.shared.local_addr)
            .field("state", &self.shared.state_value())
            .field("connections", &self.shared.connections.len())
            .finish()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        // Last handle gone: nothing can restart or observe the listener.
        self.shared.stop.trigger();
    }
}

impl ListenerShared {
    fn state_value(&self) -> ListenerState {
        match self.state.load(Ordering::Acquire) {
            STATE_ACTIVE => ListenerState::Active,
            STATE_PAUSED => ListenerState::Paused,
            _ => ListenerState::Inactive,
        }
    }

    /// Transition to `Inactive`, stop the accept loop and publish `close`
    /// exactly once (unless the listener was paused).
    fn enter_inactive(&self) {
        let prev = self.state.swap(STATE_INACTIVE, Ordering::AcqRel);
        if prev == STATE_INACTIVE {
            return;
        }
        self.stop.trigger();
        if prev != STATE_PAUSED && !self.closed_emitted.swap(true, Ordering::AcqRel) {
            self.events.publish(TransportEvent::Closed);
        }
        tracing::info!(address = %self.local_addr, "Listener stopped");
    }

    fn handle_accept(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        // Headroom may have returned since the limit was last hit.
        if self.state.load(Ordering::Acquire) == STATE_PAUSED
            && self.limit.available_permits() > 0
        {
            if self
                .state
                .compare_exchange(
                    STATE_PAUSED,
                    STATE_ACTIVE,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                tracing::info!(address = %self.local_addr, "Listener resumed");
            }
        }

        if self.state.load(Ordering::Acquire) != STATE_ACTIVE {
            // Not listening yet, stopped, or paused: reject uniformly by
            // destroying the socket. No connection, no event.
            tracing::debug!(
                peer_addr = %peer,
                state = %self.state_value(),
                "Destroying socket accepted while not active"
            );
            drop(stream);
            return;
        }

        let permit = match Arc::clone(&self.limit).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                let _ = self.state.compare_exchange(
                    STATE_ACTIVE,
                    STATE_PAUSED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                tracing::warn!(
                    peer_addr = %peer,
                    max_connections = self.config.max_connections,
                    "Connection limit reached, pausing listener"
                );
                drop(stream);
                return;
            }
        };

        let conn = Connection::adapt(stream, Direction::Inbound, peer.to_string(), &self.config);
        self.connections.insert(conn.id(), conn.clone());
        tracing::debug!(
            connection_id = %conn.id(),
            peer_addr = %peer,
            tracked = self.connections.len(),
            "New inbound connection"
        );

        // The permit lives exactly as long as the connection: the cleanup
        // task unregisters the entry and frees the slot on termination.
        let shared = Arc::clone(self);
        let tracked = conn.clone();
        tokio::spawn(async move {
            tracked.closed().await;
            shared.connections.remove(&tracked.id());
            drop(permit);
            if shared
                .state
                .compare_exchange(
                    STATE_PAUSED,
                    STATE_ACTIVE,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                tracing::info!(address = %shared.local_addr, "Listener resumed");
            }
        });

        self.events
            .publish(TransportEvent::ConnectionOpened { connection: conn });
    }
}

async fn accept_loop(socket: TcpServerSocket, shared: Arc<ListenerShared>) {
    let stop = shared.stop.handle();
    let mut consecutive_failures = 0u32;

    loop {
        tokio::select! {
            _ = stop.fired() => break,
            accepted = socket.accept() => match accepted {
                Ok((stream, peer)) => {
                    consecutive_failures = 0;
                    shared.handle_accept(stream, peer);
                }
                Err(err) => {
                    consecutive_failures += 1;
                    if consecutive_failures >= MAX_ACCEPT_FAILURES {
                        tracing::error!(
                            address = %shared.local_addr,
                            error = %err,
                            "Accept failing persistently, stopping listener"
                        );
                        shared.events.publish(TransportEvent::Error {
                            error: Arc::new(TransportError::Bind {
                                address: shared.local_addr.to_string(),
                                source: err,
                            }),
                        });
                        shared.enter_inactive();
                        break;
                    }
                    tracing::warn!(
                        address = %shared.local_addr,
                        error = %err,
                        "Accept failed"
                    );
                    // Transient failures (EMFILE and friends) back off
                    // instead of spinning.
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    tracing::debug!(address = %shared.local_addr, "Accept loop exited");
}
