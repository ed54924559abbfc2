//! Dial/listen entry point.
//!
//! # Responsibilities
//! - `listen`: bind a Listener on the node's address
//! - `dial`: open an outbound socket, racing connect success, socket
//!   error, connect timeout and external cancellation into one outcome
//! - Apply socket options (keepalive, nodelay) to dialed sockets
//! - Publish `connection:open` for every adapted outbound connection
//!
//! # Design Decisions
//! - A dial with an already-fired signal rejects before touching the
//!   network
//! - Timeout and abort are distinct error kinds so callers can apply
//!   different retry policy

use std::io;
use std::sync::Arc;

use socket2::SockRef;
use tokio::net::TcpStream;

use crate::config::{NodeInfo, TransportConfig};
use crate::error::TransportError;
use crate::event::{EventSink, TransportEvent};
use crate::lifecycle::SignalHandle;
use crate::net::connection::{Connection, Direction};
use crate::net::listener::Listener;
use crate::observability::metrics;

/// Per-dial options.
#[derive(Debug, Clone, Default)]
pub struct DialOptions {
    /// External cancellation for this dial attempt.
    pub signal: Option<SignalHandle>,

    /// Override the configured TCP keepalive (default true).
    pub keep_alive: Option<bool>,

    /// Override the configured nodelay (default true).
    pub no_delay: Option<bool>,
}

/// The transport entry point combining dial and listen.
pub struct TcpTransport {
    config: TransportConfig,
    events: Arc<dyn EventSink>,
}

impl TcpTransport {
    pub fn new(config: TransportConfig, events: Arc<dyn EventSink>) -> Self {
        Self { config, events }
    }

    /// Bind a [`Listener`] on the node's address.
    ///
    /// Idempotency and re-binding policy are the listener's concern.
    pub async fn listen(&self, node: &NodeInfo) -> Result<Listener, TransportError> {
        tracing::info!(
            node_id = %node.id,
            address = %node.socket_addr(),
            "Starting listener"
        );
        Listener::bind(
            node.socket_addr(),
            self.config.clone(),
            Arc::clone(&self.events),
        )
        .await
    }

    /// Dial a remote address and adapt the socket into a [`Connection`].
    ///
    /// Exactly one of connect success, socket error, connect timeout or
    /// external cancellation settles the dial; failures reject with the
    /// matching [`TransportError`] kind.
    pub async fn dial(
        &self,
        address: &str,
        options: DialOptions,
    ) -> Result<Connection, TransportError> {
        let keep_alive = options.keep_alive.unwrap_or(self.config.keep_alive);
        let no_delay = options.no_delay.unwrap_or(self.config.no_delay);

        if let Some(signal) = &options.signal {
            if signal.is_fired() {
                // Never touch the network for a dial that was cancelled
                // before it started.
                tracing::debug!(address = %address, "Dial aborted before connect");
                metrics::record_dial_failure("aborted");
                return Err(TransportError::Aborted);
            }
        }

        let stream = match self.connect(address, options.signal.as_ref()).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(address = %address, error = %err, "Dial failed");
                metrics::record_dial_failure(err.kind());
                return Err(err);
            }
        };

        if let Err(err) = apply_socket_options(&stream, keep_alive, no_delay) {
            // Should not normally happen once connected; destroy the
            // partially-built socket so no connection leaks.
            drop(stream);
            tracing::warn!(address = %address, error = %err, "Failed to configure dialed socket");
            metrics::record_dial_failure("connection");
            return Err(TransportError::connection(address, err));
        }

        let conn = Connection::adapt(
            stream,
            Direction::Outbound,
            address.to_string(),
            &self.config,
        );
        tracing::debug!(
            connection_id = %conn.id(),
            address = %address,
            "New outbound connection"
        );
        self.events.publish(TransportEvent::ConnectionOpened {
            connection: conn.clone(),
        });
        Ok(conn)
    }

    async fn connect(
        &self,
        address: &str,
        signal: Option<&SignalHandle>,
    ) -> Result<TcpStream, TransportError> {
        let timeout = self.config.connect_timeout();
        tokio::select! {
            res = TcpStream::connect(address) => {
                res.map_err(|err| TransportError::connection(address, err))
            }
            _ = tokio::time::sleep(timeout) => Err(TransportError::Timeout(timeout)),
            _ = fired_or_never(signal) => Err(TransportError::Aborted),
        }
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("config", &self.config)
            .finish()
    }
}

/// Resolve when the signal fires; pend forever when there is none.
async fn fired_or_never(signal: Option<&SignalHandle>) {
    match signal {
        Some(signal) => signal.fired().await,
        None => std::future::pending().await,
    }
}

fn apply_socket_options(stream: &TcpStream, keep_alive: bool, no_delay: bool) -> io::Result<()> {
    stream.set_nodelay(no_delay)?;
    let sock = SockRef::from(stream);
    sock.set_keepalive(keep_alive)?;
    Ok(())
}
