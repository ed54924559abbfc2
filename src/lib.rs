//! peerwire — the transport layer of a peer-to-peer stack.
//!
//! Turns raw TCP sockets into uniform, lifecycle-managed [`Connection`]
//! values that the rest of a p2p stack (multiplexing, encryption, protocol
//! negotiation) can consume without knowing whether a connection was dialed
//! or accepted.
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌──────────────────────────────────────────────┐
//!                 │                 TRANSPORT                    │
//!                 │                                              │
//!   dial(addr) ───┼─▶ transport.rs ──▶ connection.rs ──▶ Connection
//!                 │        │               ▲                     │
//!                 │        ▼               │                     │
//!   listen(node) ─┼─▶ listener.rs ─────────┘                     │
//!                 │   (accept loop,     (adapter: sink/source,   │
//!                 │    limits, set)      timeline, close/abort)  │
//!                 │                                              │
//!                 │  Cross-cutting: config · error · event ·     │
//!                 │  lifecycle (signals) · observability         │
//!                 └──────────────────────────────────────────────┘
//! ```
//!
//! Events (`listening`, `error`, `close`, `connection:open`) are published
//! through the injected [`EventSink`] capability; the crate never assumes a
//! specific subscriber.

// Core subsystems
pub mod config;
pub mod error;
pub mod event;
pub mod net;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::{NodeInfo, PeerwireConfig, TransportConfig};
pub use error::TransportError;
pub use event::{EventBus, EventSink, NullEventSink, TransportEvent};
pub use lifecycle::{Signal, SignalHandle};
pub use net::connection::{
    CloseOptions, Connection, ConnectionId, ConnectionSource, ConnectionState, Direction, Timeline,
};
pub use net::listener::{Listener, ListenerState};
pub use net::transport::{DialOptions, TcpTransport};
