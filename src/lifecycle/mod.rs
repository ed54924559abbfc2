//! Lifecycle coordination primitives.
//!
//! # Data Flow
//! ```text
//! Caller-supplied cancellation:
//!     Signal::trigger() → SignalHandle::fired() → dial/close unwinds
//!
//! Internal deadlines:
//!     SignalHandle::timeout(dur) → same path, no caller involvement
//! ```
//!
//! # Design Decisions
//! - One primitive for both caller cancellation and internal deadlines
//! - Signals fire at most once; observing after the fact is cheap

pub mod signal;

pub use signal::{Signal, SignalHandle};
