//! A passive-open, single-threaded reliable byte-stream engine that is
//! wire-compatible with TCP segment framing.
//!
//! [`net`] supplies the datagram transport, [`codec`] the segment
//! encode/decode, [`clock`] the timer capability, [`conn`] the per-flow
//! reliability engine, [`listener`] the 4-tuple demultiplexer, and
//! [`runtime`] the cooperative event loop tying them together.

pub mod clock;
pub mod codec;
pub mod conn;
pub mod error;
pub mod listener;
pub mod net;
pub mod runtime;

pub use conn::{Connection, Dual, Quad, State};
pub use error::{Error, Result};
pub use listener::Listener;
pub use runtime::Runtime;
