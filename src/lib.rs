//! echoplex: an asynchronous TCP echo transport.
//!
//! A single-threaded reactor multiplexes readiness across all registered
//! sockets and drives per-connection read/write state machines:
//! - [`Reactor`] owns the poller and dispatches every completion on one
//!   thread; [`Handle`] lets other threads post work onto it or stop it.
//! - [`Listener`] accepts inbound connections; each one echoes every
//!   payload back prefixed with `"Echo: "`.
//! - [`connect`] establishes an outbound connection whose [`ClientHandle`]
//!   can send messages from any thread while replies are drained
//!   concurrently by the reactor.
//! - [`EventSink`] receives every accept/connect/read/write/close/error
//!   event; [`LogSink`] forwards them to `tracing`.
//!
//! There is no wire framing: message boundaries are whatever the sender
//! wrote in one call, capped at the receive buffer capacity per read.

pub mod client;
pub mod config;
mod connection;
pub mod listener;
pub mod reactor;
pub mod sink;

pub use client::{connect, ClientHandle};
pub use config::Config;
pub use connection::{echo_reply, ECHO_PREFIX};
pub use listener::Listener;
pub use reactor::{Handle, Reactor};
pub use sink::{EventSink, LogSink, SessionEvent};
