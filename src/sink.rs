//! Observability sink for connection lifecycle events.
//!
//! The reactor core does not interpret payloads and does not log on its
//! own; every accept, connect, read, write, close, and error is handed to
//! an `EventSink` as an `(event, text)` pair. The default sink forwards
//! to `tracing`; tests substitute a recording sink.

use tracing::{debug, error, info};

/// Connection lifecycle events reported to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A new inbound connection was accepted. Text is the peer address.
    Accept,
    /// An outbound connection completed its handshake. Text is the peer address.
    Connect,
    /// A read completed. Text is the received payload (lossy UTF-8).
    Read,
    /// A queued message was fully written. Text is the payload (lossy UTF-8).
    Write,
    /// The connection ended without a transport error: end-of-stream from
    /// the peer, or an orderly local close.
    Close,
    /// A transport, connect, or accept failure.
    Error,
}

impl SessionEvent {
    fn label(self) -> &'static str {
        match self {
            SessionEvent::Accept => "accept",
            SessionEvent::Connect => "connect",
            SessionEvent::Read => "read",
            SessionEvent::Write => "write",
            SessionEvent::Close => "close",
            SessionEvent::Error => "error",
        }
    }
}

/// Consumer of connection events.
///
/// Implementations must be callable from the reactor thread while handles
/// on other threads hold the same sink, hence `Send + Sync`.
pub trait EventSink: Send + Sync {
    fn event(&self, event: SessionEvent, text: &str);
}

/// Default sink: forwards events to `tracing`.
pub struct LogSink;

impl EventSink for LogSink {
    fn event(&self, event: SessionEvent, text: &str) {
        match event {
            SessionEvent::Error => error!(event = event.label(), "{text}"),
            SessionEvent::Close => debug!(event = event.label(), "{text}"),
            _ => info!(event = event.label(), "{text}"),
        }
    }
}
