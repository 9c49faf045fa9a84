//! Outbound connector and the thread-safe client handle.
//!
//! `connect` resolves an address, starts a non-blocking TCP connect, and
//! posts the registration onto the reactor; the handshake resolves on the
//! reactor thread and the read cycle starts from there. The returned
//! [`ClientHandle`] may be used from any thread: `send` and `close` are
//! marshalled onto the reactor through `post`, so they never race the
//! connection's state, and messages sent from one thread go out in call
//! order, one write at a time.

use crate::reactor::Handle;
use crate::sink::{EventSink, SessionEvent};
use bytes::Bytes;
use mio::net::TcpStream;
use std::io;
use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Slot value meaning "not registered": either the install continuation
/// has not run yet, or registration failed.
const UNSET: usize = usize::MAX;

/// Shared address of a client connection in the reactor's registry.
///
/// Filled in by the install continuation on the reactor thread. Because
/// the task queue is FIFO, any continuation posted afterwards (every
/// `send` and `close`) observes the final value.
struct ConnRef {
    slot: AtomicUsize,
    id: AtomicU64,
}

impl ConnRef {
    fn unset() -> Self {
        Self {
            slot: AtomicUsize::new(UNSET),
            id: AtomicU64::new(0),
        }
    }

    fn set(&self, slot: usize, id: u64) {
        self.id.store(id, Ordering::Release);
        self.slot.store(slot, Ordering::Release);
    }

    fn get(&self) -> Option<(usize, u64)> {
        let slot = self.slot.load(Ordering::Acquire);
        if slot == UNSET {
            return None;
        }
        Some((slot, self.id.load(Ordering::Acquire)))
    }
}

/// Handle to an outbound connection. Cloneable and usable from any thread.
#[derive(Clone)]
pub struct ClientHandle {
    reactor: Handle,
    conn: Arc<ConnRef>,
}

impl ClientHandle {
    /// Queue a message for writing.
    ///
    /// Returns immediately; the write happens on the reactor thread.
    /// Messages are written in the order `send` was called, and a new
    /// message never starts until the previous one has been fully
    /// written. Sends against a connection that already failed or closed
    /// are dropped (the failure was reported when it happened).
    pub fn send(&self, message: impl Into<Bytes>) {
        let data = message.into();
        let conn = Arc::clone(&self.conn);
        self.reactor.post_task(move |driver| match conn.get() {
            Some((slot, id)) => driver.send(slot, id, data),
            None => debug!("send dropped: connection was never established"),
        });
    }

    /// Orderly local close: the socket is dropped on the reactor thread,
    /// sending FIN to the peer. Idempotent; safe to call from any thread.
    pub fn close(&self) {
        let conn = Arc::clone(&self.conn);
        self.reactor.post_task(move |driver| {
            if let Some((slot, id)) = conn.get() {
                driver.close(slot, id);
            }
        });
    }
}

/// Establish an outbound connection to `host:port`.
///
/// Resolution happens on the calling thread and resolution failures are
/// returned directly. The TCP handshake itself is asynchronous: success
/// is reported to the sink as a Connect event followed by the read cycle,
/// a refused or failed connect as a single Error event. No retry is
/// attempted either way.
pub fn connect(
    reactor: &Handle,
    host: &str,
    port: u16,
    recv_buffer: usize,
    sink: Arc<dyn EventSink>,
) -> io::Result<ClientHandle> {
    let addr = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{host}:{port} resolved to no addresses"),
            )
        })?;

    let stream = TcpStream::connect(addr)?;
    let conn = Arc::new(ConnRef::unset());

    let conn_ref = Arc::clone(&conn);
    reactor.post_task(move |driver| {
        match driver.install_outbound(stream, addr, recv_buffer, Arc::clone(&sink)) {
            Ok((slot, id)) => conn_ref.set(slot, id),
            Err(e) => sink.event(SessionEvent::Error, &format!("connect {addr}: {e}")),
        }
    });

    Ok(ClientHandle {
        reactor: reactor.clone(),
        conn,
    })
}
