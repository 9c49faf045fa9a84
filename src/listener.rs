//! Listening socket: binds, accepts, and hands new connections to the
//! reactor.
//!
//! The socket is registered level-triggered for readability, so the
//! accept loop is permanently armed: every readable event drains
//! `accept()` until it would block, and the registration itself re-arms
//! the next batch. One failed accept is reported and never tears the
//! listener down.

use crate::sink::{EventSink, SessionEvent};
use mio::net::{TcpListener, TcpStream};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::reactor::Handle;

/// Accept backlog passed to `listen(2)`.
const BACKLOG: i32 = 1024;

/// A bound, listening TCP socket.
pub struct Listener {
    inner: TcpListener,
    recv_buffer: usize,
    sink: Arc<dyn EventSink>,
}

impl Listener {
    /// Bind a listening socket on `addr`.
    ///
    /// Built through `socket2`: non-blocking, with `SO_REUSEADDR` set
    /// before binding.
    pub fn bind(
        addr: SocketAddr,
        recv_buffer: usize,
        sink: Arc<dyn EventSink>,
    ) -> io::Result<Self> {
        let socket = socket2::Socket::new(
            match addr {
                SocketAddr::V4(_) => socket2::Domain::IPV4,
                SocketAddr::V6(_) => socket2::Domain::IPV6,
            },
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;

        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(BACKLOG)?;

        Ok(Self {
            inner: TcpListener::from_std(socket.into()),
            recv_buffer,
            sink,
        })
    }

    /// Local address the socket is bound to. Useful with port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Install the listener onto the reactor and start accepting.
    ///
    /// Registration happens on the reactor thread; a registration failure
    /// is reported through the sink.
    pub fn start(self, reactor: &Handle) {
        reactor.post_task(move |driver| {
            let sink = self.sink();
            if let Err(e) = driver.install_listener(self) {
                sink.event(SessionEvent::Error, &format!("listener: {e}"));
            }
        });
    }

    pub(crate) fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.inner.accept()
    }

    pub(crate) fn recv_buffer(&self) -> usize {
        self.recv_buffer
    }

    pub(crate) fn sink(&self) -> Arc<dyn EventSink> {
        Arc::clone(&self.sink)
    }

    pub(crate) fn source(&mut self) -> &mut TcpListener {
        &mut self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::LogSink;

    #[test]
    fn test_bind_ephemeral_port() {
        let listener = Listener::bind(
            "127.0.0.1:0".parse().unwrap(),
            1024,
            Arc::new(LogSink),
        )
        .unwrap();

        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn test_bound_socket_is_connectable() {
        let listener = Listener::bind(
            "127.0.0.1:0".parse().unwrap(),
            1024,
            Arc::new(LogSink),
        )
        .unwrap();

        let addr = listener.local_addr().unwrap();
        std::net::TcpStream::connect(addr).unwrap();
    }
}
