//! Connection state machine for the echo transport.
//!
//! Each connection wraps one non-blocking TCP socket and drives a strictly
//! alternating read/write cycle:
//!
//! ```text
//! Reading -> (payload received, reply queued) -> Writing -> Reading -> ...
//! ```
//!
//! with a terminal `Closed` state reachable from any point. Outbound
//! connections start in `Connecting` until the non-blocking handshake
//! resolves. A server connection echoes each payload back with the
//! `"Echo: "` prefix; a client connection only reports received bytes and
//! writes whatever the application queued.
//!
//! All methods here run on the reactor thread. The reactor translates the
//! connection's state into poller interest after every event, so `Writing`
//! connections are write-only (no read overlaps a reply in flight) and a
//! drained transmit queue drops the write interest again.

use crate::sink::{EventSink, SessionEvent};
use bytes::{Bytes, BytesMut};
use mio::net::TcpStream;
use mio::Interest;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;

/// Prefix prepended to every echoed payload.
pub const ECHO_PREFIX: &[u8] = b"Echo: ";

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    /// Outbound handshake in progress; resolved on the first writable event.
    Connecting,
    /// Read armed, no reply in flight.
    Reading,
    /// Reply write in flight; reads are paused until it completes.
    Writing,
    /// Terminal. The reactor removes closed connections from its registry.
    Closed,
}

/// A single connection, inbound or outbound.
pub(crate) struct Connection {
    stream: TcpStream,
    state: ConnState,
    /// Fixed receive buffer, reused in place for every read.
    rx: Box<[u8]>,
    /// FIFO transmit queue; the front message is the one outstanding write.
    tx: VecDeque<Bytes>,
    /// Bytes of the front message already written.
    tx_written: usize,
    /// Interest currently registered with the poller, if any.
    registered: Option<Interest>,
    /// Server connections echo; client connections only report reads.
    echo: bool,
    /// Registry generation id, checked by cross-thread handles.
    id: u64,
    peer: SocketAddr,
    sink: Arc<dyn EventSink>,
}

impl Connection {
    /// Wrap a freshly accepted socket; starts in `Reading`.
    pub(crate) fn accepted(
        stream: TcpStream,
        peer: SocketAddr,
        recv_buffer: usize,
        sink: Arc<dyn EventSink>,
        id: u64,
    ) -> Self {
        Self {
            stream,
            state: ConnState::Reading,
            rx: vec![0u8; recv_buffer].into_boxed_slice(),
            tx: VecDeque::new(),
            tx_written: 0,
            registered: None,
            echo: true,
            id,
            peer,
            sink,
        }
    }

    /// Wrap an outbound socket with the handshake still pending.
    pub(crate) fn outbound(
        stream: TcpStream,
        peer: SocketAddr,
        recv_buffer: usize,
        sink: Arc<dyn EventSink>,
        id: u64,
    ) -> Self {
        Self {
            stream,
            state: ConnState::Connecting,
            rx: vec![0u8; recv_buffer].into_boxed_slice(),
            tx: VecDeque::new(),
            tx_written: 0,
            registered: None,
            echo: false,
            id,
            peer,
            sink,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    pub(crate) fn source(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub(crate) fn registered(&self) -> Option<Interest> {
        self.registered
    }

    pub(crate) fn set_registered(&mut self, interest: Interest) {
        self.registered = Some(interest);
    }

    /// Poller interest implied by the current state.
    pub(crate) fn interest(&self) -> Interest {
        match self.state {
            ConnState::Connecting | ConnState::Writing => Interest::WRITABLE,
            ConnState::Reading if self.tx.is_empty() => Interest::READABLE,
            ConnState::Reading => Interest::READABLE | Interest::WRITABLE,
            // Never registered; closed connections are removed before
            // interest is reconciled.
            ConnState::Closed => Interest::READABLE,
        }
    }

    /// Append a message to the transmit queue. The write is issued by the
    /// reactor once the socket is writable; queued messages go out FIFO,
    /// one at a time.
    pub(crate) fn enqueue(&mut self, data: Bytes) {
        self.tx.push_back(data);
    }

    /// Orderly local close. Reported as a close, not a failure.
    pub(crate) fn shutdown(&mut self) {
        if !self.is_closed() {
            self.sink
                .event(SessionEvent::Close, &format!("{} closed locally", self.peer));
            self.state = ConnState::Closed;
        }
    }

    /// Record a transport failure and close.
    pub(crate) fn fail(&mut self, text: &str) {
        self.sink.event(SessionEvent::Error, text);
        self.state = ConnState::Closed;
    }

    /// Handle a readable event: one read into the receive buffer.
    ///
    /// `Ok(0)` is end-of-stream: the peer closed in an orderly fashion,
    /// which terminates the connection without an error report.
    pub(crate) fn on_readable(&mut self) {
        if self.state != ConnState::Reading {
            return;
        }
        match self.stream.read(&mut self.rx) {
            Ok(0) => {
                self.sink
                    .event(SessionEvent::Close, &format!("{} end of stream", self.peer));
                self.state = ConnState::Closed;
            }
            Ok(n) => {
                let payload = &self.rx[..n];
                self.sink
                    .event(SessionEvent::Read, &String::from_utf8_lossy(payload));
                if self.echo {
                    self.tx.push_back(echo_reply(payload));
                    self.state = ConnState::Writing;
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => self.fail(&format!("read {}: {e}", self.peer)),
        }
    }

    /// Handle a writable event: resolve a pending handshake, then flush
    /// the transmit queue as far as the socket allows.
    pub(crate) fn on_writable(&mut self) {
        if self.state == ConnState::Connecting {
            self.finish_connect();
        }
        if self.is_closed() {
            return;
        }
        self.flush();
    }

    /// Resolve a non-blocking connect on the first writable event.
    fn finish_connect(&mut self) {
        match self.stream.take_error() {
            Ok(Some(e)) | Err(e) => {
                self.fail(&format!("connect {}: {e}", self.peer));
                return;
            }
            Ok(None) => {}
        }
        match self.stream.peer_addr() {
            Ok(_) => {
                self.sink
                    .event(SessionEvent::Connect, &self.peer.to_string());
                self.state = ConnState::Reading;
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::NotConnected
                    || e.raw_os_error() == Some(libc::EINPROGRESS) =>
            {
                // Handshake still pending; the next writable event retries.
            }
            Err(e) => self.fail(&format!("connect {}: {e}", self.peer)),
        }
    }

    /// Write queued messages in order until the queue drains or the socket
    /// would block. A message is reported only once fully written, and the
    /// next message is not started before the current one completes.
    fn flush(&mut self) {
        while let Some(front) = self.tx.front() {
            match self.stream.write(&front[self.tx_written..]) {
                Ok(0) => {
                    self.fail(&format!("write {}: zero-length write", self.peer));
                    return;
                }
                Ok(n) => {
                    self.tx_written += n;
                    if self.tx_written == front.len() {
                        if let Some(done) = self.tx.pop_front() {
                            self.sink
                                .event(SessionEvent::Write, &String::from_utf8_lossy(&done));
                        }
                        self.tx_written = 0;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.fail(&format!("write {}: {e}", self.peer));
                    return;
                }
            }
        }
        if self.tx.is_empty() && self.state == ConnState::Writing {
            // Reply fully flushed: re-arm the read side of the cycle.
            self.state = ConnState::Reading;
        }
    }
}

/// Build the reply for a received payload: `"Echo: "` + payload.
pub fn echo_reply(payload: &[u8]) -> Bytes {
    let mut reply = BytesMut::with_capacity(ECHO_PREFIX.len() + payload.len());
    reply.extend_from_slice(ECHO_PREFIX);
    reply.extend_from_slice(payload);
    reply.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Write as _};
    use std::sync::Mutex;
    use std::time::Duration;

    struct RecSink {
        events: Mutex<Vec<(SessionEvent, String)>>,
    }

    impl RecSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
            })
        }

        fn texts(&self, event: SessionEvent) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|(e, _)| *e == event)
                .map(|(_, t)| t.clone())
                .collect()
        }
    }

    impl EventSink for RecSink {
        fn event(&self, event: SessionEvent, text: &str) {
            self.events.lock().unwrap().push((event, text.to_string()));
        }
    }

    /// Accepted connection plus the peer's blocking side of the socket.
    fn accepted_pair(sink: Arc<dyn EventSink>) -> (Connection, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = std::net::TcpStream::connect(addr).unwrap();
        let (accepted, peer_addr) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        let stream = TcpStream::from_std(accepted);
        let conn = Connection::accepted(stream, peer_addr, 1024, sink, 1);
        (conn, peer)
    }

    /// Drive `step` until `done` holds; non-blocking I/O on loopback may
    /// need a few attempts.
    fn pump(conn: &mut Connection, mut step: impl FnMut(&mut Connection) -> bool) {
        for _ in 0..200 {
            if step(conn) {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("connection did not reach expected state");
    }

    #[test]
    fn test_echo_reply_format() {
        assert_eq!(&echo_reply(b"hi")[..], b"Echo: hi");
        assert_eq!(&echo_reply(b"")[..], b"Echo: ");
    }

    #[test]
    fn test_read_write_cycle() {
        let sink = RecSink::new();
        let (mut conn, mut peer) = accepted_pair(sink.clone());
        assert_eq!(conn.state, ConnState::Reading);

        peer.write_all(b"hello").unwrap();
        pump(&mut conn, |c| {
            c.on_readable();
            c.state == ConnState::Writing
        });
        assert_eq!(sink.texts(SessionEvent::Read), vec!["hello"]);

        pump(&mut conn, |c| {
            c.on_writable();
            c.state == ConnState::Reading
        });
        assert_eq!(sink.texts(SessionEvent::Write), vec!["Echo: hello"]);

        let mut buf = [0u8; 64];
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let n = peer.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"Echo: hello");
    }

    #[test]
    fn test_eof_closes_without_error() {
        let sink = RecSink::new();
        let (mut conn, peer) = accepted_pair(sink.clone());
        drop(peer);

        pump(&mut conn, |c| {
            c.on_readable();
            c.is_closed()
        });
        assert_eq!(sink.texts(SessionEvent::Error), Vec::<String>::new());
        assert_eq!(sink.texts(SessionEvent::Close).len(), 1);
    }

    #[test]
    fn test_transmit_queue_is_fifo() {
        let sink = RecSink::new();
        let (mut conn, mut peer) = accepted_pair(sink.clone());

        conn.enqueue(Bytes::from_static(b"one"));
        conn.enqueue(Bytes::from_static(b"two"));
        conn.enqueue(Bytes::from_static(b"three"));
        pump(&mut conn, |c| {
            c.on_writable();
            c.tx.is_empty()
        });
        assert_eq!(sink.texts(SessionEvent::Write), vec!["one", "two", "three"]);

        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut got = Vec::new();
        while got.len() < 11 {
            let mut buf = [0u8; 64];
            match peer.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => got.extend_from_slice(&buf[..n]),
                Err(e) => panic!("peer read: {e}"),
            }
        }
        assert_eq!(got, b"onetwothree");
    }

    #[test]
    fn test_interest_follows_state() {
        let sink = RecSink::new();
        let (mut conn, _peer) = accepted_pair(sink);

        assert_eq!(conn.interest(), Interest::READABLE);
        conn.enqueue(Bytes::from_static(b"x"));
        assert_eq!(conn.interest(), Interest::READABLE | Interest::WRITABLE);
        conn.state = ConnState::Writing;
        assert_eq!(conn.interest(), Interest::WRITABLE);
    }

    #[test]
    fn test_local_shutdown_reports_close_once() {
        let sink = RecSink::new();
        let (mut conn, _peer) = accepted_pair(sink.clone());

        conn.shutdown();
        conn.shutdown();
        assert!(conn.is_closed());
        assert_eq!(sink.texts(SessionEvent::Close).len(), 1);
    }
}
