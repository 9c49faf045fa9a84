//! Readiness-based event loop.
//!
//! A single reactor thread owns the poller, the registry of listeners and
//! connections, and all I/O dispatch. Readiness events are delivered by
//! `mio::Poll` (epoll on Linux, kqueue on macOS) and routed by token to
//! the owning entry, so completions for a given connection run on this
//! one thread in issue order.
//!
//! Other threads interact with the loop in exactly two ways:
//! - `Handle::post` enqueues a continuation onto an MPSC queue and wakes
//!   the poller; the reactor drains the queue before each blocking poll.
//! - `Handle::stop` raises a flag and wakes the poller; the loop exits
//!   after the current dispatch batch.
//!
//! Registry entries are slab slots keyed by the `mio::Token`. A slot can
//! be recycled after a close, so every connection also carries a
//! monotonically increasing id; continuations holding a (slot, id) pair
//! act only if the ids still match, which keeps a stale handle from
//! touching whatever connection inherited the slot.

use crate::connection::Connection;
use crate::listener::Listener;
use crate::sink::{EventSink, SessionEvent};
use bytes::Bytes;
use mio::event::Event;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use tracing::debug;

/// Token reserved for the cross-thread waker.
const WAKER_TOKEN: Token = Token(usize::MAX);

/// Readiness events drained per poll call.
const EVENTS_CAPACITY: usize = 256;

/// Continuation executed on the reactor thread with access to the registry.
type Task = Box<dyn FnOnce(&mut Driver) + Send>;

/// A registry entry: either a listening socket or a connection.
enum Slot {
    Listener(Listener),
    Conn(Connection),
}

/// Reactor-owned state: the poller and the socket registry.
///
/// Only the reactor thread ever touches a `Driver`; posted continuations
/// receive it by mutable reference when they run.
pub(crate) struct Driver {
    poll: Poll,
    slots: Slab<Slot>,
    next_id: u64,
}

impl Driver {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Register a listener and start accepting on it.
    pub(crate) fn install_listener(&mut self, mut listener: Listener) -> io::Result<usize> {
        let entry = self.slots.vacant_entry();
        let token = Token(entry.key());
        self.poll
            .registry()
            .register(listener.source(), token, Interest::READABLE)?;
        let key = entry.key();
        entry.insert(Slot::Listener(listener));
        Ok(key)
    }

    /// Register an outbound connection with its handshake pending.
    ///
    /// Returns the (slot, id) pair that client handles use to address the
    /// connection from other threads.
    pub(crate) fn install_outbound(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
        recv_buffer: usize,
        sink: Arc<dyn EventSink>,
    ) -> io::Result<(usize, u64)> {
        let id = self.next_id();
        let conn = Connection::outbound(stream, peer, recv_buffer, sink, id);
        let key = self.install_conn(conn)?;
        Ok((key, id))
    }

    /// Queue a message on a connection, if the handle still matches it.
    pub(crate) fn send(&mut self, idx: usize, id: u64, data: Bytes) {
        match self.slots.get_mut(idx) {
            Some(Slot::Conn(conn)) if conn.id() == id && !conn.is_closed() => {
                conn.enqueue(data);
            }
            _ => {
                debug!("send dropped: connection already closed");
                return;
            }
        }
        self.reconcile(idx);
    }

    /// Orderly local close of a connection, if the handle still matches it.
    pub(crate) fn close(&mut self, idx: usize, id: u64) {
        if let Some(Slot::Conn(conn)) = self.slots.get_mut(idx) {
            if conn.id() == id {
                conn.shutdown();
            }
        }
        self.reconcile(idx);
    }

    fn install_accepted(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
        recv_buffer: usize,
        sink: Arc<dyn EventSink>,
    ) -> io::Result<()> {
        let id = self.next_id();
        let conn = Connection::accepted(stream, peer, recv_buffer, sink, id);
        self.install_conn(conn).map(|_| ())
    }

    fn install_conn(&mut self, mut conn: Connection) -> io::Result<usize> {
        let interest = conn.interest();
        let entry = self.slots.vacant_entry();
        let token = Token(entry.key());
        self.poll
            .registry()
            .register(conn.source(), token, interest)?;
        conn.set_registered(interest);
        let key = entry.key();
        entry.insert(Slot::Conn(conn));
        Ok(key)
    }

    /// Route one readiness event to its registry entry.
    fn dispatch(&mut self, event: &Event) {
        let Token(idx) = event.token();
        if !self.slots.contains(idx) {
            // Closed earlier in this batch.
            return;
        }
        if matches!(self.slots[idx], Slot::Listener(_)) {
            self.accept_ready(idx);
        } else {
            self.conn_ready(idx, event);
        }
    }

    /// Drain pending accepts until the socket would block.
    ///
    /// One connection failing to accept or register is reported and does
    /// not stop the listener; the level-triggered registration re-arms it
    /// for the next batch.
    fn accept_ready(&mut self, idx: usize) {
        loop {
            let accepted = match &self.slots[idx] {
                Slot::Listener(listener) => listener.accept(),
                Slot::Conn(_) => return,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let (recv_buffer, sink) = match &self.slots[idx] {
                        Slot::Listener(listener) => (listener.recv_buffer(), listener.sink()),
                        Slot::Conn(_) => return,
                    };
                    sink.event(SessionEvent::Accept, &peer.to_string());
                    if let Err(e) =
                        self.install_accepted(stream, peer, recv_buffer, Arc::clone(&sink))
                    {
                        sink.event(SessionEvent::Error, &format!("register {peer}: {e}"));
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    if let Slot::Listener(listener) = &self.slots[idx] {
                        listener
                            .sink()
                            .event(SessionEvent::Error, &format!("accept: {e}"));
                    }
                    break;
                }
            }
        }
    }

    fn conn_ready(&mut self, idx: usize, event: &Event) {
        if let Some(Slot::Conn(conn)) = self.slots.get_mut(idx) {
            if event.is_readable() {
                conn.on_readable();
            }
            if event.is_writable() && !conn.is_closed() {
                conn.on_writable();
            }
        }
        self.reconcile(idx);
    }

    /// Bring the poller registration in line with the connection's state,
    /// and remove the entry once it has closed.
    fn reconcile(&mut self, idx: usize) {
        let mut closed = false;
        {
            let registry = self.poll.registry();
            if let Some(Slot::Conn(conn)) = self.slots.get_mut(idx) {
                if !conn.is_closed() {
                    let want = conn.interest();
                    if conn.registered() != Some(want) {
                        match registry.reregister(conn.source(), Token(idx), want) {
                            Ok(()) => conn.set_registered(want),
                            Err(e) => conn.fail(&format!("reregister: {e}")),
                        }
                    }
                }
                closed = conn.is_closed();
            }
        }
        if closed {
            if let Slot::Conn(mut conn) = self.slots.remove(idx) {
                let _ = self.poll.registry().deregister(conn.source());
            }
        }
    }
}

/// Thread-safe handle to a running (or about to run) reactor.
#[derive(Clone)]
pub struct Handle {
    tasks: Sender<Task>,
    waker: Arc<Waker>,
    stopped: Arc<AtomicBool>,
}

impl Handle {
    /// Schedule a continuation to run on the reactor thread at the next
    /// loop iteration. Safe to call from any thread; continuations run in
    /// the order they were posted.
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_task(move |_| f());
    }

    pub(crate) fn post_task<F>(&self, f: F)
    where
        F: FnOnce(&mut Driver) + Send + 'static,
    {
        if self.tasks.send(Box::new(f)).is_ok() {
            let _ = self.waker.wake();
        }
    }

    /// Request the loop to exit after the current dispatch batch.
    /// Thread-safe and idempotent.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// The event loop. Create one, hand out clones of its `Handle`, then
/// block a thread in [`Reactor::run`].
pub struct Reactor {
    driver: Driver,
    events: Events,
    tasks: Receiver<Task>,
    handle: Handle,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (tasks_tx, tasks_rx) = mpsc::channel();
        let handle = Handle {
            tasks: tasks_tx,
            waker,
            stopped: Arc::new(AtomicBool::new(false)),
        };

        Ok(Self {
            driver: Driver {
                poll,
                slots: Slab::new(),
                next_id: 0,
            },
            events: Events::with_capacity(EVENTS_CAPACITY),
            tasks: tasks_rx,
            handle,
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Run the loop until [`Handle::stop`] is called or polling fails.
    ///
    /// Posted continuations are drained before each blocking poll, so a
    /// continuation posted before `run` starts executes as soon as the
    /// loop does. Once stopped, queued continuations are discarded and no
    /// further completions are dispatched.
    pub fn run(&mut self) -> io::Result<()> {
        while !self.handle.is_stopped() {
            while let Ok(task) = self.tasks.try_recv() {
                task(&mut self.driver);
            }
            if self.handle.is_stopped() {
                break;
            }

            match self.driver.poll.poll(&mut self.events, None) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            for event in self.events.iter() {
                if event.token() == WAKER_TOKEN {
                    // Wakeup only; tasks and the stop flag are checked at
                    // the top of the loop.
                    continue;
                }
                self.driver.dispatch(event);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_post_runs_on_reactor_thread() {
        let mut reactor = Reactor::new().unwrap();
        let handle = reactor.handle().clone();
        let io_thread = std::thread::spawn(move || reactor.run());

        let (tx, rx) = mpsc::channel();
        handle.post(move || {
            tx.send(std::thread::current().id()).unwrap();
        });

        let reactor_thread = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(reactor_thread, std::thread::current().id());

        handle.stop();
        io_thread.join().unwrap().unwrap();
    }

    #[test]
    fn test_posted_tasks_run_in_order() {
        let mut reactor = Reactor::new().unwrap();
        let handle = reactor.handle().clone();

        let (tx, rx) = mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            handle.post(move || {
                tx.send(i).unwrap();
            });
        }

        let io_thread = std::thread::spawn(move || reactor.run());
        let got: Vec<i32> = (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(got, (0..10).collect::<Vec<_>>());

        handle.stop();
        io_thread.join().unwrap().unwrap();
    }

    #[test]
    fn test_stop_unblocks_run() {
        let mut reactor = Reactor::new().unwrap();
        let handle = reactor.handle().clone();
        let io_thread = std::thread::spawn(move || reactor.run());

        std::thread::sleep(Duration::from_millis(50));
        handle.stop();
        handle.stop();
        io_thread.join().unwrap().unwrap();
    }

    #[test]
    fn test_tasks_posted_after_stop_do_not_run() {
        let mut reactor = Reactor::new().unwrap();
        let handle = reactor.handle().clone();
        handle.stop();

        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);
        handle.post(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });

        reactor.run().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
