//! Per-worker readiness loop.
//!
//! Each worker blocks on its own epoll instance, accepts from its own
//! `SO_REUSEPORT` listener, and drives connections when they turn readable.
//! `Registration` decides which queues see a connection:
//!
//! - `PortSharing`: only the accepting worker's queue; the worker owns the
//!   connection outright in a local slab.
//! - `Shared`: every worker's queue; the connection lives in a `SharedTable`
//!   and whoever wins the slot try-lock drives it. With `exclusive`, the
//!   registration also carries `EPOLLEXCLUSIVE`; the lock stays as the
//!   correctness backstop.

use std::io::{self, ErrorKind};
use std::net::{TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::Arc;

use slab::Slab;
use tracing::{debug, error, info, trace, warn};

use crate::conn_table::{Acquire, SharedTable, Token};
use crate::epoll::{self, EXCLUSIVE, Epoll, HANGUP, READABLE, WRITABLE};
use crate::handler::RequestHandler;
use crate::machine::{ConnError, Connection, Drive};
use crate::metrics;
use crate::stream::StreamError;

/// Event data reserved for the listening socket. Never a valid slab key or
/// table token: both keep their index below `u32::MAX`.
pub const LISTENER_TOKEN: u64 = u64::MAX;

pub type TcpConnection = Connection<TcpStream>;

pub enum Registration {
    PortSharing {
        conns: Slab<TcpConnection>,
        limit: usize,
    },
    Shared {
        table: Arc<SharedTable<TcpConnection>>,
        exclusive: bool,
    },
}

impl Registration {
    pub fn port_sharing(limit: usize) -> Self {
        Registration::PortSharing {
            conns: Slab::with_capacity(limit.min(4096)),
            limit,
        }
    }

    pub fn shared(table: Arc<SharedTable<TcpConnection>>, exclusive: bool) -> Self {
        Registration::Shared { table, exclusive }
    }

    /// Flags carried by every registration of a connection, whatever its interest.
    fn wake_flags(&self) -> u32 {
        match self {
            Registration::Shared {
                exclusive: true, ..
            } => EXCLUSIVE,
            _ => 0,
        }
    }
}

/// Readiness interest for a connection. While a response is blocked the
/// connection reads nothing, so it waits for writability alone; unread input
/// would otherwise keep a level-triggered queue reporting it.
fn interest(wake: u32, writing: bool) -> u32 {
    if writing {
        wake | WRITABLE
    } else {
        wake | READABLE
    }
}

pub struct Worker {
    id: usize,
    listener: TcpListener,
    queues: Arc<[Epoll]>,
    registration: Registration,
    handler: Arc<dyn RequestHandler>,
    max_events: usize,
}

impl Worker {
    /// `queues[id]` is this worker's own queue; the others are only used to
    /// register connections under shared registration.
    pub(crate) fn new(
        id: usize,
        listener: TcpListener,
        queues: Arc<[Epoll]>,
        registration: Registration,
        handler: Arc<dyn RequestHandler>,
        max_events: usize,
    ) -> Self {
        debug_assert!(id < queues.len(), "worker id out of range");
        Self {
            id,
            listener,
            queues,
            registration,
            handler,
            max_events,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Serve forever. Returns only if the readiness queue itself fails.
    pub fn run(mut self) -> io::Result<()> {
        self.handler.thread_init(self.id);
        self.queues[self.id].add(self.listener.as_raw_fd(), READABLE, LISTENER_TOKEN)?;
        info!(worker = self.id, "worker started");

        let mut events = epoll::event_buffer(self.max_events);
        loop {
            let n = match self.queues[self.id].wait(&mut events, -1) {
                Ok(n) => n,
                Err(e) => {
                    error!(worker = self.id, error = %e, "epoll_wait failed");
                    return Err(e);
                }
            };
            for ev in &events[..n] {
                let (flags, data) = (ev.events, ev.u64);
                metrics::inc_wakeups();
                if data == LISTENER_TOKEN {
                    self.accept_ready();
                } else {
                    self.on_event(data, flags);
                }
            }
        }
    }

    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!(worker = self.id, %peer, "accepted");
                    self.admit(stream);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(worker = self.id, error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn admit(&mut self, stream: TcpStream) {
        if let Err(e) = stream
            .set_nonblocking(true)
            .and_then(|()| stream.set_nodelay(true))
        {
            warn!(worker = self.id, error = %e, "configuring accepted socket failed");
            return;
        }
        let fd = stream.as_raw_fd();
        let events = interest(self.registration.wake_flags(), false);
        let conn = Connection::new(stream);

        match &mut self.registration {
            Registration::PortSharing { conns, limit } => {
                if conns.len() >= *limit {
                    warn!(worker = self.id, limit = *limit, "connection table full, closing");
                    return;
                }
                let key = conns.insert(conn);
                if let Err(e) = self.queues[self.id].add(fd, events, key as u64) {
                    warn!(worker = self.id, fd, error = %e, "epoll_ctl add failed, closing");
                    conns.remove(key);
                    return;
                }
            }
            Registration::Shared { table, .. } => {
                // The slot stays locked until every queue has the fd, so no
                // other worker can drive or destroy it mid-registration.
                let guard = match table.insert(conn) {
                    Ok(guard) => guard,
                    Err(_conn) => {
                        warn!(
                            worker = self.id,
                            limit = table.capacity(),
                            "connection table full, closing"
                        );
                        return;
                    }
                };
                let token = guard.token();
                for queue in self.queues.iter() {
                    if let Err(e) = queue.add(fd, events, token.into_raw()) {
                        warn!(worker = self.id, fd, error = %e, "epoll_ctl add failed, closing");
                        drop(guard.remove());
                        return;
                    }
                }
            }
        }
        metrics::inc_accepted();
    }

    fn on_event(&mut self, data: u64, flags: u32) {
        let Worker {
            id,
            queues,
            registration,
            handler,
            ..
        } = self;
        let id = *id;

        match registration {
            Registration::PortSharing { conns, .. } => {
                let key = data as usize;
                let Some(conn) = conns.get_mut(key) else {
                    return;
                };
                if flags & HANGUP != 0 {
                    debug!(worker = id, fd = conn.get_ref().as_raw_fd(), "hang-up");
                    conns.remove(key);
                    metrics::inc_closed();
                    return;
                }
                let own = std::slice::from_ref(&queues[id]);
                if !step(conn, &**handler, id, own, data, 0) {
                    conns.remove(key);
                    metrics::inc_closed();
                }
            }
            Registration::Shared { table, exclusive } => {
                let token = Token::from_raw(data);
                let mut guard = match table.try_acquire(token) {
                    Acquire::Granted(guard) => guard,
                    Acquire::Contended => {
                        trace!(worker = id, slot = token.index(), "slot busy, deferring");
                        metrics::inc_lock_contended();
                        return;
                    }
                    Acquire::Stale => {
                        metrics::inc_stale_events();
                        return;
                    }
                };
                if flags & HANGUP != 0 {
                    debug!(worker = id, fd = guard.get_ref().as_raw_fd(), "hang-up");
                    drop(guard.remove());
                    metrics::inc_closed();
                    return;
                }
                let wake = if *exclusive { EXCLUSIVE } else { 0 };
                if !step(&mut guard, &**handler, id, &queues[..], data, wake) {
                    drop(guard.remove());
                    metrics::inc_closed();
                }
            }
        }
    }
}

/// Drive one connection and keep its write interest in step with its state.
/// Returns false when the connection must be destroyed.
fn step(
    conn: &mut TcpConnection,
    handler: &dyn RequestHandler,
    worker: usize,
    queues: &[Epoll],
    data: u64,
    wake: u32,
) -> bool {
    let fd = conn.get_ref().as_raw_fd();
    match conn.drive(handler, worker) {
        Ok(Drive::Suspended) => {}
        Ok(Drive::Closed) => {
            debug!(worker, fd, "peer closed");
            return false;
        }
        Err(ConnError::Protocol(e)) => {
            debug!(worker, fd, error = %e, "rejecting request, closing");
            return false;
        }
        Err(ConnError::Stream(e @ StreamError::Oversized { .. })) => {
            debug!(worker, fd, error = %e, "rejecting request, closing");
            return false;
        }
        Err(ConnError::Stream(e)) => {
            error!(worker, fd, error = %e, "connection I/O error, closing");
            return false;
        }
    }

    let want = conn.wants_writable();
    if want == conn.write_armed() {
        return true;
    }
    let events = interest(wake, want);
    for queue in queues {
        if let Err(e) = queue.rearm(fd, events, data) {
            error!(worker, fd, error = %e, "epoll_ctl rearm failed, closing");
            return false;
        }
    }
    conn.set_write_armed(want);
    true
}
