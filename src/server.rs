//! Bootstrap: one listener, one epoll instance and one worker thread per CPU.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{BACKLOG, ConfigError, MAX_WORKERS, ServerConfig};
use crate::conn_table::SharedTable;
use crate::dispatch::{Registration, Worker};
use crate::epoll::Epoll;
use crate::handler::RequestHandler;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("worker {worker} panicked")]
    WorkerPanicked { worker: usize },

    #[error("worker {worker} stopped: {source}")]
    WorkerFailed {
        worker: usize,
        #[source]
        source: io::Error,
    },
}

fn io_err(op: &'static str) -> impl FnOnce(io::Error) -> ServerError {
    move |source| ServerError::Io { op, source }
}

/// CPUs this process may run on, from the affinity mask.
pub fn available_cpus() -> usize {
    // SAFETY: cpu_set_t is plain data; zeroed is the empty set.
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    let ret = unsafe {
        libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set)
    };
    if ret == 0 {
        let count = unsafe { libc::CPU_COUNT(&set) };
        if count > 0 {
            return count as usize;
        }
    }
    thread::available_parallelism().map_or(1, |n| n.get())
}

/// Worker count for this machine, capped at `MAX_WORKERS`.
pub fn default_workers() -> usize {
    let cpus = available_cpus();
    if cpus > MAX_WORKERS {
        warn!(cpus, max = MAX_WORKERS, "more CPUs than worker limit, clamping");
    }
    cpus.clamp(1, MAX_WORKERS)
}

/// Non-blocking listener with `SO_REUSEADDR` and `SO_REUSEPORT` so every
/// worker can bind the same address.
pub fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    Ok(socket.into())
}

pub struct Server {
    config: ServerConfig,
    local_addr: SocketAddr,
    listeners: Vec<TcpListener>,
    queues: Arc<[Epoll]>,
    handler: Arc<dyn RequestHandler>,
}

impl Server {
    /// Bind every worker's listener and create every readiness queue.
    ///
    /// When `config.addr` has port 0, the first listener's ephemeral port is
    /// reused for the rest.
    pub fn bind(
        config: ServerConfig,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Self, ServerError> {
        config.validate()?;

        let first = create_listener(config.addr).map_err(io_err("bind"))?;
        let local_addr = first.local_addr().map_err(io_err("getsockname"))?;
        let mut listeners = Vec::with_capacity(config.workers);
        listeners.push(first);
        for _ in 1..config.workers {
            listeners.push(create_listener(local_addr).map_err(io_err("bind"))?);
        }

        let queues = (0..config.workers)
            .map(|_| Epoll::new())
            .collect::<io::Result<Vec<_>>>()
            .map_err(io_err("epoll_create"))?;

        Ok(Self {
            config,
            local_addr,
            listeners,
            queues: queues.into(),
            handler,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start one named thread per worker.
    pub fn spawn(self) -> Result<ServerHandle, ServerError> {
        let Server {
            config,
            local_addr,
            listeners,
            queues,
            handler,
        } = self;

        info!(
            addr = %local_addr,
            strategy = config.strategy.name(),
            workers = config.workers,
            "starting"
        );

        let table = config
            .strategy
            .is_shared()
            .then(|| Arc::new(SharedTable::with_capacity(config.max_connections)));

        let mut threads = Vec::with_capacity(listeners.len());
        for (id, listener) in listeners.into_iter().enumerate() {
            let registration = match &table {
                Some(table) => {
                    Registration::shared(Arc::clone(table), config.strategy.exclusive_wake())
                }
                None => Registration::port_sharing(config.max_connections),
            };
            let worker = Worker::new(
                id,
                listener,
                Arc::clone(&queues),
                registration,
                Arc::clone(&handler),
                config.max_events,
            );
            let handle = thread::Builder::new()
                .name(format!("worker-{id}"))
                .spawn(move || worker.run())
                .map_err(io_err("spawn worker"))?;
            threads.push(handle);
        }

        Ok(ServerHandle {
            local_addr,
            threads,
        })
    }
}

pub struct ServerHandle {
    local_addr: SocketAddr,
    threads: Vec<JoinHandle<io::Result<()>>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn workers(&self) -> usize {
        self.threads.len()
    }

    /// Wait for every worker; workers only return if their queue fails.
    pub fn join(self) -> Result<(), ServerError> {
        for (worker, handle) in self.threads.into_iter().enumerate() {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(source)) => return Err(ServerError::WorkerFailed { worker, source }),
                Err(_) => return Err(ServerError::WorkerPanicked { worker }),
            }
        }
        Ok(())
    }
}
