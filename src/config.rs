//! Server sizing and operational configuration.
//!
//! Fixed resource limits are constants; the per-run choices (address, dispatch
//! strategy, worker count) live in `ServerConfig`.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use thiserror::Error;

use crate::constants::HEADER_LEN;

/// Per-connection receive buffer size (bytes).
pub const BUFFER_CAPACITY: usize = 2048;

/// Scratch sink for discarded bytes that were not already buffered.
pub const DISCARD_SCRATCH: usize = 2048;

/// Largest declared `body_len` accepted before the request is rejected.
pub const MAX_BODY_LEN: usize = DISCARD_SCRATCH;

/// Upper bound on worker threads, regardless of detected CPUs.
pub const MAX_WORKERS: usize = 64;

/// Default events returned per `epoll_wait`.
pub const MAX_EVENTS: usize = 1024;

/// Default max concurrent connections per table. Slot index must fit in the
/// low 32 bits of an event token.
pub const MAX_CONNECTIONS: usize = 65536;

pub const BACKLOG: i32 = 8192;

pub const DEFAULT_PORT: u16 = 11211;

const _: () = assert!(BUFFER_CAPACITY >= HEADER_LEN, "buffer must hold a header");
const _: () = assert!(
    MAX_BODY_LEN <= DISCARD_SCRATCH,
    "any discard segment must fit the scratch sink"
);
const _: () = assert!(
    MAX_CONNECTIONS < u32::MAX as usize,
    "slot index must fit in u32"
);

/// Which worker queues observe a connection's readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum DispatchStrategy {
    /// One listener per worker with kernel load-balanced accept; a connection
    /// lives only in its accepting worker's queue.
    #[default]
    PortSharing,
    /// Every connection registered into every worker's queue; a per-connection
    /// try-lock decides who drives it.
    Shared,
    /// As `Shared`, with `EPOLLEXCLUSIVE` to wake one waiter per event.
    SharedExclusive,
}

impl DispatchStrategy {
    pub fn is_shared(self) -> bool {
        !matches!(self, DispatchStrategy::PortSharing)
    }

    pub fn exclusive_wake(self) -> bool {
        matches!(self, DispatchStrategy::SharedExclusive)
    }

    pub fn name(self) -> &'static str {
        match self {
            DispatchStrategy::PortSharing => "port-sharing",
            DispatchStrategy::Shared => "shared",
            DispatchStrategy::SharedExclusive => "shared-exclusive",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("worker count must be at least 1")]
    NoWorkers,
    #[error("worker count {requested} exceeds maximum {max}")]
    TooManyWorkers { requested: usize, max: usize },
    #[error("max events per wait must be at least 1")]
    NoEvents,
    #[error("max connections must be between 1 and {max}, got {requested}")]
    BadConnectionLimit { requested: usize, max: usize },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub strategy: DispatchStrategy,
    pub workers: usize,
    pub max_events: usize,
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DEFAULT_PORT).into(),
            strategy: DispatchStrategy::default(),
            workers: 1,
            max_events: MAX_EVENTS,
            max_connections: MAX_CONNECTIONS,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.workers > MAX_WORKERS {
            return Err(ConfigError::TooManyWorkers {
                requested: self.workers,
                max: MAX_WORKERS,
            });
        }
        if self.max_events == 0 {
            return Err(ConfigError::NoEvents);
        }
        if self.max_connections == 0 || self.max_connections > MAX_CONNECTIONS {
            return Err(ConfigError::BadConnectionLimit {
                requested: self.max_connections,
                max: MAX_CONNECTIONS,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ServerConfig::default();
        assert_eq!(config.addr.port(), DEFAULT_PORT);
        assert_eq!(config.strategy, DispatchStrategy::PortSharing);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn zero_workers_rejected() {
        let config = ServerConfig {
            workers: 0,
            ..ServerConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NoWorkers));
    }

    #[test]
    fn worker_upper_bound_enforced() {
        let config = ServerConfig {
            workers: MAX_WORKERS + 1,
            ..ServerConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::TooManyWorkers {
                requested: MAX_WORKERS + 1,
                max: MAX_WORKERS
            })
        );
    }

    #[test]
    fn zero_events_and_connections_rejected() {
        let config = ServerConfig {
            max_events: 0,
            ..ServerConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NoEvents));

        let config = ServerConfig {
            max_connections: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BadConnectionLimit { requested: 0, .. })
        ));
    }

    #[test]
    fn strategy_flags() {
        assert!(!DispatchStrategy::PortSharing.is_shared());
        assert!(DispatchStrategy::Shared.is_shared());
        assert!(!DispatchStrategy::Shared.exclusive_wake());
        assert!(DispatchStrategy::SharedExclusive.is_shared());
        assert!(DispatchStrategy::SharedExclusive.exclusive_wake());
    }
}
