//! Library crate for herdkv: header codec, buffered stream, protocol state
//! machine, shared connection table and the epoll dispatch layer.
//!
//! The binary (`main.rs`) only parses arguments, installs logging and starts
//! a `server::Server`; everything below the socket is reachable from tests
//! through an in-memory transport.

pub mod config;
pub mod conn_table;
pub mod constants;
pub mod dispatch;
pub mod epoll;
pub mod handler;
pub mod machine;
pub mod metrics;
pub mod protocol;
pub mod server;
pub mod stream;
