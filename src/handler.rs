//! Seam to the storage layer: one call per worker at startup, one call per
//! fully received request.

use crate::protocol::{Header, Opcode, Status};

/// What the worker knows about a request once its payload has been consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub opcode: Opcode,
    pub key_len: u16,
    pub extra_len: u8,
    pub value_len: usize,
    pub opaque: u32,
    pub cas: u64,
}

impl Request {
    pub fn from_header(header: &Header, opcode: Opcode, value_len: usize) -> Self {
        Self {
            opcode,
            key_len: header.key_len,
            extra_len: header.extra_len,
            value_len,
            opaque: header.opaque,
            cas: header.cas,
        }
    }
}

/// Handler result; becomes the response header status and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: Status,
    pub extras: Vec<u8>,
    pub value: Vec<u8>,
}

impl Reply {
    pub fn status(status: Status) -> Self {
        Self {
            status,
            extras: Vec::new(),
            value: Vec::new(),
        }
    }
}

/// Storage-side collaborator. Shared by all workers.
pub trait RequestHandler: Send + Sync {
    /// Per-thread setup, called once on each worker before it serves.
    fn thread_init(&self, _worker: usize) {}

    fn process_request(&self, worker: usize, request: &Request) -> Reply;
}

/// Stub store: every request misses.
#[derive(Debug, Default, Clone, Copy)]
pub struct NotFound;

impl RequestHandler for NotFound {
    fn process_request(&self, _worker: usize, _request: &Request) -> Reply {
        Reply::status(Status::KeyNotFound)
    }
}
