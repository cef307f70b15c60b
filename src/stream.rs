//! Buffered connection stream: exact-size receive, discard and send over a
//! non-blocking socket, hiding TCP fragmentation behind one fixed buffer.
//!
//! Every operation may return `WouldBlock` part-way through. Progress made
//! before that point is kept in the stream (buffered bytes, `discard_left`,
//! `sent`) so the caller resumes by repeating the same call with the same
//! argument on the next readiness notification.

use std::io::{self, ErrorKind, Read, Write};

use thiserror::Error;

use crate::config::{BUFFER_CAPACITY, DISCARD_SCRATCH};

/// Outcome of an exact-size operation that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The full requested size was received, discarded or sent.
    Done,
    /// No more data for now; call again with the same argument later.
    WouldBlock,
    /// Peer shut down or reset the connection.
    Closed,
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("{requested} bytes exceeds {capacity} byte limit")]
    Oversized { requested: usize, capacity: usize },

    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Fold an I/O error into the stream taxonomy. `Interrupted` is handled by callers.
fn classify(op: &'static str, err: io::Error) -> Result<Progress, StreamError> {
    match err.kind() {
        ErrorKind::WouldBlock => Ok(Progress::WouldBlock),
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::NotConnected
        | ErrorKind::UnexpectedEof => Ok(Progress::Closed),
        _ => Err(StreamError::Io { op, source: err }),
    }
}

pub struct BufferedStream<S> {
    io: S,
    buf: Box<[u8]>,
    head: usize,
    tail: usize,
    /// Bytes still owed by an in-progress `discard_exact`.
    discard_left: Option<usize>,
    /// Bytes of the current `send_exact` message already written.
    sent: usize,
}

impl<S: Read + Write> BufferedStream<S> {
    pub fn new(io: S) -> Self {
        Self::with_capacity(io, BUFFER_CAPACITY)
    }

    pub fn with_capacity(io: S, capacity: usize) -> Self {
        Self {
            io,
            buf: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
            discard_left: None,
            sent: 0,
        }
    }

    /// Unconsumed bytes currently buffered.
    pub fn available(&self) -> usize {
        self.tail - self.head
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn get_ref(&self) -> &S {
        &self.io
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.io
    }

    /// True while a `send_exact` is suspended part-way through a message.
    pub fn send_pending(&self) -> bool {
        self.sent > 0
    }

    /// Move unread bytes to offset 0 so the free space is contiguous.
    fn compact(&mut self) {
        if self.head == 0 {
            return;
        }
        self.buf.copy_within(self.head..self.tail, 0);
        self.tail -= self.head;
        self.head = 0;
    }

    /// One read appended at the tail. `Done` means at least one byte arrived.
    fn fill(&mut self) -> Result<Progress, StreamError> {
        loop {
            match self.io.read(&mut self.buf[self.tail..]) {
                Ok(0) => return Ok(Progress::Closed),
                Ok(n) => {
                    self.tail += n;
                    return Ok(Progress::Done);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return classify("recv", e),
            }
        }
    }

    /// Fill `out` with exactly `out.len()` bytes.
    ///
    /// # Errors
    /// `Oversized` if `out` is larger than the buffer; `Io` on unexpected OS errors.
    pub fn receive_exact(&mut self, out: &mut [u8]) -> Result<Progress, StreamError> {
        let n = out.len();
        if n > self.buf.len() {
            return Err(StreamError::Oversized {
                requested: n,
                capacity: self.buf.len(),
            });
        }

        if self.available() < n {
            self.compact();
            while self.tail < n {
                match self.fill()? {
                    Progress::Done => {}
                    other => return Ok(other),
                }
            }
        }

        out.copy_from_slice(&self.buf[self.head..self.head + n]);
        self.head += n;
        Ok(Progress::Done)
    }

    /// Skip exactly `n` bytes without keeping them.
    ///
    /// Buffered bytes are consumed first; the remainder is read into a bounded
    /// scratch sink and dropped.
    ///
    /// # Errors
    /// `Oversized` if the unbuffered remainder exceeds the scratch sink.
    pub fn discard_exact(&mut self, n: usize) -> Result<Progress, StreamError> {
        let mut left = self.discard_left.take().unwrap_or(n);

        let buffered = left.min(self.available());
        self.head += buffered;
        left -= buffered;
        if self.head == self.tail {
            self.head = 0;
            self.tail = 0;
        }
        if left == 0 {
            return Ok(Progress::Done);
        }
        if left > DISCARD_SCRATCH {
            return Err(StreamError::Oversized {
                requested: left,
                capacity: DISCARD_SCRATCH,
            });
        }

        let mut scratch = [0u8; DISCARD_SCRATCH];
        while left > 0 {
            match self.io.read(&mut scratch[..left]) {
                Ok(0) => return Ok(Progress::Closed),
                Ok(k) => left -= k,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    let progress = classify("recv", e)?;
                    if progress == Progress::WouldBlock {
                        self.discard_left = Some(left);
                    }
                    return Ok(progress);
                }
            }
        }
        Ok(Progress::Done)
    }

    /// Write all of `bytes`, tolerating partial writes.
    ///
    /// After `WouldBlock` the caller must pass the same `bytes` again; writing
    /// resumes at the offset already reached.
    pub fn send_exact(&mut self, bytes: &[u8]) -> Result<Progress, StreamError> {
        while self.sent < bytes.len() {
            match self.io.write(&bytes[self.sent..]) {
                Ok(0) => return Ok(Progress::Closed),
                Ok(n) => self.sent += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return classify("send", e),
            }
        }
        self.sent = 0;
        Ok(Progress::Done)
    }

    /// A single best-effort attempt to write `bytes`, abandoning any remainder.
    pub fn send_once(&mut self, bytes: &[u8]) {
        self.sent = 0;
        let _ = self.io.write(bytes);
    }
}
