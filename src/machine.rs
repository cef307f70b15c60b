//! Per-connection protocol state machine.
//!
//! `Connection::drive` runs the request cycle
//! `Header -> Extra -> Key -> Value -> Process -> Response` as far as the
//! socket allows. A `WouldBlock` anywhere leaves `state` where it is and the
//! next call picks up at exactly that step. After a response, the loop starts
//! the next request immediately when a full header is already buffered, so
//! pipelined requests are answered in order without another readiness event.

use std::io::{Read, Write};

use thiserror::Error;

use crate::constants::HEADER_LEN;
use crate::handler::{Reply, Request, RequestHandler};
use crate::metrics;
use crate::protocol::{Header, Opcode, ProtocolError, Status};
use crate::stream::{BufferedStream, Progress, StreamError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Header,
    Extra,
    Key,
    Value,
    Process,
    Response,
}

/// Result of one `drive` call that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drive {
    /// Waiting for the socket; call again on the next readiness event.
    Suspended,
    /// Peer closed; destroy the connection.
    Closed,
}

#[derive(Debug, Error)]
pub enum ConnError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

fn settle(progress: Progress) -> Option<Drive> {
    match progress {
        Progress::Done => None,
        Progress::WouldBlock => Some(Drive::Suspended),
        Progress::Closed => Some(Drive::Closed),
    }
}

pub struct Connection<S> {
    stream: BufferedStream<S>,
    state: State,
    header: Header,
    opcode: Opcode,
    value_len: usize,
    response: Vec<u8>,
    write_armed: bool,
}

impl<S: Read + Write> Connection<S> {
    pub fn new(io: S) -> Self {
        Self::from_stream(BufferedStream::new(io))
    }

    pub fn from_stream(stream: BufferedStream<S>) -> Self {
        Self {
            stream,
            state: State::Header,
            header: Header::default(),
            opcode: Opcode::Get,
            value_len: 0,
            response: Vec::with_capacity(HEADER_LEN),
            write_armed: false,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Most recently decoded request header.
    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn stream(&self) -> &BufferedStream<S> {
        &self.stream
    }

    pub fn get_ref(&self) -> &S {
        self.stream.get_ref()
    }

    pub fn get_mut(&mut self) -> &mut S {
        self.stream.get_mut()
    }

    /// Suspended in the middle of writing a response.
    pub fn wants_writable(&self) -> bool {
        self.state == State::Response
    }

    /// Whether the registration currently includes write interest.
    pub fn write_armed(&self) -> bool {
        self.write_armed
    }

    pub fn set_write_armed(&mut self, armed: bool) {
        self.write_armed = armed;
    }

    /// Advance as far as the socket allows.
    ///
    /// # Errors
    /// `Protocol` for malformed or unsupported requests (a best-effort error
    /// response has been attempted when the framing allows one), `Stream` for
    /// unexpected OS errors. Either way the connection must be destroyed.
    pub fn drive<H>(&mut self, handler: &H, worker: usize) -> Result<Drive, ConnError>
    where
        H: RequestHandler + ?Sized,
    {
        let result = self.run(handler, worker);
        match &result {
            Err(ConnError::Protocol(e)) => {
                metrics::inc_protocol_errors();
                if let Some(status) = e.reply_status() {
                    self.reject(status);
                }
            }
            Err(ConnError::Stream(StreamError::Oversized { .. })) => {
                metrics::inc_protocol_errors();
                self.reject(Status::ValueTooLarge);
            }
            _ => {}
        }
        result
    }

    fn run<H>(&mut self, handler: &H, worker: usize) -> Result<Drive, ConnError>
    where
        H: RequestHandler + ?Sized,
    {
        loop {
            match self.state {
                State::Header => {
                    let mut raw = [0u8; HEADER_LEN];
                    if let Some(drive) = settle(self.stream.receive_exact(&mut raw)?) {
                        return Ok(drive);
                    }
                    self.header = Header::decode(&raw)?;
                    self.opcode = self.header.validate_request()?;
                    self.value_len = match self.opcode {
                        Opcode::Set => self.header.value_len()?,
                        Opcode::Get => 0,
                    };
                    self.state = State::Extra;
                }
                State::Extra => {
                    let n = usize::from(self.header.extra_len);
                    if let Some(drive) = settle(self.stream.discard_exact(n)?) {
                        return Ok(drive);
                    }
                    self.state = State::Key;
                }
                State::Key => {
                    let n = usize::from(self.header.key_len);
                    if let Some(drive) = settle(self.stream.discard_exact(n)?) {
                        return Ok(drive);
                    }
                    self.state = State::Value;
                }
                State::Value => {
                    if self.value_len > 0 {
                        if let Some(drive) = settle(self.stream.discard_exact(self.value_len)?) {
                            return Ok(drive);
                        }
                    }
                    self.state = State::Process;
                }
                State::Process => {
                    let request = Request::from_header(&self.header, self.opcode, self.value_len);
                    let reply = handler.process_request(worker, &request);
                    metrics::inc_requests();
                    self.encode_response(&reply);
                    self.state = State::Response;
                }
                State::Response => {
                    if let Some(drive) = settle(self.stream.send_exact(&self.response)?) {
                        return Ok(drive);
                    }
                    self.state = State::Header;
                    if self.stream.available() < HEADER_LEN {
                        return Ok(Drive::Suspended);
                    }
                }
            }
        }
    }

    fn encode_response(&mut self, reply: &Reply) {
        let extras = &reply.extras[..reply.extras.len().min(usize::from(u8::MAX))];
        let body_len = extras.len() + reply.value.len();
        let header = self
            .header
            .response(reply.status, extras.len() as u8, body_len as u32);

        self.response.clear();
        self.response.extend_from_slice(&header.encode());
        self.response.extend_from_slice(extras);
        self.response.extend_from_slice(&reply.value);
    }

    /// One non-blocking attempt at an error response; the caller closes afterwards.
    fn reject(&mut self, status: Status) {
        let header = self.header.response(status, 0, 0);
        self.stream.send_once(&header.encode());
    }
}
