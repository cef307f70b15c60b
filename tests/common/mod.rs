#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use herdkv::config::{DispatchStrategy, ServerConfig};
use herdkv::constants::HEADER_LEN;
use herdkv::handler::NotFound;
use herdkv::protocol::{Header, Opcode};
use herdkv::server::Server;

/// In-memory transport: reads are served from scripted deliveries (a
/// `WouldBlock` between each), writes are collected.
#[derive(Default)]
pub struct ScriptedIo {
    deliveries: VecDeque<Vec<u8>>,
    blocked: bool,
    eof: bool,
    pub written: Vec<u8>,
    /// Max bytes accepted per write call; `None` accepts everything.
    pub write_chunk: Option<usize>,
}

impl ScriptedIo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split `bytes` at `cuts` into separate deliveries.
    pub fn chunked(bytes: &[u8], cuts: &[usize]) -> Self {
        let mut io = Self::new();
        let mut start = 0;
        let mut cuts: Vec<usize> = cuts.iter().map(|&c| c.min(bytes.len())).collect();
        cuts.sort_unstable();
        cuts.dedup();
        for cut in cuts {
            if cut > start {
                io.deliver(&bytes[start..cut]);
                start = cut;
            }
        }
        if start < bytes.len() {
            io.deliver(&bytes[start..]);
        }
        io
    }

    pub fn deliver(&mut self, bytes: &[u8]) {
        self.deliveries.push_back(bytes.to_vec());
    }

    pub fn close(&mut self) {
        self.eof = true;
    }

    pub fn pending_deliveries(&self) -> usize {
        self.deliveries.len()
    }
}

impl Read for ScriptedIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // Each delivery is separated from the next by one WouldBlock.
        if self.blocked {
            self.blocked = false;
            return Err(ErrorKind::WouldBlock.into());
        }
        match self.deliveries.pop_front() {
            Some(mut data) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    data.drain(..n);
                    self.deliveries.push_front(data);
                } else {
                    self.blocked = true;
                }
                Ok(n)
            }
            None if self.eof => Ok(0),
            None => Err(ErrorKind::WouldBlock.into()),
        }
    }
}

impl Write for ScriptedIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.write_chunk.map_or(buf.len(), |c| c.min(buf.len()));
        self.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn fetch_request(key: &[u8], opaque: u32) -> Vec<u8> {
    let mut header = Header::request(Opcode::Get, key.len() as u16, 0, 0);
    header.opaque = opaque;
    let mut buf = header.encode().to_vec();
    buf.extend_from_slice(key);
    buf
}

pub fn store_request(extras: &[u8], key: &[u8], value: &[u8], opaque: u32) -> Vec<u8> {
    let mut header = Header::request(
        Opcode::Set,
        key.len() as u16,
        extras.len() as u8,
        value.len() as u32,
    );
    header.opaque = opaque;
    let mut buf = header.encode().to_vec();
    buf.extend_from_slice(extras);
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    buf
}

/// Decode a run of header-only responses.
pub fn parse_responses(bytes: &[u8]) -> Vec<Header> {
    assert_eq!(bytes.len() % HEADER_LEN, 0, "trailing partial response");
    bytes
        .chunks_exact(HEADER_LEN)
        .map(|chunk| {
            let raw: &[u8; HEADER_LEN] = chunk.try_into().unwrap();
            Header::decode_response(raw).expect("response magic")
        })
        .collect()
}

/// Start a stub server on an ephemeral loopback port.
pub fn start_server(strategy: DispatchStrategy, workers: usize) -> SocketAddr {
    start_server_with(ServerConfig {
        addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0).into(),
        strategy,
        workers,
        ..ServerConfig::default()
    })
}

pub fn start_server_with(config: ServerConfig) -> SocketAddr {
    let server = Server::bind(config, Arc::new(NotFound)).expect("bind");
    let handle = server.spawn().expect("spawn");
    let addr = handle.local_addr();
    // Workers never return; the test process exits around them.
    std::mem::forget(handle);
    addr
}

pub fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");
    stream
}

pub fn read_header(stream: &mut TcpStream) -> Header {
    let mut raw = [0u8; HEADER_LEN];
    stream.read_exact(&mut raw).expect("response header");
    Header::decode_response(&raw).expect("response magic")
}

/// True once the server has closed the connection (EOF or reset).
pub fn closed_by_peer(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return true,
            Ok(_) => continue,
            Err(e) if e.kind() == ErrorKind::ConnectionReset => return true,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => return false,
        }
    }
}
