use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Instant;

use anyhow::{Context, Result, bail, ensure};
use clap::{Parser, Subcommand};

use herdkv::config::DEFAULT_PORT;
use herdkv::constants::HEADER_LEN;
use herdkv::protocol::{Header, Opcode, Status};

#[derive(Parser)]
#[command(about = "Test client for the herdkv front-end")]
struct Args {
    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// One fetch and one store, each answered before the next (default)
    Smoke,
    /// Write many store/fetch pairs in one go, then read every response in order
    Pipeline {
        #[arg(short, long, default_value_t = 1000)]
        requests: usize,
    },
    /// Throughput with concurrent pipelined connections
    Bench {
        #[arg(short, long, default_value_t = 4)]
        connections: usize,
        /// Requests per connection
        #[arg(short, long, default_value_t = 100_000)]
        requests: usize,
    },
}

fn fetch(key: &[u8], opaque: u32) -> Vec<u8> {
    let mut header = Header::request(Opcode::Get, key.len() as u16, 0, 0);
    header.opaque = opaque;
    let mut buf = header.encode().to_vec();
    buf.extend_from_slice(key);
    buf
}

fn store(key: &[u8], value: &[u8], opaque: u32) -> Vec<u8> {
    // flags (4) + expiry (4)
    let extras = [0u8; 8];
    let mut header = Header::request(Opcode::Set, key.len() as u16, 8, value.len() as u32);
    header.opaque = opaque;
    let mut buf = header.encode().to_vec();
    buf.extend_from_slice(&extras);
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    buf
}

/// Read one response, skipping its body, and check it answers `opaque`.
fn read_response(stream: &mut TcpStream, opaque: u32) -> Result<Header> {
    let mut raw = [0u8; HEADER_LEN];
    stream
        .read_exact(&mut raw)
        .context("failed to read response header")?;
    let header = Header::decode_response(&raw)?;
    ensure!(
        header.opaque == opaque,
        "response opaque={:#x} does not match request {:#x} (reordered or lost response)",
        header.opaque,
        opaque
    );
    let mut body = vec![0u8; header.body_len as usize];
    stream
        .read_exact(&mut body)
        .context("failed to read response body")?;
    Ok(header)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let addr = format!("{}:{}", args.host, args.port);

    match args.command.unwrap_or(Command::Smoke) {
        Command::Smoke => smoke_test(&addr),
        Command::Pipeline { requests } => pipeline_test(&addr, requests),
        Command::Bench {
            connections,
            requests,
        } => bench_test(&addr, connections, requests),
    }
}

fn smoke_test(addr: &str) -> Result<()> {
    eprintln!("smoke test: connecting to {addr}");
    let mut stream = TcpStream::connect(addr).context("failed to connect")?;

    stream.write_all(&fetch(b"foo", 1))?;
    let header = read_response(&mut stream, 1)?;
    eprintln!("  fetch: status={:?}", Status::from_u16(header.status));

    stream.write_all(&store(b"foo", b"hello", 2))?;
    let header = read_response(&mut stream, 2)?;
    eprintln!("  store: status={:?}", Status::from_u16(header.status));

    eprintln!("smoke test: PASSED");
    Ok(())
}

fn pipeline_test(addr: &str, num_requests: usize) -> Result<()> {
    eprintln!("pipeline test: {num_requests} requests in one write to {addr}");
    let mut stream = TcpStream::connect(addr).context("failed to connect")?;

    let mut batch = Vec::new();
    for i in 0..num_requests {
        let opaque = i as u32;
        if i % 2 == 0 {
            batch.extend_from_slice(&store(b"key", b"value", opaque));
        } else {
            batch.extend_from_slice(&fetch(b"key", opaque));
        }
    }
    let writer = {
        let mut w = stream.try_clone().context("clone failed")?;
        std::thread::spawn(move || w.write_all(&batch))
    };

    for i in 0..num_requests {
        read_response(&mut stream, i as u32).with_context(|| format!("request {i}"))?;
    }
    match writer.join() {
        Ok(result) => result.context("write failed")?,
        Err(_) => bail!("writer panicked"),
    }

    eprintln!("pipeline test: PASSED ({num_requests} requests)");
    Ok(())
}

fn bench_test(addr: &str, num_connections: usize, requests_per_conn: usize) -> Result<()> {
    eprintln!(
        "bench: {num_connections} connections x {requests_per_conn} requests (pipelined) to {addr}"
    );
    let request = fetch(b"bench-key", 0);
    let start = Instant::now();

    let handles: Vec<_> = (0..num_connections)
        .map(|_| {
            let addr = addr.to_string();
            let request = request.clone();
            std::thread::spawn(move || -> Result<()> {
                let stream = TcpStream::connect(&addr).context("failed to connect")?;
                stream.set_nodelay(true)?;
                let mut writer = stream.try_clone()?;
                let mut reader = stream;

                let write_handle = std::thread::spawn(move || -> std::io::Result<()> {
                    for _ in 0..requests_per_conn {
                        writer.write_all(&request)?;
                    }
                    Ok(())
                });

                // Stub responses are header-only.
                let mut buf = vec![0u8; HEADER_LEN * 1024];
                let mut remaining = requests_per_conn * HEADER_LEN;
                while remaining > 0 {
                    let to_read = remaining.min(buf.len());
                    let n = reader.read(&mut buf[..to_read])?;
                    if n == 0 {
                        bail!("connection closed with {remaining} bytes outstanding");
                    }
                    remaining -= n;
                }

                match write_handle.join() {
                    Ok(result) => Ok(result?),
                    Err(_) => bail!("writer panicked"),
                }
            })
        })
        .collect();

    for h in handles {
        match h.join() {
            Ok(result) => result?,
            Err(_) => bail!("connection thread panicked"),
        }
    }

    let elapsed = start.elapsed();
    let total = num_connections * requests_per_conn;
    eprintln!(
        "bench: {} requests in {:.2}s = {:.0} QPS",
        total,
        elapsed.as_secs_f64(),
        total as f64 / elapsed.as_secs_f64()
    );
    Ok(())
}
