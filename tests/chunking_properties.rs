//! Property tests: the protocol machine and buffered stream are insensitive to
//! how the byte stream is fragmented across reads.

mod common;

use proptest::prelude::*;

use common::{ScriptedIo, fetch_request, parse_responses, store_request};
use herdkv::constants::{HEADER_LEN, RESPONSE_MAGIC, STATUS_KEY_NOT_FOUND};
use herdkv::handler::NotFound;
use herdkv::machine::{ConnError, Connection, Drive, State};
use herdkv::protocol::{Header, Opcode, ProtocolError};
use herdkv::stream::{BufferedStream, Progress};

#[derive(Debug, Clone)]
enum Req {
    Fetch { key: Vec<u8> },
    Store { extras: Vec<u8>, key: Vec<u8>, value: Vec<u8> },
}

fn req_strategy() -> impl Strategy<Value = Req> {
    let key = prop::collection::vec(any::<u8>(), 1..40);
    prop_oneof![
        key.clone().prop_map(|key| Req::Fetch { key }),
        (
            prop::collection::vec(any::<u8>(), 0..=8),
            key,
            prop::collection::vec(any::<u8>(), 0..300),
        )
            .prop_map(|(extras, key, value)| Req::Store { extras, key, value }),
    ]
}

fn encode(reqs: &[Req]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for (i, req) in reqs.iter().enumerate() {
        let opaque = i as u32;
        match req {
            Req::Fetch { key } => bytes.extend_from_slice(&fetch_request(key, opaque)),
            Req::Store { extras, key, value } => {
                bytes.extend_from_slice(&store_request(extras, key, value, opaque))
            }
        }
    }
    bytes
}

/// Drive until every delivery is consumed and the machine is idle.
fn drive_to_idle(conn: &mut Connection<ScriptedIo>) {
    for _ in 0..100_000 {
        assert_eq!(conn.drive(&NotFound, 0).unwrap(), Drive::Suspended);
        if conn.get_ref().pending_deliveries() == 0
            && conn.state() == State::Header
            && conn.stream().available() < HEADER_LEN
        {
            // One more call observes the trailing WouldBlock.
            assert_eq!(conn.drive(&NotFound, 0).unwrap(), Drive::Suspended);
            if conn.get_ref().pending_deliveries() == 0 {
                return;
            }
        }
    }
    panic!("machine did not go idle");
}

proptest! {
    #[test]
    fn every_request_answered_once_in_order(
        reqs in prop::collection::vec(req_strategy(), 1..20),
        cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..30),
        write_chunk in prop::option::of(1usize..30),
    ) {
        let bytes = encode(&reqs);
        let cuts: Vec<usize> = cuts.iter().map(|ix| ix.index(bytes.len())).collect();
        let mut io = ScriptedIo::chunked(&bytes, &cuts);
        io.write_chunk = write_chunk;
        let mut conn = Connection::new(io);

        drive_to_idle(&mut conn);

        let responses = parse_responses(&conn.get_ref().written);
        prop_assert_eq!(responses.len(), reqs.len());
        for (i, (resp, req)) in responses.iter().zip(&reqs).enumerate() {
            prop_assert_eq!(resp.magic, RESPONSE_MAGIC);
            prop_assert_eq!(resp.status, STATUS_KEY_NOT_FOUND);
            prop_assert_eq!(resp.body_len, 0);
            prop_assert_eq!(resp.opaque, i as u32);
            let opcode = match req {
                Req::Fetch { .. } => Opcode::Get,
                Req::Store { .. } => Opcode::Set,
            };
            prop_assert_eq!(resp.opcode, opcode.to_u8());
        }
    }

    #[test]
    fn compaction_never_reorders_unread_bytes(
        input in prop::collection::vec(any::<u8>(), 1..600),
        capacity in 32usize..128,
        ops in prop::collection::vec((any::<bool>(), 0usize..32), 1..60),
        cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..20),
    ) {
        let cuts: Vec<usize> = cuts.iter().map(|ix| ix.index(input.len())).collect();
        let mut stream = BufferedStream::with_capacity(ScriptedIo::chunked(&input, &cuts), capacity);

        let mut pos = 0;
        for (receive, size) in ops {
            if pos + size > input.len() {
                break;
            }
            let mut out = vec![0u8; size];
            let mut attempts = 0;
            loop {
                let progress = if receive {
                    stream.receive_exact(&mut out).unwrap()
                } else {
                    stream.discard_exact(size).unwrap()
                };
                match progress {
                    Progress::Done => break,
                    Progress::WouldBlock => attempts += 1,
                    Progress::Closed => unreachable!("scripted input never closes"),
                }
                prop_assert!(attempts < 10_000, "no progress");
            }
            if receive {
                prop_assert_eq!(&out[..], &input[pos..pos + size]);
            }
            pos += size;
        }
    }
}

#[test]
fn header_reassembled_at_every_split_point() {
    let request = fetch_request(b"abc", 9);
    for split in 1..HEADER_LEN {
        let io = ScriptedIo::chunked(&request, &[split]);
        let mut conn = Connection::new(io);
        drive_to_idle(&mut conn);

        let responses = parse_responses(&conn.get_ref().written);
        assert_eq!(responses.len(), 1, "split at {split}");
        assert_eq!(responses[0].opaque, 9);
    }
}

#[test]
fn fetch_scenario_matches_wire_format() {
    let request = fetch_request(b"foo", 0);
    let header = Header::from_bytes(request[..HEADER_LEN].try_into().unwrap());
    assert_eq!(header.key_len, 3);
    assert_eq!(header.extra_len, 0);
    assert_eq!(header.body_len, 3);

    let mut io = ScriptedIo::new();
    io.deliver(&request);
    let mut conn = Connection::new(io);
    drive_to_idle(&mut conn);

    let written = &conn.get_ref().written;
    assert_eq!(written.len(), HEADER_LEN);
    let resp = Header::decode_response(written[..].try_into().unwrap()).unwrap();
    assert_eq!(resp.status, STATUS_KEY_NOT_FOUND);
    assert_eq!(resp.body_len, 0);
}

#[test]
fn pipelined_pair_answered_without_second_notification() {
    let mut bytes = store_request(&[0u8; 8], b"abc", b"hello", 1);
    bytes.extend_from_slice(&fetch_request(b"abc", 2));
    let mut io = ScriptedIo::new();
    io.deliver(&bytes);
    let mut conn = Connection::new(io);

    // A single drive answers both.
    assert_eq!(conn.drive(&NotFound, 0).unwrap(), Drive::Suspended);
    let responses = parse_responses(&conn.get_ref().written);
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0].opaque, 1);
    assert_eq!(responses[0].opcode, Opcode::Set.to_u8());
    assert_eq!(responses[1].opaque, 2);
    assert_eq!(responses[1].opcode, Opcode::Get.to_u8());
}

#[test]
fn oversized_value_is_rejected_not_buffered() {
    let mut header = Header::request(Opcode::Set, 3, 8, 0);
    header.body_len = 64 * 1024;
    let mut io = ScriptedIo::new();
    io.deliver(&header.encode());
    let mut conn = Connection::new(io);

    match conn.drive(&NotFound, 0) {
        Err(ConnError::Protocol(ProtocolError::Oversized { declared, .. })) => {
            assert_eq!(declared, 64 * 1024)
        }
        other => panic!("expected oversized rejection, got {other:?}"),
    }
}

#[test]
fn orderly_close_mid_request_reports_closed() {
    let request = store_request(&[], b"k", b"value", 0);
    let mut io = ScriptedIo::new();
    io.deliver(&request[..HEADER_LEN + 2]);
    io.close();
    let mut conn = Connection::new(io);

    assert_eq!(conn.drive(&NotFound, 0).unwrap(), Drive::Suspended);
    assert_eq!(conn.drive(&NotFound, 0).unwrap(), Drive::Closed);
}
