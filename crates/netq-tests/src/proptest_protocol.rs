//! Property-Based Tests for the command codec and frame layer

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use netq_remoting::protocol::{decode_command, encode_command, frame_codec, LENGTH_FIELD_LENGTH};
use netq_remoting::{Command, CommandFlags, RemotingError};
use proptest::prelude::*;
use tokio_util::codec::{Decoder, Encoder};

fn arb_command() -> impl Strategy<Value = Command> {
    (
        any::<i32>(),
        any::<i32>(),
        any::<u8>(),
        ".{0,32}",
        prop::collection::hash_map("[a-z_]{1,12}", ".{0,16}", 0..6),
        prop::collection::vec(any::<u8>(), 0..512),
        any::<u8>(),
    )
        .prop_map(|(code, correlation_id, flags, remark, headers, body, serialize_type)| Command {
            code,
            correlation_id,
            flags: CommandFlags::from_bits(flags),
            remark,
            headers,
            body: Bytes::from(body),
            serialize_type,
        })
}

fn frame(payload: Bytes) -> BytesMut {
    let mut buf = BytesMut::new();
    frame_codec().encode(payload, &mut buf).unwrap();
    buf
}

#[test]
fn test_request_layout_is_big_endian_fixint() {
    let payload = encode_command(&Command::request(1, b"ab".to_vec())).unwrap();
    // code, correlation_id, flags, remark len, header count, body len, body, serialize_type
    assert_eq!(payload.len(), 4 + 4 + 1 + 8 + 8 + 8 + 2 + 1);
    assert_eq!(&payload[0..4], &[0, 0, 0, 1]);
    assert_eq!(&payload[4..8], &[0, 0, 0, 0]);
    assert_eq!(payload[8], 0);
    assert_eq!(&payload[25..33], &[0, 0, 0, 0, 0, 0, 0, 2]);
    assert_eq!(&payload[33..35], b"ab");
}

#[test]
fn test_response_flag_on_the_wire() {
    let mut response = Command::response(0, Bytes::new());
    response.correlation_id = 7;
    let payload = encode_command(&response).unwrap();
    assert_eq!(&payload[4..8], &[0, 0, 0, 7]);
    assert_eq!(payload[8], CommandFlags::RESPONSE.bits());
}

#[test]
fn test_empty_payload_is_decode_error() {
    assert!(matches!(decode_command(&[]), Err(RemotingError::ProtocolDecode { .. })));
}

#[test]
fn test_oversized_header_count_is_decode_error() {
    let mut payload = BytesMut::new();
    payload.put_i32(1);
    payload.put_i32(1);
    payload.put_u8(0);
    payload.put_u64(0);
    payload.put_u64(u64::MAX);
    assert!(matches!(decode_command(&payload), Err(RemotingError::ProtocolDecode { .. })));
}

#[test]
fn test_headers_survive_roundtrip() {
    let mut headers = HashMap::new();
    headers.insert("trace".to_string(), "abc".to_string());
    let command = Command::request(5, Bytes::new()).with_header("trace", "abc");
    let decoded = decode_command(&encode_command(&command).unwrap()).unwrap();
    assert_eq!(decoded.headers, headers);
}

proptest! {
    #[test]
    fn prop_command_roundtrip(command in arb_command()) {
        let payload = encode_command(&command).unwrap();
        let decoded = decode_command(&payload).unwrap();
        prop_assert_eq!(decoded, command);
    }

    #[test]
    fn prop_truncated_payload_fails(command in arb_command(), cut in any::<prop::sample::Index>()) {
        let payload = encode_command(&command).unwrap();
        let cut = cut.index(payload.len());
        let result = decode_command(&payload[..cut]);
        let is_decode_err = matches!(result, Err(RemotingError::ProtocolDecode { .. }));
        prop_assert!(is_decode_err);
    }

    #[test]
    fn prop_length_prefix_matches_payload(command in arb_command()) {
        let payload = encode_command(&command).unwrap();
        let framed = frame(payload.clone());
        prop_assert_eq!(framed.len(), LENGTH_FIELD_LENGTH + payload.len());
        prop_assert_eq!(&framed[..LENGTH_FIELD_LENGTH], &(payload.len() as u32).to_be_bytes()[..]);
    }

    #[test]
    fn prop_split_frames_reassemble(
        commands in prop::collection::vec(arb_command(), 1..5),
        chunk in 1usize..64,
    ) {
        let mut wire = BytesMut::new();
        for command in &commands {
            wire.extend_from_slice(&frame(encode_command(command).unwrap()));
        }

        let mut codec = frame_codec();
        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        for piece in wire.chunks(chunk) {
            buf.extend_from_slice(piece);
            while let Some(payload) = codec.decode(&mut buf).unwrap() {
                decoded.push(decode_command(&payload).unwrap());
            }
        }
        prop_assert!(buf.is_empty());
        prop_assert_eq!(decoded, commands);
    }

    #[test]
    fn prop_flags_with_without(bits in any::<u8>()) {
        let flags = CommandFlags::from_bits(bits);
        prop_assert!(flags.with(CommandFlags::ONEWAY).contains(CommandFlags::ONEWAY));
        prop_assert!(!flags.without(CommandFlags::RESPONSE).contains(CommandFlags::RESPONSE));
        prop_assert_eq!(
            flags.with(CommandFlags::RESPONSE).without(CommandFlags::RESPONSE).bits(),
            bits & !CommandFlags::RESPONSE.bits()
        );
    }
}
