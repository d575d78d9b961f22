// File: crates/mpwire/src/tests.rs
use crate::*;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;

// ============================================================================
//  HELPERS
// ============================================================================

fn add_request(msgid: u32) -> Envelope {
    Request::new(msgid, "add", vec![Value::from(2), Value::from(3)]).into()
}

fn raw(value: Value) -> Vec<u8> {
    codec::encode_value(&value).expect("Encoding failed")
}

fn decode_all(decoder: &mut StreamDecoder) -> Vec<Envelope> {
    let mut out = Vec::new();
    while let Some(env) = decoder.try_next().expect("Stream decode failed") {
        out.push(env);
    }
    out
}

// ============================================================================
//  ENVELOPES
// ============================================================================

#[test]
fn test_envelope_roundtrip_each_form() {
    let envelopes = vec![
        add_request(1),
        Response::success(1, Value::from(5)).into(),
        Notify::new("heartbeat", vec![Value::from("tick")]).into(),
    ];

    for env in envelopes {
        let bytes = encode(&env).unwrap();
        assert_eq!(decode(&bytes).unwrap(), env);
    }
}

#[test]
fn test_request_wire_layout() {
    let bytes = encode(&add_request(9)).unwrap();
    let expected = raw(Value::Array(vec![
        Value::from(0),
        Value::from(9),
        Value::from("add"),
        Value::Array(vec![Value::from(2), Value::from(3)]),
    ]));
    assert_eq!(bytes, expected);
}

#[test]
fn test_failure_response_wire_layout() {
    let res = Response::failure(4, Failure::method_not_found("missing"));
    let bytes = encode(&res.into()).unwrap();
    let expected = raw(Value::Array(vec![
        Value::from(1),
        Value::from(4),
        Value::Boolean(true),
        Value::Array(vec![Value::from(codes::METHOD_NOT_FOUND), Value::from("missing")]),
    ]));
    assert_eq!(bytes, expected);
}

#[test]
fn test_binary_method_name_is_accepted() {
    let bytes = raw(Value::Array(vec![
        Value::from(2),
        Value::Binary(b"heartbeat".to_vec()),
        Value::Array(vec![]),
    ]));
    match decode(&bytes).unwrap() {
        Envelope::Notify(note) => assert_eq!(note.method, "heartbeat"),
        other => panic!("Expected Notify, got {:?}", other),
    }
}

#[test]
fn test_unknown_tag_is_rejected() {
    let bytes = raw(Value::Array(vec![Value::from(7), Value::from("x")]));
    assert_eq!(decode(&bytes), Err(Error::UnknownTag(7)));
}

#[test]
fn test_malformed_shapes_are_protocol_violations() {
    let cases = vec![
        Value::from("not an array"),
        Value::Array(vec![]),
        Value::Array(vec![Value::from(0), Value::from(1), Value::from("m")]),
        Value::Array(vec![Value::from(0), Value::from(1), Value::from("m"), Value::from(3)]),
        Value::Array(vec![Value::from(0), Value::from(u64::from(u32::MAX) + 1), Value::from("m"), Value::Array(vec![])]),
        Value::Array(vec![Value::from(2), Value::from(17), Value::Array(vec![])]),
    ];

    for case in cases {
        match decode(&raw(case.clone())) {
            Err(Error::ProtocolViolation(_)) => {}
            other => panic!("Expected ProtocolViolation for {:?}, got {:?}", case, other),
        }
    }
}

#[test]
fn test_trailing_bytes_are_rejected() {
    let mut bytes = encode(&add_request(1)).unwrap();
    bytes.push(0xc0);
    assert!(matches!(decode(&bytes), Err(Error::ProtocolViolation(_))));
}

// ============================================================================
//  ERROR FIELD
// ============================================================================

fn response_with_error(error: Value, result: Value) -> Response {
    let bytes = raw(Value::Array(vec![Value::from(1), Value::from(3), error, result]));
    match decode(&bytes).unwrap() {
        Envelope::Response(res) => res,
        other => panic!("Expected Response, got {:?}", other),
    }
}

#[test]
fn test_error_field_nil_is_success() {
    let res = response_with_error(Value::Nil, Value::from(5));
    assert_eq!(res.payload().unwrap(), ErrorPayload::None);
    assert_eq!(res.into_result().unwrap(), Ok(Value::from(5)));
}

#[test]
fn test_error_field_false_is_success() {
    let res = response_with_error(Value::Boolean(false), Value::from("ok"));
    assert_eq!(res.error, ErrorField::Flag(false));
    assert_eq!(res.into_result().unwrap(), Ok(Value::from("ok")));
}

#[test]
fn test_error_field_true_carries_code_and_message() {
    let res = response_with_error(
        Value::Boolean(true),
        Value::Array(vec![Value::from(42), Value::from("bad input")]),
    );
    assert_eq!(res.into_result().unwrap(), Err(Failure::new(42, "bad input")));
}

#[test]
fn test_error_field_true_with_malformed_result() {
    let res = response_with_error(Value::Boolean(true), Value::from("bad input"));
    assert!(matches!(res.payload(), Err(Error::ProtocolViolation(_))));
}

#[test]
fn test_unrecognized_error_field() {
    let res = response_with_error(Value::from(5), Value::Nil);
    assert!(matches!(res.error, ErrorField::Unrecognized(_)));
    assert!(matches!(res.into_result(), Err(Error::ProtocolViolation(_))));
}

// ============================================================================
//  STREAM DECODER
// ============================================================================

#[test]
fn test_stream_multiple_envelopes_in_one_chunk() {
    let mut bytes = encode(&add_request(1)).unwrap();
    bytes.extend(encode(&add_request(2)).unwrap());
    bytes.extend(encode(&Notify::new("heartbeat", vec![]).into()).unwrap());

    let mut decoder = StreamDecoder::new();
    decoder.feed(&bytes);

    let envs = decode_all(&mut decoder);
    assert_eq!(envs.len(), 3);
    assert_eq!(envs[1], add_request(2));
    assert_eq!(decoder.buffered(), 0);
}

#[test]
fn test_stream_incomplete_message_waits_for_more() {
    let bytes = encode(&add_request(1)).unwrap();
    let (head, tail) = bytes.split_at(bytes.len() - 2);

    let mut decoder = StreamDecoder::new();
    decoder.feed(head);
    assert_eq!(decoder.try_next().unwrap(), None);
    assert_eq!(decoder.buffered(), head.len());

    decoder.feed(tail);
    assert_eq!(decoder.try_next().unwrap(), Some(add_request(1)));
    assert_eq!(decoder.try_next().unwrap(), None);
}

#[test]
fn test_stream_byte_at_a_time() {
    let env: Envelope = Response::failure(8, Failure::new(3, "nope")).into();
    let bytes = encode(&env).unwrap();

    let mut decoder = StreamDecoder::new();
    let mut decoded = Vec::new();
    for byte in &bytes {
        decoder.feed(std::slice::from_ref(byte));
        decoded.extend(decode_all(&mut decoder));
    }
    assert_eq!(decoded, vec![env]);
}

#[test]
fn test_stream_random_chunking_preserves_sequence() {
    let envelopes: Vec<Envelope> = (1..=50)
        .map(|i| {
            if i % 3 == 0 {
                Notify::new("log", vec![Value::from("x".repeat(i as usize))]).into()
            } else {
                Request::new(i, "echo", vec![Value::from(i), Value::Binary(vec![0xAB; i as usize])]).into()
            }
        })
        .collect();

    let mut bytes = Vec::new();
    for env in &envelopes {
        bytes.extend(encode(env).unwrap());
    }

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut decoder = StreamDecoder::new();
    let mut decoded = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let len = rng.gen_range(1..=64).min(bytes.len() - offset);
        decoder.feed(&bytes[offset..offset + len]);
        decoded.extend(decode_all(&mut decoder));
        offset += len;
    }

    assert_eq!(decoded, envelopes);
}

#[test]
fn test_stream_invalid_msgpack() {
    let mut decoder = StreamDecoder::new();
    decoder.feed(&[0xc1, 0x00, 0x00]);
    assert!(matches!(decoder.try_next(), Err(Error::Decode(_))));
}

#[test]
fn test_stream_limit_rejects_oversized_message() {
    let env: Envelope = Request::new(1, "put", vec![Value::from("y".repeat(100))]).into();
    let bytes = encode(&env).unwrap();

    let mut decoder = StreamDecoder::with_limit(16);
    decoder.feed(&bytes[..40]);
    assert_eq!(
        decoder.try_next(),
        Err(Error::MessageTooLarge { buffered: 40, limit: 16 })
    );
}

#[test]
fn test_stream_every_item_kind_byte_at_a_time() {
    let params = vec![
        Value::from(-1),
        Value::from(-200),
        Value::from(70_000),
        Value::from(u64::MAX),
        Value::from(i64::MIN),
        Value::F32(1.5),
        Value::F64(-2.25),
        Value::Boolean(false),
        Value::Nil,
        Value::from("s".repeat(40)),
        Value::from("m".repeat(300)),
        Value::Binary(vec![7; 70_000]),
        Value::Ext(4, vec![1]),
        Value::Ext(5, vec![1, 2, 3]),
        Value::Ext(6, vec![0; 16]),
        Value::Array((0..20).map(Value::from).collect()),
        Value::Map(vec![
            (Value::from("k"), Value::Array(vec![])),
            (Value::from(1), Value::Map(vec![])),
        ]),
    ];
    let env: Envelope = Notify::new("kinds", params).into();
    let mut bytes = encode(&env).unwrap();
    bytes.extend(encode(&add_request(9)).unwrap());

    let mut decoder = StreamDecoder::new();
    let mut decoded = Vec::new();
    for byte in &bytes {
        decoder.feed(std::slice::from_ref(byte));
        decoded.extend(decode_all(&mut decoder));
    }
    assert_eq!(decoded, vec![env, add_request(9)]);
    assert_eq!(decoder.buffered(), 0);
}

#[test]
fn test_stream_large_message_in_small_chunks_is_linear() {
    let env: Envelope = Notify::new("blob", vec![Value::Binary(vec![0x5a; 4 * 1024 * 1024])]).into();
    let bytes = encode(&env).unwrap();

    let started = std::time::Instant::now();
    let mut decoder = StreamDecoder::new();
    let mut decoded = Vec::new();
    for chunk in bytes.chunks(1460) {
        decoder.feed(chunk);
        decoded.extend(decode_all(&mut decoder));
    }
    let elapsed = started.elapsed();

    assert_eq!(decoded, vec![env]);
    assert!(
        elapsed < std::time::Duration::from_secs(2),
        "Chunked decode took {:?}",
        elapsed
    );
}
