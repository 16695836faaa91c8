// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::HashMap;

use duplex_rpc::codec::{Stream, StreamKind, Value};

#[test]
fn stream_roundtrips_a_request_through_bytes() {
    let mut req = Stream::new();
    req.set_kind(StreamKind::RpcRequest);
    req.set_callback_id(42);
    req.set_depth(1);
    req.set_session_id(7);
    req.write_string("#.echo:Say");
    req.write_array(&[Value::String("hi".to_string()), Value::Int64(-3)]);

    let bytes = req.to_bytes();
    let mut decoded = Stream::from_bytes(&bytes).expect("decode");
    decoded.set_read_pos_to_body_start();

    assert_eq!(decoded.kind(), StreamKind::RpcRequest);
    assert_eq!(decoded.callback_id(), 42);
    assert_eq!(decoded.depth(), 1);
    assert_eq!(decoded.session_id(), 7);
    assert_eq!(decoded.read_string().unwrap(), "#.echo:Say");
    let args = decoded.read_array().unwrap();
    assert_eq!(args[0].as_str(), Some("hi"));
    assert_eq!(args[1].as_i64(), Some(-3));
}

#[test]
fn map_roundtrips_with_sorted_string_keys() {
    let mut map = HashMap::new();
    map.insert("zeta".to_string(), Value::Bool(true));
    map.insert("alpha".to_string(), Value::Int64(9));

    let mut stream = Stream::new();
    stream.write_map(&map);
    stream.set_read_pos_to_body_start();

    let decoded = stream.read_map().unwrap();
    assert_eq!(decoded.get("zeta").and_then(Value::as_bool), Some(true));
    assert_eq!(decoded.get("alpha").and_then(Value::as_i64), Some(9));
}

#[test]
fn long_string_past_short_len_max_roundtrips() {
    let long = "x".repeat(200);
    let mut stream = Stream::new();
    stream.write_string(&long);
    stream.set_read_pos_to_body_start();
    assert_eq!(stream.read_string().unwrap(), long);
}
