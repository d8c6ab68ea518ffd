use remora_bencode::{decode, encode, DecodeError, Value};

#[test]
fn decode_integer_positive() {
    assert_eq!(decode(b"i42e").unwrap().as_integer(), Some(42));
}

#[test]
fn decode_integer_negative() {
    assert_eq!(decode(b"i-7e").unwrap().as_integer(), Some(-7));
}

#[test]
fn decode_integer_zero() {
    assert_eq!(decode(b"i0e").unwrap().as_integer(), Some(0));
}

#[test]
fn decode_integer_extremes() {
    assert_eq!(
        decode(b"i9223372036854775807e").unwrap().as_integer(),
        Some(i64::MAX)
    );
    assert_eq!(
        decode(b"i-9223372036854775808e").unwrap().as_integer(),
        Some(i64::MIN)
    );
}

#[test]
fn decode_rejects_negative_zero() {
    assert!(matches!(decode(b"i-0e"), Err(DecodeError::Malformed(_))));
}

#[test]
fn decode_rejects_leading_zero() {
    assert!(matches!(decode(b"i042e"), Err(DecodeError::Malformed(_))));
}

#[test]
fn decode_rejects_empty_integer() {
    assert!(decode(b"ie").is_err());
    assert!(decode(b"i-e").is_err());
}

#[test]
fn decode_byte_string() {
    assert_eq!(decode(b"4:spam").unwrap().as_bytes(), Some(b"spam".as_ref()));
    assert_eq!(decode(b"0:").unwrap().as_bytes(), Some(b"".as_ref()));
}

#[test]
fn decode_byte_string_keeps_raw_bytes() {
    let value = decode(b"4:\x00\xff\x01\x02").unwrap();
    assert_eq!(value.as_bytes(), Some(b"\x00\xff\x01\x02".as_ref()));
    assert_eq!(value.as_str(), None);
}

#[test]
fn decode_rejects_overlong_string_length() {
    assert!(matches!(decode(b"10:abc"), Err(DecodeError::Truncated)));
}

#[test]
fn decode_rejects_missing_colon() {
    assert!(decode(b"4spam").is_err());
}

#[test]
fn decode_list() {
    let value = decode(b"li42e4:spamlee").unwrap();
    let items = value.as_list().unwrap();
    assert_eq!(items.len(), 3);
    assert_eq!(items[0].as_integer(), Some(42));
    assert_eq!(items[1].as_str(), Some("spam"));
    assert_eq!(items[2].as_list().map(<[_]>::len), Some(0));
}

#[test]
fn decode_rejects_unterminated_list() {
    assert!(matches!(decode(b"li1e"), Err(DecodeError::Truncated)));
}

#[test]
fn decode_dict() {
    let value = decode(b"d3:cow3:moo4:spam4:eggse").unwrap();
    assert_eq!(value.get(b"cow").and_then(Value::as_str), Some("moo"));
    assert_eq!(value.get(b"spam").and_then(Value::as_str), Some("eggs"));
}

#[test]
fn decode_rejects_trailing_garbage() {
    assert!(matches!(decode(b"i1extra"), Err(DecodeError::Malformed(_))));
}

#[test]
fn decode_rejects_deep_nesting() {
    let mut doc = vec![b'l'; 64];
    doc.extend_from_slice(&[b'e'; 64]);
    assert!(matches!(decode(&doc), Err(DecodeError::TooDeep)));
}

#[test]
fn reencoding_info_reproduces_the_observed_range() {
    let doc = b"d8:announce10:http://t/a4:infod6:lengthi3e4:name1:aee";
    let (value, span) = remora_bencode::decode_with_info_range(doc).unwrap();
    let (start, end) = span.unwrap();
    let info = value.get(b"info").unwrap();
    assert_eq!(encode(info), &doc[start..end]);
    assert_eq!(&doc[start..end], b"d6:lengthi3e4:name1:ae");
}

#[test]
fn encode_decode_round_trip() {
    let docs: &[&[u8]] = &[
        b"i42e",
        b"4:spam",
        b"l4:spam4:eggsi-3ee",
        b"d3:cow3:moo4:spam4:eggse",
        b"d4:dictd3:keyl1:a1:bee4:listli1eee",
    ];
    for doc in docs {
        assert_eq!(&encode(&decode(doc).unwrap()), doc);
    }
}
