use super::*;
use bytes::Bytes;

#[test]
fn decode_integers() {
    assert_eq!(decode(b"i42e").unwrap().as_int(), Some(42));
    assert_eq!(decode(b"i-7e").unwrap().as_int(), Some(-7));
    assert_eq!(decode(b"i0e").unwrap().as_int(), Some(0));
}

#[test]
fn reject_non_canonical_integers() {
    assert_eq!(decode(b"i03e"), Err(BencodeError::InvalidInteger));
    assert_eq!(decode(b"i-0e"), Err(BencodeError::InvalidInteger));
    assert_eq!(decode(b"ie"), Err(BencodeError::InvalidInteger));
    assert_eq!(decode(b"i-e"), Err(BencodeError::InvalidInteger));
}

#[test]
fn decode_strings() {
    assert_eq!(decode(b"5:hello").unwrap().as_str(), Some("hello"));
    assert_eq!(decode(b"0:").unwrap().as_bytes().unwrap().len(), 0);
    // binary content is fine
    let v = decode(b"3:\x00\x01\xff").unwrap();
    assert_eq!(v.as_bytes().unwrap().as_ref(), &[0x00, 0x01, 0xff]);
}

#[test]
fn reject_bad_strings() {
    assert_eq!(decode(b"5:hi"), Err(BencodeError::Truncated));
    assert_eq!(decode(b"05:hello"), Err(BencodeError::InvalidLength));
}

#[test]
fn decode_lists_and_dicts() {
    let v = decode(b"li1ei2ei3ee").unwrap();
    assert_eq!(v.as_list().unwrap().len(), 3);

    let v = decode(b"d3:agei30e4:name5:alicee").unwrap();
    assert_eq!(v.get_str(b"name"), Some("alice"));
    assert_eq!(v.get_int(b"age"), Some(30));
    assert_eq!(v.get(b"missing"), None);
}

#[test]
fn reject_unsorted_or_duplicate_keys() {
    assert_eq!(decode(b"d1:b0:1:a0:e"), Err(BencodeError::UnorderedKeys));
    assert_eq!(decode(b"d1:a0:1:a0:e"), Err(BencodeError::UnorderedKeys));
}

#[test]
fn reject_non_string_keys() {
    assert_eq!(decode(b"di1e0:e"), Err(BencodeError::NonStringKey));
}

#[test]
fn reject_trailing_data() {
    assert_eq!(decode(b"i1ei2e"), Err(BencodeError::TrailingData));
}

#[test]
fn reject_deep_nesting() {
    let mut input = Vec::new();
    for _ in 0..100 {
        input.push(b'l');
    }
    for _ in 0..100 {
        input.push(b'e');
    }
    assert_eq!(decode(&input), Err(BencodeError::TooDeep));
}

#[test]
fn encode_round_trip() {
    let mut dict = Value::dict();
    dict.insert(b"t", Value::bytes(&[0x00, 0x2a]));
    dict.insert(b"y", Value::str("q"));
    dict.insert(b"q", Value::str("ping"));
    dict.insert(
        b"a",
        Value::Dict(
            [(Bytes::from_static(b"id"), Value::bytes(&[7u8; 20]))]
                .into_iter()
                .collect(),
        ),
    );

    let encoded = encode(&dict);
    let decoded = decode(&encoded).unwrap();
    assert_eq!(decoded, dict);
}

#[test]
fn encode_sorts_keys() {
    let mut dict = Value::dict();
    dict.insert(b"zz", Value::Int(1));
    dict.insert(b"aa", Value::Int(2));
    let encoded = encode(&dict);
    assert_eq!(&encoded, b"d2:aai2e2:zzi1ee");
}
