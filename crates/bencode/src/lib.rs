//! A minimal bencode codec.
//!
//! Bencoded values are one of four kinds: byte strings, integers, lists and
//! dictionaries. Dictionary keys must be sorted as raw byte strings; we keep
//! that invariant structural by storing dict entries in a `BTreeMap` rather
//! than sorting at encode time.

mod value;
mod decode;
mod encode;

pub use value::BValue;
pub use decode::{decode, decode_prefix, DecodeError};
pub use encode::encode;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn round_trip_scalar() {
        let v = BValue::Int(-42);
        let enc = encode(&v);
        assert_eq!(enc, b"i-42e");
        assert_eq!(decode(&enc).unwrap(), v);
    }

    #[test]
    fn round_trip_bytes() {
        let v = BValue::Bytes(b"spam".to_vec());
        assert_eq!(encode(&v), b"4:spam");
        assert_eq!(decode(b"4:spam").unwrap(), v);
    }

    #[test]
    fn round_trip_list() {
        let v = BValue::List(vec![BValue::Bytes(b"a".to_vec()), BValue::Int(1)]);
        let enc = encode(&v);
        assert_eq!(enc, b"l1:ai1ee");
        assert_eq!(decode(&enc).unwrap(), v);
    }

    #[test]
    fn dict_keys_are_sorted_on_encode() {
        let mut m = BTreeMap::new();
        m.insert(b"zzz".to_vec(), BValue::Int(1));
        m.insert(b"aaa".to_vec(), BValue::Int(2));
        let v = BValue::Dict(m);
        let enc = encode(&v);
        assert_eq!(enc, b"d3:aaai2e3:zzzi1ee");
    }

    #[test]
    fn decode_rejects_trailing_garbage() {
        let err = decode(b"i1ee").unwrap_err();
        assert!(matches!(err, DecodeError::TrailingData));
    }

    #[test]
    fn decode_rejects_truncated_input() {
        assert!(decode(b"4:sp").is_err());
        assert!(decode(b"i1").is_err());
        assert!(decode(b"l1:ae").is_ok());
        assert!(decode(b"l1:a").is_err());
    }
}
