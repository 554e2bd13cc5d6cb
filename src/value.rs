use std::cmp::Ordering;

use uuid::Uuid;

use crate::config::MAX_VALUE_DEPTH;
use crate::errors::{Error, Result};

const TAG_INT: u8 = 0x01;
const TAG_FLOAT: u8 = 0x02;
const TAG_TEXT: u8 = 0x03;
const TAG_UUID: u8 = 0x04;
const TAG_MAPPING: u8 = 0x05;
const TAG_SEQUENCE: u8 = 0x06;

/// A stored key or value. The variant set is closed; adding one is a format
/// version bump.
///
/// Mappings preserve insertion order, and that order is part of the encoding:
/// `{a: 1, b: 2}` and `{b: 2, a: 1}` are distinct keys.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
    Uuid(Uuid),
    Mapping(Vec<(String, Value)>),
    Sequence(Vec<Value>),
}

impl Value {
    /// Encode to the self-delimiting tagged byte form.
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Int(v) => {
                out.push(TAG_INT);
                out.extend_from_slice(&v.to_be_bytes());
            }
            Value::Float(v) => {
                out.push(TAG_FLOAT);
                out.extend_from_slice(&v.to_be_bytes());
            }
            Value::Text(s) => {
                out.push(TAG_TEXT);
                out.extend_from_slice(&(s.len() as u32).to_be_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            Value::Uuid(u) => {
                out.push(TAG_UUID);
                out.extend_from_slice(u.as_bytes());
            }
            Value::Mapping(pairs) => {
                out.push(TAG_MAPPING);
                out.extend_from_slice(&(pairs.len() as u32).to_be_bytes());
                for (key, value) in pairs {
                    Value::Text(key.clone()).encode_into(out);
                    value.encode_into(out);
                }
            }
            Value::Sequence(items) => {
                out.push(TAG_SEQUENCE);
                out.extend_from_slice(&(items.len() as u32).to_be_bytes());
                for item in items {
                    item.encode_into(out);
                }
            }
        }
    }

    /// Decode one value occupying the whole input.
    pub(crate) fn decode(bytes: &[u8]) -> Result<Value> {
        let mut pos = 0;
        let value = decode_at(bytes, &mut pos, 0)?;
        if pos != bytes.len() {
            return Err(Error::InvalidEncoding);
        }
        Ok(value)
    }
}

fn decode_at(bytes: &[u8], pos: &mut usize, depth: usize) -> Result<Value> {
    if depth > MAX_VALUE_DEPTH {
        return Err(Error::InvalidEncoding);
    }
    let tag = take(bytes, pos, 1)?[0];
    match tag {
        TAG_INT => {
            let raw = take(bytes, pos, 8)?;
            Ok(Value::Int(i64::from_be_bytes(raw.try_into().unwrap())))
        }
        TAG_FLOAT => {
            let raw = take(bytes, pos, 8)?;
            Ok(Value::Float(f64::from_be_bytes(raw.try_into().unwrap())))
        }
        TAG_TEXT => {
            let text = decode_text(bytes, pos)?;
            Ok(Value::Text(text))
        }
        TAG_UUID => {
            let raw = take(bytes, pos, 16)?;
            Ok(Value::Uuid(Uuid::from_slice(raw).unwrap()))
        }
        TAG_MAPPING => {
            let count = take_u32(bytes, pos)?;
            let mut pairs = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                let key_tag = take(bytes, pos, 1)?[0];
                if key_tag != TAG_TEXT {
                    return Err(Error::InvalidEncoding);
                }
                let key = decode_text(bytes, pos)?;
                let value = decode_at(bytes, pos, depth + 1)?;
                pairs.push((key, value));
            }
            Ok(Value::Mapping(pairs))
        }
        TAG_SEQUENCE => {
            let count = take_u32(bytes, pos)?;
            let mut items = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                items.push(decode_at(bytes, pos, depth + 1)?);
            }
            Ok(Value::Sequence(items))
        }
        _ => Err(Error::InvalidEncoding),
    }
}

// Length-prefixed UTF-8, tag already consumed.
fn decode_text(bytes: &[u8], pos: &mut usize) -> Result<String> {
    let len = take_u32(bytes, pos)? as usize;
    let raw = take(bytes, pos, len)?;
    String::from_utf8(raw.to_vec()).map_err(|_| Error::InvalidEncoding)
}

fn take<'a>(bytes: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = pos.checked_add(len).ok_or(Error::InvalidEncoding)?;
    let slice = bytes.get(*pos..end).ok_or(Error::InvalidEncoding)?;
    *pos = end;
    Ok(slice)
}

fn take_u32(bytes: &[u8], pos: &mut usize) -> Result<u32> {
    let raw = take(bytes, pos, 4)?;
    Ok(u32::from_be_bytes(raw.try_into().unwrap()))
}

/// Total order over encoded keys: unequal tags order by tag byte; equal tags
/// compare by payload (numeric for int/float, bytewise for the rest).
///
/// Both arguments must be canonical `Value::encode` output.
pub(crate) fn compare_encoded(a: &[u8], b: &[u8]) -> Ordering {
    match (a.first(), b.first()) {
        (Some(&ta), Some(&tb)) if ta == tb => match ta {
            TAG_INT => int_payload(a).cmp(&int_payload(b)),
            TAG_FLOAT => float_payload(a).total_cmp(&float_payload(b)),
            // Skip the text length prefix so shorter strings order as prefixes.
            TAG_TEXT => tail(a, 5).cmp(tail(b, 5)),
            _ => tail(a, 1).cmp(tail(b, 1)),
        },
        (ta, tb) => ta.cmp(&tb),
    }
}

fn int_payload(buf: &[u8]) -> i64 {
    buf.get(1..9)
        .map_or(0, |raw| i64::from_be_bytes(raw.try_into().unwrap()))
}

fn float_payload(buf: &[u8]) -> f64 {
    buf.get(1..9)
        .map_or(0.0, |raw| f64::from_be_bytes(raw.try_into().unwrap()))
}

fn tail(buf: &[u8], from: usize) -> &[u8] {
    buf.get(from..).unwrap_or(&[])
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::Text(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Value {
        Value::Uuid(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: Value) {
        let encoded = value.encode();
        assert_eq!(Value::decode(&encoded).unwrap(), value);
    }

    #[test]
    fn roundtrips_every_variant() {
        roundtrip(Value::Int(-42));
        roundtrip(Value::Int(i64::MIN));
        roundtrip(Value::Float(3.1415926));
        roundtrip(Value::Float(f64::NEG_INFINITY));
        roundtrip(Value::Text(String::new()));
        roundtrip(Value::Text("héllo wörld".to_string()));
        roundtrip(Value::Uuid(Uuid::new_v4()));
        roundtrip(Value::Sequence(vec![
            Value::Int(1),
            Value::Text("two".into()),
            Value::Sequence(vec![Value::Float(3.0)]),
        ]));
        roundtrip(Value::Mapping(vec![
            ("a".to_string(), Value::Int(1)),
            ("b".to_string(), Value::Sequence(vec![Value::Int(2)])),
        ]));
    }

    #[test]
    fn mapping_order_is_part_of_the_key() {
        let ab = Value::Mapping(vec![
            ("a".to_string(), Value::Int(1)),
            ("b".to_string(), Value::Int(2)),
        ]);
        let ba = Value::Mapping(vec![
            ("b".to_string(), Value::Int(2)),
            ("a".to_string(), Value::Int(1)),
        ]);
        assert_ne!(ab.encode(), ba.encode());
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(
            Value::decode(&[0x7f]),
            Err(Error::InvalidEncoding)
        ));
        // truncated int payload
        assert!(Value::decode(&[TAG_INT, 1, 2]).is_err());
        // trailing garbage after a complete value
        let mut encoded = Value::Int(1).encode();
        encoded.push(0);
        assert!(Value::decode(&encoded).is_err());
        // non-utf8 text
        assert!(Value::decode(&[TAG_TEXT, 0, 0, 0, 1, 0xff]).is_err());
        // mapping key that is not text
        let mut bad = vec![TAG_MAPPING, 0, 0, 0, 1];
        bad.extend_from_slice(&Value::Int(1).encode());
        bad.extend_from_slice(&Value::Int(2).encode());
        assert!(Value::decode(&bad).is_err());
    }

    #[test]
    fn nesting_depth_is_capped() {
        let mut value = Value::Int(0);
        for _ in 0..MAX_VALUE_DEPTH {
            value = Value::Sequence(vec![value]);
        }
        roundtrip(value.clone());
        let too_deep = Value::Sequence(vec![value]).encode();
        assert!(matches!(
            Value::decode(&too_deep),
            Err(Error::InvalidEncoding)
        ));
    }

    #[test]
    fn encoded_ordering_is_numeric_within_tags() {
        let enc = |v: Value| v.encode();
        assert_eq!(
            compare_encoded(&enc(Value::Int(-1)), &enc(Value::Int(2))),
            Ordering::Less
        );
        assert_eq!(
            compare_encoded(&enc(Value::Float(-0.5)), &enc(Value::Float(0.25))),
            Ordering::Less
        );
        assert_eq!(
            compare_encoded(&enc(Value::Text("ab".into())), &enc(Value::Text("abc".into()))),
            Ordering::Less
        );
        assert_eq!(
            compare_encoded(&enc(Value::Int(7)), &enc(Value::Int(7))),
            Ordering::Equal
        );
    }

    #[test]
    fn encoded_ordering_ranks_tags_first() {
        // Int sorts before Float regardless of magnitude, Float before Text.
        let int = Value::Int(1_000_000).encode();
        let float = Value::Float(-1e18).encode();
        let text = Value::Text("0".into()).encode();
        assert_eq!(compare_encoded(&int, &float), Ordering::Less);
        assert_eq!(compare_encoded(&float, &text), Ordering::Less);
    }
}
