//! Tagged JSON-like values.
//!
//! Every value starts with a one-byte tag:
//!
//! | Tag | Value                          |
//! |-----|--------------------------------|
//! | 127 | undefined                      |
//! | 126 | null                           |
//! | 125 | integer (signed varint)        |
//! | 124 | float32 (big endian)           |
//! | 123 | float64 (big endian)           |
//! | 122 | bigint (i64 big endian)        |
//! | 121 | false                          |
//! | 120 | true                           |
//! | 119 | string                         |
//! | 118 | map: count, (key, value)*      |
//! | 117 | array: count, value*           |
//! | 116 | binary buffer                  |
//!
//! Map entries keep their wire order, so decoding and re-encoding a value
//! reproduces the input bytes.

use crate::error::{CodecError, Result};
use crate::varint::{Decoder, Encoder};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

const TAG_UNDEFINED: u8 = 127;
const TAG_NULL: u8 = 126;
const TAG_INTEGER: u8 = 125;
const TAG_FLOAT32: u8 = 124;
const TAG_FLOAT64: u8 = 123;
const TAG_BIGINT: u8 = 122;
const TAG_FALSE: u8 = 121;
const TAG_TRUE: u8 = 120;
const TAG_STRING: u8 = 119;
const TAG_MAP: u8 = 118;
const TAG_ARRAY: u8 = 117;
const TAG_BUFFER: u8 = 116;

/// Deepest nesting of arrays and maps accepted by [`Any::decode`].
pub const MAX_DEPTH: usize = 256;

/// A dynamically typed value carried by `Any`, `Embed`, `Format` and
/// `Doc` content.
#[derive(Debug, Clone, PartialEq)]
pub enum Any {
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Float32(f32),
    Float64(f64),
    BigInt(i64),
    String(String),
    Buffer(Vec<u8>),
    Array(Vec<Any>),
    /// Entries in insertion order.
    Map(Vec<(String, Any)>),
}

impl Any {
    pub fn encode(&self, enc: &mut Encoder) {
        match self {
            Any::Undefined => enc.write_u8(TAG_UNDEFINED),
            Any::Null => enc.write_u8(TAG_NULL),
            Any::Bool(true) => enc.write_u8(TAG_TRUE),
            Any::Bool(false) => enc.write_u8(TAG_FALSE),
            Any::Int(v) => {
                enc.write_u8(TAG_INTEGER);
                enc.write_var_i64(*v);
            }
            Any::Float32(v) => {
                enc.write_u8(TAG_FLOAT32);
                enc.write_f32(*v);
            }
            Any::Float64(v) => {
                enc.write_u8(TAG_FLOAT64);
                enc.write_f64(*v);
            }
            Any::BigInt(v) => {
                enc.write_u8(TAG_BIGINT);
                enc.write_i64(*v);
            }
            Any::String(s) => {
                enc.write_u8(TAG_STRING);
                enc.write_var_string(s);
            }
            Any::Buffer(b) => {
                enc.write_u8(TAG_BUFFER);
                enc.write_var_buf(b);
            }
            Any::Array(items) => {
                enc.write_u8(TAG_ARRAY);
                enc.write_var_u64(items.len() as u64);
                for item in items {
                    item.encode(enc);
                }
            }
            Any::Map(entries) => {
                enc.write_u8(TAG_MAP);
                enc.write_var_u64(entries.len() as u64);
                for (key, value) in entries {
                    enc.write_var_string(key);
                    value.encode(enc);
                }
            }
        }
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Any> {
        Self::decode_nested(dec, 0)
    }

    fn decode_nested(dec: &mut Decoder<'_>, depth: usize) -> Result<Any> {
        let tag = dec.read_u8()?;
        if (tag == TAG_ARRAY || tag == TAG_MAP) && depth >= MAX_DEPTH {
            return Err(CodecError::NestingTooDeep(MAX_DEPTH));
        }
        Ok(match tag {
            TAG_UNDEFINED => Any::Undefined,
            TAG_NULL => Any::Null,
            TAG_INTEGER => Any::Int(dec.read_var_i64()?),
            TAG_FLOAT32 => Any::Float32(dec.read_f32()?),
            TAG_FLOAT64 => Any::Float64(dec.read_f64()?),
            TAG_BIGINT => Any::BigInt(dec.read_i64()?),
            TAG_FALSE => Any::Bool(false),
            TAG_TRUE => Any::Bool(true),
            TAG_STRING => Any::String(dec.read_var_string()?.to_owned()),
            TAG_BUFFER => Any::Buffer(dec.read_var_buf()?.to_vec()),
            TAG_ARRAY => {
                let len = dec.read_len()?;
                let mut items = Vec::new();
                for _ in 0..len {
                    items.push(Any::decode_nested(dec, depth + 1)?);
                }
                Any::Array(items)
            }
            TAG_MAP => {
                let len = dec.read_len()?;
                let mut entries = Vec::new();
                for _ in 0..len {
                    let key = dec.read_var_string()?.to_owned();
                    entries.push((key, Any::decode_nested(dec, depth + 1)?));
                }
                Any::Map(entries)
            }
            other => return Err(CodecError::UnknownAnyTag(other)),
        })
    }

    /// Serialize to a JSON string. `Undefined` becomes the bare word
    /// `undefined`, which is how JSON content stores missing values.
    pub fn to_json_string(&self) -> String {
        match self {
            Any::Undefined => "undefined".to_string(),
            other => other.to_json().to_string(),
        }
    }

    pub fn from_json_str(s: &str) -> Result<Any> {
        if s == "undefined" {
            return Ok(Any::Undefined);
        }
        serde_json::from_str::<serde_json::Value>(s)
            .map(Any::from)
            .map_err(|e| CodecError::InvalidJson(e.to_string()))
    }

    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            Any::Undefined | Any::Null => Value::Null,
            Any::Bool(b) => Value::Bool(*b),
            Any::Int(v) | Any::BigInt(v) => Value::from(*v),
            Any::Float32(v) => serde_json::Number::from_f64(f64::from(*v))
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Any::Float64(v) => serde_json::Number::from_f64(*v)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Any::String(s) => Value::String(s.clone()),
            Any::Buffer(b) => Value::Array(b.iter().map(|x| Value::from(*x)).collect()),
            Any::Array(items) => Value::Array(items.iter().map(Any::to_json).collect()),
            Any::Map(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Value stored under `key` in a map. A later duplicate key shadows an
    /// earlier one.
    pub fn get(&self, key: &str) -> Option<&Any> {
        match self {
            Any::Map(entries) => entries.iter().rev().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Any::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Any {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_json_string())
    }
}

impl From<serde_json::Value> for Any {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => Any::Null,
            Value::Bool(b) => Any::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Any::Int(i),
                None => Any::Float64(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Any::String(s),
            Value::Array(items) => Any::Array(items.into_iter().map(Any::from).collect()),
            Value::Object(entries) => {
                Any::Map(entries.into_iter().map(|(k, v)| (k, Any::from(v))).collect())
            }
        }
    }
}

impl From<bool> for Any {
    fn from(v: bool) -> Self {
        Any::Bool(v)
    }
}

impl From<i64> for Any {
    fn from(v: i64) -> Self {
        Any::Int(v)
    }
}

impl From<i32> for Any {
    fn from(v: i32) -> Self {
        Any::Int(i64::from(v))
    }
}

impl From<f64> for Any {
    fn from(v: f64) -> Self {
        Any::Float64(v)
    }
}

impl From<f32> for Any {
    fn from(v: f32) -> Self {
        Any::Float32(v)
    }
}

impl From<&str> for Any {
    fn from(v: &str) -> Self {
        Any::String(v.to_owned())
    }
}

impl From<String> for Any {
    fn from(v: String) -> Self {
        Any::String(v)
    }
}

impl From<Vec<u8>> for Any {
    fn from(v: Vec<u8>) -> Self {
        Any::Buffer(v)
    }
}

impl From<Vec<Any>> for Any {
    fn from(v: Vec<Any>) -> Self {
        Any::Array(v)
    }
}

impl From<Vec<(String, Any)>> for Any {
    fn from(v: Vec<(String, Any)>) -> Self {
        Any::Map(v)
    }
}

impl From<BTreeMap<String, Any>> for Any {
    fn from(v: BTreeMap<String, Any>) -> Self {
        Any::Map(v.into_iter().collect())
    }
}

/// Entries are sorted by key.
impl From<HashMap<String, Any>> for Any {
    fn from(v: HashMap<String, Any>) -> Self {
        Any::from(v.into_iter().collect::<BTreeMap<_, _>>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: &Any) -> Any {
        let mut enc = Encoder::new();
        value.encode(&mut enc);
        let bytes = enc.into_vec();
        let mut dec = Decoder::new(&bytes);
        let decoded = Any::decode(&mut dec).unwrap();
        assert!(!dec.has_content());
        decoded
    }

    #[test]
    fn test_every_tag_round_trips() {
        let map = vec![("k".to_string(), Any::Int(-5))];
        let values = vec![
            Any::Undefined,
            Any::Null,
            Any::Bool(true),
            Any::Bool(false),
            Any::Int(1 << 40),
            Any::Float32(2.5),
            Any::Float64(-0.125),
            Any::BigInt(i64::MIN),
            Any::String("näive".into()),
            Any::Buffer(vec![0, 255, 7]),
            Any::Array(vec![Any::Null, Any::Int(3)]),
            Any::Map(map),
        ];
        for value in &values {
            assert_eq!(&round_trip(value), value);
        }
    }

    #[test]
    fn test_tag_bytes() {
        let mut enc = Encoder::new();
        Any::Bool(true).encode(&mut enc);
        Any::Null.encode(&mut enc);
        Any::Int(3).encode(&mut enc);
        assert_eq!(enc.as_slice(), &[120, 126, 125, 3]);
    }

    #[test]
    fn test_unknown_tag() {
        let bytes = [42u8];
        let mut dec = Decoder::new(&bytes);
        assert_eq!(Any::decode(&mut dec), Err(CodecError::UnknownAnyTag(42)));
    }

    #[test]
    fn test_truncated_array() {
        let bytes = [TAG_ARRAY, 3, TAG_NULL];
        let mut dec = Decoder::new(&bytes);
        assert!(Any::decode(&mut dec).is_err());
    }

    #[test]
    fn test_json_conversions() {
        let json = serde_json::json!({"a": [1, 2.5, "x", null, true]});
        let any = Any::from(json.clone());
        assert_eq!(any.to_json(), json);
        assert_eq!(Any::from_json_str(&any.to_json_string()).unwrap(), any);
        assert_eq!(Any::Undefined.to_json_string(), "undefined");
        assert_eq!(Any::from_json_str("undefined").unwrap(), Any::Undefined);
    }

    #[test]
    fn test_map_keeps_wire_order() {
        let bytes = [TAG_MAP, 2, 1, b'b', TAG_NULL, 1, b'a', TAG_NULL];
        let mut dec = Decoder::new(&bytes);
        let value = Any::decode(&mut dec).unwrap();
        assert_eq!(
            value,
            Any::Map(vec![("b".into(), Any::Null), ("a".into(), Any::Null)])
        );

        let mut enc = Encoder::new();
        value.encode(&mut enc);
        assert_eq!(enc.as_slice(), &bytes);
    }

    #[test]
    fn test_map_lookup_prefers_last_duplicate() {
        let map = Any::Map(vec![
            ("k".into(), Any::Int(1)),
            ("j".into(), Any::Int(2)),
            ("k".into(), Any::Int(3)),
        ]);
        assert_eq!(map.get("k"), Some(&Any::Int(3)));
        assert_eq!(map.get("j"), Some(&Any::Int(2)));
        assert_eq!(map.get("x"), None);
        assert_eq!(Any::Null.get("k"), None);
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let mut bytes = Vec::new();
        for _ in 0..200_000 {
            bytes.extend_from_slice(&[TAG_ARRAY, 1]);
        }
        bytes.push(TAG_NULL);
        let mut dec = Decoder::new(&bytes);
        assert_eq!(
            Any::decode(&mut dec),
            Err(CodecError::NestingTooDeep(MAX_DEPTH))
        );

        let mut bytes = vec![TAG_MAP, 1, 1, b'k'];
        for _ in 0..MAX_DEPTH {
            bytes.extend_from_slice(&[TAG_ARRAY, 1]);
        }
        bytes.push(TAG_NULL);
        let mut dec = Decoder::new(&bytes);
        assert_eq!(
            Any::decode(&mut dec),
            Err(CodecError::NestingTooDeep(MAX_DEPTH))
        );
    }

    #[test]
    fn test_nesting_at_the_limit_is_accepted() {
        let mut bytes = Vec::new();
        for _ in 0..MAX_DEPTH {
            bytes.extend_from_slice(&[TAG_ARRAY, 1]);
        }
        bytes.push(TAG_NULL);
        let mut dec = Decoder::new(&bytes);
        let mut value = Any::decode(&mut dec).unwrap();
        let mut depth = 0;
        while let Any::Array(mut items) = value {
            depth += 1;
            value = items.pop().unwrap();
        }
        assert_eq!(depth, MAX_DEPTH);
        assert_eq!(value, Any::Null);
    }
}
