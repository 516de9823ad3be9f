//! The msgpack subset used by audit logs.
//!
//! The runtime emits exactly four encodings: fixmaps for records, str16 for
//! names, bin32 for raw memory images, and uint64 for addresses and
//! counters. Anything else in the stream is a hard error carrying the
//! offending tag byte and its offset.

use crate::errors::MsgpackError;

type Result<T> = std::result::Result<T, MsgpackError>;

/// A decoded msgpack value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// fixmap: ordered (key, value) pairs.
    Map(Vec<(Value, Value)>),
    /// str16 payload. Names are UTF-8 in practice but arbitrary bytes are
    /// preserved.
    Str(Vec<u8>),
    /// bin32 payload.
    Bin(Vec<u8>),
    U64(u64),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bin(bytes) | Value::Str(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Map lookup by string key, preserving the first binding.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(pairs) => pairs
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }
}

/// Decode one value at `offset`, returning it and the number of bytes
/// consumed.
pub fn read_value(buffer: &[u8], offset: usize) -> Result<(Value, usize)> {
    let tag = *buffer
        .get(offset)
        .ok_or(MsgpackError::Truncated { offset })?;
    match tag {
        0x80..=0x8f => {
            let npairs = (tag & 0x0f) as usize;
            let mut cursor = offset + 1;
            let mut pairs = Vec::with_capacity(npairs);
            for _ in 0..npairs {
                let (key, used) = read_value(buffer, cursor)?;
                cursor += used;
                let (value, used) = read_value(buffer, cursor)?;
                cursor += used;
                pairs.push((key, value));
            }
            Ok((Value::Map(pairs), cursor - offset))
        }
        0xda => {
            let len = be_u16(buffer, offset + 1)? as usize;
            let payload = take(buffer, offset + 3, len)?;
            Ok((Value::Str(payload.to_vec()), 3 + len))
        }
        0xc6 => {
            let len = be_u32(buffer, offset + 1)? as usize;
            let payload = take(buffer, offset + 5, len)?;
            Ok((Value::Bin(payload.to_vec()), 5 + len))
        }
        0xcf => {
            let bytes = take(buffer, offset + 1, 8)?;
            Ok((Value::U64(u64::from_be_bytes(bytes.try_into().unwrap())), 9))
        }
        tag => Err(MsgpackError::UnsupportedTag { tag, offset }),
    }
}

/// Decode a buffer of back-to-back values until end of input.
pub fn read_all(buffer: &[u8]) -> Result<Vec<Value>> {
    let mut values = Vec::new();
    let mut offset = 0;
    while offset < buffer.len() {
        let (value, used) = read_value(buffer, offset)?;
        values.push(value);
        offset += used;
    }
    Ok(values)
}

fn take(buffer: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    buffer
        .get(offset..offset + len)
        .ok_or(MsgpackError::Truncated { offset })
}

fn be_u16(buffer: &[u8], offset: usize) -> Result<u16> {
    let bytes = take(buffer, offset, 2)?;
    Ok(u16::from_be_bytes(bytes.try_into().unwrap()))
}

fn be_u32(buffer: &[u8], offset: usize) -> Result<u32> {
    let bytes = take(buffer, offset, 4)?;
    Ok(u32::from_be_bytes(bytes.try_into().unwrap()))
}

/// Encoder for the same subset. The analyzer itself never writes audit
/// logs; this backs `VmProfile::dump` siblings and the test fixtures.
pub mod write {
    use super::Value;

    pub fn value(out: &mut Vec<u8>, v: &Value) {
        match v {
            Value::Map(pairs) => {
                assert!(pairs.len() <= 15, "fixmap holds at most 15 pairs");
                out.push(0x80 | pairs.len() as u8);
                for (k, val) in pairs {
                    value(out, k);
                    value(out, val);
                }
            }
            Value::Str(bytes) => {
                out.push(0xda);
                out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
                out.extend_from_slice(bytes);
            }
            Value::Bin(bytes) => {
                out.push(0xc6);
                out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                out.extend_from_slice(bytes);
            }
            Value::U64(x) => {
                out.push(0xcf);
                out.extend_from_slice(&x.to_be_bytes());
            }
        }
    }
}
