//! Typed cell values and their comparison/serialization contract.
//!
//! A row is a fixed-arity tuple of these values. The storage core only
//! depends on two properties of the type system: a total comparison order
//! (used by sorted indexes) and a stable binary codec (used by the row
//! record format and the expression codec).

use std::cmp::Ordering;
use std::fmt;

use crate::common::{Error, Result};

// Type tags used by the binary codec. Tag 9 is reserved for out-of-line
// blob refs and is only ever written by the row record codec.
const TAG_NULL: u8 = 0;
const TAG_BOOLEAN: u8 = 1;
const TAG_INTEGER: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_TEXT: u8 = 4;
const TAG_DATE: u8 = 5;
const TAG_BINARY: u8 = 6;
const TAG_ARRAY: u8 = 7;
const TAG_PLAN: u8 = 8;

/// Declared type of a table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Boolean,
    Integer,
    Float,
    Text,
    Date,
    Binary,
    Array,
    Plan,
}

impl ValueType {
    /// Whether a value is storable in a column of this type.
    ///
    /// NULL is storable in any column; NOT NULL is a constraint, not a
    /// property of the type.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (ValueType::Boolean, Value::Boolean(_)) => true,
            (ValueType::Integer, Value::Integer(_)) => true,
            // Integer literals widen into float columns.
            (ValueType::Float, Value::Float(_) | Value::Integer(_)) => true,
            (ValueType::Text, Value::Text(_)) => true,
            (ValueType::Date, Value::Date(_)) => true,
            (ValueType::Binary, Value::Binary(_)) => true,
            (ValueType::Array, Value::Array(_)) => true,
            (ValueType::Plan, Value::Plan(_)) => true,
            _ => false,
        }
    }

    /// Stable tag used when serializing table definitions.
    pub fn to_tag(self) -> u8 {
        match self {
            ValueType::Boolean => TAG_BOOLEAN,
            ValueType::Integer => TAG_INTEGER,
            ValueType::Float => TAG_FLOAT,
            ValueType::Text => TAG_TEXT,
            ValueType::Date => TAG_DATE,
            ValueType::Binary => TAG_BINARY,
            ValueType::Array => TAG_ARRAY,
            ValueType::Plan => TAG_PLAN,
        }
    }

    /// Inverse of [`ValueType::to_tag`].
    pub fn from_tag(tag: u8) -> Result<ValueType> {
        Ok(match tag {
            TAG_BOOLEAN => ValueType::Boolean,
            TAG_INTEGER => ValueType::Integer,
            TAG_FLOAT => ValueType::Float,
            TAG_TEXT => ValueType::Text,
            TAG_DATE => ValueType::Date,
            TAG_BINARY => ValueType::Binary,
            TAG_ARRAY => ValueType::Array,
            TAG_PLAN => ValueType::Plan,
            _ => return Err(Error::Corruption(format!("unknown column type tag {}", tag))),
        })
    }
}

/// A single cell value.
///
/// `Plan` is an opaque payload the outer engine interprets (a serialized
/// query plan cell); the core stores and compares it as bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    /// Milliseconds since the epoch.
    Date(i64),
    Binary(Vec<u8>),
    Array(Vec<Value>),
    Plan(Vec<u8>),
}

impl Value {
    /// Whether this value is SQL NULL.
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Human-readable type name, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Date(_) => "date",
            Value::Binary(_) => "binary",
            Value::Array(_) => "array",
            Value::Plan(_) => "plan",
        }
    }

    // Rank used for cross-type ordering. Numeric types share a rank so
    // integers and floats compare by value.
    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Integer(_) | Value::Float(_) => 2,
            Value::Text(_) => 3,
            Value::Date(_) => 4,
            Value::Binary(_) => 5,
            Value::Array(_) => 6,
            Value::Plan(_) => 7,
        }
    }

    /// Total comparison order used by sorted indexes.
    ///
    /// NULL sorts before everything; integers and floats compare
    /// numerically; distinct types otherwise order by type rank. This is
    /// a *storage* order, not SQL comparison semantics (see the
    /// three-valued comparisons in [`crate::expr`]).
    pub fn storage_cmp(&self, other: &Value) -> Ordering {
        let rank = self.type_rank().cmp(&other.type_rank());
        if rank != Ordering::Equal {
            return rank;
        }
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Integer(a), Value::Float(b)) => (*a as f64).total_cmp(b),
            (Value::Float(a), Value::Integer(b)) => a.total_cmp(&(*b as f64)),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::Binary(a), Value::Binary(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.storage_cmp(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Plan(a), Value::Plan(b)) => a.cmp(b),
            // Unreachable: ranks matched above.
            _ => Ordering::Equal,
        }
    }

    /// Approximate heap footprint, used by the data-cell cache budget.
    pub fn heap_size(&self) -> usize {
        let payload = match self {
            Value::Null | Value::Boolean(_) => 1,
            Value::Integer(_) | Value::Float(_) | Value::Date(_) => 8,
            Value::Text(s) => s.len(),
            Value::Binary(b) | Value::Plan(b) => b.len(),
            Value::Array(vs) => vs.iter().map(Value::heap_size).sum(),
        };
        payload + std::mem::size_of::<Value>()
    }

    /// Append the binary encoding of this value to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Value::Null => out.push(TAG_NULL),
            Value::Boolean(b) => {
                out.push(TAG_BOOLEAN);
                out.push(u8::from(*b));
            }
            Value::Integer(i) => {
                out.push(TAG_INTEGER);
                out.extend_from_slice(&i.to_be_bytes());
            }
            Value::Float(f) => {
                out.push(TAG_FLOAT);
                out.extend_from_slice(&f.to_bits().to_be_bytes());
            }
            Value::Text(s) => {
                out.push(TAG_TEXT);
                out.extend_from_slice(&(s.len() as u32).to_be_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            Value::Date(d) => {
                out.push(TAG_DATE);
                out.extend_from_slice(&d.to_be_bytes());
            }
            Value::Binary(b) => {
                out.push(TAG_BINARY);
                out.extend_from_slice(&(b.len() as u32).to_be_bytes());
                out.extend_from_slice(b);
            }
            Value::Array(vs) => {
                out.push(TAG_ARRAY);
                out.extend_from_slice(&(vs.len() as u32).to_be_bytes());
                for v in vs {
                    v.encode(out);
                }
            }
            Value::Plan(b) => {
                out.push(TAG_PLAN);
                out.extend_from_slice(&(b.len() as u32).to_be_bytes());
                out.extend_from_slice(b);
            }
        }
    }

    /// Decode one value from `bytes` starting at `*pos`, advancing `*pos`.
    pub fn decode(bytes: &[u8], pos: &mut usize) -> Result<Value> {
        let tag = read_u8(bytes, pos)?;
        Ok(match tag {
            TAG_NULL => Value::Null,
            TAG_BOOLEAN => Value::Boolean(read_u8(bytes, pos)? != 0),
            TAG_INTEGER => Value::Integer(read_i64(bytes, pos)?),
            TAG_FLOAT => Value::Float(f64::from_bits(read_i64(bytes, pos)? as u64)),
            TAG_TEXT => {
                let len = read_u32(bytes, pos)? as usize;
                let raw = read_slice(bytes, pos, len)?;
                Value::Text(
                    String::from_utf8(raw.to_vec())
                        .map_err(|_| Error::Corruption("invalid utf-8 in text cell".into()))?,
                )
            }
            TAG_DATE => Value::Date(read_i64(bytes, pos)?),
            TAG_BINARY => {
                let len = read_u32(bytes, pos)? as usize;
                Value::Binary(read_slice(bytes, pos, len)?.to_vec())
            }
            TAG_ARRAY => {
                let count = read_u32(bytes, pos)? as usize;
                let mut vs = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    vs.push(Value::decode(bytes, pos)?);
                }
                Value::Array(vs)
            }
            TAG_PLAN => {
                let len = read_u32(bytes, pos)? as usize;
                Value::Plan(read_slice(bytes, pos, len)?.to_vec())
            }
            _ => return Err(Error::Corruption(format!("unknown value tag {}", tag))),
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "'{}'", s),
            Value::Date(d) => write!(f, "DATE({})", d),
            Value::Binary(b) => write!(f, "<{} bytes>", b.len()),
            Value::Array(vs) => {
                write!(f, "(")?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, ")")
            }
            Value::Plan(b) => write!(f, "<plan {} bytes>", b.len()),
        }
    }
}

// ============================================================================
// Byte reading helpers shared by the storage codecs
// ============================================================================

pub(crate) fn read_u8(bytes: &[u8], pos: &mut usize) -> Result<u8> {
    let b = *bytes
        .get(*pos)
        .ok_or_else(|| Error::Corruption("truncated record".into()))?;
    *pos += 1;
    Ok(b)
}

pub(crate) fn read_u32(bytes: &[u8], pos: &mut usize) -> Result<u32> {
    let raw = read_slice(bytes, pos, 4)?;
    Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

pub(crate) fn read_i64(bytes: &[u8], pos: &mut usize) -> Result<i64> {
    let raw = read_slice(bytes, pos, 8)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(raw);
    Ok(i64::from_be_bytes(buf))
}

pub(crate) fn read_slice<'a>(bytes: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = pos
        .checked_add(len)
        .ok_or_else(|| Error::Corruption("record length overflow".into()))?;
    if end > bytes.len() {
        return Err(Error::Corruption("truncated record".into()));
    }
    let out = &bytes[*pos..end];
    *pos = end;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(v: &Value) -> Value {
        let mut buf = Vec::new();
        v.encode(&mut buf);
        let mut pos = 0;
        let back = Value::decode(&buf, &mut pos).unwrap();
        assert_eq!(pos, buf.len());
        back
    }

    #[test]
    fn test_roundtrip_simple() {
        for v in [
            Value::Null,
            Value::Boolean(true),
            Value::Integer(-42),
            Value::Float(2.5),
            Value::Text("hello".into()),
            Value::Date(1_700_000_000_000),
            Value::Binary(vec![1, 2, 3]),
            Value::Array(vec![Value::Integer(1), Value::Text("x".into())]),
            Value::Plan(vec![0xDE, 0xAD]),
        ] {
            assert_eq!(roundtrip(&v), v);
        }
    }

    #[test]
    fn test_null_sorts_first() {
        assert_eq!(Value::Null.storage_cmp(&Value::Integer(i64::MIN)), Ordering::Less);
        assert_eq!(Value::Null.storage_cmp(&Value::Null), Ordering::Equal);
    }

    #[test]
    fn test_numeric_cross_compare() {
        assert_eq!(Value::Integer(2).storage_cmp(&Value::Float(2.5)), Ordering::Less);
        assert_eq!(Value::Float(3.0).storage_cmp(&Value::Integer(3)), Ordering::Equal);
    }

    #[test]
    fn test_type_accepts() {
        assert!(ValueType::Integer.accepts(&Value::Integer(1)));
        assert!(ValueType::Integer.accepts(&Value::Null));
        assert!(!ValueType::Integer.accepts(&Value::Text("1".into())));
        assert!(ValueType::Float.accepts(&Value::Integer(1)));
    }

    #[test]
    fn test_decode_truncated_fails() {
        let mut buf = Vec::new();
        Value::Text("hello".into()).encode(&mut buf);
        buf.truncate(buf.len() - 1);
        let mut pos = 0;
        assert!(Value::decode(&buf, &mut pos).is_err());
    }

    #[test]
    fn test_decode_unknown_tag_fails() {
        let mut pos = 0;
        assert!(Value::decode(&[0xEE], &mut pos).is_err());
    }

    fn value_strategy() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Boolean),
            any::<i64>().prop_map(Value::Integer),
            // Finite floats only: NaN has no storage equality.
            (-1e12f64..1e12f64).prop_map(Value::Float),
            ".{0,32}".prop_map(Value::Text),
            any::<i64>().prop_map(Value::Date),
            proptest::collection::vec(any::<u8>(), 0..64).prop_map(Value::Binary),
        ];
        leaf.prop_recursive(2, 16, 4, |inner| {
            proptest::collection::vec(inner, 0..4).prop_map(Value::Array)
        })
    }

    proptest! {
        #[test]
        fn prop_codec_roundtrip(v in value_strategy()) {
            prop_assert_eq!(roundtrip(&v), v);
        }

        #[test]
        fn prop_storage_cmp_total(a in value_strategy(), b in value_strategy()) {
            let ab = a.storage_cmp(&b);
            let ba = b.storage_cmp(&a);
            prop_assert_eq!(ab, ba.reverse());
        }
    }
}
