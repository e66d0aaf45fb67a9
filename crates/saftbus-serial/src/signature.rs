use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Result, SerialError};
use crate::value::Value;

/// A parsed type signature.
///
/// Grammar: one of `y b n q i u x t d h s v`, or `a<sig>` for a sequence,
/// or `a{s<sig>}` for a string-keyed map. `v` stands for "any value".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signature {
    Byte,
    Bool,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Double,
    Handle,
    Str,
    Variant,
    Array(Box<Signature>),
    Dict(Box<Signature>),
}

impl Signature {
    /// Parse a complete signature string.
    pub fn parse(text: &str) -> Result<Self> {
        let bytes = text.as_bytes();
        let (sig, used) = Self::parse_at(bytes, 0).ok_or_else(|| invalid(text))?;
        if used != bytes.len() {
            return Err(invalid(text));
        }
        Ok(sig)
    }

    /// Split a concatenated argument signature (`"sas"`) into its parts.
    /// The empty string yields no parts.
    pub fn parse_list(text: &str) -> Result<Vec<Self>> {
        let bytes = text.as_bytes();
        let mut parts = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            let (sig, end) = Self::parse_at(bytes, pos).ok_or_else(|| invalid(text))?;
            parts.push(sig);
            pos = end;
        }
        Ok(parts)
    }

    fn parse_at(bytes: &[u8], pos: usize) -> Option<(Self, usize)> {
        let sig = match *bytes.get(pos)? {
            b'y' => Signature::Byte,
            b'b' => Signature::Bool,
            b'n' => Signature::Int16,
            b'q' => Signature::UInt16,
            b'i' => Signature::Int32,
            b'u' => Signature::UInt32,
            b'x' => Signature::Int64,
            b't' => Signature::UInt64,
            b'd' => Signature::Double,
            b'h' => Signature::Handle,
            b's' => Signature::Str,
            b'v' => Signature::Variant,
            b'a' => {
                if bytes.get(pos + 1) == Some(&b'{') {
                    if bytes.get(pos + 2) != Some(&b's') {
                        return None;
                    }
                    let (inner, end) = Self::parse_at(bytes, pos + 3)?;
                    if bytes.get(end) != Some(&b'}') {
                        return None;
                    }
                    return Some((Signature::Dict(Box::new(inner)), end + 1));
                }
                let (inner, end) = Self::parse_at(bytes, pos + 1)?;
                return Some((Signature::Array(Box::new(inner)), end));
            }
            _ => return None,
        };
        Some((sig, pos + 1))
    }

    /// Whether `value` is acceptable where this signature is expected.
    pub fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (Signature::Variant, _) => true,
            (Signature::Byte, Value::Byte(_))
            | (Signature::Bool, Value::Bool(_))
            | (Signature::Int16, Value::Int16(_))
            | (Signature::UInt16, Value::UInt16(_))
            | (Signature::Int32, Value::Int32(_))
            | (Signature::UInt32, Value::UInt32(_))
            | (Signature::Int64, Value::Int64(_))
            | (Signature::UInt64, Value::UInt64(_))
            | (Signature::Double, Value::Double(_))
            | (Signature::Handle, Value::Handle(_))
            | (Signature::Str, Value::Str(_)) => true,
            (Signature::Array(inner), Value::Seq(items)) => items.iter().all(|v| inner.matches(v)),
            (Signature::Array(inner), Value::Bytes(_)) => **inner == Signature::Byte,
            (Signature::Array(inner), Value::IntSet(_)) => **inner == Signature::UInt32,
            (Signature::Dict(inner), Value::Map(map)) => map.values().all(|v| inner.matches(v)),
            _ => false,
        }
    }

    /// Parse a command-line literal into a value of this type.
    ///
    /// Sequences are comma separated (`1,2,3`), maps are comma separated
    /// `key=value` pairs. Booleans accept `true`/`false`/`1`/`0`.
    pub fn parse_literal(&self, literal: &str) -> Result<Value> {
        let bad = || SerialError::InvalidLiteral {
            signature: self.to_string(),
            literal: literal.to_string(),
        };
        let text = literal.trim();
        Ok(match self {
            Signature::Byte => Value::Byte(text.parse().map_err(|_| bad())?),
            Signature::Bool => Value::Bool(match text {
                "true" | "1" => true,
                "false" | "0" => false,
                _ => return Err(bad()),
            }),
            Signature::Int16 => Value::Int16(text.parse().map_err(|_| bad())?),
            Signature::UInt16 => Value::UInt16(text.parse().map_err(|_| bad())?),
            Signature::Int32 => Value::Int32(text.parse().map_err(|_| bad())?),
            Signature::UInt32 => Value::UInt32(text.parse().map_err(|_| bad())?),
            Signature::Int64 => Value::Int64(text.parse().map_err(|_| bad())?),
            Signature::UInt64 => Value::UInt64(text.parse().map_err(|_| bad())?),
            Signature::Double => Value::Double(text.parse().map_err(|_| bad())?),
            Signature::Handle => Value::Handle(text.parse().map_err(|_| bad())?),
            Signature::Str => Value::Str(literal.to_string()),
            Signature::Variant => return Err(bad()),
            Signature::Array(inner) => {
                if matches!(**inner, Signature::Array(_) | Signature::Dict(_)) {
                    return Err(bad());
                }
                let items = split_list(text)
                    .map(|item| inner.parse_literal(item))
                    .collect::<Result<Vec<_>>>()?;
                if **inner == Signature::Byte {
                    Value::Bytes(
                        items
                            .into_iter()
                            .filter_map(|v| match v {
                                Value::Byte(b) => Some(b),
                                _ => None,
                            })
                            .collect(),
                    )
                } else {
                    Value::Seq(items)
                }
            }
            Signature::Dict(inner) => {
                if matches!(**inner, Signature::Array(_) | Signature::Dict(_)) {
                    return Err(bad());
                }
                let mut map = BTreeMap::new();
                for pair in split_list(text) {
                    let (key, value) = pair.split_once('=').ok_or_else(bad)?;
                    map.insert(key.trim().to_string(), inner.parse_literal(value)?);
                }
                Value::Map(map)
            }
        })
    }
}

fn split_list(text: &str) -> impl Iterator<Item = &str> {
    text.split(',').filter(|item| !item.trim().is_empty())
}

fn invalid(text: &str) -> SerialError {
    SerialError::InvalidSignature(text.to_string())
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signature::Byte => f.write_str("y"),
            Signature::Bool => f.write_str("b"),
            Signature::Int16 => f.write_str("n"),
            Signature::UInt16 => f.write_str("q"),
            Signature::Int32 => f.write_str("i"),
            Signature::UInt32 => f.write_str("u"),
            Signature::Int64 => f.write_str("x"),
            Signature::UInt64 => f.write_str("t"),
            Signature::Double => f.write_str("d"),
            Signature::Handle => f.write_str("h"),
            Signature::Str => f.write_str("s"),
            Signature::Variant => f.write_str("v"),
            Signature::Array(inner) => write!(f, "a{inner}"),
            Signature::Dict(inner) => write!(f, "a{{s{inner}}}"),
        }
    }
}

impl std::str::FromStr for Signature {
    type Err = SerialError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
