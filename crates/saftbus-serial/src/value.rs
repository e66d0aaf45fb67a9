use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use bytes::{Buf, BufMut};
use serde::ser::{Serialize, Serializer as SerdeSerializer};

use crate::codec::{Decode, Deserializer, Encode, Serializer};
use crate::error::{Result, SerialError};

/// A self-describing wire value.
///
/// Method arguments, return values, property values and signal parameters
/// all travel as `Value`s, so a generic client can call any method without
/// compile-time knowledge of its types.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(u8),
    Bool(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    /// A file descriptor number as known to the sender.
    Handle(i32),
    Str(String),
    Bytes(Vec<u8>),
    Seq(Vec<Value>),
    Map(BTreeMap<String, Value>),
    IntSet(BTreeSet<u32>),
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    Byte = 1,
    Bool = 2,
    Int16 = 3,
    UInt16 = 4,
    Int32 = 5,
    UInt32 = 6,
    Int64 = 7,
    UInt64 = 8,
    Double = 9,
    Handle = 10,
    Str = 11,
    Bytes = 12,
    Seq = 13,
    Map = 14,
    IntSet = 15,
}

impl TryFrom<u8> for Tag {
    type Error = SerialError;

    fn try_from(raw: u8) -> Result<Self> {
        Ok(match raw {
            1 => Tag::Byte,
            2 => Tag::Bool,
            3 => Tag::Int16,
            4 => Tag::UInt16,
            5 => Tag::Int32,
            6 => Tag::UInt32,
            7 => Tag::Int64,
            8 => Tag::UInt64,
            9 => Tag::Double,
            10 => Tag::Handle,
            11 => Tag::Str,
            12 => Tag::Bytes,
            13 => Tag::Seq,
            14 => Tag::Map,
            15 => Tag::IntSet,
            other => return Err(SerialError::UnknownTag(other)),
        })
    }
}

impl Value {
    fn tag(&self) -> Tag {
        match self {
            Value::Byte(_) => Tag::Byte,
            Value::Bool(_) => Tag::Bool,
            Value::Int16(_) => Tag::Int16,
            Value::UInt16(_) => Tag::UInt16,
            Value::Int32(_) => Tag::Int32,
            Value::UInt32(_) => Tag::UInt32,
            Value::Int64(_) => Tag::Int64,
            Value::UInt64(_) => Tag::UInt64,
            Value::Double(_) => Tag::Double,
            Value::Handle(_) => Tag::Handle,
            Value::Str(_) => Tag::Str,
            Value::Bytes(_) => Tag::Bytes,
            Value::Seq(_) => Tag::Seq,
            Value::Map(_) => Tag::Map,
            Value::IntSet(_) => Tag::IntSet,
        }
    }

    /// Human-readable type name used in mismatch errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Byte(_) => "byte",
            Value::Bool(_) => "bool",
            Value::Int16(_) => "int16",
            Value::UInt16(_) => "uint16",
            Value::Int32(_) => "int32",
            Value::UInt32(_) => "uint32",
            Value::Int64(_) => "int64",
            Value::UInt64(_) => "uint64",
            Value::Double(_) => "double",
            Value::Handle(_) => "handle",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Seq(_) => "sequence",
            Value::Map(_) => "map",
            Value::IntSet(_) => "int-set",
        }
    }

    /// Type signature of this value.
    ///
    /// Homogeneous containers report their element type; empty or mixed
    /// containers fall back to `v`.
    pub fn signature(&self) -> String {
        match self {
            Value::Byte(_) => "y".into(),
            Value::Bool(_) => "b".into(),
            Value::Int16(_) => "n".into(),
            Value::UInt16(_) => "q".into(),
            Value::Int32(_) => "i".into(),
            Value::UInt32(_) => "u".into(),
            Value::Int64(_) => "x".into(),
            Value::UInt64(_) => "t".into(),
            Value::Double(_) => "d".into(),
            Value::Handle(_) => "h".into(),
            Value::Str(_) => "s".into(),
            Value::Bytes(_) => "ay".into(),
            Value::IntSet(_) => "au".into(),
            Value::Seq(items) => format!("a{}", common_signature(items.iter())),
            Value::Map(map) => format!("a{{s{}}}", common_signature(map.values())),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Value::Seq(items) => Some(items),
            _ => None,
        }
    }

    fn mismatch(&self, expected: &str) -> SerialError {
        SerialError::TypeMismatch {
            expected: expected.to_string(),
            found: self.type_name().to_string(),
        }
    }
}

fn common_signature<'a>(mut items: impl Iterator<Item = &'a Value>) -> String {
    let Some(first) = items.next() else {
        return "v".into();
    };
    let sig = first.signature();
    if items.all(|v| v.signature() == sig) {
        sig
    } else {
        "v".into()
    }
}

impl Encode for Value {
    fn encode(&self, ser: &mut Serializer) {
        ser.buf_mut().put_u8(self.tag() as u8);
        match self {
            Value::Byte(v) => v.encode(ser),
            Value::Bool(v) => v.encode(ser),
            Value::Int16(v) => v.encode(ser),
            Value::UInt16(v) => v.encode(ser),
            Value::Int32(v) => v.encode(ser),
            Value::UInt32(v) => v.encode(ser),
            Value::Int64(v) => v.encode(ser),
            Value::UInt64(v) => v.encode(ser),
            Value::Double(v) => v.encode(ser),
            Value::Handle(v) => v.encode(ser),
            Value::Str(v) => v.encode(ser),
            Value::Bytes(v) => {
                ser.put_len(v.len());
                ser.put_raw(v);
            }
            Value::Seq(v) => v.encode(ser),
            Value::Map(v) => v.encode(ser),
            Value::IntSet(v) => v.encode(ser),
        }
    }
}

impl Decode for Value {
    fn decode(de: &mut Deserializer) -> Result<Self> {
        de.need(1)?;
        let tag = Tag::try_from(de.buf_mut().get_u8())?;
        Ok(match tag {
            Tag::Byte => Value::Byte(de.get()?),
            Tag::Bool => Value::Bool(de.get()?),
            Tag::Int16 => Value::Int16(de.get()?),
            Tag::UInt16 => Value::UInt16(de.get()?),
            Tag::Int32 => Value::Int32(de.get()?),
            Tag::UInt32 => Value::UInt32(de.get()?),
            Tag::Int64 => Value::Int64(de.get()?),
            Tag::UInt64 => Value::UInt64(de.get()?),
            Tag::Double => Value::Double(de.get()?),
            Tag::Handle => Value::Handle(de.get()?),
            Tag::Str => Value::Str(de.get()?),
            Tag::Bytes => {
                let len = de.get_len()?;
                Value::Bytes(de.take(len)?.to_vec())
            }
            Tag::IntSet => Value::IntSet(de.get()?),
            Tag::Seq => {
                de.enter()?;
                let items = de.get::<Vec<Value>>();
                de.leave();
                Value::Seq(items?)
            }
            Tag::Map => {
                de.enter()?;
                let map = de.get::<BTreeMap<String, Value>>();
                de.leave();
                Value::Map(map?)
            }
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Byte(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int16(v) => write!(f, "{v}"),
            Value::UInt16(v) => write!(f, "{v}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::UInt32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::UInt64(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Handle(v) => write!(f, "fd:{v}"),
            Value::Str(v) => write!(f, "{v}"),
            Value::Bytes(v) => write_list(f, v.iter()),
            Value::Seq(v) => write_list(f, v.iter()),
            Value::IntSet(v) => write_list(f, v.iter()),
            Value::Map(map) => {
                f.write_str("{")?;
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}: {value}")?;
                }
                f.write_str("}")
            }
        }
    }
}

fn write_list<T: fmt::Display>(
    f: &mut fmt::Formatter<'_>,
    items: impl Iterator<Item = T>,
) -> fmt::Result {
    f.write_str("[")?;
    for (i, item) in items.enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    f.write_str("]")
}

impl Serialize for Value {
    fn serialize<S: SerdeSerializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Byte(v) => s.serialize_u8(*v),
            Value::Bool(v) => s.serialize_bool(*v),
            Value::Int16(v) => s.serialize_i16(*v),
            Value::UInt16(v) => s.serialize_u16(*v),
            Value::Int32(v) => s.serialize_i32(*v),
            Value::UInt32(v) => s.serialize_u32(*v),
            Value::Int64(v) => s.serialize_i64(*v),
            Value::UInt64(v) => s.serialize_u64(*v),
            Value::Double(v) => s.serialize_f64(*v),
            Value::Handle(v) => s.serialize_i32(*v),
            Value::Str(v) => s.serialize_str(v),
            Value::Bytes(v) => s.collect_seq(v),
            Value::Seq(v) => s.collect_seq(v),
            Value::Map(v) => s.collect_map(v),
            Value::IntSet(v) => s.collect_seq(v),
        }
    }
}

/// Conversion out of a [`Value`] with a type check.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self>;
}

/// Conversion into a [`Value`].
pub trait IntoValue {
    fn into_value(self) -> Value;
}

macro_rules! scalar_value {
    ($($ty:ty => $variant:ident, $name:literal;)*) => {
        $(
            impl FromValue for $ty {
                fn from_value(value: Value) -> Result<Self> {
                    match value {
                        Value::$variant(v) => Ok(v),
                        other => Err(other.mismatch($name)),
                    }
                }
            }

            impl IntoValue for $ty {
                fn into_value(self) -> Value {
                    Value::$variant(self)
                }
            }
        )*
    };
}

scalar_value! {
    u8 => Byte, "byte";
    bool => Bool, "bool";
    i16 => Int16, "int16";
    u16 => UInt16, "uint16";
    i32 => Int32, "int32";
    u32 => UInt32, "uint32";
    i64 => Int64, "int64";
    u64 => UInt64, "uint64";
    f64 => Double, "double";
    String => Str, "string";
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

impl IntoValue for Value {
    fn into_value(self) -> Value {
        self
    }
}

impl IntoValue for &str {
    fn into_value(self) -> Value {
        Value::Str(self.to_string())
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Seq(items) => items.into_iter().map(T::from_value).collect(),
            Value::Bytes(bytes) => bytes
                .into_iter()
                .map(|b| T::from_value(Value::Byte(b)))
                .collect(),
            other => Err(other.mismatch("sequence")),
        }
    }
}

impl<T: IntoValue> IntoValue for Vec<T> {
    fn into_value(self) -> Value {
        Value::Seq(self.into_iter().map(IntoValue::into_value).collect())
    }
}

impl<V: FromValue> FromValue for BTreeMap<String, V> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Map(map) => map
                .into_iter()
                .map(|(k, v)| Ok((k, V::from_value(v)?)))
                .collect(),
            other => Err(other.mismatch("map")),
        }
    }
}

impl<V: IntoValue> IntoValue for BTreeMap<String, V> {
    fn into_value(self) -> Value {
        Value::Map(self.into_iter().map(|(k, v)| (k, v.into_value())).collect())
    }
}

impl FromValue for BTreeSet<u32> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::IntSet(set) => Ok(set),
            Value::Seq(items) => items.into_iter().map(u32::from_value).collect(),
            other => Err(other.mismatch("int-set")),
        }
    }
}

impl IntoValue for BTreeSet<u32> {
    fn into_value(self) -> Value {
        Value::IntSet(self)
    }
}
