use std::collections::{BTreeMap, BTreeSet};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, SerialError};

/// Nesting limit for tagged containers read off the wire.
pub const MAX_DEPTH: usize = 32;

/// A type that writes itself into a [`Serializer`] without a type tag.
pub trait Encode {
    fn encode(&self, ser: &mut Serializer);
}

/// A type that reads itself from a [`Deserializer`] without a type tag.
pub trait Decode: Sized {
    fn decode(de: &mut Deserializer) -> Result<Self>;
}

/// Growable output buffer for one message payload.
#[derive(Debug, Default)]
pub struct Serializer {
    buf: BytesMut,
}

impl Serializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value and return `self` for chaining.
    pub fn put<T: Encode + ?Sized>(&mut self, value: &T) -> &mut Self {
        value.encode(self);
        self
    }

    /// Write a length prefix.
    ///
    /// Payloads are bounded far below `u32::MAX` by the frame layer, which
    /// rejects anything larger before it reaches the socket.
    pub fn put_len(&mut self, len: usize) {
        self.buf.put_u32_le(len as u32);
    }

    pub fn put_raw(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    pub(crate) fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

/// Cursor over a received payload.
#[derive(Debug)]
pub struct Deserializer {
    buf: Bytes,
    depth: usize,
}

impl Deserializer {
    pub fn new(buf: impl Into<Bytes>) -> Self {
        Self {
            buf: buf.into(),
            depth: 0,
        }
    }

    /// Read the next field as `T`.
    pub fn get<T: Decode>(&mut self) -> Result<T> {
        T::decode(self)
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Succeed only if every byte of the payload was consumed.
    pub fn finish(self) -> Result<()> {
        match self.buf.remaining() {
            0 => Ok(()),
            n => Err(SerialError::TrailingBytes(n)),
        }
    }

    pub(crate) fn need(&self, needed: usize) -> Result<()> {
        let remaining = self.buf.remaining();
        if remaining < needed {
            return Err(SerialError::Truncated { needed, remaining });
        }
        Ok(())
    }

    pub fn get_len(&mut self) -> Result<usize> {
        self.need(4)?;
        Ok(self.buf.get_u32_le() as usize)
    }

    pub(crate) fn take(&mut self, len: usize) -> Result<Bytes> {
        self.need(len)?;
        Ok(self.buf.split_to(len))
    }

    pub(crate) fn buf_mut(&mut self) -> &mut Bytes {
        &mut self.buf
    }

    pub(crate) fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(SerialError::TooDeep(MAX_DEPTH));
        }
        Ok(())
    }

    pub(crate) fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    /// Capacity hint for a container of `count` elements that cannot exceed
    /// what is left in the buffer.
    fn capacity_hint(&self, count: usize) -> usize {
        count.min(self.buf.remaining())
    }
}

macro_rules! fixed_width {
    ($($ty:ty => $put:ident, $get:ident;)*) => {
        $(
            impl Encode for $ty {
                fn encode(&self, ser: &mut Serializer) {
                    ser.buf_mut().$put(*self);
                }
            }

            impl Decode for $ty {
                fn decode(de: &mut Deserializer) -> Result<Self> {
                    de.need(std::mem::size_of::<$ty>())?;
                    Ok(de.buf_mut().$get())
                }
            }
        )*
    };
}

fixed_width! {
    u8 => put_u8, get_u8;
    i16 => put_i16_le, get_i16_le;
    u16 => put_u16_le, get_u16_le;
    i32 => put_i32_le, get_i32_le;
    u32 => put_u32_le, get_u32_le;
    i64 => put_i64_le, get_i64_le;
    u64 => put_u64_le, get_u64_le;
    f64 => put_f64_le, get_f64_le;
}

impl Encode for bool {
    fn encode(&self, ser: &mut Serializer) {
        ser.buf_mut().put_u8(u8::from(*self));
    }
}

impl Decode for bool {
    fn decode(de: &mut Deserializer) -> Result<Self> {
        Ok(u8::decode(de)? != 0)
    }
}

impl Encode for str {
    fn encode(&self, ser: &mut Serializer) {
        ser.put_len(self.len());
        ser.put_raw(self.as_bytes());
    }
}

impl Encode for String {
    fn encode(&self, ser: &mut Serializer) {
        self.as_str().encode(ser);
    }
}

impl Decode for String {
    fn decode(de: &mut Deserializer) -> Result<Self> {
        let len = de.get_len()?;
        let raw = de.take(len)?;
        Ok(String::from_utf8(raw.to_vec())?)
    }
}

impl<T: Encode + ?Sized> Encode for &T {
    fn encode(&self, ser: &mut Serializer) {
        (**self).encode(ser);
    }
}

impl<T: Encode> Encode for [T] {
    fn encode(&self, ser: &mut Serializer) {
        ser.put_len(self.len());
        for item in self {
            item.encode(ser);
        }
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, ser: &mut Serializer) {
        self.as_slice().encode(ser);
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(de: &mut Deserializer) -> Result<Self> {
        let count = de.get_len()?;
        let mut out = Vec::with_capacity(de.capacity_hint(count));
        for _ in 0..count {
            out.push(T::decode(de)?);
        }
        Ok(out)
    }
}

impl<K: Encode, V: Encode> Encode for BTreeMap<K, V> {
    fn encode(&self, ser: &mut Serializer) {
        ser.put_len(self.len());
        for (key, value) in self {
            key.encode(ser);
            value.encode(ser);
        }
    }
}

impl<K: Decode + Ord, V: Decode> Decode for BTreeMap<K, V> {
    fn decode(de: &mut Deserializer) -> Result<Self> {
        let count = de.get_len()?;
        let mut out = BTreeMap::new();
        for _ in 0..count {
            let key = K::decode(de)?;
            let value = V::decode(de)?;
            out.insert(key, value);
        }
        Ok(out)
    }
}

impl<T: Encode> Encode for BTreeSet<T> {
    fn encode(&self, ser: &mut Serializer) {
        ser.put_len(self.len());
        for item in self {
            item.encode(ser);
        }
    }
}

impl<T: Decode + Ord> Decode for BTreeSet<T> {
    fn decode(de: &mut Deserializer) -> Result<Self> {
        let count = de.get_len()?;
        let mut out = BTreeSet::new();
        for _ in 0..count {
            out.insert(T::decode(de)?);
        }
        Ok(out)
    }
}

impl<A: Encode, B: Encode> Encode for (A, B) {
    fn encode(&self, ser: &mut Serializer) {
        self.0.encode(ser);
        self.1.encode(ser);
    }
}

impl<A: Decode, B: Decode> Decode for (A, B) {
    fn decode(de: &mut Deserializer) -> Result<Self> {
        Ok((A::decode(de)?, B::decode(de)?))
    }
}
