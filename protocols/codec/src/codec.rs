//! Field-level encoding.
//!
//! All integers little-endian. Booleans one byte, zero or one. Byte strings
//! and sequences carry a length prefix whose width is fixed by the type.

use core::convert::TryInto;

use crate::{
    datatypes::{Seq0255, Seq064K, Str0255, B0255, B016M, B064K, U24, U256},
    error::{Error, Result},
};

/// Cursor over a message payload.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::TruncatedField {
                expected: len,
                remaining: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    /// Fails unless every byte of the payload was consumed.
    pub fn finish(self) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(Error::TrailingBytes(n)),
        }
    }
}

pub trait Encodable {
    fn encoded_len(&self) -> usize;
    fn encode(&self, out: &mut Vec<u8>);
}

pub trait Decodable: Sized {
    fn decode(reader: &mut Reader<'_>) -> Result<Self>;
}

impl Encodable for u8 {
    fn encoded_len(&self) -> usize {
        1
    }
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(*self);
    }
}

impl Decodable for u8 {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(reader.take(1)?[0])
    }
}

impl Encodable for bool {
    fn encoded_len(&self) -> usize {
        1
    }
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(u8::from(*self));
    }
}

impl Decodable for bool {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        match reader.take(1)?[0] {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::UnknownEnum(other)),
        }
    }
}

macro_rules! int_codec {
    ($ty:ty, $len:expr) => {
        impl Encodable for $ty {
            fn encoded_len(&self) -> usize {
                $len
            }
            fn encode(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
        }

        impl Decodable for $ty {
            fn decode(reader: &mut Reader<'_>) -> Result<Self> {
                let bytes = reader.take($len)?;
                Ok(<$ty>::from_le_bytes(bytes.try_into().expect("fixed width")))
            }
        }
    };
}

int_codec!(u16, 2);
int_codec!(u32, 4);
int_codec!(u64, 8);

impl Encodable for U24 {
    fn encoded_len(&self) -> usize {
        3
    }
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
}

impl Decodable for U24 {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        let bytes = reader.take(3)?;
        Ok(U24::from_le_bytes([bytes[0], bytes[1], bytes[2]]))
    }
}

impl Encodable for U256 {
    fn encoded_len(&self) -> usize {
        32
    }
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0);
    }
}

impl Decodable for U256 {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        let bytes = reader.take(32)?;
        Ok(U256(bytes.try_into().expect("fixed width")))
    }
}

impl Encodable for Str0255 {
    fn encoded_len(&self) -> usize {
        1 + self.len()
    }
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.len() as u8);
        out.extend_from_slice(self.as_str().as_bytes());
    }
}

impl Decodable for Str0255 {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        let len = reader.take(1)?[0] as usize;
        let bytes = reader.take(len)?;
        let s = String::from_utf8_lossy(bytes).into_owned();
        s.try_into()
    }
}

impl Encodable for B0255 {
    fn encoded_len(&self) -> usize {
        1 + self.len()
    }
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.len() as u8);
        out.extend_from_slice(self.as_bytes());
    }
}

impl Decodable for B0255 {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        let len = reader.take(1)?[0] as usize;
        reader.take(len)?.try_into()
    }
}

impl Encodable for B064K {
    fn encoded_len(&self) -> usize {
        2 + self.len()
    }
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.len() as u16).to_le_bytes());
        out.extend_from_slice(self.as_bytes());
    }
}

impl Decodable for B064K {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        let len = u16::decode(reader)? as usize;
        reader.take(len)?.try_into()
    }
}

impl Encodable for B016M {
    fn encoded_len(&self) -> usize {
        3 + self.len()
    }
    fn encode(&self, out: &mut Vec<u8>) {
        let len = U24::try_from(self.len() as u32).expect("bounded at construction");
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(self.as_bytes());
    }
}

impl Decodable for B016M {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        let len: u32 = U24::decode(reader)?.into();
        reader.take(len as usize)?.try_into()
    }
}

impl<T: Encodable> Encodable for Seq0255<T> {
    fn encoded_len(&self) -> usize {
        1 + self.as_slice().iter().map(Encodable::encoded_len).sum::<usize>()
    }
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.len() as u8);
        for item in self.as_slice() {
            item.encode(out);
        }
    }
}

impl<T: Decodable> Decodable for Seq0255<T> {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        let count = reader.take(1)?[0] as usize;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(T::decode(reader)?);
        }
        items.try_into()
    }
}

impl<T: Encodable> Encodable for Seq064K<T> {
    fn encoded_len(&self) -> usize {
        2 + self.as_slice().iter().map(Encodable::encoded_len).sum::<usize>()
    }
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.len() as u16).to_le_bytes());
        for item in self.as_slice() {
            item.encode(out);
        }
    }
}

impl<T: Decodable> Decodable for Seq064K<T> {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        let count = u16::decode(reader)? as usize;
        let mut items = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            items.push(T::decode(reader)?);
        }
        items.try_into()
    }
}

/// Encodes a full message payload.
pub fn to_bytes<T: Encodable>(value: &T) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.encoded_len());
    value.encode(&mut out);
    out
}

/// Decodes a full message payload, rejecting trailing bytes.
pub fn from_bytes<T: Decodable>(payload: &[u8]) -> Result<T> {
    let mut reader = Reader::new(payload);
    let value = T::decode(&mut reader)?;
    reader.finish()?;
    Ok(value)
}
