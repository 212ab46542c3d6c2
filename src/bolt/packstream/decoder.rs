//! PackStream decoder.
//!
//! A zero-copy, single-pass reader over a contiguous byte span. `peek_type`
//! inspects the next marker without advancing; `read_str` borrows from the
//! input.

use bytes::Buf;
use std::collections::HashMap;

use super::marker::*;
use super::types::{Structure, Value};
use super::PackStreamError;

/// Broad PackStream type of an encoded value, derivable from its marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Null,
    Boolean,
    Integer,
    Float,
    Bytes,
    String,
    List,
    Map,
    Structure,
}

/// Decoder over a borrowed byte span.
#[derive(Debug)]
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    /// Type of the next value. Does not advance the position.
    pub fn peek_type(&self) -> Result<ValueType, PackStreamError> {
        let marker = *self
            .data
            .get(self.pos)
            .ok_or(PackStreamError::UnexpectedEof)?;
        if is_tiny_int(marker) {
            return Ok(ValueType::Integer);
        }
        Ok(match marker {
            NULL => ValueType::Null,
            TRUE | FALSE => ValueType::Boolean,
            FLOAT_64 => ValueType::Float,
            INT_8 | INT_16 | INT_32 | INT_64 => ValueType::Integer,
            BYTES_8 | BYTES_16 | BYTES_32 => ValueType::Bytes,
            0x80..=0x8F | STRING_8 | STRING_16 | STRING_32 => ValueType::String,
            0x90..=0x9F | LIST_8 | LIST_16 | LIST_32 => ValueType::List,
            0xA0..=0xAF | MAP_8 | MAP_16 | MAP_32 => ValueType::Map,
            0xB0..=0xBF | STRUCT_8 | STRUCT_16 => ValueType::Structure,
            other => return Err(PackStreamError::UnknownMarker(other)),
        })
    }

    /// Decode the next value, whatever its type.
    pub fn read_value(&mut self) -> Result<Value, PackStreamError> {
        let marker = self.take_u8()?;

        if is_tiny_int(marker) {
            return Ok(Value::Integer(marker as i8 as i64));
        }

        match marker {
            NULL => Ok(Value::Null),
            TRUE => Ok(Value::Boolean(true)),
            FALSE => Ok(Value::Boolean(false)),
            FLOAT_64 => Ok(Value::Float(f64::from_bits(self.take_fixed::<8>()?.get_u64()))),
            INT_8 => Ok(Value::Integer(self.take_u8()? as i8 as i64)),
            INT_16 => Ok(Value::Integer(self.take_fixed::<2>()?.get_i16() as i64)),
            INT_32 => Ok(Value::Integer(self.take_fixed::<4>()?.get_i32() as i64)),
            INT_64 => Ok(Value::Integer(self.take_fixed::<8>()?.get_i64())),
            BYTES_8 | BYTES_16 | BYTES_32 => {
                let len = self.take_len(marker - BYTES_8)?;
                Ok(Value::Bytes(self.take_slice(len)?.to_vec()))
            }
            0x80..=0x8F => {
                let len = tiny_len(marker);
                Ok(Value::String(self.take_str(len)?.to_string()))
            }
            STRING_8 | STRING_16 | STRING_32 => {
                let len = self.take_len(marker - STRING_8)?;
                Ok(Value::String(self.take_str(len)?.to_string()))
            }
            0x90..=0x9F => self.read_list_items(tiny_len(marker)),
            LIST_8 | LIST_16 | LIST_32 => {
                let len = self.take_len(marker - LIST_8)?;
                self.read_list_items(len)
            }
            0xA0..=0xAF => self.read_map_entries(tiny_len(marker)),
            MAP_8 | MAP_16 | MAP_32 => {
                let len = self.take_len(marker - MAP_8)?;
                self.read_map_entries(len)
            }
            0xB0..=0xBF => self.read_struct_fields(tiny_len(marker)),
            STRUCT_8 => {
                let len = self.take_u8()? as usize;
                self.read_struct_fields(len)
            }
            STRUCT_16 => {
                let len = self.take_fixed::<2>()?.get_u16() as usize;
                self.read_struct_fields(len)
            }
            other => Err(PackStreamError::UnknownMarker(other)),
        }
    }

    /// Decode a string, borrowing its bytes from the input span.
    pub fn read_str(&mut self) -> Result<&'a str, PackStreamError> {
        let marker = self.take_u8()?;
        let len = match marker {
            0x80..=0x8F => tiny_len(marker),
            STRING_8 | STRING_16 | STRING_32 => self.take_len(marker - STRING_8)?,
            other => return Err(PackStreamError::UnknownMarker(other)),
        };
        self.take_str(len)
    }

    /// Decode a structure header, returning its signature and declared field
    /// count. The caller must read exactly that many values.
    pub fn read_struct_header(&mut self) -> Result<(u8, usize), PackStreamError> {
        let marker = self.take_u8()?;
        let count = match marker {
            0xB0..=0xBF => tiny_len(marker),
            STRUCT_8 => self.take_u8()? as usize,
            STRUCT_16 => self.take_fixed::<2>()?.get_u16() as usize,
            other => return Err(PackStreamError::UnknownMarker(other)),
        };
        let tag = self.take_u8()?;
        Ok((tag, count))
    }

    fn read_list_items(&mut self, len: usize) -> Result<Value, PackStreamError> {
        let mut items = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            items.push(self.read_value()?);
        }
        Ok(Value::List(items))
    }

    fn read_map_entries(&mut self, len: usize) -> Result<Value, PackStreamError> {
        let mut entries = HashMap::with_capacity(len.min(1024));
        for _ in 0..len {
            if self.peek_type()? != ValueType::String {
                return Err(PackStreamError::NonStringKey);
            }
            let key = self.read_str()?.to_string();
            entries.insert(key, self.read_value()?);
        }
        Ok(Value::Map(entries))
    }

    fn read_struct_fields(&mut self, count: usize) -> Result<Value, PackStreamError> {
        let tag = self.take_u8()?;
        let mut fields = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            fields.push(self.read_value()?);
        }
        Ok(Value::Structure(Structure::new(tag, fields)))
    }

    // Length field of width 1/2/4 bytes, selected by (marker - base).
    fn take_len(&mut self, width_selector: u8) -> Result<usize, PackStreamError> {
        Ok(match width_selector {
            0 => self.take_u8()? as usize,
            1 => self.take_fixed::<2>()?.get_u16() as usize,
            _ => self.take_fixed::<4>()?.get_u32() as usize,
        })
    }

    fn take_u8(&mut self) -> Result<u8, PackStreamError> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or(PackStreamError::UnexpectedEof)?;
        self.pos += 1;
        Ok(byte)
    }

    fn take_fixed<const N: usize>(&mut self) -> Result<&'a [u8], PackStreamError> {
        self.take_slice(N)
    }

    fn take_slice(&mut self, len: usize) -> Result<&'a [u8], PackStreamError> {
        if self.remaining() < len {
            return Err(PackStreamError::UnexpectedEof);
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_str(&mut self, len: usize) -> Result<&'a str, PackStreamError> {
        let bytes = self.take_slice(len)?;
        std::str::from_utf8(bytes).map_err(|e| PackStreamError::InvalidUtf8(e.to_string()))
    }
}

/// Decode a single value from a byte span.
pub fn decode(data: &[u8]) -> Result<Value, PackStreamError> {
    Decoder::new(data).read_value()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bolt::packstream::encode;

    #[test]
    fn scalars() {
        assert_eq!(decode(&[0xC0]).unwrap(), Value::Null);
        assert_eq!(decode(&[0xC3]).unwrap(), Value::Boolean(true));
        assert_eq!(decode(&[0xC2]).unwrap(), Value::Boolean(false));
        assert_eq!(decode(&[0x2A]).unwrap(), Value::Integer(42));
        assert_eq!(decode(&[0xF0]).unwrap(), Value::Integer(-16));
        assert_eq!(decode(&[0xC8, 0xEF]).unwrap(), Value::Integer(-17));
        assert_eq!(decode(&[0xC9, 0x00, 0xC8]).unwrap(), Value::Integer(200));
    }

    #[test]
    fn peek_does_not_advance() {
        let data = [0x85, b'h', b'e', b'l', b'l', b'o'];
        let mut dec = Decoder::new(&data);
        assert_eq!(dec.peek_type().unwrap(), ValueType::String);
        assert_eq!(dec.peek_type().unwrap(), ValueType::String);
        assert_eq!(dec.position(), 0);
        assert_eq!(dec.read_str().unwrap(), "hello");
        assert!(dec.is_exhausted());
    }

    #[test]
    fn borrowed_string_shares_input() {
        let data = [0x82, b'o', b'k'];
        let mut dec = Decoder::new(&data);
        let s = dec.read_str().unwrap();
        assert_eq!(s.as_ptr(), data[1..].as_ptr());
    }

    #[test]
    fn struct_header_and_fields() {
        let data = [0xB3, 0x4E, 0x01, 0x90, 0xA0];
        let mut dec = Decoder::new(&data);
        let (tag, count) = dec.read_struct_header().unwrap();
        assert_eq!(tag, 0x4E);
        assert_eq!(count, 3);
        for _ in 0..count {
            dec.read_value().unwrap();
        }
        assert!(dec.is_exhausted());
    }

    #[test]
    fn nested_collections() {
        let data = [
            0x91, // list of 1
            0xA1, 0x81, b'x', 0x05, // {"x": 5}
        ];
        let value = decode(&data).unwrap();
        let list = value.as_list().unwrap();
        let map = list[0].as_map().unwrap();
        assert_eq!(map.get("x"), Some(&Value::Integer(5)));
    }

    #[test]
    fn unknown_marker_is_an_error() {
        // 0xC4..=0xC7 are unassigned.
        for marker in [0xC4u8, 0xC5, 0xC6, 0xC7, 0xCF, 0xD3, 0xD7, 0xDB, 0xDE, 0xDF] {
            assert!(matches!(
                decode(&[marker]),
                Err(PackStreamError::UnknownMarker(m)) if m == marker
            ));
        }
    }

    #[test]
    fn truncation_is_an_error_not_a_panic() {
        let cases: &[&[u8]] = &[
            &[0xC9],             // INT_16 missing payload
            &[0xC1, 0x00],       // FLOAT_64 short
            &[0xD0, 5, b'a'],    // STRING_8 short
            &[0x93, 0x01],       // list missing items
            &[0xB1],             // struct missing tag
            &[0xA1, 0x81, b'k'], // map missing value
        ];
        for case in cases {
            assert!(matches!(decode(case), Err(PackStreamError::UnexpectedEof)));
        }
    }

    #[test]
    fn invalid_utf8_rejected() {
        assert!(matches!(
            decode(&[0x82, 0xFF, 0xFE]),
            Err(PackStreamError::InvalidUtf8(_))
        ));
    }

    #[test]
    fn map_keys_must_be_strings() {
        // {1: 2} — integer key.
        assert!(matches!(
            decode(&[0xA1, 0x01, 0x02]),
            Err(PackStreamError::NonStringKey)
        ));
    }

    #[test]
    fn round_trips_decode_what_encode_wrote() {
        let mut map = HashMap::new();
        map.insert("k".to_string(), Value::List(vec![Value::Integer(1)]));
        let values = [
            Value::Null,
            Value::Boolean(false),
            Value::Integer(i64::MIN),
            Value::Float(-0.5),
            Value::Bytes(vec![0; 40]),
            Value::String("naïve".to_string()),
            Value::List(vec![Value::Null, Value::from("a")]),
            Value::Map(map),
            Value::Structure(Structure::new(0x50, vec![Value::Integer(9)])),
        ];
        for v in values {
            assert_eq!(decode(&encode(&v).unwrap()).unwrap(), v, "value {v:?}");
        }
    }
}
