//! PackStream encoder.
//!
//! Always emits the minimum-size encoding: the smallest legal marker for the
//! value at hand (inline tiny int before `INT_8`, `TINY_STRING` before
//! `STRING_8`, and so on).

use bytes::{BufMut, BytesMut};
use std::collections::HashMap;

use super::marker::*;
use super::types::{Structure, Value};
use super::PackStreamError;

/// Streaming encoder writing PackStream values into a byte buffer.
#[derive(Debug)]
pub struct Encoder {
    buf: BytesMut,
}

impl Encoder {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> BytesMut {
        self.buf
    }

    pub fn write_null(&mut self) {
        self.buf.put_u8(NULL);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(if value { TRUE } else { FALSE });
    }

    /// Integers pick the narrowest representation that holds the value.
    pub fn write_int(&mut self, value: i64) {
        if fits_tiny_int(value) {
            self.buf.put_u8(value as u8);
        } else if i8::try_from(value).is_ok() {
            self.buf.put_u8(INT_8);
            self.buf.put_i8(value as i8);
        } else if i16::try_from(value).is_ok() {
            self.buf.put_u8(INT_16);
            self.buf.put_i16(value as i16);
        } else if i32::try_from(value).is_ok() {
            self.buf.put_u8(INT_32);
            self.buf.put_i32(value as i32);
        } else {
            self.buf.put_u8(INT_64);
            self.buf.put_i64(value);
        }
    }

    pub fn write_float(&mut self, value: f64) {
        self.buf.put_u8(FLOAT_64);
        self.buf.put_f64(value);
    }

    pub fn write_bytes(&mut self, value: &[u8]) -> Result<(), PackStreamError> {
        match value.len() {
            n if n <= u8::MAX as usize => {
                self.buf.put_u8(BYTES_8);
                self.buf.put_u8(n as u8);
            }
            n if n <= u16::MAX as usize => {
                self.buf.put_u8(BYTES_16);
                self.buf.put_u16(n as u16);
            }
            n if n <= u32::MAX as usize => {
                self.buf.put_u8(BYTES_32);
                self.buf.put_u32(n as u32);
            }
            n => return Err(PackStreamError::TooLarge("bytes", n)),
        }
        self.buf.put_slice(value);
        Ok(())
    }

    pub fn write_string(&mut self, value: &str) -> Result<(), PackStreamError> {
        let bytes = value.as_bytes();
        self.write_sized_header(TINY_STRING, STRING_8, STRING_16, STRING_32, bytes.len())
            .map_err(|_| PackStreamError::TooLarge("string", bytes.len()))?;
        self.buf.put_slice(bytes);
        Ok(())
    }

    /// List header; the caller writes exactly `len` values after it.
    pub fn write_list_header(&mut self, len: usize) -> Result<(), PackStreamError> {
        self.write_sized_header(TINY_LIST, LIST_8, LIST_16, LIST_32, len)
            .map_err(|_| PackStreamError::TooLarge("list", len))
    }

    /// Map header; the caller writes `len` key/value pairs after it. Keys
    /// must be strings, which `write_map` enforces by type.
    pub fn write_map_header(&mut self, len: usize) -> Result<(), PackStreamError> {
        self.write_sized_header(TINY_MAP, MAP_8, MAP_16, MAP_32, len)
            .map_err(|_| PackStreamError::TooLarge("map", len))
    }

    pub fn write_map(&mut self, map: &HashMap<String, Value>) -> Result<(), PackStreamError> {
        self.write_map_header(map.len())?;
        for (key, value) in map {
            self.write_string(key)?;
            self.write_value(value)?;
        }
        Ok(())
    }

    /// Begin a structure with a declared field count. The returned writer
    /// enforces that exactly `declared` fields follow.
    pub fn begin_struct(
        &mut self,
        tag: u8,
        declared: usize,
    ) -> Result<StructWriter<'_>, PackStreamError> {
        match declared {
            n if n <= TINY_MAX => self.buf.put_u8(TINY_STRUCT + n as u8),
            n if n <= u8::MAX as usize => {
                self.buf.put_u8(STRUCT_8);
                self.buf.put_u8(n as u8);
            }
            n if n <= u16::MAX as usize => {
                self.buf.put_u8(STRUCT_16);
                self.buf.put_u16(n as u16);
            }
            n => return Err(PackStreamError::TooLarge("structure", n)),
        }
        self.buf.put_u8(tag);
        Ok(StructWriter {
            encoder: self,
            declared,
            written: 0,
        })
    }

    pub fn write_value(&mut self, value: &Value) -> Result<(), PackStreamError> {
        match value {
            Value::Null => self.write_null(),
            Value::Boolean(b) => self.write_bool(*b),
            Value::Integer(i) => self.write_int(*i),
            Value::Float(f) => self.write_float(*f),
            Value::Bytes(b) => self.write_bytes(b)?,
            Value::String(s) => self.write_string(s)?,
            Value::List(items) => {
                self.write_list_header(items.len())?;
                for item in items {
                    self.write_value(item)?;
                }
            }
            Value::Map(entries) => self.write_map(entries)?,
            Value::Structure(s) => self.write_structure(s)?,
        }
        Ok(())
    }

    pub fn write_structure(&mut self, s: &Structure) -> Result<(), PackStreamError> {
        let mut writer = self.begin_struct(s.tag, s.fields.len())?;
        for field in &s.fields {
            writer.field(field)?;
        }
        writer.finish()
    }

    fn write_sized_header(
        &mut self,
        tiny: u8,
        m8: u8,
        m16: u8,
        m32: u8,
        len: usize,
    ) -> Result<(), ()> {
        match len {
            n if n <= TINY_MAX => self.buf.put_u8(tiny + n as u8),
            n if n <= u8::MAX as usize => {
                self.buf.put_u8(m8);
                self.buf.put_u8(n as u8);
            }
            n if n <= u16::MAX as usize => {
                self.buf.put_u8(m16);
                self.buf.put_u16(n as u16);
            }
            n if n <= u32::MAX as usize => {
                self.buf.put_u8(m32);
                self.buf.put_u32(n as u32);
            }
            _ => return Err(()),
        }
        Ok(())
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes the fields of a structure whose count was declared up front.
/// Dropping the writer without `finish()` or writing a different number of
/// fields than declared is a programmer error that `finish()` reports.
#[derive(Debug)]
pub struct StructWriter<'a> {
    encoder: &'a mut Encoder,
    declared: usize,
    written: usize,
}

impl StructWriter<'_> {
    pub fn field(&mut self, value: &Value) -> Result<(), PackStreamError> {
        if self.written == self.declared {
            return Err(PackStreamError::StructArity {
                declared: self.declared,
                written: self.written + 1,
            });
        }
        self.written += 1;
        self.encoder.write_value(value)
    }

    pub fn field_string(&mut self, value: &str) -> Result<(), PackStreamError> {
        self.field(&Value::String(value.to_string()))
    }

    pub fn field_map(&mut self, map: &HashMap<String, Value>) -> Result<(), PackStreamError> {
        if self.written == self.declared {
            return Err(PackStreamError::StructArity {
                declared: self.declared,
                written: self.written + 1,
            });
        }
        self.written += 1;
        self.encoder.write_map(map)
    }

    pub fn finish(self) -> Result<(), PackStreamError> {
        if self.written != self.declared {
            return Err(PackStreamError::StructArity {
                declared: self.declared,
                written: self.written,
            });
        }
        Ok(())
    }
}

/// Encode a single value into a fresh buffer.
pub fn encode(value: &Value) -> Result<BytesMut, PackStreamError> {
    let mut encoder = Encoder::new();
    encoder.write_value(value)?;
    Ok(encoder.into_bytes())
}
