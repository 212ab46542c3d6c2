//! PackStream, the self-describing binary serialization carried inside Bolt
//! messages.
//!
//! The value universe is null, booleans, 64-bit signed integers, IEEE-754
//! doubles, UTF-8 strings, byte arrays, lists, string-keyed maps, and tagged
//! structures. Encoding always uses the smallest legal marker; decoding is a
//! single zero-copy pass.

pub mod decoder;
pub mod encoder;
pub mod marker;
pub mod structures;
pub mod types;

pub use decoder::{decode, Decoder, ValueType};
pub use encoder::{encode, Encoder, StructWriter};
pub use types::{Structure, Value};

use std::fmt;

/// Errors raised by the codec. Decode-side variants indicate a violation of
/// the wire format; encode-side variants indicate an unrepresentable value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackStreamError {
    /// Input ended inside a value
    UnexpectedEof,
    /// Marker byte not assigned by the grammar
    UnknownMarker(u8),
    /// String payload is not valid UTF-8
    InvalidUtf8(String),
    /// Map key was not a string
    NonStringKey,
    /// Value exceeds the maximum encodable size
    TooLarge(&'static str, usize),
    /// Structure field count differs from the declared count
    StructArity { declared: usize, written: usize },
    /// Structure exists but has the wrong signature or field shape
    InvalidStructure(String),
}

impl fmt::Display for PackStreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackStreamError::UnexpectedEof => write!(f, "unexpected end of PackStream data"),
            PackStreamError::UnknownMarker(m) => write!(f, "unknown PackStream marker 0x{m:02X}"),
            PackStreamError::InvalidUtf8(e) => write!(f, "invalid UTF-8 in string: {e}"),
            PackStreamError::NonStringKey => write!(f, "map keys must be strings"),
            PackStreamError::TooLarge(what, size) => {
                write!(f, "{what} too large to encode: {size}")
            }
            PackStreamError::StructArity { declared, written } => write!(
                f,
                "structure declared {declared} fields but {written} were written"
            ),
            PackStreamError::InvalidStructure(what) => write!(f, "malformed {what} structure"),
        }
    }
}

impl std::error::Error for PackStreamError {}
