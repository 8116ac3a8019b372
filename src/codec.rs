//! Typed value codec for preference values
//!
//! Preferences hold one of a small closed set of primitive types. Each encoded
//! value carries a one-byte type tag so that reading with the wrong type fails
//! instead of reinterpreting bytes:
//!
//! ```text
//! 0x01 string  u32 BE length ‖ UTF-8 bytes
//! 0x02 bool    one byte, 0 or 1
//! 0x03 int32   4 bytes BE
//! 0x04 int64   8 bytes BE
//! ```

use crate::error::{Result, VaultError};

const TAG_STRING: u8 = 0x01;
const TAG_BOOL: u8 = 0x02;
const TAG_INT32: u8 = 0x03;
const TAG_INT64: u8 = 0x04;

/// A preference value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefValue {
    String(String),
    Bool(bool),
    Int32(i32),
    Int64(i64),
}

impl PrefValue {
    /// Name of the contained type, used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            PrefValue::String(_) => "string",
            PrefValue::Bool(_) => "bool",
            PrefValue::Int32(_) => "int32",
            PrefValue::Int64(_) => "int64",
        }
    }

    /// Encode into the tagged binary form. Strings longer than `u32::MAX` bytes
    /// do not fit the length header and are rejected.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(match self {
            PrefValue::String(s) => {
                let mut out = Vec::with_capacity(5 + s.len());
                out.push(TAG_STRING);
                out.extend_from_slice(&length_header(s.len())?);
                out.extend_from_slice(s.as_bytes());
                out
            }
            PrefValue::Bool(b) => vec![TAG_BOOL, u8::from(*b)],
            PrefValue::Int32(v) => {
                let mut out = vec![TAG_INT32];
                out.extend_from_slice(&v.to_be_bytes());
                out
            }
            PrefValue::Int64(v) => {
                let mut out = vec![TAG_INT64];
                out.extend_from_slice(&v.to_be_bytes());
                out
            }
        })
    }

    /// Decode the tagged binary form. Trailing bytes are rejected.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (&tag, body) = bytes
            .split_first()
            .ok_or_else(|| VaultError::Decode("empty value".into()))?;

        match tag {
            TAG_STRING => {
                let (len, rest) = take::<4>(body, "string length")?;
                let len = u32::from_be_bytes(len) as usize;
                if rest.len() != len {
                    return Err(VaultError::Decode(format!(
                        "string length mismatch: header {}, got {}",
                        len,
                        rest.len()
                    )));
                }
                let s = std::str::from_utf8(rest)
                    .map_err(|e| VaultError::Decode(format!("invalid UTF-8: {}", e)))?;
                Ok(PrefValue::String(s.to_owned()))
            }
            TAG_BOOL => match exact::<1>(body, "bool")? {
                [0] => Ok(PrefValue::Bool(false)),
                [1] => Ok(PrefValue::Bool(true)),
                [other] => Err(VaultError::Decode(format!("invalid bool byte {:#04x}", other))),
            },
            TAG_INT32 => Ok(PrefValue::Int32(i32::from_be_bytes(exact::<4>(body, "int32")?))),
            TAG_INT64 => Ok(PrefValue::Int64(i64::from_be_bytes(exact::<8>(body, "int64")?))),
            other => Err(VaultError::Decode(format!("unknown type tag {:#04x}", other))),
        }
    }
}

fn length_header(len: usize) -> Result<[u8; 4]> {
    u32::try_from(len)
        .map(u32::to_be_bytes)
        .map_err(|_| VaultError::Serialization(format!("string of {} bytes exceeds u32 length", len)))
}

fn take<'a, const N: usize>(bytes: &'a [u8], what: &str) -> Result<([u8; N], &'a [u8])> {
    if bytes.len() < N {
        return Err(VaultError::Decode(format!("truncated {}", what)));
    }
    let (head, rest) = bytes.split_at(N);
    let mut out = [0u8; N];
    out.copy_from_slice(head);
    Ok((out, rest))
}

fn exact<const N: usize>(bytes: &[u8], what: &str) -> Result<[u8; N]> {
    let (out, rest) = take::<N>(bytes, what)?;
    if !rest.is_empty() {
        return Err(VaultError::Decode(format!("{} trailing bytes after {}", rest.len(), what)));
    }
    Ok(out)
}

/// Rust types that can be stored as a preference
pub trait PrefType: Sized {
    /// Type name matching `PrefValue::type_name`
    const TYPE_NAME: &'static str;

    fn into_value(self) -> PrefValue;

    fn from_value(value: PrefValue) -> Result<Self>;
}

fn mismatch<T: PrefType>(value: &PrefValue) -> VaultError {
    VaultError::Decode(format!(
        "type mismatch: stored {}, requested {}",
        value.type_name(),
        T::TYPE_NAME
    ))
}

impl PrefType for String {
    const TYPE_NAME: &'static str = "string";

    fn into_value(self) -> PrefValue {
        PrefValue::String(self)
    }

    fn from_value(value: PrefValue) -> Result<Self> {
        match value {
            PrefValue::String(s) => Ok(s),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl PrefType for bool {
    const TYPE_NAME: &'static str = "bool";

    fn into_value(self) -> PrefValue {
        PrefValue::Bool(self)
    }

    fn from_value(value: PrefValue) -> Result<Self> {
        match value {
            PrefValue::Bool(b) => Ok(b),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl PrefType for i32 {
    const TYPE_NAME: &'static str = "int32";

    fn into_value(self) -> PrefValue {
        PrefValue::Int32(self)
    }

    fn from_value(value: PrefValue) -> Result<Self> {
        match value {
            PrefValue::Int32(v) => Ok(v),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl PrefType for i64 {
    const TYPE_NAME: &'static str = "int64";

    fn into_value(self) -> PrefValue {
        PrefValue::Int64(self)
    }

    fn from_value(value: PrefValue) -> Result<Self> {
        match value {
            PrefValue::Int64(v) => Ok(v),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

/// Encode a typed value
pub fn encode<T: PrefType>(value: T) -> Result<Vec<u8>> {
    value.into_value().encode()
}

/// Decode bytes into the requested type
pub fn decode<T: PrefType>(bytes: &[u8]) -> Result<T> {
    T::from_value(PrefValue::decode(bytes)?)
}
