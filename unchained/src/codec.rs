//! Little-endian binary encoding shared by every persisted record.
//!
//! Each supported shape implements [`CacheWrite`] and [`CacheRead`]. Readers
//! receive the format version the stream was written with, so that an entity
//! can default a field that did not exist yet, or skip one that has since been
//! retired, without breaking files written by an older build.
//!
//! | shape       | encoding                                   |
//! |-------------|--------------------------------------------|
//! | `u8`..`u64` | fixed width, little-endian                 |
//! | `bool`      | one byte, `0` or `1`                       |
//! | `String`    | `u64` byte length, then UTF-8              |
//! | `Address`   | 20 raw bytes                               |
//! | `B256`      | 32 raw bytes                               |
//! | `Option<T>` | `bool` presence flag, then `T` if present  |
//! | `Vec<T>`    | `u64` element count, then each `T`         |

use std::io::{self, Read, Write};

use alloy::primitives::{Address, B256};
use thiserror::Error;

/// The format version stamped on everything written by this build.
pub const CACHE_VERSION: u64 = 1;

/// Length and count prefixes above this are treated as corruption rather than
/// honoured with an allocation.
pub const MAX_SEQUENCE_LEN: u64 = 1 << 26;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("unexpected end of stream while reading {0}")]
    ShortRead(&'static str),
    #[error("length prefix {len} for {what} exceeds the limit of {}", MAX_SEQUENCE_LEN)]
    LengthPrefix { what: &'static str, len: u64 },
    #[error("invalid boolean tag {0:#04x}")]
    BoolTag(u8),
    #[error("string is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("unsupported cache version {found}, newest understood is {}", CACHE_VERSION)]
    UnsupportedVersion { found: u64 },
    #[error("stream error: {0}")]
    Io(#[source] io::Error),
}

impl CodecError {
    fn from_read(err: io::Error, what: &'static str) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => CodecError::ShortRead(what),
            _ => CodecError::Io(err),
        }
    }
}

/// A value that knows how to encode itself.
pub trait CacheWrite {
    fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), CodecError>;
}

/// A value that can be decoded from a stream written with format `version`.
///
/// On error nothing is returned: callers discard the stream and treat the
/// entry as a cache miss.
pub trait CacheRead: Sized {
    fn read_from<R: Read>(reader: &mut R, version: u64) -> Result<Self, CodecError>;
}

fn write_bytes<W: Write>(writer: &mut W, bytes: &[u8]) -> Result<(), CodecError> {
    writer.write_all(bytes).map_err(CodecError::Io)
}

fn read_array<const N: usize, R: Read>(
    reader: &mut R,
    what: &'static str,
) -> Result<[u8; N], CodecError> {
    let mut buf = [0u8; N];
    reader
        .read_exact(&mut buf)
        .map_err(|e| CodecError::from_read(e, what))?;
    Ok(buf)
}

fn read_len<R: Read>(reader: &mut R, what: &'static str) -> Result<u64, CodecError> {
    let len = u64::from_le_bytes(read_array(reader, what)?);
    if len > MAX_SEQUENCE_LEN {
        return Err(CodecError::LengthPrefix { what, len });
    }
    Ok(len)
}

macro_rules! impl_scalar {
    ($($ty:ty),* $(,)?) => {$(
        impl CacheWrite for $ty {
            fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), CodecError> {
                write_bytes(writer, &self.to_le_bytes())
            }
        }

        impl CacheRead for $ty {
            fn read_from<R: Read>(reader: &mut R, _version: u64) -> Result<Self, CodecError> {
                Ok(<$ty>::from_le_bytes(read_array(reader, stringify!($ty))?))
            }
        }
    )*};
}

impl_scalar!(u8, u16, u32, u64);

impl CacheWrite for bool {
    fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), CodecError> {
        write_bytes(writer, &[u8::from(*self)])
    }
}

impl CacheRead for bool {
    fn read_from<R: Read>(reader: &mut R, _version: u64) -> Result<Self, CodecError> {
        match read_array::<1, _>(reader, "bool")? {
            [0] => Ok(false),
            [1] => Ok(true),
            [other] => Err(CodecError::BoolTag(other)),
        }
    }
}

impl CacheWrite for String {
    fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), CodecError> {
        (self.len() as u64).write_to(writer)?;
        write_bytes(writer, self.as_bytes())
    }
}

impl CacheRead for String {
    fn read_from<R: Read>(reader: &mut R, _version: u64) -> Result<Self, CodecError> {
        let len = read_len(reader, "string length")?;
        let mut buf = Vec::new();
        reader
            .take(len)
            .read_to_end(&mut buf)
            .map_err(|e| CodecError::from_read(e, "string"))?;
        if buf.len() as u64 != len {
            return Err(CodecError::ShortRead("string"));
        }
        Ok(String::from_utf8(buf)?)
    }
}

impl CacheWrite for Address {
    fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), CodecError> {
        write_bytes(writer, self.as_slice())
    }
}

impl CacheRead for Address {
    fn read_from<R: Read>(reader: &mut R, _version: u64) -> Result<Self, CodecError> {
        Ok(Address::from(read_array::<20, _>(reader, "address")?))
    }
}

impl CacheWrite for B256 {
    fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), CodecError> {
        write_bytes(writer, self.as_slice())
    }
}

impl CacheRead for B256 {
    fn read_from<R: Read>(reader: &mut R, _version: u64) -> Result<Self, CodecError> {
        Ok(B256::from(read_array::<32, _>(reader, "hash")?))
    }
}

impl<T: CacheWrite> CacheWrite for Option<T> {
    fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), CodecError> {
        match self {
            Some(value) => {
                true.write_to(writer)?;
                value.write_to(writer)
            }
            None => false.write_to(writer),
        }
    }
}

impl<T: CacheRead> CacheRead for Option<T> {
    fn read_from<R: Read>(reader: &mut R, version: u64) -> Result<Self, CodecError> {
        match bool::read_from(reader, version)? {
            true => Ok(Some(T::read_from(reader, version)?)),
            false => Ok(None),
        }
    }
}

impl<T: CacheWrite> CacheWrite for Vec<T> {
    fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), CodecError> {
        (self.len() as u64).write_to(writer)?;
        self.iter().try_for_each(|item| item.write_to(writer))
    }
}

impl<T: CacheRead> CacheRead for Vec<T> {
    fn read_from<R: Read>(reader: &mut R, version: u64) -> Result<Self, CodecError> {
        let count = read_len(reader, "sequence count")?;
        // The prefix is bounded but still untrusted; grow as elements arrive.
        let mut items = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            items.push(T::read_from(reader, version)?);
        }
        Ok(items)
    }
}

/// Writes [`CACHE_VERSION`] followed by `value`.
pub fn write_versioned<T: CacheWrite, W: Write>(writer: &mut W, value: &T) -> Result<(), CodecError> {
    CACHE_VERSION.write_to(writer)?;
    value.write_to(writer)
}

/// Reads a version tag, then decodes `T` with that version.
pub fn read_versioned<T: CacheRead, R: Read>(reader: &mut R) -> Result<T, CodecError> {
    let version = u64::read_from(reader, CACHE_VERSION)?;
    if version > CACHE_VERSION {
        return Err(CodecError::UnsupportedVersion { found: version });
    }
    T::read_from(reader, version)
}

pub fn to_versioned_bytes<T: CacheWrite>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    write_versioned(&mut buf, value)?;
    Ok(buf)
}
