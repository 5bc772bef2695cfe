//! Parser and builder helpers for single protocol packets
use bytes::Buf;
use thiserror::Error;

use crate::error::{Error, Result};

/// Error returned by the [PacketParser]
#[derive(Error, Debug)]
pub enum DecodeError {
    /// The packet was shorter than expected
    #[error("end of packet")]
    EndOfPacket,
    /// A string in a packet was not utf-8 as expected
    #[error("utf-8 error at {valid_up_to}")]
    Utf8Error {
        /// The string is valid utf-8 until this many bytes
        valid_up_to: u32,
    },
    /// A length-encoded integer started with the NULL marker
    #[error("unexpected NULL marker")]
    NullMarker,
}

impl From<bytes::TryGetError> for DecodeError {
    fn from(_value: bytes::TryGetError) -> Self {
        DecodeError::EndOfPacket
    }
}

impl From<std::str::Utf8Error> for DecodeError {
    fn from(value: std::str::Utf8Error) -> Self {
        DecodeError::Utf8Error {
            valid_up_to: value.valid_up_to().try_into().unwrap_or(u32::MAX),
        }
    }
}

/// Result returned by [PacketParser]
pub type DecodeResult<T> = std::result::Result<T, DecodeError>;

/// Attach a location to a [DecodeError] and lift it into the crate error type
///
/// Malformed packets mean the server did not speak the protocol correctly, so
/// these surface as interface errors.
pub(crate) trait WithLoc<T> {
    /// Convert into a [crate::error::Result] naming the field being read
    fn loc(self, loc: &'static str) -> Result<T>;
}

impl<T> WithLoc<T> for DecodeResult<T> {
    fn loc(self, loc: &'static str) -> Result<T> {
        self.map_err(|e| Error::protocol(format!("reading {loc}: {e}")))
    }
}

/// Parse one packet payload
#[derive(Clone, Copy)]
pub struct PacketParser<'a>(&'a [u8]);

impl<'a> PacketParser<'a> {
    /// Construct a new [PacketParser] for the given payload
    pub fn new(payload: &'a [u8]) -> Self {
        Self(payload)
    }

    /// Number of bytes left in the packet
    pub fn remaining(&self) -> usize {
        self.0.len()
    }

    /// Look at the next byte without consuming it
    pub fn peek_u8(&self) -> DecodeResult<u8> {
        self.0.first().copied().ok_or(DecodeError::EndOfPacket)
    }

    /// Read a u8 from the packet
    #[inline]
    pub fn get_u8(&mut self) -> DecodeResult<u8> {
        Ok(self.0.try_get_u8()?)
    }

    /// Read a u16 from the packet
    #[inline]
    pub fn get_u16(&mut self) -> DecodeResult<u16> {
        Ok(self.0.try_get_u16_le()?)
    }

    /// Read a 3-byte integer from the packet
    #[inline]
    pub fn get_u24(&mut self) -> DecodeResult<u32> {
        let a: u32 = self.get_u8()?.into();
        let b: u32 = self.get_u8()?.into();
        let c: u32 = self.get_u8()?.into();
        Ok(a | (b << 8) | (c << 16))
    }

    /// Read a u32 from the packet
    #[inline]
    pub fn get_u32(&mut self) -> DecodeResult<u32> {
        Ok(self.0.try_get_u32_le()?)
    }

    /// Read a u64 from the packet
    #[inline]
    pub fn get_u64(&mut self) -> DecodeResult<u64> {
        Ok(self.0.try_get_u64_le()?)
    }

    /// Read a length-encoded integer
    #[inline]
    pub fn get_lenenc(&mut self) -> DecodeResult<u64> {
        let v = self.get_u8()?;
        Ok(match v {
            0xFB => return Err(DecodeError::NullMarker),
            0xFC => self.get_u16()?.into(),
            0xFD => self.get_u24()?.into(),
            0xFE => self.get_u64()?,
            v => v.into(),
        })
    }

    /// Read a length-encoded byte string
    #[inline]
    pub fn get_lenenc_blob(&mut self) -> DecodeResult<&'a [u8]> {
        let len = self.get_lenenc()?;
        self.get_bytes(len as usize)
    }

    /// Read a length-encoded byte string, or None for the SQL NULL marker
    #[inline]
    pub fn get_lenenc_blob_or_null(&mut self) -> DecodeResult<Option<&'a [u8]>> {
        if self.peek_u8()? == 0xFB {
            self.0.advance(1);
            Ok(None)
        } else {
            Ok(Some(self.get_lenenc_blob()?))
        }
    }

    /// Read a length-encoded utf-8 string
    #[inline]
    pub fn get_lenenc_str(&mut self) -> DecodeResult<&'a str> {
        let v = self.get_lenenc_blob()?;
        Ok(str::from_utf8(v)?)
    }

    /// Read a null-terminated string
    #[inline]
    pub fn get_null_str(&mut self) -> DecodeResult<&'a str> {
        match std::ffi::CStr::from_bytes_until_nul(self.0) {
            Ok(v) => {
                let v = v.to_str()?;
                self.0.advance(v.len() + 1);
                Ok(v)
            }
            Err(_) => Err(DecodeError::EndOfPacket),
        }
    }

    /// Read the rest of the packet as a utf-8 string
    #[inline]
    pub fn get_eof_str(&mut self) -> DecodeResult<&'a str> {
        let v = str::from_utf8(self.0)?;
        self.0.advance(v.len());
        Ok(v)
    }

    /// Read the rest of the packet as raw bytes
    #[inline]
    pub fn get_rest(&mut self) -> &'a [u8] {
        let v = self.0;
        self.0 = &[];
        v
    }

    /// Read some bytes from the packet
    #[inline]
    pub fn get_bytes(&mut self, len: usize) -> DecodeResult<&'a [u8]> {
        match self.0.get(..len) {
            Some(v) => {
                self.0.advance(len);
                Ok(v)
            }
            None => Err(DecodeError::EndOfPacket),
        }
    }

    /// Skip some bytes
    #[inline]
    pub fn skip(&mut self, len: usize) -> DecodeResult<()> {
        if self.0.len() < len {
            return Err(DecodeError::EndOfPacket);
        }
        self.0.advance(len);
        Ok(())
    }
}

/// Append a length-encoded integer to a packet being composed
pub(crate) fn put_lenenc(out: &mut Vec<u8>, v: u64) {
    if v < 251 {
        out.push(v as u8);
    } else if v < 0x1_0000 {
        out.push(0xFC);
        out.extend_from_slice(&(v as u16).to_le_bytes());
    } else if v < 0x100_0000 {
        out.push(0xFD);
        out.extend_from_slice(&(v as u32).to_le_bytes()[..3]);
    } else {
        out.push(0xFE);
        out.extend_from_slice(&v.to_le_bytes());
    }
}

/// Append a length-encoded byte string to a packet being composed
pub(crate) fn put_lenenc_bytes(out: &mut Vec<u8>, v: &[u8]) {
    put_lenenc(out, v.len() as u64);
    out.extend_from_slice(v);
}

/// Append a null-terminated string to a packet being composed
pub(crate) fn put_str_null(out: &mut Vec<u8>, v: &str) {
    out.extend_from_slice(v.as_bytes());
    out.push(0);
}
