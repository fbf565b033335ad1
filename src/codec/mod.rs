//! The wire codec.
//!
//! Every value is a sequence of MessagePack tokens in a fixed field order.
//! Arrays are an array-length token followed by that many tokens, complex
//! values are two consecutive floats, and strings have a fixed capacity:
//! they are space-padded to it on encode, and cut at the first NUL and
//! right-trimmed on decode. Decoding checks every declared length against
//! the bytes that are left, and every product's shape once it's complete.

pub mod dump;
pub mod frame;
pub mod messages;
mod products;

#[cfg(test)]
mod tests;

use num_complex::Complex32;
use rmp::{decode, encode};
use thiserror::Error;

use crate::products::ShapeError;

pub use dump::{read_dump, write_dump, Dump};
pub use frame::{frame, read_frame, write_frame, FrameBuffer, MAX_FRAME_LEN};
pub use messages::{OptionsSource, Request, RequestMessage, Response, ResponseMessage};
pub use products::{decode_ampphase, decode_vis_quantities, encode_ampphase, encode_vis_quantities};

/// The first token of every message.
pub const PROTOCOL_VERSION: u32 = 1;

/// Fixed string capacities \[bytes\].
pub(crate) mod capacity {
    pub const OBS_DATE: usize = 12;
    pub const SOURCE_NAME: usize = 24;
    pub const OBS_TYPE: usize = 16;
    pub const ANTENNA_NAME: usize = 8;
    pub const WINDOW_LABEL: usize = 8;
    pub const USERNAME: usize = 32;
    pub const CLIENT_ID: usize = crate::CLIENT_ID_LENGTH;
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Protocol version {got} isn't supported (expected {PROTOCOL_VERSION})")]
    Version { got: u32 },

    #[error("{what}: unknown tag {tag}")]
    UnknownTag { what: &'static str, tag: u64 },

    #[error("An array declares {declared} elements but only {available} bytes remain")]
    Truncated { declared: usize, available: usize },

    #[error("{what} has {actual} elements, expected {expected}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{0} bytes were left over after decoding")]
    TrailingBytes(usize),

    #[error("A string isn't valid UTF-8")]
    BadUtf8,

    #[error("Frame of {0} bytes is larger than the maximum of {MAX_FRAME_LEN}")]
    FrameTooLarge(usize),

    #[error("Not a dump file")]
    BadDumpMagic,

    #[error(transparent)]
    Shape(#[from] ShapeError),

    #[error(transparent)]
    ValueWrite(#[from] encode::ValueWriteError),

    #[error(transparent)]
    ValueRead(#[from] decode::ValueReadError),

    #[error(transparent)]
    NumValueRead(#[from] decode::NumValueReadError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Values that encode without any outside context.
pub trait Encode {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError>;
}

/// Values that decode without any outside context. Decoding consumes the
/// value's tokens from the front of `rd`.
pub trait Decode: Sized {
    fn decode(rd: &mut &[u8]) -> Result<Self, CodecError>;
}

pub fn encode_to_vec<T: Encode>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut buf = vec![];
    value.encode(&mut buf)?;
    Ok(buf)
}

/// Decode a value that must use every byte of `bytes`.
pub fn decode_from_slice<T: Decode>(bytes: &[u8]) -> Result<T, CodecError> {
    let mut rd = bytes;
    let value = T::decode(&mut rd)?;
    if !rd.is_empty() {
        return Err(CodecError::TrailingBytes(rd.len()));
    }
    Ok(value)
}

// The smallest encodings of the scalar tokens, used to reject array lengths
// that can't fit in what's left.
const F32_TOKEN: usize = 5;
const F64_TOKEN: usize = 9;
const MIN_TOKEN: usize = 1;

pub(crate) fn put_len(buf: &mut Vec<u8>, len: usize) -> Result<(), CodecError> {
    let len = u32::try_from(len).map_err(|_| CodecError::FrameTooLarge(len))?;
    encode::write_array_len(buf, len)?;
    Ok(())
}

/// Read an array length, checking that `len` tokens of at least
/// `min_token` bytes each could follow.
pub(crate) fn get_len(rd: &mut &[u8], min_token: usize) -> Result<usize, CodecError> {
    let declared = decode::read_array_len(rd)? as usize;
    match declared.checked_mul(min_token) {
        Some(needed) if needed <= rd.len() => Ok(declared),
        _ => Err(CodecError::Truncated {
            declared,
            available: rd.len(),
        }),
    }
}

/// Like [`get_len`], but the length is dictated by the surrounding
/// structure.
pub(crate) fn get_exact_len(
    rd: &mut &[u8],
    min_token: usize,
    what: &'static str,
    expected: usize,
) -> Result<usize, CodecError> {
    let actual = get_len(rd, min_token)?;
    if actual != expected {
        return Err(CodecError::LengthMismatch {
            what,
            expected,
            actual,
        });
    }
    Ok(actual)
}

/// The length of an array of structures.
pub(crate) fn get_struct_len(rd: &mut &[u8]) -> Result<usize, CodecError> {
    get_len(rd, MIN_TOKEN)
}

pub(crate) fn put_f32(buf: &mut Vec<u8>, v: f32) -> Result<(), CodecError> {
    encode::write_f32(buf, v)?;
    Ok(())
}

pub(crate) fn get_f32(rd: &mut &[u8]) -> Result<f32, CodecError> {
    Ok(decode::read_f32(rd)?)
}

pub(crate) fn put_f64(buf: &mut Vec<u8>, v: f64) -> Result<(), CodecError> {
    encode::write_f64(buf, v)?;
    Ok(())
}

pub(crate) fn get_f64(rd: &mut &[u8]) -> Result<f64, CodecError> {
    Ok(decode::read_f64(rd)?)
}

pub(crate) fn put_uint(buf: &mut Vec<u8>, v: u64) -> Result<(), CodecError> {
    encode::write_uint(buf, v)?;
    Ok(())
}

pub(crate) fn get_uint(rd: &mut &[u8]) -> Result<u64, CodecError> {
    Ok(decode::read_int(rd)?)
}

pub(crate) fn get_u32(rd: &mut &[u8]) -> Result<u32, CodecError> {
    Ok(decode::read_int(rd)?)
}

pub(crate) fn get_usize(rd: &mut &[u8]) -> Result<usize, CodecError> {
    Ok(decode::read_int(rd)?)
}

pub(crate) fn put_sint(buf: &mut Vec<u8>, v: i64) -> Result<(), CodecError> {
    encode::write_sint(buf, v)?;
    Ok(())
}

pub(crate) fn get_sint(rd: &mut &[u8]) -> Result<i64, CodecError> {
    Ok(decode::read_int(rd)?)
}

pub(crate) fn put_bool(buf: &mut Vec<u8>, v: bool) -> Result<(), CodecError> {
    encode::write_bool(buf, v)?;
    Ok(())
}

pub(crate) fn get_bool(rd: &mut &[u8]) -> Result<bool, CodecError> {
    Ok(decode::read_bool(rd)?)
}

pub(crate) fn put_f32s(buf: &mut Vec<u8>, v: &[f32]) -> Result<(), CodecError> {
    put_len(buf, v.len())?;
    v.iter().try_for_each(|&x| put_f32(buf, x))
}

pub(crate) fn get_f32s(rd: &mut &[u8]) -> Result<Vec<f32>, CodecError> {
    let n = get_len(rd, F32_TOKEN)?;
    (0..n).map(|_| get_f32(rd)).collect()
}

pub(crate) fn put_f64s(buf: &mut Vec<u8>, v: &[f64]) -> Result<(), CodecError> {
    put_len(buf, v.len())?;
    v.iter().try_for_each(|&x| put_f64(buf, x))
}

pub(crate) fn get_f64s(rd: &mut &[u8]) -> Result<Vec<f64>, CodecError> {
    let n = get_len(rd, F64_TOKEN)?;
    (0..n).map(|_| get_f64(rd)).collect()
}

pub(crate) fn put_bools(buf: &mut Vec<u8>, v: &[bool]) -> Result<(), CodecError> {
    put_len(buf, v.len())?;
    v.iter().try_for_each(|&x| put_bool(buf, x))
}

pub(crate) fn get_bools(rd: &mut &[u8]) -> Result<Vec<bool>, CodecError> {
    let n = get_len(rd, MIN_TOKEN)?;
    (0..n).map(|_| get_bool(rd)).collect()
}

/// Complex values as an array of 2n floats: real, imaginary, real, ...
pub(crate) fn put_complexes(buf: &mut Vec<u8>, v: &[Complex32]) -> Result<(), CodecError> {
    put_len(buf, 2 * v.len())?;
    for z in v {
        put_f32(buf, z.re)?;
        put_f32(buf, z.im)?;
    }
    Ok(())
}

pub(crate) fn get_complexes(rd: &mut &[u8]) -> Result<Vec<Complex32>, CodecError> {
    let n = get_len(rd, F32_TOKEN)?;
    if n % 2 != 0 {
        return Err(CodecError::LengthMismatch {
            what: "complex array",
            expected: n + 1,
            actual: n,
        });
    }
    (0..n / 2)
        .map(|_| Ok(Complex32::new(get_f32(rd)?, get_f32(rd)?)))
        .collect()
}

/// Write a string padded with spaces to `capacity` bytes. Longer strings
/// are cut at the last character boundary that fits.
pub(crate) fn put_str(buf: &mut Vec<u8>, s: &str, capacity: usize) -> Result<(), CodecError> {
    let mut end = s.len().min(capacity);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut padded = String::with_capacity(capacity);
    padded.push_str(&s[..end]);
    padded.extend(std::iter::repeat(' ').take(capacity - end));
    encode::write_str(buf, &padded)?;
    Ok(())
}

pub(crate) fn get_str(rd: &mut &[u8], capacity: usize) -> Result<String, CodecError> {
    let len = decode::read_str_len(rd)? as usize;
    if len != capacity {
        return Err(CodecError::LengthMismatch {
            what: "string",
            expected: capacity,
            actual: len,
        });
    }
    if rd.len() < len {
        return Err(CodecError::Truncated {
            declared: len,
            available: rd.len(),
        });
    }
    let (bytes, rest) = rd.split_at(len);
    *rd = rest;
    let bytes = match bytes.iter().position(|&b| b == 0) {
        Some(nul) => &bytes[..nul],
        None => bytes,
    };
    let s = std::str::from_utf8(bytes).map_err(|_| CodecError::BadUtf8)?;
    Ok(s.trim_end().to_string())
}

/// Write the protocol version and a tag.
pub(crate) fn put_preamble(buf: &mut Vec<u8>, tag: u64) -> Result<(), CodecError> {
    put_uint(buf, u64::from(PROTOCOL_VERSION))?;
    put_uint(buf, tag)
}

/// Read and check the protocol version, then return the tag.
pub(crate) fn get_preamble(rd: &mut &[u8]) -> Result<u64, CodecError> {
    let got = get_u32(rd)?;
    if got != PROTOCOL_VERSION {
        return Err(CodecError::Version { got });
    }
    get_uint(rd)
}
