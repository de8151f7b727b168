//! XDR primitives (RFC 4506 subset) used by the ONC-RPC and VXI-11 codecs.
//!
//! Everything is big-endian and 4-byte aligned. Variable-length opaques
//! carry a length prefix and are zero-padded to a 4-byte multiple.

use byteorder::{BigEndian, ReadBytesExt};
use bytes::BufMut;

use crate::error::Result;
use crate::InstrumentError;

pub fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.put_u32(v);
}

pub fn put_i32(buf: &mut Vec<u8>, v: i32) {
    buf.put_i32(v);
}

/// Append a variable-length opaque: length prefix, data, zero padding to a
/// 4-byte multiple.
pub fn put_opaque(buf: &mut Vec<u8>, data: &[u8]) {
    buf.put_u32(u32::try_from(data.len()).unwrap_or(u32::MAX));
    buf.put_slice(data);
    for _ in 0..pad_len(data.len()) {
        buf.put_u8(0);
    }
}

/// Append an XDR string (same wire form as an opaque).
pub fn put_string(buf: &mut Vec<u8>, s: &str) {
    put_opaque(buf, s.as_bytes());
}

/// Zero-pad count to bring `len` to a 4-byte multiple.
pub const fn pad_len(len: usize) -> usize {
    (4 - (len & 3)) & 3
}

fn truncated() -> InstrumentError {
    InstrumentError::ProtocolError {
        details: "truncated XDR data".to_string(),
    }
}

pub fn get_u32<R: std::io::Read>(reader: &mut R) -> Result<u32> {
    reader.read_u32::<BigEndian>().map_err(|_| truncated())
}

pub fn get_i32<R: std::io::Read>(reader: &mut R) -> Result<i32> {
    reader.read_i32::<BigEndian>().map_err(|_| truncated())
}

/// Read a variable-length opaque, consuming its padding.
pub fn get_opaque<R: std::io::Read>(reader: &mut R) -> Result<Vec<u8>> {
    let len = get_u32(reader)? as usize;
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).map_err(|_| truncated())?;
    let mut pad = [0u8; 4];
    reader
        .read_exact(&mut pad[..pad_len(len)])
        .map_err(|_| truncated())?;
    Ok(data)
}

/// Skip a 4-byte-padded field of `len` bytes (e.g. an RPC verifier body).
pub fn skip_padded<R: std::io::Read>(reader: &mut R, len: usize) -> Result<()> {
    let total = len + pad_len(len);
    let mut remaining = total;
    let mut scratch = [0u8; 64];
    while remaining > 0 {
        let n = remaining.min(scratch.len());
        reader
            .read_exact(&mut scratch[..n])
            .map_err(|_| truncated())?;
        remaining -= n;
    }
    Ok(())
}
