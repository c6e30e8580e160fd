//! Codec and padding helpers shared across the crate.
//!
//! Padding wire format (ISO/IEC 7816-4): `0x80` is appended at the original
//! length, then zeros up to the target. At least one byte is always added,
//! so the sentinel lives in appended bytes and the padded length is
//! strictly greater than the input length.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::crypto;
use crate::error::{Error, Result};

/// Block size used for small fixed-size objects (collection-type strings,
/// invitation payloads).
pub const FIXED_PADDING_BLOCKSIZE: usize = 32;

// ---------------------------------------------------------------------------
// Padme padding
// ---------------------------------------------------------------------------

/// Padme target block size for a buffer of `length` bytes.
///
/// Below 512 the block is a flat 32; above, the padme mask keeps the
/// overhead sub-linear while quantizing lengths.
pub fn padme_blocksize(length: usize) -> usize {
    if length < 512 {
        return FIXED_PADDING_BLOCKSIZE;
    }
    let e = usize::BITS - 1 - length.leading_zeros(); // floor(log2(length))
    let s = (u32::BITS - 1 - e.leading_zeros()) + 1; // floor(log2(e)) + 1
    let mask = (1usize << (e - s)) - 1;
    (length + mask) & !mask
}

/// Pad to the smallest multiple of `blocksize` strictly greater than the
/// input length.
fn pad_to_blocksize(buf: &[u8], blocksize: usize) -> Vec<u8> {
    let target = (buf.len() / blocksize + 1) * blocksize;
    let mut out = Vec::with_capacity(target);
    out.extend_from_slice(buf);
    out.push(0x80);
    out.resize(target, 0);
    out
}

/// Strip ISO/IEC 7816-4 padding. Fails when the sentinel is missing.
fn unpad(buf: &[u8]) -> Result<&[u8]> {
    for (i, byte) in buf.iter().enumerate().rev() {
        match byte {
            0x00 => continue,
            0x80 => return Ok(&buf[..i]),
            _ => break,
        }
    }
    Err(Error::integrity("padding sentinel missing"))
}

/// Padme-pad a metadata or content buffer.
pub fn pad_meta(buf: &[u8]) -> Vec<u8> {
    pad_to_blocksize(buf, padme_blocksize(buf.len()))
}

/// Inverse of [`pad_meta`].
pub fn unpad_meta(buf: &[u8]) -> Result<Vec<u8>> {
    unpad(buf).map(|b| b.to_vec())
}

/// Pad a small object to the fixed 32-byte block grid.
pub fn pad_fixed(buf: &[u8]) -> Vec<u8> {
    pad_to_blocksize(buf, FIXED_PADDING_BLOCKSIZE)
}

/// Inverse of [`pad_fixed`].
pub fn unpad_fixed(buf: &[u8]) -> Result<Vec<u8>> {
    unpad(buf).map(|b| b.to_vec())
}

// ---------------------------------------------------------------------------
// Encodings
// ---------------------------------------------------------------------------

/// URL-safe unpadded base64.
pub fn to_base64(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// Inverse of [`to_base64`].
pub fn from_base64(data: &str) -> Result<Vec<u8>> {
    Ok(URL_SAFE_NO_PAD.decode(data)?)
}

/// Msgpack-encode a value: structs become string-keyed maps and omitted
/// optionals are skipped, matching the wire convention.
pub fn msgpack_encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut ser = rmp_serde::Serializer::new(&mut out).with_struct_map();
    value.serialize(&mut ser)?;
    Ok(out)
}

/// Inverse of [`msgpack_encode`].
pub fn msgpack_decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(data)?)
}

/// Little-endian u32 codec used by the length-prefixed MAC updates and the
/// fingerprint digit groups.
pub fn num_to_bytes(value: u32) -> [u8; 4] {
    value.to_le_bytes()
}

/// Inverse of [`num_to_bytes`]; accepts 1..=4 bytes.
pub fn num_from_bytes(data: &[u8]) -> Result<u32> {
    if data.is_empty() || data.len() > 4 {
        return Err(Error::Encoding("integer must be 1-4 bytes".into()));
    }
    let mut buf = [0u8; 4];
    buf[..data.len()].copy_from_slice(data);
    Ok(u32::from_le_bytes(buf))
}

// ---------------------------------------------------------------------------
// Shuffle
// ---------------------------------------------------------------------------

/// Fisher-Yates shuffle with cryptographically strong randomness.
///
/// Shuffles `items` in place and returns the reverse permutation: for every
/// original position `i`, `items[ret[i]]` is the element that started at
/// `i`, so callers can restore the original order later.
pub fn shuffle<T>(items: &mut [T]) -> Vec<u32> {
    let len = items.len();
    let mut positions: Vec<u32> = (0..len as u32).collect();
    for i in (1..len).rev() {
        let j = crypto::random_below(i as u32 + 1) as usize;
        items.swap(i, j);
        positions.swap(i, j);
    }
    // positions[k] = original index of the element now at k; invert it
    let mut ret = vec![0u32; len];
    for (new_pos, orig) in positions.iter().enumerate() {
        ret[*orig as usize] = new_pos as u32;
    }
    ret
}
