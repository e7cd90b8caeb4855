//! Hashing primitives for mining
//!
//! Double-SHA256, target comparison and compact-target expansion. The target
//! is a full 256-bit quantity; comparisons are done over normalized hex
//! strings (or the equivalent byte ordering), never truncated to a native
//! integer width.

use crate::{Error, Result};
use sha2::{Digest, Sha256};

/// Bitcoin's header hashing primitive: SHA-256 applied twice.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}

/// Display form of a header digest: byte-reversed, lowercase hex.
pub fn block_hash_hex(digest: &[u8; 32]) -> String {
    let mut reversed = *digest;
    reversed.reverse();
    hex::encode(reversed)
}

/// Validate and normalize a 64-char target hex string to lowercase.
pub fn normalize_target_hex(target: &str) -> Result<String> {
    if target.len() != 64 {
        return Err(Error::encoding(format!(
            "Invalid target length: expected 64 hex chars, got {}",
            target.len()
        )));
    }
    if !target.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::encoding("Target contains non-hexadecimal characters"));
    }
    Ok(target.to_ascii_lowercase())
}

/// Decode a 64-char target hex string into big-endian bytes.
pub fn decode_target(target: &str) -> Result<[u8; 32]> {
    let normalized = normalize_target_hex(target)?;
    let bytes =
        hex::decode(normalized).map_err(|e| Error::encoding(format!("Invalid target hex: {}", e)))?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Check whether a display-form block hash is numerically below the target.
///
/// Both arguments must be 64 hex chars; equal-length lowercase hex strings
/// compare lexicographically exactly as the underlying 256-bit integers do.
pub fn meets_target(hash_hex: &str, target_hex: &str) -> Result<bool> {
    let hash = normalize_target_hex(hash_hex)
        .map_err(|_| Error::encoding(format!("Invalid hash hex: {:?}", hash_hex)))?;
    let target = normalize_target_hex(target_hex)?;
    Ok(hash.as_str() < target.as_str())
}

/// Hot-loop variant of [`meets_target`] over raw bytes.
///
/// `digest` is the header digest in internal order (display form is its
/// reverse); `target` is big-endian. Compares most significant byte first.
pub fn meets_target_bytes(digest: &[u8; 32], target: &[u8; 32]) -> bool {
    for i in 0..32 {
        let hash_byte = digest[31 - i];
        match hash_byte.cmp(&target[i]) {
            std::cmp::Ordering::Less => return true,
            std::cmp::Ordering::Greater => return false,
            std::cmp::Ordering::Equal => continue,
        }
    }
    // Equal to the target does not meet it; the hash must be strictly below.
    false
}

/// Expand the compact `bits` encoding into a 64-char target hex string.
///
/// `bits = 0xEEMMMMMM` encodes `mantissa * 256^(exponent - 3)`. Exponents
/// that would shift the mantissa past 256 bits are rejected.
pub fn target_from_compact(bits: u32) -> Result<String> {
    let exponent = (bits >> 24) as usize;
    let mantissa = bits & 0x00ff_ffff;

    let mut target = [0u8; 32];
    if mantissa == 0 {
        return Ok(hex::encode(target));
    }
    if exponent > 32 {
        return Err(Error::encoding(format!(
            "Compact target exponent {} overflows 256 bits",
            exponent
        )));
    }

    if exponent < 3 {
        let shifted = mantissa >> (8 * (3 - exponent));
        target[29] = (shifted >> 16) as u8;
        target[30] = (shifted >> 8) as u8;
        target[31] = shifted as u8;
    } else {
        let idx = 32 - exponent;
        target[idx] = (mantissa >> 16) as u8;
        target[idx + 1] = (mantissa >> 8) as u8;
        target[idx + 2] = mantissa as u8;
    }
    Ok(hex::encode(target))
}
