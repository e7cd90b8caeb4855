//! Block header construction and serialization
//!
//! Builds 80-byte Bitcoin block headers from a template, with the byte-order
//! handling the wire format requires: integer fields are little-endian, and
//! hash fields are stored byte-reversed relative to their display hex.

use crate::types::{parse_bits, BlockHeader, BlockTemplate, TemplateTransaction};
use crate::{crypto, Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Serialized header size in bytes.
pub const HEADER_SIZE: usize = 80;

/// Byte offset of the nonce field within a serialized header.
pub const NONCE_OFFSET: usize = 76;

/// Build a header from a template snapshot, merkle root and nonce.
pub fn build_header(template: &BlockTemplate, merkle_root: &str, nonce: u32) -> BlockHeader {
    BlockHeader {
        version: template.version,
        previous_block_hash: template.previous_block_hash.clone(),
        merkle_root: merkle_root.to_string(),
        time: template.curtime,
        bits: template.bits.clone(),
        nonce,
    }
}

/// Serialize a header into its 80-byte wire form.
pub fn serialize(header: &BlockHeader) -> Result<[u8; HEADER_SIZE]> {
    let mut buf = Vec::with_capacity(HEADER_SIZE);

    buf.write_i32::<LittleEndian>(header.version)
        .map_err(|e| Error::encoding(format!("Failed to write version: {}", e)))?;
    buf.extend_from_slice(&decode_hash_reversed(
        &header.previous_block_hash,
        "previous block hash",
    )?);
    buf.extend_from_slice(&decode_hash_reversed(&header.merkle_root, "merkle root")?);
    buf.write_u32::<LittleEndian>(header.time)
        .map_err(|e| Error::encoding(format!("Failed to write time: {}", e)))?;

    let mut bits = hex::decode(&header.bits)
        .map_err(|e| Error::encoding(format!("Invalid hex in bits: {}", e)))?;
    if bits.len() != 4 {
        return Err(Error::encoding(format!(
            "Invalid bits length: expected 4 bytes, got {}",
            bits.len()
        )));
    }
    bits.reverse();
    buf.extend_from_slice(&bits);

    buf.write_u32::<LittleEndian>(header.nonce)
        .map_err(|e| Error::encoding(format!("Failed to write nonce: {}", e)))?;

    let mut out = [0u8; HEADER_SIZE];
    out.copy_from_slice(&buf);
    Ok(out)
}

/// Reconstruct header fields from an 80-byte wire form.
pub fn deserialize(bytes: &[u8]) -> Result<BlockHeader> {
    if bytes.len() != HEADER_SIZE {
        return Err(Error::encoding(format!(
            "Invalid header length: expected {} bytes, got {}",
            HEADER_SIZE,
            bytes.len()
        )));
    }

    let mut cursor = Cursor::new(bytes);
    let version = cursor
        .read_i32::<LittleEndian>()
        .map_err(|e| Error::encoding(format!("Failed to read version: {}", e)))?;

    let mut prev = [0u8; 32];
    prev.copy_from_slice(&bytes[4..36]);
    prev.reverse();

    let mut merkle = [0u8; 32];
    merkle.copy_from_slice(&bytes[36..68]);
    merkle.reverse();

    let mut cursor = Cursor::new(&bytes[68..]);
    let time = cursor
        .read_u32::<LittleEndian>()
        .map_err(|e| Error::encoding(format!("Failed to read time: {}", e)))?;

    let mut bits = [0u8; 4];
    bits.copy_from_slice(&bytes[72..76]);
    bits.reverse();

    let mut cursor = Cursor::new(&bytes[NONCE_OFFSET..]);
    let nonce = cursor
        .read_u32::<LittleEndian>()
        .map_err(|e| Error::encoding(format!("Failed to read nonce: {}", e)))?;

    Ok(BlockHeader {
        version,
        previous_block_hash: hex::encode(prev),
        merkle_root: hex::encode(merkle),
        time,
        bits: hex::encode(bits),
        nonce,
    })
}

/// Overwrite the 4 nonce bytes of a serialized header in place.
///
/// All other bytes stay fixed for the epoch, so the hash loop rewrites only
/// this field per attempt.
pub fn patch_nonce(buf: &mut [u8; HEADER_SIZE], nonce: u32) {
    buf[NONCE_OFFSET..].copy_from_slice(&nonce.to_le_bytes());
}

/// Compute the merkle root over a template's transaction list.
///
/// Leaves are the txids in internal byte order; odd-width levels duplicate
/// their last node; pairs fold with double-SHA256 until one root remains.
/// Returns the root in display-form hex; an empty list yields the all-zero
/// root.
pub fn compute_merkle_root(transactions: &[TemplateTransaction]) -> Result<String> {
    if transactions.is_empty() {
        return Ok("0".repeat(64));
    }

    let mut level: Vec<[u8; 32]> = transactions
        .iter()
        .map(|tx| decode_hash_reversed(&tx.txid, "txid"))
        .collect::<Result<_>>()?;

    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let left = pair[0];
            let right = if pair.len() == 2 { pair[1] } else { pair[0] };

            let mut combined = [0u8; 64];
            combined[..32].copy_from_slice(&left);
            combined[32..].copy_from_slice(&right);
            next.push(crypto::sha256d(&combined));
        }
        level = next;
    }

    let mut root = level[0];
    root.reverse();
    Ok(hex::encode(root))
}

/// Validate header fields against the template they were built from.
pub fn validate_against_template(header: &BlockHeader, template: &BlockTemplate) -> Result<()> {
    if header.version != template.version
        || header.previous_block_hash != template.previous_block_hash
        || header.time != template.curtime
        || header.bits != template.bits
    {
        return Err(Error::invalid_state(
            "Header fields do not match the template snapshot",
        ));
    }
    parse_bits(&header.bits)?;
    Ok(())
}

/// Decode a 64-char display-form hash into internal (reversed) byte order.
fn decode_hash_reversed(hash_hex: &str, field: &str) -> Result<[u8; 32]> {
    if hash_hex.len() != 64 {
        return Err(Error::encoding(format!(
            "Invalid {} length: expected 64 hex chars, got {}",
            field,
            hash_hex.len()
        )));
    }
    let bytes = hex::decode(hash_hex)
        .map_err(|e| Error::encoding(format!("Invalid hex in {}: {}", field, e)))?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    out.reverse();
    Ok(out)
}
