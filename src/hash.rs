//! Hash primitives: SHA256, double-SHA256, HASH160, Merkle roots and SipHash

use crate::error::{HarnessError, Result};
use crate::types::{Hash, ZERO_HASH};
use bitcoin_hashes::{sha256d, Hash as BitcoinHash};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

/// Single SHA256
pub fn sha256(data: &[u8]) -> Hash {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

/// SHA256(SHA256(x)), the identity of transactions, headers and frames
pub fn hash256(data: &[u8]) -> Hash {
    let result = sha256d::Hash::hash(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&result[..]);
    out
}

/// RIPEMD160(SHA256(x))
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let mut out = [0u8; 20];
    out.copy_from_slice(&Ripemd160::digest(sha));
    out
}

/// ComputeMerkleRoot: ℍ* → ℍ
///
/// Pairwise double-SHA256 of each level, duplicating the last element of
/// odd-length levels, until one hash remains. An empty list has the zero
/// root.
pub fn merkle_root(hashes: &[Hash]) -> Hash {
    if hashes.is_empty() {
        return ZERO_HASH;
    }
    let mut level: Vec<Hash> = hashes.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            let last = level[level.len() - 1];
            level.push(last);
        }
        level = level
            .chunks(2)
            .map(|pair| {
                let mut buf = [0u8; 64];
                buf[..32].copy_from_slice(&pair[0]);
                buf[32..].copy_from_slice(&pair[1]);
                hash256(&buf)
            })
            .collect();
    }
    level[0]
}

/// Render an internal-order hash the way the node prints it (byte-reversed hex)
pub fn uint256_to_hex(hash: &Hash) -> String {
    let mut reversed = *hash;
    reversed.reverse();
    hex::encode(reversed)
}

/// Parse a display-order hex hash into internal byte order
pub fn uint256_from_hex(s: &str) -> Result<Hash> {
    let bytes = hex::decode(s).map_err(|e| HarnessError::InvalidArgument(e.to_string()))?;
    if bytes.len() != 32 {
        return Err(HarnessError::InvalidArgument(format!(
            "expected 32-byte hash, got {} bytes",
            bytes.len()
        )));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    out.reverse();
    Ok(out)
}

/// Compare two internal-order hashes as 256-bit little-endian integers
pub fn uint256_cmp(a: &Hash, b: &Hash) -> std::cmp::Ordering {
    a.iter().rev().cmp(b.iter().rev())
}

/// SipHash-2-4 of an arbitrary message under keys (k0, k1)
pub fn siphash24(k0: u64, k1: u64, data: &[u8]) -> u64 {
    bitcoin_hashes::siphash24::Hash::hash_with_keys(k0, k1, data).as_u64()
}
