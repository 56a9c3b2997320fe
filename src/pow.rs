//! Proof of work: compact targets and header hash checks

use crate::error::{HarnessError, Result};
use crate::types::*;

/// 256-bit unsigned integer, little-endian 64-bit limbs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct U256([u64; 4]);

impl U256 {
    pub fn zero() -> Self {
        U256([0; 4])
    }

    pub fn from_u64(value: u64) -> Self {
        U256([value, 0, 0, 0])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&x| x == 0)
    }

    pub fn shl(&self, shift: u32) -> Self {
        if shift >= 256 {
            return U256::zero();
        }
        let mut result = U256::zero();
        let word_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;
        for i in 0..4 {
            if i + word_shift < 4 {
                result.0[i + word_shift] |= self.0[i] << bit_shift;
                if bit_shift > 0 && i + word_shift + 1 < 4 {
                    result.0[i + word_shift + 1] |= self.0[i] >> (64 - bit_shift);
                }
            }
        }
        result
    }

    pub fn shr(&self, shift: u32) -> Self {
        if shift >= 256 {
            return U256::zero();
        }
        let mut result = U256::zero();
        let word_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;
        for i in word_shift..4 {
            result.0[i - word_shift] |= self.0[i] >> bit_shift;
            if bit_shift > 0 && i > word_shift {
                result.0[i - word_shift - 1] |= self.0[i] << (64 - bit_shift);
            }
        }
        result
    }

    /// Interpret 32 bytes in internal (little-endian) order
    pub fn from_le_bytes(bytes: &[u8; 32]) -> Self {
        let mut words = [0u64; 4];
        for (i, word) in words.iter_mut().enumerate() {
            let mut limb = [0u8; 8];
            limb.copy_from_slice(&bytes[i * 8..(i + 1) * 8]);
            *word = u64::from_le_bytes(limb);
        }
        U256(words)
    }

    pub fn to_le_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        for (i, word) in self.0.iter().enumerate() {
            bytes[i * 8..(i + 1) * 8].copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    pub fn bits(&self) -> u32 {
        for i in (0..4).rev() {
            if self.0[i] != 0 {
                return 64 * i as u32 + (64 - self.0[i].leading_zeros());
            }
        }
        0
    }
}

impl PartialOrd for U256 {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for U256 {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        for (a, b) in self.0.iter().rev().zip(other.0.iter().rev()) {
            match a.cmp(b) {
                std::cmp::Ordering::Equal => continue,
                other => return other,
            }
        }
        std::cmp::Ordering::Equal
    }
}

/// Expand target from compact representation
///
/// `bits = exponent(8) | sign(1) | mantissa(23)`; the target is
/// `mantissa * 256^(exponent - 3)`. Negative or overflowing encodings are
/// rejected.
pub fn expand_target(bits: u32) -> Result<U256> {
    let exponent = bits >> 24;
    let mantissa = bits & 0x007fffff;

    if mantissa != 0 && bits & 0x00800000 != 0 {
        return Err(HarnessError::InvalidArgument(format!("negative target {:#010x}", bits)));
    }
    if mantissa == 0 {
        return Ok(U256::zero());
    }

    let target = if exponent <= 3 {
        U256::from_u64(mantissa as u64).shr(8 * (3 - exponent))
    } else {
        let shift = 8 * (exponent - 3);
        let target = U256::from_u64(mantissa as u64).shl(shift);
        let mantissa_bits = 32 - mantissa.leading_zeros();
        if mantissa_bits + shift > 256 {
            return Err(HarnessError::InvalidArgument(format!("target overflow {:#010x}", bits)));
        }
        target
    };
    Ok(target)
}

/// Compress a target back to its compact form
pub fn compact_from_target(target: &U256) -> u32 {
    let mut size = (target.bits() + 7) / 8;
    let mut compact = if size <= 3 {
        (target.0[0] << (8 * (3 - size))) as u32
    } else {
        (target.shr(8 * (size - 3)).0[0]) as u32
    };
    if compact & 0x00800000 != 0 {
        compact >>= 8;
        size += 1;
    }
    compact | (size << 24)
}

/// CheckProofOfWork: ℋ → {true, false}
///
/// True when `hash256(header) ≤ ExpandTarget(header.bits)`.
pub fn check_proof_of_work(header: &BlockHeader) -> Result<bool> {
    let target = expand_target(header.bits)?;
    let hash = U256::from_le_bytes(&crate::block::block_hash(header));
    Ok(hash <= target)
}
