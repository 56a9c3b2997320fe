//! Bitcoin-Cash Schnorr signatures (May 2019 upgrade)
//!
//! Signature `(r, s)` over message `m` with key `d`, `P = dG`:
//!
//! 1. `k = RFC6979(d, m, algo16 = "Schnorr+SHA256  ")`
//! 2. `R = kG`; if `jacobi(R.y) ≠ 1` then `k = n − k`
//! 3. `e = SHA256(R.x ‖ compressed(P) ‖ m) mod n`
//! 4. `s = k + e·d mod n`, signature `R.x ‖ s`
//!
//! Verification recomputes `R = sG − eP` and requires `jacobi(R.y) = 1`
//! and `R.x = r`.

use crate::error::{HarnessError, Result};
use crate::hash::sha256;
use crate::key::{rfc6979_nonce, PrivateKey};
use num_bigint::BigUint;
use num_traits::{One, Zero};
use secp256k1::constants::{CURVE_ORDER, FIELD_SIZE};
use secp256k1::{PublicKey, Scalar, Secp256k1, SecretKey};

/// Nonce function algorithm tag (two trailing spaces)
pub const SCHNORR_ALGO16: &[u8; 16] = b"Schnorr+SHA256  ";

/// Bound on RFC6979 retries before giving up
const MAX_NONCE_ATTEMPTS: u32 = 8;

fn curve_order() -> BigUint {
    BigUint::from_bytes_be(&CURVE_ORDER)
}

fn field_prime() -> BigUint {
    BigUint::from_bytes_be(&FIELD_SIZE)
}

fn to_bytes32(value: &BigUint) -> [u8; 32] {
    let bytes = value.to_bytes_be();
    let mut out = [0u8; 32];
    out[32 - bytes.len()..].copy_from_slice(&bytes);
    out
}

/// Legendre symbol test: y is a quadratic residue mod p
fn is_quadratic_residue(y: &[u8]) -> bool {
    let p = field_prime();
    let exponent = (&p - BigUint::one()) >> 1;
    BigUint::from_bytes_be(y).modpow(&exponent, &p).is_one()
}

fn challenge(r_x: &[u8], pubkey: &PublicKey, msg: &[u8; 32]) -> BigUint {
    let mut data = Vec::with_capacity(97);
    data.extend_from_slice(r_x);
    data.extend_from_slice(&pubkey.serialize());
    data.extend_from_slice(msg);
    BigUint::from_bytes_be(&sha256(&data)) % curve_order()
}

/// Sign a 32-byte digest; fails with `SigningFailed` if no usable nonce
/// appears within the retry bound
pub fn sign(key: &PrivateKey, msg: &[u8; 32]) -> Result<[u8; 64]> {
    let secp = Secp256k1::signing_only();
    let n = curve_order();
    let secret = key.secret_bytes();
    let d = BigUint::from_bytes_be(&secret);
    let pubkey = key.public_key_point();

    for counter in 0..MAX_NONCE_ATTEMPTS {
        let candidate = rfc6979_nonce(&secret, msg, None, Some(SCHNORR_ALGO16), counter);
        let mut k = BigUint::from_bytes_be(&candidate);
        if k.is_zero() || k >= n {
            continue;
        }
        let Ok(k_key) = SecretKey::from_slice(&candidate) else {
            continue;
        };
        let r_point = PublicKey::from_secret_key(&secp, &k_key).serialize_uncompressed();
        let (r_x, r_y) = (&r_point[1..33], &r_point[33..65]);
        if !is_quadratic_residue(r_y) {
            k = &n - k;
        }

        let e = challenge(r_x, &pubkey, msg);
        let s = (k + e * &d) % &n;

        let mut sig = [0u8; 64];
        sig[..32].copy_from_slice(r_x);
        sig[32..].copy_from_slice(&to_bytes32(&s));
        return Ok(sig);
    }

    Err(HarnessError::SigningFailed(format!(
        "no valid nonce after {} attempts",
        MAX_NONCE_ATTEMPTS
    )))
}

/// Verify a 64-byte signature against `pubkey` and a 32-byte digest
pub fn verify(pubkey: &PublicKey, msg: &[u8; 32], sig: &[u8; 64]) -> bool {
    let secp = Secp256k1::new();
    let r = BigUint::from_bytes_be(&sig[..32]);
    let s = BigUint::from_bytes_be(&sig[32..]);
    if r >= field_prime() || s >= curve_order() {
        return false;
    }

    let e = challenge(&sig[..32], pubkey, msg);
    let Ok(e_scalar) = Scalar::from_be_bytes(to_bytes32(&e)) else {
        return false;
    };
    let Ok(s_key) = SecretKey::from_slice(&sig[32..]) else {
        return false;
    };

    let s_g = PublicKey::from_secret_key(&secp, &s_key);
    let Ok(e_p) = pubkey.mul_tweak(&secp, &e_scalar) else {
        return false;
    };
    let Ok(r_point) = s_g.combine(&e_p.negate(&secp)) else {
        return false;
    };

    let r_bytes = r_point.serialize_uncompressed();
    is_quadratic_residue(&r_bytes[33..65]) && r_bytes[1..33] == sig[..32]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash256;

    fn test_key() -> PrivateKey {
        PrivateKey::from_bytes(
            &hex::decode("12b004fff7f4b69ef8650e767f18f11ede158148b425660723b9f9a66e61f747")
                .unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_deterministic_signature_vector() {
        let msg = hash256(b"Very deterministic message");
        let sig = sign(&test_key(), &msg).unwrap();
        assert_eq!(
            hex::encode(sig),
            "2c56731ac2f7a7e7f11518fc7722a166b02438924ca9d8b4d111347b81d0717571846de67ad3d913a8fdf9d8f3f73161a4c48ae81cb183b214765feb86e255ce"
        );
        assert!(verify(&test_key().public_key_point(), &msg, &sig));
    }

    #[test]
    fn test_sign_verify_random_keys() {
        for i in 0..8u8 {
            let key = PrivateKey::generate();
            let msg = sha256(&[i; 7]);
            let sig = key.sign_schnorr(&msg).unwrap();
            assert!(verify(&key.public_key_point(), &msg, &sig));
        }
    }

    #[test]
    fn test_tampered_signature_fails() {
        let key = test_key();
        let msg = [0x42u8; 32];
        let mut sig = sign(&key, &msg).unwrap();
        assert!(verify(&key.public_key_point(), &msg, &sig));
        sig[63] ^= 0x01;
        assert!(!verify(&key.public_key_point(), &msg, &sig));
    }

    #[test]
    fn test_wrong_key_fails() {
        let msg = [0x11u8; 32];
        let sig = sign(&test_key(), &msg).unwrap();
        let other = PrivateKey::generate();
        assert!(!verify(&other.public_key_point(), &msg, &sig));
    }

    #[test]
    fn test_out_of_range_r_rejected() {
        let msg = [0x22u8; 32];
        let mut sig = sign(&test_key(), &msg).unwrap();
        sig[..32].copy_from_slice(&FIELD_SIZE);
        assert!(!verify(&test_key().public_key_point(), &msg, &sig));
    }

    #[test]
    fn test_signing_is_deterministic() {
        let msg = [0x33u8; 32];
        assert_eq!(sign(&test_key(), &msg).unwrap(), sign(&test_key(), &msg).unwrap());
    }
}
