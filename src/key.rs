//! Private keys, public keys, deterministic nonces and the two signature
//! schemes accepted by the node (ECDSA and Schnorr)

use crate::constants::*;
use crate::error::{HarnessError, Result};
use crate::schnorr;
use crate::script::{p2pkh_script_for_pubkey, signature_script_p2pkh};
use crate::transaction::signature_hash_forkid;
use crate::types::Transaction;
use bitcoin_hashes::{hmac, sha256, Hash as BitcoinHash, HashEngine};
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, SecretKey};

/// Regtest/testnet WIF version byte
pub const WIF_VERSION_TESTNET: u8 = 0xef;

/// Signature scheme used at the scriptSig layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SigScheme {
    #[default]
    Ecdsa,
    Schnorr,
}

/// A secp256k1 private key
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey {
    secret: SecretKey,
    compressed: bool,
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("pubkey", &hex::encode(self.public_key()))
            .finish()
    }
}

impl PrivateKey {
    /// Fails with `InvalidKey` unless `bytes` is a 32-byte scalar in [1, n)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 32 {
            return Err(HarnessError::InvalidKey(format!(
                "private key must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let secret = SecretKey::from_slice(bytes)
            .map_err(|e| HarnessError::InvalidKey(e.to_string()))?;
        Ok(Self { secret, compressed: true })
    }

    /// Fresh random key
    pub fn generate() -> Self {
        loop {
            let bytes: [u8; 32] = rand::random();
            if let Ok(secret) = SecretKey::from_slice(&bytes) {
                return Self { secret, compressed: true };
            }
        }
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.secret_bytes()
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn public_key_point(&self) -> PublicKey {
        let secp = Secp256k1::signing_only();
        PublicKey::from_secret_key(&secp, &self.secret)
    }

    /// SEC1 public key: 33 bytes when compressed, 65 bytes for keys
    /// imported from uncompressed WIF
    pub fn public_key(&self) -> Vec<u8> {
        let point = self.public_key_point();
        if self.compressed {
            point.serialize().to_vec()
        } else {
            point.serialize_uncompressed().to_vec()
        }
    }

    /// DER-encoded, low-S ECDSA signature with an RFC6979 nonce
    pub fn sign_ecdsa(&self, digest: &[u8]) -> Result<Vec<u8>> {
        let msg = message_from_digest(digest)?;
        let secp = Secp256k1::signing_only();
        Ok(secp.sign_ecdsa(&msg, &self.secret).serialize_der().to_vec())
    }

    /// 64-byte Bitcoin-Cash Schnorr signature
    pub fn sign_schnorr(&self, digest: &[u8]) -> Result<[u8; 64]> {
        schnorr::sign(self, &digest_array(digest)?)
    }

    pub fn sign(&self, digest: &[u8], scheme: SigScheme) -> Result<Vec<u8>> {
        match scheme {
            SigScheme::Ecdsa => self.sign_ecdsa(digest),
            SigScheme::Schnorr => Ok(self.sign_schnorr(digest)?.to_vec()),
        }
    }

    /// Base58check WIF with the regtest version byte and compression flag
    pub fn to_wif(&self) -> String {
        let mut payload = Vec::with_capacity(34);
        payload.push(WIF_VERSION_TESTNET);
        payload.extend_from_slice(&self.secret.secret_bytes());
        if self.compressed {
            payload.push(0x01);
        }
        bs58::encode(payload).with_check().into_string()
    }

    pub fn from_wif(wif: &str) -> Result<Self> {
        let payload = bs58::decode(wif)
            .with_check(None)
            .into_vec()
            .map_err(|e| HarnessError::InvalidKey(format!("bad WIF: {}", e)))?;
        let (compressed, body) = match payload.len() {
            34 if payload[33] == 0x01 => (true, &payload[1..33]),
            33 => (false, &payload[1..33]),
            len => {
                return Err(HarnessError::InvalidKey(format!("bad WIF payload length {}", len)))
            }
        };
        let mut key = Self::from_bytes(body)?;
        key.compressed = compressed;
        Ok(key)
    }
}

fn digest_array(digest: &[u8]) -> Result<[u8; 32]> {
    digest.try_into().map_err(|_| {
        HarnessError::InvalidArgument(format!("digest must be 32 bytes, got {}", digest.len()))
    })
}

fn message_from_digest(digest: &[u8]) -> Result<Message> {
    Message::from_digest_slice(&digest_array(digest)?)
        .map_err(|e| HarnessError::InvalidArgument(e.to_string()))
}

pub fn parse_public_key(bytes: &[u8]) -> Result<PublicKey> {
    PublicKey::from_slice(bytes).map_err(|e| HarnessError::InvalidKey(e.to_string()))
}

/// Verify a DER ECDSA signature; malformed inputs verify as false
pub fn verify_ecdsa(pubkey: &[u8], digest: &[u8], signature_der: &[u8]) -> bool {
    let (Ok(pk), Ok(msg), Ok(sig)) = (
        parse_public_key(pubkey),
        message_from_digest(digest),
        Signature::from_der(signature_der),
    ) else {
        return false;
    };
    let secp = Secp256k1::verification_only();
    secp.verify_ecdsa(&msg, &sig, &pk).is_ok()
}

/// Verify with the scheme the node would pick: 64-byte signatures are
/// Schnorr, everything else is DER ECDSA
pub fn verify_signature(pubkey: &[u8], digest: &[u8], signature: &[u8]) -> bool {
    if signature.len() == 64 {
        let (Ok(pk), Ok(msg), Ok(sig)) = (
            parse_public_key(pubkey),
            digest_array(digest),
            <[u8; 64]>::try_from(signature),
        ) else {
            return false;
        };
        schnorr::verify(&pk, &msg, &sig)
    } else {
        verify_ecdsa(pubkey, digest, signature)
    }
}

// ============================================================================
// RFC6979
// ============================================================================

fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut engine = hmac::HmacEngine::<sha256::Hash>::new(key);
    for part in parts {
        engine.input(part);
    }
    hmac::Hmac::<sha256::Hash>::from_engine(engine).into_inner()
}

/// RFC6979 HMAC-SHA256 nonce candidate number `counter`
///
/// The key material is `secret || msg || extra || algo16`, matching the
/// libsecp256k1 nonce function. Candidates are returned raw; the caller
/// rejects zero or out-of-range values and asks for the next counter.
pub fn rfc6979_nonce(
    secret: &[u8; 32],
    msg: &[u8; 32],
    extra: Option<&[u8; 32]>,
    algo16: Option<&[u8; 16]>,
    counter: u32,
) -> [u8; 32] {
    let mut key_data = Vec::with_capacity(112);
    key_data.extend_from_slice(secret);
    key_data.extend_from_slice(msg);
    if let Some(extra) = extra {
        key_data.extend_from_slice(extra);
    }
    if let Some(algo) = algo16 {
        key_data.extend_from_slice(algo);
    }

    let mut v = [0x01u8; 32];
    let mut k = [0x00u8; 32];
    k = hmac_sha256(&k, &[&v[..], &[0x00], &key_data[..]]);
    v = hmac_sha256(&k, &[&v[..]]);
    k = hmac_sha256(&k, &[&v[..], &[0x01], &key_data[..]]);
    v = hmac_sha256(&k, &[&v[..]]);

    for i in 0..=counter {
        if i > 0 {
            k = hmac_sha256(&k, &[&v[..], &[0x00]]);
            v = hmac_sha256(&k, &[&v[..]]);
        }
        v = hmac_sha256(&k, &[&v[..]]);
    }
    v
}

// ============================================================================
// Transaction signing
// ============================================================================

/// Sign input `input_index` against `script_code`, returning the signature
/// with the hash type byte appended
pub fn sign_tx_input(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    amount: i64,
    key: &PrivateKey,
    hash_type: u32,
    scheme: SigScheme,
) -> Result<Vec<u8>> {
    let digest = signature_hash_forkid(script_code, tx, input_index, hash_type, amount)?;
    let mut sig = key.sign(&digest, scheme)?;
    sig.push((hash_type & 0xff) as u8);
    Ok(sig)
}

/// Sign a P2PKH input with SIGHASH_ALL|FORKID and install its scriptSig
pub fn sign_tx_input_p2pkh(
    tx: &mut Transaction,
    input_index: usize,
    key: &PrivateKey,
    amount: i64,
    scheme: SigScheme,
) -> Result<()> {
    let pubkey = key.public_key();
    let script_code = p2pkh_script_for_pubkey(&pubkey);
    let sig = sign_tx_input(
        tx,
        input_index,
        &script_code,
        amount,
        key,
        SIGHASH_ALL | SIGHASH_FORKID,
        scheme,
    )?;
    tx.inputs[input_index].script_sig = signature_script_p2pkh(&sig, &pubkey);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash256;
    use crate::types::*;

    const SECRET: &str = "12b004fff7f4b69ef8650e767f18f11ede158148b425660723b9f9a66e61f747";

    fn test_key() -> PrivateKey {
        PrivateKey::from_bytes(&hex::decode(SECRET).unwrap()).unwrap()
    }

    #[test]
    fn test_pubkey_is_compressed() {
        let pk = test_key().public_key();
        assert_eq!(
            hex::encode(pk),
            "030b4c866585dd868a9d62348a9cd008d6a312937048fff31670e7e920cfc7a744"
        );
        let random = PrivateKey::generate().public_key();
        assert!(random[0] == 0x02 || random[0] == 0x03);
    }

    #[test]
    fn test_deterministic_ecdsa_vector() {
        let digest = hash256(b"Very deterministic message");
        let sig = test_key().sign_ecdsa(&digest).unwrap();
        assert_eq!(
            hex::encode(&sig),
            "304402205dbbddda71772d95ce91cd2d14b592cfbc1dd0aabd6a394b6c2d377bbe59d31d022014ddda21494a4e221f0824f0b8b924c43fa43c0ad57dccdaa11f81a6bd4582f6"
        );
        assert!(verify_ecdsa(&test_key().public_key(), &digest, &sig));
        assert!(verify_signature(&test_key().public_key(), &digest, &sig));
    }

    #[test]
    fn test_ecdsa_rejects_wrong_digest() {
        let key = PrivateKey::generate();
        let sig = key.sign_ecdsa(&[1u8; 32]).unwrap();
        assert!(!verify_ecdsa(&key.public_key(), &[2u8; 32], &sig));
    }

    #[test]
    fn test_invalid_key_lengths() {
        assert!(matches!(PrivateKey::from_bytes(&[1u8; 31]), Err(HarnessError::InvalidKey(_))));
        assert!(matches!(PrivateKey::from_bytes(&[0u8; 32]), Err(HarnessError::InvalidKey(_))));
        assert!(matches!(PrivateKey::from_bytes(&[0xffu8; 32]), Err(HarnessError::InvalidKey(_))));
    }

    #[test]
    fn test_digest_must_be_32_bytes() {
        assert!(matches!(
            test_key().sign_ecdsa(&[0u8; 20]),
            Err(HarnessError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_wif_roundtrip() {
        let key = test_key();
        let wif = key.to_wif();
        assert_eq!(wif, "cND2ZvtabDbJ1gucx9GWH6XT9kgTAqfb6cotPt5Q5CyxVDhid2EN");
        assert_eq!(PrivateKey::from_wif(&wif).unwrap(), key);
        assert!(PrivateKey::from_wif("cND2ZvtabDbJ1gucx9GWH6XT9kgTAqfb6cotPt5Q5CyxVDhid2EM").is_err());
    }

    #[test]
    fn test_uncompressed_wif_keeps_uncompressed_pubkey() {
        let mut key = test_key();
        key.compressed = false;
        let imported = PrivateKey::from_wif(&key.to_wif()).unwrap();
        assert!(!imported.is_compressed());

        let pubkey = imported.public_key();
        assert_eq!(pubkey.len(), 65);
        assert_eq!(pubkey[0], 0x04);
        assert_eq!(&pubkey[1..33], &test_key().public_key()[1..]);

        let script = p2pkh_script_for_pubkey(&pubkey);
        let hash = crate::script::extract_p2pkh_hash(&script).unwrap();
        assert_eq!(hash.to_vec(), crate::hash::hash160(&pubkey).to_vec());
        assert_ne!(script, p2pkh_script_for_pubkey(&test_key().public_key()));

        let coinbase = crate::block::create_coinbase(1, None, None);
        let mut tx = crate::block::create_transaction(&coinbase, 0, vec![], 1000, vec![0x51]);
        sign_tx_input_p2pkh(&mut tx, 0, &imported, 5000, SigScheme::Ecdsa).unwrap();
        assert!(tx.inputs[0].script_sig.ends_with(&pubkey));
    }

    #[test]
    fn test_rfc6979_candidates_differ() {
        let secret = [7u8; 32];
        let msg = [9u8; 32];
        let first = rfc6979_nonce(&secret, &msg, None, None, 0);
        let second = rfc6979_nonce(&secret, &msg, None, None, 1);
        assert_ne!(first, second);
        assert_eq!(first, rfc6979_nonce(&secret, &msg, None, None, 0));
        assert_ne!(first, rfc6979_nonce(&secret, &msg, None, Some(b"Schnorr+SHA256  "), 0));
    }

    #[test]
    fn test_sign_p2pkh_input_both_schemes() {
        let key = test_key();
        for scheme in [SigScheme::Ecdsa, SigScheme::Schnorr] {
            let mut tx = Transaction {
                version: 2,
                inputs: vec![TxIn::new(OutPoint::new([3u8; 32], 0), vec![])],
                outputs: vec![TxOut::new(4000, vec![0x51])],
                lock_time: 0,
            };
            sign_tx_input_p2pkh(&mut tx, 0, &key, 5000, scheme).unwrap();

            let ops = crate::script::parse_script(&tx.inputs[0].script_sig).unwrap();
            let (sig, pubkey) = match (&ops[0], &ops[1]) {
                (crate::script::ScriptOp::Push(s), crate::script::ScriptOp::Push(p)) => (s, p),
                other => panic!("unexpected scriptSig {:?}", other),
            };
            assert_eq!(*sig.last().unwrap(), (SIGHASH_ALL | SIGHASH_FORKID) as u8);
            if scheme == SigScheme::Schnorr {
                assert_eq!(sig.len(), 65);
            }

            let digest = signature_hash_forkid(
                &p2pkh_script_for_pubkey(pubkey),
                &tx,
                0,
                SIGHASH_ALL | SIGHASH_FORKID,
                5000,
            )
            .unwrap();
            assert!(verify_signature(pubkey, &digest, &sig[..sig.len() - 1]));
        }
    }
}
