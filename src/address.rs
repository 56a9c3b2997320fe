//! Address encodings: legacy base58check and cashaddr

use crate::error::{HarnessError, Result};
use crate::hash::hash160;

/// Regtest cashaddr human-readable prefix
pub const REGTEST_CASHADDR_PREFIX: &str = "bchreg";

/// Regtest base58 version bytes
pub const REGTEST_P2PKH_VERSION: u8 = 0x6f;
pub const REGTEST_P2SH_VERSION: u8 = 0xc4;

/// Kind of hash an address commits to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    PubKey,
    Script,
}

impl AddressKind {
    fn type_bits(self) -> u8 {
        match self {
            AddressKind::PubKey => 0,
            AddressKind::Script => 1,
        }
    }
}

// ============================================================================
// Base58check
// ============================================================================

/// Base58check of `version || payload`
pub fn base58check_encode(version: u8, payload: &[u8]) -> String {
    let mut data = Vec::with_capacity(payload.len() + 1);
    data.push(version);
    data.extend_from_slice(payload);
    bs58::encode(data).with_check().into_string()
}

/// Inverse of [`base58check_encode`]; fails on a bad checksum
pub fn base58check_decode(s: &str) -> Result<(u8, Vec<u8>)> {
    let data = bs58::decode(s)
        .with_check(None)
        .into_vec()
        .map_err(|e| HarnessError::InvalidArgument(format!("bad base58check string: {}", e)))?;
    match data.split_first() {
        Some((version, payload)) => Ok((*version, payload.to_vec())),
        None => Err(HarnessError::InvalidArgument("empty base58check payload".to_string())),
    }
}

// ============================================================================
// Cashaddr
// ============================================================================

const CHARSET: &[u8; 32] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";

const GENERATORS: [u64; 5] = [
    0x98f2bc8e61,
    0x79b76d99e2,
    0xf33e5fb3c4,
    0xae2eabe2a8,
    0x1e4f43e470,
];

fn polymod(values: &[u8]) -> u64 {
    let mut c: u64 = 1;
    for &d in values {
        let c0 = (c >> 35) as u8;
        c = ((c & 0x07_ffff_ffff) << 5) ^ d as u64;
        for (i, g) in GENERATORS.iter().enumerate() {
            if c0 & (1 << i) != 0 {
                c ^= g;
            }
        }
    }
    c ^ 1
}

fn prefix_values(prefix: &str) -> Vec<u8> {
    let mut values: Vec<u8> = prefix.bytes().map(|b| b & 0x1f).collect();
    values.push(0);
    values
}

/// Regroup bits; `pad` fills the last group with zeros when encoding
fn convert_bits(data: &[u8], from: u32, to: u32, pad: bool) -> Result<Vec<u8>> {
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    let max = (1u32 << to) - 1;
    let mut out = Vec::with_capacity(data.len() * from as usize / to as usize + 1);
    for &value in data {
        if (value as u32) >> from != 0 {
            return Err(HarnessError::InvalidArgument("invalid data value".to_string()));
        }
        acc = (acc << from) | value as u32;
        bits += from;
        while bits >= to {
            bits -= to;
            out.push(((acc >> bits) & max) as u8);
        }
    }
    if pad {
        if bits > 0 {
            out.push(((acc << (to - bits)) & max) as u8);
        }
    } else if bits >= from || ((acc << (to - bits)) & max) != 0 {
        return Err(HarnessError::InvalidArgument("non-zero cashaddr padding".to_string()));
    }
    Ok(out)
}

fn size_code(len: usize) -> Result<u8> {
    let code = match len {
        20 => 0,
        24 => 1,
        28 => 2,
        32 => 3,
        40 => 4,
        48 => 5,
        56 => 6,
        64 => 7,
        _ => {
            return Err(HarnessError::InvalidArgument(format!(
                "unsupported cashaddr payload length {}",
                len
            )))
        }
    };
    Ok(code)
}

/// Encode `payload` as `prefix:<base32 data + checksum>`
pub fn cashaddr_encode(prefix: &str, kind: AddressKind, payload: &[u8]) -> Result<String> {
    let version = (kind.type_bits() << 3) | size_code(payload.len())?;
    let mut raw = Vec::with_capacity(payload.len() + 1);
    raw.push(version);
    raw.extend_from_slice(payload);
    let data = convert_bits(&raw, 8, 5, true)?;

    let mut checked = prefix_values(prefix);
    checked.extend_from_slice(&data);
    checked.extend_from_slice(&[0u8; 8]);
    let checksum = polymod(&checked);

    let mut out = String::with_capacity(prefix.len() + 1 + data.len() + 8);
    out.push_str(prefix);
    out.push(':');
    for &d in &data {
        out.push(CHARSET[d as usize] as char);
    }
    for i in 0..8 {
        out.push(CHARSET[((checksum >> (5 * (7 - i))) & 0x1f) as usize] as char);
    }
    Ok(out)
}

/// Decode a prefixed cashaddr into `(prefix, kind, payload)`
pub fn cashaddr_decode(s: &str) -> Result<(String, AddressKind, Vec<u8>)> {
    let (prefix, body) = s
        .rsplit_once(':')
        .ok_or_else(|| HarnessError::InvalidArgument(format!("cashaddr {} has no prefix", s)))?;
    cashaddr_decode_parts(prefix, body)
}

/// Decode, assuming `default_prefix` when the address carries none
pub fn cashaddr_decode_with_prefix(s: &str, default_prefix: &str) -> Result<(String, AddressKind, Vec<u8>)> {
    match s.rsplit_once(':') {
        Some((prefix, body)) => cashaddr_decode_parts(prefix, body),
        None => cashaddr_decode_parts(default_prefix, s),
    }
}

fn cashaddr_decode_parts(prefix: &str, body: &str) -> Result<(String, AddressKind, Vec<u8>)> {
    let has_lower = prefix.chars().chain(body.chars()).any(|c| c.is_ascii_lowercase());
    let has_upper = prefix.chars().chain(body.chars()).any(|c| c.is_ascii_uppercase());
    if has_lower && has_upper {
        return Err(HarnessError::InvalidArgument("mixed-case cashaddr".to_string()));
    }
    let prefix = prefix.to_ascii_lowercase();
    let body = body.to_ascii_lowercase();
    if body.len() < 8 {
        return Err(HarnessError::InvalidArgument("cashaddr too short".to_string()));
    }

    let mut values = Vec::with_capacity(body.len());
    for c in body.bytes() {
        let v = CHARSET
            .iter()
            .position(|&x| x == c)
            .ok_or_else(|| HarnessError::InvalidArgument(format!("invalid cashaddr character {:?}", c as char)))?;
        values.push(v as u8);
    }

    let mut checked = prefix_values(&prefix);
    checked.extend_from_slice(&values);
    if polymod(&checked) != 0 {
        return Err(HarnessError::InvalidArgument("cashaddr checksum mismatch".to_string()));
    }

    let raw = convert_bits(&values[..values.len() - 8], 5, 8, false)?;
    let (version, payload) = raw
        .split_first()
        .ok_or_else(|| HarnessError::InvalidArgument("empty cashaddr payload".to_string()))?;
    if version & 0x80 != 0 {
        return Err(HarnessError::InvalidArgument("reserved cashaddr version bit set".to_string()));
    }
    let kind = match version >> 3 {
        0 => AddressKind::PubKey,
        1 => AddressKind::Script,
        other => {
            return Err(HarnessError::InvalidArgument(format!("unknown cashaddr type {}", other)))
        }
    };
    if size_code(payload.len())? != version & 0x07 {
        return Err(HarnessError::InvalidArgument("cashaddr size code mismatch".to_string()));
    }
    Ok((prefix, kind, payload.to_vec()))
}

/// Regtest cashaddr paying to a public key's hash
pub fn pubkey_to_cashaddr(pubkey: &[u8]) -> Result<String> {
    cashaddr_encode(REGTEST_CASHADDR_PREFIX, AddressKind::PubKey, &hash160(pubkey))
}

/// Regtest cashaddr paying to a redeem script's hash
pub fn script_to_cashaddr(redeem_script: &[u8]) -> Result<String> {
    cashaddr_encode(REGTEST_CASHADDR_PREFIX, AddressKind::Script, &hash160(redeem_script))
}

/// Regtest legacy address paying to a public key's hash
pub fn pubkey_to_legacy(pubkey: &[u8]) -> String {
    base58check_encode(REGTEST_P2PKH_VERSION, &hash160(pubkey))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "76a04053bda0a88bda5177b86a15c3b29f559873";

    #[test]
    fn test_cashaddr_reference_vectors() {
        let hash = hex::decode(HASH).unwrap();
        assert_eq!(
            cashaddr_encode("bitcoincash", AddressKind::PubKey, &hash).unwrap(),
            "bitcoincash:qpm2qsznhks23z7629mms6s4cwef74vcwvy22gdx6a"
        );
        assert_eq!(
            cashaddr_encode("bitcoincash", AddressKind::Script, &hash).unwrap(),
            "bitcoincash:ppm2qsznhks23z7629mms6s4cwef74vcwvn0h829pq"
        );
        assert_eq!(
            cashaddr_encode("bchreg", AddressKind::PubKey, &hash).unwrap(),
            "bchreg:qpm2qsznhks23z7629mms6s4cwef74vcwv6ycwvz78"
        );
    }

    #[test]
    fn test_cashaddr_decode() {
        let (prefix, kind, payload) =
            cashaddr_decode("bitcoincash:ppm2qsznhks23z7629mms6s4cwef74vcwvn0h829pq").unwrap();
        assert_eq!(prefix, "bitcoincash");
        assert_eq!(kind, AddressKind::Script);
        assert_eq!(hex::encode(payload), HASH);

        let upper = "BITCOINCASH:QPM2QSZNHKS23Z7629MMS6S4CWEF74VCWVY22GDX6A";
        assert_eq!(cashaddr_decode(upper).unwrap().1, AddressKind::PubKey);
    }

    #[test]
    fn test_cashaddr_default_prefix() {
        let (prefix, _, payload) =
            cashaddr_decode_with_prefix("qpm2qsznhks23z7629mms6s4cwef74vcwvy22gdx6a", "bitcoincash")
                .unwrap();
        assert_eq!(prefix, "bitcoincash");
        assert_eq!(hex::encode(payload), HASH);
    }

    #[test]
    fn test_cashaddr_rejects_bad_input() {
        assert!(cashaddr_decode("bitcoincash:qpm2qsznhks23z7629mms6s4cwef74vcwvy22gdx6b").is_err());
        assert!(cashaddr_decode("bitcoincash:Qpm2qsznhks23z7629mms6s4cwef74vcwvy22gdx6a").is_err());
        assert!(cashaddr_decode("bchreg:qpm2qsznhks23z7629mms6s4cwef74vcwvy22gdx6a").is_err());
        assert!(cashaddr_decode("qpm2qsznhks23z7629mms6s4cwef74vcwvy22gdx6a").is_err());
        assert!(cashaddr_encode("bitcoincash", AddressKind::PubKey, &[0u8; 21]).is_err());
    }

    #[test]
    fn test_regtest_pubkey_address() {
        let pubkey =
            hex::decode("030b4c866585dd868a9d62348a9cd008d6a312937048fff31670e7e920cfc7a744").unwrap();
        assert_eq!(
            pubkey_to_cashaddr(&pubkey).unwrap(),
            "bchreg:qrh3ethkfms79tlcw7m736t38hp9kg5f7grmq579e5"
        );
    }

    #[test]
    fn test_base58check_vector() {
        let hash = hex::decode(HASH).unwrap();
        let encoded = base58check_encode(0x00, &hash);
        assert_eq!(encoded, "1BpEi6DfDAUFd7GtittLSdBeYJvcoaVggu");
        let (version, payload) = base58check_decode(&encoded).unwrap();
        assert_eq!(version, 0);
        assert_eq!(payload, hash);
    }

    #[test]
    fn test_base58check_bad_checksum() {
        assert!(base58check_decode("1BpEi6DfDAUFd7GtittLSdBeYJvcoaVggv").is_err());
    }
}
