//! Consensus serialization primitives
//!
//! Every wire object implements [`Encodable`] and [`Decodable`]. Decoding is
//! driven by a [`Reader`] cursor that fails with
//! [`HarnessError::MalformedMessage`] on truncation, non-canonical compact
//! sizes and out-of-range values; [`decode`] additionally rejects trailing
//! bytes.

use crate::constants::MAX_MONEY;
use crate::error::{HarnessError, Result};
use crate::types::*;

/// Serialize a value into a fresh buffer
pub trait Encodable {
    fn encode_to(&self, out: &mut Vec<u8>);

    fn encoded(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_to(&mut out);
        out
    }
}

/// Parse a value from a reader positioned at its first byte
pub trait Decodable: Sized {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self>;
}

/// Encode `value` with its canonical serialization
pub fn encode<T: Encodable>(value: &T) -> Vec<u8> {
    value.encoded()
}

/// Decode a complete value; trailing bytes are an error
pub fn decode<T: Decodable>(bytes: &[u8]) -> Result<T> {
    let mut reader = Reader::new(bytes);
    let value = T::decode_from(&mut reader)?;
    reader.finish()?;
    Ok(value)
}

/// Bounds-checked cursor over a byte slice
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Fail if any input is left unread
    pub fn finish(&self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(HarnessError::malformed(format!(
                "{} trailing bytes",
                self.remaining()
            )));
        }
        Ok(())
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(HarnessError::malformed(format!(
                "need {} bytes at offset {}, have {}",
                len,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16_le(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u16_be(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    pub fn read_hash(&mut self) -> Result<Hash> {
        self.read_array()
    }

    /// Read a Bitcoin compact size (1/3/5/9 bytes), rejecting non-minimal forms
    pub fn read_compact_size(&mut self) -> Result<u64> {
        let first = self.read_u8()?;
        let (value, min) = match first {
            0xfd => (self.read_u16_le()? as u64, 0xfd),
            0xfe => (self.read_u32()? as u64, 0x1_0000),
            0xff => (self.read_u64()?, 0x1_0000_0000),
            n => return Ok(n as u64),
        };
        if value < min {
            return Err(HarnessError::malformed("non-canonical compact size"));
        }
        Ok(value)
    }

    /// Read a compact-size element count that cannot exceed the bytes left
    pub fn read_count(&mut self, min_element_size: usize) -> Result<usize> {
        let count = self.read_compact_size()?;
        let limit = self.remaining() / min_element_size.max(1);
        if count > limit as u64 {
            return Err(HarnessError::malformed(format!(
                "count {} exceeds remaining payload",
                count
            )));
        }
        Ok(count as usize)
    }

    pub fn read_var_bytes(&mut self) -> Result<ByteString> {
        let len = self.read_compact_size()?;
        if len > self.remaining() as u64 {
            return Err(HarnessError::malformed(format!(
                "length prefix {} exceeds remaining {}",
                len,
                self.remaining()
            )));
        }
        Ok(self.read_bytes(len as usize)?.to_vec())
    }

    pub fn read_var_string(&mut self) -> Result<String> {
        let bytes = self.read_var_bytes()?;
        String::from_utf8(bytes).map_err(|e| HarnessError::malformed(e.to_string()))
    }

    pub fn read_vec<T: Decodable>(&mut self) -> Result<Vec<T>> {
        let count = self.read_count(1)?;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(T::decode_from(self)?);
        }
        Ok(items)
    }
}

/// Number of bytes the compact size encoding of `n` occupies
pub fn compact_size_len(n: u64) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

pub fn write_compact_size(out: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => out.push(n as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&n.to_le_bytes());
        }
    }
}

pub fn write_var_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_compact_size(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

pub fn write_vec<T: Encodable>(out: &mut Vec<u8>, items: &[T]) {
    write_compact_size(out, items.len() as u64);
    for item in items {
        item.encode_to(out);
    }
}

// ============================================================================
// Primitive and data model impls
// ============================================================================

impl Encodable for Hash {
    fn encode_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }
}

impl Decodable for Hash {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self> {
        reader.read_hash()
    }
}

impl Encodable for OutPoint {
    fn encode_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.hash);
        out.extend_from_slice(&self.index.to_le_bytes());
    }
}

impl Decodable for OutPoint {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(OutPoint { hash: reader.read_hash()?, index: reader.read_u32()? })
    }
}

impl Encodable for TxIn {
    fn encode_to(&self, out: &mut Vec<u8>) {
        self.prevout.encode_to(out);
        write_var_bytes(out, &self.script_sig);
        out.extend_from_slice(&self.sequence.to_le_bytes());
    }
}

impl Decodable for TxIn {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(TxIn {
            prevout: OutPoint::decode_from(reader)?,
            script_sig: reader.read_var_bytes()?,
            sequence: reader.read_u32()?,
        })
    }
}

impl Encodable for TxOut {
    fn encode_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.value.to_le_bytes());
        write_var_bytes(out, &self.script_pubkey);
    }
}

impl Decodable for TxOut {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self> {
        let value = reader.read_i64()?;
        if !(0..=MAX_MONEY).contains(&value) {
            return Err(HarnessError::malformed(format!("output value {} out of range", value)));
        }
        Ok(TxOut { value, script_pubkey: reader.read_var_bytes()? })
    }
}

impl Encodable for InvItem {
    fn encode_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.kind.to_u32().to_le_bytes());
        out.extend_from_slice(&self.hash);
    }
}

impl Decodable for InvItem {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(InvItem { kind: InvKind::from_u32(reader.read_u32()?), hash: reader.read_hash()? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_size_widths() {
        let cases: [(u64, usize); 7] = [
            (0, 1),
            (0xfc, 1),
            (0xfd, 3),
            (0xffff, 3),
            (0x1_0000, 5),
            (0xffff_ffff, 5),
            (0x1_0000_0000, 9),
        ];
        for (n, len) in cases {
            let mut out = Vec::new();
            write_compact_size(&mut out, n);
            assert_eq!(out.len(), len, "width of {}", n);
            assert_eq!(compact_size_len(n), len);
            let mut reader = Reader::new(&out);
            assert_eq!(reader.read_compact_size().unwrap(), n);
            assert!(reader.is_empty());
        }
    }

    #[test]
    fn test_non_canonical_compact_size_rejected() {
        let bytes = [0xfd, 0x10, 0x00];
        let mut reader = Reader::new(&bytes);
        assert!(matches!(reader.read_compact_size(), Err(HarnessError::MalformedMessage(_))));
    }

    #[test]
    fn test_truncated_compact_size_rejected() {
        let bytes = [0xfe, 0x01, 0x02];
        let mut reader = Reader::new(&bytes);
        assert!(reader.read_compact_size().is_err());
    }

    #[test]
    fn test_length_prefix_exceeds_payload() {
        let bytes = [0x05, 0x01, 0x02];
        let mut reader = Reader::new(&bytes);
        assert!(matches!(reader.read_var_bytes(), Err(HarnessError::MalformedMessage(_))));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = OutPoint::new([7u8; 32], 3).encoded();
        bytes.push(0);
        assert!(matches!(decode::<OutPoint>(&bytes), Err(HarnessError::MalformedMessage(_))));
    }

    #[test]
    fn test_negative_amount_rejected() {
        let txout = TxOut { value: -1, script_pubkey: vec![0x51] };
        let bytes = txout.encoded();
        assert!(decode::<TxOut>(&bytes).is_err());
    }

    #[test]
    fn test_amount_above_max_money_rejected() {
        let txout = TxOut { value: MAX_MONEY + 1, script_pubkey: vec![] };
        assert!(decode::<TxOut>(&txout.encoded()).is_err());
    }

    #[test]
    fn test_txin_layout() {
        let txin = TxIn {
            prevout: OutPoint::new([0xab; 32], 1),
            script_sig: vec![0x51, 0x52],
            sequence: 0xfffffffe,
        };
        let bytes = txin.encoded();
        assert_eq!(bytes.len(), 32 + 4 + 1 + 2 + 4);
        assert_eq!(&bytes[32..36], &[1, 0, 0, 0]);
        assert_eq!(decode::<TxIn>(&bytes).unwrap(), txin);
    }

    #[test]
    fn test_inv_item_layout() {
        let item = InvItem::block([0x11; 32]);
        let bytes = item.encoded();
        assert_eq!(&bytes[..4], &[2, 0, 0, 0]);
        assert_eq!(decode::<InvItem>(&bytes).unwrap(), item);
    }

    #[test]
    fn test_vec_count_larger_than_payload() {
        let bytes = [0xfd, 0xff, 0x00, 0x01];
        let mut reader = Reader::new(&bytes);
        assert!(reader.read_vec::<InvItem>().is_err());
    }
}
