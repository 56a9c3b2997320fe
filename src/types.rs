//! Core data model shared by the codec, the peer emulator and the tests
//!
//! Hashes are held in internal byte order (the order they are serialized
//! on the wire). Use [`crate::hash::uint256_to_hex`] for the reversed
//! display form the node prints over RPC.

use serde::{Deserialize, Serialize};

/// Hash type: 256-bit hash in internal byte order
pub type Hash = [u8; 32];

/// Byte string type
pub type ByteString = Vec<u8>;

/// All-zero hash, used as the coinbase prevout and as "no stop hash"
pub const ZERO_HASH: Hash = [0u8; 32];

/// OutPoint: (txid, output index)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub hash: Hash,
    pub index: u32,
}

impl OutPoint {
    pub fn new(hash: Hash, index: u32) -> Self {
        Self { hash, index }
    }

    /// The null outpoint spent by a coinbase input
    pub fn null() -> Self {
        Self { hash: ZERO_HASH, index: 0xffffffff }
    }

    pub fn is_null(&self) -> bool {
        self.hash == ZERO_HASH && self.index == 0xffffffff
    }
}

/// Transaction input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: ByteString,
    pub sequence: u32,
}

impl TxIn {
    pub fn new(prevout: OutPoint, script_sig: ByteString) -> Self {
        Self { prevout, script_sig, sequence: crate::constants::SEQUENCE_FINAL }
    }
}

/// Transaction output, value in satoshis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: ByteString,
}

impl TxOut {
    pub fn new(value: i64, script_pubkey: ByteString) -> Self {
        Self { value, script_pubkey }
    }
}

/// Transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Default for Transaction {
    fn default() -> Self {
        Self { version: 1, inputs: Vec::new(), outputs: Vec::new(), lock_time: 0 }
    }
}

/// Block header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block_hash: Hash,
    pub merkle_root: Hash,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl Default for BlockHeader {
    fn default() -> Self {
        Self {
            version: 1,
            prev_block_hash: ZERO_HASH,
            merkle_root: ZERO_HASH,
            timestamp: 0,
            bits: crate::constants::REGTEST_BITS,
            nonce: 0,
        }
    }
}

/// Block: header plus ordered transactions, coinbase first
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

/// Inventory object kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvKind {
    Error,
    Tx,
    Block,
    FilteredBlock,
    CompactBlock,
    XThinBlock,
    Unknown(u32),
}

impl InvKind {
    pub fn to_u32(self) -> u32 {
        match self {
            InvKind::Error => 0,
            InvKind::Tx => 1,
            InvKind::Block => 2,
            InvKind::FilteredBlock => 3,
            InvKind::CompactBlock => 4,
            InvKind::XThinBlock => 5,
            InvKind::Unknown(v) => v,
        }
    }

    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => InvKind::Error,
            1 => InvKind::Tx,
            2 => InvKind::Block,
            3 => InvKind::FilteredBlock,
            4 => InvKind::CompactBlock,
            5 => InvKind::XThinBlock,
            v => InvKind::Unknown(v),
        }
    }
}

/// Inventory vector identifying an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvItem {
    pub kind: InvKind,
    pub hash: Hash,
}

impl InvItem {
    pub fn new(kind: InvKind, hash: Hash) -> Self {
        Self { kind, hash }
    }

    pub fn tx(hash: Hash) -> Self {
        Self::new(InvKind::Tx, hash)
    }

    pub fn block(hash: Hash) -> Self {
        Self::new(InvKind::Block, hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_outpoint() {
        assert!(OutPoint::null().is_null());
        assert!(!OutPoint::new(ZERO_HASH, 0).is_null());
    }

    #[test]
    fn test_inv_kind_values() {
        for v in 0..8u32 {
            assert_eq!(InvKind::from_u32(v).to_u32(), v);
        }
        assert_eq!(InvKind::from_u32(2), InvKind::Block);
        assert_eq!(InvKind::from_u32(42), InvKind::Unknown(42));
    }

    #[test]
    fn test_txin_defaults_to_final_sequence() {
        let txin = TxIn::new(OutPoint::null(), vec![0x51]);
        assert_eq!(txin.sequence, 0xffffffff);
    }
}
