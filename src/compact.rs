//! Compact blocks: header-and-short-ids descriptors, differential index
//! sets, short-id derivation and block reconstruction
//!
//! Indexes are held absolute in memory and written differentially on the
//! wire (each index minus the previous index plus one). The wire form only
//! expresses ascending sets, so encoding sorts the indexes and drops repeats.

use crate::codec::*;
use crate::error::{HarnessError, Result};
use crate::hash::{sha256, siphash24};
use crate::types::*;
use std::collections::HashMap;

/// Short ids are the low 48 bits of the SipHash output
pub const SHORT_ID_MASK: u64 = 0x0000_ffff_ffff_ffff;

/// Largest index a compact-block message may carry
const MAX_INDEX: u64 = u16::MAX as u64;

/// A transaction sent in full inside a compact block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefilledTransaction {
    pub index: u32,
    pub tx: Transaction,
}

/// `cmpctblock` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderAndShortIds {
    pub header: BlockHeader,
    pub nonce: u64,
    pub short_ids: Vec<u64>,
    pub prefilled_txs: Vec<PrefilledTransaction>,
}

/// `getblocktxn` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTransactionsRequest {
    pub block_hash: Hash,
    pub indexes: Vec<u32>,
}

/// `blocktxn` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTransactions {
    pub block_hash: Hash,
    pub transactions: Vec<Transaction>,
}

/// SipHash keys for a compact block: `sha256(header || nonce)` split into
/// two little-endian 64-bit words
pub fn short_id_keys(header: &BlockHeader, nonce: u64) -> (u64, u64) {
    let mut data = header.encoded();
    data.extend_from_slice(&nonce.to_le_bytes());
    let digest = sha256(&data);
    let mut k0 = [0u8; 8];
    let mut k1 = [0u8; 8];
    k0.copy_from_slice(&digest[..8]);
    k1.copy_from_slice(&digest[8..16]);
    (u64::from_le_bytes(k0), u64::from_le_bytes(k1))
}

pub fn calculate_short_id(k0: u64, k1: u64, txid: &Hash) -> u64 {
    siphash24(k0, k1, txid) & SHORT_ID_MASK
}

/// Indexes as the wire can carry them: strictly ascending, no repeats
fn ascending(indexes: impl Iterator<Item = u32>) -> Vec<u32> {
    let mut sorted: Vec<u32> = indexes.collect();
    sorted.sort_unstable();
    sorted.dedup();
    sorted
}

/// Write a count then each index as its distance past the previous one
fn write_differential(out: &mut Vec<u8>, indexes: &[u32]) {
    write_compact_size(out, indexes.len() as u64);
    let mut next = 0u64;
    for &index in indexes {
        write_compact_size(out, index as u64 - next);
        next = index as u64 + 1;
    }
}

fn read_differential(reader: &mut Reader<'_>, last: &mut Option<u64>) -> Result<u32> {
    let delta = reader.read_compact_size()?;
    let index = match *last {
        Some(prev) => prev + 1 + delta,
        None => delta,
    };
    if delta > MAX_INDEX || index > MAX_INDEX {
        return Err(HarnessError::malformed(format!("compact block index {} out of range", index)));
    }
    *last = Some(index);
    Ok(index as u32)
}

impl Encodable for HeaderAndShortIds {
    fn encode_to(&self, out: &mut Vec<u8>) {
        self.header.encode_to(out);
        out.extend_from_slice(&self.nonce.to_le_bytes());
        write_compact_size(out, self.short_ids.len() as u64);
        for id in &self.short_ids {
            out.extend_from_slice(&id.to_le_bytes()[..6]);
        }
        let mut prefilled: Vec<&PrefilledTransaction> = self.prefilled_txs.iter().collect();
        prefilled.sort_by_key(|p| p.index);
        prefilled.dedup_by_key(|p| p.index);
        write_compact_size(out, prefilled.len() as u64);
        let mut next = 0u64;
        for p in prefilled {
            write_compact_size(out, p.index as u64 - next);
            p.tx.encode_to(out);
            next = p.index as u64 + 1;
        }
    }
}

impl Decodable for HeaderAndShortIds {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self> {
        let header = BlockHeader::decode_from(reader)?;
        let nonce = reader.read_u64()?;
        let count = reader.read_count(6)?;
        let mut short_ids = Vec::with_capacity(count);
        for _ in 0..count {
            let bytes = reader.read_bytes(6)?;
            let mut word = [0u8; 8];
            word[..6].copy_from_slice(bytes);
            short_ids.push(u64::from_le_bytes(word));
        }
        let count = reader.read_count(1)?;
        let mut prefilled_txs = Vec::with_capacity(count);
        let mut last = None;
        for _ in 0..count {
            let index = read_differential(reader, &mut last)?;
            let tx = Transaction::decode_from(reader)?;
            prefilled_txs.push(PrefilledTransaction { index, tx });
        }
        Ok(HeaderAndShortIds { header, nonce, short_ids, prefilled_txs })
    }
}

impl Encodable for BlockTransactionsRequest {
    fn encode_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.block_hash);
        write_differential(out, &ascending(self.indexes.iter().copied()));
    }
}

impl Decodable for BlockTransactionsRequest {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self> {
        let block_hash = reader.read_hash()?;
        let count = reader.read_count(1)?;
        let mut indexes = Vec::with_capacity(count);
        let mut last = None;
        for _ in 0..count {
            indexes.push(read_differential(reader, &mut last)?);
        }
        Ok(BlockTransactionsRequest { block_hash, indexes })
    }
}

impl Encodable for BlockTransactions {
    fn encode_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.block_hash);
        write_vec(out, &self.transactions);
    }
}

impl Decodable for BlockTransactions {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(BlockTransactions { block_hash: reader.read_hash()?, transactions: reader.read_vec()? })
    }
}

impl HeaderAndShortIds {
    /// Build the descriptor for `block`, sending the transactions at
    /// `prefill` (ascending absolute indexes) in full
    pub fn from_block(block: &Block, nonce: u64, prefill: &[usize]) -> Self {
        let (k0, k1) = short_id_keys(&block.header, nonce);
        let mut short_ids = Vec::new();
        let mut prefilled_txs = Vec::new();
        for (i, tx) in block.transactions.iter().enumerate() {
            if prefill.contains(&i) {
                prefilled_txs.push(PrefilledTransaction { index: i as u32, tx: tx.clone() });
            } else {
                short_ids.push(calculate_short_id(k0, k1, &tx.txid()));
            }
        }
        HeaderAndShortIds { header: block.header.clone(), nonce, short_ids, prefilled_txs }
    }

    pub fn keys(&self) -> (u64, u64) {
        short_id_keys(&self.header, self.nonce)
    }

    pub fn block_tx_count(&self) -> usize {
        self.short_ids.len() + self.prefilled_txs.len()
    }

    /// Place prefilled transactions and any `known` transaction whose short
    /// id matches; the result lists the slots still missing
    pub fn reconstruct(&self, known: &[Transaction]) -> Result<PartialBlock> {
        let total = self.block_tx_count();
        let mut slots: Vec<Option<Transaction>> = vec![None; total];
        for prefilled in &self.prefilled_txs {
            let index = prefilled.index as usize;
            if index >= total {
                return Err(HarnessError::ProtocolViolation(format!(
                    "prefilled index {} beyond block of {} transactions",
                    index, total
                )));
            }
            slots[index] = Some(prefilled.tx.clone());
        }

        let (k0, k1) = self.keys();
        let by_short_id: HashMap<u64, &Transaction> = known
            .iter()
            .map(|tx| (calculate_short_id(k0, k1, &tx.txid()), tx))
            .collect();

        let mut ids = self.short_ids.iter();
        for slot in slots.iter_mut().filter(|s| s.is_none()) {
            if let Some(id) = ids.next() {
                *slot = by_short_id.get(id).map(|tx| (*tx).clone());
            }
        }

        Ok(PartialBlock { header: self.header.clone(), slots })
    }
}

/// Block under reconstruction from a compact announcement
#[derive(Debug, Clone)]
pub struct PartialBlock {
    pub header: BlockHeader,
    pub slots: Vec<Option<Transaction>>,
}

impl PartialBlock {
    pub fn missing_indexes(&self) -> Vec<u32> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// `getblocktxn` for every missing slot
    pub fn request(&self) -> BlockTransactionsRequest {
        BlockTransactionsRequest {
            block_hash: crate::block::block_hash(&self.header),
            indexes: self.missing_indexes(),
        }
    }

    /// Fill the missing slots in order from a `blocktxn` response
    pub fn fill(&mut self, response: &BlockTransactions) -> Result<()> {
        let missing = self.missing_indexes();
        if missing.len() != response.transactions.len() {
            return Err(HarnessError::ProtocolViolation(format!(
                "blocktxn carries {} transactions, {} missing",
                response.transactions.len(),
                missing.len()
            )));
        }
        for (index, tx) in missing.into_iter().zip(&response.transactions) {
            self.slots[index as usize] = Some(tx.clone());
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(|s| s.is_some())
    }

    /// Assemble the block; fails while slots are missing
    pub fn into_block(self) -> Result<Block> {
        let mut transactions = Vec::with_capacity(self.slots.len());
        for (i, slot) in self.slots.into_iter().enumerate() {
            transactions.push(slot.ok_or_else(|| {
                HarnessError::ProtocolViolation(format!("transaction {} still missing", i))
            })?);
        }
        Ok(Block { header: self.header, transactions })
    }
}
