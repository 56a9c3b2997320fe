//! Blocks and headers: serialization, identity, construction helpers and
//! the structural checks a forged block must satisfy

use crate::codec::*;
use crate::constants::*;
use crate::error::{HarnessError, Result};
use crate::hash::{hash256, merkle_root, uint256_to_hex};
use crate::pow::check_proof_of_work;
use crate::script::{p2pk_script, ScriptBuilder, OP_0, OP_TRUE};
use crate::transaction::{is_ctor_ordered, sort_by_txid};
use crate::types::*;

impl Encodable for BlockHeader {
    fn encode_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.prev_block_hash);
        out.extend_from_slice(&self.merkle_root);
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.bits.to_le_bytes());
        out.extend_from_slice(&self.nonce.to_le_bytes());
    }
}

impl Decodable for BlockHeader {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(BlockHeader {
            version: reader.read_i32()?,
            prev_block_hash: reader.read_hash()?,
            merkle_root: reader.read_hash()?,
            timestamp: reader.read_u32()?,
            bits: reader.read_u32()?,
            nonce: reader.read_u32()?,
        })
    }
}

impl Encodable for Block {
    fn encode_to(&self, out: &mut Vec<u8>) {
        self.header.encode_to(out);
        write_vec(out, &self.transactions);
    }
}

impl Decodable for Block {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self> {
        let header = BlockHeader::decode_from(reader)?;
        let transactions = reader.read_vec()?;
        Ok(Block { header, transactions })
    }
}

/// BlockHash: ℋ → ℍ, double-SHA256 of the 80-byte header
pub fn block_hash(header: &BlockHeader) -> Hash {
    hash256(&header.encoded())
}

impl BlockHeader {
    pub fn hash(&self) -> Hash {
        block_hash(self)
    }

    pub fn hash_hex(&self) -> String {
        uint256_to_hex(&self.hash())
    }
}

impl Block {
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn hash_hex(&self) -> String {
        self.header.hash_hex()
    }

    pub fn txids(&self) -> Vec<Hash> {
        self.transactions.iter().map(|tx| tx.txid()).collect()
    }

    pub fn compute_merkle_root(&self) -> Hash {
        merkle_root(&self.txids())
    }

    /// Recompute the header's merkle root from the current transactions
    pub fn update_merkle_root(&mut self) {
        self.header.merkle_root = self.compute_merkle_root();
    }

    /// Increment the nonce until the header hash meets its target
    pub fn solve(&mut self) -> Result<()> {
        loop {
            if check_proof_of_work(&self.header)? {
                return Ok(());
            }
            self.header.nonce = self.header.nonce.checked_add(1).ok_or_else(|| {
                HarnessError::InvalidArgument(format!(
                    "nonce space exhausted for bits {:#010x}",
                    self.header.bits
                ))
            })?;
        }
    }

    pub fn size(&self) -> usize {
        self.encoded().len()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.encoded())
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| HarnessError::InvalidArgument(format!("bad block hex: {}", e)))?;
        decode(&bytes)
    }
}

/// GetBlockSubsidy: ℕ → ℤ
///
/// `subsidy = 50 * C * 2^(-⌊h/H⌋)` with the regtest halving interval H,
/// zero after 64 halvings.
pub fn get_block_subsidy(height: u64) -> i64 {
    let halvings = height / REGTEST_HALVING_INTERVAL;
    if halvings >= 64 {
        return 0;
    }
    INITIAL_SUBSIDY >> halvings
}

/// Coinbase for `height`: BIP34 height push, paying `value` (default: the
/// subsidy) to `pubkey` or to an anyone-can-spend script.
pub fn create_coinbase(height: u64, pubkey: Option<&[u8]>, value: Option<i64>) -> Transaction {
    let script_sig = ScriptBuilder::new().push_int(height as i64).push_opcode(OP_0).into_bytes();
    let script_pubkey = match pubkey {
        Some(pk) => p2pk_script(pk),
        None => vec![OP_TRUE],
    };
    Transaction {
        version: 1,
        inputs: vec![TxIn::new(OutPoint::null(), script_sig)],
        outputs: vec![TxOut::new(value.unwrap_or_else(|| get_block_subsidy(height)), script_pubkey)],
        lock_time: 0,
    }
}

/// Unsolved block on top of `prev_hash` with the merkle root filled in
pub fn create_block(
    prev_hash: Hash,
    coinbase: Transaction,
    time: u32,
    txs: Vec<Transaction>,
) -> Block {
    let mut transactions = Vec::with_capacity(txs.len() + 1);
    transactions.push(coinbase);
    transactions.extend(txs);
    let mut block = Block {
        header: BlockHeader {
            version: 0x2000_0000,
            prev_block_hash: prev_hash,
            merkle_root: ZERO_HASH,
            timestamp: time,
            bits: REGTEST_BITS,
            nonce: 0,
        },
        transactions,
    };
    block.update_merkle_root();
    block
}

/// Spend output `n` of `prev_tx` into a single output
pub fn create_transaction(
    prev_tx: &Transaction,
    n: u32,
    script_sig: ByteString,
    value: i64,
    script_pubkey: ByteString,
) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxIn::new(OutPoint::new(prev_tx.txid(), n), script_sig)],
        outputs: vec![TxOut::new(value, script_pubkey)],
        lock_time: 0,
    }
}

/// Sort the non-coinbase transactions by txid and refresh the merkle root
pub fn make_conform_to_ctor(block: &mut Block) {
    if block.transactions.len() > 1 {
        sort_by_txid(&mut block.transactions[1..]);
    }
    block.update_merkle_root();
}

/// MedianTimePast: median of the last `MEDIAN_TIME_SPAN` timestamps
///
/// `times` is in chain order (oldest first); only the trailing window
/// counts. Returns `None` for an empty list.
pub fn median_time_past(times: &[u32]) -> Option<u32> {
    if times.is_empty() {
        return None;
    }
    let start = times.len().saturating_sub(MEDIAN_TIME_SPAN);
    let mut window = times[start..].to_vec();
    window.sort_unstable();
    Some(window[window.len() / 2])
}

/// Structural checks a block must pass before the node will consider it
///
/// 1. txs[0] is the only coinbase
/// 2. header.merkle_root == MerkleRoot(txids)
/// 3. hash256(header) ≤ target(bits)
/// 4. With `ctor`, txs[1..] strictly ascending by txid
pub fn check_block(block: &Block, ctor: bool) -> Result<()> {
    match block.transactions.first() {
        Some(tx) if tx.is_coinbase() => {}
        _ => return Err(HarnessError::InvalidArgument("first transaction is not a coinbase".to_string())),
    }
    if block.transactions[1..].iter().any(|tx| tx.is_coinbase()) {
        return Err(HarnessError::InvalidArgument("more than one coinbase".to_string()));
    }
    if block.header.merkle_root != block.compute_merkle_root() {
        return Err(HarnessError::InvalidArgument("merkle root mismatch".to_string()));
    }
    if !check_proof_of_work(&block.header)? {
        return Err(HarnessError::InvalidArgument("proof of work below target".to_string()));
    }
    if ctor && !is_ctor_ordered(&block.transactions[1..]) {
        return Err(HarnessError::InvalidArgument("transactions not in canonical order".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::uint256_from_hex;

    const MAINNET_GENESIS_HEADER: &str = "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c";

    fn spend_of(prev: &Transaction, tag: u8) -> Transaction {
        create_transaction(prev, 0, vec![tag], 1000 + tag as i64, vec![OP_TRUE])
    }

    #[test]
    fn test_genesis_header_hash() {
        let bytes = hex::decode(MAINNET_GENESIS_HEADER).unwrap();
        let header: BlockHeader = decode(&bytes).unwrap();
        assert_eq!(header.nonce, 2083236893);
        assert_eq!(
            header.hash_hex(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
        assert!(check_proof_of_work(&header).unwrap());
        assert_eq!(header.encoded(), bytes);
    }

    #[test]
    fn test_header_is_80_bytes() {
        assert_eq!(BlockHeader::default().encoded().len(), BLOCK_HEADER_SIZE);
    }

    #[test]
    fn test_solved_block_meets_target() {
        let coinbase = create_coinbase(1, None, None);
        let mut block = create_block(ZERO_HASH, coinbase, 1_600_000_000, vec![]);
        block.solve().unwrap();
        assert!(check_block(&block, true).is_ok());
        assert_eq!(block.header.merkle_root, block.transactions[0].txid());
    }

    #[test]
    fn test_ctor_block_passes_checks() {
        let coinbase = create_coinbase(2, None, None);
        let txs: Vec<Transaction> = (0..6).map(|i| spend_of(&coinbase, i)).collect();
        let mut block = create_block(ZERO_HASH, coinbase, 1_600_000_000, txs);
        make_conform_to_ctor(&mut block);
        block.solve().unwrap();
        assert!(check_block(&block, true).is_ok());
        let ids = block.txids();
        assert!(ids[1..].windows(2).all(|w| crate::hash::uint256_cmp(&w[0], &w[1]).is_lt()));
    }

    #[test]
    fn test_merkle_mismatch_detected() {
        let coinbase = create_coinbase(3, None, None);
        let extra = spend_of(&coinbase, 1);
        let mut block = create_block(ZERO_HASH, coinbase, 1_600_000_000, vec![]);
        block.transactions.push(extra);
        block.solve().unwrap();
        assert!(check_block(&block, false).is_err());
    }

    #[test]
    fn test_coinbase_bip34_height_push() {
        let cb = create_coinbase(200, None, None);
        assert_eq!(cb.inputs[0].script_sig, vec![0x02, 0xc8, 0x00, OP_0]);
        let small = create_coinbase(5, None, None);
        assert_eq!(small.inputs[0].script_sig, vec![0x55, OP_0]);
        assert!(crate::transaction::check_transaction(&small).is_ok());
    }

    #[test]
    fn test_subsidy_halves_on_regtest() {
        assert_eq!(get_block_subsidy(0), 50 * COIN);
        assert_eq!(get_block_subsidy(149), 50 * COIN);
        assert_eq!(get_block_subsidy(150), 25 * COIN);
        assert_eq!(get_block_subsidy(150 * 64), 0);
    }

    #[test]
    fn test_median_time_past() {
        assert_eq!(median_time_past(&[]), None);
        assert_eq!(median_time_past(&[5]), Some(5));
        let times: Vec<u32> = (1..=20).collect();
        // last eleven are 10..=20
        assert_eq!(median_time_past(&times), Some(15));
        assert_eq!(median_time_past(&[9, 1, 5]), Some(5));
    }

    #[test]
    fn test_block_hex_roundtrip() {
        let coinbase = create_coinbase(7, Some(&[0x02; 33]), Some(1234));
        let block = create_block(uint256_from_hex(&"11".repeat(32)).unwrap(), coinbase, 42, vec![]);
        let parsed = Block::from_hex(&block.to_hex()).unwrap();
        assert_eq!(parsed, block);
        assert_eq!(parsed.transactions[0].outputs[0].value, 1234);
    }
}
