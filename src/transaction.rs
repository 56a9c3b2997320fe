//! Transactions: serialization, identity, sanity checks, signature hashing,
//! minimum-size padding and canonical ordering

use crate::codec::*;
use crate::constants::*;
use crate::error::{HarnessError, Result};
use crate::hash::{hash256, sha256, uint256_cmp, uint256_to_hex};
use crate::script::OP_RETURN;
use crate::types::*;
use std::collections::HashSet;

impl Encodable for Transaction {
    fn encode_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.version.to_le_bytes());
        write_vec(out, &self.inputs);
        write_vec(out, &self.outputs);
        out.extend_from_slice(&self.lock_time.to_le_bytes());
    }
}

impl Decodable for Transaction {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self> {
        let version = reader.read_i32()?;
        let inputs = reader.read_vec()?;
        let outputs = reader.read_vec()?;
        let lock_time = reader.read_u32()?;
        Ok(Transaction { version, inputs, outputs, lock_time })
    }
}

impl Transaction {
    /// Double-SHA256 of the serialization, internal byte order
    pub fn txid(&self) -> Hash {
        hash256(&self.encoded())
    }

    /// Txid in the byte-reversed hex form the node reports
    pub fn hash_hex(&self) -> String {
        uint256_to_hex(&self.txid())
    }

    pub fn size(&self) -> usize {
        self.encoded().len()
    }

    pub fn is_coinbase(&self) -> bool {
        is_coinbase(self)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.encoded())
    }

    /// Parse the raw hex form produced by `getrawtransaction`
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| HarnessError::InvalidArgument(format!("bad tx hex: {}", e)))?;
        decode(&bytes)
    }

    pub fn total_output_value(&self) -> i64 {
        self.outputs.iter().map(|o| o.value).sum()
    }

    /// Context-free sanity checks; see [`check_transaction`]
    pub fn check(&self) -> Result<()> {
        check_transaction(self)
    }
}

/// IsCoinbase: 𝒯𝒳 → {true, false}
///
/// A transaction is a coinbase iff it has exactly one input spending the
/// null outpoint.
pub fn is_coinbase(tx: &Transaction) -> bool {
    tx.inputs.len() == 1 && tx.inputs[0].prevout.is_null()
}

/// CheckTransaction: 𝒯𝒳 → {valid, invalid}
///
/// Context-free sanity checks:
/// 1. |ins| > 0 ∧ |outs| > 0
/// 2. ∀o ∈ outs: 0 ≤ o.value ≤ MAX_MONEY, and Σ values ≤ MAX_MONEY
/// 3. No outpoint is spent twice
/// 4. Coinbase scriptSig is 2..=100 bytes; other inputs never spend null
pub fn check_transaction(tx: &Transaction) -> Result<()> {
    if tx.inputs.is_empty() || tx.outputs.is_empty() {
        return Err(HarnessError::InvalidArgument("empty inputs or outputs".to_string()));
    }

    let mut total: i64 = 0;
    for (i, output) in tx.outputs.iter().enumerate() {
        if output.value < 0 || output.value > MAX_MONEY {
            return Err(HarnessError::InvalidArgument(format!(
                "invalid output value {} at index {}",
                output.value, i
            )));
        }
        total += output.value;
        if total > MAX_MONEY {
            return Err(HarnessError::InvalidArgument("total output value out of range".to_string()));
        }
    }

    let mut seen = HashSet::new();
    for input in &tx.inputs {
        if !seen.insert(input.prevout) {
            return Err(HarnessError::InvalidArgument("duplicate input".to_string()));
        }
    }

    if tx.is_coinbase() {
        let len = tx.inputs[0].script_sig.len();
        if !(2..=100).contains(&len) {
            return Err(HarnessError::InvalidArgument(format!(
                "coinbase script length {} out of range",
                len
            )));
        }
    } else if tx.inputs.iter().any(|i| i.prevout.is_null()) {
        return Err(HarnessError::InvalidArgument("null prevout in non-coinbase".to_string()));
    }

    Ok(())
}

// ============================================================================
// Signature hashing
// ============================================================================

/// Serialized preimage of the BIP143-style digest
///
/// `hash_type` is taken verbatim; callers add `SIGHASH_FORKID` for
/// Bitcoin-Cash signatures. Fails with `InvalidArgument` if `input_index`
/// is out of range.
pub fn signature_preimage(
    script_code: &[u8],
    tx: &Transaction,
    input_index: usize,
    hash_type: u32,
    amount: i64,
) -> Result<Vec<u8>> {
    let input = tx.inputs.get(input_index).ok_or_else(|| {
        HarnessError::InvalidArgument(format!(
            "input index {} out of range ({} inputs)",
            input_index,
            tx.inputs.len()
        ))
    })?;

    let anyone_can_pay = hash_type & SIGHASH_ANYONECANPAY != 0;
    let base_type = hash_type & 0x1f;

    let hash_prevouts = if anyone_can_pay {
        ZERO_HASH
    } else {
        let mut buf = Vec::with_capacity(tx.inputs.len() * 36);
        for txin in &tx.inputs {
            txin.prevout.encode_to(&mut buf);
        }
        hash256(&buf)
    };

    let hash_sequence =
        if anyone_can_pay || base_type == SIGHASH_SINGLE || base_type == SIGHASH_NONE {
            ZERO_HASH
        } else {
            let mut buf = Vec::with_capacity(tx.inputs.len() * 4);
            for txin in &tx.inputs {
                buf.extend_from_slice(&txin.sequence.to_le_bytes());
            }
            hash256(&buf)
        };

    let hash_outputs = if base_type != SIGHASH_SINGLE && base_type != SIGHASH_NONE {
        let mut buf = Vec::new();
        for txout in &tx.outputs {
            txout.encode_to(&mut buf);
        }
        hash256(&buf)
    } else if base_type == SIGHASH_SINGLE && input_index < tx.outputs.len() {
        hash256(&tx.outputs[input_index].encoded())
    } else {
        ZERO_HASH
    };

    let mut preimage = Vec::with_capacity(156 + script_code.len());
    preimage.extend_from_slice(&tx.version.to_le_bytes());
    preimage.extend_from_slice(&hash_prevouts);
    preimage.extend_from_slice(&hash_sequence);
    input.prevout.encode_to(&mut preimage);
    write_var_bytes(&mut preimage, script_code);
    preimage.extend_from_slice(&amount.to_le_bytes());
    preimage.extend_from_slice(&input.sequence.to_le_bytes());
    preimage.extend_from_slice(&hash_outputs);
    preimage.extend_from_slice(&tx.lock_time.to_le_bytes());
    preimage.extend_from_slice(&hash_type.to_le_bytes());
    Ok(preimage)
}

/// SigHashForkId: digest signed by transaction signatures (double SHA256)
pub fn signature_hash_forkid(
    script_code: &[u8],
    tx: &Transaction,
    input_index: usize,
    hash_type: u32,
    amount: i64,
) -> Result<Hash> {
    Ok(hash256(&signature_preimage(script_code, tx, input_index, hash_type, amount)?))
}

/// Single-SHA256 variant, the message form OP_CHECKDATASIG verifies against
pub fn signature_hash_forkid_single(
    script_code: &[u8],
    tx: &Transaction,
    input_index: usize,
    hash_type: u32,
    amount: i64,
) -> Result<Hash> {
    Ok(sha256(&signature_preimage(script_code, tx, input_index, hash_type, amount)?))
}

// ============================================================================
// Padding
// ============================================================================

/// Serialized size of an output carrying a script of `script_len` bytes
fn output_cost(script_len: usize) -> usize {
    8 + compact_size_len(script_len as u64) + script_len
}

/// Script length whose output costs exactly `need` bytes, or as close as
/// leaves a remainder another output can fill
fn padding_script_len(need: usize) -> usize {
    let max_cost = output_cost(MAX_PADDING_SCRIPT_SIZE);
    if need >= max_cost {
        if need > max_cost && need - max_cost < PADDING_OUTPUT_OVERHEAD {
            return MAX_PADDING_SCRIPT_SIZE - PADDING_OUTPUT_OVERHEAD;
        }
        return MAX_PADDING_SCRIPT_SIZE;
    }
    match need {
        // one-byte length prefix
        n if n <= output_cost(0xfc) => n - 9,
        // the 0xfd prefix jump leaves 262 and 263 unreachable by one output
        n if n < output_cost(0xfd) => n - 9 - PADDING_OUTPUT_OVERHEAD,
        n => n - 11,
    }
}

fn padding_script(len: usize) -> ByteString {
    let mut script = vec![0u8; len.max(1)];
    script[0] = OP_RETURN;
    script
}

/// PadTx: grow `tx` with zero-value OP_RETURN outputs to `target` bytes
///
/// Each added output carries at most `MAX_PADDING_SCRIPT_SIZE` script bytes.
/// A shortfall smaller than one output's overhead is absorbed by extending
/// a trailing OP_RETURN output; when the transaction has none, a minimal
/// padding output is added and the result overshoots `target` by less than
/// `PADDING_OUTPUT_OVERHEAD` bytes.
pub fn pad_tx(tx: &mut Transaction, target: usize) {
    loop {
        let size = tx.size();
        if size >= target {
            return;
        }
        let need = target - size;

        if need >= PADDING_OUTPUT_OVERHEAD {
            tx.outputs.push(TxOut::new(0, padding_script(padding_script_len(need))));
            continue;
        }

        match tx.outputs.last_mut() {
            Some(last)
                if last.script_pubkey.first() == Some(&OP_RETURN)
                    && last.script_pubkey.len() + need <= MAX_PADDING_SCRIPT_SIZE =>
            {
                last.script_pubkey.resize(last.script_pubkey.len() + need, 0);
            }
            _ => tx.outputs.push(TxOut::new(0, padding_script(1))),
        }
    }
}

/// Pad to the pre-upgrade-9 minimum transaction size
pub fn pad_tx_to_min_size(tx: &mut Transaction) {
    pad_tx(tx, MIN_TX_SIZE);
}

// ============================================================================
// Canonical ordering
// ============================================================================

/// Sort transactions ascending by txid, compared as 256-bit integers
pub fn sort_by_txid(txs: &mut [Transaction]) {
    let mut keyed: Vec<(Hash, Transaction)> = txs.iter().map(|tx| (tx.txid(), tx.clone())).collect();
    keyed.sort_by(|a, b| uint256_cmp(&a.0, &b.0));
    for (slot, (_, tx)) in txs.iter_mut().zip(keyed) {
        *slot = tx;
    }
}

/// True when the txids are strictly ascending
pub fn is_ctor_ordered(txs: &[Transaction]) -> bool {
    let ids: Vec<Hash> = txs.iter().map(|tx| tx.txid()).collect();
    ids.windows(2).all(|w| uint256_cmp(&w[0], &w[1]) == std::cmp::Ordering::Less)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BIP143_UNSIGNED_TX: &str = "0100000002fff7f7881a8099afa6940d42d1e7f6362bec38171ea3edf433541db4e4ad969f0000000000eeffffffef51e1b804cc89d182d279655c3aa89e815b1b309fe287d9b2b55d57b90ec68a0100000000ffffffff02202cb206000000001976a9148280b37df378db99f66f85c95a783a76ac7a6d5988ac9093510d000000001976a9143bde42dbee7e4dbe6a21b2d50ce2f0167faa815988ac11000000";

    fn spend(n: u8) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn::new(OutPoint::new([n; 32], 0), vec![0x51])],
            outputs: vec![TxOut::new(1000, vec![0x51])],
            lock_time: 0,
        }
    }

    #[test]
    fn test_bip143_native_p2wpkh_digest() {
        let tx = Transaction::from_hex(BIP143_UNSIGNED_TX).unwrap();
        let script_code = hex::decode("76a9141d0f172a0ecb48aee1be1f2687d2963ae33f71a188ac").unwrap();
        let digest = signature_hash_forkid(&script_code, &tx, 1, SIGHASH_ALL, 600_000_000).unwrap();
        assert_eq!(
            hex::encode(digest),
            "c37af31116d1b27caf68aae9e3ac82f1477929014d5b917657d0eb49478cb670"
        );
    }

    #[test]
    fn test_tx_hex_roundtrip_is_byte_exact() {
        let tx = Transaction::from_hex(BIP143_UNSIGNED_TX).unwrap();
        assert_eq!(tx.inputs.len(), 2);
        assert_eq!(tx.outputs.len(), 2);
        assert_eq!(tx.lock_time, 0x11);
        assert_eq!(tx.to_hex(), BIP143_UNSIGNED_TX);
    }

    #[test]
    fn test_forkid_changes_digest() {
        let tx = spend(1);
        let plain = signature_hash_forkid(&[0x51], &tx, 0, SIGHASH_ALL, 1000).unwrap();
        let forkid = signature_hash_forkid(&[0x51], &tx, 0, SIGHASH_ALL | SIGHASH_FORKID, 1000).unwrap();
        assert_ne!(plain, forkid);
    }

    #[test]
    fn test_single_variant_is_one_sha_pass() {
        let tx = spend(2);
        let ht = SIGHASH_ALL | SIGHASH_FORKID;
        let single = signature_hash_forkid_single(&[0x51], &tx, 0, ht, 5).unwrap();
        let double = signature_hash_forkid(&[0x51], &tx, 0, ht, 5).unwrap();
        assert_eq!(sha256(&single), double);
    }

    #[test]
    fn test_sighash_single_without_matching_output_uses_zero_hash() {
        let mut tx = spend(3);
        tx.inputs.push(TxIn::new(OutPoint::new([4; 32], 1), vec![]));
        let preimage =
            signature_preimage(&[], &tx, 1, SIGHASH_SINGLE | SIGHASH_FORKID, 0).unwrap();
        // version(4) + prevouts(32) + sequences(32) + outpoint(36) + script(1) + amount(8) + seq(4)
        let outputs_at = 4 + 32 + 32 + 36 + 1 + 8 + 4;
        assert_eq!(&preimage[outputs_at..outputs_at + 32], &ZERO_HASH);
        assert_eq!(&preimage[36..68], &ZERO_HASH);
    }

    #[test]
    fn test_anyonecanpay_zeroes_prevouts() {
        let tx = spend(5);
        let preimage = signature_preimage(
            &[],
            &tx,
            0,
            SIGHASH_ALL | SIGHASH_FORKID | SIGHASH_ANYONECANPAY,
            0,
        )
        .unwrap();
        assert_eq!(&preimage[4..36], &ZERO_HASH);
    }

    #[test]
    fn test_sighash_input_out_of_range() {
        let tx = spend(6);
        assert!(matches!(
            signature_hash_forkid(&[], &tx, 3, SIGHASH_ALL, 0),
            Err(HarnessError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_pad_tx_reaches_exact_targets() {
        // base transaction is 62 bytes; 324 and 325 land in the prefix gap
        for target in [72usize, 99, 100, 120, 300, 324, 325, 326, 361, 1000, 10_077, 12_000, 25_000] {
            let mut tx = spend(7);
            pad_tx(&mut tx, target);
            assert_eq!(tx.size(), target, "target {}", target);
            for out in &tx.outputs[1..] {
                assert_eq!(out.script_pubkey[0], OP_RETURN);
                assert!(out.script_pubkey.len() <= MAX_PADDING_SCRIPT_SIZE);
                assert_eq!(out.value, 0);
            }
        }
    }

    #[test]
    fn test_pad_tx_small_shortfall_extends_trailing_op_return() {
        let mut tx = spend(8);
        tx.outputs.push(TxOut::new(0, vec![OP_RETURN]));
        let size = tx.size();
        pad_tx(&mut tx, size + 3);
        assert_eq!(tx.size(), size + 3);
        assert_eq!(tx.outputs.len(), 2);
        assert_eq!(tx.outputs[1].script_pubkey.len(), 4);
    }

    #[test]
    fn test_pad_tx_small_shortfall_without_op_return_overshoots_minimally() {
        let mut tx = spend(9);
        let size = tx.size();
        pad_tx(&mut tx, size + 3);
        assert!(tx.size() >= size + 3);
        assert!(tx.size() < size + 3 + PADDING_OUTPUT_OVERHEAD);
    }

    #[test]
    fn test_pad_tx_noop_when_large_enough() {
        let mut tx = spend(10);
        let before = tx.clone();
        pad_tx(&mut tx, 10);
        assert_eq!(tx, before);
    }

    #[test]
    fn test_sort_by_txid_is_ctor_ordered() {
        let mut txs: Vec<Transaction> = (0..12).map(spend).collect();
        sort_by_txid(&mut txs);
        assert!(is_ctor_ordered(&txs));
        assert_eq!(txs.len(), 12);
    }

    #[test]
    fn test_check_transaction_rejects_duplicate_inputs() {
        let mut tx = spend(11);
        tx.inputs.push(tx.inputs[0].clone());
        assert!(check_transaction(&tx).is_err());
    }

    #[test]
    fn test_check_transaction_coinbase_script_bounds() {
        let mut tx = Transaction {
            inputs: vec![TxIn::new(OutPoint::null(), vec![0x01])],
            outputs: vec![TxOut::new(50, vec![])],
            ..Default::default()
        };
        assert!(tx.is_coinbase());
        assert!(check_transaction(&tx).is_err());
        tx.inputs[0].script_sig = vec![0x01, 0x01];
        assert!(tx.check().is_ok());
    }

    #[test]
    fn test_check_transaction_rejects_overflowing_total() {
        let mut tx = spend(12);
        tx.outputs = vec![TxOut::new(MAX_MONEY, vec![]), TxOut::new(1, vec![])];
        assert!(check_transaction(&tx).is_err());
    }
}
