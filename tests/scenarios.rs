//! End-to-end scenarios against real node processes
//!
//! These need a node binary (`BITCOIND`, or one of the default build
//! layouts) and are ignored by default: `cargo test -- --ignored`.

use anyhow::{ensure, Context};
use qa_harness::block::{create_block, create_coinbase, create_transaction, make_conform_to_ctor};
use qa_harness::compact::{calculate_short_id, HeaderAndShortIds};
use qa_harness::hash::{uint256_from_hex, uint256_to_hex};
use qa_harness::key::{sign_tx_input, PrivateKey, SigScheme};
use qa_harness::network::SendCmpctMessage;
use qa_harness::rpc::RpcClient;
use qa_harness::script::{p2pkh_script_for_pubkey, ScriptBuilder};
use qa_harness::transaction::pad_tx;
use qa_harness::util::{assert_equal, wait_for};
use qa_harness::*;
use std::collections::HashSet;
use std::thread;
use std::time::Duration;

const SYNC_TIMEOUT: Duration = Duration::from_secs(60);

/// Fresh clean-chain cluster with every node started
fn clean_cluster(num_nodes: usize, extra_args: &[Vec<String>]) -> anyhow::Result<Orchestrator> {
    qa_harness::logging::init();
    let mut orch = Orchestrator::new(HarnessConfig::from_env())?;
    orch.add_nodes(num_nodes, extra_args)?;
    orch.start_nodes()?;
    Ok(orch)
}

fn whitelisted() -> Vec<String> {
    vec!["-whitelist=127.0.0.1".to_string()]
}

fn connect_peer(orch: &Orchestrator, index: usize) -> anyhow::Result<PeerConnection> {
    let peer = PeerConnection::connect("127.0.0.1", orch.node(index)?.ports().p2p, PeerOptions::default())?;
    peer.wait_for_verack()?;
    Ok(peer)
}

/// Solved block on the node's tip, timestamped one second after it
fn block_on_tip(rpc: &RpcClient, coinbase: Transaction, txs: Vec<Transaction>) -> anyhow::Result<Block> {
    let tip = rpc.get_best_block_hash()?;
    let header = rpc.get_block_header(&uint256_to_hex(&tip))?;
    let time = header["time"].as_u64().context("header without time")? as u32 + 1;
    let mut block = create_block(tip, coinbase, time, txs);
    make_conform_to_ctor(&mut block);
    block.solve()?;
    Ok(block)
}

/// Mine a coinbase through `peer`, then bury it under 100 node-mined blocks
fn mature_coinbase(
    rpc: &RpcClient,
    peer: &PeerConnection,
    pubkey: Option<&[u8]>,
) -> anyhow::Result<Transaction> {
    let height = rpc.get_block_count()? + 1;
    let coinbase = create_coinbase(height, pubkey, None);
    let block = block_on_tip(rpc, coinbase.clone(), vec![])?;
    peer.send_blocks_and_test(&[block], rpc, &SubmitOptions::accept())?;
    rpc.generate(100)?;
    Ok(coinbase)
}

#[test]
#[ignore = "requires BITCOIND"]
fn test_sync_blocks_over_chain_graph() -> anyhow::Result<()> {
    let mut orch = clean_cluster(4, &[])?;
    // 1 - 0 - 3 - 2
    orch.connect_nodes_bi(0, 1)?;
    orch.connect_nodes_bi(0, 3)?;
    orch.connect_nodes_bi(3, 2)?;

    orch.node(0)?.rpc().generate(10)?;
    orch.sync_blocks_to(10, &[0, 1, 2, 3], SYNC_TIMEOUT)?;
    let tips = orch
        .nodes()
        .iter()
        .map(|n| n.rpc().get_best_block_hash())
        .collect::<Result<HashSet<_>>>()?;
    assert_equal(tips.len(), 1)?;

    orch.disconnect_nodes(0, 1)?;
    orch.node(0)?.rpc().generate(5)?;
    orch.sync_blocks_to(15, &[0, 2, 3], SYNC_TIMEOUT)?;
    assert_equal(orch.node(1)?.rpc().get_block_count()?, 10)?;

    orch.connect_nodes_bi(0, 1)?;
    let all = orch.all_indices();
    orch.sync_blocks(&all, SYNC_TIMEOUT)?;
    assert_equal(orch.node(1)?.rpc().get_block_count()?, 15)?;
    orch.shutdown()?;
    Ok(())
}

#[test]
#[ignore = "requires BITCOIND"]
fn test_reject_block_with_old_timestamp() -> anyhow::Result<()> {
    let orch = clean_cluster(1, &[whitelisted()])?;
    let rpc = orch.node(0)?.rpc();
    rpc.generate(12)?;
    let tip = rpc.get_best_block_hash()?;
    let header = rpc.get_block_header(&uint256_to_hex(&tip))?;
    let mtp = header["mediantime"].as_u64().context("header without mediantime")? as u32;

    let peer = connect_peer(&orch, 0)?;
    let height = rpc.get_block_count()? + 1;
    let mut block = create_block(tip, create_coinbase(height, None, None), mtp - 1, vec![]);
    block.solve()?;
    let opts = SubmitOptions::reject("time-too-old").force_send();
    peer.send_blocks_and_test(&[block], rpc, &opts)?;
    assert_equal(rpc.get_best_block_hash()?, tip)?;

    peer.close();
    orch.shutdown()?;
    Ok(())
}

#[test]
#[ignore = "requires BITCOIND"]
fn test_compact_block_reconstruction() -> anyhow::Result<()> {
    let orch = clean_cluster(1, &[])?;
    let rpc = orch.node(0)?.rpc();
    rpc.generate(101)?;

    let peer = connect_peer(&orch, 0)?;
    peer.send_and_ping(&NetworkMessage::SendCmpct(SendCmpctMessage { announce: true, version: 1 }))?;

    let address = rpc.get_new_address()?;
    let txid_hex: String = rpc.call_as("sendtoaddress", &[address.into(), 1.into()])?;
    let txid = uint256_from_hex(&txid_hex)?;
    let mined = rpc.generate(1)?;

    let mined_hash = mined[0];
    let announcement = peer.wait_for_predicate(MESSAGE_TIMEOUT, "cmpctblock announcement", |s| {
        match s.last_message.get("cmpctblock") {
            Some(NetworkMessage::CmpctBlock(c)) if c.header.hash() == mined_hash => Some(c.clone()),
            _ => None,
        }
    })?;
    let (k0, k1) = announcement.keys();
    ensure!(
        announcement.short_ids.contains(&calculate_short_id(k0, k1, &txid)),
        "short id of {} missing from announcement",
        txid_hex
    );

    let block = reconstruct_via_getblocktxn(&peer, &announcement)?;
    assert_equal(block.compute_merkle_root(), block.header.merkle_root)?;
    assert_equal(block.hash(), rpc.get_best_block_hash()?)?;

    peer.close();
    orch.shutdown()?;
    Ok(())
}

/// Request every transaction not prefilled and assemble the block
fn reconstruct_via_getblocktxn(peer: &PeerConnection, announcement: &HeaderAndShortIds) -> anyhow::Result<Block> {
    let mut partial = announcement.reconstruct(&[])?;
    if !partial.is_complete() {
        peer.send(&NetworkMessage::GetBlockTxn(partial.request()))?;
        let block_hash = announcement.header.hash();
        let response = peer.wait_for_predicate(MESSAGE_TIMEOUT, "blocktxn", |s| {
            match s.last_message.get("blocktxn") {
                Some(NetworkMessage::BlockTxn(b)) if b.block_hash == block_hash => Some(b.clone()),
                _ => None,
            }
        })?;
        partial.fill(&response)?;
    }
    Ok(partial.into_block()?)
}

/// Spend of an anyone-can-spend coinbase to a `script_len`-byte output,
/// padded to `size` bytes when that is larger
///
/// With a one-byte output the spend serializes to 61 bytes.
fn undersize_candidate(coinbase: &Transaction, script_len: usize, size: usize) -> Transaction {
    let value = coinbase.outputs[0].value - 1000;
    let mut tx = create_transaction(coinbase, 0, vec![], value, vec![0x51; script_len]);
    pad_tx(&mut tx, size);
    tx
}

#[test]
#[ignore = "requires BITCOIND"]
fn test_min_tx_size_before_upgrade9() -> anyhow::Result<()> {
    let orch = clean_cluster(1, &[whitelisted()])?;
    let rpc = orch.node(0)?.rpc();
    rpc.generate(1)?;
    let peer = connect_peer(&orch, 0)?;
    let coinbase = mature_coinbase(rpc, &peer, None)?;
    let height = rpc.get_block_count()? + 1;

    let small = undersize_candidate(&coinbase, 1, MIN_TX_SIZE - 1);
    assert_equal(small.size(), MIN_TX_SIZE - 1)?;
    let block = block_on_tip(rpc, create_coinbase(height, None, None), vec![small])?;
    peer.send_blocks_and_test(&[block], rpc, &SubmitOptions::reject("bad-txns-undersize"))?;

    let exact = undersize_candidate(&coinbase, 1, MIN_TX_SIZE);
    let block = block_on_tip(rpc, create_coinbase(height, None, None), vec![exact])?;
    peer.send_blocks_and_test(&[block], rpc, &SubmitOptions::accept())?;

    peer.close();
    orch.shutdown()?;
    Ok(())
}

#[test]
#[ignore = "requires BITCOIND"]
fn test_min_tx_size_after_upgrade9() -> anyhow::Result<()> {
    let mut args = whitelisted();
    args.push("-upgrade9activationtime=0".to_string());
    let orch = clean_cluster(1, &[args])?;
    let rpc = orch.node(0)?.rpc();
    rpc.generate(1)?;
    let peer = connect_peer(&orch, 0)?;
    let coinbase = mature_coinbase(rpc, &peer, None)?;
    let height = rpc.get_block_count()? + 1;

    let small = undersize_candidate(&coinbase, 4, 0);
    assert_equal(small.size(), MIN_TX_SIZE_UPGRADE9 - 1)?;
    let block = block_on_tip(rpc, create_coinbase(height, None, None), vec![small])?;
    peer.send_blocks_and_test(&[block], rpc, &SubmitOptions::reject("bad-txns-undersize"))?;

    let exact = undersize_candidate(&coinbase, 5, 0);
    assert_equal(exact.size(), MIN_TX_SIZE_UPGRADE9)?;
    let block = block_on_tip(rpc, create_coinbase(height, None, None), vec![exact])?;
    peer.send_blocks_and_test(&[block], rpc, &SubmitOptions::accept())?;

    peer.close();
    orch.shutdown()?;
    Ok(())
}

/// Signed spend of a P2PK coinbase paying `amount - fee` to `recipient`
fn spend_p2pk(coinbase: &Transaction, key: &PrivateKey, recipient: &PrivateKey, fee: i64) -> Result<Transaction> {
    let funding = &coinbase.outputs[0];
    let script_pubkey = p2pkh_script_for_pubkey(&recipient.public_key());
    let mut tx = create_transaction(coinbase, 0, vec![], funding.value - fee, script_pubkey);
    let sig = sign_tx_input(
        &tx,
        0,
        &funding.script_pubkey,
        funding.value,
        key,
        SIGHASH_ALL | SIGHASH_FORKID,
        SigScheme::Schnorr,
    )?;
    tx.inputs[0].script_sig = ScriptBuilder::new().push_data(&sig).into_bytes();
    Ok(tx)
}

#[test]
#[ignore = "requires BITCOIND"]
fn test_double_spend_race() -> anyhow::Result<()> {
    let mut orch = clean_cluster(2, &[])?;
    orch.connect_nodes_bi(0, 1)?;
    orch.node(0)?.rpc().generate(1)?;
    orch.sync_blocks(&[0, 1], SYNC_TIMEOUT)?;

    let key = PrivateKey::generate();
    let peer = connect_peer(&orch, 0)?;
    let coinbase = mature_coinbase(orch.node(0)?.rpc(), &peer, Some(key.public_key().as_slice()))?;
    peer.close();
    orch.sync_blocks(&[0, 1], SYNC_TIMEOUT)?;

    let first = spend_p2pk(&coinbase, &key, &PrivateKey::generate(), 10_000)?;
    let second = spend_p2pk(&coinbase, &key, &PrivateKey::generate(), 20_000)?;
    let (rpc0, rpc1) = (orch.node(0)?.rpc(), orch.node(1)?.rpc());
    let outcomes = thread::scope(|s| {
        let a = s.spawn(|| rpc0.send_raw_transaction(&first));
        let b = s.spawn(|| rpc1.send_raw_transaction(&second));
        [a.join(), b.join()]
    });
    let accepted = outcomes.iter().filter(|o| matches!(o, Ok(Ok(_)))).count();
    ensure!(accepted >= 1, "neither spend was accepted: {:?}", outcomes);

    orch.sync_mempools(&[0, 1], SYNC_TIMEOUT)?;
    let candidates = HashSet::from([first.txid(), second.txid()]);
    for node in orch.nodes() {
        let mempool = node.rpc().get_raw_mempool()?;
        assert_equal(mempool.intersection(&candidates).count(), 1)?;
    }
    orch.shutdown()?;
    Ok(())
}

#[test]
#[ignore = "requires BITCOIND"]
fn test_restart_preserves_identity() -> anyhow::Result<()> {
    qa_harness::logging::init();
    let mut orch = Orchestrator::new(HarnessConfig::from_env())?;
    orch.setup_chain(false, 2)?;
    orch.start_nodes()?;
    orch.connect_nodes_bi(0, 1)?;
    orch.sync_blocks(&[0, 1], SYNC_TIMEOUT)?;
    let height = orch.node(1)?.rpc().get_block_count()?;
    let datadir = orch.node(1)?.datadir.clone();

    orch.stop_node(1)?;
    orch.start_node(1)?;
    assert_equal(orch.node(1)?.datadir.clone(), datadir)?;
    assert_equal(orch.node(1)?.rpc().get_block_count()?, height)?;

    orch.connect_nodes(0, 1)?;
    orch.node(0)?.rpc().generate(1)?;
    orch.sync_blocks(&[0, 1], SYNC_TIMEOUT)?;
    wait_for(SYNC_TIMEOUT, "node 1 to see the new block", || {
        Ok((orch.node(1)?.rpc().get_block_count()? == height + 1).then_some(()))
    })?;
    orch.shutdown()?;
    Ok(())
}
