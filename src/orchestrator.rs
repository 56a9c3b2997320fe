//! Node cluster lifecycle
//!
//! An [`Orchestrator`] owns a temporary directory with one `nodeN`
//! subdirectory per node, the port allocator and the running processes.
//! Dropping it kills whatever is still running; the directory is removed
//! only after [`Orchestrator::shutdown`] succeeds and cleanup is enabled.

use crate::config::{node_index_from_subver, HarnessConfig};
use crate::constants::*;
use crate::error::{HarnessError, Result};
use crate::node::{NodeSettings, TestNode};
use crate::ports::PortAllocator;
use crate::util::{wait_for, POLL_INTERVAL};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Base of the deterministic mock clock: 2014-01-01 plus 201 block intervals
pub const MOCKTIME_BASE: u64 = 1_388_534_400 + 201 * 10 * 60;

/// Block interval used when mining the cache
const CACHE_BLOCK_SPACING: u64 = 10 * 60;

/// Sync loops sample the peer graph every this many iterations
const CONNECTIVITY_CHECK_INTERVAL: u32 = 8;

/// Files dropped from cached data directories
const CACHE_SCRUB_FILES: [&str; 5] = ["debug.log", "db.log", "peers.dat", "banlist.dat", "fee_estimates.dat"];

fn is_bind_failure(err: &HarnessError) -> bool {
    match err {
        HarnessError::NodeStartFailed { reason, .. } => reason.to_ascii_lowercase().contains("bind"),
        _ => false,
    }
}

/// True when every node in `targets` is reachable from the first one over
/// the undirected `edges`
pub fn is_connected(edges: &HashMap<usize, HashSet<usize>>, targets: &[usize]) -> bool {
    let Some(&start) = targets.first() else { return true };
    let mut seen = HashSet::from([start]);
    let mut stack = vec![start];
    while let Some(node) = stack.pop() {
        if let Some(next) = edges.get(&node) {
            for &peer in next {
                if seen.insert(peer) {
                    stack.push(peer);
                }
            }
        }
    }
    targets.iter().all(|t| seen.contains(t))
}

pub struct Orchestrator {
    config: HarnessConfig,
    ports: PortAllocator,
    tmpdir: PathBuf,
    /// Remove `tmpdir` after a successful shutdown
    owns_tmpdir: bool,
    nodes: Vec<TestNode>,
    mocktime: u64,
    finished: bool,
}

impl Orchestrator {
    /// Create a fresh test directory under the configured root
    pub fn new(config: HarnessConfig) -> Result<Self> {
        fs::create_dir_all(&config.tmp_root)?;
        let name = format!("test{}_{:08x}", config.port_seed, rand::random::<u32>());
        let tmpdir = config.tmp_root.join(name);
        fs::create_dir(&tmpdir)?;
        info!(tmpdir = %tmpdir.display(), seed = config.port_seed, "orchestrator created");
        Ok(Self::with_dir(config, tmpdir, true))
    }

    fn with_dir(config: HarnessConfig, tmpdir: PathBuf, owns_tmpdir: bool) -> Self {
        let ports = PortAllocator::new(config.port_seed);
        Self { config, ports, tmpdir, owns_tmpdir, nodes: Vec::new(), mocktime: 0, finished: false }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn tmpdir(&self) -> &Path {
        &self.tmpdir
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, index: usize) -> Result<&TestNode> {
        self.nodes
            .get(index)
            .ok_or_else(|| HarnessError::InvalidArgument(format!("no node {}", index)))
    }

    pub fn node_mut(&mut self, index: usize) -> Result<&mut TestNode> {
        self.nodes
            .get_mut(index)
            .ok_or_else(|| HarnessError::InvalidArgument(format!("no node {}", index)))
    }

    pub fn nodes(&self) -> &[TestNode] {
        &self.nodes
    }

    fn settings(&self) -> NodeSettings {
        NodeSettings {
            binary: self.config.bitcoind.clone(),
            rpc_timeout: self.config.rpc_timeout,
            start_timeout: self.config.start_timeout,
            stop_timeout: self.config.stop_timeout,
        }
    }

    fn node_dir(&self, index: usize) -> PathBuf {
        self.tmpdir.join(format!("node{}", index))
    }

    // ------------------------------------------------------------------
    // Setup
    // ------------------------------------------------------------------

    /// Register `num` more nodes, writing their config files; nothing is
    /// started. `extra_args[i]` applies to the i-th new node.
    pub fn add_nodes(&mut self, num: usize, extra_args: &[Vec<String>]) -> Result<()> {
        if self.nodes.len() + num > MAX_NODES as usize {
            return Err(HarnessError::InvalidArgument(format!(
                "{} nodes requested, limit is {}",
                self.nodes.len() + num,
                MAX_NODES
            )));
        }
        for offset in 0..num {
            let index = self.nodes.len();
            let ports = self.ports.ports_for(index)?;
            let args = extra_args.get(offset).cloned().unwrap_or_default();
            let node = TestNode::new(index, self.node_dir(index), ports, self.settings(), args)?;
            self.nodes.push(node);
        }
        Ok(())
    }

    /// Use a different binary for node `index`
    pub fn set_binary(&mut self, index: usize, binary: PathBuf) -> Result<()> {
        let node = self.node(index)?;
        let mut settings = self.settings();
        settings.binary = binary;
        let (datadir, ports, args) = (node.datadir.clone(), node.ports(), node.extra_args().to_vec());
        self.nodes[index] = TestNode::new(index, datadir, ports, settings, args)?;
        Ok(())
    }

    /// `clean` starts from genesis; otherwise the cached 200-block chain is
    /// copied in (building it first if needed)
    pub fn setup_chain(&mut self, clean: bool, num_nodes: usize) -> Result<()> {
        if clean {
            self.initialize_chain_clean(num_nodes)
        } else {
            self.initialize_chain(num_nodes)
        }
    }

    pub fn initialize_chain_clean(&mut self, num_nodes: usize) -> Result<()> {
        info!(num_nodes, "initializing clean chain");
        self.add_nodes(num_nodes, &[])
    }

    /// Copy the cached chain into the first `num_nodes` node directories
    pub fn initialize_chain(&mut self, num_nodes: usize) -> Result<()> {
        if num_nodes > CACHE_NODE_COUNT {
            return Err(HarnessError::InvalidArgument(format!(
                "cache holds {} nodes, {} requested",
                CACHE_NODE_COUNT, num_nodes
            )));
        }
        self.ensure_cache()?;
        for i in 0..num_nodes {
            let index = self.nodes.len();
            copy_dir(&self.config.cache_dir.join(format!("node{}", i)), &self.node_dir(index))?;
        }
        info!(num_nodes, cache = %self.config.cache_dir.display(), "initialized chain from cache");
        self.add_nodes(num_nodes, &[])?;
        self.enable_mocktime()
    }

    fn cache_complete(&self) -> bool {
        (0..CACHE_NODE_COUNT).all(|i| self.config.cache_dir.join(format!("node{}", i)).is_dir())
    }

    /// Build the cache unless every cached node directory already exists
    ///
    /// Four nodes mine 25 blocks each in two rounds with ten-minute spacing
    /// on the mock clock, syncing after every batch.
    pub fn ensure_cache(&self) -> Result<()> {
        if self.cache_complete() {
            return Ok(());
        }
        let cache_dir = self.config.cache_dir.clone();
        if cache_dir.exists() {
            fs::remove_dir_all(&cache_dir)?;
        }
        fs::create_dir_all(&cache_dir)?;
        info!(cache = %cache_dir.display(), height = CACHE_CHAIN_HEIGHT, "building chain cache");

        let mut builder = Orchestrator::with_dir(self.config.clone(), cache_dir.clone(), false);
        let result = builder.mine_cache();
        if result.is_err() {
            builder.kill_all();
            builder.finished = true;
            let _ = fs::remove_dir_all(&cache_dir);
            return result;
        }
        builder.stop_nodes()?;
        builder.finished = true;
        for i in 0..CACHE_NODE_COUNT {
            let regtest = cache_dir.join(format!("node{}", i)).join("regtest");
            for file in CACHE_SCRUB_FILES {
                let _ = fs::remove_file(regtest.join(file));
            }
        }
        Ok(())
    }

    fn mine_cache(&mut self) -> Result<()> {
        self.add_nodes(CACHE_NODE_COUNT, &[])?;
        self.start_nodes()?;
        for i in 1..CACHE_NODE_COUNT {
            self.connect_nodes_bi(i, i - 1)?;
        }
        let per_batch = (CACHE_CHAIN_HEIGHT / (2 * CACHE_NODE_COUNT as u64)) as u32;
        let all: Vec<usize> = (0..CACHE_NODE_COUNT).collect();
        let mut block_time = MOCKTIME_BASE - CACHE_CHAIN_HEIGHT * CACHE_BLOCK_SPACING;
        for _round in 0..2 {
            for peer in 0..CACHE_NODE_COUNT {
                for _ in 0..per_batch {
                    for node in &mut self.nodes {
                        node.set_mocktime(block_time)?;
                    }
                    self.nodes[peer].rpc().generate(1)?;
                    block_time += CACHE_BLOCK_SPACING;
                }
                self.sync_blocks(&all, DEFAULT_WAIT_TIMEOUT)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start node `index`, remapping ports after a bind failure
    pub fn start_node(&mut self, index: usize) -> Result<()> {
        self.node_mut(index)?.spawn()?;
        let first = self.nodes[index].wait_for_rpc();
        self.retry_start(index, first)
    }

    fn retry_start(&mut self, index: usize, mut outcome: Result<()>) -> Result<()> {
        let mut attempt = 1;
        loop {
            match outcome {
                Ok(()) => return Ok(()),
                Err(e) if is_bind_failure(&e) && attempt < MAX_START_ATTEMPTS => {
                    let old = self.nodes[index].ports();
                    let fresh = self.ports.remap();
                    warn!(
                        node = index,
                        old_p2p = old.p2p,
                        old_rpc = old.rpc,
                        p2p_port = fresh.p2p,
                        rpc_port = fresh.rpc,
                        attempt,
                        "port collision, remapping"
                    );
                    self.nodes[index].remap_ports(fresh)?;
                    attempt += 1;
                    outcome = self.nodes[index].start();
                }
                Err(e) => {
                    error!(node = index, error = %e, "node failed to start");
                    return Err(e);
                }
            }
        }
    }

    /// Start every node not yet running: launch all, then wait for each
    ///
    /// On failure every node launched here is killed before returning.
    pub fn start_nodes(&mut self) -> Result<()> {
        let mut launched = Vec::new();
        let mut result = Ok(());
        for index in 0..self.nodes.len() {
            if self.nodes[index].is_running() {
                continue;
            }
            if let Err(e) = self.nodes[index].spawn() {
                result = Err(e);
                break;
            }
            launched.push(index);
        }
        if result.is_ok() {
            for &index in &launched {
                let first = self.nodes[index].wait_for_rpc();
                if let Err(e) = self.retry_start(index, first) {
                    result = Err(e);
                    break;
                }
            }
        }
        if result.is_err() {
            for &index in &launched {
                let _ = self.nodes[index].kill();
            }
        }
        result
    }

    pub fn stop_node(&mut self, index: usize) -> Result<()> {
        self.node_mut(index)?.stop()
    }

    /// Stop every node; each one is reaped even if an earlier stop failed
    pub fn stop_nodes(&mut self) -> Result<()> {
        let mut first_err = None;
        for node in &mut self.nodes {
            if let Err(e) = node.stop() {
                warn!(node = node.index, error = %e, "stop failed");
                let _ = node.kill();
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Stop and start node `index` on the same data directory, optionally
    /// with new args
    pub fn restart_node(&mut self, index: usize, extra_args: Option<Vec<String>>) -> Result<()> {
        self.stop_node(index)?;
        if let Some(args) = extra_args {
            self.nodes[index].set_extra_args(args)?;
        }
        self.start_node(index)
    }

    fn kill_all(&mut self) {
        for node in &mut self.nodes {
            if let Err(e) = node.kill() {
                warn!(node = node.index, error = %e, "kill failed");
            }
        }
    }

    /// Stop all nodes and, unless cleanup is disabled, remove the test
    /// directory
    pub fn shutdown(mut self) -> Result<()> {
        self.stop_nodes()?;
        self.finished = true;
        if self.owns_tmpdir && !self.config.no_cleanup {
            self.nodes.clear();
            fs::remove_dir_all(&self.tmpdir)?;
            info!(tmpdir = %self.tmpdir.display(), "cleaned up");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Clock
    // ------------------------------------------------------------------

    /// Put every node on the deterministic mock clock
    pub fn enable_mocktime(&mut self) -> Result<()> {
        self.set_mocktime(MOCKTIME_BASE)
    }

    pub fn set_mocktime(&mut self, time: u64) -> Result<()> {
        self.mocktime = time;
        for node in &mut self.nodes {
            node.set_mocktime(time)?;
        }
        Ok(())
    }

    pub fn mocktime(&self) -> u64 {
        self.mocktime
    }

    // ------------------------------------------------------------------
    // Topology
    // ------------------------------------------------------------------

    /// `a` dials `b` once and both finish the version handshake
    pub fn connect_nodes(&self, a: usize, b: usize) -> Result<()> {
        let from = self.node(a)?;
        let target = self.node(b)?.p2p_addr();
        from.rpc().add_node(&target, "onetry")?;
        wait_for(DEFAULT_WAIT_TIMEOUT, &format!("node {} to connect to node {}", a, b), || {
            let peers = from.rpc().get_peer_info()?;
            let linked = peers.iter().any(|p| p.addr == target);
            Ok((linked && peers.iter().all(|p| p.version != 0)).then_some(()))
        })
    }

    pub fn connect_nodes_bi(&self, a: usize, b: usize) -> Result<()> {
        self.connect_nodes(a, b)?;
        self.connect_nodes(b, a)
    }

    /// Complete graph over `indices`
    pub fn interconnect_nodes(&self, indices: &[usize]) -> Result<()> {
        for (i, &a) in indices.iter().enumerate() {
            for &b in &indices[i + 1..] {
                self.connect_nodes_bi(a, b)?;
            }
        }
        Ok(())
    }

    /// Drop every connection between `a` and `b`, in either direction
    pub fn disconnect_nodes(&self, a: usize, b: usize) -> Result<()> {
        let from = self.node(a)?;
        let target = self.node(b)?.p2p_addr();
        let is_b = |p: &crate::rpc::PeerInfo| p.addr == target || node_index_from_subver(&p.subver) == Some(b);
        for peer in from.rpc().get_peer_info()?.iter().filter(|p| is_b(p)) {
            from.rpc().disconnect_node(&peer.addr)?;
        }
        wait_for(DEFAULT_WAIT_TIMEOUT, &format!("node {} to drop node {}", a, b), || {
            Ok((!from.rpc().get_peer_info()?.iter().any(|p| is_b(p))).then_some(()))
        })
    }

    pub fn disconnect_all(&self, index: usize) -> Result<()> {
        let node = self.node(index)?;
        for peer in node.rpc().get_peer_info()? {
            node.rpc().disconnect_node(&peer.addr)?;
        }
        wait_for(DEFAULT_WAIT_TIMEOUT, &format!("node {} to have no peers", index), || {
            Ok(node.rpc().get_peer_info()?.is_empty().then_some(()))
        })
    }

    /// Undirected peer graph over running harness nodes
    pub fn peer_graph(&mut self) -> Result<HashMap<usize, HashSet<usize>>> {
        let mut edges: HashMap<usize, HashSet<usize>> = HashMap::new();
        for node in &mut self.nodes {
            if !node.is_running() {
                continue;
            }
            for peer in node.rpc().get_peer_info()? {
                if let Some(other) = node_index_from_subver(&peer.subver) {
                    edges.entry(node.index).or_default().insert(other);
                    edges.entry(other).or_default().insert(node.index);
                }
            }
        }
        Ok(edges)
    }

    fn check_connectivity(&mut self, indices: &[usize]) -> Result<()> {
        let graph = self.peer_graph()?;
        if !is_connected(&graph, indices) {
            return Err(HarnessError::AssertionFailed(format!(
                "nodes {:?} are partitioned, sync cannot complete (peer graph {:?})",
                indices, graph
            )));
        }
        Ok(())
    }

    fn sync_loop(
        &mut self,
        indices: &[usize],
        timeout: Duration,
        what: &str,
        mut done: impl FnMut(&[&TestNode]) -> Result<bool>,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut iteration: u32 = 0;
        loop {
            let nodes = indices.iter().map(|&i| self.node(i)).collect::<Result<Vec<_>>>()?;
            if done(&nodes)? {
                return Ok(());
            }
            iteration += 1;
            if iteration % CONNECTIVITY_CHECK_INTERVAL == 0 {
                self.check_connectivity(indices)?;
            }
            if Instant::now() >= deadline {
                return Err(HarnessError::Timeout(format!("{} (after {:?})", what, timeout)));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Wait until every node in `indices` reports the same block count
    pub fn sync_blocks(&mut self, indices: &[usize], timeout: Duration) -> Result<()> {
        let mut last = Vec::new();
        let result = self.sync_loop(indices, timeout, "block sync", |nodes| {
            last = nodes.iter().map(|n| n.rpc().get_block_count()).collect::<Result<Vec<_>>>()?;
            Ok(last.windows(2).all(|w| w[0] == w[1]))
        });
        add_context(result, || format!("heights {:?}", last))
    }

    /// Wait until every node in `indices` reaches exactly `height`
    pub fn sync_blocks_to(&mut self, height: u64, indices: &[usize], timeout: Duration) -> Result<()> {
        let mut last = Vec::new();
        let result = self.sync_loop(indices, timeout, &format!("sync to height {}", height), |nodes| {
            last = nodes.iter().map(|n| n.rpc().get_block_count()).collect::<Result<Vec<_>>>()?;
            Ok(last.iter().all(|&h| h == height))
        });
        add_context(result, || format!("heights {:?}", last))
    }

    /// Wait until every node in `indices` holds the same set of txids
    pub fn sync_mempools(&mut self, indices: &[usize], timeout: Duration) -> Result<()> {
        let mut sizes = Vec::new();
        let result = self.sync_loop(indices, timeout, "mempool sync", |nodes| {
            let pools = nodes.iter().map(|n| n.rpc().get_raw_mempool()).collect::<Result<Vec<_>>>()?;
            sizes = pools.iter().map(HashSet::len).collect();
            Ok(pools.windows(2).all(|w| w[0] == w[1]))
        });
        add_context(result, || format!("mempool sizes {:?}", sizes))
    }

    /// Every node index currently registered
    pub fn all_indices(&self) -> Vec<usize> {
        (0..self.nodes.len()).collect()
    }

    /// Run the CLI helper from `BITCOINCLI` against node `index`
    pub fn get_bitcoin_cli(&self, index: usize, args: &[&str]) -> Result<String> {
        let cli = self
            .config
            .bitcoin_cli
            .as_deref()
            .ok_or_else(|| HarnessError::InvalidArgument("BITCOINCLI is not set".into()))?;
        self.node(index)?.cli(cli, args)
    }
}

fn add_context(result: Result<()>, detail: impl FnOnce() -> String) -> Result<()> {
    match result {
        Err(HarnessError::Timeout(msg)) => Err(HarnessError::Timeout(format!("{}: {}", msg, detail()))),
        other => other,
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if self.config.no_cleanup {
            warn!(tmpdir = %self.tmpdir.display(), "test failed, leaving nodes running");
            for node in self.nodes.drain(..) {
                std::mem::forget(node);
            }
            return;
        }
        self.kill_all();
        warn!(tmpdir = %self.tmpdir.display(), "test did not finish, keeping directory");
    }
}

/// Recursive copy of a data directory
fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
