//! P2P peer emulator
//!
//! A [`PeerConnection`] owns one TCP socket to a node and one network thread
//! that reads frames, does the runtime's own bookkeeping (handshake, pong
//! replies, serving `getdata` from the local stores) and then hands every
//! message to the user's [`PeerHandler`]. Test threads block on the
//! connection's condition variable; all shared state sits behind the single
//! `network_lock`.

use crate::block::block_hash;
use crate::constants::*;
use crate::error::{HarnessError, Result};
use crate::hash::uint256_to_hex;
use crate::network::*;
use crate::types::*;
use crate::xversion::XVersionMessage;
use std::collections::{HashMap, HashSet};
use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

/// Most headers returned for one `getheaders`
const MAX_HEADERS_RESULTS: usize = 2000;

/// Poll interval of the network thread's blocking read
const READ_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Handshaking,
    Connected,
    Closed,
}

/// Which side ended the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// `close`, a handshake timeout or a protocol violation on our side
    Local,
    /// The node shut the socket
    Remote,
    /// A malformed frame or a socket error
    Failure,
}

/// Everything the network thread records about the remote node
#[derive(Debug)]
pub struct PeerState {
    pub state: ConnectionState,
    pub peer_version: Option<VersionMessage>,
    pub verack_received: bool,
    pub peer_xversion: Option<XVersionMessage>,
    pub xverack_received: bool,
    /// Most recent message of each command
    pub last_message: HashMap<String, NetworkMessage>,
    pub message_count: HashMap<String, u64>,
    /// Blocks served to the node, by hash
    pub block_store: HashMap<Hash, Block>,
    /// Transactions served to the node, by txid
    pub tx_store: HashMap<Hash, Transaction>,
    /// Tip of the chain we most recently submitted
    pub last_block_hash: Option<Hash>,
    /// Hash of the last block or compact block the node sent us
    pub last_received_block: Option<Hash>,
    pub blocks_received: HashSet<Hash>,
    pub getdata_requests: HashSet<Hash>,
    pub inv_received: Vec<InvItem>,
    pub rejects: Vec<RejectMessage>,
    pub pongs: HashSet<u64>,
    pub close_reason: Option<String>,
    pub close_cause: Option<CloseCause>,
}

impl PeerState {
    fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
            peer_version: None,
            verack_received: false,
            peer_xversion: None,
            xverack_received: false,
            last_message: HashMap::new(),
            message_count: HashMap::new(),
            block_store: HashMap::new(),
            tx_store: HashMap::new(),
            last_block_hash: None,
            last_received_block: None,
            blocks_received: HashSet::new(),
            getdata_requests: HashSet::new(),
            inv_received: Vec::new(),
            rejects: Vec::new(),
            pongs: HashSet::new(),
            close_reason: None,
            close_cause: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    pub fn closed_by_remote(&self) -> bool {
        self.close_cause == Some(CloseCause::Remote)
    }

    /// Headers from our block store answering a locator, oldest first
    fn headers_for_locator(&self, locator: &[Hash], hash_stop: &Hash) -> Vec<BlockHeader> {
        let mut headers = Vec::new();
        let mut cursor = self.last_block_hash;
        while let Some(hash) = cursor {
            if locator.contains(&hash) {
                break;
            }
            let Some(block) = self.block_store.get(&hash) else { break };
            headers.push(block.header.clone());
            cursor = Some(block.header.prev_block_hash);
        }
        headers.reverse();
        if *hash_stop != ZERO_HASH {
            if let Some(pos) = headers.iter().position(|h| block_hash(h) == *hash_stop) {
                headers.truncate(pos + 1);
            }
        }
        headers.truncate(MAX_HEADERS_RESULTS);
        headers
    }
}

/// Connection parameters advertised to the node
#[derive(Debug, Clone)]
pub struct PeerOptions {
    pub magic: [u8; 4],
    pub services: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
    /// Send `xversion` right after `version`
    pub send_xversion: bool,
    pub xversion: XVersionMessage,
    pub connect_timeout: Duration,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            magic: REGTEST_MAGIC,
            services: NODE_NETWORK | NODE_BITCOIN_CASH,
            user_agent: MY_SUBVERSION.to_string(),
            start_height: -1,
            relay: true,
            send_xversion: false,
            xversion: XVersionMessage::new(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Per-command callbacks, invoked on the network thread after bookkeeping
#[allow(unused_variables)]
pub trait PeerHandler: Send {
    fn on_open(&mut self, peer: &PeerHandle) {}
    fn on_close(&mut self, peer: &PeerHandle) {}

    fn on_version(&mut self, peer: &PeerHandle, msg: &VersionMessage) {}
    fn on_verack(&mut self, peer: &PeerHandle) {}
    fn on_xversion(&mut self, peer: &PeerHandle, msg: &XVersionMessage) {}
    fn on_xverack(&mut self, peer: &PeerHandle) {}
    fn on_xupdate(&mut self, peer: &PeerHandle, msg: &XVersionMessage) {}
    fn on_addr(&mut self, peer: &PeerHandle, msg: &AddrMessage) {}
    fn on_inv(&mut self, peer: &PeerHandle, items: &[InvItem]) {}
    fn on_getdata(&mut self, peer: &PeerHandle, items: &[InvItem]) {}
    fn on_notfound(&mut self, peer: &PeerHandle, items: &[InvItem]) {}
    fn on_getblocks(&mut self, peer: &PeerHandle, msg: &GetBlocksMessage) {}
    fn on_getheaders(&mut self, peer: &PeerHandle, msg: &GetHeadersMessage) {}
    fn on_tx(&mut self, peer: &PeerHandle, tx: &Transaction) {}
    fn on_block(&mut self, peer: &PeerHandle, block: &Block) {}
    fn on_headers(&mut self, peer: &PeerHandle, headers: &[BlockHeader]) {}
    fn on_sendheaders(&mut self, peer: &PeerHandle) {}
    fn on_mempool(&mut self, peer: &PeerHandle) {}
    fn on_getaddr(&mut self, peer: &PeerHandle) {}
    fn on_ping(&mut self, peer: &PeerHandle, nonce: u64) {}
    fn on_pong(&mut self, peer: &PeerHandle, nonce: u64) {}
    fn on_reject(&mut self, peer: &PeerHandle, msg: &RejectMessage) {}
    fn on_sendcmpct(&mut self, peer: &PeerHandle, msg: &SendCmpctMessage) {}
    fn on_cmpctblock(&mut self, peer: &PeerHandle, msg: &crate::compact::HeaderAndShortIds) {}
    fn on_getblocktxn(&mut self, peer: &PeerHandle, msg: &crate::compact::BlockTransactionsRequest) {}
    fn on_blocktxn(&mut self, peer: &PeerHandle, msg: &crate::compact::BlockTransactions) {}
    fn on_feefilter(&mut self, peer: &PeerHandle, feerate: u64) {}
    fn on_alert(&mut self, peer: &PeerHandle, msg: &AlertMessage) {}
    fn on_unknown(&mut self, peer: &PeerHandle, command: &str, payload: &[u8]) {}
}

/// Handler that relies on the built-in bookkeeping only
#[derive(Debug, Default)]
pub struct NoopHandler;

impl PeerHandler for NoopHandler {}

/// Route `msg` to the matching `on_*` callback
pub fn dispatch(handler: &mut dyn PeerHandler, peer: &PeerHandle, msg: &NetworkMessage) {
    match msg {
        NetworkMessage::Version(m) => handler.on_version(peer, m),
        NetworkMessage::VerAck => handler.on_verack(peer),
        NetworkMessage::XVersion(m) => handler.on_xversion(peer, m),
        NetworkMessage::XVerAck => handler.on_xverack(peer),
        NetworkMessage::XUpdate(m) => handler.on_xupdate(peer, m),
        NetworkMessage::Addr(m) => handler.on_addr(peer, m),
        NetworkMessage::Inv(items) => handler.on_inv(peer, items),
        NetworkMessage::GetData(items) => handler.on_getdata(peer, items),
        NetworkMessage::NotFound(items) => handler.on_notfound(peer, items),
        NetworkMessage::GetBlocks(m) => handler.on_getblocks(peer, m),
        NetworkMessage::GetHeaders(m) => handler.on_getheaders(peer, m),
        NetworkMessage::Tx(tx) => handler.on_tx(peer, tx),
        NetworkMessage::Block(block) => handler.on_block(peer, block),
        NetworkMessage::Headers(headers) => handler.on_headers(peer, headers),
        NetworkMessage::SendHeaders => handler.on_sendheaders(peer),
        NetworkMessage::MemPool => handler.on_mempool(peer),
        NetworkMessage::GetAddr => handler.on_getaddr(peer),
        NetworkMessage::Ping(nonce) => handler.on_ping(peer, *nonce),
        NetworkMessage::Pong(nonce) => handler.on_pong(peer, *nonce),
        NetworkMessage::Reject(m) => handler.on_reject(peer, m),
        NetworkMessage::SendCmpct(m) => handler.on_sendcmpct(peer, m),
        NetworkMessage::CmpctBlock(m) => handler.on_cmpctblock(peer, m),
        NetworkMessage::GetBlockTxn(m) => handler.on_getblocktxn(peer, m),
        NetworkMessage::BlockTxn(m) => handler.on_blocktxn(peer, m),
        NetworkMessage::FeeFilter(rate) => handler.on_feefilter(peer, *rate),
        NetworkMessage::Alert(m) => handler.on_alert(peer, m),
        NetworkMessage::Unknown { command, payload } => handler.on_unknown(peer, command, payload),
    }
}

/// Node-side view the submit-and-test helpers poll for acceptance
pub trait ChainView {
    fn best_block_hash(&self) -> Result<Hash>;
    fn mempool_txids(&self) -> Result<HashSet<Hash>>;
    /// Whether the node's ban list covers `ip`
    fn is_banned(&self, ip: IpAddr) -> Result<bool>;
}

struct Shared {
    magic: [u8; 4],
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    writer: Mutex<TcpStream>,
    network_lock: Mutex<PeerState>,
    changed: Condvar,
    closing: AtomicBool,
}

/// Cloneable handle for sending and closing from any thread, including
/// from inside callbacks
#[derive(Clone)]
pub struct PeerHandle {
    shared: Arc<Shared>,
}

impl PeerHandle {
    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    /// Our end of the socket, the address the node sees
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn lock(&self) -> MutexGuard<'_, PeerState> {
        // state stays consistent even if a callback panicked mid-update
        self.shared.network_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Frame and write one message
    pub fn send(&self, msg: &NetworkMessage) -> Result<()> {
        if self.lock().is_closed() {
            return Err(HarnessError::Disconnected(format!(
                "cannot send {} to {}",
                msg.command(),
                self.shared.peer_addr
            )));
        }
        let frame = encode_frame(self.shared.magic, msg)?;
        debug!(peer = %self.shared.peer_addr, command = msg.command(), bytes = frame.len(), "send");
        let mut writer = self.shared.writer.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writer.write_all(&frame) {
            drop(writer);
            let cause = if is_reset(e.kind()) { CloseCause::Remote } else { CloseCause::Failure };
            self.close_with(format!("write failed: {}", e), cause);
            return Err(HarnessError::Disconnected(e.to_string()));
        }
        Ok(())
    }

    /// Mark the connection closed and wake every waiter; idempotent
    pub fn close(&self) {
        self.close_with("closed locally".to_string(), CloseCause::Local);
    }

    fn close_with(&self, reason: String, cause: CloseCause) {
        {
            let mut state = self.lock();
            if state.is_closed() {
                return;
            }
            info!(peer = %self.shared.peer_addr, %reason, ?cause, "peer connection closed");
            state.state = ConnectionState::Closed;
            state.close_reason = Some(reason);
            state.close_cause = Some(cause);
        }
        self.shared.closing.store(true, Ordering::SeqCst);
        if let Ok(writer) = self.shared.writer.lock() {
            let _ = writer.shutdown(Shutdown::Both);
        }
        self.shared.changed.notify_all();
    }

    /// Block until `pred` yields a value, the timeout passes, or the
    /// connection closes
    pub fn wait_until<T>(
        &self,
        timeout: Duration,
        what: &str,
        mut pred: impl FnMut(&PeerState) -> Option<T>,
    ) -> Result<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(value) = pred(&state) {
                return Ok(value);
            }
            if state.is_closed() {
                return Err(HarnessError::Disconnected(format!(
                    "{} while waiting for {}",
                    state.close_reason.as_deref().unwrap_or("connection closed"),
                    what
                )));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(HarnessError::Timeout(format!(
                    "{} after {:?} waiting for {}",
                    self.shared.peer_addr, timeout, what
                )));
            }
            state = self
                .shared
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    fn wait_closed(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while !state.is_closed() {
            let now = Instant::now();
            if now >= deadline {
                return Err(HarnessError::Timeout(format!(
                    "{} still connected after {:?}",
                    self.shared.peer_addr, timeout
                )));
            }
            state = self
                .shared
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        Ok(())
    }
}

/// Options for [`PeerConnection::send_blocks_and_test`] and
/// [`PeerConnection::send_txs_and_test`]
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    pub success: bool,
    pub reject_reason: Option<String>,
    pub expect_ban: bool,
    pub expect_disconnect: bool,
    /// Wait for the node to `getdata` the last block before checking
    pub request_block: bool,
    /// Push `block` messages directly instead of announcing headers
    pub force_send: bool,
    /// Unset means the helper's own default: [`SEND_BLOCKS_TIMEOUT`] for
    /// blocks, [`SEND_TXNS_TIMEOUT`] for transactions
    pub timeout: Option<Duration>,
}

impl SubmitOptions {
    pub fn accept() -> Self {
        Self {
            success: true,
            reject_reason: None,
            expect_ban: false,
            expect_disconnect: false,
            request_block: true,
            force_send: false,
            timeout: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self { success: false, reject_reason: Some(reason.into()), ..Self::accept() }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn expect_disconnect(mut self) -> Self {
        self.expect_disconnect = true;
        self
    }

    pub fn expect_ban(mut self) -> Self {
        self.expect_ban = true;
        self
    }

    pub fn force_send(mut self) -> Self {
        self.force_send = true;
        self
    }

    pub fn no_request(mut self) -> Self {
        self.request_block = false;
        self
    }

    pub fn block_timeout(&self) -> Duration {
        self.timeout.unwrap_or(SEND_BLOCKS_TIMEOUT)
    }

    pub fn tx_timeout(&self) -> Duration {
        self.timeout.unwrap_or(SEND_TXNS_TIMEOUT)
    }
}

/// A live connection to one node
pub struct PeerConnection {
    handle: PeerHandle,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl PeerConnection {
    /// Connect with the built-in bookkeeping only
    pub fn connect(host: &str, port: u16, options: PeerOptions) -> Result<Self> {
        Self::connect_with_handler(host, port, options, Box::new(NoopHandler))
    }

    /// Open the socket, send `version` (and `xversion` when enabled) and
    /// start the network thread. The handshake completes in the
    /// background; see [`wait_for_verack`](Self::wait_for_verack).
    pub fn connect_with_handler(
        host: &str,
        port: u16,
        options: PeerOptions,
        handler: Box<dyn PeerHandler>,
    ) -> Result<Self> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| HarnessError::InvalidArgument(format!("cannot resolve {}:{}", host, port)))?;

        let mut state = PeerState::new();
        state.state = ConnectionState::Connecting;
        debug!(peer = %addr, "connecting");
        let stream = TcpStream::connect_timeout(&addr, options.connect_timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(READ_POLL))?;
        let reader = stream.try_clone()?;
        let local = stream.local_addr()?;
        state.state = ConnectionState::Handshaking;

        let shared = Arc::new(Shared {
            magic: options.magic,
            peer_addr: addr,
            local_addr: local,
            writer: Mutex::new(stream),
            network_lock: Mutex::new(state),
            changed: Condvar::new(),
            closing: AtomicBool::new(false),
        });
        let handle = PeerHandle { shared };

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        let version = VersionMessage {
            services: options.services,
            timestamp,
            addr_recv: NetworkAddress::new(addr, NODE_NETWORK),
            addr_from: NetworkAddress::new(local, options.services),
            nonce: rand::random(),
            user_agent: options.user_agent.clone(),
            start_height: options.start_height,
            relay: options.relay,
            ..Default::default()
        };
        handle.send(&NetworkMessage::Version(version))?;
        if options.send_xversion {
            handle.send(&NetworkMessage::XVersion(options.xversion.clone()))?;
        }

        let thread_handle = handle.clone();
        let thread = thread::Builder::new()
            .name(format!("peer-{}", addr))
            .spawn(move || network_loop(thread_handle, reader, handler))?;

        info!(peer = %addr, xversion = options.send_xversion, "peer connection opened");
        Ok(Self { handle, thread: Mutex::new(Some(thread)) })
    }

    pub fn handle(&self) -> PeerHandle {
        self.handle.clone()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.handle.peer_addr()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }

    /// Hold `network_lock` and read the recorded state
    pub fn state(&self) -> MutexGuard<'_, PeerState> {
        self.handle.lock()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.handle.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn send(&self, msg: &NetworkMessage) -> Result<()> {
        self.handle.send(msg)
    }

    /// Send `msg` then ping, returning once the matching pong arrives
    pub fn send_and_ping(&self, msg: &NetworkMessage) -> Result<()> {
        self.send(msg)?;
        self.sync_with_ping(MESSAGE_TIMEOUT)
    }

    /// Round-trip a fresh ping so every earlier message has been processed
    pub fn sync_with_ping(&self, timeout: Duration) -> Result<()> {
        let nonce: u64 = rand::random();
        self.send(&NetworkMessage::Ping(nonce))?;
        self.handle.wait_until(timeout, &format!("pong {:#x}", nonce), |s| {
            s.pongs.contains(&nonce).then_some(())
        })
    }

    /// Handshake wait; a timeout closes the connection
    pub fn wait_for_verack(&self) -> Result<()> {
        self.wait_for_verack_within(HANDSHAKE_TIMEOUT)
    }

    pub fn wait_for_verack_within(&self, timeout: Duration) -> Result<()> {
        let result = self.handle.wait_until(timeout, "verack", |s| {
            (s.state == ConnectionState::Connected).then_some(())
        });
        if matches!(result, Err(HarnessError::Timeout(_))) {
            self.handle.close_with("handshake timed out".to_string(), CloseCause::Local);
        }
        result
    }

    pub fn wait_for_xverack(&self) -> Result<()> {
        self.handle
            .wait_until(HANDSHAKE_TIMEOUT, "xverack", |s| s.xverack_received.then_some(()))
    }

    /// Wait for the next message of `command` and return it
    pub fn wait_for_message(&self, command: &str, timeout: Duration) -> Result<NetworkMessage> {
        let seen = self.message_count(command);
        self.handle.wait_until(timeout, command, |s| {
            if s.message_count.get(command).copied().unwrap_or(0) > seen {
                s.last_message.get(command).cloned()
            } else {
                None
            }
        })
    }

    pub fn message_count(&self, command: &str) -> u64 {
        self.handle.lock().message_count.get(command).copied().unwrap_or(0)
    }

    pub fn last_message(&self, command: &str) -> Option<NetworkMessage> {
        self.handle.lock().last_message.get(command).cloned()
    }

    pub fn wait_for_getdata(&self, hash: &Hash, timeout: Duration) -> Result<()> {
        self.handle.wait_until(timeout, &format!("getdata {}", uint256_to_hex(hash)), |s| {
            s.getdata_requests.contains(hash).then_some(())
        })
    }

    pub fn wait_for_block(&self, hash: &Hash, timeout: Duration) -> Result<()> {
        self.handle.wait_until(timeout, &format!("block {}", uint256_to_hex(hash)), |s| {
            s.blocks_received.contains(hash).then_some(())
        })
    }

    pub fn wait_for_inv(&self, hash: &Hash, timeout: Duration) -> Result<InvItem> {
        self.handle.wait_until(timeout, &format!("inv {}", uint256_to_hex(hash)), |s| {
            s.inv_received.iter().find(|i| i.hash == *hash).copied()
        })
    }

    /// Wait for a reject whose reason contains `reason`; one recorded
    /// before the node dropped us still counts
    pub fn wait_for_reject(&self, reason: &str, timeout: Duration) -> Result<RejectMessage> {
        let result = self.handle.wait_until(timeout, &format!("reject \"{}\"", reason), |s| {
            s.rejects.iter().find(|r| r.reason.contains(reason)).cloned()
        });
        if matches!(result, Err(HarnessError::Timeout(_)) | Err(HarnessError::Disconnected(_))) {
            let seen: Vec<String> = self.handle.lock().rejects.iter().map(|r| r.reason.clone()).collect();
            return Err(HarnessError::AssertionFailed(format!(
                "expected reject reason containing \"{}\", got {:?}",
                reason, seen
            )));
        }
        result
    }

    pub fn wait_for_disconnect(&self, timeout: Duration) -> Result<()> {
        self.handle.wait_closed(timeout)
    }

    pub fn wait_for_predicate<T>(
        &self,
        timeout: Duration,
        what: &str,
        pred: impl FnMut(&PeerState) -> Option<T>,
    ) -> Result<T> {
        self.handle.wait_until(timeout, what, pred)
    }

    /// Announce `blocks` and check the node's verdict
    ///
    /// Blocks go into the store first so `getdata` can be answered. With
    /// `success` the node's tip must reach the last block; otherwise the
    /// tip must not be it, and a reject containing `reject_reason` must
    /// arrive when one is given.
    pub fn send_blocks_and_test(
        &self,
        blocks: &[Block],
        node: &dyn ChainView,
        opts: &SubmitOptions,
    ) -> Result<()> {
        let last = blocks
            .last()
            .ok_or_else(|| HarnessError::InvalidArgument("no blocks to send".into()))?;
        let last_hash = last.hash();
        {
            let mut state = self.handle.lock();
            for block in blocks {
                state.block_store.insert(block.hash(), block.clone());
            }
            state.last_block_hash = Some(last_hash);
        }
        let timeout = opts.block_timeout();

        if opts.force_send {
            for block in blocks {
                self.send(&NetworkMessage::Block(block.clone()))?;
            }
        } else {
            let headers = blocks.iter().map(|b| b.header.clone()).collect();
            self.send(&NetworkMessage::Headers(headers))?;
            if opts.request_block {
                self.wait_for_getdata(&last_hash, timeout)?;
            }
        }

        self.finish_submission(opts, node, timeout)?;

        if opts.success {
            crate::util::wait_for(
                timeout,
                &format!("tip {}", last.hash_hex()),
                || Ok((node.best_block_hash()? == last_hash).then_some(())),
            )?;
        } else {
            if let Some(reason) = &opts.reject_reason {
                self.wait_for_reject(reason, timeout)?;
            }
            if node.best_block_hash()? == last_hash {
                return Err(HarnessError::AssertionFailed(format!(
                    "block {} was accepted",
                    last.hash_hex()
                )));
            }
        }
        Ok(())
    }

    /// Send `txs` and check mempool admission; the same verdicts as
    /// [`send_blocks_and_test`](Self::send_blocks_and_test) with the shorter
    /// transaction timeout
    pub fn send_txs_and_test(
        &self,
        txs: &[Transaction],
        node: &dyn ChainView,
        opts: &SubmitOptions,
    ) -> Result<()> {
        {
            let mut state = self.handle.lock();
            for tx in txs {
                state.tx_store.insert(tx.txid(), tx.clone());
            }
        }
        let timeout = opts.tx_timeout();
        for tx in txs {
            self.send(&NetworkMessage::Tx(tx.clone()))?;
        }

        self.finish_submission(opts, node, timeout)?;

        if opts.success {
            crate::util::wait_for(timeout, "transactions in mempool", || {
                let mempool = node.mempool_txids()?;
                Ok(txs.iter().all(|tx| mempool.contains(&tx.txid())).then_some(()))
            })?;
        } else {
            if let Some(reason) = &opts.reject_reason {
                self.wait_for_reject(reason, timeout)?;
            }
            let mempool = node.mempool_txids()?;
            if let Some(tx) = txs.iter().find(|tx| mempool.contains(&tx.txid())) {
                return Err(HarnessError::AssertionFailed(format!(
                    "transaction {} entered the mempool",
                    tx.hash_hex()
                )));
            }
        }
        Ok(())
    }

    /// Either the node hangs up on us (and bans us when asked) or a ping
    /// round-trip shows it has processed everything we sent
    fn finish_submission(&self, opts: &SubmitOptions, node: &dyn ChainView, timeout: Duration) -> Result<()> {
        if !(opts.expect_disconnect || opts.expect_ban) {
            return self.sync_with_ping(timeout);
        }
        self.wait_for_disconnect(timeout)?;
        {
            let state = self.handle.lock();
            if !state.closed_by_remote() {
                return Err(HarnessError::AssertionFailed(format!(
                    "expected {} to drop us, connection ended with {:?}: {}",
                    self.peer_addr(),
                    state.close_cause,
                    state.close_reason.as_deref().unwrap_or("no reason")
                )));
            }
        }
        if opts.expect_ban {
            let ip = self.local_addr().ip();
            let banned = crate::util::wait_for(timeout, &format!("ban of {}", ip), || {
                Ok(node.is_banned(ip)?.then_some(()))
            });
            if let Err(HarnessError::Timeout(_)) = banned {
                return Err(HarnessError::AssertionFailed(format!(
                    "{} disconnected us but {} is not banned",
                    self.peer_addr(),
                    ip
                )));
            }
            banned?;
        }
        Ok(())
    }

    /// Shut the socket and join the network thread; idempotent
    pub fn close(&self) {
        self.handle.close();
        let thread = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(thread) = thread {
            if thread.thread().id() != thread::current().id() && thread.join().is_err() {
                warn!(peer = %self.peer_addr(), "network thread panicked");
            }
        }
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// Network thread
// ============================================================================

fn network_loop(peer: PeerHandle, mut stream: TcpStream, mut handler: Box<dyn PeerHandler>) {
    let magic = peer.shared.magic;
    handler.on_open(&peer);
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = vec![0u8; 64 * 1024];

    let reason = 'read: loop {
        if peer.shared.closing.load(Ordering::SeqCst) {
            break 'read None;
        }
        match stream.read(&mut chunk) {
            Ok(0) => break 'read Some(("connection closed by peer".to_string(), CloseCause::Remote)),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted) => {
                continue
            }
            Err(e) => {
                let cause = if is_reset(e.kind()) { CloseCause::Remote } else { CloseCause::Failure };
                break 'read Some((format!("read failed: {}", e), cause));
            }
        }
        loop {
            match decode_frame(magic, &buf) {
                Ok(Some((msg, used))) => {
                    buf.drain(..used);
                    if let Err(e) = process_message(&peer, handler.as_mut(), msg) {
                        let cause = match e {
                            HarnessError::Disconnected(_) => CloseCause::Remote,
                            _ => CloseCause::Local,
                        };
                        break 'read Some((e.to_string(), cause));
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!(
                        peer = %peer.peer_addr(),
                        bytes = %hex::encode(&buf[..buf.len().min(64)]),
                        "{}",
                        e
                    );
                    break 'read Some((e.to_string(), CloseCause::Failure));
                }
            }
        }
    };

    if let Some((reason, cause)) = reason {
        peer.close_with(reason, cause);
    }
    handler.on_close(&peer);
}

fn is_reset(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe)
}

fn is_data_message(msg: &NetworkMessage) -> bool {
    matches!(
        msg,
        NetworkMessage::Tx(_)
            | NetworkMessage::Block(_)
            | NetworkMessage::Headers(_)
            | NetworkMessage::Inv(_)
            | NetworkMessage::GetData(_)
            | NetworkMessage::CmpctBlock(_)
            | NetworkMessage::BlockTxn(_)
    )
}

/// Built-in bookkeeping under `network_lock`, then auto-replies, then the
/// user's callback with the lock released
fn process_message(peer: &PeerHandle, handler: &mut dyn PeerHandler, msg: NetworkMessage) -> Result<()> {
    let command = msg.command().to_string();
    debug!(peer = %peer.peer_addr(), %command, "recv");
    let mut replies = Vec::new();
    {
        let mut state = peer.lock();
        if state.state == ConnectionState::Handshaking && !state.verack_received && is_data_message(&msg) {
            return Err(HarnessError::ProtocolViolation(format!("{} before verack", command)));
        }
        *state.message_count.entry(command.clone()).or_insert(0) += 1;
        state.last_message.insert(command.clone(), msg.clone());

        match &msg {
            NetworkMessage::Version(v) => {
                state.peer_version = Some(v.clone());
                replies.push(NetworkMessage::VerAck);
            }
            NetworkMessage::VerAck => state.verack_received = true,
            NetworkMessage::XVersion(x) => {
                state.peer_xversion = Some(x.clone());
                replies.push(NetworkMessage::XVerAck);
            }
            NetworkMessage::XVerAck => state.xverack_received = true,
            NetworkMessage::XUpdate(x) => {
                let current = state.peer_xversion.get_or_insert_with(XVersionMessage::new);
                for (key, value) in &x.entries {
                    current.entries.insert(*key, value.clone());
                }
            }
            NetworkMessage::Inv(items) => state.inv_received.extend_from_slice(items),
            NetworkMessage::GetData(items) => {
                for item in items {
                    state.getdata_requests.insert(item.hash);
                    match item.kind {
                        InvKind::Block => {
                            if let Some(block) = state.block_store.get(&item.hash) {
                                replies.push(NetworkMessage::Block(block.clone()));
                            }
                        }
                        InvKind::Tx => {
                            if let Some(tx) = state.tx_store.get(&item.hash) {
                                replies.push(NetworkMessage::Tx(tx.clone()));
                            }
                        }
                        _ => {}
                    }
                }
            }
            NetworkMessage::GetHeaders(m) => {
                let headers = state.headers_for_locator(&m.locator, &m.hash_stop);
                if !headers.is_empty() {
                    replies.push(NetworkMessage::Headers(headers));
                }
            }
            NetworkMessage::Block(block) => {
                let hash = block.hash();
                state.blocks_received.insert(hash);
                state.last_received_block = Some(hash);
            }
            NetworkMessage::CmpctBlock(c) => {
                let hash = block_hash(&c.header);
                state.blocks_received.insert(hash);
                state.last_received_block = Some(hash);
            }
            NetworkMessage::Ping(nonce) => replies.push(NetworkMessage::Pong(*nonce)),
            NetworkMessage::Pong(nonce) => {
                state.pongs.insert(*nonce);
            }
            NetworkMessage::Reject(r) => {
                warn!(peer = %peer.peer_addr(), message = %r.message, code = r.code, reason = %r.reason, "reject");
                state.rejects.push(r.clone());
                if state.state == ConnectionState::Handshaking && r.message == "version" {
                    return Err(HarnessError::ProtocolViolation(format!("version rejected: {}", r.reason)));
                }
            }
            NetworkMessage::Unknown { command, .. } => {
                warn!(peer = %peer.peer_addr(), %command, "unknown command");
            }
            _ => {}
        }

        if state.state == ConnectionState::Handshaking && state.peer_version.is_some() && state.verack_received {
            state.state = ConnectionState::Connected;
            info!(peer = %peer.peer_addr(), "handshake complete");
        }
    }
    peer.shared.changed.notify_all();

    for reply in &replies {
        peer.send(reply)?;
    }
    dispatch(handler, peer, &msg);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_options_builders() {
        let opts = SubmitOptions::reject("bad-txns-undersize").expect_disconnect();
        assert!(!opts.success);
        assert!(opts.expect_disconnect);
        assert_eq!(opts.reject_reason.as_deref(), Some("bad-txns-undersize"));
        assert!(SubmitOptions::accept().request_block);
    }

    #[test]
    fn test_submit_timeouts_default_per_helper() {
        let opts = SubmitOptions::accept();
        assert_eq!(opts.tx_timeout(), SEND_TXNS_TIMEOUT);
        assert_eq!(opts.block_timeout(), SEND_BLOCKS_TIMEOUT);
        assert_eq!(SubmitOptions::reject("x").tx_timeout(), Duration::from_secs(10));

        let fixed = SubmitOptions::accept().with_timeout(Duration::from_secs(3));
        assert_eq!(fixed.tx_timeout(), Duration::from_secs(3));
        assert_eq!(fixed.block_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_closed_by_remote_only_for_remote_cause() {
        let mut state = PeerState::new();
        assert!(!state.closed_by_remote());
        state.close_cause = Some(CloseCause::Local);
        assert!(!state.closed_by_remote());
        state.close_cause = Some(CloseCause::Remote);
        assert!(state.closed_by_remote());
    }

    #[test]
    fn test_headers_for_locator_walks_store() {
        let mut state = PeerState::new();
        let mut prev = ZERO_HASH;
        let mut hashes = Vec::new();
        for nonce in 0..3u32 {
            let block = Block {
                header: BlockHeader { prev_block_hash: prev, nonce, ..Default::default() },
                transactions: vec![],
            };
            prev = block.hash();
            hashes.push(prev);
            state.block_store.insert(prev, block);
        }
        state.last_block_hash = Some(prev);

        let all = state.headers_for_locator(&[], &ZERO_HASH);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].nonce, 0);

        let after_first = state.headers_for_locator(&[hashes[0]], &ZERO_HASH);
        assert_eq!(after_first.len(), 2);
        assert_eq!(block_hash(&after_first[0]), hashes[1]);

        let stopped = state.headers_for_locator(&[], &hashes[1]);
        assert_eq!(stopped.len(), 2);
    }

    #[test]
    fn test_data_messages_classified() {
        assert!(is_data_message(&NetworkMessage::Tx(Transaction::default())));
        assert!(!is_data_message(&NetworkMessage::SendHeaders));
        assert!(!is_data_message(&NetworkMessage::Ping(1)));
    }
}
