//! Protocol, consensus and harness constants

use std::time::Duration;

/// Maximum money supply: 21,000,000 coins in satoshis
pub const MAX_MONEY: i64 = 21_000_000 * 100_000_000;

/// Satoshis per coin
pub const COIN: i64 = 100_000_000;

/// Minimum serialized transaction size before the 2018 upgrade-9 rules
pub const MIN_TX_SIZE: usize = 100;

/// Minimum serialized transaction size once upgrade 9 has activated
pub const MIN_TX_SIZE_UPGRADE9: usize = 65;

/// Largest script a padding output may carry
pub const MAX_PADDING_SCRIPT_SIZE: usize = 10_000;

/// Serialized bytes of an output excluding its script body
/// (8-byte value plus a one-byte script length for short scripts, rounded
/// up to leave room for a 3-byte compact size on long ones).
pub const PADDING_OUTPUT_OVERHEAD: usize = 10;

/// Size of a serialized block header
pub const BLOCK_HEADER_SIZE: usize = 80;

/// Regtest proof-of-work limit in compact form
pub const REGTEST_BITS: u32 = 0x207fffff;

/// Number of blocks that feed median-time-past
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Initial block subsidy: 50 coins
pub const INITIAL_SUBSIDY: i64 = 50 * COIN;

/// Regtest halving interval
pub const REGTEST_HALVING_INTERVAL: u64 = 150;

/// Sequence number for final transaction inputs
pub const SEQUENCE_FINAL: u32 = 0xffffffff;

// ----------------------------------------------------------------------------
// Signature hash types
// ----------------------------------------------------------------------------

pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_NONE: u32 = 0x02;
pub const SIGHASH_SINGLE: u32 = 0x03;
pub const SIGHASH_FORKID: u32 = 0x40;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

// ----------------------------------------------------------------------------
// P2P protocol
// ----------------------------------------------------------------------------

/// Protocol version advertised by the emulated peer
pub const MY_VERSION: i32 = 70014;

/// Default subversion string advertised by the emulated peer
pub const MY_SUBVERSION: &str = "/python-mininode-tester:0.0.3/";

/// Regtest network magic
pub const REGTEST_MAGIC: [u8; 4] = [0xda, 0xb5, 0xbf, 0xfa];

/// Maximum payload accepted from the node
pub const MAX_PROTOCOL_MESSAGE_LENGTH: usize = 32 * 1024 * 1024;

/// Size of a P2P frame header
pub const MESSAGE_HEADER_SIZE: usize = 24;

pub const NODE_NETWORK: u64 = 1 << 0;
pub const NODE_BLOOM: u64 = 1 << 2;
pub const NODE_XTHIN: u64 = 1 << 4;
pub const NODE_BITCOIN_CASH: u64 = 1 << 5;

// ----------------------------------------------------------------------------
// Timeouts
// ----------------------------------------------------------------------------

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
pub const MESSAGE_TIMEOUT: Duration = Duration::from_secs(60);
pub const SEND_BLOCKS_TIMEOUT: Duration = Duration::from_secs(60);
pub const SEND_TXNS_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(60);
pub const RPC_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
pub const BITCOIND_PROC_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

// ----------------------------------------------------------------------------
// Orchestrator
// ----------------------------------------------------------------------------

/// Most nodes a single test may run
pub const MAX_NODES: u32 = 8;

/// Lower bound of the port interval carved out for tests
pub const PORT_MIN: u32 = 11000;

/// Width of each of the two port ranges (P2P, RPC)
pub const PORT_RANGE: u32 = 5000;

/// Restart attempts per node after a port collision
pub const MAX_START_ATTEMPTS: u32 = 4;

/// Height of the pre-mined chain kept in the cache directory
pub const CACHE_CHAIN_HEIGHT: u64 = 200;

/// Nodes used to build the cache
pub const CACHE_NODE_COUNT: usize = 4;
