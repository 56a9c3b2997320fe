//! # QA Harness
//!
//! Test harness for Bitcoin-Cash full nodes: forge consensus objects at the
//! byte level, talk to a node over P2P as an emulated peer, and run small
//! clusters of node processes driven over JSON-RPC.
//!
//! ## Architecture
//!
//! The crate is layered, leaves first:
//! - Wire codec and crypto kit (`codec`, `hash`, `transaction`, `block`,
//!   `script`, `key`, `schnorr`, `address`, `compact`, `network`, `xversion`)
//! - P2P peer emulator (`peer`)
//! - Node orchestrator (`config`, `ports`, `rpc`, `node`, `orchestrator`)
//!
//! ## Design Principles
//!
//! 1. **Byte Exactness**: every object serializes exactly as the node does
//! 2. **Deterministic Signing**: ECDSA and Schnorr nonces follow RFC6979
//! 3. **Exact Version Pinning**: cryptographic dependencies are pinned
//! 4. **Bounded Waits**: every blocking operation takes a timeout
//!
//! ## Usage
//!
//! ```rust
//! use qa_harness::block::{create_block, create_coinbase};
//! use qa_harness::pow::check_proof_of_work;
//!
//! let coinbase = create_coinbase(1, None, None);
//! let mut block = create_block([0u8; 32], coinbase, 1_600_000_000, vec![]);
//! block.solve().unwrap();
//! assert!(check_proof_of_work(&block.header).unwrap());
//! assert_eq!(block.compute_merkle_root(), block.header.merkle_root);
//! ```

pub mod types;
pub mod constants;
pub mod error;
pub mod codec;
pub mod hash;
pub mod pow;
pub mod transaction;
pub mod block;
pub mod script;
pub mod key;
pub mod schnorr;
pub mod address;
pub mod compact;
pub mod xversion;
pub mod network;
pub mod peer;
pub mod util;
pub mod logging;
pub mod config;
pub mod ports;
pub mod rpc;
pub mod node;
pub mod orchestrator;

// Re-export commonly used types
pub use types::*;
pub use constants::*;
pub use error::{HarnessError, Result};
pub use codec::{decode, encode, Decodable, Encodable};
pub use network::NetworkMessage;
pub use peer::{PeerConnection, PeerHandler, PeerOptions, SubmitOptions};
pub use orchestrator::Orchestrator;
pub use config::HarnessConfig;
