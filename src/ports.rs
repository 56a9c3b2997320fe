//! Port allocation for test nodes
//!
//! P2P ports come from `[PORT_MIN, PORT_MIN + PORT_RANGE)`, RPC ports from
//! the range directly above it. Within a range each node gets
//! `PORT_MIN + (MAX_NODES * seed) mod (PORT_RANGE - MAX_NODES - 1) + index`,
//! so processes with different seeds rarely collide and nodes of one
//! process never do.

use crate::constants::{MAX_NODES, PORT_MIN, PORT_RANGE};
use crate::error::{HarnessError, Result};
use rand::Rng;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodePorts {
    pub p2p: u16,
    pub rpc: u16,
}

fn base_offset(seed: u32) -> u32 {
    (MAX_NODES.wrapping_mul(seed)) % (PORT_RANGE - MAX_NODES - 1)
}

fn check_index(index: usize) -> Result<u32> {
    if index >= MAX_NODES as usize {
        return Err(HarnessError::InvalidArgument(format!(
            "node index {} exceeds the {} node limit",
            index, MAX_NODES
        )));
    }
    Ok(index as u32)
}

pub fn p2p_port(seed: u32, index: usize) -> Result<u16> {
    Ok((PORT_MIN + base_offset(seed) + check_index(index)?) as u16)
}

pub fn rpc_port(seed: u32, index: usize) -> Result<u16> {
    Ok((PORT_MIN + PORT_RANGE + base_offset(seed) + check_index(index)?) as u16)
}

/// Tracks handed-out ports so random remaps never reuse one
#[derive(Debug)]
pub struct PortAllocator {
    seed: u32,
    in_use: HashSet<u16>,
}

impl PortAllocator {
    pub fn new(seed: u32) -> Self {
        Self { seed, in_use: HashSet::new() }
    }

    pub fn seed(&self) -> u32 {
        self.seed
    }

    /// Deterministic ports for node `index`
    pub fn ports_for(&mut self, index: usize) -> Result<NodePorts> {
        let ports = NodePorts { p2p: p2p_port(self.seed, index)?, rpc: rpc_port(self.seed, index)? };
        self.in_use.insert(ports.p2p);
        self.in_use.insert(ports.rpc);
        Ok(ports)
    }

    /// Fresh random ports in the same ranges, distinct from everything
    /// handed out so far; the colliding ports stay reserved
    pub fn remap(&mut self) -> NodePorts {
        let mut rng = rand::thread_rng();
        let p2p = self.pick(&mut rng, PORT_MIN);
        let rpc = self.pick(&mut rng, PORT_MIN + PORT_RANGE);
        NodePorts { p2p, rpc }
    }

    fn pick(&mut self, rng: &mut impl Rng, low: u32) -> u16 {
        loop {
            let port = rng.gen_range(low..low + PORT_RANGE) as u16;
            if self.in_use.insert(port) {
                return port;
            }
        }
    }

    pub fn release(&mut self, ports: NodePorts) {
        self.in_use.remove(&ports.p2p);
        self.in_use.remove(&ports.rpc);
    }
}
