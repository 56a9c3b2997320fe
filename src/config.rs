//! Harness and per-node configuration
//!
//! [`HarnessConfig`] is read from the environment once per test process.
//! [`NodeConfig`] renders the `bitcoin.conf` written into each node's data
//! directory.

use crate::constants::{BITCOIND_PROC_WAIT_TIMEOUT, RPC_STARTUP_TIMEOUT};
use crate::error::Result;
use crate::logging::level_from_hint;
use crate::ports::NodePorts;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the config file inside a node directory
pub const CONFIG_FILE_NAME: &str = "bitcoin.conf";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Node binary
    pub bitcoind: PathBuf,
    pub bitcoin_cli: Option<PathBuf>,
    /// Parent of the per-test temporary directories
    pub tmp_root: PathBuf,
    /// Pre-mined chain template
    pub cache_dir: PathBuf,
    pub port_seed: u32,
    /// Keep the test directory (and leave nodes running) on failure
    pub no_cleanup: bool,
    pub rpc_timeout: Duration,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    pub log_level: String,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        let tmp = std::env::temp_dir();
        Self {
            bitcoind: PathBuf::from("bitcoind"),
            bitcoin_cli: None,
            tmp_root: tmp.join("qa-harness"),
            cache_dir: tmp.join("qa-harness-cache"),
            port_seed: std::process::id(),
            no_cleanup: false,
            rpc_timeout: Duration::from_secs(60),
            start_timeout: RPC_STARTUP_TIMEOUT,
            stop_timeout: BITCOIND_PROC_WAIT_TIMEOUT,
            log_level: "info".to_string(),
        }
    }
}

impl HarnessConfig {
    /// Read `BITCOIND`, `BITCOINCLI`, `PYTHON_DEBUG` and `DROP_TO_PDB`
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// [`from_env`](Self::from_env) over an arbitrary variable source
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        config.bitcoind = match var("BITCOIND").filter(|v| !v.is_empty()) {
            Some(path) => PathBuf::from(path),
            None => find_default_binary(&source_root(), "bitcoind").unwrap_or(config.bitcoind),
        };
        config.bitcoin_cli = var("BITCOINCLI").filter(|v| !v.is_empty()).map(PathBuf::from);
        config.log_level = level_from_hint(var("PYTHON_DEBUG").as_deref()).to_string();
        config.no_cleanup = var("DROP_TO_PDB").is_some_and(|v| !v.is_empty());
        config
    }
}

/// Directory the default binary layouts are relative to
fn source_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default())
}

/// First existing binary among the usual in-tree and out-of-tree layouts
pub fn find_default_binary(root: &Path, name: &str) -> Option<PathBuf> {
    ["src", "build/src", "release/src", "debug/src"]
        .iter()
        .map(|dir| root.join(dir).join(name))
        .find(|path| path.is_file())
}

/// Contents of one node's `bitcoin.conf`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub index: usize,
    pub ports: NodePorts,
    /// Test-supplied `key=value` pairs in order
    pub extra: Vec<(String, String)>,
}

/// Prefix of the user-agent comment that lets peers identify each node
pub const UA_COMMENT_PREFIX: &str = "testnode";

/// Index of the harness node whose user agent is `subver`
pub fn node_index_from_subver(subver: &str) -> Option<usize> {
    let start = subver.find(UA_COMMENT_PREFIX)? + UA_COMMENT_PREFIX.len();
    let digits: String = subver[start..].chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

pub fn rpc_auth_pair(index: usize) -> (String, String) {
    (format!("rpcuser{}", index), format!("rpcpass{}", index))
}

impl NodeConfig {
    pub fn new(index: usize, ports: NodePorts) -> Self {
        Self { index, ports, extra: Vec::new() }
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.push((key.into(), value.into()));
        self
    }

    /// Take command-line style args: `-key=value` or a bare `-flag`
    /// (meaning `flag=1`)
    pub fn with_args<S: AsRef<str>>(mut self, args: &[S]) -> Self {
        for arg in args {
            let arg = arg.as_ref().trim_start_matches('-');
            match arg.split_once('=') {
                Some((k, v)) => self.extra.push((k.to_string(), v.to_string())),
                None => self.extra.push((arg.to_string(), "1".to_string())),
            }
        }
        self
    }

    fn defaults(&self) -> Vec<(String, String)> {
        let (user, pass) = rpc_auth_pair(self.index);
        [
            ("regtest", "1".to_string()),
            ("server", "1".to_string()),
            ("port", self.ports.p2p.to_string()),
            ("rpcport", self.ports.rpc.to_string()),
            ("rpcuser", user),
            ("rpcpassword", pass),
            ("bindallorfail", "1".to_string()),
            ("discover", "0".to_string()),
            ("listenonion", "0".to_string()),
            ("minlimitertxfee", "0".to_string()),
            ("limitfreerelay", "15".to_string()),
            ("maxlimitertxfee", "0".to_string()),
            ("usecashaddr", "1".to_string()),
            ("uacomment", format!("{}{}", UA_COMMENT_PREFIX, self.index)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    /// Defaults first, then test keys; a test key drops the default of the
    /// same name
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in self.defaults() {
            if !self.extra.iter().any(|(k, _)| *k == key) {
                out.push_str(&format!("{}={}\n", key, value));
            }
        }
        for (key, value) in &self.extra {
            out.push_str(&format!("{}={}\n", key, value));
        }
        out
    }

    /// Write `bitcoin.conf` into `datadir`, creating it if needed
    pub fn write(&self, datadir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(datadir)?;
        let path = datadir.join(CONFIG_FILE_NAME);
        fs::write(&path, self.render())?;
        Ok(path)
    }

    /// Replace the `port=` and `rpcport=` lines of an existing file
    pub fn rewrite_ports(path: &Path, ports: NodePorts) -> Result<()> {
        let text = fs::read_to_string(path)?;
        let mut out = String::with_capacity(text.len());
        for line in text.lines() {
            if line.starts_with("port=") {
                out.push_str(&format!("port={}", ports.p2p));
            } else if line.starts_with("rpcport=") {
                out.push_str(&format!("rpcport={}", ports.rpc));
            } else {
                out.push_str(line);
            }
            out.push('\n');
        }
        fs::write(path, out)?;
        Ok(())
    }
}
