//! One node process under test

use crate::config::{rpc_auth_pair, NodeConfig, CONFIG_FILE_NAME};
use crate::error::{HarnessError, Result};
use crate::peer::ChainView;
use crate::ports::NodePorts;
use crate::rpc::RpcClient;
use crate::types::Hash;
use std::collections::HashSet;
use std::net::IpAddr;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Longest pause between readiness polls
const MAX_POLL_BACKOFF: Duration = Duration::from_secs(1);

/// Bytes of stderr quoted in start failures
const STDERR_TAIL: usize = 2000;

#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub binary: PathBuf,
    pub rpc_timeout: Duration,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
}

/// Handle to a node: its directory, ports, process and RPC client
#[derive(Debug)]
pub struct TestNode {
    pub index: usize,
    pub datadir: PathBuf,
    ports: NodePorts,
    settings: NodeSettings,
    extra_args: Vec<String>,
    process: Option<Child>,
    rpc: RpcClient,
    mocktime: u64,
}

fn rpc_client(index: usize, ports: NodePorts, timeout: Duration) -> Result<RpcClient> {
    let (user, pass) = rpc_auth_pair(index);
    RpcClient::new("127.0.0.1", ports.rpc, &user, &pass, timeout)
}

impl TestNode {
    /// Write the config file for a node that has not been started yet
    pub fn new(
        index: usize,
        datadir: PathBuf,
        ports: NodePorts,
        settings: NodeSettings,
        extra_args: Vec<String>,
    ) -> Result<Self> {
        NodeConfig::new(index, ports).with_args(&extra_args).write(&datadir)?;
        let rpc = rpc_client(index, ports, settings.rpc_timeout)?;
        Ok(Self { index, datadir, ports, settings, extra_args, process: None, rpc, mocktime: 0 })
    }

    pub fn ports(&self) -> NodePorts {
        self.ports
    }

    pub fn p2p_addr(&self) -> String {
        format!("127.0.0.1:{}", self.ports.p2p)
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    pub fn config_path(&self) -> PathBuf {
        self.datadir.join(CONFIG_FILE_NAME)
    }

    pub fn extra_args(&self) -> &[String] {
        &self.extra_args
    }

    /// Move to new ports, rewriting the config file in place
    pub fn remap_ports(&mut self, ports: NodePorts) -> Result<()> {
        NodeConfig::rewrite_ports(&self.config_path(), ports)?;
        self.rpc = rpc_client(self.index, ports, self.settings.rpc_timeout)?;
        self.ports = ports;
        Ok(())
    }

    /// Replace the test-supplied args; takes effect on the next start
    pub fn set_extra_args(&mut self, extra_args: Vec<String>) -> Result<()> {
        NodeConfig::new(self.index, self.ports).with_args(&extra_args).write(&self.datadir)?;
        self.extra_args = extra_args;
        Ok(())
    }

    pub fn is_running(&mut self) -> bool {
        match self.process.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Launch the process and block until its RPC answers
    pub fn start(&mut self) -> Result<()> {
        self.spawn()?;
        self.wait_for_rpc()
    }

    /// Launch the process without waiting for it
    pub fn spawn(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(HarnessError::InvalidArgument(format!("node {} already running", self.index)));
        }
        let stdout = File::create(self.datadir.join("stdout.log"))?;
        let stderr = File::create(self.datadir.join("stderr.log"))?;
        let child = Command::new(&self.settings.binary)
            .arg(format!("-datadir={}", self.datadir.display()))
            .arg("-keypool=1")
            .arg("-rest")
            .arg(format!("-mocktime={}", self.mocktime))
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|e| HarnessError::NodeStartFailed {
                index: self.index,
                reason: format!("cannot launch {}: {}", self.settings.binary.display(), e),
            })?;
        info!(
            node = self.index,
            pid = child.id(),
            p2p_port = self.ports.p2p,
            rpc_port = self.ports.rpc,
            "node started"
        );
        self.process = Some(child);
        Ok(())
    }

    /// Poll `getblockcount` with growing pauses until it succeeds
    ///
    /// Warm-up and connection errors are retried until the start timeout;
    /// an exited process fails immediately.
    pub fn wait_for_rpc(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.settings.start_timeout;
        let mut backoff = Duration::from_millis(50);
        loop {
            if let Some(child) = self.process.as_mut() {
                if let Some(status) = child.try_wait()? {
                    self.process = None;
                    return Err(HarnessError::NodeStartFailed {
                        index: self.index,
                        reason: format!("exited with {} during warm-up: {}", status, self.stderr_tail()),
                    });
                }
            }
            match self.rpc.get_block_count() {
                Ok(height) => {
                    debug!(node = self.index, height, "rpc ready");
                    return Ok(());
                }
                Err(e) if e.is_warming_up() || e.is_transport() => {
                    debug!(node = self.index, error = %e, "rpc not ready");
                }
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                let _ = self.kill();
                return Err(HarnessError::NodeStartFailed {
                    index: self.index,
                    reason: format!("rpc not ready after {:?}", self.settings.start_timeout),
                });
            }
            thread::sleep(backoff);
            backoff = (backoff * 2).min(MAX_POLL_BACKOFF);
        }
    }

    /// Last part of the node's stderr, for diagnostics
    pub fn stderr_tail(&self) -> String {
        let text = fs::read_to_string(self.datadir.join("stderr.log")).unwrap_or_default();
        let text = text.trim();
        let start = text.len().saturating_sub(STDERR_TAIL);
        let start = (start..text.len()).find(|&i| text.is_char_boundary(i)).unwrap_or(text.len());
        text[start..].to_string()
    }

    /// Ask the node to shut down, killing it if it outlives the stop timeout
    ///
    /// Transport errors are expected from a node already going away.
    pub fn stop(&mut self) -> Result<()> {
        if self.process.is_none() {
            return Ok(());
        }
        match self.rpc.stop() {
            Ok(()) => {}
            Err(e) if e.is_transport() => debug!(node = self.index, error = %e, "stop rpc failed"),
            Err(e) => warn!(node = self.index, error = %e, "stop rpc returned an error"),
        }
        let deadline = Instant::now() + self.settings.stop_timeout;
        while let Some(child) = self.process.as_mut() {
            if let Some(status) = child.try_wait()? {
                info!(node = self.index, %status, "node stopped");
                self.process = None;
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(node = self.index, timeout = ?self.settings.stop_timeout, "node did not exit, killing");
                return self.kill();
            }
            thread::sleep(Duration::from_millis(100));
        }
        Ok(())
    }

    /// Kill and reap the process
    pub fn kill(&mut self) -> Result<()> {
        if let Some(mut child) = self.process.take() {
            if let Err(e) = child.kill() {
                debug!(node = self.index, error = %e, "kill failed");
            }
            child.wait()?;
            info!(node = self.index, "node killed");
        }
        Ok(())
    }

    pub fn mocktime(&self) -> u64 {
        self.mocktime
    }

    /// Set the node's clock; also used for later restarts
    pub fn set_mocktime(&mut self, time: u64) -> Result<()> {
        self.mocktime = time;
        if self.is_running() {
            self.rpc.set_mocktime(time)?;
        }
        Ok(())
    }

    /// Run the CLI helper against this node and return its stdout
    pub fn cli(&self, binary: &Path, args: &[&str]) -> Result<String> {
        let output = Command::new(binary)
            .arg(format!("-datadir={}", self.datadir.display()))
            .args(args)
            .output()?;
        if !output.status.success() {
            return Err(HarnessError::Transport(format!(
                "{} exited with {}: {}",
                binary.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl ChainView for TestNode {
    fn best_block_hash(&self) -> Result<Hash> {
        self.rpc.get_best_block_hash()
    }

    fn mempool_txids(&self) -> Result<HashSet<Hash>> {
        self.rpc.get_raw_mempool()
    }

    fn is_banned(&self, ip: IpAddr) -> Result<bool> {
        self.rpc.is_banned(ip)
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        if let Err(e) = self.kill() {
            warn!(node = self.index, error = %e, "failed to reap node");
        }
    }
}
