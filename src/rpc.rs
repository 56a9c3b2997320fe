//! JSON-RPC client for a node under test
//!
//! Methods are forwarded generically through [`RpcClient::call`]; the typed
//! wrappers below cover the calls the harness itself relies on.

use crate::codec::Encodable;
use crate::error::{HarnessError, Result};
use crate::hash::uint256_from_hex;
use crate::peer::ChainView;
use crate::types::{Block, Hash, Transaction};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a [Value],
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

/// Entry of `getpeerinfo`
#[derive(Debug, Clone, Deserialize)]
pub struct PeerInfo {
    pub id: i64,
    pub addr: String,
    #[serde(default)]
    pub addrlocal: Option<String>,
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub subver: String,
    #[serde(default)]
    pub inbound: bool,
}

/// Entry of `listbanned`
#[derive(Debug, Clone, Deserialize)]
pub struct BannedSubnet {
    /// Subnet in `address/prefix` form
    pub address: String,
    #[serde(default)]
    pub banned_until: i64,
}

impl BannedSubnet {
    pub fn covers(&self, ip: IpAddr) -> bool {
        let (net, prefix) = match self.address.split_once('/') {
            Some((net, prefix)) => (net, prefix.parse::<u32>().ok()),
            None => (self.address.as_str(), None),
        };
        let Ok(net) = net.parse::<IpAddr>() else { return false };
        match (net, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let bits = prefix.unwrap_or(32).min(32);
                let mask = u32::MAX.checked_shl(32 - bits).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let bits = prefix.unwrap_or(128).min(128);
                let mask = u128::MAX.checked_shl(128 - bits).unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

pub struct RpcClient {
    url: String,
    user: String,
    password: String,
    client: reqwest::blocking::Client,
    id_counter: AtomicU64,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient").field("url", &self.url).field("user", &self.user).finish()
    }
}

/// Interpret a JSON-RPC reply body
///
/// Nodes answer errors with HTTP 500 and a JSON body, so the body decides,
/// not the status.
fn parse_response(status: u16, body: &[u8]) -> Result<Value> {
    match serde_json::from_slice::<RpcResponse>(body) {
        Ok(RpcResponse { error: Some(err), .. }) => Err(HarnessError::from_rpc(err.code, err.message)),
        Ok(RpcResponse { result, .. }) if (200..300).contains(&status) => Ok(result),
        _ => Err(HarnessError::Transport(format!(
            "HTTP {}: {}",
            status,
            String::from_utf8_lossy(body)
        ))),
    }
}

impl RpcClient {
    pub fn new(host: &str, port: u16, user: &str, password: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| HarnessError::Transport(e.to_string()))?;
        Ok(Self {
            url: format!("http://{}:{}/", host, port),
            user: user.to_string(),
            password: password.to_string(),
            client,
            id_counter: AtomicU64::new(0),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Invoke `method`; RPC failures come back as `Rpc`, or `WarmingUp`
    /// for code -28
    pub fn call(&self, method: &str, params: &[Value]) -> Result<Value> {
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst);
        let request = RpcRequest { jsonrpc: "1.0", id, method, params };
        debug!(url = %self.url, %method, id, "rpc call");
        let response = self
            .client
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&request)
            .send()
            .map_err(|e| HarnessError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response.bytes().map_err(|e| HarnessError::Transport(e.to_string()))?;
        parse_response(status, &body)
    }

    /// [`call`](Self::call) with the result deserialized into `T`
    pub fn call_as<T: for<'de> Deserialize<'de>>(&self, method: &str, params: &[Value]) -> Result<T> {
        Ok(serde_json::from_value(self.call(method, params)?)?)
    }

    pub fn get_block_count(&self) -> Result<u64> {
        self.call_as("getblockcount", &[])
    }

    pub fn get_best_block_hash(&self) -> Result<Hash> {
        let hex: String = self.call_as("getbestblockhash", &[])?;
        uint256_from_hex(&hex)
    }

    pub fn get_block_hash(&self, height: u64) -> Result<Hash> {
        let hex: String = self.call_as("getblockhash", &[json!(height)])?;
        uint256_from_hex(&hex)
    }

    pub fn get_block(&self, hash_hex: &str) -> Result<Value> {
        self.call("getblock", &[json!(hash_hex)])
    }

    pub fn get_block_header(&self, hash_hex: &str) -> Result<Value> {
        self.call("getblockheader", &[json!(hash_hex)])
    }

    pub fn get_blockchain_info(&self) -> Result<Value> {
        self.call("getblockchaininfo", &[])
    }

    pub fn get_mempool_info(&self) -> Result<Value> {
        self.call("getmempoolinfo", &[])
    }

    pub fn get_raw_mempool(&self) -> Result<HashSet<Hash>> {
        let txids: Vec<String> = self.call_as("getrawmempool", &[])?;
        txids.iter().map(|s| uint256_from_hex(s)).collect()
    }

    pub fn send_raw_transaction(&self, tx: &Transaction) -> Result<Hash> {
        let hex: String = self.call_as("sendrawtransaction", &[json!(hex::encode(tx.encoded()))])?;
        uint256_from_hex(&hex)
    }

    /// `submitblock`; `None` on acceptance, otherwise the node's reason
    pub fn submit_block(&self, block: &Block) -> Result<Option<String>> {
        let result = self.call("submitblock", &[json!(hex::encode(block.encoded()))])?;
        Ok(result.as_str().map(str::to_string))
    }

    pub fn generate(&self, blocks: u32) -> Result<Vec<Hash>> {
        let hashes: Vec<String> = self.call_as("generate", &[json!(blocks)])?;
        hashes.iter().map(|s| uint256_from_hex(s)).collect()
    }

    pub fn generate_to_address(&self, blocks: u32, address: &str) -> Result<Vec<Hash>> {
        let hashes: Vec<String> = self.call_as("generatetoaddress", &[json!(blocks), json!(address)])?;
        hashes.iter().map(|s| uint256_from_hex(s)).collect()
    }

    pub fn get_new_address(&self) -> Result<String> {
        self.call_as("getnewaddress", &[])
    }

    pub fn get_peer_info(&self) -> Result<Vec<PeerInfo>> {
        self.call_as("getpeerinfo", &[])
    }

    pub fn list_banned(&self) -> Result<Vec<BannedSubnet>> {
        self.call_as("listbanned", &[])
    }

    pub fn add_node(&self, addr: &str, command: &str) -> Result<()> {
        self.call("addnode", &[json!(addr), json!(command)]).map(|_| ())
    }

    pub fn disconnect_node(&self, addr: &str) -> Result<()> {
        self.call("disconnectnode", &[json!(addr)]).map(|_| ())
    }

    pub fn set_mocktime(&self, time: u64) -> Result<()> {
        self.call("setmocktime", &[json!(time)]).map(|_| ())
    }

    pub fn invalidate_block(&self, hash_hex: &str) -> Result<()> {
        self.call("invalidateblock", &[json!(hash_hex)]).map(|_| ())
    }

    pub fn reconsider_block(&self, hash_hex: &str) -> Result<()> {
        self.call("reconsiderblock", &[json!(hash_hex)]).map(|_| ())
    }

    pub fn stop(&self) -> Result<()> {
        self.call("stop", &[]).map(|_| ())
    }
}

impl ChainView for RpcClient {
    fn best_block_hash(&self) -> Result<Hash> {
        self.get_best_block_hash()
    }

    fn mempool_txids(&self) -> Result<HashSet<Hash>> {
        self.get_raw_mempool()
    }

    fn is_banned(&self, ip: IpAddr) -> Result<bool> {
        Ok(self.list_banned()?.iter().any(|b| b.covers(ip)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_success() {
        let body = br#"{"result":101,"error":null,"id":0}"#;
        assert_eq!(parse_response(200, body).unwrap(), json!(101));
    }

    #[test]
    fn test_parse_error_on_500() {
        let body = br#"{"result":null,"error":{"code":-5,"message":"Block not found"},"id":1}"#;
        match parse_response(500, body).unwrap_err() {
            HarnessError::Rpc { code, message } => {
                assert_eq!(code, -5);
                assert_eq!(message, "Block not found");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_warmup() {
        let body = br#"{"result":null,"error":{"code":-28,"message":"Loading block index..."},"id":1}"#;
        assert!(parse_response(500, body).unwrap_err().is_warming_up());
    }

    #[test]
    fn test_unauthorized_is_transport() {
        assert!(parse_response(401, b"").unwrap_err().is_transport());
    }

    #[test]
    fn test_peer_info_tolerates_missing_fields() {
        let peers: Vec<PeerInfo> =
            serde_json::from_str(r#"[{"id":3,"addr":"127.0.0.1:11001","version":70014,"synced_headers":5}]"#)
                .unwrap();
        assert_eq!(peers[0].version, 70014);
        assert!(!peers[0].inbound);
    }

    #[test]
    fn test_banned_subnet_covers() {
        let banned: Vec<BannedSubnet> = serde_json::from_str(
            r#"[{"address":"127.0.0.1/32","banned_until":1700000000,"ban_created":1699913600,"ban_reason":"node misbehaving"},
                {"address":"10.1.0.0/16"}]"#,
        )
        .unwrap();
        let localhost: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(banned[0].covers(localhost));
        assert!(!banned[0].covers("127.0.0.2".parse().unwrap()));
        assert!(banned[1].covers("10.1.200.7".parse().unwrap()));
        assert!(!banned[1].covers("10.2.0.1".parse().unwrap()));
        assert!(!banned[1].covers("::1".parse().unwrap()));
    }
}
