//! Error types for the harness

use thiserror::Error;

/// RPC error code the node reports while it is still loading.
pub const RPC_IN_WARMUP: i64 = -28;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Disconnected: {0}")]
    Disconnected(String),

    #[error("Node {index} failed to start: {reason}")]
    NodeStartFailed { index: usize, reason: String },

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Node warming up: {0}")]
    WarmingUp(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Signing failed: {0}")]
    SigningFailed(String),

    #[error("Assertion failed: {0}")]
    AssertionFailed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    /// Build the error for a structured RPC failure, mapping the warm-up code
    /// onto its own variant so startup loops can poll on it.
    pub fn from_rpc(code: i64, message: impl Into<String>) -> Self {
        let message = message.into();
        if code == RPC_IN_WARMUP {
            HarnessError::WarmingUp(message)
        } else {
            HarnessError::Rpc { code, message }
        }
    }

    pub fn is_warming_up(&self) -> bool {
        matches!(self, HarnessError::WarmingUp(_))
    }

    /// True for errors that mean the node is not reachable at all.
    pub fn is_transport(&self) -> bool {
        matches!(self, HarnessError::Transport(_) | HarnessError::Io(_))
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        HarnessError::MalformedMessage(msg.into())
    }
}

impl From<serde_json::Error> for HarnessError {
    fn from(e: serde_json::Error) -> Self {
        HarnessError::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warmup_code_maps_to_warming_up() {
        let err = HarnessError::from_rpc(-28, "Loading block index...");
        assert!(err.is_warming_up());
    }

    #[test]
    fn test_other_rpc_codes_pass_through() {
        let err = HarnessError::from_rpc(-26, "txn-mempool-conflict");
        match err {
            HarnessError::Rpc { code, message } => {
                assert_eq!(code, -26);
                assert_eq!(message, "txn-mempool-conflict");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_display_includes_node_index() {
        let err = HarnessError::NodeStartFailed { index: 3, reason: "exited".into() };
        assert_eq!(err.to_string(), "Node 3 failed to start: exited");
    }
}
