//! On-chain access: ABI bindings, the oracle adapter seam, and the
//! MarketCreated ingestor.
//!
//! The resolver holds one signing key. Every outbound transaction goes
//! through the adapter's single write lane so nonces never collide.

pub mod adapter;
pub mod ingestor;

use crate::models::Market;
use async_trait::async_trait;
use ethers::prelude::abigen;
use thiserror::Error;

abigen!(
    MarketFactory,
    r#"[
        event MarketCreated(address indexed market, address indexed creator, bytes32 subject, bytes32 predicate, bytes32 windowSpec, bool isProtocolMarket)
    ]"#
);

abigen!(
    ParimutuelMarket,
    r#"[
        function title() external view returns (string)
        function subjectSpec() external view returns (uint8, bytes32, address, uint8, bytes32)
        function predicateSpec() external view returns (uint8, int256, uint8)
        function windowSpec() external view returns (uint8, uint8, uint64, uint64)
        function oracleRouting() external view returns (bytes32, bytes32, uint8)
        function cutoffTime() external view returns (uint64)
        function resolveTime() external view returns (uint64)
        function resolved() external view returns (bool)
        function cancelled() external view returns (bool)
        function winningOutcome() external view returns (uint8)
    ]"#
);

abigen!(
    ResolutionOracle,
    r#"[
        function commit(address market, uint8 outcome, bytes32 dataHash) external
        function finalize(address market) external
        function pending(address market) external view returns (bool, uint8, uint64)
        function disputeWindow() external view returns (uint64)
    ]"#
);

#[derive(Debug, Error)]
pub enum ChainError {
    /// RPC timeouts, rate limits, dropped transactions. Retryable.
    #[error("transient chain error: {0}")]
    Transient(String),

    /// The contract rejected the call. Not retryable as-is; callers decide
    /// whether the revert reason means "someone already did this".
    #[error("reverted: {0}")]
    Reverted(String),
}

/// Outcome already committed to the oracle, awaiting finalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingCommit {
    pub outcome: u8,
    /// Unix seconds.
    pub commit_time: i64,
}

/// Read and write surface of the oracle + market contracts. The resolution
/// service only sees this trait; tests substitute a scripted chain.
#[async_trait]
pub trait OracleChain: Send + Sync {
    async fn market_params(&self, market: &str) -> Result<Market, ChainError>;

    async fn is_resolved(&self, market: &str) -> Result<bool, ChainError>;

    async fn pending_resolution(&self, market: &str) -> Result<Option<PendingCommit>, ChainError>;

    async fn dispute_window_secs(&self) -> Result<u64, ChainError>;

    /// Submit the committed outcome. Returns the transaction hash.
    async fn commit_resolution(
        &self,
        market: &str,
        outcome: u8,
        data_hash: [u8; 32],
    ) -> Result<String, ChainError>;

    /// Finalize after the dispute window. Returns the transaction hash.
    async fn finalize_resolution(&self, market: &str) -> Result<String, ChainError>;
}

/// Decode a null-padded bytes32 field into its string label.
pub(crate) fn bytes32_label(raw: &[u8; 32]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes32_labels_trim_padding() {
        let mut raw = [0u8; 32];
        raw[..10].copy_from_slice(b"HYPERLIQUI");
        assert_eq!(bytes32_label(&raw), "HYPERLIQUI");
        assert_eq!(bytes32_label(&[0u8; 32]), "");
    }
}
