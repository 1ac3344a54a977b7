//! Ethers-backed implementation of [`OracleChain`].
//!
//! Reads go straight to the RPC. Writes estimate gas, apply the configured
//! safety multiplier, and are serialized through one write lane so the
//! resolver key's nonces stay ordered even when several jobs finish at once.

use crate::chain::{
    bytes32_label, ChainError, OracleChain, ParimutuelMarket, PendingCommit, ResolutionOracle,
};
use crate::models::{
    ExtremumKind, Market, OracleSpec, Predicate, PredicateOp, Subject, Window, WindowKind,
};
use anyhow::Context;
use async_trait::async_trait;
use ethers::contract::ContractError;
use ethers::prelude::{NonceManagerMiddleware, SignerMiddleware};
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, U256, U64};
use num_bigint::BigInt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

type RpcClient = NonceManagerMiddleware<SignerMiddleware<Provider<Http>, LocalWallet>>;

pub struct EthersChainAdapter {
    client: Arc<RpcClient>,
    oracle: ResolutionOracle<RpcClient>,
    gas_multiplier: f64,
    dispute_window_override: Option<u64>,
    /// Nonce discipline: one outbound transaction at a time.
    write_lane: Mutex<()>,
}

impl EthersChainAdapter {
    pub async fn connect(
        rpc_url: &str,
        private_key: &str,
        oracle_address: &str,
        gas_multiplier: f64,
        dispute_window_override: Option<u64>,
    ) -> anyhow::Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .context("invalid RPC_URL")?
            .interval(Duration::from_millis(2000));

        let chain_id = provider
            .get_chainid()
            .await
            .context("querying chain id")?
            .as_u64();

        let wallet: LocalWallet = private_key
            .parse::<LocalWallet>()
            .context("invalid PRIVATE_KEY")?
            .with_chain_id(chain_id);
        let signer_address = wallet.address();

        let client = Arc::new(NonceManagerMiddleware::new(
            SignerMiddleware::new(provider, wallet),
            signer_address,
        ));

        let oracle_address: Address = oracle_address
            .parse()
            .context("invalid ORACLE_ADDRESS")?;
        let oracle = ResolutionOracle::new(oracle_address, client.clone());

        info!(chain_id, resolver = %format!("{signer_address:?}"), "chain adapter connected");

        Ok(Self {
            client,
            oracle,
            gas_multiplier,
            dispute_window_override,
            write_lane: Mutex::new(()),
        })
    }

    fn parse_market(&self, market: &str) -> Result<Address, ChainError> {
        market
            .parse()
            .map_err(|_| ChainError::Reverted(format!("invalid market address {market}")))
    }

    fn market_at(&self, address: Address) -> ParimutuelMarket<RpcClient> {
        ParimutuelMarket::new(address, self.client.clone())
    }

    /// Estimated gas with the safety multiplier applied.
    fn padded_gas(&self, estimate: U256) -> U256 {
        let hundredths = (self.gas_multiplier * 100.0).round() as u64;
        estimate.saturating_mul(U256::from(hundredths)) / U256::from(100u64)
    }
}

/// Map a contract error into the transient/reverted split the pipeline
/// retries on. Estimate-gas failures carry revert reasons as provider
/// messages, so the string check catches those too.
fn classify<M: Middleware>(e: ContractError<M>) -> ChainError {
    if let Some(reason) = e.decode_revert::<String>() {
        return ChainError::Reverted(reason);
    }
    if e.as_revert().is_some() {
        return ChainError::Reverted("execution reverted".to_string());
    }
    let text = e.to_string();
    if text.to_lowercase().contains("revert") {
        ChainError::Reverted(text)
    } else {
        ChainError::Transient(text)
    }
}

#[async_trait]
impl OracleChain for EthersChainAdapter {
    async fn market_params(&self, market: &str) -> Result<Market, ChainError> {
        let address = self.parse_market(market)?;
        let contract = self.market_at(address);

        let title = contract.title().call().await.map_err(classify)?;
        let (subject_kind, metric_id, token, token_decimals, source_id) =
            contract.subject_spec().call().await.map_err(classify)?;
        let (op_raw, threshold, value_decimals) =
            contract.predicate_spec().call().await.map_err(classify)?;
        let (window_kind, extremum, t_start, t_end) =
            contract.window_spec().call().await.map_err(classify)?;
        let (primary, fallback, rounding_decimals) =
            contract.oracle_routing().call().await.map_err(classify)?;
        let cutoff_time = contract.cutoff_time().call().await.map_err(classify)?;
        let resolve_time = contract.resolve_time().call().await.map_err(classify)?;
        let resolved = contract.resolved().call().await.map_err(classify)?;
        let cancelled = contract.cancelled().call().await.map_err(classify)?;

        let winning_outcome = if resolved {
            Some(contract.winning_outcome().call().await.map_err(classify)?)
        } else {
            None
        };

        let subject = match subject_kind {
            0 => Subject::HlMetric {
                metric_id: bytes32_label(&metric_id),
            },
            1 => Subject::TokenPrice {
                token: format!("{token:?}"),
                decimals: token_decimals,
            },
            2 => Subject::Generic {
                source_id: bytes32_label(&source_id),
            },
            other => {
                return Err(ChainError::Reverted(format!(
                    "market {market} declares unknown subject kind {other}"
                )))
            }
        };

        let op = PredicateOp::from_u8(op_raw).ok_or_else(|| {
            ChainError::Reverted(format!("market {market} declares unknown predicate op {op_raw}"))
        })?;

        // I256 -> BigInt via decimal text; lossless at any magnitude.
        let threshold: BigInt = threshold
            .to_string()
            .parse()
            .map_err(|_| ChainError::Reverted("unparseable threshold".to_string()))?;

        let window = Window {
            kind: match window_kind {
                0 => WindowKind::SnapshotAt,
                1 => WindowKind::TimeAverage,
                2 => WindowKind::Extremum,
                other => {
                    return Err(ChainError::Reverted(format!(
                        "market {market} declares unknown window kind {other}"
                    )))
                }
            },
            extremum: if extremum == 1 {
                ExtremumKind::Min
            } else {
                ExtremumKind::Max
            },
            t_start: t_start as i64,
            t_end: t_end as i64,
        };

        Ok(Market {
            address: format!("{address:?}"),
            title,
            subject,
            predicate: Predicate {
                op,
                threshold,
                value_decimals,
            },
            window,
            oracle: OracleSpec {
                primary_source_id: bytes32_label(&primary),
                fallback_source_id: bytes32_label(&fallback),
                rounding_decimals,
            },
            cutoff_time: cutoff_time as i64,
            resolve_time: resolve_time as i64,
            resolved,
            cancelled,
            winning_outcome,
        })
    }

    async fn is_resolved(&self, market: &str) -> Result<bool, ChainError> {
        let address = self.parse_market(market)?;
        self.market_at(address)
            .resolved()
            .call()
            .await
            .map_err(classify)
    }

    async fn pending_resolution(&self, market: &str) -> Result<Option<PendingCommit>, ChainError> {
        let address = self.parse_market(market)?;
        let (committed, outcome, commit_time) = self
            .oracle
            .pending(address)
            .call()
            .await
            .map_err(classify)?;

        Ok(committed.then_some(PendingCommit {
            outcome,
            commit_time: commit_time as i64,
        }))
    }

    async fn dispute_window_secs(&self) -> Result<u64, ChainError> {
        if let Some(secs) = self.dispute_window_override {
            return Ok(secs);
        }
        self.oracle
            .dispute_window()
            .call()
            .await
            .map_err(classify)
    }

    async fn commit_resolution(
        &self,
        market: &str,
        outcome: u8,
        data_hash: [u8; 32],
    ) -> Result<String, ChainError> {
        let address = self.parse_market(market)?;
        let _lane = self.write_lane.lock().await;

        let call = self.oracle.commit(address, outcome, data_hash);
        let estimate = call.estimate_gas().await.map_err(classify)?;
        let gas = self.padded_gas(estimate);
        debug!(market, outcome, gas_estimate = %estimate, gas_limit = %gas, "sending commit");

        let call = call.gas(gas);
        let pending = call.send().await.map_err(classify)?;
        let receipt = pending
            .await
            .map_err(|e| ChainError::Transient(e.to_string()))?
            .ok_or_else(|| ChainError::Transient("commit dropped from mempool".to_string()))?;

        if receipt.status != Some(U64::from(1)) {
            return Err(ChainError::Reverted("commit reverted on-chain".to_string()));
        }
        Ok(format!("{:?}", receipt.transaction_hash))
    }

    async fn finalize_resolution(&self, market: &str) -> Result<String, ChainError> {
        let address = self.parse_market(market)?;
        let _lane = self.write_lane.lock().await;

        let call = self.oracle.finalize(address);
        let estimate = call.estimate_gas().await.map_err(classify)?;
        let gas = self.padded_gas(estimate);
        debug!(market, gas_estimate = %estimate, gas_limit = %gas, "sending finalize");

        let call = call.gas(gas);
        let pending = call.send().await.map_err(classify)?;
        let receipt = pending
            .await
            .map_err(|e| ChainError::Transient(e.to_string()))?
            .ok_or_else(|| ChainError::Transient("finalize dropped from mempool".to_string()))?;

        if receipt.status != Some(U64::from(1)) {
            return Err(ChainError::Reverted("finalize reverted on-chain".to_string()));
        }
        Ok(format!("{:?}", receipt.transaction_hash))
    }
}
