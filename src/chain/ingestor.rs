//! MarketCreated ingestion: bounded startup backfill, then a polling watch
//! loop that hands new markets to the scheduler.
//!
//! The loop tolerates RPC flaps with exponential backoff and re-scans a small
//! safety margin after a failure streak so nothing is missed across a
//! reconnect. A long enough streak is treated as unrecoverable connectivity
//! loss and bubbles out so the process can exit with the right code.

use crate::chain::{MarketCreatedFilter, MarketFactory, OracleChain};
use crate::scheduler::JobScheduler;
use anyhow::{anyhow, Context, Result};
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::Address;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Blocks re-scanned after a failure streak to reconcile missed events.
const SAFETY_MARGIN_BLOCKS: u64 = 25;

/// Log-query chunk size, kept under common RPC range limits.
const SCAN_CHUNK_BLOCKS: u64 = 2000;

/// Consecutive failed polls before the chain is declared unreachable.
const MAX_CONSECUTIVE_FAILURES: u32 = 10;

#[derive(Debug, Clone)]
pub struct IngestorConfig {
    pub backfill_depth: u64,
    pub poll_interval: Duration,
}

pub struct EventIngestor {
    provider: Arc<Provider<Http>>,
    factory_address: Address,
    chain: Arc<dyn OracleChain>,
    scheduler: Arc<JobScheduler>,
    config: IngestorConfig,
    shutdown: broadcast::Sender<()>,
}

impl EventIngestor {
    pub fn new(
        rpc_url: &str,
        factory_address: &str,
        chain: Arc<dyn OracleChain>,
        scheduler: Arc<JobScheduler>,
        config: IngestorConfig,
        shutdown: broadcast::Sender<()>,
    ) -> Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .context("invalid RPC_URL")?
            .interval(Duration::from_millis(2000));
        let factory_address: Address = factory_address
            .parse()
            .context("invalid FACTORY_ADDRESS")?;

        Ok(Self {
            provider: Arc::new(provider),
            factory_address,
            chain,
            scheduler,
            config,
            shutdown,
        })
    }

    /// Run until shutdown. An error return means chain connectivity was lost
    /// beyond recovery.
    pub async fn run(self) -> Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();
        let factory = MarketFactory::new(self.factory_address, self.provider.clone());
        let mut seen: HashSet<String> = HashSet::new();

        // Startup backfill over the last `backfill_depth` blocks.
        let head = loop {
            match self.provider.get_block_number().await {
                Ok(head) => break head.as_u64(),
                Err(e) => {
                    warn!(error = %e, "could not read block height, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                        _ = shutdown_rx.recv() => return Ok(()),
                    }
                }
            }
        };
        let from = head.saturating_sub(self.config.backfill_depth);
        info!(from, to = head, "backfilling MarketCreated events");
        if let Err(e) = self.scan_range(&factory, from, head, &mut seen).await {
            warn!(error = %e, "startup backfill incomplete; watch loop will reconcile");
        }

        let mut last_seen = head;
        let mut failures: u32 = 0;
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("event ingestor stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            let head = match self.provider.get_block_number().await {
                Ok(head) => head.as_u64(),
                Err(e) => {
                    failures += 1;
                    warn!(error = %e, failures, "block height poll failed");
                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        return Err(anyhow!("chain connectivity lost after {failures} attempts"));
                    }
                    let backoff = Duration::from_secs((1u64 << failures.min(6)).min(60));
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => continue,
                        _ = shutdown_rx.recv() => return Ok(()),
                    }
                }
            };

            // After a failure streak, rewind a little to reconcile events the
            // flap may have hidden.
            let from = if failures > 0 {
                last_seen.saturating_sub(SAFETY_MARGIN_BLOCKS) + 1
            } else {
                last_seen + 1
            };

            if head < from {
                failures = 0;
                continue;
            }

            match self.scan_range(&factory, from, head, &mut seen).await {
                Ok(count) => {
                    if count > 0 {
                        info!(count, from, to = head, "ingested new markets");
                    }
                    last_seen = head;
                    failures = 0;
                }
                Err(e) => {
                    failures += 1;
                    warn!(error = %e, failures, "event scan failed");
                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        return Err(anyhow!("chain connectivity lost after {failures} attempts"));
                    }
                }
            }
        }
    }

    async fn scan_range(
        &self,
        factory: &MarketFactory<Provider<Http>>,
        from: u64,
        to: u64,
        seen: &mut HashSet<String>,
    ) -> Result<usize> {
        let mut scheduled = 0usize;
        let mut start = from;
        while start <= to {
            let end = (start + SCAN_CHUNK_BLOCKS - 1).min(to);
            let events: Vec<MarketCreatedFilter> = factory
                .event::<MarketCreatedFilter>()
                .from_block(start)
                .to_block(end)
                .query()
                .await
                .with_context(|| format!("querying MarketCreated in [{start}, {end}]"))?;

            for event in events {
                if self.handle_market(&event, seen).await {
                    scheduled += 1;
                }
            }
            start = end + 1;
        }
        Ok(scheduled)
    }

    /// Returns whether a job was scheduled for this market.
    async fn handle_market(&self, event: &MarketCreatedFilter, seen: &mut HashSet<String>) -> bool {
        let market_id = format!("{:?}", event.market);
        if !seen.insert(market_id.clone()) {
            return false;
        }

        let params = match self.chain.market_params(&market_id).await {
            Ok(params) => params,
            Err(e) => {
                warn!(market = market_id.as_str(), error = %e, "could not read new market, skipping");
                // Allow a later rescan to try again.
                seen.remove(&market_id);
                return false;
            }
        };

        if params.resolved || params.cancelled {
            debug!(market = market_id.as_str(), "market already terminal, not scheduling");
            return false;
        }

        match self.scheduler.schedule_market_resolution(
            &market_id,
            &params.title,
            params.resolve_time,
            None,
        ) {
            Ok(job_id) => {
                debug!(market = market_id.as_str(), job_id = job_id.as_str(), "market scheduled from chain event");
                true
            }
            Err(e) => {
                warn!(market = market_id.as_str(), error = %e, "scheduling from chain event failed");
                seen.remove(&market_id);
                false
            }
        }
    }
}
