//! oddsbot - autonomous oracle resolution runner
//! Mission: every market resolved exactly once, on time, with auditable data
//!
//! Startup order matters: persistence and fetchers first, then the chain
//! adapter, then the scheduler (which recovers persisted jobs), then the
//! event ingestor and the control-plane HTTP server. Shutdown runs the same
//! list in reverse.

use anyhow::{Context, Result};
use oddsbot_backend::api::{self, AppState};
use oddsbot_backend::chain::adapter::EthersChainAdapter;
use oddsbot_backend::chain::ingestor::{EventIngestor, IngestorConfig};
use oddsbot_backend::chain::OracleChain;
use oddsbot_backend::clock::{Clock, SystemClock};
use oddsbot_backend::fetchers::binance::BinanceFetcher;
use oddsbot_backend::fetchers::coinbase::CoinbaseFetcher;
use oddsbot_backend::fetchers::hyperliquid::HyperliquidFetcher;
use oddsbot_backend::fetchers::registry::{FetcherRegistry, RegistryConfig};
use oddsbot_backend::middleware::{RateLimiter, RateLimiterConfig};
use oddsbot_backend::models::Config;
use oddsbot_backend::persistence::FileJobStore;
use oddsbot_backend::resolution::{ResolutionConfig, ResolutionService};
use oddsbot_backend::scheduler::{JobScheduler, SchedulerConfig};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Fatal configuration error.
const EXIT_CONFIG: i32 = 1;
/// Unrecoverable chain connectivity loss.
const EXIT_CHAIN_LOST: i32 = 2;

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,oddsbot_backend=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(EXIT_CONFIG);
        }
    };

    match run(config).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!(error = %e, "runner failed");
            std::process::exit(EXIT_CONFIG);
        }
    }
}

async fn run(config: Config) -> Result<i32> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    // Persistence
    let store = Arc::new(
        FileJobStore::new(&config.persistence_dir, clock.clone())
            .context("opening job store")?,
    );

    // Metric sources
    let registry = Arc::new(FetcherRegistry::new(
        RegistryConfig {
            fetch_timeout: Duration::from_secs(config.fetch_timeout_secs),
            max_concurrent_fetches: config.max_concurrent_fetches,
            fallbacks_enabled: true,
            health_check_interval: Duration::from_secs(config.health_check_interval_secs),
        },
        clock.clone(),
    ));
    registry.register(Arc::new(HyperliquidFetcher::new(
        config.hyperliquid_api_url.clone(),
        config.token_symbols.clone(),
    )))?;
    registry.register(Arc::new(CoinbaseFetcher::new(
        config.coinbase_api_url.clone(),
        config.token_symbols.clone(),
    )))?;
    registry.register(Arc::new(BinanceFetcher::new(
        config.binance_api_url.clone(),
        config.token_symbols.clone(),
    )))?;
    let health_loop = registry.spawn_health_loop(shutdown_tx.subscribe());

    // Chain adapter (single resolver key, single write lane)
    let chain: Arc<dyn OracleChain> = Arc::new(
        EthersChainAdapter::connect(
            &config.rpc_url,
            &config.private_key,
            &config.oracle_address,
            config.gas_limit_multiplier,
            config.dispute_window_override,
        )
        .await
        .context("connecting chain adapter")?,
    );

    // Resolution pipeline + scheduler
    let resolution = Arc::new(ResolutionService::new(
        chain.clone(),
        registry.clone(),
        clock.clone(),
        ResolutionConfig {
            sample_stride_secs: config.sample_stride_secs,
            max_sources: config.max_sources,
            max_gap_ratio: 0.2,
        },
        shutdown_tx.clone(),
    ));
    let scheduler = JobScheduler::new(
        store,
        resolution,
        clock.clone(),
        SchedulerConfig {
            job_concurrency: config.job_concurrency,
            max_retries: config.retry_max_attempts,
            retry_base_delay: Duration::from_millis(config.retry_delay_base_ms),
            ..Default::default()
        },
        shutdown_tx.clone(),
    );
    scheduler
        .initialize()
        .await
        .context("recovering persisted jobs")?;

    // Event ingestor
    let ingestor = EventIngestor::new(
        &config.rpc_url,
        &config.factory_address,
        chain.clone(),
        scheduler.clone(),
        IngestorConfig {
            backfill_depth: config.backfill_depth,
            poll_interval: Duration::from_secs(config.chain_poll_interval_secs),
        },
        shutdown_tx.clone(),
    )?;
    let mut ingestor_task = tokio::spawn(ingestor.run());

    // Control plane
    let limiter = RateLimiter::new(RateLimiterConfig::default());
    let eviction_loop = limiter.spawn_eviction_loop(shutdown_tx.subscribe());
    let app = api::router(
        AppState {
            scheduler: scheduler.clone(),
            registry: registry.clone(),
            webhook_secret: config.webhook_secret.clone(),
            started_at: Instant::now(),
        },
        limiter,
    );
    let addr = SocketAddr::from(([0, 0, 0, 0], config.webhook_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding control plane to {addr}"))?;
    info!(%addr, "🎯 control plane listening");

    let mut http_shutdown = shutdown_tx.subscribe();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = http_shutdown.recv().await;
    });
    let mut server_task = tokio::spawn(server.into_future());

    info!("oddsbot resolution runner started");

    // Run until a signal or a fatal component failure.
    let mut ingestor_done = false;
    let mut server_done = false;
    let exit_code = tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            0
        }
        joined = &mut ingestor_task => {
            ingestor_done = true;
            match joined {
                Ok(Ok(())) => 0,
                Ok(Err(e)) => {
                    error!(error = %e, "event ingestor gave up");
                    EXIT_CHAIN_LOST
                }
                Err(e) => {
                    error!(error = %e, "event ingestor task aborted");
                    EXIT_CHAIN_LOST
                }
            }
        }
        joined = &mut server_task => {
            server_done = true;
            match joined {
                Ok(Ok(())) => 0,
                Ok(Err(e)) => {
                    error!(error = %e, "control plane server failed");
                    1
                }
                Err(e) => {
                    error!(error = %e, "control plane task aborted");
                    1
                }
            }
        }
    };

    // Ordered shutdown: stop intake, drain jobs, then the HTTP server.
    let _ = shutdown_tx.send(());
    scheduler.destroy().await;

    if !ingestor_done {
        if tokio::time::timeout(Duration::from_secs(5), &mut ingestor_task)
            .await
            .is_err()
        {
            warn!("ingestor did not stop in time");
        }
    }
    if !server_done {
        if tokio::time::timeout(Duration::from_secs(5), &mut server_task)
            .await
            .is_err()
        {
            warn!("http server did not stop in time");
        }
    }
    health_loop.abort();
    eviction_loop.abort();

    info!(exit_code, "runner stopped");
    Ok(exit_code)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
