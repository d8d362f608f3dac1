use clap::Parser;
use papertrader::api::{BinanceSource, CoinGeckoSource, MarketDataSource};
use papertrader::cache::MarketCache;
use papertrader::config::Settings;
use papertrader::discovery::DiscoveryPipeline;
use papertrader::ledger::PortfolioLedger;
use papertrader::limiter::ProviderRateLimiter;
use papertrader::market::MarketDataProvider;
use papertrader::monitor::RiskMonitor;
use papertrader::persist::PgStore;
use papertrader::resolver::InstrumentResolver;
use papertrader::service::TradingService;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};

#[derive(Parser)]
#[command(name = "papertrader", about = "Simulated crypto trading engine")]
struct Cli {
    /// Path to a TOML config file (env vars override it)
    #[arg(long)]
    config: Option<String>,

    /// Run a single discovery cycle, log the report, and exit
    #[arg(long)]
    discover_once: bool,

    /// Override the configured discovery universe size
    #[arg(long)]
    universe_size: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;
    let universe_size = cli.universe_size.unwrap_or(settings.discovery.universe_size);

    tracing::info!("🚀 papertrader starting");

    // Shared leaf services: rate limiter and cache, injected everywhere
    let limiter = Arc::new(ProviderRateLimiter::from_config(&settings.providers));
    let cache = Arc::new(MarketCache::new(settings.cache.clone()));

    let coingecko: Arc<dyn MarketDataSource> =
        Arc::new(CoinGeckoSource::new(&settings.providers.coingecko));
    let binance: Arc<dyn MarketDataSource> =
        Arc::new(BinanceSource::new(&settings.providers.binance));

    let resolution_source = if settings.providers.resolution == binance.name() {
        binance.clone()
    } else {
        coingecko.clone()
    };

    let provider = Arc::new(MarketDataProvider::new(
        vec![coingecko, binance],
        settings.providers.route.clone(),
        cache.clone(),
        limiter.clone(),
    ));

    let resolver = Arc::new(InstrumentResolver::new(
        resolution_source.clone(),
        cache.clone(),
        limiter.clone(),
        settings.cache.market_meta_secs,
    ));

    // Durable store is optional: without it the engine runs in-memory
    let store = connect_store(&settings).await;

    let ledger = restore_ledger(&settings, store.as_ref()).await;
    if let Some(store) = &store {
        match store.load_mappings().await {
            Ok(mappings) if !mappings.is_empty() => {
                tracing::info!("📂 restored {} instrument mappings", mappings.len());
                resolver.preload(mappings).await;
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "failed to load mappings"),
        }
    }
    let ledger = Arc::new(Mutex::new(ledger));

    let discovery = DiscoveryPipeline::new(
        resolver.clone(),
        provider.clone(),
        settings.discovery.clone(),
    );

    let service = Arc::new(TradingService::new(
        resolver,
        provider.clone(),
        discovery,
        ledger.clone(),
        store.clone(),
        resolution_source,
        limiter,
    ));

    if cli.discover_once {
        let report = service.run_discovery(universe_size).await?;
        tracing::info!(
            scanned = report.scanned,
            admitted = report.candidates.len(),
            "discovery report"
        );
        for candidate in &report.candidates {
            tracing::info!(
                "  ✓ {} ({}) score {:.3}",
                candidate.symbol,
                candidate.instrument_id,
                candidate.score
            );
        }
        for (reason, count) in &report.rejections.reason_counts {
            tracing::info!("  ✗ {count}× {reason}");
        }
        return Ok(());
    }

    let state = service.portfolio_state();
    tracing::info!("📊 configuration:");
    tracing::info!("  cash balance: ${:.2}", state.cash_balance);
    tracing::info!(
        "  max position size: {}%",
        settings.risk.max_position_size_fraction * 100.0
    );
    tracing::info!(
        "  max daily loss: {}%",
        settings.risk.max_daily_loss_fraction * 100.0
    );
    tracing::info!("  open positions: {}", state.open_positions.len());

    let (stop_tx, stop_rx) = watch::channel(false);

    // Loop 1: position risk monitor (fine-grained timer)
    let monitor = Arc::new(RiskMonitor::new(provider, ledger, store));
    let monitor_task = {
        let monitor = monitor.clone();
        let stop = stop_rx.clone();
        let interval_secs = settings.risk.monitor_interval_secs;
        tokio::spawn(async move {
            monitor.run_loop(interval_secs, stop).await;
        })
    };

    // Loop 2: coin discovery (coarse timer) + cache housekeeping
    let discovery_task = {
        let service = service.clone();
        let cache = cache.clone();
        let mut stop = stop_rx.clone();
        let interval_secs = settings.discovery.interval_secs;
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            tracing::info!("discovery loop stopping");
                            return;
                        }
                    }
                    _ = ticker.tick() => {
                        match service.run_discovery(universe_size).await {
                            Ok(report) => tracing::info!(
                                scanned = report.scanned,
                                admitted = report.candidates.len(),
                                rejected = report.rejections.total,
                                "🔍 discovery cycle"
                            ),
                            Err(e) => tracing::error!(error = %e, "discovery cycle failed"),
                        }
                        let purged = cache.purge_expired();
                        if purged > 0 {
                            tracing::debug!(purged, "cache housekeeping");
                        }
                    }
                }
            }
        })
    };

    tracing::info!("✅ loops running, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("⚠️  shutting down...");

    // Decided position transitions finish their ledger write before the
    // process treats shutdown as clean.
    monitor.shutdown_flag().store(true, std::sync::atomic::Ordering::Relaxed);
    let _ = stop_tx.send(true);
    let _ = monitor_task.await;
    let _ = discovery_task.await;

    tracing::info!("👋 papertrader stopped");
    Ok(())
}

fn setup_logging() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("papertrader=info")),
        )
        .init();
}

async fn connect_store(settings: &Settings) -> Option<Arc<PgStore>> {
    let url = settings
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok())?;

    match PgStore::new(&url).await {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            tracing::warn!(error = %e, "Postgres unavailable, continuing without persistence");
            None
        }
    }
}

async fn restore_ledger(settings: &Settings, store: Option<&Arc<PgStore>>) -> PortfolioLedger {
    if let Some(store) = store {
        let portfolio = store.load_portfolio().await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load portfolio");
            None
        });
        let positions = store.load_positions().await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load positions");
            Vec::new()
        });

        if let Some(p) = portfolio {
            return PortfolioLedger::restore(
                p.cash_balance,
                p.realized_pnl,
                p.daily_pnl,
                p.daily_reset_at,
                p.trading_suspended,
                positions,
                settings.risk.clone(),
            );
        }
    }

    PortfolioLedger::new(settings.initial_cash, settings.risk.clone())
}
