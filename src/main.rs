use clap::Parser;
use coinvest::adapters::{
    LoggingNotificationSink, MemoryAllocationSource, MemoryCache, MemoryEventBus,
    MemoryLedgerStore, MemoryOrderStore, PostgresStore,
};
use coinvest::cli::{Cli, Commands};
use coinvest::config::{AppConfig, LoggingConfig};
use coinvest::error::{CoinvestError, Result};
use coinvest::exchange::{ExchangeRegistry, PaperExchange};
use coinvest::persistence::{
    AllocationSource, CacheStore, EventBus, LedgerStore, NotificationSink, OrderStore,
};
use coinvest::pipeline::{
    AllocationProcessor, BalanceAdmissionGate, FundingWorker, IdempotencyGuard, OrderExecutor,
    PaymentOrchestrator,
};
use coinvest::resilience::ResilienceExecutor;
use coinvest::services::{Metrics, Reconciler};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;
    init_logging(&config.logging);

    if let Err(errors) = config.validate() {
        for e in &errors {
            error!("Config error: {}", e);
        }
        return Err(CoinvestError::Validation(errors.join("; ")));
    }

    let dry_run = cli.dry_run || config.dry_run.enabled;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => run_serve(&config, dry_run).await,
        Commands::Reconcile => run_reconcile(&config, dry_run).await,
        Commands::Migrate => run_migrate(&config).await,
        Commands::CheckConfig => {
            info!("Configuration OK ({} exchanges)", config.exchanges.len());
            Ok(())
        }
    }
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("info,coinvest={},sqlx=warn", config.level)));

    if config.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Wired engine components shared by serve and reconcile modes.
struct Engine {
    orchestrator: Arc<PaymentOrchestrator>,
    reconciler: Arc<Reconciler>,
    metrics: Arc<Metrics>,
}

async fn build_registry(config: &AppConfig, dry_run: bool) -> Result<ExchangeRegistry> {
    if !dry_run {
        // Live transports are collaborator-provided: embed coinvest as a
        // library and register your ExchangeClient implementations.
        return Err(CoinvestError::Validation(
            "no live exchange transport in this build; run with --dry-run".to_string(),
        ));
    }

    let mut registry = ExchangeRegistry::new();
    for entry in &config.exchanges {
        let paper = PaperExchange::new(&entry.name, &entry.quote_asset_ticker);
        paper
            .set_balance(&entry.quote_asset_ticker, entry.paper_balance)
            .await;
        info!(
            "Registered paper exchange {} ({} {})",
            entry.name, entry.paper_balance, entry.quote_asset_ticker
        );
        registry.register(Arc::new(paper));
    }
    if registry.is_empty() {
        return Err(CoinvestError::Validation(
            "no exchanges configured".to_string(),
        ));
    }
    Ok(registry)
}

async fn build_engine(config: &AppConfig, dry_run: bool) -> Result<Engine> {
    let registry = Arc::new(build_registry(config, dry_run).await?);
    let cache: Arc<dyn CacheStore> = Arc::new(MemoryCache::new());
    let executor = Arc::new(ResilienceExecutor::new());
    let metrics = Arc::new(Metrics::new());
    let sink: Arc<dyn NotificationSink> = Arc::new(LoggingNotificationSink::new());

    let (orders, ledger, bus, allocations): (
        Arc<dyn OrderStore>,
        Arc<dyn LedgerStore>,
        Arc<dyn EventBus>,
        Arc<dyn AllocationSource>,
    ) = if dry_run {
        info!("Dry-run mode: using in-memory stores");
        (
            Arc::new(MemoryOrderStore::new()),
            Arc::new(MemoryLedgerStore::new()),
            Arc::new(MemoryEventBus::new()),
            Arc::new(MemoryAllocationSource::new()),
        )
    } else {
        let store = Arc::new(
            PostgresStore::new(&config.database.url, config.database.max_connections).await?,
        );
        store.migrate().await?;
        (
            store.clone(),
            store.clone(),
            store.clone(),
            store,
        )
    };

    let (funding, funding_worker, _funding_stats) = FundingWorker::channel(
        config.funding.queue_capacity,
        cache.clone(),
        bus.clone(),
        sink.clone(),
        Duration::from_secs(config.funding.dedup_window_secs),
    );
    tokio::spawn(funding_worker.run());

    let gate = Arc::new(BalanceAdmissionGate::new(
        registry.clone(),
        cache.clone(),
        funding,
        executor.clone(),
        config.balance_gate.clone(),
    ));
    let order_executor = Arc::new(OrderExecutor::new(executor.clone(), metrics.clone()));

    let processor = Arc::new(AllocationProcessor::new(
        registry.clone(),
        gate.clone(),
        order_executor.clone(),
        orders.clone(),
        ledger.clone(),
        bus.clone(),
        sink.clone(),
        cache.clone(),
        executor.clone(),
        metrics.clone(),
        config.pipeline.clone(),
    ));

    let idempotency = IdempotencyGuard::new(
        cache.clone(),
        Duration::from_secs(config.pipeline.idempotency_ttl_secs),
    );
    let orchestrator = Arc::new(PaymentOrchestrator::new(
        idempotency,
        allocations,
        processor,
        bus.clone(),
        executor.clone(),
        metrics.clone(),
        config.pipeline.clone(),
    ));

    let reconciler = Arc::new(Reconciler::new(
        orders,
        ledger,
        bus,
        registry,
        gate,
        order_executor,
        executor,
        metrics.clone(),
        config.reconciliation.clone(),
    ));

    Ok(Engine {
        orchestrator,
        reconciler,
        metrics,
    })
}

async fn run_serve(config: &AppConfig, dry_run: bool) -> Result<()> {
    let engine = build_engine(config, dry_run).await?;
    engine.reconciler.clone().start();

    let mut event_poll =
        tokio::time::interval(Duration::from_secs(config.pipeline.event_poll_secs));
    let mut status_log = tokio::time::interval(Duration::from_secs(60));

    info!("Engine started; draining payment events");
    loop {
        tokio::select! {
            _ = event_poll.tick() => {
                match engine.orchestrator.drain().await {
                    Ok(0) => {}
                    Ok(handled) => info!("Handled {} payment events", handled),
                    Err(e) => error!("Event drain failed: {}", e),
                }
            }
            _ = status_log.tick() => {
                engine.metrics.log_status();
            }
            _ = signal::ctrl_c() => {
                info!("Shutdown signal received");
                engine.reconciler.stop();
                break;
            }
        }
    }

    engine.metrics.log_status();
    Ok(())
}

async fn run_reconcile(config: &AppConfig, dry_run: bool) -> Result<()> {
    let engine = build_engine(config, dry_run).await?;
    let stats = engine.reconciler.reconcile_pending().await?;
    let submitted = engine.reconciler.submit_queued().await?;
    info!(
        "Reconciliation complete: {} checked, {} errors, {} queued orders submitted",
        stats.orders_checked, stats.errors, submitted
    );
    Ok(())
}

async fn run_migrate(config: &AppConfig) -> Result<()> {
    let store =
        PostgresStore::new(&config.database.url, config.database.max_connections).await?;
    store.migrate().await?;
    Ok(())
}
