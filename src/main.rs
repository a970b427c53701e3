use chrono::Utc;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tradepipe::adapters::{MemoryStore, Notifier, PostgresStore, Store};
use tradepipe::config::{AppConfig, LoggingConfig};
use tradepipe::domain::{ExecutionMode, MarketType, OrderKind, OrderRequest, SignalType};
use tradepipe::error::{PipelineError, Result};
use tradepipe::exchange::PaperExchange;
use tradepipe::ledger::PositionLedger;
use tradepipe::queue::{DispatchQueue, Dispatcher, QueueWatchdog};
use tradepipe::services::{AlertEvaluator, MonitorScheduler};

#[derive(Parser)]
#[command(name = "tradepipe", about = "Order dispatch queue, position ledger and monitor scheduler")]
struct Cli {
    /// Configuration directory
    #[arg(long, default_value = "config", env = "TRADEPIPE_CONFIG_DIR")]
    config_dir: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline until interrupted
    Run {
        /// In-memory store and paper venue, nothing persisted
        #[arg(long)]
        dry_run: bool,
    },
    /// Show queue depth and portfolio summary
    Status,
    /// Enqueue a manual order
    Enqueue {
        #[arg(long)]
        symbol: String,
        /// open_long, close_short, reduce_long, ...
        #[arg(long)]
        signal: String,
        #[arg(long)]
        amount: Decimal,
        /// Required for limit orders
        #[arg(long)]
        price: Option<Decimal>,
        /// spot or swap
        #[arg(long, default_value = "swap")]
        market: String,
        /// market or limit
        #[arg(long, default_value = "market")]
        kind: String,
        /// auto or notify_only
        #[arg(long, default_value = "auto")]
        mode: String,
        #[arg(long, default_value_t = 0)]
        priority: i32,
        #[arg(long, default_value_t = 1)]
        account_id: i64,
    },
    /// Cancel a pending order
    Cancel { id: i64 },
    /// Execute a monitor immediately
    RunMonitor { id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config_dir)?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("config error: {}", e);
        }
        return Err(PipelineError::Validation(errors.join("; ")));
    }

    let _log_guard = init_logging(&config.logging);

    match cli.command {
        Commands::Run { dry_run } => run_pipeline(config, dry_run).await,
        Commands::Status => show_status(config).await,
        Commands::Enqueue {
            symbol,
            signal,
            amount,
            price,
            market,
            kind,
            mode,
            priority,
            account_id,
        } => {
            let request = OrderRequest {
                strategy_id: None,
                account_id,
                symbol,
                market: parse_arg::<MarketType>(&market)?,
                signal: parse_arg::<SignalType>(&signal)?,
                kind: parse_arg::<OrderKind>(&kind)?,
                amount,
                price,
                mode: parse_arg::<ExecutionMode>(&mode)?,
                priority,
                signal_at: Utc::now(),
            };
            enqueue_order(config, request).await
        }
        Commands::Cancel { id } => cancel_order(config, id).await,
        Commands::RunMonitor { id } => run_monitor(config, id).await,
    }
}

fn parse_arg<T>(s: &str) -> Result<T>
where
    for<'a> T: TryFrom<&'a str, Error = String>,
{
    T::try_from(s).map_err(PipelineError::Validation)
}

async fn connect_store(config: &AppConfig) -> Result<Arc<PostgresStore>> {
    let store = PostgresStore::new(&config.database.url, config.database.max_connections).await?;
    store.migrate().await?;
    Ok(Arc::new(store))
}

async fn run_pipeline(config: AppConfig, dry_run: bool) -> Result<()> {
    let store: Arc<dyn Store> = if dry_run {
        info!("Dry-run: in-memory store, nothing will be persisted");
        Arc::new(MemoryStore::new())
    } else {
        connect_store(&config).await?
    };

    // The paper venue is the in-tree adapter; real venues plug in behind
    // the same trait
    let exchange = Arc::new(PaperExchange::new());

    let notifier = Arc::new(Notifier::new(&config.notify, store.clone())?);
    let queue = Arc::new(DispatchQueue::new(store.clone(), config.dispatch.clone()));
    let ledger = Arc::new(PositionLedger::new(store.clone()));

    let dispatcher = Dispatcher::new(
        queue.clone(),
        exchange.clone(),
        ledger.clone(),
        notifier.clone(),
        config.notify.ops.clone(),
        config.dispatch.clone(),
    );
    let watchdog = QueueWatchdog::new(
        queue.clone(),
        exchange,
        ledger.clone(),
        config.dispatch.clone(),
    );
    let alerts = AlertEvaluator::new(store.clone(), notifier.clone(), config.alerts.clone());
    let monitors = MonitorScheduler::new(store, ledger, notifier, config.monitors.clone());

    // Reconcile whatever a previous process left in flight before any
    // worker starts claiming
    let recovered = watchdog.run_startup_pass().await?;
    if recovered > 0 {
        info!(recovered, "startup reconciliation complete");
    }

    dispatcher.start();
    watchdog.start();
    alerts.start();
    monitors.start();

    info!("Pipeline running, press ctrl-c to stop");
    shutdown_signal().await;

    info!("Shutting down");
    dispatcher.stop();
    watchdog.stop();
    alerts.stop();
    monitors.stop();
    // Give workers a moment to finish their current job
    tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
    Ok(())
}

async fn show_status(config: AppConfig) -> Result<()> {
    let store = connect_store(&config).await?;
    let queue = DispatchQueue::new(store.clone() as Arc<dyn Store>, config.dispatch.clone());
    let ledger = PositionLedger::new(store as Arc<dyn Store>);

    let depth = queue.depth().await?;
    println!("queue:");
    println!("  pending:      {}", depth.pending);
    println!("  processing:   {}", depth.processing);
    println!("  sent:         {}", depth.sent);
    println!("  needs_review: {}", depth.needs_review);

    let summary = ledger.summary().await?;
    println!("portfolio:");
    println!("  positions:      {}", summary.position_count);
    println!("  cost:           {}", summary.total_cost);
    println!("  value:          {}", summary.total_value);
    println!(
        "  unrealized_pnl: {} ({}%)",
        summary.total_unrealized_pnl,
        summary.pnl_percent.round_dp(2)
    );
    Ok(())
}

async fn enqueue_order(config: AppConfig, request: OrderRequest) -> Result<()> {
    let store = connect_store(&config).await?;
    let queue = DispatchQueue::new(store as Arc<dyn Store>, config.dispatch.clone());
    let job = queue.enqueue(request).await?;
    println!("enqueued order {} ({})", job.id, job.client_order_id);
    Ok(())
}

async fn cancel_order(config: AppConfig, id: i64) -> Result<()> {
    let store = connect_store(&config).await?;
    let queue = DispatchQueue::new(store as Arc<dyn Store>, config.dispatch.clone());
    let job = queue.cancel(id).await?;
    println!("order {} cancelled", job.id);
    Ok(())
}

async fn run_monitor(config: AppConfig, id: i64) -> Result<()> {
    let store = connect_store(&config).await?;
    let notifier = Arc::new(Notifier::new(&config.notify, store.clone() as Arc<dyn Store>)?);
    let ledger = Arc::new(PositionLedger::new(store.clone() as Arc<dyn Store>));
    let scheduler = MonitorScheduler::new(
        store as Arc<dyn Store>,
        ledger,
        notifier,
        config.monitors.clone(),
    );
    let report = scheduler.run_now(id).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn init_logging(config: &LoggingConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},sqlx=warn", config.level)));

    match &config.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "tradepipe.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            if config.json {
                tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .init();
            } else {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_ansi(false)
                    .with_writer(writer)
                    .init();
            }
            Some(guard)
        }
        None => {
            if config.json {
                tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(filter)
                    .init();
            } else {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_target(true)
                    .init();
            }
            None
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
