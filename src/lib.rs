pub mod adapters;
pub mod config;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod ledger;
pub mod queue;
pub mod services;

pub use adapters::{MemoryStore, Notifier, PostgresStore, Store};
pub use config::AppConfig;
pub use error::{PipelineError, Result};
pub use exchange::{ExchangeAdapter, ExecutionError, PaperExchange};
pub use ledger::PositionLedger;
pub use queue::{DispatchQueue, Dispatcher, QueueWatchdog};
pub use services::{AlertEvaluator, MonitorScheduler};
