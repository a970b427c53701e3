pub mod alert;
pub mod monitor;
pub mod notify;
pub mod order;
pub mod position;
pub mod trade;

pub use alert::{AlertKind, AlertRule};
pub use monitor::Monitor;
pub use notify::{BrowserNotification, NotificationConfig, NotificationPayload, NotifyChannel};
pub use order::{
    ExecutionMode, MarketType, OrderFill, OrderJob, OrderKind, OrderRequest, OrderState,
    SignalType,
};
pub use position::{PortfolioSummary, Position, PositionKey, PositionSide};
pub use trade::{Trade, TradeAction};
