pub mod dispatch;
pub mod dispatcher;
pub mod watchdog;

pub use dispatch::DispatchQueue;
pub use dispatcher::Dispatcher;
pub use watchdog::QueueWatchdog;
