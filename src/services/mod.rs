pub mod alert_evaluator;
pub mod monitor_scheduler;

pub use alert_evaluator::AlertEvaluator;
pub use monitor_scheduler::MonitorScheduler;
