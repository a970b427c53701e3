pub mod paper;
pub mod traits;

pub use paper::PaperExchange;
pub use traits::{ExchangeAdapter, ExecutionError, VenueOrder, VenueOrderStatus};
