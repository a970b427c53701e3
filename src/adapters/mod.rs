pub mod memory;
pub mod notifier;
pub mod postgres;
pub mod store;

pub use memory::MemoryStore;
pub use notifier::Notifier;
pub use postgres::PostgresStore;
pub use store::Store;
