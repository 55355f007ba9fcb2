pub mod memory;
pub mod postgres;

pub use memory::MemoryStateStore;
pub use postgres::PostgresStateStore;
