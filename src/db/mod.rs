// Durable position storage
pub mod postgres;

pub use postgres::PostgresStore;
