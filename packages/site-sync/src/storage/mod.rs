//! Connection persistence backends.
//!
//! - [`PostgresConnectionStore`]: production store (sqlx, see `migrations/`)
//! - [`InMemoryConnectionStore`]: process-local store for tests and dry runs

pub mod memory;
pub mod postgres;

pub use memory::InMemoryConnectionStore;
pub use postgres::PostgresConnectionStore;
