//! Persistence layer
//!
//! Provides the document-store capability for events, results and sessions,
//! with PostgreSQL and in-memory backends.

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use store::*;
