//! Durable storage glue: one SQLite database per account, opened and
//! migrated on demand.

pub mod schema;

pub use schema::open_and_migrate;
