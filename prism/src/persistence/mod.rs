/// PostgreSQL implementations of the work queue and document stores.
///
/// This module provides [`PostgresWorkQueue`], [`PostgresCheckpointStore`] and
/// [`PostgresResultStore`], plus helpers to open a pool and apply the schema.
pub mod postgres;

pub use postgres::{
    apply_schema, connect, PostgresCheckpointStore, PostgresResultStore, PostgresWorkQueue,
};
