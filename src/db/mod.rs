//! Database module: row models and the SQLite record store.
//!
//! - `model`: row shapes as stored, with conversion into domain records.
//! - `repo`: pool setup, migrations and `SqliteStore`.

pub mod model;
pub mod repo;

pub use repo::{init_pool, run_migrations, Pool, SqliteStore};
