//! Database abstraction layer.
//!
//! This module provides:
//! - Dialect drivers that render logical statements for each engine
//! - Connection pool management with scoped acquisition
//! - Transaction coordination (admission, retry, rollback)
//! - Statement execution and row normalization
//! - Schema versioning and SQLite backups
//! - A backend dispatch macro for reducing code duplication

#[macro_use]
pub mod macros;
pub mod backup;
pub mod coordinator;
pub mod dialect;
pub mod executor;
pub(crate) mod params;
pub mod pool;
pub mod types;
pub mod versioning;

pub use coordinator::{Coordinator, Transaction};
pub use dialect::{Dialect, MySqlDialect, RenderedStatement, SqliteDialect};
pub use executor::{RowStream, Rows, StatementExecutor};
pub use pool::{ConnectionManager, DbPool, ScopedConnection};
pub use types::TypeCategory;
