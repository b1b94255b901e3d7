//! normsql
//!
//! One dialect-independent interface for schema, query and transaction operations
//! against SQLite (embedded) and MySQL (networked). Callers describe operations as
//! [`StatementDescriptor`]s; each handle's dialect driver renders them, its
//! coordinator enforces one open transaction at a time with bounded retry on lock
//! contention, and results come back as backend-agnostic [`Row`]s.

pub mod config;
pub mod db;
pub mod error;
pub mod handle;
pub mod models;
pub mod secret;

pub use config::{Config, DatabaseConfig, HandleOptions, PoolOptions, RetryPolicy};
pub use db::{RowStream, Rows, Transaction};
pub use error::{DbError, DbResult};
pub use handle::DatabaseHandle;
pub use models::{
    ColumnSpec, ConnectionParams, CreateIndex, CreateTable, DatabaseType, Delete, Insert,
    LogicalType, Migration, MigrationReport, Predicate, Row, Select, StatementDescriptor,
    TransactionMode, Update, Value,
};
pub use secret::{EncryptedSecret, EphemeralCodec, FnCodec, SecretCodec};
