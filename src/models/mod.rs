//! Data models shared by the database layer and its callers.

pub mod connection;
pub mod migration;
pub mod row;
pub mod statement;

pub use connection::{ConnectionParams, DatabaseType, TransactionMode, TransactionState};
pub use migration::{Migration, MigrationRecord, MigrationReport, SCHEMA_VERSION_TABLE};
pub use row::{FromValue, Row, Value};
pub use statement::{
    ColumnDefault, ColumnSpec, CreateIndex, CreateTable, Delete, Insert, LogicalType,
    OperationKind, OrderBy, Predicate, Select, StatementDescriptor, Update, Upsert,
};
