//! Schema migration models.

use crate::models::statement::StatementDescriptor;
use chrono::NaiveDateTime;
use serde::Serialize;

/// Name of the reserved metadata table.
pub const SCHEMA_VERSION_TABLE: &str = "schema_version";

/// One numbered schema change. Its statements run as a single transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Migration {
    pub version: i64,
    pub name: String,
    pub statements: Vec<StatementDescriptor>,
}

impl Migration {
    pub fn new(version: i64, name: impl Into<String>) -> Self {
        Self {
            version,
            name: name.into(),
            statements: Vec::new(),
        }
    }

    pub fn statement(mut self, statement: impl Into<StatementDescriptor>) -> Self {
        self.statements.push(statement.into());
        self
    }
}

/// A row of the `schema_version` table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationRecord {
    pub version: i64,
    pub applied_at: NaiveDateTime,
}

/// Outcome of applying a migration list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub from_version: i64,
    pub to_version: i64,
    /// Versions applied by this call, ascending.
    pub applied: Vec<i64>,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}
