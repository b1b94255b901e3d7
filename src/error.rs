//! Error types for normsql.
//!
//! All fallible operations return [`DbResult`]. Backend errors are translated by the
//! dialect driver of the handle that produced them, so the same failure on SQLite and
//! MySQL surfaces as the same variant.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Unsupported operation for {dialect}: {construct}")]
    UnsupportedOperation { construct: String, dialect: String },

    #[error("A transaction is already open on database '{database}' for this caller")]
    TransactionAlreadyOpen { database: String },

    #[error("Transient contention: {message}")]
    TransientContention {
        message: String,
        /// Native error code reported by the backend, if any.
        code: Option<String>,
    },

    #[error("Transaction failed after {attempts} attempt(s): {message}")]
    TransactionFailed { attempts: u32, message: String },

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Migration to version {version} failed: {message} (last applied: {last_applied})")]
    Migration {
        version: i64,
        message: String,
        last_applied: i64,
    },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "23000" for an integrity violation
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Transaction error: {message} (transaction: {transaction_id})")]
    Transaction {
        message: String,
        transaction_id: String,
    },

    #[error("Schema error: {message} (object: {object})")]
    Schema { message: String, object: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Secret codec error: {message}")]
    Secret { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create an unsupported-operation error for a dialect.
    pub fn unsupported(construct: impl Into<String>, dialect: impl Into<String>) -> Self {
        Self::UnsupportedOperation {
            construct: construct.into(),
            dialect: dialect.into(),
        }
    }

    pub fn transaction_already_open(database: impl Into<String>) -> Self {
        Self::TransactionAlreadyOpen {
            database: database.into(),
        }
    }

    /// Create a transient contention error.
    pub fn transient(message: impl Into<String>, code: Option<String>) -> Self {
        Self::TransientContention {
            message: message.into(),
            code,
        }
    }

    /// Create a retries-exhausted error.
    pub fn transaction_failed(attempts: u32, message: impl Into<String>) -> Self {
        Self::TransactionFailed {
            attempts,
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms,
        }
    }

    /// Create a migration error.
    pub fn migration(version: i64, message: impl Into<String>, last_applied: i64) -> Self {
        Self::Migration {
            version,
            message: message.into(),
            last_applied,
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            transaction_id: transaction_id.into(),
        }
    }

    /// Create a schema error.
    pub fn schema(message: impl Into<String>, object: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
            object: object.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn secret(message: impl Into<String>) -> Self {
        Self::Secret {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::UnsupportedOperation { .. } => {
                Some("Use a construct the target dialect can express, or a Raw statement")
            }
            Self::TransactionAlreadyOpen { .. } => {
                Some("Run the statement through the open transaction instead of the handle")
            }
            Self::TransactionFailed { .. } => {
                Some("The database stayed busy; retry later or raise the retry policy bound")
            }
            _ => None,
        }
    }

    /// Whether the coordinator may retry the enclosing transaction.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientContention { .. })
    }

    /// Whether the failure means the connection can no longer be trusted.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}

/// Convert dialect-independent sqlx errors to DbError.
///
/// Backend (`sqlx::Error::Database`) and I/O errors are classified by the dialect
/// driver instead; see `Dialect::classify_error`.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection parameters and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => DbError::timeout("connection pool acquire", 0),
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Reopen the database handle")
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::TypeNotFound { type_name } => DbError::schema(
                format!("Type not found: {}", type_name),
                type_name.to_string(),
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::schema(format!("Column not found: {}", col), col.to_string())
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => {
                DbError::connection("Database worker crashed", "Reopen the database handle")
            }
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::connection("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_error_suggestion() {
        let err = DbError::database(
            "Syntax error",
            Some("42000".to_string()),
            "Check SQL syntax",
        );
        assert_eq!(err.suggestion(), Some("Check SQL syntax"));
    }

    #[test]
    fn test_only_contention_is_transient() {
        assert!(DbError::transient("database is locked", Some("5".to_string())).is_transient());
        assert!(!DbError::timeout("query execution", 30_000).is_transient());
        assert!(!DbError::connection("err", "sugg").is_transient());
        assert!(!DbError::unsupported("DECIMAL", "SQLite").is_transient());
        assert!(!DbError::transaction_already_open("main").is_transient());
    }

    #[test]
    fn test_transaction_failed_reports_attempts() {
        let err = DbError::transaction_failed(3, "database is locked");
        assert_eq!(
            err.to_string(),
            "Transaction failed after 3 attempt(s): database is locked"
        );
    }

    #[test]
    fn test_migration_error_keeps_last_applied() {
        let err = DbError::migration(4, "no such table: widgets", 3);
        match err {
            DbError::Migration {
                version,
                last_applied,
                ..
            } => {
                assert_eq!(version, 4);
                assert_eq!(last_applied, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_pool_closed_is_connection_error() {
        let err = DbError::from(sqlx::Error::PoolClosed);
        assert!(err.is_connection_error());
    }

    #[test]
    fn test_row_not_found_maps_to_database() {
        let err = DbError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, DbError::Database { .. }));
    }
}
