//! Connection-related data models.
//!
//! This module defines the backends, their connection parameters, and transaction
//! state.

use crate::secret::EncryptedSecret;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Supported database types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    /// Embedded, file-locked, single writer.
    SQLite,
    /// Networked server. Includes MariaDB.
    MySQL,
}

impl DatabaseType {
    /// Parse database type from a connection string.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySQL)
        } else if lower.starts_with("sqlite://") || lower.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else {
            None
        }
    }

    /// Get the display name for this database type.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::SQLite => "SQLite",
            Self::MySQL => "MySQL",
        }
    }

    pub fn is_embedded(&self) -> bool {
        matches!(self, Self::SQLite)
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Where a handle's database lives.
///
/// Serializable so it can be persisted in configuration; the password is only ever
/// held as ciphertext.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "engine", rename_all = "lowercase")]
pub enum ConnectionParams {
    Sqlite {
        /// Database file, or `:memory:`.
        path: PathBuf,
    },
    Mysql {
        host: String,
        #[serde(default = "default_mysql_port")]
        port: u16,
        user: String,
        #[serde(default)]
        password: Option<EncryptedSecret>,
        database: String,
    },
}

fn default_mysql_port() -> u16 {
    3306
}

impl ConnectionParams {
    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        Self::Sqlite { path: path.into() }
    }

    pub fn sqlite_memory() -> Self {
        Self::Sqlite {
            path: PathBuf::from(":memory:"),
        }
    }

    pub fn mysql(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        password: Option<EncryptedSecret>,
        database: impl Into<String>,
    ) -> Self {
        Self::Mysql {
            host: host.into(),
            port,
            user: user.into(),
            password,
            database: database.into(),
        }
    }

    pub fn db_type(&self) -> DatabaseType {
        match self {
            Self::Sqlite { .. } => DatabaseType::SQLite,
            Self::Mysql { .. } => DatabaseType::MySQL,
        }
    }

    /// Short name used in log fields and error messages.
    pub fn label(&self) -> String {
        match self {
            Self::Sqlite { path } => path
                .file_stem()
                .and_then(|s| s.to_str())
                .filter(|s| !s.is_empty())
                .unwrap_or("sqlite")
                .to_string(),
            Self::Mysql { database, .. } => database.clone(),
        }
    }

    /// Database file path for the embedded engine, `None` for in-memory or networked.
    pub fn file_path(&self) -> Option<&Path> {
        match self {
            Self::Sqlite { path } if !is_memory_path(path) => Some(path.as_path()),
            _ => None,
        }
    }

    /// Display-safe description (never includes the password).
    pub fn masked(&self) -> String {
        match self {
            Self::Sqlite { path } => format!("sqlite:{}", path.display()),
            Self::Mysql {
                host,
                port,
                user,
                password,
                database,
            } => {
                let secret = if password.is_some() { ":****" } else { "" };
                format!("mysql://{user}{secret}@{host}:{port}/{database}")
            }
        }
    }
}

pub(crate) fn is_memory_path(path: &Path) -> bool {
    path.as_os_str() == ":memory:" || path.as_os_str().is_empty()
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConnectionParams")
            .field(&self.masked())
            .finish()
    }
}

/// Transaction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Open,
    Committed,
    Aborted,
}

impl TransactionState {
    /// Check if the transaction is still open.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Check if the transaction has reached a terminal state.
    pub fn is_ended(&self) -> bool {
        !self.is_open()
    }
}

/// Whether a transaction intends to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionMode {
    #[default]
    ReadWrite,
    ReadOnly,
}
