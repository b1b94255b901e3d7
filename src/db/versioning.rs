//! Schema versioning.
//!
//! Applied migrations are recorded in the reserved `schema_version` table, one row
//! per version. Each pending migration runs in its own coordinated transaction, so
//! a failure leaves every earlier migration committed.

use crate::db::coordinator::{Coordinator, Transaction};
use crate::error::{DbError, DbResult};
use crate::models::{
    ColumnSpec, CreateTable, Insert, LogicalType, Migration, MigrationRecord, MigrationReport,
    SCHEMA_VERSION_TABLE, Select, StatementDescriptor, TransactionMode,
};
use chrono::Utc;
use tracing::{debug, info};

/// Highest applied version; 0 when nothing has been applied.
pub async fn current_version(coordinator: &Coordinator) -> DbResult<i64> {
    coordinator
        .run(TransactionMode::ReadOnly, |tx| Box::pin(read_version(tx)))
        .await
}

/// Every applied migration, ascending.
pub async fn applied_migrations(coordinator: &Coordinator) -> DbResult<Vec<MigrationRecord>> {
    coordinator
        .run(TransactionMode::ReadOnly, |tx| Box::pin(read_records(tx)))
        .await
}

/// Apply the migrations above the current version, in order.
///
/// The list must number its versions 1, 2, 3 and so on without gaps. Running it
/// again, or running a prefix of it, writes nothing.
pub async fn apply_pending(
    coordinator: &Coordinator,
    migrations: &[Migration],
) -> DbResult<MigrationReport> {
    validate(migrations)?;

    let from_version = current_version(coordinator).await?;
    let mut report = MigrationReport {
        from_version,
        to_version: from_version,
        applied: Vec::new(),
    };
    let pending: Vec<&Migration> = migrations
        .iter()
        .filter(|m| m.version > from_version)
        .collect();
    if pending.is_empty() {
        debug!(version = from_version, "Schema is up to date");
        return Ok(report);
    }

    ensure_table(coordinator)
        .await
        .map_err(|e| DbError::migration(pending[0].version, e.to_string(), from_version))?;

    for migration in pending {
        let version = migration.version;
        let owned = migration.clone();
        let applied = coordinator
            .run(TransactionMode::ReadWrite, move |tx| {
                let migration = owned.clone();
                Box::pin(async move { apply_one(tx, &migration).await })
            })
            .await
            .map_err(|e| DbError::migration(version, e.to_string(), report.to_version))?;

        if applied {
            info!(version = version, name = %migration.name, "Applied migration");
            report.applied.push(version);
        }
        report.to_version = version;
    }
    Ok(report)
}

fn validate(migrations: &[Migration]) -> DbResult<()> {
    for (expected, m) in (1..).zip(migrations) {
        if m.version != expected {
            return Err(DbError::invalid_input(format!(
                "Migration '{}' has version {}; expected {} (versions start at 1 with no gaps)",
                m.name, m.version, expected
            )));
        }
    }
    Ok(())
}

async fn apply_one(tx: &mut Transaction, migration: &Migration) -> DbResult<bool> {
    // Another handle may have applied it since the version was read
    let recorded = max_version(tx).await?;
    if recorded >= migration.version {
        debug!(
            version = migration.version,
            recorded = recorded,
            "Migration already applied"
        );
        return Ok(false);
    }

    for stmt in &migration.statements {
        tx.execute(stmt.clone()).await?;
    }
    tx.execute(
        Insert::into(SCHEMA_VERSION_TABLE)
            .set("version", migration.version)
            .set("applied_at", Utc::now().naive_utc()),
    )
    .await?;
    Ok(true)
}

async fn read_version(tx: &mut Transaction) -> DbResult<i64> {
    if !table_exists(tx).await? {
        return Ok(0);
    }
    max_version(tx).await
}

async fn max_version(tx: &mut Transaction) -> DbResult<i64> {
    let sql = format!(
        "SELECT MAX(version) AS version FROM {}",
        tx.dialect().quote_identifier(SCHEMA_VERSION_TABLE)?
    );
    let row = tx.query_one(StatementDescriptor::raw(sql)).await?;
    match row {
        Some(row) => Ok(row.try_get::<Option<i64>>("version")?.unwrap_or(0)),
        None => Ok(0),
    }
}

async fn table_exists(tx: &mut Transaction) -> DbResult<bool> {
    let sql = tx.dialect().table_exists_sql();
    let row = tx
        .query_one(StatementDescriptor::raw_with_params(
            sql,
            [SCHEMA_VERSION_TABLE],
        ))
        .await?;
    Ok(row.is_some())
}

async fn ensure_table(coordinator: &Coordinator) -> DbResult<()> {
    coordinator
        .run(TransactionMode::ReadWrite, |tx| Box::pin(create_table_if_absent(tx)))
        .await
}

async fn create_table_if_absent(tx: &mut Transaction) -> DbResult<()> {
    if table_exists(tx).await? {
        return Ok(());
    }
    debug!(table = SCHEMA_VERSION_TABLE, "Creating schema version table");
    tx.execute(
        CreateTable::new(SCHEMA_VERSION_TABLE)
            .column(ColumnSpec::new("version", LogicalType::Integer).primary_key())
            .column(ColumnSpec::new("applied_at", LogicalType::Timestamp).not_null())
            .if_not_exists(),
    )
    .await?;
    Ok(())
}

async fn read_records(tx: &mut Transaction) -> DbResult<Vec<MigrationRecord>> {
    if !table_exists(tx).await? {
        return Ok(Vec::new());
    }
    let rows = tx
        .fetch_all(Select::from(SCHEMA_VERSION_TABLE).order_by("version"))
        .await?;
    rows.iter()
        .map(|row| {
            Ok(MigrationRecord {
                version: row.try_get("version")?,
                applied_at: row.try_get("applied_at")?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HandleOptions;
    use crate::db::pool::ConnectionManager;
    use crate::models::ConnectionParams;
    use crate::secret::EphemeralCodec;
    use std::sync::Arc;

    fn coordinator() -> Coordinator {
        let manager = ConnectionManager::new(
            ConnectionParams::sqlite_memory(),
            HandleOptions::default(),
            Arc::new(EphemeralCodec::new()),
        )
        .unwrap();
        Coordinator::new(Arc::new(manager))
    }

    fn migrations() -> Vec<Migration> {
        vec![
            Migration::new(1, "create users").statement(
                CreateTable::new("users")
                    .column(ColumnSpec::new("id", LogicalType::Integer).primary_key())
                    .column(ColumnSpec::new("name", LogicalType::Text)),
            ),
            Migration::new(2, "seed").statement(
                Insert::into("users").set("id", 1).set("name", "alice"),
            ),
        ]
    }

    #[test]
    fn test_validate_rejects_unordered_lists() {
        assert!(validate(&[]).is_ok());
        assert!(validate(&[Migration::new(0, "zero")]).is_err());
        assert!(validate(&[Migration::new(2, "b"), Migration::new(1, "a")]).is_err());
        assert!(validate(&[Migration::new(1, "a"), Migration::new(1, "a")]).is_err());
        assert!(validate(&[Migration::new(1, "a"), Migration::new(5, "b")]).is_err());
        assert!(validate(&[Migration::new(2, "b")]).is_err());
        assert!(validate(&[Migration::new(1, "a"), Migration::new(2, "b")]).is_ok());
    }

    #[tokio::test]
    async fn test_fresh_database_is_version_zero() {
        let c = coordinator();
        assert_eq!(current_version(&c).await.unwrap(), 0);
        assert!(applied_migrations(&c).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_then_reapply_is_noop() {
        let c = coordinator();
        let report = apply_pending(&c, &migrations()).await.unwrap();
        assert_eq!(report.from_version, 0);
        assert_eq!(report.to_version, 2);
        assert_eq!(report.applied, vec![1, 2]);

        let again = apply_pending(&c, &migrations()).await.unwrap();
        assert!(again.is_noop());
        assert_eq!(current_version(&c).await.unwrap(), 2);

        let prefix = apply_pending(&c, &migrations()[..1]).await.unwrap();
        assert!(prefix.is_noop());

        let records = applied_migrations(&c).await.unwrap();
        assert_eq!(
            records.iter().map(|r| r.version).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[tokio::test]
    async fn test_failed_migration_keeps_earlier_ones() {
        let c = coordinator();
        let mut list = migrations();
        list.push(
            Migration::new(3, "broken")
                .statement(StatementDescriptor::raw("ALTER TABLE users ADD COLUMN email TEXT"))
                .statement(StatementDescriptor::raw("INSERT INTO nowhere VALUES (1)")),
        );

        let err = apply_pending(&c, &list).await.unwrap_err();
        match err {
            DbError::Migration {
                version,
                last_applied,
                ..
            } => {
                assert_eq!(version, 3);
                assert_eq!(last_applied, 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(current_version(&c).await.unwrap(), 2);
    }
}
