//! Integration tests for schema versioning through the handle.

use normsql::models::ConnectionParams;
use normsql::{
    ColumnSpec, CreateTable, DatabaseHandle, DbError, EphemeralCodec, HandleOptions, Insert,
    LogicalType, Migration, Select, StatementDescriptor,
};
use std::sync::Arc;

fn open(path: &std::path::Path) -> DatabaseHandle {
    DatabaseHandle::open(
        ConnectionParams::sqlite(path),
        HandleOptions::default(),
        Arc::new(EphemeralCodec::new()),
    )
    .unwrap()
}

fn migrations() -> Vec<Migration> {
    vec![
        Migration::new(1, "create accounts").statement(
            CreateTable::new("accounts")
                .column(ColumnSpec::new("id", LogicalType::Integer).primary_key())
                .column(ColumnSpec::new("owner", LogicalType::VarChar(64)).not_null()),
        ),
        Migration::new(2, "add balance").statement(StatementDescriptor::raw(
            "ALTER TABLE accounts ADD COLUMN balance INTEGER NOT NULL DEFAULT 0",
        )),
        Migration::new(3, "seed")
            .statement(Insert::into("accounts").set("id", 1).set("owner", "alice"))
            .statement(Insert::into("accounts").set("id", 2).set("owner", "bob")),
    ]
}

#[tokio::test]
async fn test_migrate_applies_in_order_and_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir.path().join("m.db"));
    assert_eq!(db.current_version().await.unwrap(), 0);

    let report = db.migrate(&migrations()).await.unwrap();
    assert_eq!(report.from_version, 0);
    assert_eq!(report.to_version, 3);
    assert_eq!(report.applied, vec![1, 2, 3]);

    let row = db
        .query_one(Select::from("accounts").filter(normsql::Predicate::eq("id", 2)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.try_get::<i64>("balance").unwrap(), 0);

    let again = db.migrate(&migrations()).await.unwrap();
    assert!(again.is_noop());
    assert_eq!(again.to_version, 3);
    assert_eq!(db.query(Select::from("accounts")).await.unwrap().count(), 2);
}

#[tokio::test]
async fn test_version_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("m.db");
    {
        let db = open(&path);
        db.migrate(&migrations()[..2]).await.unwrap();
        db.close().await;
    }

    let db = open(&path);
    assert_eq!(db.current_version().await.unwrap(), 2);
    let report = db.migrate(&migrations()).await.unwrap();
    assert_eq!(report.from_version, 2);
    assert_eq!(report.applied, vec![3]);

    let records = db.applied_migrations().await.unwrap();
    let versions: Vec<i64> = records.iter().map(|r| r.version).collect();
    assert_eq!(versions, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_failed_migration_reports_last_applied() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir.path().join("m.db"));
    let mut list = migrations();
    list.push(
        Migration::new(4, "bad")
            .statement(Insert::into("accounts").set("id", 3).set("owner", "carol"))
            .statement(Insert::into("accounts").set("id", 3).set("owner", "dup")),
    );

    let err = db.migrate(&list).await.unwrap_err();
    match &err {
        DbError::Migration {
            version,
            last_applied,
            ..
        } => {
            assert_eq!(*version, 4);
            assert_eq!(*last_applied, 3);
        }
        other => panic!("expected a migration error, got {other:?}"),
    }
    // The failing migration is rolled back as a whole
    assert_eq!(db.current_version().await.unwrap(), 3);
    assert_eq!(db.query(Select::from("accounts")).await.unwrap().count(), 2);
}

#[tokio::test]
async fn test_unordered_list_is_rejected_before_running() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir.path().join("m.db"));
    let err = db
        .migrate(&[Migration::new(2, "b"), Migration::new(1, "a")])
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidInput { .. }));
    assert_eq!(db.current_version().await.unwrap(), 0);
}

#[tokio::test]
async fn test_gap_in_versions_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir.path().join("m.db"));
    let list = migrations();

    // 1 then 3: version 2 would never run
    let gapped = [list[0].clone(), list[2].clone()];
    let err = db.migrate(&gapped).await.unwrap_err();
    assert!(matches!(err, DbError::InvalidInput { .. }));
    assert_eq!(db.current_version().await.unwrap(), 0);

    // The full list still applies every version
    let report = db.migrate(&list).await.unwrap();
    assert_eq!(report.applied, vec![1, 2, 3]);
    let row = db
        .query_one(Select::from("accounts").filter(normsql::Predicate::eq("id", 1)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.try_get::<i64>("balance").unwrap(), 0);
}
