//! Integration tests for SQLite backup and restore.

use normsql::models::ConnectionParams;
use normsql::{DatabaseHandle, DbError, EphemeralCodec, HandleOptions, Insert, Select};
use std::sync::Arc;
use std::time::Duration;

fn open(params: ConnectionParams, options: HandleOptions) -> DatabaseHandle {
    DatabaseHandle::open(params, options, Arc::new(EphemeralCodec::new())).unwrap()
}

async fn count(db: &DatabaseHandle) -> usize {
    db.query(Select::from("notes")).await.unwrap().count()
}

#[tokio::test]
async fn test_backup_then_restore() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.db");
    let db = open(ConnectionParams::sqlite(&path), HandleOptions::default());
    db.execute("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT)")
        .await
        .unwrap();
    db.execute(Insert::into("notes").set("id", 1).set("body", "first"))
        .await
        .unwrap();

    let first = db.backup().await.unwrap();
    assert!(first.exists());
    assert_eq!(first.parent(), Some(dir.path()));

    db.execute(Insert::into("notes").set("id", 2).set("body", "second"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(2)).await;
    let second = db.backup().await.unwrap();

    let listed = db.list_backups().await.unwrap();
    assert_eq!(listed, vec![second.clone(), first.clone()]);

    db.execute(Insert::into("notes").set("id", 3).set("body", "third"))
        .await
        .unwrap();
    assert_eq!(count(&db).await, 3);

    // Oldest backup
    let restored = db.restore(1).await.unwrap();
    assert_eq!(restored, first);
    assert_eq!(count(&db).await, 1);

    let restored = db.restore(0).await.unwrap();
    assert_eq!(restored, second);
    assert_eq!(count(&db).await, 2);
}

#[tokio::test]
async fn test_backup_directory_option() {
    let dir = tempfile::tempdir().unwrap();
    let backups = dir.path().join("backups");
    let db = open(
        ConnectionParams::sqlite(dir.path().join("notes.db")),
        HandleOptions::default().with_backup_directory(&backups),
    );
    db.execute("CREATE TABLE notes (id INTEGER)").await.unwrap();

    let written = db.backup().await.unwrap();
    assert_eq!(written.parent(), Some(backups.as_path()));
    assert_eq!(db.list_backups().await.unwrap(), vec![written]);
}

#[tokio::test]
async fn test_restore_without_backups_fails() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(
        ConnectionParams::sqlite(dir.path().join("notes.db")),
        HandleOptions::default(),
    );
    db.execute("CREATE TABLE notes (id INTEGER)").await.unwrap();

    assert!(db.list_backups().await.unwrap().is_empty());
    let err = db.restore(0).await.unwrap_err();
    assert!(matches!(err, DbError::InvalidInput { .. }));
    // The handle is untouched
    assert_eq!(count(&db).await, 0);
}

#[tokio::test]
async fn test_memory_database_cannot_be_backed_up() {
    let db = open(ConnectionParams::sqlite_memory(), HandleOptions::default());
    assert!(matches!(
        db.backup().await,
        Err(DbError::InvalidInput { .. })
    ));
    assert!(matches!(
        db.restore(0).await,
        Err(DbError::InvalidInput { .. })
    ));
}

#[tokio::test]
async fn test_backup_after_restore_drops_newer_backups() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(
        ConnectionParams::sqlite(dir.path().join("notes.db")),
        HandleOptions::default(),
    );
    db.execute("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT)")
        .await
        .unwrap();

    let mut written = Vec::new();
    for id in 1..=3 {
        db.execute(Insert::into("notes").set("id", id).set("body", "n"))
            .await
            .unwrap();
        written.push(db.backup().await.unwrap());
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    // Back to the state with one note; the two newer backups are kept for now
    db.restore(2).await.unwrap();
    assert_eq!(count(&db).await, 1);
    assert_eq!(db.list_backups().await.unwrap().len(), 3);

    db.execute(Insert::into("notes").set("id", 10).set("body", "branch"))
        .await
        .unwrap();
    let latest = db.backup().await.unwrap();
    assert!(!written[1].exists());
    assert!(!written[2].exists());
    assert_eq!(
        db.list_backups().await.unwrap(),
        vec![latest.clone(), written[0].clone()]
    );

    // Only the first backup after a restore prunes
    tokio::time::sleep(Duration::from_millis(2)).await;
    let next = db.backup().await.unwrap();
    assert_eq!(
        db.list_backups().await.unwrap(),
        vec![next, latest, written[0].clone()]
    );
}
