//! Integration tests for transaction coordination.
//!
//! Tests verify that:
//! - Committed work is visible and aborted work is not
//! - A handle admits one open transaction at a time
//! - Dropping an open transaction rolls it back
//! - Lock contention is retried within the policy's bound
//! - Timeouts and closing the handle end a transaction without wedging the handle

use futures_util::TryStreamExt;
use normsql::models::{ConnectionParams, TransactionState};
use normsql::{
    DatabaseHandle, DbError, EphemeralCodec, HandleOptions, Insert, RetryPolicy, Select,
};
use sqlx::Connection;
use sqlx::sqlite::SqliteConnection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn open_with(path: &Path, options: HandleOptions) -> DatabaseHandle {
    DatabaseHandle::open(
        ConnectionParams::sqlite(path),
        options,
        Arc::new(EphemeralCodec::new()),
    )
    .unwrap()
}

/// A handle on a fresh file with a `users(id, name)` table.
async fn setup(options: HandleOptions) -> (DatabaseHandle, PathBuf, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tx.db");
    let db = open_with(&path, options);
    db.execute("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)")
        .await
        .unwrap();
    (db, path, dir)
}

async fn user_count(db: &DatabaseHandle) -> usize {
    db.query(Select::from("users")).await.unwrap().count()
}

#[tokio::test]
async fn test_commit_makes_all_writes_visible() {
    let (db, _path, _dir) = setup(HandleOptions::default()).await;

    let mut tx = db.begin().await.unwrap();
    tx.execute(Insert::into("users").set("id", 1).set("name", "alice"))
        .await
        .unwrap();
    tx.execute(Insert::into("users").set("id", 2).set("name", "bob"))
        .await
        .unwrap();
    // Reads inside the transaction see its own writes
    let seen: Vec<_> = tx
        .query(Select::from("users"))
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(seen.len(), 2);
    tx.commit().await.unwrap();

    assert_eq!(user_count(&db).await, 2);
}

#[tokio::test]
async fn test_rollback_discards_writes() {
    let (db, _path, _dir) = setup(HandleOptions::default()).await;

    let mut tx = db.begin().await.unwrap();
    tx.execute(Insert::into("users").set("id", 1).set("name", "alice"))
        .await
        .unwrap();
    tx.rollback().await.unwrap();

    assert_eq!(user_count(&db).await, 0);
}

#[tokio::test]
async fn test_forced_abort_leaves_nothing() {
    let (db, _path, _dir) = setup(HandleOptions::default()).await;

    let mut tx = db.begin().await.unwrap();
    tx.execute(Insert::into("users").set("id", 1).set("name", "alice"))
        .await
        .unwrap();
    // Duplicate key aborts the transaction
    assert!(
        tx.execute(Insert::into("users").set("id", 1).set("name", "again"))
            .await
            .is_err()
    );
    assert_eq!(tx.state(), TransactionState::Aborted);

    let err = tx.commit().await.unwrap_err();
    assert!(matches!(err, DbError::Transaction { .. }));
    assert_eq!(user_count(&db).await, 0);
}

#[tokio::test]
async fn test_scoped_transaction_rolls_back_on_error() {
    let (db, _path, _dir) = setup(HandleOptions::default()).await;

    let result: Result<(), DbError> = db
        .transaction(|tx| {
            Box::pin(async move {
                tx.execute(Insert::into("users").set("id", 1).set("name", "alice"))
                    .await?;
                Err::<(), _>(DbError::invalid_input("caller gave up"))
            })
        })
        .await;
    assert!(matches!(result, Err(DbError::InvalidInput { .. })));
    assert_eq!(user_count(&db).await, 0);

    let id = db
        .transaction(|tx| {
            Box::pin(async move {
                tx.execute(Insert::into("users").set("name", "bob")).await?;
                tx.last_insert_id().await
            })
        })
        .await
        .unwrap();
    assert_eq!(id, 1);
    assert_eq!(user_count(&db).await, 1);
}

#[tokio::test]
async fn test_nested_begin_fails() {
    let (db, _path, _dir) = setup(HandleOptions::default()).await;

    let tx = db.begin().await.unwrap();
    let err = db.begin().await.unwrap_err();
    assert!(matches!(err, DbError::TransactionAlreadyOpen { .. }));

    // Implicit transactions from the holder are nested begins too
    let err = db.execute("DELETE FROM users").await.unwrap_err();
    assert!(matches!(err, DbError::TransactionAlreadyOpen { .. }));

    // Clones share the handle's admission
    let clone = db.clone();
    assert!(matches!(
        clone.begin().await,
        Err(DbError::TransactionAlreadyOpen { .. })
    ));
    tx.commit().await.unwrap();
    assert!(db.begin().await.is_ok());
}

#[tokio::test]
async fn test_concurrent_begin_waits_for_holder() {
    let (db, _path, _dir) = setup(HandleOptions::default()).await;
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    let mut tx = db.begin().await.unwrap();
    tx.execute(Insert::into("users").set("id", 1).set("name", "first"))
        .await
        .unwrap();

    let waiter = {
        let db = db.clone();
        let order = Arc::clone(&order);
        tokio::spawn(async move {
            let mut tx = db.begin().await.unwrap();
            order.lock().unwrap().push("second began");
            let rows = tx.query_one(Select::from("users")).await.unwrap();
            tx.commit().await.unwrap();
            rows
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_finished());
    order.lock().unwrap().push("first committing");
    tx.commit().await.unwrap();

    let seen = waiter.await.unwrap();
    assert_eq!(
        seen.unwrap().try_get::<String>("name").unwrap(),
        "first",
        "second transaction sees the committed write"
    );
    assert_eq!(
        *order.lock().unwrap(),
        vec!["first committing", "second began"]
    );
}

#[tokio::test]
async fn test_admission_wait_is_bounded() {
    let options = HandleOptions::default().with_acquire_timeout(Duration::from_secs(1));
    let (db, _path, _dir) = setup(options).await;

    let tx = db.begin().await.unwrap();
    let other = db.clone();
    let err = tokio::spawn(async move { other.begin().await.map(|_| ()) })
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, DbError::Timeout { .. }));
    tx.rollback().await.unwrap();
}

#[tokio::test]
async fn test_dropped_transaction_rolls_back() {
    let (db, _path, _dir) = setup(HandleOptions::default()).await;

    {
        let mut tx = db.begin().await.unwrap();
        tx.execute(Insert::into("users").set("id", 1).set("name", "alice"))
            .await
            .unwrap();
    }

    // Waits for the spawned rollback before it is admitted
    assert_eq!(user_count(&db).await, 0);
}

#[tokio::test]
async fn test_cancelled_body_rolls_back() {
    let (db, _path, _dir) = setup(HandleOptions::default()).await;

    let slow = db.transaction(|tx| {
        Box::pin(async move {
            tx.execute(Insert::into("users").set("id", 1).set("name", "alice"))
                .await?;
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, DbError>(())
        })
    });
    let timed_out = tokio::time::timeout(Duration::from_millis(100), slow).await;
    assert!(timed_out.is_err());

    assert_eq!(user_count(&db).await, 0);
}

/// Hold the write lock from a connection outside the handle.
async fn lock_database(path: &Path) -> SqliteConnection {
    let mut conn = SqliteConnection::connect(&format!("sqlite:{}", path.display()))
        .await
        .unwrap();
    sqlx::query("BEGIN IMMEDIATE")
        .execute(&mut conn)
        .await
        .unwrap();
    conn
}

fn contention_options(max_attempts: u32) -> HandleOptions {
    HandleOptions::default()
        .with_busy_timeout(Duration::from_millis(20))
        .with_retry(RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        })
}

/// Hold a shared read lock from a connection outside the handle.
async fn hold_read_lock(path: &Path) -> SqliteConnection {
    let mut conn = SqliteConnection::connect(&format!("sqlite:{}", path.display()))
        .await
        .unwrap();
    sqlx::query("BEGIN").execute(&mut conn).await.unwrap();
    sqlx::query("SELECT count(*) FROM users")
        .fetch_one(&mut conn)
        .await
        .unwrap();
    conn
}

#[tokio::test]
async fn test_lock_busy_is_retried_until_released() {
    let (db, path, _dir) = setup(contention_options(5)).await;
    // The reader lets BEGIN IMMEDIATE through but keeps COMMIT busy
    let mut reader = hold_read_lock(&path).await;

    let attempts = Arc::new(AtomicU32::new(0));
    let writer = {
        let db = db.clone();
        let attempts = Arc::clone(&attempts);
        tokio::spawn(async move {
            db.transaction(move |tx| {
                attempts.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move {
                    tx.execute(Insert::into("users").set("id", 1).set("name", "alice"))
                        .await
                })
            })
            .await
        })
    };

    // Release after the first attempt has hit the busy lock
    tokio::time::sleep(Duration::from_millis(40)).await;
    sqlx::query("COMMIT").execute(&mut reader).await.unwrap();

    assert_eq!(writer.await.unwrap().unwrap(), 1);
    assert!(attempts.load(Ordering::SeqCst) >= 2);
    assert_eq!(user_count(&db).await, 1);
}

#[tokio::test]
async fn test_lock_busy_exhausts_retries() {
    let (db, path, _dir) = setup(contention_options(3)).await;
    let _blocker = lock_database(&path).await;

    let err = db
        .execute(Insert::into("users").set("id", 1).set("name", "alice"))
        .await
        .unwrap_err();
    match err {
        DbError::TransactionFailed { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("expected TransactionFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_reads_are_not_blocked_by_deferred_writer() {
    let (db, path, _dir) = setup(contention_options(3)).await;
    db.execute(Insert::into("users").set("id", 1).set("name", "alice"))
        .await
        .unwrap();
    let _blocker = lock_database(&path).await;

    // A reserved lock still admits readers
    assert_eq!(user_count(&db).await, 1);
}

#[tokio::test]
async fn test_close_with_open_transaction() {
    let (db, path, _dir) = setup(HandleOptions::default()).await;

    let mut tx = db.begin().await.unwrap();
    tx.execute(Insert::into("users").set("id", 1).set("name", "alice"))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(3), db.close())
        .await
        .expect("close does not wait for the open transaction");
    assert!(!db.is_alive().await);

    // The transaction can no longer commit; its work is rolled back
    let err = tx.commit().await.unwrap_err();
    assert!(err.is_connection_error());
    assert!(db.begin().await.unwrap_err().is_connection_error());

    let reopened = open_with(&path, HandleOptions::default());
    assert_eq!(user_count(&reopened).await, 0);
}

#[tokio::test]
async fn test_statement_timeout_aborts_and_handle_recovers() {
    let options = HandleOptions::default().with_query_timeout(Duration::from_millis(500));
    let (db, _path, _dir) = setup(options).await;
    let runaway = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c \
                   WHERE x < 200000000) SELECT count(*) AS n FROM c";

    let mut tx = db.begin().await.unwrap();
    tx.execute(Insert::into("users").set("id", 1).set("name", "alice"))
        .await
        .unwrap();
    let err = tx.query_one(runaway).await.unwrap_err();
    assert!(matches!(err, DbError::Timeout { .. }), "got {err:?}");
    assert_eq!(tx.state(), TransactionState::Aborted);
    drop(tx);

    // The engine stops the runaway statement, so the next write goes straight through
    let started = Instant::now();
    db.execute(Insert::into("users").set("id", 2).set("name", "bob"))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));

    let ids: Vec<i64> = db
        .query(Select::from("users"))
        .await
        .unwrap()
        .map(|r| r.try_get("id").unwrap())
        .collect();
    assert_eq!(ids, vec![2]);
}
