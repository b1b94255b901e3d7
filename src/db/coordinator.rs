//! Transaction coordination.
//!
//! A [`Coordinator`] admits at most one open [`Transaction`] per database handle.
//! Other callers queue on the admission lock; the caller that already holds the open
//! transaction gets [`DbError::TransactionAlreadyOpen`] instead of deadlocking on
//! itself. [`Coordinator::run`] wraps a body in a transaction and retries the whole
//! body on transient contention.
//!
//! Every failure path ends in a rollback. Dropping an open transaction (a cancelled
//! future, a panic) rolls it back in a spawned task that keeps admission until the
//! rollback finishes; without a runtime the connection is closed instead, which
//! makes the engine discard the uncommitted work.

use crate::db::dialect::{Dialect, RenderedStatement};
use crate::db::executor::{self, RowStream};
use crate::db::pool::{ConnectionManager, ScopedConnection};
use crate::error::{DbError, DbResult};
use crate::models::{Row, StatementDescriptor, TransactionMode, TransactionState};
use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Who holds the open transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Task(tokio::task::Id),
    Thread(std::thread::ThreadId),
}

impl Owner {
    fn current() -> Self {
        match tokio::task::try_id() {
            Some(id) => Owner::Task(id),
            None => Owner::Thread(std::thread::current().id()),
        }
    }
}

type OwnerSlot = Arc<std::sync::Mutex<Option<Owner>>>;

fn set_owner(slot: &OwnerSlot, owner: Option<Owner>) {
    *slot.lock().unwrap_or_else(PoisonError::into_inner) = owner;
}

/// Permission to run the handle's single open transaction.
#[derive(Debug)]
pub(crate) struct Admission {
    _guard: OwnedMutexGuard<()>,
    owner: OwnerSlot,
}

impl Admission {
    fn clear_owner(&self) {
        set_owner(&self.owner, None);
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        // Runs before the guard field is released
        self.clear_owner();
    }
}

/// Serializes transactions on one database handle.
pub struct Coordinator {
    manager: Arc<ConnectionManager>,
    dialect: &'static dyn Dialect,
    admission: Arc<Mutex<()>>,
    owner: OwnerSlot,
    /// Backups newer than the last restored one.
    orphaned_backups: AtomicUsize,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("database", &self.manager.params().label())
            .field("dialect", &self.dialect.name())
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        let dialect = crate::db::dialect::for_type(manager.db_type());
        Self {
            manager,
            dialect,
            admission: Arc::new(Mutex::new(())),
            owner: Arc::new(std::sync::Mutex::new(None)),
            orphaned_backups: AtomicUsize::new(0),
        }
    }

    pub fn dialect(&self) -> &'static dyn Dialect {
        self.dialect
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub(crate) fn record_restore(&self, nth: usize) {
        self.orphaned_backups.store(nth, Ordering::Release);
    }

    pub(crate) fn take_orphaned_backups(&self) -> usize {
        self.orphaned_backups.swap(0, Ordering::AcqRel)
    }

    /// Close the handle's pool.
    ///
    /// An open transaction does not hold this up: its connection is closed when
    /// the transaction ends, and its next operation rolls it back and fails.
    pub async fn close(&self) {
        let in_flight = self.admission.try_lock().is_err();
        let wait = if in_flight {
            Duration::ZERO
        } else {
            self.manager.options().acquire_timeout()
        };
        self.manager.close(wait).await;
    }

    /// Wait for the admission lock, bounded by the acquire timeout.
    pub(crate) async fn admit(&self) -> DbResult<Admission> {
        let me = Owner::current();
        let holder = *self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        if holder == Some(me) {
            return Err(DbError::transaction_already_open(
                self.manager.params().label(),
            ));
        }

        let wait = self.manager.options().acquire_timeout();
        let guard = tokio::time::timeout(wait, Arc::clone(&self.admission).lock_owned())
            .await
            .map_err(|_| DbError::timeout("transaction admission", wait.as_millis() as u64))?;
        set_owner(&self.owner, Some(me));
        Ok(Admission {
            _guard: guard,
            owner: Arc::clone(&self.owner),
        })
    }

    /// Open a transaction. Waits while another caller holds one.
    pub async fn begin(&self, mode: TransactionMode) -> DbResult<Transaction> {
        let admission = self.admit().await?;
        let mut conn = self.manager.acquire().await?;
        let limit = self.manager.options().query_timeout;
        executor::execute_control(&mut conn, self.dialect, self.dialect.begin_sql(mode), limit)
            .await?;

        let tx = Transaction {
            id: format!("tx_{}", uuid::Uuid::new_v4().simple()),
            database: self.manager.params().label(),
            state: TransactionState::Open,
            mode,
            dialect: self.dialect,
            manager: Arc::clone(&self.manager),
            query_timeout: limit,
            conn: Some(conn),
            admission: Some(admission),
            cursor: None,
            doomed: AtomicBool::new(false),
            broken: AtomicBool::new(false),
        };
        debug!(
            transaction_id = %tx.id,
            database = %tx.database,
            mode = ?mode,
            "Transaction started"
        );
        Ok(tx)
    }

    /// Run `body` in a transaction, committing when it succeeds.
    ///
    /// On transient contention the transaction is rolled back and the whole body
    /// runs again, up to the retry policy's attempt bound, with exponential backoff
    /// between attempts. Exhausting the bound yields
    /// [`DbError::TransactionFailed`]. Any other error rolls back and propagates.
    ///
    /// The body may run more than once, so it should own what it captures:
    ///
    /// ```ignore
    /// coordinator.run(TransactionMode::ReadWrite, move |tx| {
    ///     let stmt = stmt.clone();
    ///     Box::pin(async move { tx.execute(stmt).await })
    /// }).await?;
    /// ```
    pub async fn run<T, F>(&self, mode: TransactionMode, mut body: F) -> DbResult<T>
    where
        F: for<'t> FnMut(&'t mut Transaction) -> BoxFuture<'t, DbResult<T>>,
    {
        let policy = self.manager.options().retry;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match self.attempt(mode, &mut body).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if !err.is_transient() {
                return Err(err);
            }
            if attempt >= policy.max_attempts {
                warn!(
                    database = %self.manager.params().label(),
                    attempts = attempt,
                    error = %err,
                    "Transaction retries exhausted"
                );
                return Err(DbError::transaction_failed(attempt, err.to_string()));
            }
            let delay = policy.backoff(attempt);
            warn!(
                database = %self.manager.params().label(),
                attempt = attempt,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient contention, retrying transaction"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt<T, F>(&self, mode: TransactionMode, body: &mut F) -> DbResult<T>
    where
        F: for<'t> FnMut(&'t mut Transaction) -> BoxFuture<'t, DbResult<T>>,
    {
        let mut tx = self.begin(mode).await?;
        match body(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if tx.state().is_open() {
                    if let Err(rb) = tx.rollback().await {
                        warn!(error = %rb, "Rollback after failed body also failed");
                    }
                }
                Err(e)
            }
        }
    }
}

/// An open unit of work on one handle.
///
/// Statements run in submission order on the transaction's own connection and see
/// its earlier writes. A failed statement rolls the transaction back; any later
/// operation reports a [`DbError::Transaction`] error.
pub struct Transaction {
    id: String,
    database: String,
    state: TransactionState,
    mode: TransactionMode,
    dialect: &'static dyn Dialect,
    manager: Arc<ConnectionManager>,
    query_timeout: Duration,
    conn: Option<ScopedConnection>,
    admission: Option<Admission>,
    /// Statement backing the current [`RowStream`].
    cursor: Option<RenderedStatement>,
    /// Set by a failed [`RowStream`]; the rollback happens on the next operation.
    doomed: AtomicBool,
    broken: AtomicBool,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("database", &self.database)
            .field("state", &self.state)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl Transaction {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    pub fn dialect(&self) -> &'static dyn Dialect {
        self.dialect
    }

    /// Run a statement and return the number of affected rows.
    pub async fn execute(&mut self, stmt: impl Into<StatementDescriptor>) -> DbResult<u64> {
        self.ensure_usable().await?;
        let rendered = self.dialect.render(&stmt.into())?;
        let (dialect, limit) = (self.dialect, self.query_timeout);
        let conn = self.connection()?;
        let result = executor::execute(conn, dialect, &rendered, limit).await;
        self.guard(result).await
    }

    /// Run a query; rows are fetched as the stream is polled.
    pub async fn query(
        &mut self,
        stmt: impl Into<StatementDescriptor>,
    ) -> DbResult<RowStream<'_>> {
        self.ensure_usable().await?;
        let rendered = self.dialect.render(&stmt.into())?;
        let Self {
            id,
            conn,
            cursor,
            dialect,
            query_timeout,
            doomed,
            broken,
            ..
        } = self;
        let conn = conn
            .as_mut()
            .ok_or_else(|| DbError::transaction("Transaction has no connection", id.clone()))?;
        let stmt = cursor.insert(rendered);
        RowStream::new(conn, *dialect, stmt, *query_timeout, doomed, broken)
    }

    /// Run a query and return its first row, if any.
    pub async fn query_one(
        &mut self,
        stmt: impl Into<StatementDescriptor>,
    ) -> DbResult<Option<Row>> {
        self.ensure_usable().await?;
        let rendered = self.dialect.render(&stmt.into())?;
        let (dialect, limit) = (self.dialect, self.query_timeout);
        let conn = self.connection()?;
        let result = executor::fetch_optional(conn, dialect, &rendered, limit).await;
        self.guard(result).await
    }

    /// Run a query and collect every row.
    pub(crate) async fn fetch_all(
        &mut self,
        stmt: impl Into<StatementDescriptor>,
    ) -> DbResult<Vec<Row>> {
        self.ensure_usable().await?;
        let rendered = self.dialect.render(&stmt.into())?;
        let (dialect, limit) = (self.dialect, self.query_timeout);
        let conn = self.connection()?;
        let result = executor::fetch_all(conn, dialect, &rendered, limit).await;
        self.guard(result).await
    }

    /// Key generated by the most recent auto-increment insert on this transaction.
    pub async fn last_insert_id(&mut self) -> DbResult<i64> {
        let sql = self.dialect.last_insert_id_sql();
        let row = self.query_one(StatementDescriptor::raw(sql)).await?;
        row.as_ref()
            .and_then(|r| r.get_index(0))
            .and_then(|v| v.as_i64())
            .ok_or_else(|| DbError::internal("Engine returned no last insert id"))
    }

    /// Make the transaction's writes durable and visible.
    pub async fn commit(mut self) -> DbResult<()> {
        self.ensure_usable().await?;
        let (dialect, limit) = (self.dialect, self.query_timeout);
        let conn = self.connection()?;
        let result = executor::execute_control(conn, dialect, dialect.commit_sql(), limit).await;
        self.guard(result).await?;

        self.state = TransactionState::Committed;
        self.release();
        debug!(transaction_id = %self.id, "Transaction committed");
        Ok(())
    }

    /// Discard the transaction's writes. A no-op once it has already aborted.
    pub async fn rollback(mut self) -> DbResult<()> {
        match self.state {
            TransactionState::Open => self.abort().await,
            TransactionState::Aborted => Ok(()),
            TransactionState::Committed => Err(DbError::transaction(
                "Transaction already committed",
                self.id.clone(),
            )),
        }
    }

    fn connection(&mut self) -> DbResult<&mut ScopedConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| DbError::transaction("Transaction has no connection", self.id.clone()))
    }

    /// Fail unless the transaction can take another statement.
    async fn ensure_usable(&mut self) -> DbResult<()> {
        if !self.state.is_open() {
            return Err(DbError::transaction(
                format!("Transaction is {:?}", self.state).to_lowercase(),
                self.id.clone(),
            ));
        }
        if self.manager.is_closed() {
            if let Err(e) = self.abort().await {
                warn!(transaction_id = %self.id, error = %e, "Rollback after close failed");
            }
            return Err(DbError::connection(
                format!("Database '{}' was closed", self.database),
                "The transaction was rolled back; open a new handle",
            ));
        }
        if self.doomed.load(Ordering::Acquire) {
            // Already reporting the stream's failure; a rollback error adds nothing
            let _ = self.abort().await;
            return Err(DbError::transaction(
                "Transaction aborted after a failed statement",
                self.id.clone(),
            ));
        }
        Ok(())
    }

    /// Abort on a failed round trip.
    async fn guard<T>(&mut self, result: DbResult<T>) -> DbResult<T> {
        if let Err(e) = &result {
            debug!(transaction_id = %self.id, error = %e, "Statement failed, rolling back");
            if let Err(rb) = self.abort().await {
                warn!(transaction_id = %self.id, error = %rb, "Rollback failed");
            }
        }
        result
    }

    /// Roll back and give up the connection and admission.
    async fn abort(&mut self) -> DbResult<()> {
        self.state = TransactionState::Aborted;
        self.cursor = None;
        let Some(mut conn) = self.conn.take() else {
            self.admission = None;
            return Ok(());
        };
        if self.broken.load(Ordering::Acquire) {
            conn.mark_broken();
        }

        let result = if conn.is_broken() {
            // Closing the connection discards the uncommitted work
            Ok(())
        } else {
            let sql = self.dialect.rollback_sql();
            let result =
                executor::execute_control(&mut conn, self.dialect, sql, self.query_timeout).await;
            if result.is_err() {
                conn.mark_broken();
            }
            result
        };
        drop(conn);
        self.admission = None;
        debug!(transaction_id = %self.id, "Transaction rolled back");
        result
    }

    fn release(&mut self) {
        self.cursor = None;
        self.conn = None;
        self.admission = None;
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.state.is_open() {
            return;
        }
        self.state = TransactionState::Aborted;
        self.cursor = None;
        let admission = self.admission.take();
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        // The dropping caller may begin again; it queues behind the rollback
        if let Some(admission) = &admission {
            admission.clear_owner();
        }
        if self.broken.load(Ordering::Acquire) || conn.is_broken() {
            conn.mark_broken();
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            conn.mark_broken();
            return;
        };
        info!(
            transaction_id = %self.id,
            database = %self.database,
            "Open transaction dropped, rolling back"
        );
        let (dialect, limit, id) = (self.dialect, self.query_timeout, self.id.clone());
        runtime.spawn(async move {
            let result =
                executor::execute_control(&mut conn, dialect, dialect.rollback_sql(), limit).await;
            if let Err(e) = result {
                warn!(transaction_id = %id, error = %e, "Rollback on drop failed");
                conn.mark_broken();
            }
            drop(conn);
            drop(admission);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HandleOptions;
    use crate::models::ConnectionParams;
    use crate::secret::EphemeralCodec;

    fn coordinator() -> Coordinator {
        let manager = ConnectionManager::new(
            ConnectionParams::sqlite_memory(),
            HandleOptions::default(),
            Arc::new(EphemeralCodec::new()),
        )
        .unwrap();
        Coordinator::new(Arc::new(manager))
    }

    #[tokio::test]
    async fn test_begin_commit() {
        let c = coordinator();
        let mut tx = c.begin(TransactionMode::ReadWrite).await.unwrap();
        assert!(tx.id().starts_with("tx_"));
        assert_eq!(tx.state(), TransactionState::Open);
        tx.execute("CREATE TABLE t (id INTEGER)").await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = c.begin(TransactionMode::ReadOnly).await.unwrap();
        assert!(tx.query_one("SELECT * FROM t").await.unwrap().is_none());
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_nested_begin_same_owner() {
        let c = coordinator();
        let tx = c.begin(TransactionMode::ReadWrite).await.unwrap();
        let err = c.begin(TransactionMode::ReadWrite).await.unwrap_err();
        assert!(matches!(err, DbError::TransactionAlreadyOpen { .. }));
        drop(tx);

        // Owner is cleared at once; the new transaction queues behind the rollback
        let tx = c.begin(TransactionMode::ReadWrite).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_statement_aborts() {
        let c = coordinator();
        let mut tx = c.begin(TransactionMode::ReadWrite).await.unwrap();
        assert!(tx.execute("INSERT INTO missing VALUES (1)").await.is_err());
        assert_eq!(tx.state(), TransactionState::Aborted);

        let err = tx.execute("SELECT 1").await.unwrap_err();
        assert!(matches!(err, DbError::Transaction { .. }));
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_render_error_keeps_transaction_open() {
        let c = coordinator();
        let mut tx = c.begin(TransactionMode::ReadWrite).await.unwrap();
        assert!(tx.execute("   ").await.is_err());
        assert_eq!(tx.state(), TransactionState::Open);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_does_not_retry_permanent_errors() {
        let c = coordinator();
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let err = c
            .run(TransactionMode::ReadWrite, move |tx| {
                counter.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move { tx.execute("SELECT * FROM missing").await })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Database { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_with_open_transaction_returns() {
        let c = coordinator();
        let mut tx = c.begin(TransactionMode::ReadWrite).await.unwrap();
        tx.execute("CREATE TABLE t (id INTEGER)").await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), c.close())
            .await
            .expect("close returns while a transaction is open");

        let err = tx.execute("INSERT INTO t VALUES (1)").await.unwrap_err();
        assert!(err.is_connection_error());
        assert_eq!(tx.state(), TransactionState::Aborted);
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_last_insert_id() {
        let c = coordinator();
        let mut tx = c.begin(TransactionMode::ReadWrite).await.unwrap();
        tx.execute("CREATE TABLE t (id INTEGER PRIMARY KEY AUTOINCREMENT, v TEXT)")
            .await
            .unwrap();
        tx.execute("INSERT INTO t (v) VALUES ('a')").await.unwrap();
        tx.execute("INSERT INTO t (v) VALUES ('b')").await.unwrap();
        assert_eq!(tx.last_insert_id().await.unwrap(), 2);
        tx.commit().await.unwrap();
    }
}
