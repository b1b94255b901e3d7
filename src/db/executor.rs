//! Statement execution.
//!
//! The functions in this module run one rendered statement on a checked-out
//! connection, bound by the query timeout, and normalize the result into [`Row`]s.
//! [`StatementExecutor`] is the caller-facing surface: outside an explicit
//! transaction each call runs in an implicit single-statement transaction, so
//! admission and retry apply to it too.

use crate::db::coordinator::Coordinator;
use crate::db::dialect::{Dialect, RenderedStatement};
use crate::db::params::BindValues;
use crate::db::pool::ScopedConnection;
use crate::db::types::DecodeRow;
use crate::error::{DbError, DbResult};
use crate::models::{Row, StatementDescriptor, TransactionMode};
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt, TryStreamExt};
use sqlx::Executor;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::time::{Sleep, timeout};
use tracing::debug;

/// Run a statement that returns no rows; returns the affected row count.
///
/// Statements without parameters go through the engine's simple-query path, which
/// accepts several `;`-separated statements (SQLite DDL with trailing indexes).
pub(crate) async fn execute(
    conn: &mut ScopedConnection,
    dialect: &dyn Dialect,
    stmt: &RenderedStatement,
    limit: Duration,
) -> DbResult<u64> {
    debug!(sql = %stmt.sql, params = stmt.params.len(), "Executing statement");
    let start = Instant::now();
    let c = conn.connection()?;
    let result = timeout(limit, async {
        with_connection!(c, c => {
            if stmt.params.is_empty() {
                (&mut **c).execute(stmt.sql.as_str()).await.map(|r| r.rows_affected())
            } else {
                sqlx::query(&stmt.sql)
                    .bind_values(&stmt.params)
                    .execute(&mut **c)
                    .await
                    .map(|r| r.rows_affected())
            }
        })
    })
    .await;
    let affected = settle(conn, dialect, result, "execute", limit)?;
    debug!(
        rows_affected = affected,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Statement executed"
    );
    Ok(affected)
}

/// Run a transaction-control statement such as `BEGIN IMMEDIATE`.
pub(crate) async fn execute_control(
    conn: &mut ScopedConnection,
    dialect: &dyn Dialect,
    sql: &str,
    limit: Duration,
) -> DbResult<()> {
    debug!(sql = %sql, "Transaction control");
    let c = conn.connection()?;
    let result = timeout(limit, async {
        with_connection!(c, c => (&mut **c).execute(sql).await.map(|_| ()))
    })
    .await;
    settle(conn, dialect, result, sql, limit)
}

/// Fetch every row of a query.
pub(crate) async fn fetch_all(
    conn: &mut ScopedConnection,
    dialect: &dyn Dialect,
    stmt: &RenderedStatement,
    limit: Duration,
) -> DbResult<Vec<Row>> {
    debug!(sql = %stmt.sql, params = stmt.params.len(), "Executing query");
    let c = conn.connection()?;
    let result = timeout(limit, async {
        let mut columns = None;
        with_connection!(c, c => {
            sqlx::query(&stmt.sql)
                .bind_values(&stmt.params)
                .fetch_all(&mut **c)
                .await
                .map(|rows| rows.iter().map(|r| r.to_row(dialect, &mut columns)).collect())
        })
    })
    .await;
    settle(conn, dialect, result, "query", limit)
}

/// Fetch the first row of a query, if any.
pub(crate) async fn fetch_optional(
    conn: &mut ScopedConnection,
    dialect: &dyn Dialect,
    stmt: &RenderedStatement,
    limit: Duration,
) -> DbResult<Option<Row>> {
    debug!(sql = %stmt.sql, params = stmt.params.len(), "Executing query");
    let c = conn.connection()?;
    let result = timeout(limit, async {
        with_connection!(c, c => {
            sqlx::query(&stmt.sql)
                .bind_values(&stmt.params)
                .fetch_optional(&mut **c)
                .await
                .map(|row| row.map(|r| r.to_row(dialect, &mut None)))
        })
    })
    .await;
    settle(conn, dialect, result, "query", limit)
}

/// Map a bounded round trip's outcome, marking the connection broken when it can
/// no longer be trusted.
fn settle<T>(
    conn: &mut ScopedConnection,
    dialect: &dyn Dialect,
    result: Result<Result<T, sqlx::Error>, tokio::time::error::Elapsed>,
    operation: &str,
    limit: Duration,
) -> DbResult<T> {
    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            let io = matches!(e, sqlx::Error::Io(_));
            let err = dialect.classify_error(e);
            if io || err.is_connection_error() {
                conn.mark_broken();
            }
            Err(err)
        }
        Err(_) => {
            conn.mark_broken();
            Err(DbError::timeout(operation, limit.as_millis() as u64))
        }
    }
}

/// Rows of a query run inside a transaction, fetched lazily.
///
/// Each row must arrive within the query timeout. A failure ends the stream and
/// aborts the transaction it borrows: the rollback runs on the transaction's next
/// operation (or when it is dropped).
pub struct RowStream<'t> {
    inner: BoxStream<'t, Result<Row, sqlx::Error>>,
    dialect: &'static dyn Dialect,
    limit: Duration,
    deadline: Option<Pin<Box<Sleep>>>,
    doomed: &'t AtomicBool,
    broken: &'t AtomicBool,
    done: bool,
}

impl<'t> RowStream<'t> {
    pub(crate) fn new(
        conn: &'t mut ScopedConnection,
        dialect: &'static dyn Dialect,
        stmt: &'t RenderedStatement,
        limit: Duration,
        doomed: &'t AtomicBool,
        broken: &'t AtomicBool,
    ) -> DbResult<Self> {
        debug!(sql = %stmt.sql, params = stmt.params.len(), "Streaming query");
        let c = conn.connection()?;
        let inner = with_connection!(c, c => {
            let mut columns = None;
            sqlx::query(&stmt.sql)
                .bind_values(&stmt.params)
                .fetch(&mut **c)
                .map_ok(move |row| row.to_row(dialect, &mut columns))
                .boxed()
        });
        Ok(Self {
            inner,
            dialect,
            limit,
            deadline: None,
            doomed,
            broken,
            done: false,
        })
    }

    fn fail(&mut self, err: DbError, broken: bool) -> DbError {
        self.done = true;
        self.doomed.store(true, Ordering::Release);
        if broken {
            self.broken.store(true, Ordering::Release);
        }
        err
    }
}

impl Stream for RowStream<'_> {
    type Item = DbResult<Row>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(None);
        }
        let limit = this.limit;
        let deadline = this
            .deadline
            .get_or_insert_with(|| Box::pin(tokio::time::sleep(limit)));

        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(row))) => {
                this.deadline = None;
                Poll::Ready(Some(Ok(row)))
            }
            Poll::Ready(Some(Err(e))) => {
                let io = matches!(e, sqlx::Error::Io(_));
                let err = this.dialect.classify_error(e);
                let broken = io || err.is_connection_error();
                Poll::Ready(Some(Err(this.fail(err, broken))))
            }
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => match deadline.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    let err = DbError::timeout("query", limit.as_millis() as u64);
                    Poll::Ready(Some(Err(this.fail(err, true))))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

/// Materialized query result: a finite, single-pass sequence of rows.
///
/// Iterating consumes it; run the query again for a fresh result.
#[derive(Debug, Clone, Default)]
pub struct Rows {
    rows: std::vec::IntoIter<Row>,
}

impl Rows {
    pub(crate) fn new(rows: Vec<Row>) -> Self {
        Self {
            rows: rows.into_iter(),
        }
    }

    /// Rows not yet consumed.
    pub fn remaining(&self) -> usize {
        self.rows.len()
    }
}

impl Iterator for Rows {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        self.rows.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.rows.size_hint()
    }
}

impl ExactSizeIterator for Rows {}

/// `execute` / `query` / `query_one` outside an explicit transaction.
#[derive(Debug, Clone)]
pub struct StatementExecutor {
    coordinator: Arc<Coordinator>,
}

impl StatementExecutor {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    /// Run a statement and return the number of affected rows.
    pub async fn execute(&self, stmt: impl Into<StatementDescriptor>) -> DbResult<u64> {
        let stmt = stmt.into();
        let mode = mode_for(&stmt);
        self.coordinator
            .run(mode, move |tx| {
                let stmt = stmt.clone();
                Box::pin(async move { tx.execute(stmt).await })
            })
            .await
    }

    /// Run a query and return all of its rows.
    pub async fn query(&self, stmt: impl Into<StatementDescriptor>) -> DbResult<Rows> {
        let stmt = stmt.into();
        let mode = mode_for(&stmt);
        let rows = self
            .coordinator
            .run(mode, move |tx| {
                let stmt = stmt.clone();
                Box::pin(async move { tx.fetch_all(stmt).await })
            })
            .await?;
        Ok(Rows::new(rows))
    }

    /// Run a query and return its first row, if any.
    pub async fn query_one(&self, stmt: impl Into<StatementDescriptor>) -> DbResult<Option<Row>> {
        let stmt = stmt.into();
        let mode = mode_for(&stmt);
        self.coordinator
            .run(mode, move |tx| {
                let stmt = stmt.clone();
                Box::pin(async move { tx.query_one(stmt).await })
            })
            .await
    }
}

fn mode_for(stmt: &StatementDescriptor) -> TransactionMode {
    if stmt.is_read_only() {
        TransactionMode::ReadOnly
    } else {
        TransactionMode::ReadWrite
    }
}
