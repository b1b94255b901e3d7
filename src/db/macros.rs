//! Backend dispatch macro.
//!
//! Each arm is expanded with the concrete connection type, so the body may call
//! generic `sqlx` APIs that only type-check per backend.

/// Run `$body` with `$c` bound to the concrete pooled connection.
///
/// # Example
///
/// ```ignore
/// let affected = with_connection!(conn, c => {
///     sqlx::query(sql).bind_values(params).execute(&mut **c).await
///         .map(|r| r.rows_affected())
/// });
/// ```
#[macro_export]
macro_rules! with_connection {
    ($conn:expr, $c:ident => $body:expr) => {
        match $conn {
            $crate::db::pool::BackendConnection::Sqlite($c) => $body,
            $crate::db::pool::BackendConnection::MySql($c) => $body,
        }
    };
}
