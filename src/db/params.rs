//! Parameter binding for rendered statements.
//!
//! Binds [`Value`]s to the engine-specific `sqlx` query objects, in render order.

use crate::models::Value;
use sqlx::mysql::MySqlArguments;
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::{MySql, Sqlite};

/// Bind a parameter list to a query.
pub(crate) trait BindValues<'q>: Sized {
    fn bind_value(self, value: &'q Value) -> Self;

    fn bind_values(self, values: &'q [Value]) -> Self {
        values.iter().fold(self, Self::bind_value)
    }
}

impl<'q> BindValues<'q> for Query<'q, Sqlite, SqliteArguments<'q>> {
    fn bind_value(self, value: &'q Value) -> Self {
        match value {
            Value::Null => self.bind(None::<i64>),
            Value::Integer(v) => self.bind(*v),
            Value::Float(v) => self.bind(*v),
            Value::Text(v) => self.bind(v.as_str()),
            Value::Blob(v) => self.bind(v.as_slice()),
            Value::Timestamp(v) => self.bind(*v),
        }
    }
}

impl<'q> BindValues<'q> for Query<'q, MySql, MySqlArguments> {
    fn bind_value(self, value: &'q Value) -> Self {
        match value {
            Value::Null => self.bind(None::<String>),
            Value::Integer(v) => self.bind(*v),
            Value::Float(v) => self.bind(*v),
            Value::Text(v) => self.bind(v.as_str()),
            Value::Blob(v) => self.bind(v.as_slice()),
            Value::Timestamp(v) => self.bind(*v),
        }
    }
}
