//! Column type classification and row decoding.
//!
//! Decoding is two-phase:
//! 1. `TypeCategory` classifies a backend column type into a logical category
//!    (through the dialect, see `Dialect::column_category`).
//! 2. Backend-specific decoders extract a [`Value`] for that category.
//!
//! The categories line up with `LogicalType`, so a value written through one dialect
//! reads back with the same `Value` variant on the other.

use crate::db::dialect::Dialect;
use crate::models::{DatabaseType, Row, Value};
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row as _, Type, TypeInfo, ValueRef};
use std::sync::Arc;

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Timestamp,
    Unknown,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_lowercase();

    // Decimal/Numeric first, it overlaps with the float checks
    if lower.contains("decimal") || lower.contains("numeric") {
        // SQLite's NUMERIC affinity is not exact
        if db == DatabaseType::SQLite {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }

    if lower == "datetime" || lower == "timestamp" || lower.starts_with("datetime(") {
        return TypeCategory::Timestamp;
    }

    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    if lower.contains("int") {
        return TypeCategory::Integer;
    }

    if lower.contains("float") || lower.contains("double") || lower == "real" {
        return TypeCategory::Float;
    }

    if lower == "json" {
        return TypeCategory::Json;
    }

    if lower.contains("blob") || lower.contains("binary") {
        return TypeCategory::Binary;
    }

    if lower.contains("char") || lower.contains("text") || lower.contains("clob") {
        return TypeCategory::Text;
    }

    // date, time, year, enum, set, NULL (expression columns) ...
    TypeCategory::Unknown
}

// =============================================================================
// Decimal Type Support
// =============================================================================

/// Raw DECIMAL value as the server's string representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

// =============================================================================
// Row decoding
// =============================================================================

/// Conversion of a backend row into a [`Row`].
pub trait DecodeRow {
    fn column_names(&self) -> Arc<[String]>;

    fn decode_values(&self, dialect: &dyn Dialect) -> Vec<Value>;

    /// Decode into a `Row`, reusing `columns` across a result set.
    fn to_row(&self, dialect: &dyn Dialect, columns: &mut Option<Arc<[String]>>) -> Row {
        let names = columns.get_or_insert_with(|| self.column_names()).clone();
        Row::new(names, self.decode_values(dialect))
    }
}

impl DecodeRow for SqliteRow {
    fn column_names(&self) -> Arc<[String]> {
        self.columns().iter().map(|c| c.name().to_string()).collect()
    }

    fn decode_values(&self, dialect: &dyn Dialect) -> Vec<Value> {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let category = dialect.column_category(col.type_info().name());
                sqlite::decode_column(self, idx, category)
            })
            .collect()
    }
}

impl DecodeRow for MySqlRow {
    fn column_names(&self) -> Arc<[String]> {
        self.columns().iter().map(|c| c.name().to_string()).collect()
    }

    fn decode_values(&self, dialect: &dyn Dialect) -> Vec<Value> {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let category = dialect.column_category(col.type_info().name());
                mysql::decode_column(self, idx, category)
            })
            .collect()
    }
}

// =============================================================================
// Database-Specific Decoders
// =============================================================================

mod sqlite {
    use super::*;
    use chrono::NaiveDateTime;

    /// SQLite values carry their own storage class, which wins over the declared
    /// type except for timestamps stored as text.
    pub fn decode_column(row: &SqliteRow, idx: usize, category: TypeCategory) -> Value {
        let storage = match row.try_get_raw(idx) {
            Ok(raw) if raw.is_null() => return Value::Null,
            Ok(raw) => raw.type_info().name().to_ascii_uppercase(),
            Err(e) => {
                tracing::error!("Failed to read SQLite column {}: {:?}", idx, e);
                return Value::Null;
            }
        };

        match storage.as_str() {
            "INTEGER" => decode_integer(row, idx),
            "REAL" => decode_float(row, idx),
            "BLOB" => decode_blob(row, idx),
            _ if category == TypeCategory::Timestamp => decode_timestamp(row, idx),
            _ => decode_text(row, idx),
        }
    }

    fn decode_integer(row: &SqliteRow, idx: usize) -> Value {
        row.try_get::<Option<i64>, _>(idx)
            .ok()
            .flatten()
            .map(Value::Integer)
            .unwrap_or(Value::Null)
    }

    fn decode_float(row: &SqliteRow, idx: usize) -> Value {
        row.try_get::<Option<f64>, _>(idx)
            .ok()
            .flatten()
            .map(Value::Float)
            .unwrap_or(Value::Null)
    }

    fn decode_blob(row: &SqliteRow, idx: usize) -> Value {
        row.try_get::<Option<Vec<u8>>, _>(idx)
            .ok()
            .flatten()
            .map(Value::Blob)
            .unwrap_or(Value::Null)
    }

    fn decode_timestamp(row: &SqliteRow, idx: usize) -> Value {
        match row.try_get::<Option<NaiveDateTime>, _>(idx) {
            Ok(Some(ts)) => Value::Timestamp(ts),
            Ok(None) => Value::Null,
            // Not in a recognised format; hand back the stored text.
            Err(_) => decode_text(row, idx),
        }
    }

    fn decode_text(row: &SqliteRow, idx: usize) -> Value {
        row.try_get::<Option<String>, _>(idx)
            .ok()
            .flatten()
            .map(Value::Text)
            .unwrap_or(Value::Null)
    }
}

mod mysql {
    use super::*;
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

    pub fn decode_column(row: &MySqlRow, idx: usize, category: TypeCategory) -> Value {
        if matches!(row.try_get_raw(idx), Ok(raw) if raw.is_null()) {
            return Value::Null;
        }
        match category {
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => decode_boolean(row, idx),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::Decimal => decode_decimal(row, idx),
            TypeCategory::Binary => decode_binary(row, idx),
            TypeCategory::Json => decode_json(row, idx),
            TypeCategory::Timestamp => decode_timestamp(row, idx),
            TypeCategory::Text | TypeCategory::Unknown => decode_text(row, idx),
        }
    }

    fn decode_integer(row: &MySqlRow, idx: usize) -> Value {
        if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
            return Value::Integer(v);
        }
        // BIGINT UNSIGNED beyond i64::MAX is kept exact as text
        if let Ok(Some(v)) = row.try_get::<Option<u64>, _>(idx) {
            return i64::try_from(v)
                .map(Value::Integer)
                .unwrap_or_else(|_| Value::Text(v.to_string()));
        }
        Value::Null
    }

    fn decode_boolean(row: &MySqlRow, idx: usize) -> Value {
        if let Ok(Some(v)) = row.try_get::<Option<bool>, _>(idx) {
            return Value::Integer(v as i64);
        }
        decode_integer(row, idx)
    }

    fn decode_float(row: &MySqlRow, idx: usize) -> Value {
        if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
            return Value::Float(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<f32>, _>(idx) {
            return Value::Float(v as f64);
        }
        Value::Null
    }

    fn decode_decimal(row: &MySqlRow, idx: usize) -> Value {
        match row.try_get::<Option<RawDecimal>, _>(idx) {
            Ok(Some(v)) => Value::Text(v.0),
            Ok(None) => Value::Null,
            Err(e) => {
                tracing::error!("Failed to decode DECIMAL: {:?}", e);
                Value::Null
            }
        }
    }

    fn decode_binary(row: &MySqlRow, idx: usize) -> Value {
        row.try_get::<Option<Vec<u8>>, _>(idx)
            .ok()
            .flatten()
            .map(Value::Blob)
            .unwrap_or(Value::Null)
    }

    fn decode_json(row: &MySqlRow, idx: usize) -> Value {
        // JSON comes back as text on SQLite, so keep the MySQL side textual too
        row.try_get::<Option<serde_json::Value>, _>(idx)
            .ok()
            .flatten()
            .map(|v| Value::Text(v.to_string()))
            .unwrap_or(Value::Null)
    }

    fn decode_timestamp(row: &MySqlRow, idx: usize) -> Value {
        if let Ok(Some(v)) = row.try_get::<Option<NaiveDateTime>, _>(idx) {
            return Value::Timestamp(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<DateTime<Utc>>, _>(idx) {
            return Value::Timestamp(v.naive_utc());
        }
        decode_text(row, idx)
    }

    fn decode_text(row: &MySqlRow, idx: usize) -> Value {
        if let Ok(Some(v)) = row.try_get::<Option<String>, _>(idx) {
            return Value::Text(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<NaiveDate>, _>(idx) {
            return Value::Text(v.to_string());
        }
        if let Ok(Some(v)) = row.try_get::<Option<NaiveTime>, _>(idx) {
            return Value::Text(v.to_string());
        }
        if let Ok(Some(v)) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return Value::Blob(v);
        }
        tracing::warn!(column = idx, "Unsupported MySQL column type, returning NULL");
        Value::Null
    }
}
