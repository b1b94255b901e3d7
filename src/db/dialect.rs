//! Dialect drivers.
//!
//! A [`Dialect`] is the only component that knows engine-specific SQL text. The set
//! is closed: [`SqliteDialect`] for the embedded engine and [`MySqlDialect`] for the
//! networked one, selected once per handle with [`for_type`].
//!
//! Both engines use `?` placeholders, so rendering shares one writer and the
//! dialects only override the constructs that differ. Anything a dialect cannot
//! express faithfully fails with `UnsupportedOperation` instead of being coerced.

use crate::db::types::{TypeCategory, categorize_type};
use crate::error::{DbError, DbResult};
use crate::models::{
    ColumnDefault, ColumnSpec, CreateIndex, CreateTable, DatabaseType, Delete, Insert,
    LogicalType, Predicate, Select, StatementDescriptor, TransactionMode, Update, Upsert, Value,
};
use sqlx::error::{DatabaseError, ErrorKind};
use sqlx::mysql::MySqlDatabaseError;
use std::fmt;
use std::fmt::Write as _;
use std::io;

/// SQL text plus its ordered bind parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Engine-specific SQL generation and error taxonomy.
pub trait Dialect: Send + Sync + fmt::Debug {
    fn db_type(&self) -> DatabaseType;

    fn name(&self) -> &'static str {
        self.db_type().display_name()
    }

    /// Quote an identifier, doubling any embedded quote character.
    fn quote_identifier(&self, name: &str) -> DbResult<String>;

    /// Concrete column type for a logical type.
    fn map_type(&self, ty: &LogicalType) -> DbResult<String>;

    /// Logical category of a column type reported by this engine.
    fn column_category(&self, type_name: &str) -> TypeCategory {
        categorize_type(type_name, self.db_type())
    }

    fn begin_sql(&self, mode: TransactionMode) -> &'static str;

    fn commit_sql(&self) -> &'static str {
        "COMMIT"
    }

    fn rollback_sql(&self) -> &'static str {
        "ROLLBACK"
    }

    fn last_insert_id_sql(&self) -> &'static str;

    /// Query taking one parameter (the table name) that returns a row iff it exists.
    fn table_exists_sql(&self) -> &'static str;

    /// Translate a driver error into the shared error taxonomy.
    fn classify_error(&self, err: sqlx::Error) -> DbError;

    fn render(&self, statement: &StatementDescriptor) -> DbResult<RenderedStatement> {
        let mut w = SqlWriter::default();
        match statement {
            StatementDescriptor::CreateTable(ct) => self.render_create_table(ct, &mut w)?,
            StatementDescriptor::DropTable { table, if_exists } => {
                w.push("DROP TABLE ");
                if *if_exists {
                    w.push("IF EXISTS ");
                }
                w.push(&self.quote_identifier(table)?);
            }
            StatementDescriptor::CreateIndex(ci) => self.render_create_index(ci, &mut w)?,
            StatementDescriptor::Insert(insert) => render_insert(self, insert, &mut w)?,
            StatementDescriptor::Update(update) => render_update(self, update, &mut w)?,
            StatementDescriptor::Delete(delete) => render_delete(self, delete, &mut w)?,
            StatementDescriptor::Select(select) => render_select(self, select, &mut w)?,
            StatementDescriptor::Raw { sql, params } => {
                if sql.trim().is_empty() {
                    return Err(DbError::invalid_input("SQL statement cannot be empty"));
                }
                w.push(sql);
                w.params.extend(params.iter().cloned());
            }
        }
        Ok(w.finish())
    }

    // ---- construct hooks -------------------------------------------------------

    fn render_create_table(&self, ct: &CreateTable, w: &mut SqlWriter) -> DbResult<()>;

    fn render_create_index(&self, ci: &CreateIndex, w: &mut SqlWriter) -> DbResult<()>;

    /// Trailing conflict clause of an insert.
    fn render_upsert(&self, upsert: &Upsert, w: &mut SqlWriter) -> DbResult<()>;

    fn render_returning(&self, columns: &[String], w: &mut SqlWriter) -> DbResult<()>;

    /// `LIMIT`/`OFFSET`, including an offset with no limit.
    fn render_limit(&self, limit: Option<u64>, offset: Option<u64>, w: &mut SqlWriter);

    /// A literal for a column default (DDL cannot take bind parameters).
    fn default_literal(&self, column: &ColumnSpec, value: &Value) -> DbResult<String>;
}

/// Dialect for a database type.
pub fn for_type(db_type: DatabaseType) -> &'static dyn Dialect {
    match db_type {
        DatabaseType::SQLite => &SqliteDialect,
        DatabaseType::MySQL => &MySqlDialect,
    }
}

/// Accumulates SQL text and parameters while rendering.
#[derive(Debug, Default)]
pub struct SqlWriter {
    sql: String,
    params: Vec<Value>,
}

impl SqlWriter {
    pub fn push(&mut self, s: &str) {
        self.sql.push_str(s);
    }

    pub fn bind(&mut self, value: Value) {
        self.sql.push('?');
        self.params.push(value);
    }

    fn finish(self) -> RenderedStatement {
        RenderedStatement {
            sql: self.sql,
            params: self.params,
        }
    }
}

// =============================================================================
// Shared rendering
// =============================================================================

fn require_name(kind: &str, name: &str) -> DbResult<()> {
    if name.trim().is_empty() {
        return Err(DbError::invalid_input(format!("{kind} name cannot be empty")));
    }
    Ok(())
}

fn quote_with(name: &str, quote: char) -> DbResult<String> {
    if name.is_empty() {
        return Err(DbError::invalid_input("Identifier cannot be empty"));
    }
    if name.contains('\0') {
        return Err(DbError::invalid_input(
            "Identifier cannot contain a NUL character",
        ));
    }
    let mut quoted = String::with_capacity(name.len() + 2);
    quoted.push(quote);
    for c in name.chars() {
        if c == quote {
            quoted.push(quote);
        }
        quoted.push(c);
    }
    quoted.push(quote);
    Ok(quoted)
}

fn quote_list<D: Dialect + ?Sized>(d: &D, names: &[String]) -> DbResult<String> {
    let quoted = names
        .iter()
        .map(|n| d.quote_identifier(n))
        .collect::<DbResult<Vec<_>>>()?;
    Ok(quoted.join(", "))
}

fn render_predicate<D: Dialect + ?Sized>(
    d: &D,
    predicate: &Predicate,
    w: &mut SqlWriter,
) -> DbResult<()> {
    let compare = |w: &mut SqlWriter, column: &str, op: &str, value: &Value| -> DbResult<()> {
        w.push(&d.quote_identifier(column)?);
        w.push(" ");
        w.push(op);
        w.push(" ");
        w.bind(value.clone());
        Ok(())
    };

    match predicate {
        // `= NULL` never matches; compare against NULL the way callers mean it
        Predicate::Eq(column, Value::Null) | Predicate::IsNull(column) => {
            w.push(&d.quote_identifier(column)?);
            w.push(" IS NULL");
        }
        Predicate::Ne(column, Value::Null) | Predicate::IsNotNull(column) => {
            w.push(&d.quote_identifier(column)?);
            w.push(" IS NOT NULL");
        }
        Predicate::Eq(column, value) => compare(w, column, "=", value)?,
        Predicate::Ne(column, value) => compare(w, column, "<>", value)?,
        Predicate::Lt(column, value) => compare(w, column, "<", value)?,
        Predicate::Le(column, value) => compare(w, column, "<=", value)?,
        Predicate::Gt(column, value) => compare(w, column, ">", value)?,
        Predicate::Ge(column, value) => compare(w, column, ">=", value)?,
        Predicate::Like(column, pattern) => {
            compare(w, column, "LIKE", &Value::Text(pattern.clone()))?
        }
        Predicate::Regexp(column, pattern) => {
            compare(w, column, "REGEXP", &Value::Text(pattern.clone()))?
        }
        Predicate::In(_, values) if values.is_empty() => w.push("1 = 0"),
        Predicate::In(column, values) => {
            w.push(&d.quote_identifier(column)?);
            w.push(" IN (");
            for (i, value) in values.iter().enumerate() {
                if i > 0 {
                    w.push(", ");
                }
                w.bind(value.clone());
            }
            w.push(")");
        }
        Predicate::And(parts) if parts.is_empty() => w.push("1 = 1"),
        Predicate::Or(parts) if parts.is_empty() => w.push("1 = 0"),
        Predicate::And(parts) | Predicate::Or(parts) => {
            let joiner = if matches!(predicate, Predicate::And(_)) {
                " AND "
            } else {
                " OR "
            };
            for (i, part) in parts.iter().enumerate() {
                if i > 0 {
                    w.push(joiner);
                }
                w.push("(");
                render_predicate(d, part, w)?;
                w.push(")");
            }
        }
        Predicate::Not(inner) => {
            w.push("NOT (");
            render_predicate(d, inner, w)?;
            w.push(")");
        }
        Predicate::Sql { sql, params } => {
            if sql.trim().is_empty() {
                return Err(DbError::invalid_input("SQL predicate cannot be empty"));
            }
            w.push("(");
            w.push(sql);
            w.push(")");
            w.params.extend(params.iter().cloned());
        }
    }
    Ok(())
}

fn render_where<D: Dialect + ?Sized>(
    d: &D,
    predicate: Option<&Predicate>,
    w: &mut SqlWriter,
) -> DbResult<()> {
    if let Some(predicate) = predicate {
        w.push(" WHERE ");
        render_predicate(d, predicate, w)?;
    }
    Ok(())
}

fn render_insert<D: Dialect + ?Sized>(d: &D, insert: &Insert, w: &mut SqlWriter) -> DbResult<()> {
    require_name("Table", &insert.table)?;
    if insert.columns.is_empty() {
        return Err(DbError::invalid_input("INSERT needs at least one column"));
    }
    if insert.rows.is_empty() {
        return Err(DbError::invalid_input("INSERT needs at least one row"));
    }
    if let Some(row) = insert.rows.iter().find(|r| r.len() != insert.columns.len()) {
        return Err(DbError::invalid_input(format!(
            "INSERT row has {} values for {} columns",
            row.len(),
            insert.columns.len()
        )));
    }

    w.push("INSERT INTO ");
    w.push(&d.quote_identifier(&insert.table)?);
    w.push(" (");
    w.push(&quote_list(d, &insert.columns)?);
    w.push(") VALUES ");
    for (i, row) in insert.rows.iter().enumerate() {
        if i > 0 {
            w.push(", ");
        }
        w.push("(");
        for (j, value) in row.iter().enumerate() {
            if j > 0 {
                w.push(", ");
            }
            w.bind(value.clone());
        }
        w.push(")");
    }
    if let Some(upsert) = &insert.upsert {
        if upsert.update.is_empty() {
            return Err(DbError::invalid_input(
                "Upsert needs at least one column to update",
            ));
        }
        d.render_upsert(upsert, w)?;
    }
    if !insert.returning.is_empty() {
        d.render_returning(&insert.returning, w)?;
    }
    Ok(())
}

fn render_update<D: Dialect + ?Sized>(d: &D, update: &Update, w: &mut SqlWriter) -> DbResult<()> {
    require_name("Table", &update.table)?;
    if update.assignments.is_empty() {
        return Err(DbError::invalid_input("UPDATE needs at least one assignment"));
    }
    w.push("UPDATE ");
    w.push(&d.quote_identifier(&update.table)?);
    w.push(" SET ");
    for (i, (column, value)) in update.assignments.iter().enumerate() {
        if i > 0 {
            w.push(", ");
        }
        w.push(&d.quote_identifier(column)?);
        w.push(" = ");
        w.bind(value.clone());
    }
    render_where(d, update.predicate.as_ref(), w)
}

fn render_delete<D: Dialect + ?Sized>(d: &D, delete: &Delete, w: &mut SqlWriter) -> DbResult<()> {
    require_name("Table", &delete.table)?;
    w.push("DELETE FROM ");
    w.push(&d.quote_identifier(&delete.table)?);
    render_where(d, delete.predicate.as_ref(), w)
}

fn render_select<D: Dialect + ?Sized>(d: &D, select: &Select, w: &mut SqlWriter) -> DbResult<()> {
    require_name("Table", &select.table)?;
    w.push("SELECT ");
    if select.columns.is_empty() {
        w.push("*");
    } else {
        w.push(&quote_list(d, &select.columns)?);
    }
    w.push(" FROM ");
    w.push(&d.quote_identifier(&select.table)?);
    render_where(d, select.predicate.as_ref(), w)?;
    if !select.order_by.is_empty() {
        w.push(" ORDER BY ");
        for (i, order) in select.order_by.iter().enumerate() {
            if i > 0 {
                w.push(", ");
            }
            w.push(&d.quote_identifier(&order.column)?);
            w.push(if order.descending { " DESC" } else { " ASC" });
        }
    }
    d.render_limit(select.limit, select.offset, w);
    Ok(())
}

/// Checks shared by both dialects before a table definition is rendered.
fn validate_table(d: &dyn Dialect, ct: &CreateTable) -> DbResult<()> {
    require_name("Table", &ct.table)?;
    if ct.columns.is_empty() {
        return Err(DbError::invalid_input(format!(
            "Table '{}' needs at least one column",
            ct.table
        )));
    }
    let pk_count = ct.columns.iter().filter(|c| c.primary_key).count();
    for col in &ct.columns {
        require_name("Column", &col.name)?;
        if col.auto_increment && (!col.primary_key || !col.logical_type.is_integer()) {
            return Err(DbError::unsupported(
                format!(
                    "auto-increment on column '{}' (only an integer primary key can be auto-incremented)",
                    col.name
                ),
                d.name(),
            ));
        }
        if col.auto_increment && pk_count > 1 {
            return Err(DbError::unsupported(
                format!(
                    "auto-increment on column '{}' of a composite primary key",
                    col.name
                ),
                d.name(),
            ));
        }
        if matches!(col.default, Some(ColumnDefault::CurrentTimestamp))
            && col.logical_type != LogicalType::Timestamp
        {
            return Err(DbError::unsupported(
                format!("CURRENT_TIMESTAMP default on non-timestamp column '{}'", col.name),
                d.name(),
            ));
        }
    }
    Ok(())
}

/// Common part of a column definition: name, type, nullability, default, unique.
fn column_definition(d: &dyn Dialect, col: &ColumnSpec, single_pk: bool) -> DbResult<String> {
    let mut def = format!(
        "{} {}",
        d.quote_identifier(&col.name)?,
        d.map_type(&col.logical_type)?
    );
    if !col.nullable {
        def.push_str(" NOT NULL");
    }
    match &col.default {
        Some(ColumnDefault::Value(value)) => {
            def.push_str(" DEFAULT ");
            def.push_str(&d.default_literal(col, value)?);
        }
        Some(ColumnDefault::CurrentTimestamp) => {
            def.push_str(match d.db_type() {
                DatabaseType::SQLite => " DEFAULT CURRENT_TIMESTAMP",
                DatabaseType::MySQL => " DEFAULT CURRENT_TIMESTAMP(6)",
            });
        }
        None => {}
    }
    if col.primary_key && single_pk {
        def.push_str(" PRIMARY KEY");
    }
    if col.unique && !col.primary_key {
        def.push_str(" UNIQUE");
    }
    Ok(def)
}

fn primary_key_clause(d: &dyn Dialect, ct: &CreateTable) -> DbResult<Option<String>> {
    let pk: Vec<String> = ct
        .columns
        .iter()
        .filter(|c| c.primary_key)
        .map(|c| c.name.clone())
        .collect();
    if pk.len() > 1 {
        Ok(Some(format!("PRIMARY KEY ({})", quote_list(d, &pk)?)))
    } else {
        Ok(None)
    }
}

fn index_name(table: &str, column: &str) -> String {
    format!("ix_{table}_{column}")
}

/// Literal rendering shared by both engines for scalar values.
fn scalar_literal(value: &Value, escape_backslash: bool) -> DbResult<Option<String>> {
    Ok(Some(match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(v) => v.to_string(),
        Value::Float(v) if v.is_finite() => format!("{v:?}"),
        Value::Float(v) => {
            return Err(DbError::invalid_input(format!(
                "Non-finite default value {v} cannot be stored"
            )));
        }
        Value::Text(s) => string_literal(s, escape_backslash),
        Value::Timestamp(ts) => {
            string_literal(&ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string(), false)
        }
        Value::Blob(_) => return Ok(None),
    }))
}

fn string_literal(s: &str, escape_backslash: bool) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\'' => out.push_str("''"),
            '\\' if escape_backslash => out.push_str("\\\\"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

fn is_connection_reset(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

/// Map a backend error that is neither transient nor a connection loss.
fn database_error(db_err: &dyn DatabaseError) -> DbError {
    let code = db_err.code().map(|c| c.to_string());
    let suggestion = match db_err.kind() {
        ErrorKind::UniqueViolation => "A row with the same key already exists",
        ErrorKind::ForeignKeyViolation => "Check that the referenced row exists",
        ErrorKind::NotNullViolation => "Provide a value for every NOT NULL column",
        ErrorKind::CheckViolation => "The value violates a CHECK constraint",
        _ => "Check the SQL syntax and referenced objects",
    };
    DbError::database(db_err.message(), code, suggestion)
}

// =============================================================================
// SQLite
// =============================================================================

/// Embedded engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

/// `SQLITE_BUSY`
const SQLITE_BUSY: i32 = 5;
/// `SQLITE_LOCKED`
const SQLITE_LOCKED: i32 = 6;

impl Dialect for SqliteDialect {
    fn db_type(&self) -> DatabaseType {
        DatabaseType::SQLite
    }

    fn quote_identifier(&self, name: &str) -> DbResult<String> {
        quote_with(name, '"')
    }

    fn map_type(&self, ty: &LogicalType) -> DbResult<String> {
        Ok(match ty {
            LogicalType::Integer | LogicalType::Boolean => "INTEGER".to_string(),
            LogicalType::Float => "REAL".to_string(),
            LogicalType::Text | LogicalType::Json => "TEXT".to_string(),
            LogicalType::VarChar(0) => {
                return Err(DbError::invalid_input("VARCHAR length must be at least 1"));
            }
            LogicalType::VarChar(n) => format!("VARCHAR({n})"),
            LogicalType::Blob => "BLOB".to_string(),
            LogicalType::Timestamp => "TIMESTAMP".to_string(),
            LogicalType::Decimal { precision, scale } => {
                return Err(DbError::unsupported(
                    format!("DECIMAL({precision},{scale}) (no exact decimal storage)"),
                    self.name(),
                ));
            }
        })
    }

    fn begin_sql(&self, mode: TransactionMode) -> &'static str {
        match mode {
            // Take the write lock up front so contention shows up at BEGIN
            TransactionMode::ReadWrite => "BEGIN IMMEDIATE",
            TransactionMode::ReadOnly => "BEGIN DEFERRED",
        }
    }

    fn last_insert_id_sql(&self) -> &'static str {
        "SELECT last_insert_rowid()"
    }

    fn table_exists_sql(&self) -> &'static str {
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?"
    }

    fn classify_error(&self, err: sqlx::Error) -> DbError {
        match &err {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                let primary = code
                    .as_deref()
                    .and_then(|c| c.parse::<i32>().ok())
                    .map(|c| c & 0xff);
                if matches!(primary, Some(SQLITE_BUSY) | Some(SQLITE_LOCKED)) {
                    DbError::transient(db_err.message(), code)
                } else {
                    database_error(&**db_err)
                }
            }
            sqlx::Error::Io(io_err) if is_connection_reset(io_err.kind()) => {
                DbError::transient(format!("I/O error: {io_err}"), None)
            }
            _ => DbError::from(err),
        }
    }

    fn render_create_table(&self, ct: &CreateTable, w: &mut SqlWriter) -> DbResult<()> {
        validate_table(self, ct)?;
        let pk_clause = primary_key_clause(self, ct)?;
        let single_pk = pk_clause.is_none();

        let mut defs = Vec::with_capacity(ct.columns.len() + 1);
        for col in &ct.columns {
            if col.auto_increment {
                // rowid alias; NOT NULL is implied
                defs.push(format!(
                    "{} INTEGER PRIMARY KEY AUTOINCREMENT",
                    self.quote_identifier(&col.name)?
                ));
            } else {
                defs.push(column_definition(self, col, single_pk)?);
            }
        }
        defs.extend(pk_clause);

        w.push("CREATE TABLE ");
        if ct.if_not_exists {
            w.push("IF NOT EXISTS ");
        }
        w.push(&self.quote_identifier(&ct.table)?);
        w.push(" (");
        w.push(&defs.join(", "));
        w.push(")");

        // SQLite has no inline index syntax
        for col in ct.columns.iter().filter(|c| c.indexed) {
            let _ = write!(
                w.sql,
                "; CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                self.quote_identifier(&index_name(&ct.table, &col.name))?,
                self.quote_identifier(&ct.table)?,
                self.quote_identifier(&col.name)?
            );
        }
        Ok(())
    }

    fn render_create_index(&self, ci: &CreateIndex, w: &mut SqlWriter) -> DbResult<()> {
        require_name("Index", &ci.name)?;
        require_name("Table", &ci.table)?;
        if ci.columns.is_empty() {
            return Err(DbError::invalid_input("Index needs at least one column"));
        }
        w.push(if ci.unique {
            "CREATE UNIQUE INDEX "
        } else {
            "CREATE INDEX "
        });
        if ci.if_not_exists {
            w.push("IF NOT EXISTS ");
        }
        let _ = write!(
            w.sql,
            "{} ON {} ({})",
            self.quote_identifier(&ci.name)?,
            self.quote_identifier(&ci.table)?,
            quote_list(self, &ci.columns)?
        );
        Ok(())
    }

    fn render_upsert(&self, upsert: &Upsert, w: &mut SqlWriter) -> DbResult<()> {
        if upsert.target.is_empty() {
            return Err(DbError::invalid_input(
                "Upsert on SQLite needs a conflict target",
            ));
        }
        let _ = write!(
            w.sql,
            " ON CONFLICT ({}) DO UPDATE SET ",
            quote_list(self, &upsert.target)?
        );
        for (i, column) in upsert.update.iter().enumerate() {
            if i > 0 {
                w.push(", ");
            }
            let quoted = self.quote_identifier(column)?;
            let _ = write!(w.sql, "{quoted} = excluded.{quoted}");
        }
        Ok(())
    }

    fn render_returning(&self, columns: &[String], w: &mut SqlWriter) -> DbResult<()> {
        w.push(" RETURNING ");
        w.push(&quote_list(self, columns)?);
        Ok(())
    }

    fn render_limit(&self, limit: Option<u64>, offset: Option<u64>, w: &mut SqlWriter) {
        match (limit, offset) {
            (Some(limit), None) => {
                let _ = write!(w.sql, " LIMIT {limit}");
            }
            (Some(limit), Some(offset)) => {
                let _ = write!(w.sql, " LIMIT {limit} OFFSET {offset}");
            }
            (None, Some(offset)) => {
                let _ = write!(w.sql, " LIMIT -1 OFFSET {offset}");
            }
            (None, None) => {}
        }
    }

    fn default_literal(&self, column: &ColumnSpec, value: &Value) -> DbResult<String> {
        match value {
            Value::Blob(bytes) => {
                let mut hex = String::with_capacity(bytes.len() * 2 + 3);
                hex.push_str("X'");
                for b in bytes {
                    let _ = write!(hex, "{b:02X}");
                }
                hex.push('\'');
                Ok(hex)
            }
            other => scalar_literal(other, false)?.ok_or_else(|| {
                DbError::unsupported(format!("default for column '{}'", column.name), self.name())
            }),
        }
    }
}

// =============================================================================
// MySQL
// =============================================================================

/// Networked engine (MySQL and MariaDB).
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDialect;

/// `ER_LOCK_WAIT_TIMEOUT`
const ER_LOCK_WAIT_TIMEOUT: u16 = 1205;
/// `ER_LOCK_DEADLOCK`
const ER_LOCK_DEADLOCK: u16 = 1213;
/// SQLSTATE serialization failure
const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";
/// `CR_SERVER_GONE_ERROR`, `CR_SERVER_LOST`
const CONNECTION_LOST: [u16; 2] = [2006, 2013];

impl MySqlDialect {
    fn is_large_object(ty: &LogicalType) -> bool {
        matches!(ty, LogicalType::Text | LogicalType::Blob | LogicalType::Json)
    }
}

impl Dialect for MySqlDialect {
    fn db_type(&self) -> DatabaseType {
        DatabaseType::MySQL
    }

    fn quote_identifier(&self, name: &str) -> DbResult<String> {
        quote_with(name, '`')
    }

    fn map_type(&self, ty: &LogicalType) -> DbResult<String> {
        Ok(match ty {
            LogicalType::Integer => "BIGINT".to_string(),
            LogicalType::Float => "DOUBLE".to_string(),
            LogicalType::Text => "TEXT".to_string(),
            LogicalType::VarChar(0) => {
                return Err(DbError::invalid_input("VARCHAR length must be at least 1"));
            }
            LogicalType::VarChar(n) => format!("VARCHAR({n})"),
            LogicalType::Boolean => "TINYINT(1)".to_string(),
            LogicalType::Blob => "LONGBLOB".to_string(),
            LogicalType::Timestamp => "DATETIME(6)".to_string(),
            LogicalType::Json => "JSON".to_string(),
            LogicalType::Decimal { precision, scale } => {
                if *precision == 0 || *precision > 65 || *scale > 30 || scale > precision {
                    return Err(DbError::invalid_input(format!(
                        "DECIMAL({precision},{scale}) is out of range"
                    )));
                }
                format!("DECIMAL({precision},{scale})")
            }
        })
    }

    fn begin_sql(&self, mode: TransactionMode) -> &'static str {
        match mode {
            TransactionMode::ReadWrite => "START TRANSACTION",
            TransactionMode::ReadOnly => "START TRANSACTION READ ONLY",
        }
    }

    fn last_insert_id_sql(&self) -> &'static str {
        "SELECT LAST_INSERT_ID()"
    }

    fn table_exists_sql(&self) -> &'static str {
        "SELECT 1 FROM information_schema.tables WHERE table_schema = DATABASE() AND table_name = ?"
    }

    fn classify_error(&self, err: sqlx::Error) -> DbError {
        match &err {
            sqlx::Error::Database(db_err) => {
                let number = db_err
                    .try_downcast_ref::<MySqlDatabaseError>()
                    .map(|e| e.number());
                let sql_state = db_err.code().map(|c| c.to_string());
                let transient = matches!(number, Some(ER_LOCK_WAIT_TIMEOUT | ER_LOCK_DEADLOCK))
                    || sql_state.as_deref() == Some(SQLSTATE_SERIALIZATION_FAILURE);
                if transient {
                    DbError::transient(db_err.message(), number.map(|n| n.to_string()))
                } else if number.is_some_and(|n| CONNECTION_LOST.contains(&n)) {
                    DbError::connection(
                        db_err.message(),
                        "The server closed the connection; it will be re-established",
                    )
                } else {
                    database_error(&**db_err)
                }
            }
            sqlx::Error::Io(io_err) if is_connection_reset(io_err.kind()) => {
                DbError::transient(format!("I/O error: {io_err}"), None)
            }
            _ => DbError::from(err),
        }
    }

    fn render_create_table(&self, ct: &CreateTable, w: &mut SqlWriter) -> DbResult<()> {
        validate_table(self, ct)?;
        for col in &ct.columns {
            if Self::is_large_object(&col.logical_type)
                && (col.primary_key || col.unique || col.indexed)
            {
                return Err(DbError::unsupported(
                    format!(
                        "{:?} column '{}' in a key or index (use VarChar)",
                        col.logical_type, col.name
                    ),
                    self.name(),
                ));
            }
        }
        let pk_clause = primary_key_clause(self, ct)?;
        let single_pk = pk_clause.is_none();

        let mut defs = Vec::with_capacity(ct.columns.len() + 1);
        for col in &ct.columns {
            if col.auto_increment {
                defs.push(format!(
                    "{} BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY",
                    self.quote_identifier(&col.name)?
                ));
            } else {
                defs.push(column_definition(self, col, single_pk)?);
            }
        }
        defs.extend(pk_clause);
        for col in ct.columns.iter().filter(|c| c.indexed) {
            defs.push(format!(
                "INDEX {} ({})",
                self.quote_identifier(&index_name(&ct.table, &col.name))?,
                self.quote_identifier(&col.name)?
            ));
        }

        w.push("CREATE TABLE ");
        if ct.if_not_exists {
            w.push("IF NOT EXISTS ");
        }
        w.push(&self.quote_identifier(&ct.table)?);
        w.push(" (");
        w.push(&defs.join(", "));
        w.push(")");
        Ok(())
    }

    fn render_create_index(&self, ci: &CreateIndex, w: &mut SqlWriter) -> DbResult<()> {
        require_name("Index", &ci.name)?;
        require_name("Table", &ci.table)?;
        if ci.columns.is_empty() {
            return Err(DbError::invalid_input("Index needs at least one column"));
        }
        if ci.if_not_exists {
            return Err(DbError::unsupported("CREATE INDEX IF NOT EXISTS", self.name()));
        }
        w.push(if ci.unique {
            "CREATE UNIQUE INDEX "
        } else {
            "CREATE INDEX "
        });
        let _ = write!(
            w.sql,
            "{} ON {} ({})",
            self.quote_identifier(&ci.name)?,
            self.quote_identifier(&ci.table)?,
            quote_list(self, &ci.columns)?
        );
        Ok(())
    }

    fn render_upsert(&self, upsert: &Upsert, w: &mut SqlWriter) -> DbResult<()> {
        // The conflicting key is inferred from the table's unique indexes
        w.push(" ON DUPLICATE KEY UPDATE ");
        for (i, column) in upsert.update.iter().enumerate() {
            if i > 0 {
                w.push(", ");
            }
            let quoted = self.quote_identifier(column)?;
            let _ = write!(w.sql, "{quoted} = VALUES({quoted})");
        }
        Ok(())
    }

    fn render_returning(&self, _columns: &[String], _w: &mut SqlWriter) -> DbResult<()> {
        Err(DbError::unsupported("INSERT ... RETURNING", self.name()))
    }

    fn render_limit(&self, limit: Option<u64>, offset: Option<u64>, w: &mut SqlWriter) {
        match (limit, offset) {
            (Some(limit), None) => {
                let _ = write!(w.sql, " LIMIT {limit}");
            }
            (Some(limit), Some(offset)) => {
                let _ = write!(w.sql, " LIMIT {limit} OFFSET {offset}");
            }
            (None, Some(offset)) => {
                let _ = write!(w.sql, " LIMIT {} OFFSET {offset}", u64::MAX);
            }
            (None, None) => {}
        }
    }

    fn default_literal(&self, column: &ColumnSpec, value: &Value) -> DbResult<String> {
        if Self::is_large_object(&column.logical_type) && !value.is_null() {
            return Err(DbError::unsupported(
                format!(
                    "literal default on {:?} column '{}'",
                    column.logical_type, column.name
                ),
                self.name(),
            ));
        }
        scalar_literal(value, true)?.ok_or_else(|| {
            DbError::unsupported(
                format!("binary default on column '{}'", column.name),
                self.name(),
            )
        })
    }
}
