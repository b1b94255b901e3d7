//! Logical statement descriptors.
//!
//! A [`StatementDescriptor`] says *what* to do (create a table, insert rows, select
//! with a predicate) without any engine-specific SQL. The dialect driver turns it into
//! SQL text and an ordered parameter list.

use crate::models::row::Value;

/// Logical column type, mapped to a concrete type name by each dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalType {
    Integer,
    Float,
    /// Unbounded text.
    Text,
    /// Bounded text, usable in keys and indexes on every engine.
    VarChar(u32),
    Boolean,
    Blob,
    Timestamp,
    Json,
    Decimal { precision: u8, scale: u8 },
}

impl LogicalType {
    pub fn is_integer(&self) -> bool {
        matches!(self, Self::Integer)
    }
}

/// Column default.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnDefault {
    Value(Value),
    CurrentTimestamp,
}

/// One column of a `CreateTable`.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    pub logical_type: LogicalType,
    pub nullable: bool,
    pub default: Option<ColumnDefault>,
    pub primary_key: bool,
    pub auto_increment: bool,
    pub unique: bool,
    pub indexed: bool,
}

impl ColumnSpec {
    /// A nullable column with no constraints.
    pub fn new(name: impl Into<String>, logical_type: LogicalType) -> Self {
        Self {
            name: name.into(),
            logical_type,
            nullable: true,
            default: None,
            primary_key: false,
            auto_increment: false,
            unique: false,
            indexed: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    /// Engine-assigned identity. Only valid on an integer primary key.
    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(ColumnDefault::Value(value.into()));
        self
    }

    pub fn default_current_timestamp(mut self) -> Self {
        self.default = Some(ColumnDefault::CurrentTimestamp);
        self
    }
}

/// Filter condition for `Select`, `Update` and `Delete`.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(String, Value),
    Ne(String, Value),
    Lt(String, Value),
    Le(String, Value),
    Gt(String, Value),
    Ge(String, Value),
    Like(String, String),
    Regexp(String, String),
    IsNull(String),
    IsNotNull(String),
    /// An empty list matches nothing.
    In(String, Vec<Value>),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    /// Caller-supplied fragment with `?` placeholders, passed through verbatim.
    Sql { sql: String, params: Vec<Value> },
}

impl Predicate {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(column.into(), value.into())
    }

    pub fn ne(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Ne(column.into(), value.into())
    }

    pub fn lt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lt(column.into(), value.into())
    }

    pub fn le(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Le(column.into(), value.into())
    }

    pub fn gt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gt(column.into(), value.into())
    }

    pub fn ge(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Ge(column.into(), value.into())
    }

    pub fn like(column: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::Like(column.into(), pattern.into())
    }

    pub fn regexp(column: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::Regexp(column.into(), pattern.into())
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Self::IsNull(column.into())
    }

    pub fn is_not_null(column: impl Into<String>) -> Self {
        Self::IsNotNull(column.into())
    }

    pub fn in_list<I, V>(column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::In(column.into(), values.into_iter().map(Into::into).collect())
    }

    pub fn sql(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self::Sql {
            sql: sql.into(),
            params,
        }
    }

    pub fn and(self, other: Predicate) -> Self {
        match self {
            Self::And(mut parts) => {
                parts.push(other);
                Self::And(parts)
            }
            first => Self::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Predicate) -> Self {
        match self {
            Self::Or(mut parts) => {
                parts.push(other);
                Self::Or(parts)
            }
            first => Self::Or(vec![first, other]),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Self::Not(Box::new(self))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateTable {
    pub table: String,
    pub columns: Vec<ColumnSpec>,
    pub if_not_exists: bool,
}

impl CreateTable {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            if_not_exists: false,
        }
    }

    pub fn column(mut self, column: ColumnSpec) -> Self {
        self.columns.push(column);
        self
    }

    pub fn if_not_exists(mut self) -> Self {
        self.if_not_exists = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateIndex {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub unique: bool,
    pub if_not_exists: bool,
}

impl CreateIndex {
    pub fn new<I, S>(name: impl Into<String>, table: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            table: table.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            unique: false,
            if_not_exists: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn if_not_exists(mut self) -> Self {
        self.if_not_exists = true;
        self
    }
}

/// `ON CONFLICT` / `ON DUPLICATE KEY` behavior for an insert.
#[derive(Debug, Clone, PartialEq)]
pub struct Upsert {
    /// Conflict target (the unique key). Ignored by engines that infer it.
    pub target: Vec<String>,
    /// Columns overwritten with the incoming row's values.
    pub update: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub upsert: Option<Upsert>,
    pub returning: Vec<String>,
}

impl Insert {
    pub fn into(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            rows: Vec::new(),
            upsert: None,
            returning: Vec::new(),
        }
    }

    /// Add one column/value to a single-row insert.
    pub fn set(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.columns.push(column.into());
        match self.rows.first_mut() {
            Some(row) => row.push(value.into()),
            None => self.rows.push(vec![value.into()]),
        }
        self
    }

    /// Column list for multi-row inserts via [`Insert::values`].
    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn values<I, V>(mut self, row: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.rows.push(row.into_iter().map(Into::into).collect());
        self
    }

    pub fn on_conflict_update<T, U, S1, S2>(mut self, target: T, update: U) -> Self
    where
        T: IntoIterator<Item = S1>,
        U: IntoIterator<Item = S2>,
        S1: Into<String>,
        S2: Into<String>,
    {
        self.upsert = Some(Upsert {
            target: target.into_iter().map(Into::into).collect(),
            update: update.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn returning<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.returning = columns.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub table: String,
    pub assignments: Vec<(String, Value)>,
    pub predicate: Option<Predicate>,
}

impl Update {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            assignments: Vec::new(),
            predicate: None,
        }
    }

    pub fn set(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.assignments.push((column.into(), value.into()));
        self
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    pub table: String,
    pub predicate: Option<Predicate>,
}

impl Delete {
    pub fn from(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            predicate: None,
        }
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub table: String,
    /// Empty selects every column.
    pub columns: Vec<String>,
    pub predicate: Option<Predicate>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl Select {
    pub fn from(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            predicate: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn order_by(mut self, column: impl Into<String>) -> Self {
        self.order_by.push(OrderBy {
            column: column.into(),
            descending: false,
        });
        self
    }

    pub fn order_by_desc(mut self, column: impl Into<String>) -> Self {
        self.order_by.push(OrderBy {
            column: column.into(),
            descending: true,
        });
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Coarse classification of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Ddl,
    Dml,
    Query,
}

/// A logical operation against one database.
#[derive(Debug, Clone, PartialEq)]
pub enum StatementDescriptor {
    CreateTable(CreateTable),
    DropTable { table: String, if_exists: bool },
    CreateIndex(CreateIndex),
    Insert(Insert),
    Update(Update),
    Delete(Delete),
    Select(Select),
    /// Engine SQL with `?` placeholders, not translated.
    Raw { sql: String, params: Vec<Value> },
}

impl StatementDescriptor {
    pub fn raw(sql: impl Into<String>) -> Self {
        Self::Raw {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn raw_with_params<I, V>(sql: impl Into<String>, params: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::Raw {
            sql: sql.into(),
            params: params.into_iter().map(Into::into).collect(),
        }
    }

    pub fn drop_table(table: impl Into<String>) -> Self {
        Self::DropTable {
            table: table.into(),
            if_exists: false,
        }
    }

    pub fn drop_table_if_exists(table: impl Into<String>) -> Self {
        Self::DropTable {
            table: table.into(),
            if_exists: true,
        }
    }

    pub fn operation_kind(&self) -> OperationKind {
        match self {
            Self::CreateTable(_) | Self::DropTable { .. } | Self::CreateIndex(_) => {
                OperationKind::Ddl
            }
            Self::Insert(_) | Self::Update(_) | Self::Delete(_) => OperationKind::Dml,
            Self::Select(_) => OperationKind::Query,
            Self::Raw { sql, .. } => classify_raw(sql),
        }
    }

    /// Whether the statement only reads, so it can run in a read-only transaction.
    pub fn is_read_only(&self) -> bool {
        self.operation_kind() == OperationKind::Query
    }
}

fn classify_raw(sql: &str) -> OperationKind {
    let keyword = sql
        .trim_start_matches(|c: char| c.is_whitespace() || c == '(')
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    match keyword.as_str() {
        // `PRAGMA name = value` writes a setting
        "pragma" if sql.contains('=') => OperationKind::Dml,
        "select" | "values" | "show" | "explain" | "describe" | "pragma" => OperationKind::Query,
        "create" | "drop" | "alter" | "truncate" | "rename" => OperationKind::Ddl,
        _ => OperationKind::Dml,
    }
}

impl From<CreateTable> for StatementDescriptor {
    fn from(s: CreateTable) -> Self {
        Self::CreateTable(s)
    }
}

impl From<CreateIndex> for StatementDescriptor {
    fn from(s: CreateIndex) -> Self {
        Self::CreateIndex(s)
    }
}

impl From<Insert> for StatementDescriptor {
    fn from(s: Insert) -> Self {
        Self::Insert(s)
    }
}

impl From<Update> for StatementDescriptor {
    fn from(s: Update) -> Self {
        Self::Update(s)
    }
}

impl From<Delete> for StatementDescriptor {
    fn from(s: Delete) -> Self {
        Self::Delete(s)
    }
}

impl From<Select> for StatementDescriptor {
    fn from(s: Select) -> Self {
        Self::Select(s)
    }
}

impl From<&str> for StatementDescriptor {
    fn from(sql: &str) -> Self {
        Self::raw(sql)
    }
}

impl From<String> for StatementDescriptor {
    fn from(sql: String) -> Self {
        Self::raw(sql)
    }
}
