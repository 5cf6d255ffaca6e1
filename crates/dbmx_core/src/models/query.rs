//! Query execution and RPC payload models.
//!
//! These are the typed shapes exchanged with the backend. All of them reject
//! unknown fields when decoded so a payload of the wrong shape fails fast.

use serde::{Deserialize, Serialize};

use super::connection::ConnectionId;
use super::database::DatabaseId;
use super::tab::TabId;

/// Type of SQL statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryType {
    /// SELECT/WITH query returning rows
    Select,
    /// INSERT operation
    Insert,
    /// UPDATE operation
    Update,
    /// DELETE operation
    Delete,
    /// CREATE, ALTER, DROP or TRUNCATE
    Ddl,
    /// Anything else (EXPLAIN, SET, SHOW, ...)
    Other,
}

impl QueryType {
    /// Detect the type of a SQL statement from its leading keyword.
    pub fn detect(sql: &str) -> Self {
        let trimmed = sql.trim_start().to_uppercase();
        let keyword = trimmed.split(|c: char| !c.is_ascii_alphabetic()).next().unwrap_or("");

        match keyword {
            "SELECT" | "WITH" | "VALUES" | "TABLE" => Self::Select,
            "INSERT" => Self::Insert,
            "UPDATE" => Self::Update,
            "DELETE" => Self::Delete,
            "CREATE" | "ALTER" | "DROP" | "TRUNCATE" => Self::Ddl,
            _ => Self::Other,
        }
    }

    /// Whether the statement mutates data or schema.
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Delete | Self::Ddl)
    }
}

/// One value of a result row, tagged with its column name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Cell {
    /// Column name
    pub column: String,
    /// Value rendered as text
    pub value: String,
}

impl Cell {
    /// Create a cell.
    pub fn new(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self { column: column.into(), value: value.into() }
    }
}

/// Result row.
pub type Row = Vec<Cell>;

/// Column names plus rows of cells.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnTable {
    /// Column names, in order
    pub columns: Vec<String>,
    /// Rows, each with one cell per column
    pub rows: Vec<Row>,
}

impl ColumnTable {
    /// Create a table from columns and rows.
    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    /// Check that every row has one cell per column, in column order.
    pub fn validate(&self) -> Result<(), String> {
        validate_rows(&self.columns, &self.rows)
    }

    /// Distinct values of `column`, in first-seen order.
    pub fn distinct_values(&self, column: &str) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.rows
            .iter()
            .filter_map(|row| row.iter().find(|cell| cell.column == column))
            .filter(|cell| seen.insert(cell.value.clone()))
            .map(|cell| cell.value.clone())
            .collect()
    }
}

fn validate_rows(columns: &[String], rows: &[Row]) -> Result<(), String> {
    for (index, row) in rows.iter().enumerate() {
        if row.len() != columns.len() {
            return Err(format!(
                "row {index} has {} cells but the result has {} columns",
                row.len(),
                columns.len()
            ));
        }
        if let Some((cell, expected)) =
            row.iter().zip(columns).find(|(cell, column)| &cell.column != *column)
        {
            return Err(format!(
                "row {index} has cell for column '{}' where '{expected}' was expected",
                cell.column
            ));
        }
    }
    Ok(())
}

/// Outcome of running a statement.
///
/// A failed statement is a normal result with `ok = false`, not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct QueryResult {
    /// Whether the statement succeeded
    pub ok: bool,
    /// Result column names
    pub columns: Vec<String>,
    /// Result rows
    pub rows: Vec<Row>,
    /// Rows affected by a mutating statement
    pub rows_affected: i64,
    /// Engine message (error text when `ok` is false)
    pub message: String,
}

impl QueryResult {
    /// Successful result carrying rows.
    pub fn rows(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self { ok: true, columns, rows, rows_affected: 0, message: String::new() }
    }

    /// Successful result of a mutating statement.
    pub fn affected(rows_affected: i64) -> Self {
        let column = "Rows Affected".to_string();
        Self {
            ok: true,
            columns: vec![column.clone()],
            rows: vec![vec![Cell::new(column, rows_affected.to_string())]],
            rows_affected,
            message: String::new(),
        }
    }

    /// Failed result with a human-readable message.
    pub fn failure(message: impl Into<String>) -> Self {
        Self { ok: false, message: message.into(), ..Default::default() }
    }

    /// Check that the rows match the columns.
    pub fn validate(&self) -> Result<(), String> {
        validate_rows(&self.columns, &self.rows)
    }
}

/// Columns and rows rendered into a tab's output pane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryOutput {
    /// Column names
    pub columns: Vec<String>,
    /// Rows
    pub rows: Vec<Row>,
}

/// Structure, indexes and constraints of one table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableInfo {
    /// Column definitions
    pub structure: ColumnTable,
    /// Index definitions
    pub indexes: ColumnTable,
    /// Constraint definitions
    pub rules: ColumnTable,
}

impl TableInfo {
    /// Check every contained table.
    pub fn validate(&self) -> Result<(), String> {
        self.structure.validate()?;
        self.indexes.validate()?;
        self.rules.validate()
    }
}

/// Column of the structure table naming the owning table.
pub const TABLE_NAME_COLUMN: &str = "table_name";
/// Column of the structure table naming the column.
pub const COLUMN_NAME_COLUMN: &str = "column_name";

/// Schema of a whole database as returned by a schema load.
///
/// The structure table has one row per column of every user table and
/// carries at least the `table_name` and `column_name` columns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SchemaPayload {
    /// Backend pool serving this database
    pub pool_id: String,
    /// Column definitions across all tables
    pub structure: ColumnTable,
    /// Index definitions across all tables
    pub indexes: ColumnTable,
    /// Constraint definitions across all tables
    pub rules: ColumnTable,
}

impl SchemaPayload {
    /// Check every contained table.
    pub fn validate(&self) -> Result<(), String> {
        if self.pool_id.is_empty() {
            return Err("schema payload has no pool id".to_string());
        }
        self.structure.validate()?;
        self.indexes.validate()?;
        self.rules.validate()
    }

    /// Table names in first-seen order.
    pub fn tables(&self) -> Vec<String> {
        self.structure.distinct_values(TABLE_NAME_COLUMN)
    }

    /// Column names in first-seen order.
    pub fn columns(&self) -> Vec<String> {
        self.structure.distinct_values(COLUMN_NAME_COLUMN)
    }
}

/// What the backend needs to know to run a statement for a tab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabContext {
    /// Tab the statement was run from
    pub tab_id: TabId,
    /// Connection of the bound database
    pub connection_id: ConnectionId,
    /// Bound database
    pub database_id: DatabaseId,
    /// Database name
    pub database_name: String,
    /// Backend pool of the bound database (empty if its schema is not loaded)
    pub pool_id: String,
}
