//! Query and table-browser tabs.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::connection::ConnectionId;
use super::database::{Database, DatabaseId};
use super::query::{Row, TableInfo};
use crate::state::LoadStatus;

/// Unique, monotonically assigned tab identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub i64);

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a tab shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TabKind {
    /// Free-form SQL editor
    #[default]
    Query,
    /// Browser over a single table
    Table,
}

impl TabKind {
    /// Get string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Table => "table",
        }
    }

    /// Parse from string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "query" => Some(Self::Query),
            "table" => Some(Self::Table),
            _ => None,
        }
    }
}

/// Row filters of a table-browser tab.
///
/// Every field is raw SQL text spliced into the generated query; empty means
/// "not set".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TableFilters {
    /// Select list (`*` when empty)
    pub select: String,
    /// Row limit
    pub limit: String,
    /// Row offset
    pub offset: String,
    /// WHERE condition
    #[serde(rename = "where")]
    pub where_clause: String,
    /// ORDER BY list
    pub order_by: String,
    /// GROUP BY list
    pub group_by: String,
}

/// One independent editing/browsing session.
#[derive(Debug, Clone)]
pub struct Tab {
    /// Identifier
    pub id: TabId,
    /// Display name
    pub name: String,
    /// What the tab shows
    pub kind: TabKind,
    /// Editor contents
    pub editor_text: String,
    /// Rendered output of the last applied run
    pub output_text: String,
    /// Whether this is the focused tab
    pub is_active: bool,
    /// Database the tab runs against
    pub active_database_id: Option<DatabaseId>,
    /// Label of the bound database (`"{connection} - {database}"`)
    pub active_database_name: Option<String>,
    /// Accent color of the bound database
    pub active_database_color: Option<String>,
    /// Connection the tab targets
    pub bound_connection_id: Option<ConnectionId>,
    /// Display name of that connection
    pub bound_connection_name: Option<String>,
    /// Database name the tab targets
    pub bound_database_name: Option<String>,
    /// Table browsed by a table tab
    pub table: Option<String>,
    /// Filters of a table tab
    pub filters: TableFilters,
    /// Free-text filter over `table_columns_list`
    pub table_columns_filter: String,
    /// Column names of the browsed table
    pub table_columns_list: Vec<String>,
    /// Structure, indexes and rules of the browsed table
    pub table_info: Option<TableInfo>,
    /// Columns of the last applied result
    pub last_columns: Vec<String>,
    /// Rows of the last applied result
    pub last_rows: Vec<Row>,
    /// Message of the last failed run
    pub last_error: Option<String>,
    /// Bumped on every run; only the newest run may write results
    pub generation: u64,
    /// Bumped on every table details load
    pub info_generation: u64,
    /// Status of the newest run
    pub query_status: LoadStatus,
}

impl Tab {
    /// Create an unbound, inactive tab.
    pub fn new(id: TabId, name: impl Into<String>, kind: TabKind) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            editor_text: String::new(),
            output_text: String::new(),
            is_active: false,
            active_database_id: None,
            active_database_name: None,
            active_database_color: None,
            bound_connection_id: None,
            bound_connection_name: None,
            bound_database_name: None,
            table: None,
            filters: TableFilters::default(),
            table_columns_filter: String::new(),
            table_columns_list: Vec::new(),
            table_info: None,
            last_columns: Vec::new(),
            last_rows: Vec::new(),
            last_error: None,
            generation: 0,
            info_generation: 0,
            query_status: LoadStatus::Idle,
        }
    }

    /// Point the tab at `database`.
    pub fn bind(&mut self, database: &Database) {
        self.active_database_id = Some(database.id.clone());
        self.active_database_name = Some(database.label());
        self.active_database_color = Some(database.color.clone());
        self.bound_connection_id = Some(database.connection_id);
        self.bound_connection_name = Some(database.connection_name.clone());
        self.bound_database_name = Some(database.name.clone());
    }

    /// Drop the live database reference.
    ///
    /// Query tabs forget their target entirely. Table tabs keep their
    /// connection id and database name so they can be rebound once that
    /// database is loaded again.
    pub fn unbind(&mut self) {
        self.active_database_id = None;
        self.active_database_name = None;
        self.active_database_color = None;
        if self.kind == TabKind::Query {
            self.bound_connection_id = None;
            self.bound_connection_name = None;
            self.bound_database_name = None;
        }
    }

    /// Whether a table tab targets `database` by connection and name.
    pub fn targets(&self, database: &Database) -> bool {
        self.bound_connection_id == Some(database.connection_id)
            && self.bound_database_name.as_deref() == Some(database.name.as_str())
    }
}

/// Build the row query of a table tab.
///
/// An empty limit means `max_limit`; a limit that is not a number or exceeds
/// `max_limit` is rejected with a user-facing message.
pub fn build_table_query(table: &str, filters: &TableFilters, max_limit: u32) -> Result<String, String> {
    let limit = match filters.limit.trim() {
        "" => max_limit,
        raw => {
            let limit: u32 = raw.parse().map_err(|_| "limit is not a number".to_string())?;
            if limit > max_limit {
                return Err(format!("limit cannot be greater than {max_limit}"));
            }
            limit
        }
    };

    let select = match filters.select.trim() {
        "" => "*",
        select => select,
    };
    let mut sql = format!("SELECT {select} FROM {table}");
    for (keyword, clause) in [
        ("WHERE", &filters.where_clause),
        ("GROUP BY", &filters.group_by),
        ("ORDER BY", &filters.order_by),
    ] {
        let clause = clause.trim();
        if !clause.is_empty() {
            sql.push_str(&format!(" {keyword} {clause}"));
        }
    }
    sql.push_str(&format!(" LIMIT {limit}"));

    let offset = filters.offset.trim();
    if !offset.is_empty() {
        let offset: u64 = offset.parse().map_err(|_| "offset is not a number".to_string())?;
        sql.push_str(&format!(" OFFSET {offset}"));
    }
    Ok(sql)
}
