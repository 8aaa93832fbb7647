//! SQL generation and database clients.

mod memory;
mod postgres;

pub use memory::MemoryDb;
pub use postgres::PgClient;

use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, FlowResult};
use crate::flow_error;
use crate::types::{Cell, TableRow};

/// SQL dialect a client speaks, controlling quoting and statement shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dialect {
    Postgres,
    MySql,
    SqlServer,
    Sqlite,
}

impl Dialect {
    fn begin_quote(&self) -> &'static str {
        match self {
            Dialect::SqlServer => "[",
            Dialect::MySql => "`",
            Dialect::Postgres | Dialect::Sqlite => "\"",
        }
    }

    fn end_quote(&self) -> &'static str {
        match self {
            Dialect::SqlServer => "]",
            Dialect::MySql => "`",
            Dialect::Postgres | Dialect::Sqlite => "\"",
        }
    }

    /// Quotes an identifier.
    pub fn quote(&self, name: &str) -> String {
        format!("{}{}{}", self.begin_quote(), name, self.end_quote())
    }

    /// Builds the expression concatenating the quoted columns into one string.
    ///
    /// A single column is used as-is. SQLite concatenates with `||`, every other
    /// dialect with `CONCAT`.
    pub fn concat_columns(&self, columns: &[String]) -> String {
        let quoted: Vec<String> = columns.iter().map(|column| self.quote(column)).collect();

        if quoted.len() == 1 {
            return quoted.into_iter().next().unwrap_or_default();
        }

        match self {
            Dialect::Sqlite => quoted.join(" || "),
            _ => format!("CONCAT({})", quoted.join(", ")),
        }
    }

    /// Builds a `<key-expression> IN ('id', ...)` predicate over record identities.
    ///
    /// Identities are the separator-free concatenation of the key columns' canonical
    /// text, matching [`Mergeable::id`](crate::mergeable::Mergeable::id).
    pub fn id_in_predicate(&self, key_columns: &[String], ids: &[String]) -> FlowResult<String> {
        if key_columns.is_empty() {
            return Err(flow_error!(
                ErrorKind::InvalidState,
                "Identity predicate requires at least one key column"
            ));
        }

        let quoted_ids: Vec<String> = ids
            .iter()
            .map(|id| format!("'{}'", escape_text(id)))
            .collect();

        Ok(format!(
            "{} IN ({})",
            self.concat_columns(key_columns),
            quoted_ids.join(",")
        ))
    }

    /// Builds the full-table select for the given columns.
    pub fn select_sql(&self, table: &str, columns: &[String]) -> String {
        let quoted: Vec<String> = columns.iter().map(|column| self.quote(column)).collect();

        format!("SELECT {} FROM {}", quoted.join(", "), self.quote(table))
    }

    /// Builds the statement removing all rows from a table.
    ///
    /// SQLite has no `TRUNCATE`, so it falls back to an unfiltered `DELETE`.
    pub fn truncate_sql(&self, table: &str) -> String {
        match self {
            Dialect::Sqlite => format!("DELETE FROM {}", self.quote(table)),
            _ => format!("TRUNCATE TABLE {}", self.quote(table)),
        }
    }

    /// Builds a delete targeting the rows whose identity is in `ids`.
    pub fn delete_by_ids_sql(
        &self,
        table: &str,
        key_columns: &[String],
        ids: &[String],
    ) -> FlowResult<String> {
        Ok(format!(
            "DELETE FROM {} WHERE {}",
            self.quote(table),
            self.id_in_predicate(key_columns, ids)?
        ))
    }

    /// Renders a cell as a SQL literal.
    pub fn literal(&self, cell: &Cell) -> String {
        match cell {
            Cell::Null => "NULL".to_owned(),
            Cell::Bool(value) => if *value { "TRUE" } else { "FALSE" }.to_owned(),
            Cell::I16(value) => value.to_string(),
            Cell::I32(value) => value.to_string(),
            Cell::I64(value) => value.to_string(),
            Cell::F32(value) => value.to_string(),
            Cell::F64(value) => value.to_string(),
            Cell::Bytes(value) => match self {
                Dialect::Postgres => format!("'\\x{}'", crate::types::cell_hex(value)),
                _ => format!("X'{}'", crate::types::cell_hex(value)),
            },
            other => format!("'{}'", escape_text(&other.to_sql_text())),
        }
    }
}

/// Escapes single quotes for embedding in a SQL string literal.
fn escape_text(text: &str) -> String {
    text.replace('\'', "''")
}

/// A table name together with its identity columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableIdentity {
    name: String,
    primary_key: Vec<String>,
}

impl TableIdentity {
    /// Creates a table identity. An empty or whitespace-only name is fatal.
    pub fn new(name: impl Into<String>, primary_key: Vec<String>) -> FlowResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(flow_error!(
                ErrorKind::InvalidTableName,
                "Table name must not be empty"
            ));
        }

        Ok(Self { name, primary_key })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    pub fn has_primary_key(&self) -> bool {
        !self.primary_key.is_empty()
    }
}

/// Capabilities the pipeline needs from a database.
///
/// Clients are cheap to clone and shared across stage tasks. Connection lifecycle
/// (pooling, reconnects, TLS) is the caller's concern.
pub trait DbClient: Clone + Send + Sync + 'static {
    /// The dialect used to generate SQL for this client.
    fn dialect(&self) -> Dialect;

    /// Runs a query and materializes all result rows.
    fn execute_reader(&self, sql: &str) -> impl Future<Output = FlowResult<Vec<TableRow>>> + Send;

    /// Runs a statement and returns the affected row count.
    fn execute(&self, sql: &str) -> impl Future<Output = FlowResult<u64>> + Send;

    /// Appends rows to a table.
    fn bulk_insert(
        &self,
        table: &TableIdentity,
        columns: &[String],
        rows: Vec<TableRow>,
    ) -> impl Future<Output = FlowResult<()>> + Send;
}
