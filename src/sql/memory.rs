//! In-memory database client used by tests.
//!
//! Understands exactly the statement shapes the SQL generators in this crate
//! produce: full-table selects with an optional identity `IN` filter, identity
//! deletes, and truncation. Row identities are computed from the table's declared
//! primary key the same way [`Mergeable::id`](crate::mergeable::Mergeable::id)
//! renders them.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{ErrorKind, FlowResult};
use crate::flow_error;
use crate::sql::{DbClient, Dialect, TableIdentity};
use crate::types::{Cell, TableRow};

struct MemTable {
    identity: TableIdentity,
    columns: Vec<String>,
    rows: Vec<TableRow>,
}

impl MemTable {
    fn key_positions(&self) -> Vec<usize> {
        self.identity
            .primary_key()
            .iter()
            .filter_map(|key| self.columns.iter().position(|column| column == key))
            .collect()
    }

    fn row_id(&self, row: &TableRow, key_positions: &[usize]) -> String {
        key_positions
            .iter()
            .filter_map(|&position| row.get(position))
            .map(Cell::to_sql_text)
            .collect()
    }
}

#[derive(Default)]
struct Inner {
    tables: HashMap<String, MemTable>,
}

/// In-memory [`DbClient`] speaking the Postgres dialect.
#[derive(Clone, Default)]
pub struct MemoryDb {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a table with its column order.
    pub async fn create_table(&self, identity: TableIdentity, columns: Vec<String>) {
        let mut inner = self.inner.lock().await;
        inner.tables.insert(
            identity.name().to_owned(),
            MemTable {
                identity,
                columns,
                rows: Vec::new(),
            },
        );
    }

    /// Seeds rows directly, bypassing SQL.
    pub async fn insert_rows(&self, table: &str, rows: Vec<TableRow>) -> FlowResult<()> {
        let mut inner = self.inner.lock().await;
        let table = inner
            .tables
            .get_mut(table)
            .ok_or_else(|| unknown_table(table))?;

        table.rows.extend(rows);
        Ok(())
    }

    /// Returns a snapshot of a table's rows.
    pub async fn table_rows(&self, table: &str) -> FlowResult<Vec<TableRow>> {
        let inner = self.inner.lock().await;
        let table = inner
            .tables
            .get(table)
            .ok_or_else(|| unknown_table(table))?;

        Ok(table.rows.clone())
    }
}

impl DbClient for MemoryDb {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn execute_reader(&self, sql: &str) -> FlowResult<Vec<TableRow>> {
        let trimmed = sql.trim();
        if !starts_with_keyword(trimmed, "select") {
            return Err(unsupported(sql));
        }

        let table_name = table_after_keyword(trimmed, " from ").ok_or_else(|| unsupported(sql))?;
        let filter_ids = parse_in_ids(trimmed)?;

        let inner = self.inner.lock().await;
        let table = inner
            .tables
            .get(&table_name)
            .ok_or_else(|| unknown_table(&table_name))?;

        let rows = match filter_ids {
            None => table.rows.clone(),
            Some(ids) => {
                let key_positions = table.key_positions();
                table
                    .rows
                    .iter()
                    .filter(|row| ids.contains(&table.row_id(row, &key_positions)))
                    .cloned()
                    .collect()
            }
        };

        debug!(table = %table_name, rows = rows.len(), "memory select");
        Ok(rows)
    }

    async fn execute(&self, sql: &str) -> FlowResult<u64> {
        let trimmed = sql.trim();

        if starts_with_keyword(trimmed, "truncate table") {
            let table_name =
                table_after_keyword(trimmed, "truncate table ").ok_or_else(|| unsupported(sql))?;

            let mut inner = self.inner.lock().await;
            let table = inner
                .tables
                .get_mut(&table_name)
                .ok_or_else(|| unknown_table(&table_name))?;

            let removed = table.rows.len() as u64;
            table.rows.clear();
            debug!(table = %table_name, removed, "memory truncate");
            return Ok(removed);
        }

        if starts_with_keyword(trimmed, "delete from") {
            let table_name =
                table_after_keyword(trimmed, "delete from ").ok_or_else(|| unsupported(sql))?;
            let ids = parse_in_ids(trimmed)?.ok_or_else(|| unsupported(sql))?;

            let mut inner = self.inner.lock().await;
            let table = inner
                .tables
                .get_mut(&table_name)
                .ok_or_else(|| unknown_table(&table_name))?;

            let key_positions = table.key_positions();
            let before = table.rows.len();
            let doomed: Vec<bool> = table
                .rows
                .iter()
                .map(|row| ids.contains(&table.row_id(row, &key_positions)))
                .collect();
            let mut keep = doomed.iter().map(|flag| !flag);
            table.rows.retain(|_| keep.next().unwrap_or(true));

            let removed = (before - table.rows.len()) as u64;
            debug!(table = %table_name, removed, "memory delete");
            return Ok(removed);
        }

        Err(unsupported(sql))
    }

    async fn bulk_insert(
        &self,
        table: &TableIdentity,
        columns: &[String],
        rows: Vec<TableRow>,
    ) -> FlowResult<()> {
        let mut inner = self.inner.lock().await;
        let target = inner
            .tables
            .get_mut(table.name())
            .ok_or_else(|| unknown_table(table.name()))?;

        if target.columns != columns {
            return Err(flow_error!(
                ErrorKind::InvalidData,
                "Insert column list does not match table",
                format!("table: {:?}, insert: {:?}", target.columns, columns)
            ));
        }

        debug!(table = %table.name(), rows = rows.len(), "memory insert");
        target.rows.extend(rows);
        Ok(())
    }
}

fn unknown_table(name: &str) -> crate::error::FlowError {
    flow_error!(ErrorKind::QueryFailed, "Unknown table", name.to_owned())
}

fn unsupported(sql: &str) -> crate::error::FlowError {
    flow_error!(
        ErrorKind::QueryFailed,
        "Unsupported statement shape",
        sql.to_owned()
    )
}

fn starts_with_keyword(sql: &str, keyword: &str) -> bool {
    sql.len() >= keyword.len() && sql[..keyword.len()].eq_ignore_ascii_case(keyword)
}

/// Extracts the (unquoted) table name following a keyword, case-insensitively.
fn table_after_keyword(sql: &str, keyword: &str) -> Option<String> {
    let lower = sql.to_ascii_lowercase();
    let start = lower.find(keyword)? + keyword.len();
    let rest = sql[start..].trim_start();
    let token = rest.split_whitespace().next()?;

    Some(token.trim_matches('"').to_owned())
}

/// Extracts the id list of an `IN ('a','b')` clause, if present.
fn parse_in_ids(sql: &str) -> FlowResult<Option<Vec<String>>> {
    let lower = sql.to_ascii_lowercase();
    let Some(position) = lower.find(" in (") else {
        return Ok(None);
    };

    let after = &sql[position + " in (".len()..];
    let close = after
        .rfind(')')
        .ok_or_else(|| unsupported(sql))?;
    let body = after[..close].trim();

    if body.is_empty() {
        return Ok(Some(Vec::new()));
    }

    // Scan quoted literal by quoted literal; a '' pair inside a literal is an
    // escaped quote, not a terminator, so ids containing ',' stay whole.
    let mut ids = Vec::new();
    let mut chars = body.chars().peekable();
    loop {
        if chars.next() != Some('\'') {
            return Err(unsupported(sql));
        }

        let mut id = String::new();
        loop {
            match chars.next() {
                Some('\'') => {
                    if chars.peek() == Some(&'\'') {
                        chars.next();
                        id.push('\'');
                    } else {
                        break;
                    }
                }
                Some(ch) => id.push(ch),
                None => return Err(unsupported(sql)),
            }
        }
        ids.push(id);

        match chars.next() {
            None => break,
            Some(',') => {
                while chars.peek() == Some(&' ') {
                    chars.next();
                }
            }
            Some(_) => return Err(unsupported(sql)),
        }
    }

    Ok(Some(ids))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded_db() -> MemoryDb {
        let db = MemoryDb::new();
        let identity = TableIdentity::new("items", vec!["id".to_owned()]).unwrap();
        db.create_table(identity, vec!["id".to_owned(), "name".to_owned()])
            .await;
        db.insert_rows(
            "items",
            vec![
                TableRow::new(vec![Cell::I64(1), Cell::String("a".to_owned())]),
                TableRow::new(vec![Cell::I64(2), Cell::String("b".to_owned())]),
                TableRow::new(vec![Cell::I64(3), Cell::String("c".to_owned())]),
            ],
        )
        .await
        .unwrap();

        db
    }

    #[tokio::test]
    async fn select_returns_all_rows() {
        let db = seeded_db().await;
        let rows = db
            .execute_reader("SELECT \"id\", \"name\" FROM \"items\"")
            .await
            .unwrap();

        assert_eq!(rows.len(), 3);
    }

    #[tokio::test]
    async fn select_filters_on_identity() {
        let db = seeded_db().await;
        let rows = db
            .execute_reader("SELECT \"id\", \"name\" FROM \"items\" WHERE \"id\" IN ('1','3')")
            .await
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get(0), Some(&Cell::I64(1)));
        assert_eq!(rows[1].get(0), Some(&Cell::I64(3)));
    }

    #[tokio::test]
    async fn delete_removes_matching_identities() {
        let db = seeded_db().await;
        let removed = db
            .execute("DELETE FROM \"items\" WHERE \"id\" IN ('2')")
            .await
            .unwrap();

        assert_eq!(removed, 1);
        assert_eq!(db.table_rows("items").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn truncate_clears_table() {
        let db = seeded_db().await;
        let removed = db.execute("TRUNCATE TABLE \"items\"").await.unwrap();

        assert_eq!(removed, 3);
        assert!(db.table_rows("items").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn escaped_quotes_round_trip() {
        let db = MemoryDb::new();
        let identity = TableIdentity::new("people", vec!["name".to_owned()]).unwrap();
        db.create_table(identity, vec!["name".to_owned()]).await;
        db.insert_rows(
            "people",
            vec![TableRow::new(vec![Cell::String("O'Brien".to_owned())])],
        )
        .await
        .unwrap();

        let removed = db
            .execute("DELETE FROM \"people\" WHERE \"name\" IN ('O''Brien')")
            .await
            .unwrap();

        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn ids_containing_quoted_separators_stay_whole() {
        let db = MemoryDb::new();
        let identity = TableIdentity::new("people", vec!["name".to_owned()]).unwrap();
        db.create_table(identity, vec!["name".to_owned()]).await;
        db.insert_rows(
            "people",
            vec![
                TableRow::new(vec![Cell::String("a','b".to_owned())]),
                TableRow::new(vec![Cell::String("a".to_owned())]),
            ],
        )
        .await
        .unwrap();

        // The single escaped id must not split into 'a' and 'b'.
        let removed = db
            .execute("DELETE FROM \"people\" WHERE \"name\" IN ('a'',''b')")
            .await
            .unwrap();

        assert_eq!(removed, 1);
        let rows = db.table_rows("people").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get(0), Some(&Cell::String("a".to_owned())));
    }

    #[tokio::test]
    async fn unsupported_statements_are_rejected() {
        let db = seeded_db().await;
        assert!(db.execute("UPDATE items SET name = 'x'").await.is_err());
    }
}
