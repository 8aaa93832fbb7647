//! PostgreSQL client backed by tokio-postgres.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use tokio_postgres::types::Type;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ErrorKind, FlowResult};
use crate::flow_error;
use crate::sql::{DbClient, Dialect, TableIdentity};
use crate::types::{Cell, TableRow};

/// [`DbClient`] implementation for PostgreSQL.
///
/// Wraps a shared [`tokio_postgres::Client`]; the connection task is driven in the
/// background. TLS and pooling are out of scope, callers needing them can build the
/// client themselves and use [`PgClient::from_client`].
#[derive(Clone)]
pub struct PgClient {
    client: Arc<Client>,
}

impl PgClient {
    /// Connects with a libpq-style connection string.
    pub async fn connect(config: &str) -> FlowResult<Self> {
        let (client, connection) = tokio_postgres::connect(config, NoTls).await?;

        tokio::spawn(async move {
            if let Err(err) = connection.await {
                warn!(error = %err, "postgres connection terminated");
            }
        });

        Ok(Self::from_client(client))
    }

    /// Wraps an already established client.
    pub fn from_client(client: Client) -> Self {
        Self {
            client: Arc::new(client),
        }
    }
}

impl DbClient for PgClient {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn execute_reader(&self, sql: &str) -> FlowResult<Vec<TableRow>> {
        let rows = self.client.query(sql, &[]).await?;
        debug!(rows = rows.len(), "postgres query");

        rows.iter().map(row_to_table_row).collect()
    }

    async fn execute(&self, sql: &str) -> FlowResult<u64> {
        let affected = self.client.execute(sql, &[]).await?;
        debug!(affected, "postgres execute");

        Ok(affected)
    }

    async fn bulk_insert(
        &self,
        table: &TableIdentity,
        columns: &[String],
        rows: Vec<TableRow>,
    ) -> FlowResult<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let dialect = self.dialect();
        let quoted_columns: Vec<String> =
            columns.iter().map(|column| dialect.quote(column)).collect();

        let mut values = Vec::with_capacity(rows.len());
        for row in &rows {
            let rendered: Vec<String> = row
                .values()
                .iter()
                .map(|cell| dialect.literal(cell))
                .collect();
            values.push(format!("({})", rendered.join(", ")));
        }

        let sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            dialect.quote(table.name()),
            quoted_columns.join(", "),
            values.join(", ")
        );

        let inserted = self.client.execute(&sql, &[]).await?;
        debug!(table = %table.name(), inserted, "postgres bulk insert");

        Ok(())
    }
}

/// Converts a typed result row into the positional cell representation.
fn row_to_table_row(row: &Row) -> FlowResult<TableRow> {
    let mut values = Vec::with_capacity(row.columns().len());

    for (index, column) in row.columns().iter().enumerate() {
        let ty = column.type_();
        let cell = if *ty == Type::BOOL {
            row.try_get::<_, Option<bool>>(index)?.map(Cell::Bool)
        } else if *ty == Type::INT2 {
            row.try_get::<_, Option<i16>>(index)?.map(Cell::I16)
        } else if *ty == Type::INT4 {
            row.try_get::<_, Option<i32>>(index)?.map(Cell::I32)
        } else if *ty == Type::INT8 {
            row.try_get::<_, Option<i64>>(index)?.map(Cell::I64)
        } else if *ty == Type::FLOAT4 {
            row.try_get::<_, Option<f32>>(index)?.map(Cell::F32)
        } else if *ty == Type::FLOAT8 {
            row.try_get::<_, Option<f64>>(index)?.map(Cell::F64)
        } else if *ty == Type::TEXT || *ty == Type::VARCHAR || *ty == Type::BPCHAR {
            row.try_get::<_, Option<String>>(index)?.map(Cell::String)
        } else if *ty == Type::DATE {
            row.try_get::<_, Option<NaiveDate>>(index)?.map(Cell::Date)
        } else if *ty == Type::TIME {
            row.try_get::<_, Option<NaiveTime>>(index)?.map(Cell::Time)
        } else if *ty == Type::TIMESTAMP {
            row.try_get::<_, Option<NaiveDateTime>>(index)?
                .map(Cell::Timestamp)
        } else if *ty == Type::TIMESTAMPTZ {
            row.try_get::<_, Option<DateTime<Utc>>>(index)?
                .map(Cell::TimestampTz)
        } else if *ty == Type::UUID {
            row.try_get::<_, Option<Uuid>>(index)?.map(Cell::Uuid)
        } else if *ty == Type::JSON || *ty == Type::JSONB {
            row.try_get::<_, Option<serde_json::Value>>(index)?
                .map(Cell::Json)
        } else if *ty == Type::BYTEA {
            row.try_get::<_, Option<Vec<u8>>>(index)?.map(Cell::Bytes)
        } else {
            return Err(flow_error!(
                ErrorKind::ConversionError,
                "Unsupported column type",
                format!("column {} has type {}", column.name(), ty)
            ));
        };

        values.push(cell.unwrap_or(Cell::Null));
    }

    Ok(TableRow::new(values))
}
