//! Postgres-backed data store used in production deployments.
//!
//! Each logical table maps to one relation of `(row_key TEXT PRIMARY KEY,
//! columns JSONB)` where `columns` is an object from column name to
//! base64-encoded value. Lexicographic range scans become ordered
//! `row_key` comparisons; `more_available` is computed by reading one row
//! past the requested page.

use std::collections::BTreeMap;

use axum::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row as _};
use tracing::{error, info};

use super::{check_read_args, DataStore, ReadResponse, Row, StoreError, Table, MAX_COLUMNS_PER_WRITE};

#[derive(Clone)]
pub struct PostgresStore {
    db: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let db = PgPoolOptions::new().connect(database_url).await?;
        let store = Self { db };
        store
            .ensure_schema()
            .await
            .inspect_err(|err| error!(?err, "could not prepare Postgres schema"))?;
        info!("connected to Postgres backend");
        Ok(store)
    }

    pub async fn from_env() -> Result<Self, sqlx::Error> {
        let _ = dotenvy::dotenv();
        let database_url = std::env::var("DATABASE_URL")
            .expect("Missing DATABASE_URL env var even though the 'postgres' feature is active");
        Self::connect(&database_url).await
    }

    async fn ensure_schema(&self) -> Result<(), sqlx::Error> {
        for relation in [
            "tally_observations",
            "tally_report_metadata",
            "tally_report_rows",
        ] {
            sqlx::query(&format!(
                "CREATE TABLE IF NOT EXISTS {relation} (
                     row_key TEXT PRIMARY KEY,
                     columns JSONB NOT NULL DEFAULT '{{}}'::jsonb
                 )"
            ))
            .execute(&self.db)
            .await?;
        }
        Ok(())
    }
}

fn relation(table: Table) -> &'static str {
    match table {
        Table::Observations => "tally_observations",
        Table::ReportMetadata => "tally_report_metadata",
        Table::ReportRows => "tally_report_rows",
    }
}

fn sql_error(err: sqlx::Error) -> StoreError {
    StoreError::OperationFailed(format!("postgres: {err}"))
}

fn encode_columns(columns: &BTreeMap<String, Vec<u8>>) -> serde_json::Value {
    serde_json::Value::Object(
        columns
            .iter()
            .map(|(name, value)| {
                (
                    name.clone(),
                    serde_json::Value::String(STANDARD.encode(value)),
                )
            })
            .collect(),
    )
}

fn decode_columns(
    value: serde_json::Value,
    column_names: &[String],
) -> Result<BTreeMap<String, Vec<u8>>, StoreError> {
    let serde_json::Value::Object(object) = value else {
        return Err(StoreError::OperationFailed(
            "columns payload is not an object".to_string(),
        ));
    };
    let mut columns = BTreeMap::new();
    for (name, value) in object {
        if !column_names.is_empty() && !column_names.contains(&name) {
            continue;
        }
        let serde_json::Value::String(encoded) = value else {
            return Err(StoreError::OperationFailed(format!(
                "column {name} is not a string"
            )));
        };
        let decoded = STANDARD
            .decode(encoded.as_bytes())
            .map_err(|err| StoreError::OperationFailed(format!("column {name}: {err}")))?;
        columns.insert(name, decoded);
    }
    Ok(columns)
}

#[async_trait]
impl DataStore for PostgresStore {
    async fn write_row(&self, table: Table, row: Row) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO {} (row_key, columns) VALUES ($1, $2)
             ON CONFLICT (row_key) DO UPDATE SET columns = {0}.columns || EXCLUDED.columns",
            relation(table)
        ))
        .bind(&row.key)
        .bind(encode_columns(&row.column_values))
        .execute(&self.db)
        .await
        .map_err(sql_error)?;
        Ok(())
    }

    async fn write_rows(&self, table: Table, rows: Vec<Row>) -> Result<(), StoreError> {
        let total_columns: usize = rows.iter().map(|row| row.column_values.len()).sum();
        if total_columns > MAX_COLUMNS_PER_WRITE {
            return Err(StoreError::InvalidArguments(format!(
                "write_rows carries {total_columns} columns, limit is {MAX_COLUMNS_PER_WRITE}"
            )));
        }
        let mut transaction = self.db.begin().await.map_err(sql_error)?;
        for row in rows {
            sqlx::query(&format!(
                "INSERT INTO {} (row_key, columns) VALUES ($1, $2)
                 ON CONFLICT (row_key) DO UPDATE SET columns = {0}.columns || EXCLUDED.columns",
                relation(table)
            ))
            .bind(&row.key)
            .bind(encode_columns(&row.column_values))
            .execute(&mut *transaction)
            .await
            .map_err(sql_error)?;
        }
        transaction.commit().await.map_err(sql_error)
    }

    async fn read_row(
        &self,
        table: Table,
        row_key: &str,
        column_names: &[String],
    ) -> Result<Row, StoreError> {
        let record = sqlx::query(&format!(
            "SELECT columns FROM {} WHERE row_key = $1",
            relation(table)
        ))
        .bind(row_key)
        .fetch_optional(&self.db)
        .await
        .map_err(sql_error)?
        .ok_or(StoreError::NotFound)?;

        let columns: serde_json::Value = record.try_get("columns").map_err(sql_error)?;
        Ok(Row {
            key: row_key.to_string(),
            column_values: decode_columns(columns, column_names)?,
        })
    }

    async fn read_rows(
        &self,
        table: Table,
        start_row_key: &str,
        inclusive: bool,
        limit_row_key: &str,
        column_names: &[String],
        max_rows: usize,
    ) -> Result<ReadResponse, StoreError> {
        check_read_args(start_row_key, limit_row_key, max_rows)?;

        let comparison = if inclusive { ">=" } else { ">" };
        let upper_bound = if limit_row_key.is_empty() {
            ""
        } else {
            "AND row_key < $3"
        };
        // One row beyond the page tells us whether more are available.
        let query = format!(
            "SELECT row_key, columns FROM {} WHERE row_key {comparison} $1 {upper_bound}
             ORDER BY row_key LIMIT $2",
            relation(table)
        );
        let mut query = sqlx::query(&query)
            .bind(start_row_key)
            .bind((max_rows + 1) as i64);
        if !limit_row_key.is_empty() {
            query = query.bind(limit_row_key);
        }
        let records = query.fetch_all(&self.db).await.map_err(sql_error)?;

        let more_available = records.len() > max_rows;
        let mut rows = Vec::with_capacity(records.len().min(max_rows));
        for record in records.into_iter().take(max_rows) {
            let key: String = record.try_get("row_key").map_err(sql_error)?;
            let columns: serde_json::Value = record.try_get("columns").map_err(sql_error)?;
            rows.push(Row {
                key,
                column_values: decode_columns(columns, column_names)?,
            });
        }
        Ok(ReadResponse {
            rows,
            more_available,
        })
    }

    async fn delete_row(&self, table: Table, row_key: &str) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "DELETE FROM {} WHERE row_key = $1",
            relation(table)
        ))
        .bind(row_key)
        .execute(&self.db)
        .await
        .map_err(sql_error)?;
        Ok(())
    }

    async fn delete_rows_with_prefix(
        &self,
        table: Table,
        row_key_prefix: &str,
    ) -> Result<(), StoreError> {
        if row_key_prefix.is_empty() {
            return Err(StoreError::InvalidArguments(
                "row_key_prefix must not be empty".to_string(),
            ));
        }
        sqlx::query(&format!(
            "DELETE FROM {} WHERE starts_with(row_key, $1)",
            relation(table)
        ))
        .bind(row_key_prefix)
        .execute(&self.db)
        .await
        .map_err(sql_error)?;
        Ok(())
    }

    async fn delete_all_rows(&self, table: Table) -> Result<(), StoreError> {
        sqlx::query(&format!("DELETE FROM {}", relation(table)))
            .execute(&self.db)
            .await
            .map_err(sql_error)?;
        Ok(())
    }
}
