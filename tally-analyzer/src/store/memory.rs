//! In-memory data store used by tests and as the default storage backend.

use std::collections::BTreeMap;
use std::ops::Bound;

use axum::async_trait;
use tokio::sync::RwLock;

use super::{check_read_args, DataStore, ReadResponse, Row, StoreError, Table, MAX_COLUMNS_PER_WRITE};

type TableMap = BTreeMap<String, BTreeMap<String, Vec<u8>>>;

/// A [`DataStore`] over ordered in-memory maps. Key order matches the
/// lexicographic contract by construction.
#[derive(Debug, Default)]
pub struct MemoryStore {
    observations: RwLock<TableMap>,
    report_metadata: RwLock<TableMap>,
    report_rows: RwLock<TableMap>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, table: Table) -> &RwLock<TableMap> {
        match table {
            Table::Observations => &self.observations,
            Table::ReportMetadata => &self.report_metadata,
            Table::ReportRows => &self.report_rows,
        }
    }
}

fn project_columns(
    columns: &BTreeMap<String, Vec<u8>>,
    column_names: &[String],
) -> BTreeMap<String, Vec<u8>> {
    if column_names.is_empty() {
        return columns.clone();
    }
    column_names
        .iter()
        .filter_map(|name| {
            columns
                .get_key_value(name)
                .map(|(k, v)| (k.clone(), v.clone()))
        })
        .collect()
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn write_row(&self, table: Table, row: Row) -> Result<(), StoreError> {
        let mut guard = self.table(table).write().await;
        merge_row(&mut guard, row);
        Ok(())
    }

    async fn write_rows(&self, table: Table, rows: Vec<Row>) -> Result<(), StoreError> {
        let total_columns: usize = rows.iter().map(|row| row.column_values.len()).sum();
        if total_columns > MAX_COLUMNS_PER_WRITE {
            return Err(StoreError::InvalidArguments(format!(
                "write_rows carries {total_columns} columns, limit is {MAX_COLUMNS_PER_WRITE}"
            )));
        }
        let mut guard = self.table(table).write().await;
        for row in rows {
            merge_row(&mut guard, row);
        }
        Ok(())
    }

    async fn read_row(
        &self,
        table: Table,
        row_key: &str,
        column_names: &[String],
    ) -> Result<Row, StoreError> {
        let guard = self.table(table).read().await;
        let columns = guard.get(row_key).ok_or(StoreError::NotFound)?;
        Ok(Row {
            key: row_key.to_string(),
            column_values: project_columns(columns, column_names),
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

        let start = if inclusive {
            Bound::Included(start_row_key.to_string())
        } else {
            Bound::Excluded(start_row_key.to_string())
        };
        let end = if limit_row_key.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(limit_row_key.to_string())
        };

        let guard = self.table(table).read().await;
        let mut rows = Vec::new();
        let mut more_available = false;
        for (key, columns) in guard.range((start, end)) {
            if rows.len() == max_rows {
                more_available = true;
                break;
            }
            rows.push(Row {
                key: key.clone(),
                column_values: project_columns(columns, column_names),
            });
        }
        Ok(ReadResponse {
            rows,
            more_available,
        })
    }

    async fn delete_row(&self, table: Table, row_key: &str) -> Result<(), StoreError> {
        self.table(table).write().await.remove(row_key);
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
        let mut guard = self.table(table).write().await;
        let keys: Vec<String> = guard
            .range(row_key_prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(row_key_prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            guard.remove(&key);
        }
        Ok(())
    }

    async fn delete_all_rows(&self, table: Table) -> Result<(), StoreError> {
        self.table(table).write().await.clear();
        Ok(())
    }
}

/// An upsert merges columns into any existing row rather than replacing it.
fn merge_row(table: &mut TableMap, row: Row) {
    table
        .entry(row.key)
        .or_default()
        .extend(row.column_values);
}
