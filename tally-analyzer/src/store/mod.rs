//! The key-value store contract underlying the observation and report
//! stores.
//!
//! The data store is a key-multi-value store with three tables. Each table
//! is organized into rows identified by a unique string key; each row holds
//! named column values. Rows are ordered lexicographically by key, and
//! callers pack semantic fields into fixed-width zero-padded ASCII so that
//! range scans on a config triple are contiguous.
//!
//! Work with [`ObservationStore`] and [`ReportStore`] instead of using this
//! interface directly.

mod memory;
pub mod observations;
#[cfg(feature = "postgres")]
mod postgres;
pub mod reports;

use std::collections::BTreeMap;

use axum::async_trait;

pub use memory::MemoryStore;
pub use observations::ObservationStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;
pub use reports::ReportStore;

/// The largest number of columns a single `write_rows` call may carry.
pub const MAX_COLUMNS_PER_WRITE: usize = 100_000;

/// Page size used by the provided range-delete.
const DELETE_SCAN_PAGE: usize = 1_000;

/// The tables controlled by the data store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Table {
    /// Observations received from the shuffler.
    Observations,
    /// Metadata about reports, one row per report id.
    ReportMetadata,
    /// The actual rows of reports.
    ReportRows,
}

/// Status taxonomy shared by every store operation.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("operation failed: {0}")]
    OperationFailed(String),
}

/// A row of the data store. Column values are opaque bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Row {
    pub key: String,
    pub column_values: BTreeMap<String, Vec<u8>>,
}

/// Returned from [`DataStore::read_rows`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadResponse {
    pub rows: Vec<Row>,
    /// Whether the scan stopped before the end of the requested range. When
    /// true the caller may continue by passing the last returned key with
    /// `inclusive = false`. Fewer than `max_rows` rows may come back even
    /// when this is false, but when it is true `rows` is never empty.
    pub more_available: bool,
}

#[async_trait]
pub trait DataStore: Send + Sync + 'static {
    /// Upserts one row.
    async fn write_row(&self, table: Table, row: Row) -> Result<(), StoreError>;

    /// Batched upsert. The total number of columns across all rows must not
    /// exceed [`MAX_COLUMNS_PER_WRITE`].
    async fn write_rows(&self, table: Table, rows: Vec<Row>) -> Result<(), StoreError>;

    /// Reads the row with the given key. If `column_names` is non-empty
    /// only the named columns are returned.
    async fn read_row(
        &self,
        table: Table,
        row_key: &str,
        column_names: &[String],
    ) -> Result<Row, StoreError>;

    /// Reads a lexicographic range of rows.
    ///
    /// The interval starts at `start_row_key` (inclusive or not per
    /// `inclusive`) and ends before `limit_row_key`, exclusive; an empty
    /// limit key means positive infinity. The start key must be less than
    /// the limit key and `max_rows` must be positive.
    async fn read_rows(
        &self,
        table: Table,
        start_row_key: &str,
        inclusive: bool,
        limit_row_key: &str,
        column_names: &[String],
        max_rows: usize,
    ) -> Result<ReadResponse, StoreError>;

    /// Deletes the given row, if it exists.
    async fn delete_row(&self, table: Table, row_key: &str) -> Result<(), StoreError>;

    /// Deletes every row whose key extends `row_key_prefix`. The prefix
    /// must not be empty; use [`DataStore::delete_all_rows`] for that.
    async fn delete_rows_with_prefix(
        &self,
        table: Table,
        row_key_prefix: &str,
    ) -> Result<(), StoreError>;

    /// Permanently deletes all rows of the table.
    async fn delete_all_rows(&self, table: Table) -> Result<(), StoreError>;

    /// Deletes a lexicographic range of rows. Built on [`read_rows`] and
    /// [`delete_row`] since the store has no range-delete primitive:
    /// repeatedly read up to a page of row keys in the range, then delete
    /// each.
    ///
    /// [`read_rows`]: DataStore::read_rows
    /// [`delete_row`]: DataStore::delete_row
    async fn delete_rows(
        &self,
        table: Table,
        start_row_key: &str,
        inclusive: bool,
        limit_row_key: &str,
    ) -> Result<(), StoreError> {
        let mut start = start_row_key.to_string();
        let mut inclusive = inclusive;
        loop {
            // A single empty column name forces the store to return rows
            // with no columns; an empty projection would return them all.
            let column_names = vec![String::new()];
            let response = self
                .read_rows(
                    table,
                    &start,
                    inclusive,
                    limit_row_key,
                    &column_names,
                    DELETE_SCAN_PAGE,
                )
                .await?;
            if response.rows.is_empty() {
                return Ok(());
            }
            start = response.rows.last().map(|row| row.key.clone()).unwrap_or_default();
            inclusive = false;
            for row in response.rows {
                self.delete_row(table, &row.key).await?;
            }
            if !response.more_available {
                return Ok(());
            }
        }
    }
}

/// Validates the shared preconditions of `read_rows` implementations.
pub(crate) fn check_read_rows_args(
    start_row_key: &str,
    limit_row_key: &str,
    max_rows: usize,
) -> Result<(), StoreError> {
    if max_rows == 0 {
        return Err(StoreError::InvalidArguments(
            "max_rows must be positive".to_string(),
        ));
    }
    if !limit_row_key.is_empty() && start_row_key >= limit_row_key {
        return Err(StoreError::InvalidArguments(format!(
            "start_row_key {start_row_key:?} is not below limit_row_key {limit_row_key:?}"
        )));
    }
    Ok(())
}

pub(crate) use check_read_rows_args as check_read_args;
