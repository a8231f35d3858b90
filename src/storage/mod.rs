// =============================================================================
// storage/mod.rs — ONE CONNECTION, ONE TRANSACTION, NO HALF-REPLACED TABLES
// =============================================================================
//
// The gateway owns the store protocol; backends only provide primitives.
//
//   store(records, spec, replace_table)
//     1. shape-check every record          (before any connection exists)
//     2. connect, BEGIN
//     3. DELETE FROM table                 (only when replacing)
//     4. INSERT in parameter-bounded chunks
//     5. COMMIT
//     any failure in 2-5 -> ROLLBACK, return the error
//     every exit path    -> close the connection, log (never return) close errors
//
// An empty record list never opens a connection at all, so a run where every
// unit failed cannot wipe a table.
// =============================================================================

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::error::StorageError;
use crate::models::{InsertSpec, RawRecord, ScrapeUnit, UnitQuery};

pub use memory::{MemoryFaults, MemoryStorage};
pub use postgres::{ConnectStrategy, PostgresStorage};

/// Opens sessions. One session per gateway operation; sessions are never
/// shared between runs.
#[async_trait]
pub trait StoragePort: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn StorageSession>, StorageError>;
}

/// The primitives a backend must provide. Calls arrive in protocol order
/// from the gateway; a session is used by exactly one task at a time.
#[async_trait]
pub trait StorageSession: Send {
    /// Which connection strategy produced this session.
    fn label(&self) -> &str;

    /// Bind-parameter ceiling per statement. Inserts are chunked under it.
    fn max_params_per_statement(&self) -> usize;

    async fn begin(&mut self) -> Result<(), StorageError>;

    /// Delete every row of `table`, returning how many went.
    async fn delete_all(&mut self, table: &str) -> Result<u64, StorageError>;

    /// Insert one chunk of already shape-checked rows.
    async fn insert_rows(&mut self, spec: &InsertSpec, rows: &[RawRecord]) -> Result<u64, StorageError>;

    async fn commit(&mut self) -> Result<(), StorageError>;

    async fn rollback(&mut self) -> Result<(), StorageError>;

    async fn fetch_units(&mut self, query: &UnitQuery) -> Result<Vec<ScrapeUnit>, StorageError>;

    /// CREATE TABLE IF NOT EXISTS, typed from the spec.
    async fn create_table(&mut self, spec: &InsertSpec) -> Result<(), StorageError>;

    async fn close(&mut self) -> Result<(), StorageError>;
}

/// The only way the rest of the crate talks to storage.
#[derive(Clone)]
pub struct StorageGateway {
    port: Arc<dyn StoragePort>,
}

impl StorageGateway {
    pub fn new(port: Arc<dyn StoragePort>) -> Self {
        Self { port }
    }

    /// Atomically (replace-and-)insert `records` into `spec.table`.
    ///
    /// When `replace_table` is given, that table is emptied inside the same
    /// transaction first. Returns the number of rows inserted.
    pub async fn store(
        &self,
        records: &[RawRecord],
        spec: &InsertSpec,
        replace_table: Option<&str>,
    ) -> Result<u64, StorageError> {
        if records.is_empty() {
            warn!(table = spec.table, "No records to store, leaving the table untouched");
            return Ok(0);
        }

        spec.check_all(records)?;

        let mut session = self.port.connect().await?;
        let result = replace_and_insert(session.as_mut(), records, spec, replace_table).await;

        let result = match result {
            Ok(stored) => {
                info!(
                    table = spec.table,
                    replaced = replace_table.is_some(),
                    rows = stored,
                    "Stored records"
                );
                Ok(stored)
            }
            Err(e) => {
                error!(table = spec.table, error = %e, "Store failed, rolling back");
                if let Err(rollback_error) = session.rollback().await {
                    error!(table = spec.table, error = %rollback_error, "Rollback failed");
                }
                Err(e)
            }
        };

        close_quietly(session.as_mut()).await;
        result
    }

    /// Read a run's unit list out of storage.
    pub async fn fetch_units(&self, query: &UnitQuery) -> Result<Vec<ScrapeUnit>, StorageError> {
        let mut session = self.port.connect().await?;
        let result = session.fetch_units(query).await;
        close_quietly(session.as_mut()).await;

        let units = result?;
        info!(
            table = query.table,
            column = query.column,
            units = units.len(),
            "Fetched unit list"
        );
        Ok(units)
    }

    /// Open and close one session. Returns the label of the connection
    /// strategy that worked.
    pub async fn test_connection(&self) -> Result<String, StorageError> {
        let mut session = self.port.connect().await?;
        let label = session.label().to_string();
        close_quietly(session.as_mut()).await;
        Ok(label)
    }

    pub async fn ensure_table(&self, spec: &InsertSpec) -> Result<(), StorageError> {
        let mut session = self.port.connect().await?;
        let result = session.create_table(spec).await;
        close_quietly(session.as_mut()).await;
        result
    }
}

async fn replace_and_insert(
    session: &mut dyn StorageSession,
    records: &[RawRecord],
    spec: &InsertSpec,
    replace_table: Option<&str>,
) -> Result<u64, StorageError> {
    session.begin().await?;

    if let Some(table) = replace_table {
        let deleted = session.delete_all(table).await?;
        info!(table = table, rows = deleted, "Cleared table for full replace");
    }

    let chunk_rows = rows_per_statement(session.max_params_per_statement(), spec.columns.len());
    let mut stored = 0;
    for chunk in records.chunks(chunk_rows) {
        stored += session.insert_rows(spec, chunk).await?;
    }

    session.commit().await?;
    Ok(stored)
}

/// How many rows fit in one statement under the backend's parameter ceiling.
fn rows_per_statement(max_params: usize, columns: usize) -> usize {
    (max_params / columns.max(1)).max(1)
}

async fn close_quietly(session: &mut dyn StorageSession) {
    if let Err(e) = session.close().await {
        warn!(error = %e, "Failed to close storage connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigError, StorageStage};
    use crate::models::{Column, Field, FieldKind};

    const SPEC: InsertSpec = InsertSpec {
        table: "Sector_Symbol",
        columns: &[
            Column::new("sector_code", FieldKind::Text),
            Column::new("company", FieldKind::Text),
        ],
    };

    fn row(sector: &str, company: &str) -> RawRecord {
        RawRecord::new(vec![Field::text(sector), Field::text(company)])
    }

    fn gateway(storage: &MemoryStorage) -> StorageGateway {
        StorageGateway::new(Arc::new(storage.clone()))
    }

    #[tokio::test]
    async fn test_replace_swaps_table_contents() {
        let storage = MemoryStorage::new();
        storage.seed(&SPEC, vec![row("10", "OLD")]);

        let stored = gateway(&storage)
            .store(&[row("11", "ACI"), row("11", "BATBC")], &SPEC, Some("Sector_Symbol"))
            .await
            .unwrap();

        assert_eq!(stored, 2);
        assert_eq!(storage.rows("Sector_Symbol"), vec![row("11", "ACI"), row("11", "BATBC")]);
        assert_eq!(storage.connections_opened(), 1);
        assert_eq!(storage.connections_closed(), 1);
    }

    #[tokio::test]
    async fn test_append_keeps_existing_rows() {
        let storage = MemoryStorage::new();
        storage.seed(&SPEC, vec![row("10", "OLD")]);

        gateway(&storage).store(&[row("11", "ACI")], &SPEC, None).await.unwrap();

        assert_eq!(storage.rows("Sector_Symbol").len(), 2);
    }

    #[tokio::test]
    async fn test_insert_failure_after_delete_leaves_table_unchanged() {
        let storage = MemoryStorage::new();
        storage.seed(&SPEC, vec![row("10", "OLD"), row("10", "OLDER")]);
        storage.set_faults(MemoryFaults {
            fail_insert_after: Some(0),
            ..Default::default()
        });

        let err = gateway(&storage)
            .store(&[row("11", "ACI")], &SPEC, Some("Sector_Symbol"))
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Some(StorageStage::Insert));
        assert_eq!(storage.rows("Sector_Symbol"), vec![row("10", "OLD"), row("10", "OLDER")]);
        assert_eq!(storage.rollbacks(), 1);
        assert_eq!(storage.connections_closed(), 1);
    }

    #[tokio::test]
    async fn test_commit_failure_rolls_back() {
        let storage = MemoryStorage::new();
        storage.seed(&SPEC, vec![row("10", "OLD")]);
        storage.set_faults(MemoryFaults {
            fail_commit: true,
            ..Default::default()
        });

        let err = gateway(&storage)
            .store(&[row("11", "ACI")], &SPEC, Some("Sector_Symbol"))
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Some(StorageStage::Commit));
        assert_eq!(storage.rows("Sector_Symbol"), vec![row("10", "OLD")]);
    }

    #[tokio::test]
    async fn test_empty_records_never_connect() {
        let storage = MemoryStorage::new();
        storage.seed(&SPEC, vec![row("10", "OLD")]);

        let stored = gateway(&storage).store(&[], &SPEC, Some("Sector_Symbol")).await.unwrap();

        assert_eq!(stored, 0);
        assert_eq!(storage.connections_opened(), 0);
        assert_eq!(storage.rows("Sector_Symbol").len(), 1);
    }

    #[tokio::test]
    async fn test_shape_mismatch_is_rejected_before_connecting() {
        let storage = MemoryStorage::new();
        let bad = RawRecord::new(vec![Field::text("11")]);

        let err = gateway(&storage).store(&[bad], &SPEC, None).await.unwrap_err();

        assert!(matches!(err, StorageError::Shape { .. }));
        assert_eq!(storage.connections_opened(), 0);
    }

    #[tokio::test]
    async fn test_inserts_are_chunked_under_parameter_ceiling() {
        // 5 params per statement / 2 columns -> 2 rows per chunk.
        let storage = MemoryStorage::new().with_max_params(5);
        let records: Vec<RawRecord> = (0..7).map(|i| row("11", &format!("C{i}"))).collect();

        let stored = gateway(&storage).store(&records, &SPEC, Some("Sector_Symbol")).await.unwrap();

        assert_eq!(stored, 7);
        assert_eq!(storage.insert_statements(), 4);
        assert_eq!(storage.rows("Sector_Symbol"), records);
    }

    #[tokio::test]
    async fn test_close_failure_does_not_mask_success() {
        let storage = MemoryStorage::new();
        storage.set_faults(MemoryFaults {
            fail_close: true,
            ..Default::default()
        });

        let stored = gateway(&storage).store(&[row("11", "ACI")], &SPEC, None).await.unwrap();
        assert_eq!(stored, 1);
        assert_eq!(storage.rows("Sector_Symbol").len(), 1);
    }

    #[tokio::test]
    async fn test_close_failure_does_not_mask_original_error() {
        let storage = MemoryStorage::new();
        storage.set_faults(MemoryFaults {
            fail_delete: true,
            fail_close: true,
            ..Default::default()
        });

        let err = gateway(&storage)
            .store(&[row("11", "ACI")], &SPEC, Some("Sector_Symbol"))
            .await
            .unwrap_err();
        assert_eq!(err.stage(), Some(StorageStage::Delete));
    }

    #[tokio::test]
    async fn test_connect_failure_surfaces_configuration_error() {
        let storage = MemoryStorage::new();
        storage.set_faults(MemoryFaults {
            fail_connect: true,
            ..Default::default()
        });

        let err = gateway(&storage).store(&[row("11", "ACI")], &SPEC, None).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::Configuration(ConfigError::NoConnectionStrategy { .. })
        ));
        assert!(gateway(&storage).test_connection().await.is_err());
    }

    #[tokio::test]
    async fn test_fetch_units_and_test_connection() {
        let storage = MemoryStorage::new();
        storage.seed(&SPEC, vec![row("11", "ACI"), row("11", "BATBC"), row("12", "ACI")]);

        let units = gateway(&storage)
            .fetch_units(&UnitQuery {
                table: "Sector_Symbol",
                column: "company",
                order_by_latest: None,
            })
            .await
            .unwrap();
        assert_eq!(units, vec![ScrapeUnit::from("ACI"), ScrapeUnit::from("BATBC")]);

        assert_eq!(gateway(&storage).test_connection().await.unwrap(), "memory");
        assert_eq!(storage.connections_opened(), storage.connections_closed());
    }

    #[test]
    fn test_rows_per_statement() {
        assert_eq!(rows_per_statement(65_535, 11), 5_957);
        assert_eq!(rows_per_statement(3, 11), 1);
        assert_eq!(rows_per_statement(10, 0), 10);
    }
}
