// =============================================================================
// storage/memory.rs — TRANSACTIONAL TABLES IN A MUTEX
// =============================================================================
//
// An in-process backend with real transaction semantics: BEGIN opens an
// empty working set, DELETE and INSERT copy a table into it on first touch,
// COMMIT writes back only the tables the transaction touched, ROLLBACK
// throws the working set away. Two sessions writing different tables never
// clobber each other. Every step can be told to fail, so the gateway's
// rollback and close paths can be exercised without a database server.
//
// Also serves as the `memory` backend for dry runs of the daemon.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{StoragePort, StorageSession};
use crate::error::{ConfigError, StorageError, StorageStage};
use crate::models::{Field, InsertSpec, RawRecord, ScrapeUnit, UnitQuery};

/// Which primitives should fail. All off by default.
#[derive(Debug, Clone, Default)]
pub struct MemoryFaults {
    pub fail_connect: bool,
    pub fail_begin: bool,
    pub fail_delete: bool,
    /// Fail the insert statement after this many have succeeded.
    pub fail_insert_after: Option<usize>,
    pub fail_commit: bool,
    pub fail_close: bool,
}

#[derive(Debug, Clone, Default)]
struct MemoryTable {
    columns: Vec<&'static str>,
    rows: Vec<RawRecord>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, MemoryTable>,
    faults: MemoryFaults,
    opened: usize,
    closed: usize,
    rollbacks: usize,
    insert_statements: usize,
}

/// Shared handle on the in-memory database. Clones see the same tables.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    state: Arc<Mutex<MemoryState>>,
    max_params: usize,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            max_params: 65_535,
        }
    }

    /// Lower the per-statement parameter ceiling to force chunking.
    pub fn with_max_params(mut self, max_params: usize) -> Self {
        self.max_params = max_params.max(1);
        self
    }

    pub fn set_faults(&self, faults: MemoryFaults) {
        self.state.lock().faults = faults;
    }

    /// Replace a table's contents outside any transaction.
    pub fn seed(&self, spec: &InsertSpec, rows: Vec<RawRecord>) {
        self.state.lock().tables.insert(
            spec.table.to_string(),
            MemoryTable {
                columns: spec.column_names(),
                rows,
            },
        );
    }

    /// Committed rows of a table, empty when it does not exist.
    pub fn rows(&self, table: &str) -> Vec<RawRecord> {
        self.state
            .lock()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn connections_opened(&self) -> usize {
        self.state.lock().opened
    }

    pub fn connections_closed(&self) -> usize {
        self.state.lock().closed
    }

    pub fn rollbacks(&self) -> usize {
        self.state.lock().rollbacks
    }

    pub fn insert_statements(&self) -> usize {
        self.state.lock().insert_statements
    }
}

#[async_trait]
impl StoragePort for MemoryStorage {
    async fn connect(&self) -> Result<Box<dyn StorageSession>, StorageError> {
        let mut state = self.state.lock();
        if state.faults.fail_connect {
            return Err(ConfigError::NoConnectionStrategy {
                attempts: vec!["memory: injected connect failure".to_string()],
            }
            .into());
        }
        state.opened += 1;

        Ok(Box::new(MemorySession {
            state: self.state.clone(),
            max_params: self.max_params,
            staged: None,
            closed: false,
        }))
    }
}

struct MemorySession {
    state: Arc<Mutex<MemoryState>>,
    max_params: usize,
    /// Working copies of the tables this transaction has touched.
    staged: Option<BTreeMap<String, MemoryTable>>,
    closed: bool,
}

fn injected(stage: StorageStage) -> StorageError {
    StorageError::statement(stage, "injected failure")
}

impl MemorySession {
    /// Run `f` on one table: the transaction's working copy, or the
    /// committed table when no transaction is open. With `create`, a missing
    /// table is created first; otherwise `f` sees `None`.
    fn with_table<R>(
        &mut self,
        name: &str,
        create: Option<&InsertSpec>,
        f: impl FnOnce(Option<&mut MemoryTable>) -> R,
    ) -> R {
        let mut state = self.state.lock();
        let tables = match self.staged.as_mut() {
            Some(staged) => {
                if !staged.contains_key(name) {
                    if let Some(committed) = state.tables.get(name) {
                        staged.insert(name.to_string(), committed.clone());
                    }
                }
                staged
            }
            None => &mut state.tables,
        };

        if let Some(spec) = create {
            tables.entry(name.to_string()).or_insert_with(|| MemoryTable {
                columns: spec.column_names(),
                rows: Vec::new(),
            });
        }
        f(tables.get_mut(name))
    }
}

#[async_trait]
impl StorageSession for MemorySession {
    fn label(&self) -> &str {
        "memory"
    }

    fn max_params_per_statement(&self) -> usize {
        self.max_params
    }

    async fn begin(&mut self) -> Result<(), StorageError> {
        let state = self.state.lock();
        if state.faults.fail_begin {
            return Err(injected(StorageStage::Begin));
        }
        drop(state);
        self.staged = Some(BTreeMap::new());
        Ok(())
    }

    async fn delete_all(&mut self, table: &str) -> Result<u64, StorageError> {
        if self.state.lock().faults.fail_delete {
            return Err(injected(StorageStage::Delete));
        }
        let deleted = self.with_table(table, None, |t| {
            t.map_or(0, |t| std::mem::take(&mut t.rows).len() as u64)
        });
        Ok(deleted)
    }

    async fn insert_rows(&mut self, spec: &InsertSpec, rows: &[RawRecord]) -> Result<u64, StorageError> {
        {
            let mut state = self.state.lock();
            if let Some(limit) = state.faults.fail_insert_after {
                if state.insert_statements >= limit {
                    return Err(injected(StorageStage::Insert));
                }
            }
            state.insert_statements += 1;
        }

        self.with_table(spec.table, Some(spec), |t| {
            if let Some(t) = t {
                t.rows.extend_from_slice(rows);
            }
        });

        debug!(table = spec.table, rows = rows.len(), "Memory insert");
        Ok(rows.len() as u64)
    }

    async fn commit(&mut self) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        if state.faults.fail_commit {
            return Err(injected(StorageStage::Commit));
        }
        if let Some(staged) = self.staged.take() {
            state.tables.extend(staged);
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StorageError> {
        self.staged = None;
        self.state.lock().rollbacks += 1;
        Ok(())
    }

    async fn fetch_units(&mut self, query: &UnitQuery) -> Result<Vec<ScrapeUnit>, StorageError> {
        let state = self.state.lock();
        let table = state.tables.get(query.table).ok_or_else(|| {
            StorageError::statement(
                StorageStage::Query,
                format!("relation \"{}\" does not exist", query.table),
            )
        })?;

        let position = |name: &str| {
            table.columns.iter().position(|c| *c == name).ok_or_else(|| {
                StorageError::statement(
                    StorageStage::Query,
                    format!("column \"{}\" does not exist", name),
                )
            })
        };
        let unit_index = position(query.column)?;
        let order_index = query.order_by_latest.map(position).transpose()?;

        // unit value -> latest value of the ordering column
        let mut latest: BTreeMap<String, Option<String>> = BTreeMap::new();
        for row in &table.rows {
            let Some(unit) = row.get(unit_index).and_then(Field::as_text) else {
                continue;
            };
            let order_value = order_index.and_then(|i| row.get(i)).and_then(Field::as_text);
            let slot = latest.entry(unit).or_insert(None);
            if order_value > *slot {
                *slot = order_value;
            }
        }

        let mut units: Vec<(String, Option<String>)> = latest.into_iter().collect();
        if order_index.is_some() {
            units.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        }

        Ok(units.into_iter().map(|(unit, _)| ScrapeUnit::new(unit)).collect())
    }

    async fn create_table(&mut self, spec: &InsertSpec) -> Result<(), StorageError> {
        self.state
            .lock()
            .tables
            .entry(spec.table.to_string())
            .or_insert_with(|| MemoryTable {
                columns: spec.column_names(),
                rows: Vec::new(),
            });
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        if !self.closed {
            self.closed = true;
            state.closed += 1;
        }
        if state.faults.fail_close {
            return Err(injected(StorageStage::Close));
        }
        Ok(())
    }
}
