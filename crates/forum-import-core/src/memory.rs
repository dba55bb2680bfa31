//! In-memory storage and source backends for tests and dry runs.

use std::collections::BTreeMap;

use crate::data::schemas::SECONDARY_AUTO_KEYS;
use crate::error::{ImportError, ImportResult};
use crate::registry::HandlerRegistry;
use crate::session::ImportSession;
use crate::source::{compare_values, Filter, SourceQuery, SourceRows};
use crate::storage::{IdentifierMap, SessionStore, TargetStorage};
use crate::value::{Row, RowExt, Value};

#[derive(Debug, Clone)]
struct TableKey {
    column: String,
    auto_increment: bool,
}

#[derive(Debug, Clone, Default)]
struct State {
    tables: BTreeMap<String, Vec<Row>>,
    next_ids: BTreeMap<String, i64>,
    log: BTreeMap<(String, i64), i64>,
    inserts: u64,
}

/// Target storage held in memory. Transactions snapshot the whole state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: State,
    keys: BTreeMap<String, TableKey>,
    snapshots: Vec<State>,
    session: Option<ImportSession>,
    failing_table: Option<String>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that knows the primary keys of every registered schema and secondary table.
    #[must_use]
    pub fn for_registry(registry: &HandlerRegistry) -> Self {
        let mut store = Self::new();
        for schema in registry.schemas() {
            if let Ok(primary) = schema.single_primary_key() {
                store.keys.insert(
                    schema.table().to_string(),
                    TableKey { column: primary.name.clone(), auto_increment: primary.auto_increment },
                );
            }
        }
        for (table, column) in SECONDARY_AUTO_KEYS {
            store = store.with_auto_increment(table, column);
        }
        store
    }

    #[must_use]
    pub fn with_auto_increment(mut self, table: &str, column: &str) -> Self {
        self.keys.insert(
            table.to_string(),
            TableKey { column: column.to_string(), auto_increment: true },
        );
        self
    }

    /// Makes every later insert into `table` fail with a storage error.
    pub fn fail_inserts_into(&mut self, table: &str) {
        self.failing_table = Some(table.to_string());
    }

    pub fn clear_failure(&mut self) {
        self.failing_table = None;
    }

    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state.tables.get(table).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn log_len(&self) -> usize {
        self.state.log.len()
    }

    #[must_use]
    pub fn log_entries(&self) -> BTreeMap<(String, i64), i64> {
        self.state.log.clone()
    }

    /// Committed inserts across all tables.
    #[must_use]
    pub fn insert_count(&self) -> u64 {
        self.state.inserts
    }

    #[must_use]
    pub fn transaction_depth(&self) -> usize {
        self.snapshots.len()
    }
}

impl TargetStorage for MemoryStore {
    fn begin(&mut self) -> ImportResult<()> {
        self.snapshots.push(self.state.clone());
        Ok(())
    }

    fn commit(&mut self) -> ImportResult<()> {
        self.snapshots
            .pop()
            .map(|_| ())
            .ok_or_else(|| ImportError::Storage("commit without an open transaction".to_string()))
    }

    fn rollback(&mut self) -> ImportResult<()> {
        let snapshot = self
            .snapshots
            .pop()
            .ok_or_else(|| ImportError::Storage("rollback without an open transaction".to_string()))?;
        self.state = snapshot;
        Ok(())
    }

    fn insert(&mut self, table: &str, row: &Row) -> ImportResult<i64> {
        if self.failing_table.as_deref() == Some(table) {
            return Err(ImportError::Storage(format!("insert into `{table}` failed")));
        }

        let mut row = row.clone();
        let existing = self.state.tables.get(table).map_or(0, Vec::len);
        let row_id = match self.keys.get(table) {
            Some(key) => {
                let explicit = row.int(&key.column);
                let id = if explicit > 0 {
                    explicit
                } else if key.auto_increment {
                    *self.state.next_ids.get(table).unwrap_or(&1)
                } else {
                    return Err(ImportError::Storage(format!(
                        "NOT NULL constraint failed: {table}.{}",
                        key.column
                    )));
                };
                let duplicate = self
                    .state
                    .tables
                    .get(table)
                    .is_some_and(|rows| rows.iter().any(|stored| stored.int(&key.column) == id));
                if duplicate {
                    return Err(ImportError::Storage(format!(
                        "UNIQUE constraint failed: {table}.{}",
                        key.column
                    )));
                }
                row.insert(key.column.clone(), Value::Int(id));
                id
            }
            None => i64::try_from(existing).unwrap_or(i64::MAX - 1) + 1,
        };

        let next = self.state.next_ids.entry(table.to_string()).or_insert(1);
        *next = (*next).max(row_id + 1);
        self.state.tables.entry(table.to_string()).or_default().push(row);
        self.state.inserts += 1;
        Ok(row_id)
    }

    fn update(&mut self, table: &str, row: &Row, key_column: &str, key: i64) -> ImportResult<usize> {
        let Some(rows) = self.state.tables.get_mut(table) else {
            return Ok(0);
        };
        let mut touched = 0;
        for stored in rows.iter_mut().filter(|stored| stored.int(key_column) == key) {
            for (column, value) in row {
                stored.insert(column.clone(), value.clone());
            }
            touched += 1;
        }
        Ok(touched)
    }

    fn select_all(&mut self, table: &str, columns: &[&str]) -> ImportResult<Vec<Row>> {
        let rows = self.rows(table);
        if columns.is_empty() {
            return Ok(rows);
        }
        Ok(rows
            .into_iter()
            .map(|row| {
                columns
                    .iter()
                    .map(|column| ((*column).to_string(), row.value(column)))
                    .collect()
            })
            .collect())
    }
}

impl IdentifierMap for MemoryStore {
    fn lookup(&mut self, entity_type: &str, legacy_id: i64) -> ImportResult<Option<i64>> {
        Ok(self.state.log.get(&(entity_type.to_string(), legacy_id)).copied())
    }

    fn record(&mut self, entity_type: &str, legacy_id: i64, new_id: i64) -> ImportResult<()> {
        let key = (entity_type.to_string(), legacy_id);
        match self.state.log.get(&key) {
            Some(existing) if *existing == new_id => Ok(()),
            Some(existing) => Err(ImportError::Configuration(format!(
                "{entity_type} legacy id {legacy_id} is already mapped to {existing}, not {new_id}"
            ))),
            None => {
                self.state.log.insert(key, new_id);
                Ok(())
            }
        }
    }
}

impl SessionStore for MemoryStore {
    fn load_session(&mut self) -> ImportResult<Option<ImportSession>> {
        Ok(self.session.clone())
    }

    fn save_session(&mut self, session: &ImportSession) -> ImportResult<()> {
        self.session = Some(session.clone());
        Ok(())
    }

    fn clear_session(&mut self) -> ImportResult<()> {
        self.session = None;
        Ok(())
    }
}

/// Legacy tables held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    tables: BTreeMap<String, Vec<Row>>,
}

impl MemorySource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, table: &str, row: Row) {
        self.tables.entry(table.to_string()).or_default().push(row);
    }

    pub fn insert_values<const N: usize>(&mut self, table: &str, values: [(&str, Value); N]) {
        let row = values.into_iter().map(|(column, value)| (column.to_string(), value)).collect();
        self.insert(table, row);
    }
}

fn matches_filter(row: &Row, filter: &Filter) -> bool {
    match filter {
        Filter::Eq(column, value) => compare_values(&row.value(column), value).is_eq(),
        Filter::NotEq(column, value) => compare_values(&row.value(column), value).is_ne(),
        Filter::After(columns, values) => {
            for (column, value) in columns.iter().zip(values) {
                match compare_values(&row.value(column), value) {
                    std::cmp::Ordering::Equal => continue,
                    ordering => return ordering.is_gt(),
                }
            }
            false
        }
    }
}

impl SourceRows for MemorySource {
    fn max_key(&self, table: &str, key_column: &str) -> ImportResult<i64> {
        Ok(self
            .tables
            .get(table)
            .and_then(|rows| rows.iter().map(|row| row.int(key_column)).max())
            .unwrap_or(0))
    }

    fn fetch(&self, query: &SourceQuery) -> ImportResult<Vec<Row>> {
        let Some(rows) = self.tables.get(&query.table) else {
            return Err(ImportError::Source(format!("no such table: {}", query.table)));
        };

        let mut selected: Vec<Row> = rows
            .iter()
            .filter(|row| {
                let key = row.int(&query.key_column);
                query.start_after.map_or(true, |after| key > after)
                    && query.end.map_or(true, |end| key <= end)
                    && query.filters.iter().all(|filter| matches_filter(row, filter))
            })
            .cloned()
            .collect();

        let order = query.effective_order();
        selected.sort_by(|left, right| {
            order
                .iter()
                .map(|column| compare_values(&left.value(column), &right.value(column)))
                .find(|ordering| ordering.is_ne())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        if let Some(limit) = query.limit {
            selected.truncate(limit);
        }
        Ok(selected)
    }
}
