use std::collections::BTreeMap;

use crate::error::ImportResult;
use crate::session::ImportSession;
use crate::value::Row;

/// Write access to the target database.
///
/// Transactions nest: every `begin` must be matched by exactly one `commit` or `rollback`,
/// and only the outermost `commit` makes work durable.
pub trait TargetStorage {
    /// # Errors
    /// Returns `ImportError::Storage` when the transaction cannot be opened.
    fn begin(&mut self) -> ImportResult<()>;
    /// # Errors
    /// Returns `ImportError::Storage` when no transaction is open or the commit fails.
    fn commit(&mut self) -> ImportResult<()>;
    /// # Errors
    /// Returns `ImportError::Storage` when no transaction is open or the rollback fails.
    fn rollback(&mut self) -> ImportResult<()>;

    /// Inserts one row and returns the storage-assigned row identity.
    ///
    /// # Errors
    /// Returns `ImportError::Storage` when the insert is rejected.
    fn insert(&mut self, table: &str, row: &Row) -> ImportResult<i64>;

    /// Updates rows whose `key_column` equals `key`, returning the number of rows touched.
    ///
    /// # Errors
    /// Returns `ImportError::Storage` when the update is rejected.
    fn update(&mut self, table: &str, row: &Row, key_column: &str, key: i64) -> ImportResult<usize>;

    /// # Errors
    /// Returns `ImportError::Storage` when the table cannot be read.
    fn select_all(&mut self, table: &str, columns: &[&str]) -> ImportResult<Vec<Row>>;
}

/// Durable mapping from `(entity type, legacy id)` to the identity assigned in the target.
pub trait IdentifierMap {
    /// # Errors
    /// Returns `ImportError::Storage` when the log cannot be read.
    fn lookup(&mut self, entity_type: &str, legacy_id: i64) -> ImportResult<Option<i64>>;

    /// Resolves many legacy ids at once. Unmapped ids are absent from the result.
    ///
    /// # Errors
    /// Returns `ImportError::Storage` when the log cannot be read.
    fn lookup_batch(
        &mut self,
        entity_type: &str,
        legacy_ids: &[i64],
    ) -> ImportResult<BTreeMap<i64, i64>> {
        let mut mapped = BTreeMap::new();
        for legacy_id in legacy_ids {
            if let Some(new_id) = self.lookup(entity_type, *legacy_id)? {
                mapped.insert(*legacy_id, new_id);
            }
        }
        Ok(mapped)
    }

    /// Records a mapping. Re-recording the same pair is a no-op.
    ///
    /// # Errors
    /// Returns `ImportError::Configuration` when the legacy id is already mapped to a different
    /// identity, and `ImportError::Storage` when the log cannot be written.
    fn record(&mut self, entity_type: &str, legacy_id: i64, new_id: i64) -> ImportResult<()>;
}

/// Everything an import handler needs from the target: rows plus the identifier log.
pub trait ImportStore: TargetStorage + IdentifierMap {}

impl<T: TargetStorage + IdentifierMap + ?Sized> ImportStore for T {}

/// Persistence for the single active import session.
pub trait SessionStore {
    /// # Errors
    /// Returns `ImportError::Storage` when the session cannot be read or decoded.
    fn load_session(&mut self) -> ImportResult<Option<ImportSession>>;
    /// # Errors
    /// Returns `ImportError::Storage` when the session cannot be written.
    fn save_session(&mut self, session: &ImportSession) -> ImportResult<()>;
    /// # Errors
    /// Returns `ImportError::Storage` when the session cannot be removed.
    fn clear_session(&mut self) -> ImportResult<()>;
}

/// A store the step runner can drive: import writes plus session persistence.
pub trait RunnerStore: ImportStore + SessionStore {
    fn as_import_store(&mut self) -> &mut dyn ImportStore;
}

impl<T: ImportStore + SessionStore> RunnerStore for T {
    fn as_import_store(&mut self) -> &mut dyn ImportStore {
        self
    }
}
