use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::error::{ImportError, ImportResult};
use crate::registry::{HandlerRegistry, RegisteredHandler};
use crate::storage::ImportStore;
use crate::text::TextConverter;
use crate::value::Value;
use crate::writer::{RecordWriter, SetOptions};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct HandlerOptions {
    /// Record the legacy to new mapping after a successful write.
    pub log: bool,
    /// Return the logged identity instead of writing when the legacy id was already imported.
    pub check_existing: bool,
    /// Wrap the write and its side effects in one transaction.
    pub use_transaction: bool,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self { log: true, check_existing: true, use_transaction: true }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SaveOutcome {
    Inserted(i64),
    /// The legacy id was already mapped; nothing was written.
    Existing(i64),
    /// `pre_save` declined or the write produced no identity.
    Skipped,
}

impl SaveOutcome {
    #[must_use]
    pub fn new_id(self) -> Option<i64> {
        match self {
            Self::Inserted(id) | Self::Existing(id) => Some(id),
            Self::Skipped => None,
        }
    }

    #[must_use]
    pub fn is_inserted(self) -> bool {
        matches!(self, Self::Inserted(_))
    }
}

/// Lifecycle hooks [`ImportTarget::save`] drives for one record.
pub trait ImportHandler {
    /// Entity type the identifier map logs this record under.
    fn import_type(&self) -> &str;

    fn options(&self) -> HandlerOptions {
        HandlerOptions::default()
    }

    /// Returning `Ok(false)` skips the record before any transaction is opened.
    ///
    /// # Errors
    /// Implementations return record-level errors for data they cannot accept.
    fn pre_save(&mut self, _legacy_id: Option<i64>) -> ImportResult<bool> {
        Ok(true)
    }

    /// Writes the record and returns its new identity, or `None` when nothing was written.
    ///
    /// # Errors
    /// Returns validation, configuration or storage errors from the write.
    fn write(
        &mut self,
        legacy_id: Option<i64>,
        target: &mut ImportTarget<'_>,
    ) -> ImportResult<Option<i64>>;

    /// Runs after the mapping is logged, inside the same transaction.
    ///
    /// # Errors
    /// Any error rolls back the whole record.
    fn post_save(
        &mut self,
        _legacy_id: Option<i64>,
        _new_id: i64,
        _target: &mut ImportTarget<'_>,
    ) -> ImportResult<()> {
        Ok(())
    }
}

/// An import handler backed by a [`RecordWriter`] for its primary table.
pub trait RecordHandler: ImportHandler {
    fn record(&self) -> &RecordWriter;
    fn record_mut(&mut self) -> &mut RecordWriter;

    /// # Errors
    /// See [`RecordWriter::set_with`].
    fn set(&mut self, column: &str, value: Value) -> ImportResult<()> {
        self.record_mut().set(column, value)
    }

    /// # Errors
    /// See [`RecordWriter::set_with`].
    fn set_with(&mut self, column: &str, value: Value, options: SetOptions) -> ImportResult<()> {
        self.record_mut().set_with(column, value, options)
    }
}

/// Work the step runner performs once at the end of an invocation instead of per record.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub enum DeferredTask {
    RebuildNodeTree,
}

impl DeferredTask {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RebuildNodeTree => "rebuild_node_tree",
        }
    }
}

/// The target side of an invocation: storage, identifier map, handler registry and session
/// settings.
pub struct ImportTarget<'a> {
    store: &'a mut dyn ImportStore,
    registry: &'a HandlerRegistry,
    retain_ids: bool,
    text: TextConverter,
    deferred: BTreeSet<DeferredTask>,
}

impl<'a> ImportTarget<'a> {
    #[must_use]
    pub fn new(
        store: &'a mut dyn ImportStore,
        registry: &'a HandlerRegistry,
        retain_ids: bool,
        text: TextConverter,
    ) -> Self {
        Self { store, registry, retain_ids, text, deferred: BTreeSet::new() }
    }

    pub fn store(&mut self) -> &mut dyn ImportStore {
        &mut *self.store
    }

    #[must_use]
    pub fn registry(&self) -> &HandlerRegistry {
        self.registry
    }

    #[must_use]
    pub fn retain_ids(&self) -> bool {
        self.retain_ids
    }

    #[must_use]
    pub fn text(&self) -> TextConverter {
        self.text
    }

    /// Builds a typed handler registered for `T::ENTITY_TYPE`.
    ///
    /// # Errors
    /// Returns `ImportError::Configuration` when the entity type is not registered.
    pub fn handler<T: RegisteredHandler>(&self) -> ImportResult<T> {
        let schema = self.registry.schema(T::ENTITY_TYPE)?;
        T::build(schema, self.text)
    }

    /// Builds whichever handler is registered for `entity_type`.
    ///
    /// # Errors
    /// Returns `ImportError::Configuration` when the entity type is not registered.
    pub fn new_handler(&self, entity_type: &str) -> ImportResult<Box<dyn RecordHandler>> {
        self.registry.create(entity_type, self.text)
    }

    /// # Errors
    /// Returns `ImportError::Storage` when the identifier map cannot be read.
    pub fn lookup(&mut self, entity_type: &str, legacy_id: i64) -> ImportResult<Option<i64>> {
        if legacy_id == 0 {
            return Ok(None);
        }
        self.store.lookup(entity_type, legacy_id)
    }

    /// Resolves a reference that may legitimately dangle, yielding `default` when unmapped.
    ///
    /// # Errors
    /// Returns `ImportError::Storage` when the identifier map cannot be read.
    pub fn lookup_id(&mut self, entity_type: &str, legacy_id: i64, default: i64) -> ImportResult<i64> {
        Ok(self.lookup(entity_type, legacy_id)?.unwrap_or(default))
    }

    /// Resolves a reference the record cannot exist without.
    ///
    /// # Errors
    /// Returns `ImportError::UnresolvedReference` when unmapped.
    pub fn require(&mut self, entity_type: &str, legacy_id: i64) -> ImportResult<i64> {
        self.lookup(entity_type, legacy_id)?
            .ok_or_else(|| ImportError::unresolved(entity_type, legacy_id))
    }

    /// Resolves a batch of legacy ids. Zero ids and duplicates are dropped first.
    ///
    /// # Errors
    /// Returns `ImportError::Storage` when the identifier map cannot be read.
    pub fn lookup_batch(
        &mut self,
        entity_type: &str,
        legacy_ids: impl IntoIterator<Item = i64>,
    ) -> ImportResult<BTreeMap<i64, i64>> {
        let unique: BTreeSet<i64> = legacy_ids.into_iter().filter(|id| *id != 0).collect();
        if unique.is_empty() {
            return Ok(BTreeMap::new());
        }
        let ids: Vec<i64> = unique.into_iter().collect();
        self.store.lookup_batch(entity_type, &ids)
    }

    /// Logs a mapping for an entity that has no handler of its own, such as a legacy group
    /// folded into an existing target group.
    ///
    /// # Errors
    /// Returns `ImportError::Configuration` for unregistered entity types or conflicting
    /// mappings, and `ImportError::Storage` when the log cannot be written.
    pub fn log_mapping(&mut self, entity_type: &str, legacy_id: i64, new_id: i64) -> ImportResult<()> {
        if !self.registry.contains(entity_type) {
            return Err(ImportError::Configuration(format!(
                "cannot log a mapping for unregistered entity type `{entity_type}`"
            )));
        }
        if legacy_id == 0 {
            return Ok(());
        }
        self.store.record(entity_type, legacy_id, new_id)
    }

    pub fn defer(&mut self, task: DeferredTask) {
        self.deferred.insert(task);
    }

    pub fn take_deferred(&mut self) -> BTreeSet<DeferredTask> {
        std::mem::take(&mut self.deferred)
    }

    /// Saves one record through `handler`.
    ///
    /// Already imported legacy ids short-circuit to [`SaveOutcome::Existing`]. Otherwise the
    /// write, the mapping and `post_save` run in one transaction that is rolled back on any
    /// error, so a failed record leaves no rows and no mapping behind.
    ///
    /// # Errors
    /// Returns the first error raised by the handler or the storage.
    pub fn save<H: ImportHandler + ?Sized>(
        &mut self,
        handler: &mut H,
        legacy_id: Option<i64>,
    ) -> ImportResult<SaveOutcome> {
        let legacy_id = legacy_id.filter(|id| *id != 0);
        let options = handler.options();
        let import_type = handler.import_type().to_string();

        if let Some(legacy_id) = legacy_id {
            if options.log && options.check_existing {
                if let Some(existing) = self.store.lookup(&import_type, legacy_id)? {
                    debug!(import_type, legacy_id, existing, "record already imported");
                    return Ok(SaveOutcome::Existing(existing));
                }
            }
        }

        if !handler.pre_save(legacy_id)? {
            debug!(import_type, ?legacy_id, "record skipped by pre-save");
            return Ok(SaveOutcome::Skipped);
        }

        if options.use_transaction {
            self.store.begin()?;
        }

        match self.write_logged(handler, legacy_id, &import_type, options) {
            Ok(outcome) => {
                if options.use_transaction {
                    if let Err(err) = self.store.commit() {
                        self.rollback_quietly(&import_type);
                        return Err(err);
                    }
                }
                Ok(outcome)
            }
            Err(err) => {
                if options.use_transaction {
                    self.rollback_quietly(&import_type);
                }
                Err(err)
            }
        }
    }

    fn write_logged<H: ImportHandler + ?Sized>(
        &mut self,
        handler: &mut H,
        legacy_id: Option<i64>,
        import_type: &str,
        options: HandlerOptions,
    ) -> ImportResult<SaveOutcome> {
        let Some(new_id) = handler.write(legacy_id, self)? else {
            return Ok(SaveOutcome::Skipped);
        };

        if let Some(legacy_id) = legacy_id {
            if options.log {
                self.store.record(import_type, legacy_id, new_id)?;
            }
        }

        handler.post_save(legacy_id, new_id, self)?;
        Ok(SaveOutcome::Inserted(new_id))
    }

    fn rollback_quietly(&mut self, import_type: &str) {
        if let Err(err) = self.store.rollback() {
            warn!(import_type, error = %err, "rollback after failed save also failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::PlainHandler;
    use crate::memory::MemoryStore;
    use crate::schema::{Column, ColumnType, TableSchema};

    fn registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry
            .register_plain(
                TableSchema::new("tag", "tag", &["tag_id"])
                    .with_column(Column::new("tag_id", ColumnType::Uint).auto_increment())
                    .with_column(Column::new("tag", ColumnType::Str).max_length(20).required()),
            )
            .unwrap_or_else(|err| panic!("tag registration failed: {err}"));
        registry
    }

    fn store() -> MemoryStore {
        MemoryStore::new().with_auto_increment("tag", "tag_id")
    }

    struct FailingPostSave {
        inner: PlainHandler,
    }

    impl ImportHandler for FailingPostSave {
        fn import_type(&self) -> &str {
            self.inner.import_type()
        }

        fn write(
            &mut self,
            legacy_id: Option<i64>,
            target: &mut ImportTarget<'_>,
        ) -> ImportResult<Option<i64>> {
            self.inner.write(legacy_id, target)
        }

        fn post_save(
            &mut self,
            _legacy_id: Option<i64>,
            _new_id: i64,
            _target: &mut ImportTarget<'_>,
        ) -> ImportResult<()> {
            Err(ImportError::Storage("secondary table unavailable".to_string()))
        }
    }

    fn tag_handler(target: &ImportTarget<'_>, name: &str) -> Box<dyn RecordHandler> {
        let mut handler =
            target.new_handler("tag").unwrap_or_else(|err| panic!("tag handler: {err}"));
        handler
            .set("tag", Value::from(name))
            .unwrap_or_else(|err| panic!("tag value rejected: {err}"));
        handler
    }

    #[test]
    fn second_save_of_same_legacy_id_returns_existing() -> ImportResult<()> {
        let registry = registry();
        let mut store = store();
        let mut target = ImportTarget::new(&mut store, &registry, false, TextConverter::utf8());

        let mut first = tag_handler(&target, "rust");
        let inserted = target.save(first.as_mut(), Some(11))?;
        let mut second = tag_handler(&target, "rust");
        let existing = target.save(second.as_mut(), Some(11))?;

        assert_eq!(inserted, SaveOutcome::Inserted(1));
        assert_eq!(existing, SaveOutcome::Existing(1));
        assert_eq!(store.rows("tag").len(), 1);
        Ok(())
    }

    #[test]
    fn failed_post_save_leaves_no_row_and_no_mapping() {
        let registry = registry();
        let mut store = store();
        let mut target = ImportTarget::new(&mut store, &registry, false, TextConverter::utf8());

        let schema =
            target.registry().schema("tag").unwrap_or_else(|err| panic!("tag schema: {err}"));
        let mut inner = PlainHandler::new(schema, target.text())
            .unwrap_or_else(|err| panic!("tag handler: {err}"));
        inner
            .set("tag", Value::from("doomed"))
            .unwrap_or_else(|err| panic!("tag value rejected: {err}"));
        let mut handler = FailingPostSave { inner };

        let result = target.save(&mut handler, Some(5));
        assert!(matches!(result, Err(ImportError::Storage(_))));
        assert!(target.lookup("tag", 5).unwrap_or(Some(-1)).is_none());
        assert!(store.rows("tag").is_empty());
        assert_eq!(store.transaction_depth(), 0);
    }

    #[test]
    fn validation_failure_is_record_level_and_rolled_back() {
        let registry = registry();
        let mut store = store();
        let mut target = ImportTarget::new(&mut store, &registry, false, TextConverter::utf8());

        let mut handler =
            target.new_handler("tag").unwrap_or_else(|err| panic!("tag handler: {err}"));
        let err = target.save(handler.as_mut(), Some(3)).err();
        assert!(err.as_ref().is_some_and(ImportError::is_record_level));
        assert_eq!(store.transaction_depth(), 0);
    }

    #[test]
    fn zero_legacy_id_is_written_but_never_logged() -> ImportResult<()> {
        let registry = registry();
        let mut store = store();
        let mut target = ImportTarget::new(&mut store, &registry, false, TextConverter::utf8());

        let mut handler = tag_handler(&target, "orphan");
        assert_eq!(target.save(handler.as_mut(), Some(0))?, SaveOutcome::Inserted(1));
        assert_eq!(store.log_len(), 0);
        Ok(())
    }

    #[test]
    fn lookup_helpers_distinguish_soft_and_hard_references() -> ImportResult<()> {
        let registry = registry();
        let mut store = store();
        let mut target = ImportTarget::new(&mut store, &registry, false, TextConverter::utf8());
        target.log_mapping("tag", 7, 70)?;

        assert_eq!(target.lookup_id("tag", 8, 0)?, 0);
        assert_eq!(target.require("tag", 7)?, 70);
        assert!(matches!(
            target.require("tag", 8),
            Err(ImportError::UnresolvedReference { legacy_id: 8, .. })
        ));
        let batch = target.lookup_batch("tag", [7, 7, 0, 8])?;
        assert_eq!(batch, BTreeMap::from([(7, 70)]));
        Ok(())
    }

    #[test]
    fn conflicting_mapping_is_a_configuration_error() -> ImportResult<()> {
        let registry = registry();
        let mut store = store();
        let mut target = ImportTarget::new(&mut store, &registry, false, TextConverter::utf8());
        target.log_mapping("tag", 7, 70)?;
        target.log_mapping("tag", 7, 70)?;
        assert!(matches!(target.log_mapping("tag", 7, 71), Err(ImportError::Configuration(_))));
        assert!(matches!(target.log_mapping("user", 7, 70), Err(ImportError::Configuration(_))));
        Ok(())
    }
}
