use std::collections::BTreeMap;
use std::sync::Arc;

use crate::data::PlainHandler;
use crate::error::{ImportError, ImportResult};
use crate::handler::RecordHandler;
use crate::runner::Importer;
use crate::schema::TableSchema;
use crate::text::TextConverter;

/// A handler type with its own behavior, bound to the schema registered under
/// `ENTITY_TYPE`.
pub trait RegisteredHandler: RecordHandler + Sized + 'static {
    const ENTITY_TYPE: &'static str;

    /// # Errors
    /// Returns `ImportError::Configuration` when `schema` does not fit the handler.
    fn build(schema: Arc<TableSchema>, text: TextConverter) -> ImportResult<Self>;
}

pub type HandlerFactory =
    fn(Arc<TableSchema>, TextConverter) -> ImportResult<Box<dyn RecordHandler>>;

struct HandlerEntry {
    schema: Arc<TableSchema>,
    factory: HandlerFactory,
}

/// Entity type to target schema and handler constructor.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: BTreeMap<String, HandlerEntry>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns `ImportError::Configuration` when the entity type is already registered or the
    /// schema has no single primary key.
    pub fn register(&mut self, schema: TableSchema, factory: HandlerFactory) -> ImportResult<()> {
        schema.single_primary_key()?;
        let entity_type = schema.entity_type().to_string();
        if self.entries.contains_key(&entity_type) {
            return Err(ImportError::Configuration(format!(
                "entity type `{entity_type}` is already registered"
            )));
        }
        self.entries.insert(entity_type, HandlerEntry { schema: Arc::new(schema), factory });
        Ok(())
    }

    /// Registers a table whose records need no behavior beyond the record writer.
    ///
    /// # Errors
    /// See [`HandlerRegistry::register`].
    pub fn register_plain(&mut self, schema: TableSchema) -> ImportResult<()> {
        self.register(schema, plain_factory)
    }

    /// # Errors
    /// See [`HandlerRegistry::register`]. The schema's entity type must equal
    /// `T::ENTITY_TYPE`.
    pub fn register_handler<T: RegisteredHandler>(&mut self, schema: TableSchema) -> ImportResult<()> {
        if schema.entity_type() != T::ENTITY_TYPE {
            return Err(ImportError::Configuration(format!(
                "schema for `{}` cannot back handler for `{}`",
                schema.entity_type(),
                T::ENTITY_TYPE
            )));
        }
        self.register(schema, boxed_factory::<T>)
    }

    /// # Errors
    /// Returns `ImportError::Configuration` when no handler is registered for `entity_type`.
    pub fn create(&self, entity_type: &str, text: TextConverter) -> ImportResult<Box<dyn RecordHandler>> {
        let entry = self.entry(entity_type)?;
        (entry.factory)(Arc::clone(&entry.schema), text)
    }

    /// # Errors
    /// Returns `ImportError::Configuration` when no handler is registered for `entity_type`.
    pub fn schema(&self, entity_type: &str) -> ImportResult<Arc<TableSchema>> {
        self.entry(entity_type).map(|entry| Arc::clone(&entry.schema))
    }

    #[must_use]
    pub fn contains(&self, entity_type: &str) -> bool {
        self.entries.contains_key(entity_type)
    }

    pub fn schemas(&self) -> impl Iterator<Item = &TableSchema> {
        self.entries.values().map(|entry| entry.schema.as_ref())
    }

    fn entry(&self, entity_type: &str) -> ImportResult<&HandlerEntry> {
        self.entries.get(entity_type).ok_or_else(|| {
            ImportError::Configuration(format!(
                "no import handler registered for entity type `{entity_type}`"
            ))
        })
    }
}

fn plain_factory(
    schema: Arc<TableSchema>,
    text: TextConverter,
) -> ImportResult<Box<dyn RecordHandler>> {
    Ok(Box::new(PlainHandler::new(schema, text)?))
}

fn boxed_factory<T: RegisteredHandler>(
    schema: Arc<TableSchema>,
    text: TextConverter,
) -> ImportResult<Box<dyn RecordHandler>> {
    Ok(Box::new(T::build(schema, text)?))
}

pub type ImporterFactory = fn() -> Box<dyn Importer>;

/// Source platform importers by key.
#[derive(Default)]
pub struct ImporterRegistry {
    factories: BTreeMap<String, ImporterFactory>,
}

impl ImporterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns `ImportError::Configuration` when the key is already taken.
    pub fn register(&mut self, key: &str, factory: ImporterFactory) -> ImportResult<()> {
        if self.factories.contains_key(key) {
            return Err(ImportError::Configuration(format!("importer `{key}` is already registered")));
        }
        self.factories.insert(key.to_string(), factory);
        Ok(())
    }

    /// # Errors
    /// Returns `ImportError::Configuration` for unknown keys.
    pub fn create(&self, key: &str) -> ImportResult<Box<dyn Importer>> {
        self.factories
            .get(key)
            .map(|factory| factory())
            .ok_or_else(|| ImportError::Configuration(format!("unknown importer `{key}`")))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{self, NodeHandler};
    use crate::schema::{Column, ColumnType};

    #[test]
    fn target_registry_knows_every_forum_entity() -> ImportResult<()> {
        let registry = data::target_registry()?;
        for entity in ["user_group", "user", "node", "forum", "category", "page", "thread", "post", "moderator"] {
            assert!(registry.contains(entity), "missing {entity}");
        }
        Ok(())
    }

    #[test]
    fn duplicate_registration_is_rejected() -> ImportResult<()> {
        let mut registry = HandlerRegistry::new();
        let schema = || {
            TableSchema::new("tag", "tag", &["tag_id"])
                .with_column(Column::new("tag_id", ColumnType::Uint).auto_increment())
        };
        registry.register_plain(schema())?;
        assert!(matches!(registry.register_plain(schema()), Err(ImportError::Configuration(_))));
        Ok(())
    }

    #[test]
    fn typed_handler_requires_matching_entity_type() {
        let mut registry = HandlerRegistry::new();
        let schema = TableSchema::new("tag", "tag", &["tag_id"])
            .with_column(Column::new("tag_id", ColumnType::Uint).auto_increment());
        assert!(registry.register_handler::<NodeHandler>(schema).is_err());
    }

    #[test]
    fn unknown_lookups_are_configuration_errors() {
        let registry = HandlerRegistry::new();
        assert!(matches!(
            registry.create("ghost", TextConverter::utf8()),
            Err(ImportError::Configuration(_))
        ));
        assert!(ImporterRegistry::new().create("phpbb").is_err());
    }
}
