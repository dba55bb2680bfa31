use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::trace;

use crate::error::{ImportError, ImportResult};
use crate::schema::{ColumnType, ConstraintMode, TableSchema};
use crate::storage::TargetStorage;
use crate::text::TextConverter;
use crate::value::{Row, Value};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SetOptions {
    /// Run string values through the session's text converter before casting.
    pub convert_text: bool,
    pub constraint: ConstraintMode,
}

impl Default for SetOptions {
    fn default() -> Self {
        Self { convert_text: true, constraint: ConstraintMode::Force }
    }
}

impl SetOptions {
    #[must_use]
    pub fn strict() -> Self {
        Self { constraint: ConstraintMode::Reject, ..Self::default() }
    }
}

/// Schema-constrained row builder for one target table.
///
/// Values are cast and constrained as they are set, so the write set produced at insert or
/// update time only needs the required/default pass.
#[derive(Debug, Clone)]
pub struct RecordWriter {
    schema: Arc<TableSchema>,
    primary_key: String,
    auto_increment: bool,
    text: TextConverter,
    values: BTreeMap<String, Value>,
}

impl RecordWriter {
    /// # Errors
    /// Returns `ImportError::Configuration` when the schema has no single primary key column.
    pub fn new(schema: Arc<TableSchema>, text: TextConverter) -> ImportResult<Self> {
        let primary = schema.single_primary_key()?;
        let primary_key = primary.name.clone();
        let auto_increment = primary.auto_increment;
        Ok(Self { schema, primary_key, auto_increment, text, values: BTreeMap::new() })
    }

    #[must_use]
    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    #[must_use]
    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    #[must_use]
    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    /// # Errors
    /// See [`RecordWriter::set_with`].
    pub fn set(&mut self, column: &str, value: impl Into<Value>) -> ImportResult<()> {
        self.set_with(column, value, SetOptions::default())
    }

    /// Casts, converts and constrains `value` before storing it under `column`.
    ///
    /// # Errors
    /// Returns `ImportError::Configuration` for columns the schema does not declare and
    /// `ImportError::Validation` when the value cannot be cast or violates a constraint that
    /// `options` does not repair.
    pub fn set_with(
        &mut self,
        column: &str,
        value: impl Into<Value>,
        options: SetOptions,
    ) -> ImportResult<()> {
        let Some(definition) = self.schema.column(column) else {
            return Err(ImportError::Configuration(format!(
                "unknown column `{column}` for table `{}`",
                self.schema.table()
            )));
        };

        let mut value = value.into();
        if options.convert_text && definition.column_type == ColumnType::Str {
            value = self.text.convert(value);
        }

        let value = definition
            .cast(value)
            .and_then(|cast| definition.constrain(cast, options.constraint))
            .map_err(|reason| ImportError::validation(column, reason))?;

        self.values.insert(column.to_string(), value);
        Ok(())
    }

    /// Reads a column: the explicitly set value, else the declared default, else null for
    /// nullable columns.
    ///
    /// # Errors
    /// Returns `ImportError::Configuration` for unknown columns and `ImportError::Validation`
    /// when the column has no value, no default and is not nullable.
    pub fn get(&self, column: &str) -> ImportResult<Value> {
        let Some(definition) = self.schema.column(column) else {
            return Err(ImportError::Configuration(format!(
                "unknown column `{column}` for table `{}`",
                self.schema.table()
            )));
        };

        if let Some(value) = self.values.get(column) {
            return Ok(value.clone());
        }
        if let Some(default) = &definition.default {
            return Ok(default.clone());
        }
        if definition.nullable {
            return Ok(Value::Null);
        }
        Err(ImportError::validation(column, "column has no value and no default"))
    }

    #[must_use]
    pub fn get_or_null(&self, column: &str) -> Value {
        self.get(column).unwrap_or(Value::Null)
    }

    pub fn remove(&mut self, column: &str) -> Option<Value> {
        self.values.remove(column)
    }

    #[must_use]
    pub fn has_column(&self, column: &str) -> bool {
        self.schema.column(column).is_some()
    }

    #[must_use]
    pub fn is_set(&self, column: &str) -> bool {
        self.values.contains_key(column)
    }

    /// Assembles the storage row for an insert or an update.
    ///
    /// Inserts walk every declared column in order: set value, then default, then null for
    /// nullable columns. Required columns without a value fail. Updates only carry columns that
    /// were explicitly set.
    ///
    /// # Errors
    /// Returns `ImportError::Validation` naming the first required column that is missing or
    /// holds an empty value.
    pub fn build_write_set(&self, for_insert: bool) -> ImportResult<Row> {
        let mut write = Row::new();

        for column in self.schema.columns() {
            let value = if let Some(value) = self.values.get(&column.name) {
                if column.required && value.is_empty() {
                    return Err(ImportError::validation(
                        &column.name,
                        "required column has an empty value",
                    ));
                }
                value.clone()
            } else if !for_insert {
                continue;
            } else if let Some(default) = &column.default {
                default.clone()
            } else if column.nullable {
                Value::Null
            } else if column.required {
                return Err(ImportError::validation(&column.name, "required column has no value"));
            } else {
                continue;
            };

            write.insert(column.name.clone(), column.encode(&value));
        }

        Ok(write)
    }

    /// Inserts the record and returns its primary key in the target.
    ///
    /// When the primary key was not set explicitly it is taken from `legacy_id` if
    /// `retain_ids` is on, else left for the storage to assign on auto-increment tables.
    ///
    /// # Errors
    /// Returns `ImportError::Configuration` when a non auto-increment key has no value,
    /// `ImportError::Validation` for incomplete records and `ImportError::Storage` when the
    /// insert fails.
    pub fn insert<S: TargetStorage + ?Sized>(
        &mut self,
        legacy_id: Option<i64>,
        storage: &mut S,
        retain_ids: bool,
    ) -> ImportResult<i64> {
        if !self.values.contains_key(&self.primary_key) {
            match legacy_id {
                Some(legacy_id) if retain_ids && legacy_id > 0 => {
                    self.values.insert(self.primary_key.clone(), Value::Int(legacy_id));
                }
                _ if self.auto_increment => {
                    self.values.insert(self.primary_key.clone(), Value::Null);
                }
                _ => {
                    return Err(ImportError::Configuration(format!(
                        "primary key `{}` of `{}` is not auto-increment, value must be provided",
                        self.primary_key,
                        self.schema.table()
                    )));
                }
            }
        }

        let mut write = self.build_write_set(true)?;
        let assign_key = self.auto_increment
            && matches!(write.get(&self.primary_key), None | Some(Value::Null | Value::Int(0)));
        if assign_key {
            write.remove(&self.primary_key);
        }

        let row_id = storage.insert(self.schema.table(), &write)?;
        let new_id = if assign_key {
            row_id
        } else {
            match write.get(&self.primary_key).and_then(Value::as_i64) {
                Some(id) => id,
                None => {
                    return Err(ImportError::Configuration(format!(
                        "primary key `{}` of `{}` is not an integer",
                        self.primary_key,
                        self.schema.table()
                    )))
                }
            }
        };

        self.values.insert(self.primary_key.clone(), Value::Int(new_id));
        trace!(table = self.schema.table(), new_id, "inserted record");
        Ok(new_id)
    }

    /// Updates the row identified by `identity` with the explicitly set columns.
    ///
    /// Returns `false` without touching storage when nothing was set.
    ///
    /// # Errors
    /// Returns `ImportError::Validation` for empty required values and `ImportError::Storage`
    /// when the update fails.
    pub fn update<S: TargetStorage + ?Sized>(
        &mut self,
        identity: i64,
        storage: &mut S,
    ) -> ImportResult<bool> {
        let mut write = self.build_write_set(false)?;
        if write.get(&self.primary_key).is_some_and(Value::is_null) {
            write.remove(&self.primary_key);
        }
        if write.is_empty() {
            return Ok(false);
        }

        storage.update(self.schema.table(), &write, &self.primary_key, identity)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::schema::Column;

    fn user_schema() -> Arc<TableSchema> {
        Arc::new(
            TableSchema::new("user", "user", &["user_id"])
                .with_column(Column::new("user_id", ColumnType::Uint).auto_increment())
                .with_column(Column::new("username", ColumnType::Str).max_length(10).required())
                .with_column(Column::new("email", ColumnType::Str).default_value(""))
                .with_column(Column::new("signature", ColumnType::Str).nullable())
                .with_column(Column::new("message_count", ColumnType::Uint).default_value(0)),
        )
    }

    fn writer() -> RecordWriter {
        RecordWriter::new(user_schema(), TextConverter::utf8())
            .unwrap_or_else(|err| panic!("user schema should be valid: {err}"))
    }

    #[test]
    fn unknown_columns_are_configuration_errors() {
        let mut record = writer();
        assert!(matches!(record.set("nope", 1), Err(ImportError::Configuration(_))));
        assert!(matches!(record.get("nope"), Err(ImportError::Configuration(_))));
    }

    #[test]
    fn get_falls_back_to_default_then_null() -> ImportResult<()> {
        let mut record = writer();
        assert_eq!(record.get("email")?, Value::from(""));
        assert_eq!(record.get("signature")?, Value::Null);
        assert!(matches!(record.get("username"), Err(ImportError::Validation { .. })));

        record.set("username", "bob")?;
        assert_eq!(record.get("username")?, Value::from("bob"));
        assert_eq!(record.remove("username"), Some(Value::from("bob")));
        assert!(!record.is_set("username"));
        Ok(())
    }

    #[test]
    fn strict_set_rejects_overlong_values() {
        let mut record = writer();
        let err = record.set_with("username", "a-very-long-name", SetOptions::strict());
        assert!(matches!(err, Err(ImportError::Validation { column, .. }) if column == "username"));
        assert!(!record.is_set("username"));
    }

    #[test]
    fn insert_write_set_fills_defaults_and_rejects_missing_required() -> ImportResult<()> {
        let mut record = writer();
        assert!(matches!(
            record.build_write_set(true),
            Err(ImportError::Validation { column, .. }) if column == "username"
        ));

        record.set("username", "carol")?;
        let write = record.build_write_set(true)?;
        assert_eq!(write.get("email"), Some(&Value::from("")));
        assert_eq!(write.get("signature"), Some(&Value::Null));
        assert_eq!(write.get("message_count"), Some(&Value::Int(0)));
        Ok(())
    }

    #[test]
    fn empty_required_value_is_rejected() -> ImportResult<()> {
        let mut record = writer();
        record.set("username", "")?;
        assert!(matches!(record.build_write_set(true), Err(ImportError::Validation { .. })));
        Ok(())
    }

    #[test]
    fn insert_assigns_auto_increment_or_retains_legacy_id() -> ImportResult<()> {
        let mut store = MemoryStore::new().with_auto_increment("user", "user_id");

        let mut first = writer();
        first.set("username", "dave")?;
        let assigned = first.insert(Some(40), &mut store, false)?;
        assert_eq!(assigned, 1);
        assert_eq!(first.get("user_id")?, Value::Int(1));

        let mut second = writer();
        second.set("username", "erin")?;
        let retained = second.insert(Some(40), &mut store, true)?;
        assert_eq!(retained, 40);
        Ok(())
    }

    #[test]
    fn non_auto_increment_key_must_be_provided() {
        let schema = Arc::new(
            TableSchema::new("forum", "forum", &["node_id"])
                .with_column(Column::new("node_id", ColumnType::Uint))
                .with_column(Column::new("discussion_count", ColumnType::Uint).default_value(0)),
        );
        let mut record = RecordWriter::new(schema, TextConverter::utf8())
            .unwrap_or_else(|err| panic!("forum schema should be valid: {err}"));
        let mut store = MemoryStore::new();

        assert!(matches!(
            record.insert(None, &mut store, false),
            Err(ImportError::Configuration(message)) if message.contains("not auto-increment")
        ));
    }

    #[test]
    fn update_with_nothing_set_is_a_noop() -> ImportResult<()> {
        let mut store = MemoryStore::new().with_auto_increment("user", "user_id");
        let mut record = writer();
        assert!(!record.update(1, &mut store)?);

        record.set("username", "frank")?;
        let id = record.insert(None, &mut store, false)?;

        let mut change = writer();
        change.set("message_count", 9)?;
        assert!(change.update(id, &mut store)?);
        let rows = store.rows("user");
        assert_eq!(rows[0].get("message_count"), Some(&Value::Int(9)));
        Ok(())
    }

    #[test]
    fn update_leaves_unset_defaulted_columns_alone() -> ImportResult<()> {
        let mut store = MemoryStore::new().with_auto_increment("user", "user_id");
        let mut record = writer();
        record.set("username", "grace")?;
        record.set("email", "grace@example.com")?;
        let id = record.insert(None, &mut store, false)?;

        let mut change = writer();
        change.set("message_count", 4)?;
        let write = change.build_write_set(false)?;
        assert_eq!(write.keys().collect::<Vec<_>>(), ["message_count"]);

        assert!(change.update(id, &mut store)?);
        let rows = store.rows("user");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("email"), Some(&Value::from("grace@example.com")));
        assert_eq!(rows[0].get("username"), Some(&Value::from("grace")));
        assert_eq!(rows[0].get("message_count"), Some(&Value::Int(4)));
        Ok(())
    }
}
