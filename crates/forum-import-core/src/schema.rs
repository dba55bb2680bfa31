use std::collections::BTreeMap;

use crate::error::{ImportError, ImportResult};
use crate::value::{parse_leading_int, Value};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ColumnType {
    Uint,
    Int,
    Float,
    Str,
    Bool,
    Binary,
    /// Structured data stored as serialized JSON text.
    Json,
    /// Positive integers stored as comma separated text, sorted and deduplicated.
    UintList,
}

impl ColumnType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uint => "uint",
            Self::Int => "int",
            Self::Float => "float",
            Self::Str => "str",
            Self::Bool => "bool",
            Self::Binary => "binary",
            Self::Json => "json",
            Self::UintList => "uint_list",
        }
    }

    fn is_integer(self) -> bool {
        matches!(self, Self::Uint | Self::Int)
    }
}

/// How a value that violates a column's length or range constraint is treated.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum ConstraintMode {
    /// Truncate over-long strings and clamp numbers into range.
    #[default]
    Force,
    /// Reject the value with a validation error.
    Reject,
    /// Store the value unchanged.
    Ignore,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub required: bool,
    pub default: Option<Value>,
    pub auto_increment: bool,
    pub max_length: Option<usize>,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub allowed_values: Vec<String>,
}

impl Column {
    #[must_use]
    pub fn new(name: &str, column_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            column_type,
            nullable: false,
            required: false,
            default: None,
            auto_increment: false,
            max_length: None,
            min: None,
            max: None,
            allowed_values: Vec::new(),
        }
    }

    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    #[must_use]
    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    #[must_use]
    pub fn max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }

    #[must_use]
    pub fn range(mut self, min: Option<i64>, max: Option<i64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    #[must_use]
    pub fn allowed(mut self, values: &[&str]) -> Self {
        self.allowed_values = values.iter().map(ToString::to_string).collect();
        self
    }

    /// Coerces a value into this column's declared type.
    ///
    /// # Errors
    /// Returns a reason string when the value has no sensible representation in the column type.
    pub fn cast(&self, value: Value) -> Result<Value, String> {
        if value.is_null() && self.nullable {
            return Ok(Value::Null);
        }

        match self.column_type {
            ColumnType::Uint | ColumnType::Int => match value {
                Value::Null => Ok(Value::Int(0)),
                Value::IntList(_) | Value::Json(_) => {
                    Err(format!("cannot cast {} to integer", value.type_name()))
                }
                other => Ok(Value::Int(other.as_i64().unwrap_or(0))),
            },
            ColumnType::Float => match value {
                Value::Null => Ok(Value::Float(0.0)),
                Value::Float(number) => Ok(Value::Float(number)),
                #[allow(clippy::cast_precision_loss)]
                Value::Int(number) => Ok(Value::Float(number as f64)),
                Value::Bool(flag) => Ok(Value::Float(if flag { 1.0 } else { 0.0 })),
                Value::Text(text) => Ok(Value::Float(text.trim().parse::<f64>().unwrap_or(0.0))),
                other => Err(format!("cannot cast {} to float", other.type_name())),
            },
            ColumnType::Str => match value {
                Value::Null => Ok(Value::Text(String::new())),
                Value::Text(text) => Ok(Value::Text(text)),
                Value::Bytes(bytes) => Ok(Value::Text(String::from_utf8_lossy(&bytes).into_owned())),
                Value::Bool(flag) => Ok(Value::Text(if flag { "1" } else { "" }.to_string())),
                Value::Int(_) | Value::Float(_) => Ok(Value::Text(value.to_string())),
                other => Err(format!("cannot cast {} to string", other.type_name())),
            },
            ColumnType::Bool => match value {
                Value::Null => Ok(Value::Bool(false)),
                Value::Bool(flag) => Ok(Value::Bool(flag)),
                Value::Int(number) => Ok(Value::Bool(number != 0)),
                Value::Float(number) => Ok(Value::Bool(number != 0.0)),
                Value::Text(text) => Ok(Value::Bool(!(text.is_empty() || text == "0"))),
                other => Err(format!("cannot cast {} to bool", other.type_name())),
            },
            ColumnType::Binary => match value {
                Value::Null => Ok(Value::Bytes(Vec::new())),
                Value::Bytes(bytes) => Ok(Value::Bytes(bytes)),
                Value::Text(text) => Ok(Value::Bytes(text.into_bytes())),
                Value::Int(_) | Value::Float(_) | Value::Bool(_) => {
                    Ok(Value::Bytes(value.to_string().into_bytes()))
                }
                other => Err(format!("cannot cast {} to binary", other.type_name())),
            },
            ColumnType::Json => match value {
                Value::Null => Ok(Value::Json(serde_json::Value::Null)),
                Value::Json(json) => Ok(Value::Json(json)),
                Value::Text(text) => serde_json::from_str(&text)
                    .map(Value::Json)
                    .map_err(|err| format!("invalid serialized value: {err}")),
                Value::IntList(items) => Ok(Value::Json(serde_json::json!(items))),
                Value::Int(number) => Ok(Value::Json(serde_json::json!(number))),
                Value::Bool(flag) => Ok(Value::Json(serde_json::json!(flag))),
                other => Err(format!("cannot cast {} to json", other.type_name())),
            },
            ColumnType::UintList => {
                let items = match value {
                    Value::Null => Vec::new(),
                    Value::IntList(items) => items,
                    Value::Int(number) => vec![number],
                    Value::Text(text) => text
                        .split(',')
                        .map(str::trim)
                        .filter(|item| !item.is_empty())
                        .map(parse_leading_int)
                        .collect(),
                    Value::Json(serde_json::Value::Array(items)) => {
                        items.iter().filter_map(serde_json::Value::as_i64).collect()
                    }
                    other => return Err(format!("cannot cast {} to id list", other.type_name())),
                };
                let mut items: Vec<i64> = items.into_iter().filter(|item| *item > 0).collect();
                items.sort_unstable();
                items.dedup();
                Ok(Value::IntList(items))
            }
        }
    }

    /// Applies length, range and allowed-value constraints to an already cast value.
    ///
    /// # Errors
    /// Returns a reason string when the value violates a constraint and `mode` does not repair it.
    pub fn constrain(&self, value: Value, mode: ConstraintMode) -> Result<Value, String> {
        if mode == ConstraintMode::Ignore {
            return Ok(value);
        }

        match value {
            Value::Int(number) if self.column_type.is_integer() => {
                let min = match (self.column_type, self.min) {
                    (ColumnType::Uint, Some(min)) => Some(min.max(0)),
                    (ColumnType::Uint, None) => Some(0),
                    (_, min) => min,
                };
                if let Some(min) = min.filter(|min| number < *min) {
                    return match mode {
                        ConstraintMode::Force => Ok(Value::Int(min)),
                        _ => Err(format!("value {number} is below minimum {min}")),
                    };
                }
                if let Some(max) = self.max.filter(|max| number > *max) {
                    return match mode {
                        ConstraintMode::Force => Ok(Value::Int(max)),
                        _ => Err(format!("value {number} exceeds maximum {max}")),
                    };
                }
                Ok(Value::Int(number))
            }
            Value::Text(text) => {
                if !self.allowed_values.is_empty() && !self.allowed_values.contains(&text) {
                    return Err(format!(
                        "value `{text}` is not one of: {}",
                        self.allowed_values.join(", ")
                    ));
                }
                match self.max_length {
                    Some(max_length) if text.chars().count() > max_length => match mode {
                        ConstraintMode::Force => {
                            Ok(Value::Text(text.chars().take(max_length).collect()))
                        }
                        _ => Err(format!("exceeds max length {max_length}")),
                    },
                    _ => Ok(Value::Text(text)),
                }
            }
            Value::Bytes(mut bytes) => match self.max_length {
                Some(max_length) if bytes.len() > max_length => match mode {
                    ConstraintMode::Force => {
                        bytes.truncate(max_length);
                        Ok(Value::Bytes(bytes))
                    }
                    _ => Err(format!("exceeds max length {max_length}")),
                },
                _ => Ok(Value::Bytes(bytes)),
            },
            other => Ok(other),
        }
    }

    /// Converts a typed value into the representation target storage persists.
    #[must_use]
    pub fn encode(&self, value: &Value) -> Value {
        match value {
            Value::Bool(flag) => Value::Int(i64::from(*flag)),
            Value::IntList(_) => Value::Text(value.to_string()),
            Value::Json(json) => Value::Text(json.to_string()),
            other => other.clone(),
        }
    }
}

/// Column layout of one target table and the entity type records in it are logged under.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    entity_type: String,
    table: String,
    primary_key: Vec<String>,
    columns: Vec<Column>,
    index: BTreeMap<String, usize>,
}

impl TableSchema {
    #[must_use]
    pub fn new(entity_type: &str, table: &str, primary_key: &[&str]) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            table: table.to_string(),
            primary_key: primary_key.iter().map(ToString::to_string).collect(),
            columns: Vec::new(),
            index: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_column(mut self, column: Column) -> Self {
        if let Some(position) = self.index.get(&column.name) {
            self.columns[*position] = column;
        } else {
            self.index.insert(column.name.clone(), self.columns.len());
            self.columns.push(column);
        }
        self
    }

    #[must_use]
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    #[must_use]
    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.index.get(name).map(|position| &self.columns[*position])
    }

    pub fn columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter()
    }

    /// The single primary key column record writers require.
    ///
    /// # Errors
    /// Returns `ImportError::Configuration` for compound or undeclared primary keys.
    pub fn single_primary_key(&self) -> ImportResult<&Column> {
        let [name] = self.primary_key.as_slice() else {
            return Err(ImportError::Configuration(format!(
                "table `{}` must have exactly one primary key column, found {}",
                self.table,
                self.primary_key.len()
            )));
        };
        self.column(name).ok_or_else(|| {
            ImportError::Configuration(format!(
                "primary key `{name}` is not a declared column of `{}`",
                self.table
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uint_casts_strings_and_clamps_negative_values() {
        let column = Column::new("message_count", ColumnType::Uint);
        let cast = column.cast(Value::from("-5 posts")).unwrap_or(Value::Null);
        assert_eq!(cast, Value::Int(-5));
        assert_eq!(column.constrain(cast.clone(), ConstraintMode::Force), Ok(Value::Int(0)));
        assert!(column.constrain(cast.clone(), ConstraintMode::Reject).is_err());
        assert_eq!(column.constrain(cast, ConstraintMode::Ignore), Ok(Value::Int(-5)));
    }

    #[test]
    fn string_length_is_truncated_by_characters() {
        let column = Column::new("title", ColumnType::Str).max_length(3);
        assert_eq!(
            column.constrain(Value::from("ünïcode"), ConstraintMode::Force),
            Ok(Value::from("ünï"))
        );
        assert_eq!(
            column.constrain(Value::from("toolong"), ConstraintMode::Reject),
            Err("exceeds max length 3".to_string())
        );
    }

    #[test]
    fn allowed_values_are_enforced_unless_ignored() {
        let column = Column::new("state", ColumnType::Str).allowed(&["visible", "deleted"]);
        assert!(column.constrain(Value::from("bogus"), ConstraintMode::Force).is_err());
        assert!(column.constrain(Value::from("bogus"), ConstraintMode::Ignore).is_ok());
        assert!(column.constrain(Value::from("visible"), ConstraintMode::Reject).is_ok());
    }

    #[test]
    fn id_lists_are_positive_sorted_and_unique() {
        let column = Column::new("secondary_group_ids", ColumnType::UintList);
        assert_eq!(column.cast(Value::from("4, 2,0,4,-1,3")), Ok(Value::IntList(vec![2, 3, 4])));
        assert_eq!(column.encode(&Value::IntList(vec![2, 3, 4])), Value::from("2,3,4"));
    }

    #[test]
    fn nullable_columns_keep_null_and_others_coerce() {
        let nullable = Column::new("last_seen", ColumnType::Int).nullable();
        let plain = Column::new("last_seen", ColumnType::Int);
        assert_eq!(nullable.cast(Value::Null), Ok(Value::Null));
        assert_eq!(plain.cast(Value::Null), Ok(Value::Int(0)));
    }

    #[test]
    fn json_columns_reject_malformed_text() {
        let column = Column::new("extra", ColumnType::Json);
        assert!(column.cast(Value::from("{not json")).is_err());
        assert_eq!(column.encode(&Value::Json(serde_json::json!({"a": 1}))), Value::from("{\"a\":1}"));
    }

    #[test]
    fn compound_primary_keys_are_rejected() {
        let schema = TableSchema::new("watch", "thread_watch", &["user_id", "thread_id"])
            .with_column(Column::new("user_id", ColumnType::Uint))
            .with_column(Column::new("thread_id", ColumnType::Uint));
        assert!(matches!(schema.single_primary_key(), Err(ImportError::Configuration(_))));
    }
}
