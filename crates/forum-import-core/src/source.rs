use std::cmp::Ordering;

use crate::error::ImportResult;
use crate::value::{Row, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    NotEq(String, Value),
    /// Row-value comparison `(columns...) > (values...)`, used to page through composite keys.
    After(Vec<String>, Vec<Value>),
}

/// A ranged, filtered, ordered read of one legacy table.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceQuery {
    pub table: String,
    pub key_column: String,
    /// Exclusive lower bound on `key_column`.
    pub start_after: Option<i64>,
    /// Inclusive upper bound on `key_column`.
    pub end: Option<i64>,
    pub filters: Vec<Filter>,
    /// Ascending sort columns; defaults to `key_column`.
    pub order_by: Vec<String>,
    pub limit: Option<usize>,
}

impl SourceQuery {
    #[must_use]
    pub fn new(table: &str, key_column: &str) -> Self {
        Self {
            table: table.to_string(),
            key_column: key_column.to_string(),
            start_after: None,
            end: None,
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        }
    }

    #[must_use]
    pub fn range(mut self, start_after: i64, end: i64) -> Self {
        self.start_after = Some(start_after);
        self.end = Some(end);
        self
    }

    #[must_use]
    pub fn filter_eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq(column.to_string(), value.into()));
        self
    }

    #[must_use]
    pub fn filter_ne(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::NotEq(column.to_string(), value.into()));
        self
    }

    #[must_use]
    pub fn after(mut self, columns: &[&str], values: Vec<Value>) -> Self {
        self.filters
            .push(Filter::After(columns.iter().map(ToString::to_string).collect(), values));
        self
    }

    #[must_use]
    pub fn order_by(mut self, columns: &[&str]) -> Self {
        self.order_by = columns.iter().map(ToString::to_string).collect();
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sort columns, falling back to the key column.
    #[must_use]
    pub fn effective_order(&self) -> Vec<String> {
        if self.order_by.is_empty() {
            vec![self.key_column.clone()]
        } else {
            self.order_by.clone()
        }
    }
}

/// Read-only access to the legacy database.
pub trait SourceRows {
    /// Largest value of `key_column`, or `0` for an empty table.
    ///
    /// # Errors
    /// Returns `ImportError::Source` when the table cannot be read.
    fn max_key(&self, table: &str, key_column: &str) -> ImportResult<i64>;

    /// # Errors
    /// Returns `ImportError::Source` when the query cannot be run.
    fn fetch(&self, query: &SourceQuery) -> ImportResult<Vec<Row>>;
}

/// Orders values the way the source database would for mixed numeric and text columns.
#[must_use]
pub fn compare_values(left: &Value, right: &Value) -> Ordering {
    match (left, right) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Text(left), Value::Text(right)) => left.cmp(right),
        (Value::Float(left), Value::Float(right)) => left.total_cmp(right),
        _ => match (left.as_i64(), right.as_i64()) {
            (Some(left), Some(right)) => left.cmp(&right),
            _ => left.to_string().cmp(&right.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_order_is_key_column() {
        let query = SourceQuery::new("legacy_user", "userid").range(0, 10).limit(5);
        assert_eq!(query.effective_order(), ["userid"]);
        assert_eq!(query.start_after, Some(0));
        assert_eq!(query.end, Some(10));
    }

    #[test]
    fn numeric_text_compares_numerically_against_ints() {
        assert_eq!(compare_values(&Value::Int(9), &Value::from("10")), Ordering::Less);
        assert_eq!(compare_values(&Value::Null, &Value::Int(0)), Ordering::Less);
        assert_eq!(compare_values(&Value::from("b"), &Value::from("a")), Ordering::Greater);
    }
}
