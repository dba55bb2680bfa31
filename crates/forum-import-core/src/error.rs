#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ImportError {
    #[error("validation error for column `{column}`: {reason}")]
    Validation { column: String, reason: String },
    #[error("unresolved reference: {entity_type} with legacy id {legacy_id} has not been imported")]
    UnresolvedReference { entity_type: String, legacy_id: i64 },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("source error: {0}")]
    Source(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ImportError {
    #[must_use]
    pub fn validation(column: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation { column: column.into(), reason: reason.into() }
    }

    #[must_use]
    pub fn unresolved(entity_type: impl Into<String>, legacy_id: i64) -> Self {
        Self::UnresolvedReference { entity_type: entity_type.into(), legacy_id }
    }

    /// Errors a per-record loop recovers from by skipping the row.
    ///
    /// Storage, source and configuration errors abort the step invocation instead.
    #[must_use]
    pub fn is_record_level(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::UnresolvedReference { .. })
    }
}

pub type ImportResult<T> = Result<T, ImportError>;
