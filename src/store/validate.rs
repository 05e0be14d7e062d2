//! Field checks applied before any entity is written.

use thiserror::Error;
use uuid::Uuid;

use crate::types::Source;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} is not a version 4 UUID: {value}")]
    InvalidId { field: &'static str, value: Uuid },

    #[error("Invalid source value {0}")]
    InvalidSource(i64),

    #[error("source_id is empty")]
    EmptySourceId,

    #[error("username is empty")]
    EmptyUsername,

    #[error("{field} must be positive, got {value}")]
    InvalidTimestamp { field: &'static str, value: i64 },
}

pub fn is_valid_v4(id: &Uuid) -> bool {
    !id.is_nil() && id.get_version_num() == 4
}

pub fn check_id(field: &'static str, id: &Uuid) -> Result<(), ValidationError> {
    if is_valid_v4(id) {
        Ok(())
    } else {
        Err(ValidationError::InvalidId { field, value: *id })
    }
}

/// Checks shared by every entity keyed by `(source, source_id)`.
pub fn check_source_key(id: &Uuid, source: Source, source_id: &str) -> Result<(), ValidationError> {
    check_id("id", id)?;
    if !source.is_valid() {
        return Err(ValidationError::InvalidSource(source.bits()));
    }
    if source_id.is_empty() {
        return Err(ValidationError::EmptySourceId);
    }
    Ok(())
}

pub fn check_positive(field: &'static str, value: i64) -> Result<(), ValidationError> {
    if value > 0 {
        Ok(())
    } else {
        Err(ValidationError::InvalidTimestamp { field, value })
    }
}
