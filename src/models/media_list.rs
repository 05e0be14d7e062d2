use uuid::Uuid;

use crate::db::{DbError, Row, SqlValue};
use crate::store::validate::is_valid_v4;
use crate::store::ValidationError;

/// Ordered media references of a post, message or story. Order is
/// discovery order; equality is order-sensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaList(Vec<Uuid>);

impl MediaList {
    pub fn new(ids: Vec<Uuid>) -> Self {
        Self(ids)
    }

    pub fn ids(&self) -> &[Uuid] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_sql(&self) -> SqlValue {
        SqlValue::List(self.0.iter().map(Uuid::to_string).collect())
    }

    pub fn from_row(row: &Row, column: &str) -> Result<Self, DbError> {
        row.list(column)?
            .iter()
            .map(|raw| {
                Uuid::parse_str(raw)
                    .ok()
                    .filter(is_valid_v4)
                    .ok_or_else(|| DbError::Decode {
                        column: column.to_string(),
                        reason: format!("invalid media id {raw:?}"),
                    })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self.0.iter().find(|id| !is_valid_v4(id)) {
            Some(bad) => Err(ValidationError::InvalidId {
                field: "media",
                value: *bad,
            }),
            None => Ok(()),
        }
    }
}

impl From<Vec<Uuid>> for MediaList {
    fn from(ids: Vec<Uuid>) -> Self {
        Self(ids)
    }
}
