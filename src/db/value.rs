//! Backend-neutral column values and rows.
//!
//! Entities describe their columns as [`SqlValue`]s; each backend converts
//! them to its own parameter type on the way in and back into a [`Row`] on
//! the way out. Ordered text lists are the one shape the two backends store
//! differently: PostgreSQL uses a native `TEXT[]`, SQLite a JSON string
//! array such as `["a","b"]`. Empty lists are written as NULL.

use tokio_postgres::types::{ToSql, Type};

use super::error::DbError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Text(String),
    List(Vec<String>),
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

/// Encode an ordered list for a SQLite text column.
pub fn encode_text_list(items: &[String]) -> String {
    let kept: Vec<&str> = items
        .iter()
        .map(String::as_str)
        .filter(|s| !s.is_empty())
        .collect();
    // Serializing a slice of &str cannot fail.
    serde_json::to_string(&kept).unwrap_or_else(|_| "[]".to_string())
}

/// Decode a SQLite text column produced by [`encode_text_list`].
pub fn decode_text_list(column: &str, raw: &str) -> Result<Vec<String>, DbError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    let items: Vec<String> = serde_json::from_str(raw)
        .map_err(|e| DbError::decode(column, format!("malformed list {raw:?}: {e}")))?;
    Ok(items.into_iter().filter(|s| !s.is_empty()).collect())
}

pub(crate) fn to_sqlite(value: &SqlValue) -> rusqlite::types::Value {
    use rusqlite::types::Value;
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Int(v) => Value::Integer(*v),
        SqlValue::Text(s) => Value::Text(s.clone()),
        SqlValue::List(l) if l.iter().all(String::is_empty) => Value::Null,
        SqlValue::List(l) => Value::Text(encode_text_list(l)),
    }
}

pub(crate) fn from_sqlite(value: rusqlite::types::Value) -> SqlValue {
    use rusqlite::types::Value;
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(v) => SqlValue::Int(v),
        Value::Real(v) => SqlValue::Int(v as i64),
        Value::Text(s) => SqlValue::Text(s),
        Value::Blob(b) => SqlValue::Text(hex::encode(b)),
    }
}

pub(crate) type PgParam = Box<dyn ToSql + Sync + Send>;

pub(crate) fn to_postgres(value: &SqlValue) -> PgParam {
    match value {
        SqlValue::Null => Box::new(None::<String>),
        SqlValue::Int(v) => Box::new(*v),
        SqlValue::Text(s) => Box::new(s.clone()),
        SqlValue::List(l) => {
            let kept: Vec<String> = l.iter().filter(|s| !s.is_empty()).cloned().collect();
            if kept.is_empty() {
                Box::new(None::<Vec<String>>)
            } else {
                Box::new(kept)
            }
        }
    }
}

pub(crate) fn from_postgres(row: &tokio_postgres::Row, idx: usize) -> Result<SqlValue, DbError> {
    let column = &row.columns()[idx];
    let ty = column.type_();
    let value = if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(idx)?.map(SqlValue::Int)
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(idx)?
            .map(|v| SqlValue::Int(i64::from(v)))
    } else if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(idx)?
            .map(|v| SqlValue::Int(i64::from(v)))
    } else if *ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(idx)?.map(SqlValue::from)
    } else if [Type::TEXT, Type::VARCHAR, Type::BPCHAR, Type::NAME].contains(ty) {
        row.try_get::<_, Option<String>>(idx)?.map(SqlValue::Text)
    } else if *ty == Type::BYTEA {
        row.try_get::<_, Option<Vec<u8>>>(idx)?
            .map(|b| SqlValue::Text(hex::encode(b)))
    } else if *ty == Type::TEXT_ARRAY || *ty == Type::VARCHAR_ARRAY {
        row.try_get::<_, Option<Vec<String>>>(idx)?
            .map(SqlValue::List)
    } else {
        return Err(DbError::decode(
            column.name(),
            format!("unsupported column type {ty}"),
        ));
    };
    Ok(value.unwrap_or(SqlValue::Null))
}

/// One result row, addressable by column name.
#[derive(Debug, Clone, Default)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<SqlValue>,
}

impl Row {
    pub fn new(columns: Vec<String>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    pub(crate) fn from_postgres(row: &tokio_postgres::Row) -> Result<Self, DbError> {
        let columns = row.columns().iter().map(|c| c.name().to_string()).collect();
        let values = (0..row.len())
            .map(|idx| from_postgres(row, idx))
            .collect::<Result<_, _>>()?;
        Ok(Self { columns, values })
    }

    pub fn get(&self, column: &str) -> Result<&SqlValue, DbError> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|idx| self.values.get(idx))
            .ok_or_else(|| DbError::decode(column, "column missing from result"))
    }

    /// Text column; NULL reads as the empty string.
    pub fn text(&self, column: &str) -> Result<String, DbError> {
        match self.get(column)? {
            SqlValue::Null => Ok(String::new()),
            SqlValue::Text(s) => Ok(s.clone()),
            SqlValue::Int(v) => Ok(v.to_string()),
            other => Err(DbError::decode(column, format!("expected text, got {other:?}"))),
        }
    }

    /// Integer column; NULL reads as zero.
    pub fn int(&self, column: &str) -> Result<i64, DbError> {
        match self.get(column)? {
            SqlValue::Null => Ok(0),
            SqlValue::Int(v) => Ok(*v),
            SqlValue::Text(s) => s
                .parse()
                .map_err(|_| DbError::decode(column, format!("expected integer, got {s:?}"))),
            other => Err(DbError::decode(column, format!("expected integer, got {other:?}"))),
        }
    }

    /// Ordered text list in either backend's representation.
    pub fn list(&self, column: &str) -> Result<Vec<String>, DbError> {
        match self.get(column)? {
            SqlValue::Null => Ok(Vec::new()),
            SqlValue::List(l) => Ok(l.iter().filter(|s| !s.is_empty()).cloned().collect()),
            SqlValue::Text(s) => decode_text_list(column, s),
            other => Err(DbError::decode(column, format!("expected list, got {other:?}"))),
        }
    }
}
