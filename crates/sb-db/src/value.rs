//! Dynamic column values.
//!
//! The mirror pipeline moves rows whose column sets are discovered at run
//! time, so cells are decoded into a small sum type and re-bound into the
//! batched `REPLACE`/`INSERT` statements on the way out.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::{Map, Value};
use sqlx::mysql::{MySql, MySqlRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};

use crate::error::DbError;

/// One decoded cell.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl SqlValue {
    /// Decode every column of a row, in ordinal order.
    pub fn decode_row(row: &MySqlRow) -> Result<Vec<SqlValue>, DbError> {
        (0..row.len()).map(|idx| SqlValue::decode(row, idx)).collect()
    }

    /// Decode a single cell by ordinal.
    pub fn decode(row: &MySqlRow, idx: usize) -> Result<SqlValue, DbError> {
        let column = &row.columns()[idx];
        let type_name = column.type_info().name().to_uppercase();

        if row.try_get_raw(idx)?.is_null() {
            return Ok(SqlValue::Null);
        }

        let value = match type_name.as_str() {
            "BOOLEAN" => SqlValue::Int(i64::from(row.try_get::<bool, _>(idx)?)),
            "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
                SqlValue::Int(row.try_get::<i64, _>(idx)?)
            }
            "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
            | "BIGINT UNSIGNED" => SqlValue::UInt(row.try_get::<u64, _>(idx)?),
            "FLOAT" => SqlValue::Float(f64::from(row.try_get::<f32, _>(idx)?)),
            "DOUBLE" => SqlValue::Float(row.try_get::<f64, _>(idx)?),
            "CHAR" | "VARCHAR" | "TEXT" | "TINYTEXT" | "MEDIUMTEXT" | "LONGTEXT" | "ENUM" => {
                SqlValue::Text(row.try_get::<String, _>(idx)?)
            }
            "DATE" => SqlValue::Text(row.try_get::<NaiveDate, _>(idx)?.to_string()),
            "TIME" => SqlValue::Text(row.try_get::<NaiveTime, _>(idx)?.to_string()),
            "DATETIME" | "TIMESTAMP" => SqlValue::Text(
                row.try_get::<NaiveDateTime, _>(idx)?
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string(),
            ),
            "BINARY" | "VARBINARY" | "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" => {
                SqlValue::Bytes(row.try_get::<Vec<u8>, _>(idx)?)
            }
            other => {
                return Err(DbError::UnsupportedColumn {
                    column: column.name().to_owned(),
                    ty: other.to_owned(),
                })
            }
        };
        Ok(value)
    }

    /// Bind this cell into a `VALUES (…)` tuple.
    pub fn push_bind(
        &self,
        values: &mut sqlx::query_builder::Separated<'_, '_, MySql, &'static str>,
    ) {
        match self {
            SqlValue::Null => values.push_bind(Option::<i64>::None),
            SqlValue::Int(n) => values.push_bind(*n),
            SqlValue::UInt(n) => values.push_bind(*n),
            SqlValue::Float(n) => values.push_bind(*n),
            SqlValue::Text(s) => values.push_bind(s.clone()),
            SqlValue::Bytes(b) => values.push_bind(b.clone()),
        };
    }

    /// Best-effort signed integer view (primary keys, CRC values).
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(n) => Some(*n),
            SqlValue::UInt(n) => i64::try_from(*n).ok(),
            _ => None,
        }
    }

    /// JSON view, feeding the transcoding layer.
    pub fn into_json(self) -> Value {
        match self {
            SqlValue::Null => Value::Null,
            SqlValue::Int(n) => Value::from(n),
            SqlValue::UInt(n) => Value::from(n),
            SqlValue::Float(n) => {
                serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
            }
            SqlValue::Text(s) => Value::String(s),
            SqlValue::Bytes(b) => Value::String(String::from_utf8_lossy(&b).into_owned()),
        }
    }
}

/// Decode a whole row into a `column name → JSON value` map.
pub fn row_to_json(row: &MySqlRow) -> Result<Map<String, Value>, DbError> {
    let mut map = Map::new();
    for idx in 0..row.len() {
        let name = row.columns()[idx].name().to_owned();
        map.insert(name, SqlValue::decode(row, idx)?.into_json());
    }
    Ok(map)
}
