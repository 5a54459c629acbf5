//! Row and cell representation shared by the decoder, the pipeline stages and the store.

use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};
use serde::Serialize;
use std::sync::Arc;

/// A single raw scalar read from a source file or returned by the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RawValue {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
}

impl RawValue {
    /// Null, or text that is empty after trimming
    pub fn is_blank(&self) -> bool {
        match self {
            RawValue::Null => true,
            RawValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Numeric view of the value; text is parsed when it holds a plain number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RawValue::Integer(i) => Some(*i as f64),
            RawValue::Float(f) => Some(*f),
            RawValue::Text(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
            RawValue::Null => None,
        }
    }

    /// String form used when building composite identity keys.
    ///
    /// Integral floats render without a fractional part so a spreadsheet `1.0`
    /// and a stored integer `1` produce the same key fragment.
    pub fn key_fragment(&self) -> String {
        match self {
            RawValue::Null => String::new(),
            RawValue::Integer(i) => i.to_string(),
            RawValue::Float(f) => {
                if f.fract() == 0.0 && f.abs() < 9.0e15 {
                    format!("{}", *f as i64)
                } else {
                    f.to_string()
                }
            }
            RawValue::Text(s) => s.clone(),
        }
    }

    pub fn from_value_ref(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => RawValue::Null,
            ValueRef::Integer(i) => RawValue::Integer(i),
            ValueRef::Real(f) => RawValue::Float(f),
            ValueRef::Text(t) => RawValue::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => RawValue::Text(String::from_utf8_lossy(b).into_owned()),
        }
    }
}

impl From<&str> for RawValue {
    fn from(s: &str) -> Self {
        RawValue::Text(s.to_string())
    }
}

impl From<String> for RawValue {
    fn from(s: String) -> Self {
        RawValue::Text(s)
    }
}

impl ToSql for RawValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            RawValue::Null => ToSqlOutput::Owned(Value::Null),
            RawValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            RawValue::Float(f) => {
                if f.fract() == 0.0 && f.abs() < 9.0e15 {
                    ToSqlOutput::Owned(Value::Integer(*f as i64))
                } else {
                    ToSqlOutput::Owned(Value::Real(*f))
                }
            }
            RawValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

/// One decoded row: values in header order, headers shared across the whole file.
#[derive(Debug, Clone, PartialEq)]
pub struct RowRecord {
    headers: Arc<[String]>,
    values: Vec<RawValue>,
}

impl RowRecord {
    /// Build a row; missing trailing values are padded with null, extras dropped.
    pub fn new(headers: Arc<[String]>, mut values: Vec<RawValue>) -> Self {
        values.resize(headers.len(), RawValue::Null);
        Self { headers, values }
    }

    pub fn headers(&self) -> &Arc<[String]> {
        &self.headers
    }

    pub fn values(&self) -> &[RawValue] {
        &self.values
    }

    pub fn into_values(self) -> Vec<RawValue> {
        self.values
    }

    pub fn get(&self, column: &str) -> Option<&RawValue> {
        self.headers
            .iter()
            .position(|h| h == column)
            .map(|idx| &self.values[idx])
    }

    pub fn value_at(&self, idx: usize) -> Option<&RawValue> {
        self.values.get(idx)
    }

    pub fn is_blank(&self) -> bool {
        self.values.iter().all(RawValue::is_blank)
    }
}
