// 🧾 Row Model - Typed access to dataset rows
//
// Datasets have open-ended columns, so a row is an ordered list of
// (column, value) pairs. Reads go through accessors that fail on unknown
// columns instead of silently returning nothing.

use crate::error::{ReconcileError, Result};
use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, Value, ValueRef};
use serde::{Deserialize, Serialize};

pub type RowId = i64;

/// Separator between the parts of a composite key value
pub const KEY_SEPARATOR: &str = "|";

// ============================================================================
// CELL VALUE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Numeric view of the cell. Text accepts `1234.56`, `1234,56`,
    /// `1.234,56` and `1,234.56`. A lone comma is always the decimal
    /// separator, so `1,234` reads as 1.234.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Null => None,
            CellValue::Integer(i) => Some(*i as f64),
            CellValue::Real(f) => Some(*f),
            CellValue::Text(s) => parse_amount(s),
        }
    }

    /// Normalized text used when comparing key values
    ///
    /// NULL and blank cells have no key. Integral reals print without a
    /// fraction so `123.0` and `123` land on the same key.
    pub fn key_text(&self) -> Option<String> {
        match self {
            CellValue::Null => None,
            CellValue::Integer(i) => Some(i.to_string()),
            CellValue::Real(f) => {
                if f.fract() == 0.0 && f.abs() < 1e15 {
                    Some(format!("{}", *f as i64))
                } else {
                    Some(f.to_string())
                }
            }
            CellValue::Text(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            }
        }
    }
}

impl From<i64> for CellValue {
    fn from(v: i64) -> Self {
        CellValue::Integer(v)
    }
}

impl From<f64> for CellValue {
    fn from(v: f64) -> Self {
        CellValue::Real(v)
    }
}

impl From<&str> for CellValue {
    fn from(v: &str) -> Self {
        CellValue::Text(v.to_string())
    }
}

impl From<String> for CellValue {
    fn from(v: String) -> Self {
        CellValue::Text(v)
    }
}

impl FromSql for CellValue {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(match value {
            ValueRef::Null => CellValue::Null,
            ValueRef::Integer(i) => CellValue::Integer(i),
            ValueRef::Real(f) => CellValue::Real(f),
            ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
                CellValue::Text(String::from_utf8_lossy(bytes).into_owned())
            }
        })
    }
}

impl ToSql for CellValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            CellValue::Null => ToSqlOutput::Owned(Value::Null),
            CellValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            CellValue::Real(f) => ToSqlOutput::Owned(Value::Real(*f)),
            CellValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

/// Parse an amount written with `.` or `,` as decimal separator
pub fn parse_amount(raw: &str) -> Option<f64> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    let last_dot = s.rfind('.');
    let last_comma = s.rfind(',');

    let normalized = match (last_dot, last_comma) {
        // 1.234,56
        (Some(dot), Some(comma)) if comma > dot => s.replace('.', "").replace(',', "."),
        // 1,234.56
        (Some(_), Some(_)) => s.replace(',', ""),
        // 1234,56
        (None, Some(_)) => s.replace(',', "."),
        _ => s.to_string(),
    };

    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

// ============================================================================
// ROW
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub id: RowId,
    pub values: Vec<(String, CellValue)>,
}

impl Row {
    pub fn new(id: RowId) -> Self {
        Row { id, values: Vec::new() }
    }

    /// Builder used by fixtures and seeding code
    pub fn with(mut self, column: &str, value: impl Into<CellValue>) -> Self {
        self.values.push((column.to_string(), value.into()));
        self
    }

    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.values
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    /// Like `get`, but an unknown column is an error
    pub fn value(&self, column: &str) -> Result<&CellValue> {
        self.get(column).ok_or_else(|| ReconcileError::UnknownColumn {
            table: format!("row {}", self.id),
            column: column.to_string(),
        })
    }

    /// Numeric value of a column; NULL and unparsable text count as 0
    pub fn number(&self, column: &str) -> Result<f64> {
        Ok(self.value(column)?.as_f64().unwrap_or(0.0))
    }

    fn key_parts(&self, columns: &[String]) -> Result<Option<Vec<String>>> {
        let mut parts = Vec::with_capacity(columns.len());
        for column in columns {
            match self.value(column)?.key_text() {
                Some(part) => parts.push(part),
                None => return Ok(None),
            }
        }

        if parts.is_empty() {
            return Ok(None);
        }

        Ok(Some(parts))
    }

    /// Readable composite key over `columns` (`a|b`), or None when any part
    /// is blank. Parts may themselves contain the separator, so this form is
    /// for display only.
    pub fn composite_key(&self, columns: &[String]) -> Result<Option<String>> {
        Ok(self.key_parts(columns)?.map(|parts| parts.join(KEY_SEPARATOR)))
    }

    /// Join key over `columns`: the parts encoded as a JSON array, so two
    /// rows share it only when every part is equal
    pub fn join_key(&self, columns: &[String]) -> Result<Option<String>> {
        match self.key_parts(columns)? {
            Some(parts) => Ok(Some(serde_json::to_string(&parts)?)),
            None => Ok(None),
        }
    }

    /// JSON object of the projected columns, in projection order
    pub fn snapshot(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert("id".to_string(), serde_json::json!(self.id));
        for (column, value) in &self.values {
            map.insert(
                column.clone(),
                serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
            );
        }
        serde_json::Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_amount_formats() {
        assert_eq!(parse_amount("100"), Some(100.0));
        assert_eq!(parse_amount(" 1234.56 "), Some(1234.56));
        assert_eq!(parse_amount("1234,56"), Some(1234.56));
        assert_eq!(parse_amount("1.234,56"), Some(1234.56));
        assert_eq!(parse_amount("1,234.56"), Some(1234.56));
        assert_eq!(parse_amount("-50,5"), Some(-50.5));
        assert_eq!(parse_amount(""), None);
        assert_eq!(parse_amount("abc"), None);
    }

    #[test]
    fn test_key_text_normalization() {
        assert_eq!(CellValue::Integer(123).key_text(), Some("123".to_string()));
        assert_eq!(CellValue::Real(123.0).key_text(), Some("123".to_string()));
        assert_eq!(CellValue::Real(1.5).key_text(), Some("1.5".to_string()));
        assert_eq!(CellValue::Text("  NF-1 ".into()).key_text(), Some("NF-1".to_string()));
        assert_eq!(CellValue::Text("   ".into()).key_text(), None);
        assert_eq!(CellValue::Null.key_text(), None);
    }

    #[test]
    fn test_row_accessors() {
        let row = Row::new(7)
            .with("nf", "123")
            .with("serie", 1i64)
            .with("valor", "99,90")
            .with("obs", CellValue::Null);

        assert_eq!(row.number("valor").unwrap(), 99.9);
        assert_eq!(row.number("obs").unwrap(), 0.0);
        assert!(matches!(
            row.number("valr"),
            Err(ReconcileError::UnknownColumn { .. })
        ));

        let key = row
            .composite_key(&["nf".to_string(), "serie".to_string()])
            .unwrap();
        assert_eq!(key, Some("123|1".to_string()));

        let blank = row
            .composite_key(&["nf".to_string(), "obs".to_string()])
            .unwrap();
        assert_eq!(blank, None);
    }

    #[test]
    fn test_join_key_keeps_parts_apart() {
        let a = Row::new(1).with("c1", "N1|2").with("c2", "X");
        let b = Row::new(2).with("d1", "N1").with("d2", "2|X");
        let cols_a = vec!["c1".to_string(), "c2".to_string()];
        let cols_b = vec!["d1".to_string(), "d2".to_string()];

        // same readable key, different join keys
        assert_eq!(a.composite_key(&cols_a).unwrap(), b.composite_key(&cols_b).unwrap());
        assert_ne!(a.join_key(&cols_a).unwrap(), b.join_key(&cols_b).unwrap());
        assert_eq!(a.join_key(&cols_a).unwrap(), Some(r#"["N1|2","X"]"#.to_string()));

        let blank = Row::new(3).with("c1", "N1").with("c2", "  ");
        assert_eq!(blank.join_key(&cols_a).unwrap(), None);
    }

    #[test]
    fn test_lone_comma_is_decimal_separator() {
        assert_eq!(parse_amount("1,234"), Some(1.234));
        assert_eq!(parse_amount("1,234.56"), Some(1234.56));
    }

    #[test]
    fn test_snapshot_keeps_column_order() {
        let row = Row::new(1).with("b", 2i64).with("a", "x");
        let json = serde_json::to_string(&row.snapshot()).unwrap();
        assert_eq!(json, r#"{"id":1,"b":2,"a":"x"}"#);
    }
}
