// 📤 Result Sink - Per-job result tables
//
// Each job writes into its own table `result_job_<job_id>`: a fixed base
// schema plus one nullable TEXT column per key identifier. Rows are appended
// in batches; every batch is a single transaction.

use crate::db::{quote_ident, table_schema};
use crate::error::{ReconcileError, Result};
use crate::row::RowId;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Base columns of every result table (lowercase). Key identifiers may not
/// reuse them.
pub const RESERVED_COLUMNS: &[&str] = &[
    "id",
    "job_id",
    "key_label",
    "status",
    "group_label",
    "a_row_id",
    "b_row_id",
    "a_values",
    "b_values",
    "value_a",
    "value_b",
    "difference",
    "created_at",
];

/// Columns written for every row, in insert order
const INSERT_COLUMNS: &[&str] = &[
    "job_id",
    "key_label",
    "status",
    "group_label",
    "a_row_id",
    "b_row_id",
    "a_values",
    "b_values",
    "value_a",
    "value_b",
    "difference",
    "created_at",
];

pub fn result_table_name(job_id: i64) -> String {
    format!("result_job_{}", job_id)
}

// ============================================================================
// RESULT ROW
// ============================================================================

/// One output row; exactly one of `a_row_id` / `b_row_id` is set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub key_label: Option<String>,
    pub status: String,
    pub group: String,

    pub a_row_id: Option<RowId>,
    pub b_row_id: Option<RowId>,
    pub a_values: Option<serde_json::Value>,
    pub b_values: Option<serde_json::Value>,

    pub value_a: f64,
    pub value_b: f64,
    pub difference: f64,

    /// Composite key value per identifier, aligned with the sink's identifiers
    pub key_values: Vec<Option<String>>,

    pub created_at: DateTime<Utc>,
}

/// A result row read back from the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResult {
    pub id: i64,
    pub job_id: i64,
    pub key_label: Option<String>,
    pub status: String,
    pub group: Option<String>,
    pub a_row_id: Option<RowId>,
    pub b_row_id: Option<RowId>,
    pub a_values: Option<serde_json::Value>,
    pub b_values: Option<serde_json::Value>,
    pub value_a: f64,
    pub value_b: f64,
    pub difference: f64,
    pub key_values: Vec<(String, Option<String>)>,
    pub created_at: String,
}

impl StoredResult {
    pub fn key_value(&self, identifier: &str) -> Option<&str> {
        self.key_values
            .iter()
            .find(|(name, _)| name == identifier)
            .and_then(|(_, value)| value.as_deref())
    }
}

// ============================================================================
// SINK
// ============================================================================

pub struct ResultSink {
    job_id: i64,
    table: String,
    identifiers: Vec<String>,
    insert_sql: String,
    batch_size: usize,
    buffer: Vec<ResultRow>,
    written: usize,
}

impl ResultSink {
    /// Create (or extend) the job's result table and prepare for writes
    pub fn open(conn: &Connection, job_id: i64, identifiers: &[String], batch_size: usize) -> Result<Self> {
        let table = result_table_name(job_id);
        ensure_result_table(conn, &table, identifiers)?;

        let mut columns: Vec<String> = INSERT_COLUMNS.iter().map(|c| quote_ident(c)).collect();
        columns.extend(identifiers.iter().map(|c| quote_ident(c)));
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();

        let insert_sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(&table),
            columns.join(", "),
            placeholders.join(", ")
        );

        debug!(job_id, table = %table, keys = identifiers.len(), "result sink opened");

        Ok(ResultSink {
            job_id,
            table,
            identifiers: identifiers.to_vec(),
            insert_sql,
            batch_size: batch_size.max(1),
            buffer: Vec::new(),
            written: 0,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Rows committed so far
    pub fn written(&self) -> usize {
        self.written
    }

    pub fn push(&mut self, conn: &mut Connection, row: ResultRow) -> Result<()> {
        self.buffer.push(row);
        if self.buffer.len() >= self.batch_size {
            self.flush(conn)?;
        }
        Ok(())
    }

    /// Commit buffered rows. A failing batch is rolled back as a whole.
    pub fn flush(&mut self, conn: &mut Connection) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let batch = std::mem::take(&mut self.buffer);
        match self.write_batch(conn, &batch) {
            Ok(()) => {
                self.written += batch.len();
                Ok(())
            }
            Err(e) => {
                warn!(job_id = self.job_id, rows = batch.len(), error = %e, "result batch rolled back");
                Err(ReconcileError::Transaction(format!(
                    "batch of {} rows for job {} rolled back: {}",
                    batch.len(),
                    self.job_id,
                    e
                )))
            }
        }
    }

    /// Flush the tail and return the total rows written
    pub fn finish(mut self, conn: &mut Connection) -> Result<usize> {
        self.flush(conn)?;
        Ok(self.written)
    }

    fn write_batch(&self, conn: &mut Connection, rows: &[ResultRow]) -> Result<()> {
        // Dropping the transaction without commit rolls it back
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(&self.insert_sql)?;
            for row in rows {
                let values = self.bind_values(row)?;
                stmt.execute(params_from_iter(values.iter()))?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn bind_values(&self, row: &ResultRow) -> Result<Vec<Value>> {
        let mut values = vec![
            Value::Integer(self.job_id),
            text_or_null(row.key_label.as_deref()),
            Value::Text(row.status.clone()),
            Value::Text(row.group.clone()),
            row.a_row_id.map(Value::Integer).unwrap_or(Value::Null),
            row.b_row_id.map(Value::Integer).unwrap_or(Value::Null),
            json_or_null(row.a_values.as_ref())?,
            json_or_null(row.b_values.as_ref())?,
            Value::Real(row.value_a),
            Value::Real(row.value_b),
            Value::Real(row.difference),
            Value::Text(row.created_at.to_rfc3339()),
        ];

        for i in 0..self.identifiers.len() {
            let key = row.key_values.get(i).and_then(|v| v.as_deref());
            values.push(text_or_null(key));
        }

        Ok(values)
    }
}

fn text_or_null(value: Option<&str>) -> Value {
    value
        .map(|v| Value::Text(v.to_string()))
        .unwrap_or(Value::Null)
}

fn json_or_null(value: Option<&serde_json::Value>) -> Result<Value> {
    Ok(match value {
        Some(v) => Value::Text(serde_json::to_string(v)?),
        None => Value::Null,
    })
}

/// Create the result table if needed and add any missing key columns
fn ensure_result_table(conn: &Connection, table: &str, identifiers: &[String]) -> Result<()> {
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id INTEGER NOT NULL,
                key_label TEXT,
                status TEXT NOT NULL,
                group_label TEXT,
                a_row_id INTEGER,
                b_row_id INTEGER,
                a_values TEXT,
                b_values TEXT,
                value_a REAL NOT NULL DEFAULT 0,
                value_b REAL NOT NULL DEFAULT 0,
                difference REAL NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )",
            quote_ident(table)
        ),
        [],
    )?;

    let schema = table_schema(conn, table)?;
    for identifier in identifiers {
        let exists = schema
            .columns
            .iter()
            .any(|c| c.eq_ignore_ascii_case(identifier));
        if !exists {
            conn.execute(
                &format!(
                    "ALTER TABLE {} ADD COLUMN {} TEXT",
                    quote_ident(table),
                    quote_ident(identifier)
                ),
                [],
            )?;
            debug!(table, column = %identifier, "key column added");
        }
    }

    Ok(())
}

// ============================================================================
// READ BACK / LIFECYCLE
// ============================================================================

/// Drop a job's result table so a rerun starts from scratch
pub fn reset_result_table(conn: &Connection, job_id: i64) -> Result<()> {
    conn.execute(
        &format!("DROP TABLE IF EXISTS {}", quote_ident(&result_table_name(job_id))),
        [],
    )?;
    Ok(())
}

/// All stored rows of a job, in insert order
pub fn load_results(conn: &Connection, job_id: i64) -> Result<Vec<StoredResult>> {
    let table = result_table_name(job_id);
    let schema = table_schema(conn, &table)?;

    let key_columns: Vec<String> = schema
        .columns
        .iter()
        .filter(|c| !RESERVED_COLUMNS.contains(&c.to_lowercase().as_str()))
        .cloned()
        .collect();

    let mut select: Vec<String> = std::iter::once("id")
        .chain(INSERT_COLUMNS.iter().copied())
        .map(quote_ident)
        .collect();
    select.extend(key_columns.iter().map(|c| quote_ident(c)));

    let sql = format!(
        "SELECT {} FROM {} ORDER BY id",
        select.join(", "),
        quote_ident(&table)
    );

    let mut stmt = conn.prepare(&sql)?;
    let raw = stmt
        .query_map([], |row| {
            let mut keys = Vec::with_capacity(key_columns.len());
            for (i, column) in key_columns.iter().enumerate() {
                keys.push((column.clone(), row.get::<_, Option<String>>(13 + i)?));
            }

            Ok((
                StoredResult {
                    id: row.get(0)?,
                    job_id: row.get(1)?,
                    key_label: row.get(2)?,
                    status: row.get(3)?,
                    group: row.get(4)?,
                    a_row_id: row.get(5)?,
                    b_row_id: row.get(6)?,
                    a_values: None,
                    b_values: None,
                    value_a: row.get(9)?,
                    value_b: row.get(10)?,
                    difference: row.get(11)?,
                    key_values: keys,
                    created_at: row.get(12)?,
                },
                row.get::<_, Option<String>>(7)?,
                row.get::<_, Option<String>>(8)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut results = Vec::with_capacity(raw.len());
    for (mut stored, a_values, b_values) in raw {
        stored.a_values = a_values.map(|s| serde_json::from_str(&s)).transpose()?;
        stored.b_values = b_values.map(|s| serde_json::from_str(&s)).transpose()?;
        results.push(stored);
    }

    Ok(results)
}

/// Row count per status for a job
pub fn result_status_counts(conn: &Connection, job_id: i64) -> Result<BTreeMap<String, i64>> {
    let sql = format!(
        "SELECT status, COUNT(*) FROM {} GROUP BY status ORDER BY status",
        quote_ident(&result_table_name(job_id))
    );

    let mut stmt = conn.prepare(&sql)?;
    let counts = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<std::result::Result<BTreeMap<_, _>, _>>()?;

    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{LABEL_NOT_FOUND, LABEL_RECONCILED, STATUS_NOT_FOUND, STATUS_RECONCILED};

    fn sample(a_row: i64, status: &str) -> ResultRow {
        ResultRow {
            key_label: Some("NF".to_string()),
            status: status.to_string(),
            group: LABEL_RECONCILED.to_string(),
            a_row_id: Some(a_row),
            b_row_id: None,
            a_values: Some(serde_json::json!({"id": a_row, "valor": 100.0})),
            b_values: None,
            value_a: 100.0,
            value_b: 100.0,
            difference: 0.0,
            key_values: vec![Some(format!("NF{}", a_row))],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_sink_writes_in_batches() {
        let mut conn = Connection::open_in_memory().unwrap();
        let identifiers = vec!["NF".to_string()];

        let mut sink = ResultSink::open(&conn, 7, &identifiers, 2).unwrap();
        for i in 1..=5i64 {
            sink.push(&mut conn, sample(i, STATUS_RECONCILED)).unwrap();
        }
        // two full batches committed, one row still buffered
        assert_eq!(sink.written(), 4);
        assert_eq!(sink.finish(&mut conn).unwrap(), 5);

        let stored = load_results(&conn, 7).unwrap();
        assert_eq!(stored.len(), 5);
        assert_eq!(stored[0].job_id, 7);
        assert_eq!(stored[0].key_value("NF"), Some("NF1"));
        assert_eq!(stored[0].a_values.as_ref().unwrap()["valor"], 100.0);
        assert!(stored[0].b_values.is_none());

        println!("✅ Batched sink test PASSED");
    }

    #[test]
    fn test_key_columns_added_idempotently() {
        let conn = Connection::open_in_memory().unwrap();

        ResultSink::open(&conn, 1, &["NF".to_string()], 10).unwrap();
        ResultSink::open(&conn, 1, &["NF".to_string(), "DOC".to_string()], 10).unwrap();
        ResultSink::open(&conn, 1, &["nf".to_string()], 10).unwrap();

        let schema = table_schema(&conn, &result_table_name(1)).unwrap();
        let keys: Vec<&String> = schema
            .columns
            .iter()
            .filter(|c| !RESERVED_COLUMNS.contains(&c.to_lowercase().as_str()))
            .collect();
        assert_eq!(keys, vec!["NF", "DOC"]);
    }

    #[test]
    fn test_failed_batch_rolls_back() {
        let mut conn = Connection::open_in_memory().unwrap();
        let identifiers = vec!["NF".to_string()];
        let mut sink = ResultSink::open(&conn, 3, &identifiers, 2).unwrap();

        conn.execute_batch(
            "CREATE TRIGGER reject_boom BEFORE INSERT ON result_job_3
             WHEN NEW.status = 'boom'
             BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
        )
        .unwrap();

        sink.push(&mut conn, sample(1, STATUS_RECONCILED)).unwrap();
        sink.push(&mut conn, sample(2, STATUS_RECONCILED)).unwrap();
        sink.push(&mut conn, sample(3, STATUS_RECONCILED)).unwrap();

        let err = sink.push(&mut conn, sample(4, "boom")).unwrap_err();
        assert!(matches!(err, ReconcileError::Transaction(_)));

        // first batch stays, the failed batch (rows 3 and 4) is gone
        let stored = load_results(&conn, 3).unwrap();
        assert_eq!(
            stored.iter().map(|r| r.a_row_id.unwrap()).collect::<Vec<_>>(),
            vec![1, 2]
        );

        println!("✅ Batch rollback test PASSED");
    }

    #[test]
    fn test_status_counts_and_reset() {
        let mut conn = Connection::open_in_memory().unwrap();
        let mut sink = ResultSink::open(&conn, 9, &[], 100).unwrap();

        sink.push(&mut conn, sample(1, STATUS_RECONCILED)).unwrap();
        let mut missing = sample(2, STATUS_NOT_FOUND);
        missing.group = LABEL_NOT_FOUND.to_string();
        sink.push(&mut conn, missing).unwrap();
        sink.push(&mut conn, sample(3, STATUS_NOT_FOUND)).unwrap();
        sink.finish(&mut conn).unwrap();

        let counts = result_status_counts(&conn, 9).unwrap();
        assert_eq!(counts.get(STATUS_RECONCILED), Some(&1));
        assert_eq!(counts.get(STATUS_NOT_FOUND), Some(&2));

        // no identifiers: key values are ignored
        assert!(load_results(&conn, 9).unwrap()[0].key_values.is_empty());

        reset_result_table(&conn, 9).unwrap();
        assert!(load_results(&conn, 9).is_err());
    }
}
