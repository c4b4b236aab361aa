// 🗄️ Database - Catalogue tables, dataset registry and row reads
//
// Datasets ("bases") are plain SQLite tables whose `id INTEGER PRIMARY KEY`
// is the row id. Everything the engine needs to find them (base registry,
// step configurations, key definitions, marks) lives in catalogue tables
// created by `setup_database`.

use crate::config::EngineConfig;
use crate::error::{ReconcileError, Result};
use crate::row::{CellValue, Row, RowId};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Row id column every dataset table carries
pub const ROW_ID_COLUMN: &str = "id";

/// SQLite caps bound parameters per statement; id lists are chunked below it
const ID_CHUNK: usize = 500;

// ============================================================================
// BASE REGISTRY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BaseSide {
    /// Accounting ledger (Base A)
    Contabil,
    /// Tax ledger (Base B)
    Fiscal,
}

impl BaseSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            BaseSide::Contabil => "CONTABIL",
            BaseSide::Fiscal => "FISCAL",
        }
    }

    pub fn parse(value: &str) -> Option<BaseSide> {
        match value.trim().to_uppercase().as_str() {
            "CONTABIL" => Some(BaseSide::Contabil),
            "FISCAL" => Some(BaseSide::Fiscal),
            _ => None,
        }
    }
}

impl std::fmt::Display for BaseSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A registered dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Base {
    pub id: i64,
    pub name: String,
    pub side: BaseSide,
    pub subtype: Option<String>,
    pub table_name: String,
}

// ============================================================================
// CONNECTION + SCHEMA
// ============================================================================

/// Open a file database with the configured busy timeout and journal mode
pub fn open_database(path: &Path, config: &EngineConfig) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
    conn.pragma_update(None, "journal_mode", config.journal_mode.as_str())?;
    debug!(
        path = %path.display(),
        journal_mode = %config.journal_mode,
        busy_timeout_ms = config.busy_timeout_ms,
        "database opened"
    );
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // ==========================================================================
    // Dataset registry
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS bases (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            side TEXT NOT NULL CHECK (side IN ('CONTABIL', 'FISCAL')),
            subtype TEXT,
            table_name TEXT NOT NULL UNIQUE,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Row marks (one per base/row/group)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS base_marks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            base_id INTEGER NOT NULL,
            row_id INTEGER NOT NULL,
            status TEXT NOT NULL,
            mark_group TEXT NOT NULL,
            mark_key TEXT,
            created_at TEXT NOT NULL,
            UNIQUE (base_id, row_id, mark_group)
        )",
        [],
    )?;

    // ==========================================================================
    // Key definitions, pairs and their links to reconciliations
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS key_definitions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            side TEXT NOT NULL CHECK (side IN ('CONTABIL', 'FISCAL')),
            subtype TEXT,
            columns TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS key_pairs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            key_a_id INTEGER NOT NULL,
            key_b_id INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS reconciliation_keys (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            config_id INTEGER NOT NULL,
            position INTEGER NOT NULL DEFAULT 0,
            identifier TEXT,
            pair_id INTEGER,
            key_a_id INTEGER,
            key_b_id INTEGER
        )",
        [],
    )?;

    // ==========================================================================
    // Step configurations
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS reconciliation_configs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            base_a_id INTEGER NOT NULL,
            base_b_id INTEGER NOT NULL,
            value_column_a TEXT NOT NULL,
            value_column_b TEXT NOT NULL,
            invert_sign_b INTEGER NOT NULL DEFAULT 0,
            materiality_tolerance REAL DEFAULT 0,
            keys_a TEXT,
            keys_b TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS reversal_configs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            base_id INTEGER NOT NULL,
            column_a TEXT NOT NULL,
            column_b TEXT NOT NULL,
            column_sum TEXT NOT NULL,
            zero_tolerance REAL DEFAULT 0
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_base_row ON base_marks(base_id, row_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_reconciliation_keys_config
         ON reconciliation_keys(config_id, position)",
        [],
    )?;

    Ok(())
}

/// Double-quote an identifier taken from configuration
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn register_base(
    conn: &Connection,
    name: &str,
    side: BaseSide,
    subtype: Option<&str>,
    table_name: &str,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO bases (name, side, subtype, table_name) VALUES (?1, ?2, ?3, ?4)",
        params![name, side.as_str(), subtype, table_name],
    )?;

    Ok(conn.last_insert_rowid())
}

pub fn get_base(conn: &Connection, base_id: i64) -> Result<Base> {
    let base = conn
        .query_row(
            "SELECT id, name, side, subtype, table_name FROM bases WHERE id = ?1",
            params![base_id],
            |row| {
                let side: String = row.get(2)?;
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    side,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?;

    let (id, name, side, subtype, table_name) =
        base.ok_or_else(|| ReconcileError::Configuration(format!("base {} not found", base_id)))?;

    let side = BaseSide::parse(&side).ok_or_else(|| {
        ReconcileError::Configuration(format!("base {} has unknown side '{}'", base_id, side))
    })?;

    Ok(Base {
        id,
        name,
        side,
        subtype: subtype.filter(|s| !s.trim().is_empty()),
        table_name,
    })
}

// ============================================================================
// TABLE SCHEMA
// ============================================================================

/// Column list of a dataset table
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub table: String,
    pub columns: Vec<String>,
}

impl TableSchema {
    pub fn has(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    pub fn require(&self, column: &str) -> Result<()> {
        if self.has(column) {
            Ok(())
        } else {
            Err(ReconcileError::UnknownColumn {
                table: self.table.clone(),
                column: column.to_string(),
            })
        }
    }

    pub fn require_all<'a>(&self, columns: impl IntoIterator<Item = &'a String>) -> Result<()> {
        for column in columns {
            self.require(column)?;
        }
        Ok(())
    }
}

/// Read a table's columns; a missing table is a configuration error
pub fn table_schema(conn: &Connection, table: &str) -> Result<TableSchema> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;

    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    if columns.is_empty() {
        return Err(ReconcileError::Configuration(format!("table '{}' not found", table)));
    }

    Ok(TableSchema {
        table: table.to_string(),
        columns,
    })
}

// ============================================================================
// DATASET TABLES
// ============================================================================

/// Create a dataset table with untyped columns (values keep their own type)
pub fn create_dataset_table(conn: &Connection, table: &str, columns: &[&str]) -> Result<()> {
    let mut defs = vec![format!("{} INTEGER PRIMARY KEY", quote_ident(ROW_ID_COLUMN))];
    defs.extend(columns.iter().map(|c| quote_ident(c)));

    conn.execute(
        &format!("CREATE TABLE IF NOT EXISTS {} ({})", quote_ident(table), defs.join(", ")),
        [],
    )?;

    Ok(())
}

/// Insert rows into a dataset table inside one transaction
pub fn insert_dataset_rows(conn: &mut Connection, table: &str, rows: &[Row]) -> Result<usize> {
    let tx = conn.transaction()?;

    for row in rows {
        let mut columns = vec![quote_ident(ROW_ID_COLUMN)];
        columns.extend(row.values.iter().map(|(name, _)| quote_ident(name)));
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();

        let mut values: Vec<CellValue> = vec![CellValue::Integer(row.id)];
        values.extend(row.values.iter().map(|(_, value)| value.clone()));

        let mut stmt = tx.prepare_cached(&format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table),
            columns.join(", "),
            placeholders.join(", ")
        ))?;
        stmt.execute(params_from_iter(values.iter()))?;
    }

    tx.commit()?;
    Ok(rows.len())
}

pub fn count_rows(conn: &Connection, table: &str) -> Result<i64> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
        [],
        |row| row.get(0),
    )?;

    Ok(count)
}

/// `"id", "col1", "col2"` optionally prefixed with a table alias
pub(crate) fn select_list(alias: Option<&str>, columns: &[String]) -> String {
    let prefix = alias.map(|a| format!("{}.", a)).unwrap_or_default();
    std::iter::once(ROW_ID_COLUMN.to_string())
        .chain(columns.iter().cloned())
        .map(|c| format!("{}{}", prefix, quote_ident(&c)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Read `id` + `columns` starting at `offset` of a result row
pub(crate) fn read_row(
    row: &rusqlite::Row<'_>,
    offset: usize,
    columns: &[String],
) -> rusqlite::Result<Row> {
    let mut out = Row::new(row.get(offset)?);
    for (i, column) in columns.iter().enumerate() {
        out.values.push((column.clone(), row.get::<_, CellValue>(offset + 1 + i)?));
    }
    Ok(out)
}

/// Fetch the projected columns of specific rows, ordered by id
pub fn fetch_rows(
    conn: &Connection,
    table: &str,
    columns: &[String],
    ids: &[RowId],
) -> Result<Vec<Row>> {
    let mut rows = Vec::with_capacity(ids.len());

    for chunk in ids.chunks(ID_CHUNK) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM {} WHERE {} IN ({}) ORDER BY {}",
            select_list(None, columns),
            quote_ident(table),
            quote_ident(ROW_ID_COLUMN),
            placeholders,
            quote_ident(ROW_ID_COLUMN)
        );

        let mut stmt = conn.prepare_cached(&sql)?;
        let page = stmt
            .query_map(params_from_iter(chunk.iter()), |row| read_row(row, 0, columns))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.extend(page);
    }

    rows.sort_by_key(|r| r.id);
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        setup_database(&conn).unwrap();

        let schema = table_schema(&conn, "base_marks").unwrap();
        assert!(schema.has("mark_group"));
        assert!(schema.has("mark_key"));

        println!("✅ Setup idempotency test PASSED");
    }

    #[test]
    fn test_register_and_get_base() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let id = register_base(&conn, "Razao 2024", BaseSide::Contabil, Some("ICMS"), "base_1").unwrap();
        let base = get_base(&conn, id).unwrap();

        assert_eq!(base.side, BaseSide::Contabil);
        assert_eq!(base.subtype.as_deref(), Some("ICMS"));
        assert_eq!(base.table_name, "base_1");

        let missing = get_base(&conn, 99).unwrap_err();
        assert!(matches!(missing, ReconcileError::Configuration(_)));
    }

    #[test]
    fn test_table_schema_and_missing_table() {
        let conn = Connection::open_in_memory().unwrap();
        create_dataset_table(&conn, "base_1", &["nf", "valor"]).unwrap();

        let schema = table_schema(&conn, "base_1").unwrap();
        assert_eq!(schema.columns, vec!["id", "nf", "valor"]);
        assert!(schema.require("valor").is_ok());
        assert!(matches!(
            schema.require("valr"),
            Err(ReconcileError::UnknownColumn { .. })
        ));

        assert!(table_schema(&conn, "nope").unwrap_err().is_recoverable());
    }

    #[test]
    fn test_fetch_rows_across_chunks() {
        let mut conn = Connection::open_in_memory().unwrap();
        create_dataset_table(&conn, "base_1", &["nf", "valor"]).unwrap();

        let rows: Vec<Row> = (1..=1200i64)
            .map(|i| Row::new(i).with("nf", format!("NF{}", i)).with("valor", i as f64))
            .collect();
        insert_dataset_rows(&mut conn, "base_1", &rows).unwrap();
        assert_eq!(count_rows(&conn, "base_1").unwrap(), 1200);

        let ids: Vec<RowId> = (1..=1200i64).rev().filter(|i| i % 2 == 0).collect();
        let columns = vec!["valor".to_string()];
        let fetched = fetch_rows(&conn, "base_1", &columns, &ids).unwrap();

        assert_eq!(fetched.len(), 600);
        assert_eq!(fetched[0].id, 2);
        assert_eq!(fetched[0].number("valor").unwrap(), 2.0);
        assert!(fetched[0].get("nf").is_none());
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("valor"), "\"valor\"");
        assert_eq!(quote_ident("va\"lor"), "\"va\"\"lor\"");
    }

    #[test]
    fn test_open_database_applies_journal_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recon.sqlite3");

        let conn = open_database(&path, &EngineConfig::default()).unwrap();
        setup_database(&conn).unwrap();

        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
