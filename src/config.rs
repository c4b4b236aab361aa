// ⚙️ Configuration - Engine tuning + persisted step configurations
//
// Page and batch sizes are explicit values handed to the engine. They change
// memory footprint and throughput, never the results.

use crate::error::{ReconcileError, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

// ============================================================================
// ENGINE CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Rows (or Base A rows, for joins) read per page
    pub page_size: usize,

    /// Result rows committed per transaction
    pub batch_size: usize,

    /// SQLite busy timeout for file databases
    pub busy_timeout_ms: u64,

    /// SQLite journal mode for file databases
    pub journal_mode: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            page_size: 5000,
            batch_size: 200,
            busy_timeout_ms: 8000,
            journal_mode: "WAL".to_string(),
        }
    }
}

impl EngineConfig {
    /// Small pages and batches, handy to force multi-page runs in tests
    pub fn with_sizes(page_size: usize, batch_size: usize) -> Self {
        EngineConfig {
            page_size: page_size.max(1),
            batch_size: batch_size.max(1),
            ..Default::default()
        }
    }

    /// Read overrides from the process environment
    ///
    /// Only the binary calls this; the engine receives the resulting struct.
    pub fn from_env() -> Self {
        let defaults = EngineConfig::default();
        EngineConfig {
            page_size: env_usize("RECON_PAGE_SIZE").unwrap_or(defaults.page_size),
            batch_size: env_usize("RECON_BATCH_SIZE").unwrap_or(defaults.batch_size),
            busy_timeout_ms: env_usize("SQLITE_BUSY_TIMEOUT")
                .map(|v| v as u64)
                .unwrap_or(defaults.busy_timeout_ms),
            journal_mode: std::env::var("SQLITE_JOURNAL_MODE")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.journal_mode),
        }
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|v| *v > 0)
}

// ============================================================================
// RECONCILIATION CONFIG
// ============================================================================

/// One Base A x Base B reconciliation setup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    pub id: i64,
    pub name: String,
    pub base_a_id: i64,
    pub base_b_id: i64,

    /// Value column summed on Base A
    pub value_column_a: String,

    /// Value column summed on Base B
    pub value_column_b: String,

    /// Negate Base B values before aggregation
    pub invert_sign_b: bool,

    /// Largest difference still reported as immaterial (0 disables)
    pub materiality_tolerance: f64,

    /// Legacy inline key map for Base A: `{"CHAVE_1": ["col", ...]}`
    pub keys_a: Option<String>,

    /// Legacy inline key map for Base B
    pub keys_b: Option<String>,
}

pub fn load_reconciliation_config(conn: &Connection, config_id: i64) -> Result<ReconciliationConfig> {
    let config = conn
        .query_row(
            "SELECT id, name, base_a_id, base_b_id, value_column_a, value_column_b,
                    invert_sign_b, materiality_tolerance, keys_a, keys_b
             FROM reconciliation_configs
             WHERE id = ?1",
            params![config_id],
            |row| {
                Ok(ReconciliationConfig {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    base_a_id: row.get(2)?,
                    base_b_id: row.get(3)?,
                    value_column_a: row.get(4)?,
                    value_column_b: row.get(5)?,
                    invert_sign_b: row.get::<_, i64>(6)? != 0,
                    materiality_tolerance: row.get::<_, Option<f64>>(7)?.unwrap_or(0.0),
                    keys_a: row.get(8)?,
                    keys_b: row.get(9)?,
                })
            },
        )
        .optional()?;

    config.ok_or_else(|| {
        ReconcileError::Configuration(format!("reconciliation config {} not found", config_id))
    })
}

pub fn insert_reconciliation_config(conn: &Connection, config: &ReconciliationConfig) -> Result<i64> {
    conn.execute(
        "INSERT INTO reconciliation_configs (
            name, base_a_id, base_b_id, value_column_a, value_column_b,
            invert_sign_b, materiality_tolerance, keys_a, keys_b
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            config.name,
            config.base_a_id,
            config.base_b_id,
            config.value_column_a,
            config.value_column_b,
            config.invert_sign_b as i64,
            config.materiality_tolerance,
            config.keys_a,
            config.keys_b,
        ],
    )?;

    Ok(conn.last_insert_rowid())
}

// ============================================================================
// REVERSAL CONFIG
// ============================================================================

/// Self-reversal detection inside one base
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReversalConfig {
    pub id: i64,
    pub base_id: i64,

    /// Join column read as the "A" side of the self-join
    pub column_a: String,

    /// Join column read as the "B" side of the self-join
    pub column_b: String,

    /// Amount column whose values must cancel out
    pub column_sum: String,

    /// Largest |amount_a + amount_b| still accepted as zero
    pub zero_tolerance: f64,
}

pub fn load_reversal_config(conn: &Connection, config_id: i64) -> Result<ReversalConfig> {
    let config = conn
        .query_row(
            "SELECT id, base_id, column_a, column_b, column_sum, zero_tolerance
             FROM reversal_configs
             WHERE id = ?1",
            params![config_id],
            |row| {
                Ok(ReversalConfig {
                    id: row.get(0)?,
                    base_id: row.get(1)?,
                    column_a: row.get(2)?,
                    column_b: row.get(3)?,
                    column_sum: row.get(4)?,
                    zero_tolerance: row.get::<_, Option<f64>>(5)?.unwrap_or(0.0),
                })
            },
        )
        .optional()?;

    config.ok_or_else(|| ReconcileError::Configuration(format!("reversal config {} not found", config_id)))
}

pub fn insert_reversal_config(conn: &Connection, config: &ReversalConfig) -> Result<i64> {
    conn.execute(
        "INSERT INTO reversal_configs (base_id, column_a, column_b, column_sum, zero_tolerance)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            config.base_id,
            config.column_a,
            config.column_b,
            config.column_sum,
            config.zero_tolerance,
        ],
    )?;

    Ok(conn.last_insert_rowid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_database;

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.page_size, 5000);
        assert_eq!(config.batch_size, 200);
        assert_eq!(config.journal_mode, "WAL");

        let small = EngineConfig::with_sizes(0, 0);
        assert_eq!(small.page_size, 1);
        assert_eq!(small.batch_size, 1);
    }

    #[test]
    fn test_reconciliation_config_round_trip() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let config = ReconciliationConfig {
            id: 0,
            name: "Contabil x Fiscal".to_string(),
            base_a_id: 1,
            base_b_id: 2,
            value_column_a: "valor".to_string(),
            value_column_b: "valor_nf".to_string(),
            invert_sign_b: true,
            materiality_tolerance: 0.01,
            keys_a: Some(r#"{"CHAVE_1": ["nf"]}"#.to_string()),
            keys_b: Some(r#"{"CHAVE_1": ["numero"]}"#.to_string()),
        };

        let id = insert_reconciliation_config(&conn, &config).unwrap();
        let loaded = load_reconciliation_config(&conn, id).unwrap();

        assert_eq!(loaded.id, id);
        assert_eq!(loaded.value_column_b, "valor_nf");
        assert!(loaded.invert_sign_b);
        assert_eq!(loaded.materiality_tolerance, 0.01);
    }

    #[test]
    fn test_missing_config_is_configuration_error() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let err = load_reconciliation_config(&conn, 42).unwrap_err();
        assert!(matches!(err, ReconcileError::Configuration(_)));

        let err = load_reversal_config(&conn, 42).unwrap_err();
        assert!(err.is_recoverable());
    }
}
