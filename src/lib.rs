// Base Reconciler - Core Library
// Matching engine for Contábil x Fiscal reconciliation over SQLite datasets

pub mod config;
pub mod db;
pub mod error;
pub mod keys;
pub mod marks;
pub mod pagination;
pub mod reconciliation;
pub mod results;
pub mod reversal;
pub mod row;
pub mod status;

// Re-export commonly used types
pub use config::{
    EngineConfig, ReconciliationConfig, ReversalConfig,
    load_reconciliation_config, load_reversal_config,
    insert_reconciliation_config, insert_reversal_config,
};
pub use db::{
    Base, BaseSide, TableSchema,
    open_database, setup_database, register_base, get_base, table_schema,
    create_dataset_table, insert_dataset_rows, count_rows, fetch_rows,
};
pub use error::{ReconcileError, Result, RunOutcome};
pub use keys::{KeyConfigResolver, KeyDefinition, KeyLink, ResolvedKeys};
pub use marks::{
    Mark, insert_marks, marks_for_base, marks_for_row, count_marks, clear_marks,
};
pub use pagination::{JoinCursor, JoinPair, JoinSpec, MarkCursor, RowCursor};
pub use reconciliation::{ReconciliationMatcher, ReconciliationReport};
pub use results::{
    ResultRow, ResultSink, StoredResult,
    load_results, reset_result_table, result_status_counts, result_table_name,
};
pub use reversal::{ReversalMatcher, ReversalReport};
pub use row::{CellValue, Row, RowId};
pub use status::MatchStatus;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
