// ⚖️ Reconciliation Engine - Match Base A (Contábil) against Base B (Fiscal)
//
// One job runs four passes, strictly in order:
//
//   1. Mark pass   - rows already carrying a mark are reported with that mark
//   2. Key pass    - per key, join A x B on the key columns and collect groups
//   3. Resolution  - per group, compare sum(A) with sum(B) and classify
//   4. Sweep       - every row still unmatched is reported as not found
//
// Every row id of either base ends up in exactly one result row. A row
// matched by an earlier pass or key is never looked at again.

use crate::config::{load_reconciliation_config, EngineConfig, ReconciliationConfig};
use crate::db::{fetch_rows, get_base, table_schema};
use crate::error::{Result, RunOutcome};
use crate::keys::{KeyConfigResolver, ResolvedKeys};
use crate::pagination::{JoinCursor, JoinSpec, MarkCursor, RowCursor};
use crate::results::{ResultRow, ResultSink};
use crate::row::{Row, RowId};
use crate::status::{round6, MatchStatus, LABEL_NOT_FOUND, STATUS_NOT_FOUND};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info, warn};

// ============================================================================
// RECONCILIATION REPORT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub config_id: i64,
    pub job_id: i64,
    pub result_table: String,
    pub key_identifiers: Vec<String>,

    /// Result rows written, all passes included
    pub rows_written: usize,

    /// Rows reported from existing marks
    pub marked_rows: usize,

    /// Rows reported through a key group
    pub key_matched_rows: usize,

    /// Rows no pass matched
    pub swept_rows: usize,

    /// Key groups resolved
    pub groups: usize,

    /// Marks whose row no longer exists in the base
    pub orphan_marks: usize,

    pub status_counts: BTreeMap<String, usize>,
    pub reconciled_at: DateTime<Utc>,
}

impl ReconciliationReport {
    fn new(config_id: i64, job_id: i64, result_table: &str, key_identifiers: Vec<String>) -> Self {
        ReconciliationReport {
            config_id,
            job_id,
            result_table: result_table.to_string(),
            key_identifiers,
            rows_written: 0,
            marked_rows: 0,
            key_matched_rows: 0,
            swept_rows: 0,
            groups: 0,
            orphan_marks: 0,
            status_counts: BTreeMap::new(),
            reconciled_at: Utc::now(),
        }
    }

    pub fn count(&self, status: &str) -> usize {
        self.status_counts.get(status).copied().unwrap_or(0)
    }

    pub fn summary(&self) -> String {
        let statuses = self
            .status_counts
            .iter()
            .map(|(status, count)| format!("{}={}", status, count))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "Reconciliation {} (job {}): {} rows [{} marked, {} by key in {} groups, {} unmatched] {}",
            self.config_id,
            self.job_id,
            self.rows_written,
            self.marked_rows,
            self.key_matched_rows,
            self.groups,
            self.swept_rows,
            statuses
        )
    }
}

// ============================================================================
// RUN STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    A,
    B,
}

/// Everything resolved before the first row is read
struct Setup {
    config: ReconciliationConfig,
    base_a_id: i64,
    base_b_id: i64,
    table_a: String,
    table_b: String,
    keys: ResolvedKeys,

    /// Position-paired column lists per key, shorter side padded
    padded: Vec<(Vec<String>, Vec<String>)>,

    /// Value column + every key column, per side
    projection_a: Vec<String>,
    projection_b: Vec<String>,
}

impl Setup {
    fn base_id(&self, side: Side) -> i64 {
        match side {
            Side::A => self.base_a_id,
            Side::B => self.base_b_id,
        }
    }

    fn table(&self, side: Side) -> &str {
        match side {
            Side::A => &self.table_a,
            Side::B => &self.table_b,
        }
    }

    fn projection(&self, side: Side) -> &[String] {
        match side {
            Side::A => &self.projection_a,
            Side::B => &self.projection_b,
        }
    }

    /// Value of a row as it enters the sums (Base B optionally inverted)
    fn value(&self, side: Side, row: &Row) -> Result<f64> {
        match side {
            Side::A => row.number(&self.config.value_column_a),
            Side::B => {
                let value = row.number(&self.config.value_column_b)?;
                Ok(if self.config.invert_sign_b { -value } else { value })
            }
        }
    }

    /// Composite key value of the row for every key, in key order
    fn key_values(&self, side: Side, row: &Row) -> Result<Vec<Option<String>>> {
        self.padded
            .iter()
            .map(|(columns_a, columns_b)| match side {
                Side::A => row.composite_key(columns_a),
                Side::B => row.composite_key(columns_b),
            })
            .collect()
    }

    /// Result row for a row reported on its own (mark and sweep passes)
    fn single_row(
        &self,
        side: Side,
        row: &Row,
        status: &str,
        group: &str,
        key_label: Option<String>,
    ) -> Result<ResultRow> {
        let value = round6(self.value(side, row)?);
        let (value_a, value_b) = match side {
            Side::A => (value, 0.0),
            Side::B => (0.0, value),
        };

        Ok(ResultRow {
            key_label,
            status: status.to_string(),
            group: group.to_string(),
            a_row_id: (side == Side::A).then_some(row.id),
            b_row_id: (side == Side::B).then_some(row.id),
            a_values: (side == Side::A).then(|| row.snapshot()),
            b_values: (side == Side::B).then(|| row.snapshot()),
            value_a,
            value_b,
            difference: round6(value_a - value_b),
            key_values: self.key_values(side, row)?,
            created_at: Utc::now(),
        })
    }
}

/// Mutable state of one job
struct JobRun {
    sink: ResultSink,
    matched_a: HashSet<RowId>,
    matched_b: HashSet<RowId>,
    report: ReconciliationReport,
}

impl JobRun {
    fn is_matched(&self, side: Side, id: RowId) -> bool {
        match side {
            Side::A => self.matched_a.contains(&id),
            Side::B => self.matched_b.contains(&id),
        }
    }

    fn emit(&mut self, conn: &mut Connection, side: Side, row: ResultRow) -> Result<()> {
        let id = match side {
            Side::A => row.a_row_id,
            Side::B => row.b_row_id,
        };
        if let Some(id) = id {
            match side {
                Side::A => self.matched_a.insert(id),
                Side::B => self.matched_b.insert(id),
            };
        }

        *self.report.status_counts.entry(row.status.clone()).or_default() += 1;
        self.sink.push(conn, row)
    }
}

/// Row ids of one key group, accumulated across every join page
#[derive(Debug, Default)]
struct Group {
    a_ids: BTreeSet<RowId>,
    b_ids: BTreeSet<RowId>,
}

// ============================================================================
// RECONCILIATION MATCHER
// ============================================================================

pub struct ReconciliationMatcher {
    config: EngineConfig,
}

impl ReconciliationMatcher {
    pub fn new(config: EngineConfig) -> Self {
        ReconciliationMatcher { config }
    }

    /// Reconcile one configuration into the result table of `job_id`
    ///
    /// A missing config, base, table or column skips the run without
    /// writing anything. Key resolution errors and failed result batches
    /// are returned as errors.
    pub fn run(
        &self,
        conn: &mut Connection,
        config_id: i64,
        job_id: i64,
    ) -> Result<RunOutcome<ReconciliationReport>> {
        let setup = match self.prepare(conn, config_id) {
            Ok(setup) => setup,
            Err(e) if e.is_recoverable() => {
                warn!(config_id, job_id, error = %e, "reconciliation skipped");
                return Ok(RunOutcome::Skipped { reason: e.to_string() });
            }
            Err(e) => return Err(e),
        };

        let identifiers = setup.keys.identifiers();
        let sink = ResultSink::open(conn, job_id, &identifiers, self.config.batch_size)?;
        let report = ReconciliationReport::new(config_id, job_id, sink.table(), identifiers);

        let mut run = JobRun {
            sink,
            matched_a: HashSet::new(),
            matched_b: HashSet::new(),
            report,
        };

        info!(
            config_id,
            job_id,
            keys = setup.keys.keys.len(),
            table_a = %setup.table_a,
            table_b = %setup.table_b,
            "reconciliation started"
        );

        for side in [Side::A, Side::B] {
            self.mark_pass(conn, &setup, &mut run, side)?;
        }

        for index in 0..setup.keys.keys.len() {
            self.key_pass(conn, &setup, &mut run, index)?;
        }

        for side in [Side::A, Side::B] {
            self.sweep_pass(conn, &setup, &mut run, side)?;
        }

        let JobRun { sink, mut report, .. } = run;
        report.rows_written = sink.finish(conn)?;
        report.reconciled_at = Utc::now();

        info!("{}", report.summary());
        Ok(RunOutcome::Completed(report))
    }

    fn prepare(&self, conn: &Connection, config_id: i64) -> Result<Setup> {
        let config = load_reconciliation_config(conn, config_id)?;
        let base_a = get_base(conn, config.base_a_id)?;
        let base_b = get_base(conn, config.base_b_id)?;

        let schema_a = table_schema(conn, &base_a.table_name)?;
        let schema_b = table_schema(conn, &base_b.table_name)?;
        schema_a.require(&config.value_column_a)?;
        schema_b.require(&config.value_column_b)?;

        let keys = KeyConfigResolver::new(conn).resolve_for(&config, &base_a, &base_b)?;
        schema_a.require_all(&keys.columns_a)?;
        schema_b.require_all(&keys.columns_b)?;

        let padded = keys.keys.iter().map(|k| k.padded_columns()).collect();
        let projection_a = projection(&config.value_column_a, &keys.columns_a);
        let projection_b = projection(&config.value_column_b, &keys.columns_b);

        Ok(Setup {
            base_a_id: base_a.id,
            base_b_id: base_b.id,
            table_a: base_a.table_name,
            table_b: base_b.table_name,
            config,
            keys,
            padded,
            projection_a,
            projection_b,
        })
    }

    // ========================================================================
    // PASS 1: MARKS
    // ========================================================================

    fn mark_pass(&self, conn: &mut Connection, setup: &Setup, run: &mut JobRun, side: Side) -> Result<()> {
        let mut cursor = MarkCursor::new(setup.base_id(side), self.config.page_size);
        let mut emitted = 0;

        while let Some(marks) = cursor.next_page(conn)? {
            let ids: Vec<RowId> = marks.iter().map(|m| m.row_id).collect();
            let rows: HashMap<RowId, Row> = fetch_rows(conn, setup.table(side), setup.projection(side), &ids)?
                .into_iter()
                .map(|row| (row.id, row))
                .collect();

            for mark in marks {
                let row = match rows.get(&mark.row_id) {
                    Some(row) => row,
                    None => {
                        run.report.orphan_marks += 1;
                        continue;
                    }
                };

                let result = setup.single_row(side, row, &mark.status, &mark.group, mark.key.clone())?;
                run.emit(conn, side, result)?;
                emitted += 1;
            }
        }

        run.report.marked_rows += emitted;
        debug!(side = ?side, rows = emitted, "mark pass done");
        Ok(())
    }

    // ========================================================================
    // PASS 2 + 3: KEY GROUPS
    // ========================================================================

    fn key_pass(&self, conn: &mut Connection, setup: &Setup, run: &mut JobRun, index: usize) -> Result<()> {
        let identifier = &setup.keys.keys[index].identifier;
        let (columns_a, columns_b) = &setup.padded[index];

        let mut cursor = JoinCursor::new(
            JoinSpec {
                table_a: setup.table_a.clone(),
                table_b: setup.table_b.clone(),
                columns_a: columns_a.clone(),
                columns_b: columns_b.clone(),
            },
            self.config.page_size,
        );

        // Groups are only resolved once every page has been read
        let mut groups: BTreeMap<String, Group> = BTreeMap::new();
        while let Some(pairs) = cursor.next_page(conn)? {
            for pair in pairs {
                if run.is_matched(Side::A, pair.a_id) || run.is_matched(Side::B, pair.b_id) {
                    continue;
                }
                let group = groups.entry(pair.key).or_default();
                group.a_ids.insert(pair.a_id);
                group.b_ids.insert(pair.b_id);
            }
        }

        debug!(key = %identifier, groups = groups.len(), "key join collected");
        run.report.groups += groups.len();

        // Resolve in batches of roughly one page of row ids
        let mut batch: Vec<(String, Group)> = Vec::new();
        let mut batch_ids = 0;
        for (value, group) in groups {
            batch_ids += group.a_ids.len() + group.b_ids.len();
            batch.push((value, group));

            if batch_ids >= self.config.page_size {
                self.resolve_groups(conn, setup, run, identifier, &batch)?;
                batch.clear();
                batch_ids = 0;
            }
        }
        if !batch.is_empty() {
            self.resolve_groups(conn, setup, run, identifier, &batch)?;
        }

        Ok(())
    }

    fn resolve_groups(
        &self,
        conn: &mut Connection,
        setup: &Setup,
        run: &mut JobRun,
        identifier: &str,
        batch: &[(String, Group)],
    ) -> Result<()> {
        let a_ids: Vec<RowId> = batch.iter().flat_map(|(_, g)| g.a_ids.iter().copied()).collect();
        let b_ids: Vec<RowId> = batch.iter().flat_map(|(_, g)| g.b_ids.iter().copied()).collect();

        let rows_a: HashMap<RowId, Row> = fetch_rows(conn, &setup.table_a, &setup.projection_a, &a_ids)?
            .into_iter()
            .map(|row| (row.id, row))
            .collect();
        let rows_b: HashMap<RowId, Row> = fetch_rows(conn, &setup.table_b, &setup.projection_b, &b_ids)?
            .into_iter()
            .map(|row| (row.id, row))
            .collect();

        for (value, group) in batch {
            let members_a: Vec<&Row> = group.a_ids.iter().filter_map(|id| rows_a.get(id)).collect();
            let members_b: Vec<&Row> = group.b_ids.iter().filter_map(|id| rows_b.get(id)).collect();

            let mut sum_a = 0.0;
            for row in &members_a {
                sum_a += setup.value(Side::A, row)?;
            }
            let mut sum_b = 0.0;
            for row in &members_b {
                sum_b += setup.value(Side::B, row)?;
            }

            let value_a = round6(sum_a);
            let value_b = round6(sum_b);
            let difference = round6(value_a - value_b);
            let status = MatchStatus::classify(
                !members_a.is_empty(),
                !members_b.is_empty(),
                difference,
                setup.config.materiality_tolerance,
            );

            debug!(key = %identifier, value = %value, sum_a = value_a, sum_b = value_b, status = ?status, "group resolved");

            let sides = members_a
                .iter()
                .map(|row| (Side::A, *row))
                .chain(members_b.iter().map(|row| (Side::B, *row)));

            for (side, row) in sides {
                let result = ResultRow {
                    key_label: Some(identifier.to_string()),
                    status: status.status().to_string(),
                    group: status.label().to_string(),
                    a_row_id: (side == Side::A).then_some(row.id),
                    b_row_id: (side == Side::B).then_some(row.id),
                    a_values: (side == Side::A).then(|| row.snapshot()),
                    b_values: (side == Side::B).then(|| row.snapshot()),
                    value_a,
                    value_b,
                    difference,
                    key_values: setup.key_values(side, row)?,
                    created_at: Utc::now(),
                };
                run.emit(conn, side, result)?;
                run.report.key_matched_rows += 1;
            }
        }

        Ok(())
    }

    // ========================================================================
    // PASS 4: SWEEP
    // ========================================================================

    fn sweep_pass(&self, conn: &mut Connection, setup: &Setup, run: &mut JobRun, side: Side) -> Result<()> {
        let default_key = setup.keys.default_identifier().map(|s| s.to_string());
        let mut cursor = RowCursor::new(setup.table(side), setup.projection(side), self.config.page_size);
        let mut swept = 0;

        while let Some(rows) = cursor.next_page(conn)? {
            for row in rows {
                if run.is_matched(side, row.id) {
                    continue;
                }

                let result = setup.single_row(side, &row, STATUS_NOT_FOUND, LABEL_NOT_FOUND, default_key.clone())?;
                run.emit(conn, side, result)?;
                swept += 1;
            }
        }

        run.report.swept_rows += swept;
        debug!(side = ?side, rows = swept, "sweep pass done");
        Ok(())
    }
}

/// Value column first, then key columns, no duplicates
fn projection(value_column: &str, key_columns: &[String]) -> Vec<String> {
    let mut columns = vec![value_column.to_string()];
    for column in key_columns {
        if !columns.contains(column) {
            columns.push(column.clone());
        }
    }
    columns
}
