// 🔁 Reversal Matcher - Self-cancelling rows inside one base
//
// A reversal is a cross-column self-join: row X reverses row Y when
// X.column_a == Y.column_b and X.sum + Y.sum is zero within tolerance.
// Pairs are marked "Conciliado_Estorno"; rows that had a candidate key on
// both sides but found no partner are marked "Documentos estornados".
//
// Matching is first-fit in ascending row id, so reruns pick the same pairs.

use crate::config::{load_reversal_config, EngineConfig, ReversalConfig};
use crate::db::{get_base, table_schema};
use crate::error::{Result, RunOutcome};
use crate::marks::{insert_marks, Mark};
use crate::pagination::RowCursor;
use crate::row::RowId;
use crate::status::{
    EPSILON, GROUP_REVERSAL_PAIR, GROUP_REVERSED_DOCUMENTS, STATUS_NOT_EVALUATED, STATUS_RECONCILED,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

// ============================================================================
// INDEX
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Entry {
    pub id: RowId,
    pub amount: f64,
}

/// Join-key text -> entries in ascending id order
pub type ReversalIndex = BTreeMap<String, Vec<Entry>>;

/// Amount in hundredths, the bucket unit of the candidate lookup
fn cents(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

/// Outcome of the pairing step, before anything is persisted
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReversalPairs {
    /// (first row, partner row) in discovery order
    pub pairs: Vec<(RowId, RowId)>,

    /// Candidates left without a partner, ascending id
    pub unmatched: Vec<RowId>,

    /// Keys present in both indexes with at least two distinct rows
    pub candidate_keys: usize,
}

/// Pair rows of `index_a` with rows of `index_b` sharing the same key
///
/// Each row is used at most once across all keys. Matching is first-fit:
/// candidates are tried in ascending cent bucket, then ascending id, and the
/// first one within tolerance wins even when a later one cancels more
/// closely.
pub fn pair_reversals(index_a: &ReversalIndex, index_b: &ReversalIndex, zero_tolerance: f64) -> ReversalPairs {
    let tolerance = zero_tolerance.max(0.0);
    // float -> int casts saturate, so huge tolerances clamp to i64::MAX
    let window = (tolerance * 100.0).ceil() as i64;

    let mut consumed: HashSet<RowId> = HashSet::new();
    let mut participants: BTreeSet<RowId> = BTreeSet::new();
    let mut result = ReversalPairs::default();

    for (key, list_a) in index_a {
        let list_b = match index_b.get(key) {
            Some(list) => list,
            None => continue,
        };

        let ids: BTreeSet<RowId> = list_a.iter().chain(list_b.iter()).map(|e| e.id).collect();
        if ids.len() < 2 {
            continue;
        }
        result.candidate_keys += 1;
        participants.extend(ids);

        let mut lookup: BTreeMap<i64, Vec<Entry>> = BTreeMap::new();
        for entry in list_b {
            lookup.entry(cents(entry.amount)).or_default().push(*entry);
        }

        for entry in list_a {
            if consumed.contains(&entry.id) {
                continue;
            }

            let target = cents(-entry.amount);
            let partner = lookup
                .range(target.saturating_sub(window)..=target.saturating_add(window))
                .flat_map(|(_, bucket)| bucket.iter())
                .find(|candidate| {
                    candidate.id != entry.id
                        && !consumed.contains(&candidate.id)
                        && (entry.amount + candidate.amount).abs() <= tolerance + EPSILON
                });

            if let Some(partner) = partner {
                consumed.insert(entry.id);
                consumed.insert(partner.id);
                result.pairs.push((entry.id, partner.id));
            }
        }
    }

    result.unmatched = participants
        .into_iter()
        .filter(|id| !consumed.contains(id))
        .collect();

    result
}

// ============================================================================
// REPORT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReversalReport {
    pub config_id: i64,
    pub base_id: i64,
    pub rows_scanned: usize,
    pub candidate_keys: usize,
    pub pairs: usize,
    pub unmatched: usize,

    /// Marks actually written; 0 on a rerun over unchanged data
    pub marks_inserted: usize,
}

impl ReversalReport {
    pub fn summary(&self) -> String {
        format!(
            "Reversal {} on base {}: {} rows scanned, {} candidate keys, {} pairs, {} unmatched, {} new marks",
            self.config_id,
            self.base_id,
            self.rows_scanned,
            self.candidate_keys,
            self.pairs,
            self.unmatched,
            self.marks_inserted
        )
    }
}

// ============================================================================
// MATCHER
// ============================================================================

pub struct ReversalMatcher {
    config: EngineConfig,
}

impl ReversalMatcher {
    pub fn new(config: EngineConfig) -> Self {
        ReversalMatcher { config }
    }

    /// Run a stored reversal configuration
    ///
    /// Missing config, base, table or column skips the step.
    pub fn run(&self, conn: &mut Connection, config_id: i64) -> Result<RunOutcome<ReversalReport>> {
        match load_reversal_config(conn, config_id) {
            Ok(config) => self.run_config(conn, &config),
            Err(e) if e.is_recoverable() => {
                warn!(config_id, error = %e, "reversal skipped");
                Ok(RunOutcome::Skipped { reason: e.to_string() })
            }
            Err(e) => Err(e),
        }
    }

    pub fn run_config(&self, conn: &mut Connection, config: &ReversalConfig) -> Result<RunOutcome<ReversalReport>> {
        let table = match self.prepare(conn, config) {
            Ok(table) => table,
            Err(e) if e.is_recoverable() => {
                warn!(config_id = config.id, base_id = config.base_id, error = %e, "reversal skipped");
                return Ok(RunOutcome::Skipped { reason: e.to_string() });
            }
            Err(e) => return Err(e),
        };

        let (index_a, index_b, rows_scanned) = self.build_indexes(conn, &table, config)?;
        let found = pair_reversals(&index_a, &index_b, config.zero_tolerance);

        debug!(
            base_id = config.base_id,
            pairs = found.pairs.len(),
            unmatched = found.unmatched.len(),
            "reversal pairs computed"
        );

        let mut marks = Vec::with_capacity(found.pairs.len() * 2 + found.unmatched.len());
        for (first, second) in &found.pairs {
            let key = Uuid::new_v4().to_string();
            marks.push(Mark::new(config.base_id, *first, STATUS_RECONCILED, GROUP_REVERSAL_PAIR, Some(key.clone())));
            marks.push(Mark::new(config.base_id, *second, STATUS_RECONCILED, GROUP_REVERSAL_PAIR, Some(key)));
        }
        for id in &found.unmatched {
            marks.push(Mark::new(config.base_id, *id, STATUS_NOT_EVALUATED, GROUP_REVERSED_DOCUMENTS, None));
        }

        let mut marks_inserted = 0;
        for chunk in marks.chunks(self.config.batch_size.max(1)) {
            marks_inserted += insert_marks(conn, chunk)?;
        }

        let report = ReversalReport {
            config_id: config.id,
            base_id: config.base_id,
            rows_scanned,
            candidate_keys: found.candidate_keys,
            pairs: found.pairs.len(),
            unmatched: found.unmatched.len(),
            marks_inserted,
        };

        info!("{}", report.summary());
        Ok(RunOutcome::Completed(report))
    }

    /// Resolve the base table and check the configured columns exist
    fn prepare(&self, conn: &Connection, config: &ReversalConfig) -> Result<String> {
        let base = get_base(conn, config.base_id)?;
        let schema = table_schema(conn, &base.table_name)?;
        schema.require(&config.column_a)?;
        schema.require(&config.column_b)?;
        schema.require(&config.column_sum)?;
        Ok(base.table_name)
    }

    /// One paginated scan filling both column indexes
    fn build_indexes(
        &self,
        conn: &Connection,
        table: &str,
        config: &ReversalConfig,
    ) -> Result<(ReversalIndex, ReversalIndex, usize)> {
        let columns = vec![
            config.column_a.clone(),
            config.column_b.clone(),
            config.column_sum.clone(),
        ];

        let mut index_a = ReversalIndex::new();
        let mut index_b = ReversalIndex::new();
        let mut scanned = 0;

        let mut cursor = RowCursor::new(table, &columns, self.config.page_size);
        while let Some(rows) = cursor.next_page(conn)? {
            for row in rows {
                scanned += 1;
                let entry = Entry {
                    id: row.id,
                    amount: row.number(&config.column_sum)?,
                };

                if let Some(key) = row.value(&config.column_a)?.key_text() {
                    index_a.entry(key).or_default().push(entry);
                }
                if let Some(key) = row.value(&config.column_b)?.key_text() {
                    index_b.entry(key).or_default().push(entry);
                }
            }
        }

        Ok((index_a, index_b, scanned))
    }
}
