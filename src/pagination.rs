// 📄 Pagination - Keyset cursors over datasets, marks and key joins
//
// Every scan walks ascending row ids with `id > last_seen LIMIT page_size`,
// so peak memory depends on the page size, not on the table size. Page size
// never changes what a full scan returns.

use crate::db::{quote_ident, read_row, select_list, ROW_ID_COLUMN};
use crate::error::Result;
use crate::marks::{read_marks_page, Mark};
use crate::row::{Row, RowId};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use tracing::debug;

// ============================================================================
// ROW CURSOR
// ============================================================================

/// Pages through a dataset table in ascending id order
pub struct RowCursor {
    table: String,
    columns: Vec<String>,
    page_size: usize,
    after: Option<RowId>,
    done: bool,
}

impl RowCursor {
    pub fn new(table: &str, columns: &[String], page_size: usize) -> Self {
        RowCursor {
            table: table.to_string(),
            columns: dedup(columns),
            page_size: page_size.max(1),
            after: None,
            done: false,
        }
    }

    /// Next page of rows, or None once the table is exhausted
    pub fn next_page(&mut self, conn: &Connection) -> Result<Option<Vec<Row>>> {
        if self.done {
            return Ok(None);
        }

        let sql = format!(
            "SELECT {} FROM {} WHERE {} > ?1 ORDER BY {} LIMIT ?2",
            select_list(None, &self.columns),
            quote_ident(&self.table),
            quote_ident(ROW_ID_COLUMN),
            quote_ident(ROW_ID_COLUMN)
        );

        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(
                params![self.after.unwrap_or(i64::MIN), self.page_size as i64],
                |row| read_row(row, 0, &self.columns),
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        if rows.len() < self.page_size {
            self.done = true;
        }

        match rows.last() {
            Some(last) => {
                self.after = Some(last.id);
                Ok(Some(rows))
            }
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }
}

// ============================================================================
// MARK CURSOR
// ============================================================================

/// Pages through the marks of one base, yielding only the earliest mark of
/// each row
pub struct MarkCursor {
    base_id: i64,
    page_size: usize,
    after: Option<(RowId, i64)>,
    last_row: Option<RowId>,
    done: bool,
}

impl MarkCursor {
    pub fn new(base_id: i64, page_size: usize) -> Self {
        MarkCursor {
            base_id,
            page_size: page_size.max(1),
            after: None,
            last_row: None,
            done: false,
        }
    }

    pub fn next_page(&mut self, conn: &Connection) -> Result<Option<Vec<Mark>>> {
        while !self.done {
            let page = read_marks_page(conn, self.base_id, self.after, self.page_size)?;

            if page.len() < self.page_size {
                self.done = true;
            }

            let last = match page.last() {
                Some(last) => last,
                None => break,
            };
            self.after = Some((last.row_id, last.id.unwrap_or(i64::MAX)));

            let mut firsts = Vec::with_capacity(page.len());
            for mark in page {
                if self.last_row != Some(mark.row_id) {
                    self.last_row = Some(mark.row_id);
                    firsts.push(mark);
                }
            }

            if !firsts.is_empty() {
                return Ok(Some(firsts));
            }
        }

        Ok(None)
    }
}

// ============================================================================
// JOIN CURSOR
// ============================================================================

/// Equi-join of two dataset tables on positional column pairs
#[derive(Debug, Clone, PartialEq)]
pub struct JoinSpec {
    pub table_a: String,
    pub table_b: String,
    pub columns_a: Vec<String>,
    pub columns_b: Vec<String>,
}

/// One (Base A row, Base B row) pair sharing a join key
#[derive(Debug, Clone, PartialEq)]
pub struct JoinPair {
    pub a_id: RowId,
    pub b_id: RowId,

    /// Key parts as a JSON array (`Row::join_key`)
    pub key: String,
}

/// Paged hash join: Base B is indexed once (key -> ids), Base A is streamed
/// page by page and probed. Pages come out ordered by (a_id, b_id).
pub struct JoinCursor {
    spec: JoinSpec,
    page_size: usize,
    a_cursor: RowCursor,
    b_index: Option<HashMap<String, Vec<RowId>>>,
}

impl JoinCursor {
    pub fn new(spec: JoinSpec, page_size: usize) -> Self {
        let a_cursor = RowCursor::new(&spec.table_a, &spec.columns_a, page_size);
        JoinCursor {
            spec,
            page_size: page_size.max(1),
            a_cursor,
            b_index: None,
        }
    }

    fn build_index(&self, conn: &Connection) -> Result<HashMap<String, Vec<RowId>>> {
        let mut index: HashMap<String, Vec<RowId>> = HashMap::new();
        let mut cursor = RowCursor::new(&self.spec.table_b, &self.spec.columns_b, self.page_size);

        while let Some(rows) = cursor.next_page(conn)? {
            for row in rows {
                if let Some(key) = row.join_key(&self.spec.columns_b)? {
                    index.entry(key).or_default().push(row.id);
                }
            }
        }

        debug!(table = %self.spec.table_b, keys = index.len(), "join index built");
        Ok(index)
    }

    /// Next page of join pairs (one page of Base A rows), None when done
    pub fn next_page(&mut self, conn: &Connection) -> Result<Option<Vec<JoinPair>>> {
        if self.b_index.is_none() {
            self.b_index = Some(self.build_index(conn)?);
        }

        let rows = match self.a_cursor.next_page(conn)? {
            Some(rows) => rows,
            None => return Ok(None),
        };

        let index = match &self.b_index {
            Some(index) => index,
            None => return Ok(None),
        };

        let mut pairs = Vec::new();
        for row in rows {
            let key = match row.join_key(&self.spec.columns_a)? {
                Some(key) => key,
                None => continue,
            };

            if let Some(b_ids) = index.get(&key) {
                for b_id in b_ids {
                    pairs.push(JoinPair {
                        a_id: row.id,
                        b_id: *b_id,
                        key: key.clone(),
                    });
                }
            }
        }

        Ok(Some(pairs))
    }
}

fn dedup(columns: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(columns.len());
    for column in columns {
        if !out.contains(column) {
            out.push(column.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_dataset_table, insert_dataset_rows, setup_database};
    use crate::marks::insert_marks;
    use crate::status::{GROUP_REVERSAL_PAIR, GROUP_REVERSED_DOCUMENTS, STATUS_NOT_EVALUATED, STATUS_RECONCILED};

    fn seeded(n: i64) -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        create_dataset_table(&conn, "base_a", &["nf", "valor"]).unwrap();
        create_dataset_table(&conn, "base_b", &["numero", "valor_nf"]).unwrap();

        let a: Vec<Row> = (1..=n)
            .map(|i| Row::new(i).with("nf", format!("NF{}", i % 4)).with("valor", 10.0))
            .collect();
        let b: Vec<Row> = (1..=n)
            .map(|i| Row::new(100 + i).with("numero", format!("NF{}", i % 2)).with("valor_nf", 10.0))
            .collect();
        insert_dataset_rows(&mut conn, "base_a", &a).unwrap();
        insert_dataset_rows(&mut conn, "base_b", &b).unwrap();
        conn
    }

    #[test]
    fn test_row_cursor_visits_every_row_once() {
        let conn = seeded(10);

        for page_size in [1usize, 3, 10, 50] {
            let mut cursor = RowCursor::new("base_a", &["valor".to_string()], page_size);
            let mut ids = Vec::new();
            while let Some(rows) = cursor.next_page(&conn).unwrap() {
                assert!(rows.len() <= page_size);
                ids.extend(rows.iter().map(|r| r.id));
            }
            assert_eq!(ids, (1..=10).collect::<Vec<_>>(), "page size {}", page_size);
        }
    }

    #[test]
    fn test_join_cursor_is_page_size_independent() {
        let conn = seeded(9);
        let spec = JoinSpec {
            table_a: "base_a".to_string(),
            table_b: "base_b".to_string(),
            columns_a: vec!["nf".to_string()],
            columns_b: vec!["numero".to_string()],
        };

        let collect = |page_size: usize| {
            let mut cursor = JoinCursor::new(spec.clone(), page_size);
            let mut pairs = Vec::new();
            while let Some(page) = cursor.next_page(&conn).unwrap() {
                pairs.extend(page);
            }
            pairs
        };

        let all = collect(100);
        assert_eq!(all, collect(2));
        assert_eq!(all, collect(1));

        // NF0 and NF1 exist on both sides; NF2 / NF3 only on A
        assert!(all.iter().all(|p| p.key == r#"["NF0"]"# || p.key == r#"["NF1"]"#));
        let a1: Vec<RowId> = all.iter().filter(|p| p.a_id == 1).map(|p| p.b_id).collect();
        assert_eq!(a1, vec![101, 103, 105, 107, 109]);
    }

    #[test]
    fn test_join_cursor_compares_parts_not_joined_text() {
        let mut conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        create_dataset_table(&conn, "base_a", &["c1", "c2"]).unwrap();
        create_dataset_table(&conn, "base_b", &["d1", "d2"]).unwrap();
        insert_dataset_rows(
            &mut conn,
            "base_a",
            &[
                Row::new(1).with("c1", "N1|2").with("c2", "X"),
                Row::new(2).with("c1", "N1").with("c2", "2|X"),
            ],
        )
        .unwrap();
        insert_dataset_rows(&mut conn, "base_b", &[Row::new(10).with("d1", "N1").with("d2", "2|X")]).unwrap();

        let mut cursor = JoinCursor::new(
            JoinSpec {
                table_a: "base_a".to_string(),
                table_b: "base_b".to_string(),
                columns_a: vec!["c1".to_string(), "c2".to_string()],
                columns_b: vec!["d1".to_string(), "d2".to_string()],
            },
            10,
        );

        let mut pairs = Vec::new();
        while let Some(page) = cursor.next_page(&conn).unwrap() {
            pairs.extend(page);
        }

        // "N1|2" + "X" must not meet "N1" + "2|X"
        assert_eq!(pairs.len(), 1);
        assert_eq!((pairs[0].a_id, pairs[0].b_id), (2, 10));

        println!("✅ Join key separator test PASSED");
    }

    #[test]
    fn test_mark_cursor_yields_first_mark_per_row() {
        let mut conn = seeded(1);
        let mut marks = Vec::new();
        for row in 1..=4i64 {
            marks.push(Mark::new(1, row, STATUS_RECONCILED, GROUP_REVERSAL_PAIR, None));
            marks.push(Mark::new(1, row, STATUS_NOT_EVALUATED, GROUP_REVERSED_DOCUMENTS, None));
        }
        insert_marks(&mut conn, &marks).unwrap();

        for page_size in [1usize, 2, 3, 100] {
            let mut cursor = MarkCursor::new(1, page_size);
            let mut seen = Vec::new();
            while let Some(page) = cursor.next_page(&conn).unwrap() {
                seen.extend(page);
            }
            assert_eq!(seen.len(), 4, "page size {}", page_size);
            assert!(seen.iter().all(|m| m.group == GROUP_REVERSAL_PAIR));
        }
    }
}
