// 🔖 Mark Store - Row classification marks
//
// A mark tags one row of one base with a status inside a group
// ("Conciliado_Estorno", "Documentos estornados", manual cancellations...).
// (base_id, row_id, group) is unique: writing the same mark twice is a no-op,
// so upstream steps can be rerun safely.

use crate::error::Result;
use crate::row::RowId;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mark {
    /// Store id, None until persisted
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,

    pub base_id: i64,
    pub row_id: RowId,
    pub status: String,
    pub group: String,

    /// Shared by the rows of one pair (e.g. both sides of a reversal)
    pub key: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl Mark {
    pub fn new(base_id: i64, row_id: RowId, status: &str, group: &str, key: Option<String>) -> Self {
        Mark {
            id: None,
            base_id,
            row_id,
            status: status.to_string(),
            group: group.to_string(),
            key,
            created_at: Utc::now(),
        }
    }
}

/// Insert marks in one transaction, ignoring ones that already exist
///
/// Returns how many marks were actually written.
pub fn insert_marks(conn: &mut Connection, marks: &[Mark]) -> Result<usize> {
    let tx = conn.transaction()?;
    let mut inserted = 0;

    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO base_marks (base_id, row_id, status, mark_group, mark_key, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (base_id, row_id, mark_group) DO NOTHING",
        )?;

        for mark in marks {
            inserted += stmt.execute(params![
                mark.base_id,
                mark.row_id,
                mark.status,
                mark.group,
                mark.key,
                mark.created_at.to_rfc3339(),
            ])?;
        }
    }

    tx.commit()?;
    Ok(inserted)
}

fn map_mark(row: &rusqlite::Row<'_>) -> rusqlite::Result<Mark> {
    let created_at: String = row.get(6)?;
    Ok(Mark {
        id: Some(row.get(0)?),
        base_id: row.get(1)?,
        row_id: row.get(2)?,
        status: row.get(3)?,
        group: row.get(4)?,
        key: row.get(5)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

/// One page of marks for a base, ordered by (row_id, id)
///
/// `after` is the (row_id, mark id) of the last mark already seen.
pub fn read_marks_page(
    conn: &Connection,
    base_id: i64,
    after: Option<(RowId, i64)>,
    limit: usize,
) -> Result<Vec<Mark>> {
    let (after_row, after_id) = after.unwrap_or((i64::MIN, i64::MIN));

    let mut stmt = conn.prepare_cached(
        "SELECT id, base_id, row_id, status, mark_group, mark_key, created_at
         FROM base_marks
         WHERE base_id = ?1
           AND (row_id > ?2 OR (row_id = ?2 AND id > ?3))
         ORDER BY row_id, id
         LIMIT ?4",
    )?;

    let marks = stmt
        .query_map(params![base_id, after_row, after_id, limit as i64], map_mark)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(marks)
}

/// Every mark of a base, read `page_size` marks at a time
pub fn marks_for_base(conn: &Connection, base_id: i64, page_size: usize) -> Result<Vec<Mark>> {
    let page_size = page_size.max(1);
    let mut marks = Vec::new();
    let mut after = None;

    loop {
        let page = read_marks_page(conn, base_id, after, page_size)?;
        let full = page.len() == page_size;
        after = page.last().map(|m| (m.row_id, m.id.unwrap_or(i64::MAX)));
        marks.extend(page);

        if !full {
            return Ok(marks);
        }
    }
}

/// All marks carried by one row, oldest first
pub fn marks_for_row(conn: &Connection, base_id: i64, row_id: RowId) -> Result<Vec<Mark>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, base_id, row_id, status, mark_group, mark_key, created_at
         FROM base_marks
         WHERE base_id = ?1 AND row_id = ?2
         ORDER BY id",
    )?;

    let marks = stmt
        .query_map(params![base_id, row_id], map_mark)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(marks)
}

pub fn count_marks(conn: &Connection, base_id: i64, group: Option<&str>) -> Result<i64> {
    let count: i64 = match group {
        Some(group) => conn.query_row(
            "SELECT COUNT(*) FROM base_marks WHERE base_id = ?1 AND mark_group = ?2",
            params![base_id, group],
            |row| row.get(0),
        )?,
        None => conn.query_row(
            "SELECT COUNT(*) FROM base_marks WHERE base_id = ?1",
            params![base_id],
            |row| row.get(0),
        )?,
    };

    Ok(count)
}

/// Drop one group of marks so the step that produced it can be recomputed
pub fn clear_marks(conn: &Connection, base_id: i64, group: &str) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM base_marks WHERE base_id = ?1 AND mark_group = ?2",
        params![base_id, group],
    )?;

    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_database;
    use crate::status::{GROUP_REVERSAL_PAIR, GROUP_REVERSED_DOCUMENTS, STATUS_NOT_EVALUATED, STATUS_RECONCILED};

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    #[test]
    fn test_insert_marks_is_idempotent() {
        let mut conn = test_conn();

        let marks = vec![
            Mark::new(1, 10, STATUS_RECONCILED, GROUP_REVERSAL_PAIR, Some("k1".into())),
            Mark::new(1, 11, STATUS_RECONCILED, GROUP_REVERSAL_PAIR, Some("k1".into())),
        ];

        let first = insert_marks(&mut conn, &marks).unwrap();
        let second = insert_marks(&mut conn, &marks).unwrap();

        assert_eq!(first, 2);
        assert_eq!(second, 0);
        assert_eq!(count_marks(&conn, 1, None).unwrap(), 2);

        println!("✅ Mark idempotency test PASSED");
    }

    #[test]
    fn test_same_row_different_groups() {
        let mut conn = test_conn();

        let marks = vec![
            Mark::new(1, 10, STATUS_RECONCILED, GROUP_REVERSAL_PAIR, None),
            Mark::new(1, 10, STATUS_NOT_EVALUATED, GROUP_REVERSED_DOCUMENTS, None),
            Mark::new(1, 10, STATUS_NOT_EVALUATED, GROUP_REVERSED_DOCUMENTS, None),
        ];

        assert_eq!(insert_marks(&mut conn, &marks).unwrap(), 2);

        let on_row = marks_for_row(&conn, 1, 10).unwrap();
        assert_eq!(on_row.len(), 2);
        assert_eq!(on_row[0].group, GROUP_REVERSAL_PAIR);
        assert!(on_row[0].id.is_some());
    }

    #[test]
    fn test_read_marks_page_keyset() {
        let mut conn = test_conn();

        let marks: Vec<Mark> = (1..=5i64)
            .map(|row| Mark::new(2, row, STATUS_RECONCILED, GROUP_REVERSAL_PAIR, None))
            .collect();
        insert_marks(&mut conn, &marks).unwrap();

        let page1 = read_marks_page(&conn, 2, None, 2).unwrap();
        assert_eq!(page1.iter().map(|m| m.row_id).collect::<Vec<_>>(), vec![1, 2]);

        let last = page1.last().unwrap();
        let page2 = read_marks_page(&conn, 2, Some((last.row_id, last.id.unwrap())), 10).unwrap();
        assert_eq!(page2.iter().map(|m| m.row_id).collect::<Vec<_>>(), vec![3, 4, 5]);

        assert!(read_marks_page(&conn, 3, None, 10).unwrap().is_empty());

        let all = marks_for_base(&conn, 2, 2).unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all.last().unwrap().row_id, 5);
    }

    #[test]
    fn test_clear_marks_by_group() {
        let mut conn = test_conn();

        insert_marks(
            &mut conn,
            &[
                Mark::new(1, 1, STATUS_RECONCILED, GROUP_REVERSAL_PAIR, None),
                Mark::new(1, 2, STATUS_NOT_EVALUATED, GROUP_REVERSED_DOCUMENTS, None),
            ],
        )
        .unwrap();

        assert_eq!(clear_marks(&conn, 1, GROUP_REVERSED_DOCUMENTS).unwrap(), 1);
        assert_eq!(count_marks(&conn, 1, Some(GROUP_REVERSAL_PAIR)).unwrap(), 1);
        assert_eq!(count_marks(&conn, 1, Some(GROUP_REVERSED_DOCUMENTS)).unwrap(), 0);
    }
}
