use std::collections::HashSet;

use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use tracing::info;

use super::hash::render_value;
use crate::error::Result;

/// Business ids whose rows vanished from, or appeared in, the current
/// snapshot. A row whose attributes changed maps to a new hash and therefore
/// shows up on both sides under the same id.
#[derive(Debug, Default)]
pub struct TableDiff {
    pub deleted: Vec<SqlValue>,
    pub added: Vec<SqlValue>,
}

impl TableDiff {
    /// Ids to push: everything added plus everything deleted, since a changed
    /// row must be reinserted after its old version is removed.
    pub fn to_insert(&self) -> Vec<SqlValue> {
        let mut seen = HashSet::new();
        let mut union = Vec::new();
        for id in self.added.iter().chain(self.deleted.iter()) {
            if seen.insert(render_value(id)) {
                union.push(id.clone());
            }
        }
        union
    }

    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty() && self.added.is_empty()
    }
}

fn distinct_unmatched_keys(
    conn: &Connection,
    hash_column: &str,
    key_column: &str,
    from_table: &str,
    against_table: &str,
) -> Result<Vec<SqlValue>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT DISTINCT f.{key_column}
         FROM {from_table} f
         LEFT JOIN {against_table} a ON f.{hash_column} = a.{hash_column}
         WHERE a.{hash_column} IS NULL"
    ))?;
    let keys = stmt
        .query_map([], |row| row.get::<_, SqlValue>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(keys)
}

/// Logs a diff summary, listing the business ids when there are few enough
/// to be readable.
pub fn log_diff(table_name: &str, diff: &TableDiff) {
    if diff.deleted.len() <= 10 && diff.added.len() <= 10 {
        let deleted: Vec<String> = diff.deleted.iter().map(render_value).collect();
        let added: Vec<String> = diff.added.iter().map(render_value).collect();
        info!("{table_name}: Deleted: {} {deleted:?}", deleted.len());
        info!("{table_name}: Added: {} {added:?}", added.len());
    } else {
        info!(
            "{table_name}: Deleted: {} rows, Added: {} rows",
            diff.deleted.len(),
            diff.added.len()
        );
    }
}

/// Hash-keyed set difference between the previous and current snapshot of
/// one entity.
pub fn compute_table_diff(
    conn: &Connection,
    hash_column: &str,
    key_column: &str,
    previous_table: &str,
    current_table: &str,
) -> Result<TableDiff> {
    let deleted =
        distinct_unmatched_keys(conn, hash_column, key_column, previous_table, current_table)?;
    let added =
        distinct_unmatched_keys(conn, hash_column, key_column, current_table, previous_table)?;
    Ok(TableDiff { deleted, added })
}

#[cfg(test)]
mod tests {
    use rusqlite::params;

    use super::*;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE previous (id TEXT, pid TEXT, unit TEXT);
             CREATE TABLE current (id TEXT, pid TEXT, unit TEXT);",
        )
        .unwrap();
        conn
    }

    fn insert(conn: &Connection, table: &str, rows: &[(&str, &str, &str)]) {
        for (id, pid, unit) in rows {
            conn.execute(
                &format!("INSERT INTO {table} VALUES (?1, ?2, ?3)"),
                params![id, pid, unit],
            )
            .unwrap();
        }
    }

    #[test]
    fn identical_tables_diff_empty() {
        let conn = setup();
        insert(&conn, "previous", &[("h1", "100", "12")]);
        insert(&conn, "current", &[("h1", "100", "12")]);
        let diff = compute_table_diff(&conn, "id", "pid", "previous", "current").unwrap();
        assert!(diff.is_empty());
        assert!(diff.to_insert().is_empty());
    }

    #[test]
    fn vanished_rows_are_deleted() {
        let conn = setup();
        insert(&conn, "previous", &[("h1", "100", "12"), ("h2", "101", "3")]);
        insert(&conn, "current", &[("h2", "101", "3")]);
        let diff = compute_table_diff(&conn, "id", "pid", "previous", "current").unwrap();
        assert_eq!(diff.deleted, vec![SqlValue::Text("100".into())]);
        assert!(diff.added.is_empty());
    }

    #[test]
    fn new_rows_are_added() {
        let conn = setup();
        insert(&conn, "previous", &[("h1", "100", "12")]);
        insert(&conn, "current", &[("h1", "100", "12"), ("h2", "101", "3")]);
        let diff = compute_table_diff(&conn, "id", "pid", "previous", "current").unwrap();
        assert!(diff.deleted.is_empty());
        assert_eq!(diff.added, vec![SqlValue::Text("101".into())]);
    }

    #[test]
    fn changed_row_appears_on_both_sides() {
        // (pid=100, unit=12) -> (pid=100, unit=14) means the content hash
        // changed; the id must show up as both deleted and added, and the
        // insert union must carry it once.
        let conn = setup();
        insert(&conn, "previous", &[("h1", "100", "12")]);
        insert(&conn, "current", &[("h3", "100", "14")]);
        let diff = compute_table_diff(&conn, "id", "pid", "previous", "current").unwrap();
        assert_eq!(diff.deleted, vec![SqlValue::Text("100".into())]);
        assert_eq!(diff.added, vec![SqlValue::Text("100".into())]);
        assert_eq!(diff.to_insert(), vec![SqlValue::Text("100".into())]);
    }

    #[test]
    fn self_diff_is_empty() {
        let conn = setup();
        insert(
            &conn,
            "previous",
            &[("h1", "100", "12"), ("h2", "101", "3"), ("h3", "102", "7")],
        );
        let diff = compute_table_diff(&conn, "id", "pid", "previous", "previous").unwrap();
        assert!(diff.is_empty());
    }
}
