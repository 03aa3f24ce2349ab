use blake2::digest::consts::U16;
use blake2::{Blake2b, Digest};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::error::{EtlError, Result};

/// 128-bit BLAKE2b, the digest existing snapshots were hashed with.
type Blake2b128 = Blake2b<U16>;

/// Renders one column value into the canonical hash serialisation. SQL NULL
/// renders as the literal `None`; changing this breaks comparison against
/// every previously published snapshot.
pub fn render_value(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => "None".to_string(),
        SqlValue::Integer(integer) => integer.to_string(),
        SqlValue::Real(real) => real.to_string(),
        SqlValue::Text(text) => text.clone(),
        SqlValue::Blob(blob) => hex::encode(blob),
    }
}

/// Hashes one row as the concatenation of `key=value` pairs in the order the
/// pairs are supplied, which must be the table's declared column order.
pub fn create_row_hash<'a, I>(columns: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a SqlValue)>,
{
    let mut canonical = String::new();
    for (name, value) in columns {
        canonical.push_str(name);
        canonical.push('=');
        canonical.push_str(&render_value(value));
    }
    let mut hasher = Blake2b128::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Computes and stores the content hash of every row in `table`, excluding
/// `rowid` and the hash column itself from the digest.
pub fn hash_rows_in_table(conn: &Connection, table: &str, hash_column: &str) -> Result<()> {
    info!("Hashing rows in table {table}");

    let column_names: Vec<String> = {
        let stmt = conn.prepare(&format!("SELECT rowid, * FROM {table}"))?;
        stmt.column_names().into_iter().map(String::from).collect()
    };

    let mut select = conn.prepare(&format!("SELECT rowid, * FROM {table}"))?;
    let mut update =
        conn.prepare(&format!("UPDATE {table} SET {hash_column} = ?1 WHERE rowid = ?2"))?;

    conn.execute_batch("BEGIN")?;
    let mut rows = select.query([])?;
    while let Some(row) = rows.next()? {
        let rowid: i64 = row.get(0)?;
        let mut values: Vec<(usize, SqlValue)> = Vec::with_capacity(column_names.len());
        for (index, name) in column_names.iter().enumerate().skip(1) {
            if name == hash_column {
                continue;
            }
            values.push((index, row.get(index)?));
        }
        let digest = create_row_hash(
            values
                .iter()
                .map(|(index, value)| (column_names[*index].as_str(), value)),
        );
        update.execute(params![digest, rowid])?;
    }
    drop(rows);
    conn.execute_batch("COMMIT")?;
    Ok(())
}

/// Within one snapshot, content hashes must be unique. A duplicate means two
/// rows serialise identically and the diff would lose one of them.
pub fn ensure_unique_hashes(conn: &Connection, table: &str, hash_column: &str) -> Result<()> {
    let duplicate: Option<String> = conn
        .query_row(
            &format!(
                "SELECT {hash_column} FROM {table}
                 GROUP BY {hash_column} HAVING COUNT(*) > 1 LIMIT 1"
            ),
            [],
            |row| row.get(0),
        )
        .optional()?;
    match duplicate {
        Some(hash) => Err(EtlError::DataIntegrity(format!(
            "duplicate content hash {hash} in table {table}"
        ))),
        None => Ok(()),
    }
}
