use itertools::Itertools;
use rusqlite::Connection;
use tracing::info;

use crate::error::{EtlError, Result};

const UPDATE_BATCH_SIZE: usize = 10_000;

/// Creates the `{ id INTEGER AUTO, iri TEXT UNIQUE }` mapping table that
/// assigns dense integer ids to opaque IRIs.
pub fn create_id_map_table(conn: &Connection, map_table: &str) -> Result<()> {
    info!("Creating {map_table} table");
    conn.execute_batch(&format!(
        "CREATE TABLE {map_table} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            iri TEXT UNIQUE
        );
        CREATE UNIQUE INDEX idx_{map_table}_iri ON {map_table} (iri);"
    ))?;
    Ok(())
}

/// Rewrites `table.column` from IRI text to the integer id held in
/// `map_table`, first registering any IRIs the map has not seen. Once an IRI
/// has an id the assignment is stable for the life of the snapshot chain.
pub fn assign_ids(conn: &Connection, map_table: &str, table: &str, column: &str) -> Result<()> {
    info!("Mapping table {table} column {column} to the id in {map_table}");

    let inserted = conn.execute(
        &format!(
            "INSERT INTO {map_table} (iri)
             SELECT DISTINCT {table}.{column}
             FROM {table}
             LEFT JOIN {map_table} ON {table}.{column} = {map_table}.iri
             WHERE {table}.{column} IS NOT NULL AND {map_table}.iri IS NULL"
        ),
        [],
    )?;
    info!("Total new identifiers inserted into {map_table}: {inserted}");

    let total_rows: usize =
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
    let total_batches = total_rows.div_ceil(UPDATE_BATCH_SIZE);

    for (batch, offset) in (0..total_rows).step_by(UPDATE_BATCH_SIZE).enumerate() {
        info!("Rewriting {table}.{column} batch {} of {total_batches}", batch + 1);
        conn.execute(
            &format!(
                "UPDATE {table}
                 SET {column} = (
                     SELECT id
                     FROM {map_table}
                     WHERE iri = {table}.{column}
                 )
                 WHERE rowid IN (
                     SELECT rowid
                     FROM {table}
                     LIMIT {UPDATE_BATCH_SIZE}
                     OFFSET {offset}
                 )"
            ),
            [],
        )?;
    }
    Ok(())
}

/// Rebuilds `table` with the named columns retyped INTEGER (the business-id
/// column additionally UNIQUE), preserving the declared column order. Indexes
/// are dropped with the old table; callers recreate them afterwards.
pub fn rebuild_with_integer_columns(
    conn: &Connection,
    table: &str,
    integer_columns: &[&str],
    unique_column: Option<&str>,
) -> Result<()> {
    let columns: Vec<(String, String)> = {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
        let collected = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        collected
    };
    if columns.is_empty() {
        return Err(EtlError::DbError(format!("table {table} has no columns to rebuild")));
    }

    let definitions = columns
        .iter()
        .map(|(name, declared_type)| {
            if integer_columns.contains(&name.as_str()) {
                if unique_column == Some(name.as_str()) {
                    format!("{name} INTEGER UNIQUE")
                } else {
                    format!("{name} INTEGER")
                }
            } else {
                format!("{name} {declared_type}")
            }
        })
        .join(",\n            ");

    info!("Creating new table {table}_new");
    conn.execute(
        &format!("CREATE TABLE {table}_new (\n            {definitions}\n        )"),
        [],
    )?;

    info!("Copying data from {table} to {table}_new");
    conn.execute(&format!("INSERT INTO {table}_new SELECT * FROM {table}"), [])?;

    info!("Dropping old table {table}");
    conn.execute(&format!("DROP TABLE {table}"), [])?;

    info!("Renaming {table}_new to {table}");
    conn.execute(&format!("ALTER TABLE {table}_new RENAME TO {table}"), [])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use rusqlite::params;

    use super::*;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE parcel (parcel_id TEXT, plan_no TEXT, lot_no TEXT)",
        )
        .unwrap();
        create_id_map_table(&conn, "parcel_id_map").unwrap();
        conn
    }

    fn seed_parcels(conn: &Connection) {
        let parcels = [
            ("https://example.com/parcel/10SP149947", "SP149947", "10"),
            ("https://example.com/parcel/8SP190767", "SP190767", "8"),
            ("https://example.com/parcel/38SP195511", "SP195511", "38"),
            ("https://example.com/parcel/483RP851228", "RP851228", "483"),
        ];
        for (iri, plan, lot) in parcels {
            conn.execute(
                "INSERT INTO parcel (parcel_id, plan_no, lot_no) VALUES (?1, ?2, ?3)",
                params![iri, plan, lot],
            )
            .unwrap();
        }
    }

    // Before the rebuild pass the rewritten column still has TEXT affinity,
    // so the assigned ids read back as digit strings.
    fn mapped_ids(conn: &Connection) -> Vec<(String, String)> {
        let mut stmt = conn
            .prepare(
                "SELECT parcel.parcel_id, parcel_id_map.iri
                 FROM parcel
                 JOIN parcel_id_map ON parcel.parcel_id = parcel_id_map.id
                 ORDER BY parcel.rowid",
            )
            .unwrap();
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn assigns_integer_ids_to_every_iri() {
        let conn = setup();
        seed_parcels(&conn);
        assign_ids(&conn, "parcel_id_map", "parcel", "parcel_id").unwrap();

        let map_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM parcel_id_map", [], |row| row.get(0))
            .unwrap();
        assert_eq!(map_count, 4);

        let mapped = mapped_ids(&conn);
        assert_eq!(mapped.len(), 4);
        for (_, iri) in &mapped {
            assert!(iri.starts_with("http"));
        }
    }

    #[test]
    fn preseeded_map_entries_keep_their_ids() {
        let conn = setup();
        conn.execute(
            "INSERT INTO parcel_id_map (iri) VALUES ('https://example.com/parcel/8SP190767')",
            [],
        )
        .unwrap();
        seed_parcels(&conn);
        assign_ids(&conn, "parcel_id_map", "parcel", "parcel_id").unwrap();

        let id: String = conn
            .query_row(
                "SELECT parcel_id FROM parcel WHERE plan_no = 'SP190767'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(id, "1");
    }

    #[test]
    fn reassignment_over_same_inputs_is_idempotent() {
        let conn = setup();
        seed_parcels(&conn);
        assign_ids(&conn, "parcel_id_map", "parcel", "parcel_id").unwrap();
        let first = mapped_ids(&conn);

        // Reset the parcel table to the same source rows; the map survives.
        conn.execute("DELETE FROM parcel", []).unwrap();
        seed_parcels(&conn);
        assign_ids(&conn, "parcel_id_map", "parcel", "parcel_id").unwrap();
        let second = mapped_ids(&conn);

        assert_eq!(first, second);
    }

    #[test]
    fn rebuild_retypes_columns_in_place() {
        let conn = Connection::open_in_memory().unwrap();
        // The business id is deliberately not the first column.
        conn.execute_batch(
            "CREATE TABLE lf_address (address_pid TEXT, parcel_id TEXT, addr_id TEXT, unit_no TEXT);
             INSERT INTO lf_address VALUES ('100', '7', '3', '12');",
        )
        .unwrap();
        rebuild_with_integer_columns(&conn, "lf_address", &["addr_id", "parcel_id"], Some("addr_id"))
            .unwrap();

        let columns: Vec<(String, String)> = {
            let mut stmt = conn.prepare("PRAGMA table_info(lf_address)").unwrap();
            stmt.query_map([], |row| Ok((row.get(1)?, row.get(2)?)))
                .unwrap()
                .collect::<std::result::Result<Vec<_>, _>>()
                .unwrap()
        };
        let names: Vec<&str> = columns.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, ["address_pid", "parcel_id", "addr_id", "unit_no"]);
        assert_eq!(columns[1].1, "INTEGER");
        assert_eq!(columns[2].1, "INTEGER");

        let row: (String, i64, i64, String) = conn
            .query_row("SELECT * FROM lf_address", [], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })
            .unwrap();
        assert_eq!(row, ("100".to_string(), 7, 3, "12".to_string()));
    }
}
