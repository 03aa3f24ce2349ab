use chrono::{DateTime, FixedOffset, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use super::PREVIOUS_SCHEMA;
use crate::error::Result;
use crate::time_convert::{metadata_timestamp, parse_metadata_timestamp};

/// Creates the singleton metadata table holding the run's start and end time
/// in local civil time with UTC offset.
pub fn create_metadata_table(conn: &Connection) -> Result<()> {
    info!("Creating metadata table");
    conn.execute(
        "CREATE TABLE metadata (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            start_time TEXT,
            end_time TEXT
        )",
        [],
    )?;
    Ok(())
}

/// Write the start time to the metadata table.
pub fn write_start_time(conn: &Connection, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "INSERT INTO metadata (id, start_time) VALUES (1, ?1)",
        params![metadata_timestamp(now)],
    )?;
    Ok(())
}

/// Write the end time to the metadata table.
pub fn write_end_time(conn: &Connection, end_time: &str) -> Result<()> {
    conn.execute(
        "UPDATE metadata SET end_time = ?1 WHERE id = 1",
        params![end_time],
    )?;
    Ok(())
}

/// Reads the previous run's start time from the attached snapshot, used as
/// the incremental watermark for geocode pulls.
pub fn previous_start_time(conn: &Connection) -> Result<Option<DateTime<FixedOffset>>> {
    let raw: Option<String> = conn
        .query_row(
            &format!("SELECT start_time FROM {PREVIOUS_SCHEMA}.metadata WHERE id = 1"),
            [],
            |row| row.get(0),
        )
        .optional()?;
    match raw {
        Some(raw) => Ok(Some(parse_metadata_timestamp(&raw)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn start_and_end_times_round_trip() {
        let conn = Connection::open_in_memory().unwrap();
        create_metadata_table(&conn).unwrap();
        let started = Utc.with_ymd_and_hms(2025, 5, 27, 23, 30, 0).single().unwrap();
        write_start_time(&conn, started).unwrap();
        write_end_time(&conn, "2025-05-28T10:00:00+1000").unwrap();

        let (start, end): (String, String) = conn
            .query_row("SELECT start_time, end_time FROM metadata WHERE id = 1", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(start, "2025-05-28T09:30:00+1000");
        assert_eq!(end, "2025-05-28T10:00:00+1000");
    }

    #[test]
    fn metadata_is_a_singleton() {
        let conn = Connection::open_in_memory().unwrap();
        create_metadata_table(&conn).unwrap();
        let started = Utc.with_ymd_and_hms(2025, 5, 27, 23, 30, 0).single().unwrap();
        write_start_time(&conn, started).unwrap();
        assert!(write_start_time(&conn, started).is_err());
    }
}
