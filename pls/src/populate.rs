use std::time::Instant;

use lalf::error::Result;
use lalf::sparql::{binding_value, required_binding, SparqlClient, SparqlRow};
use lalf::store::id_map::{assign_ids, rebuild_with_integer_columns};
use lalf::store::{BatchCommitter, COMMIT_EVERY_CHUNKS};
use rusqlite::{params, Connection};
use tracing::info;

use crate::queries::address::AddressKey;
use crate::queries::place_name::PlaceNameKey;
use crate::queries::road::RoadKey;
use crate::queries::{self, ADDRESS_CHUNK_SIZE, ENTITY_CHUNK_SIZE};

async fn populate_locality_tables(sparql: &SparqlClient, conn: &Connection) -> Result<()> {
    let started = Instant::now();
    info!("Fetching locality data");

    let rows = sparql.query(&queries::local_auth::get_query()).await?;
    info!("Found {} local_auth rows", rows.len());
    for row in &rows {
        conn.execute(
            "INSERT INTO local_auth (la_code, la_name) VALUES (?1, ?2)",
            params![
                required_binding(row, "la_code")?,
                required_binding(row, "lga_name")?
            ],
        )?;
    }

    let rows = sparql.query(&queries::locality::get_query()).await?;
    info!("Found {} locality rows", rows.len());
    for row in &rows {
        conn.execute(
            "INSERT INTO locality (locality_code, locality_name, locality_type, la_code, state, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                required_binding(row, "locality_code")?,
                required_binding(row, "locality_name")?,
                required_binding(row, "locality_type")?,
                required_binding(row, "la_code")?,
                required_binding(row, "state")?,
                required_binding(row, "status")?
            ],
        )?;
    }

    info!("Time taken: {:.2} seconds", started.elapsed().as_secs_f64());
    Ok(())
}

async fn fetch_parcel_iris(sparql: &SparqlClient, debug: bool) -> Result<Vec<String>> {
    let rows = sparql
        .query(&queries::parcel::get_query_iris_only(debug))
        .await?;
    Ok(rows
        .iter()
        .filter_map(|row| binding_value(row, "parcel_id"))
        .collect())
}

async fn populate_parcel_tables(
    sparql: &SparqlClient,
    conn: &Connection,
    parcel_iris: &[String],
) -> Result<()> {
    let started = Instant::now();
    info!("Fetching parcel data for {} parcels", parcel_iris.len());

    let mut committer = BatchCommitter::new(conn, COMMIT_EVERY_CHUNKS);
    for chunk in parcel_iris.chunks(ENTITY_CHUNK_SIZE) {
        let rows = sparql.query(&queries::parcel::get_query(chunk)).await?;
        info!("Found {} parcel rows", rows.len());
        committer.ensure_transaction()?;
        for row in &rows {
            conn.execute(
                "INSERT INTO lf_parcel (parcel_id, plan_no, lot_no) VALUES (?1, ?2, ?3)",
                params![
                    required_binding(row, "parcel_id")?,
                    required_binding(row, "plan_no")?,
                    required_binding(row, "lot_no")?
                ],
            )?;
        }
        committer.batch_done()?;
    }
    committer.flush()?;

    info!("Time taken: {:.2} seconds", started.elapsed().as_secs_f64());
    Ok(())
}

async fn populate_site_tables(
    sparql: &SparqlClient,
    conn: &Connection,
    parcel_iris: &[String],
) -> Result<()> {
    let started = Instant::now();
    info!("Fetching site data");

    let mut committer = BatchCommitter::new(conn, COMMIT_EVERY_CHUNKS);
    for chunk in parcel_iris.chunks(ENTITY_CHUNK_SIZE) {
        let rows = sparql.query(&queries::site::get_query(chunk)).await?;
        info!("Found {} site rows", rows.len());
        committer.ensure_transaction()?;
        for row in &rows {
            conn.execute(
                "INSERT INTO lf_site (site_id, parent_site_id, site_type, parcel_id)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    required_binding(row, "site_id")?,
                    binding_value(row, "parent_site_id"),
                    required_binding(row, "site_type")?,
                    required_binding(row, "parcel_id")?
                ],
            )?;
        }
        committer.batch_done()?;
    }
    committer.flush()?;

    info!("Time taken: {:.2} seconds", started.elapsed().as_secs_f64());
    Ok(())
}

async fn populate_road_tables(
    sparql: &SparqlClient,
    conn: &Connection,
    debug: bool,
) -> Result<()> {
    let started = Instant::now();
    info!("Fetching road data");

    let keys: Vec<RoadKey> = sparql
        .query(&queries::road::get_query_iris_only(debug))
        .await?
        .iter()
        .map(|row| {
            Ok(RoadKey {
                road: required_binding(row, "road")?,
                locality_code: required_binding(row, "locality_code")?,
                road_name: required_binding(row, "_road_name")?,
            })
        })
        .collect::<Result<_>>()?;
    info!("Found {} road occurrences", keys.len());

    let mut committer = BatchCommitter::new(conn, COMMIT_EVERY_CHUNKS);
    for chunk in keys.chunks(ENTITY_CHUNK_SIZE) {
        let rows = sparql.query(&queries::road::get_query(chunk)).await?;
        info!("Found {} road rows", rows.len());
        committer.ensure_transaction()?;
        for row in &rows {
            conn.execute(
                "INSERT OR IGNORE INTO lf_road
                     (road_id, road_name, road_name_suffix, road_name_type, locality_code, road_cat_desc)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    required_binding(row, "road_id")?,
                    required_binding(row, "road_name")?,
                    binding_value(row, "road_name_suffix"),
                    binding_value(row, "road_name_type"),
                    required_binding(row, "locality_code")?,
                    required_binding(row, "road_cat_desc")?
                ],
            )?;
        }
        committer.batch_done()?;
    }
    committer.flush()?;

    info!("Time taken: {:.2} seconds", started.elapsed().as_secs_f64());
    Ok(())
}

async fn fetch_address_keys(sparql: &SparqlClient, debug: bool) -> Result<Vec<AddressKey>> {
    let rows = sparql
        .query(&queries::address::get_query_iris_only(debug))
        .await?;
    rows.iter()
        .map(|row| {
            Ok(AddressKey {
                addr_iri: required_binding(row, "addr_iri")?,
                parcel_id: required_binding(row, "parcel_id")?,
                road: required_binding(row, "road")?,
                locality_code: required_binding(row, "locality_code")?,
                road_name: required_binding(row, "_road_name")?,
            })
        })
        .collect()
}

async fn populate_address_tables(
    sparql: &SparqlClient,
    conn: &Connection,
    address_keys: &[AddressKey],
) -> Result<()> {
    let started = Instant::now();
    info!("Populating address table for {} occurrences", address_keys.len());

    let mut committer = BatchCommitter::new(conn, COMMIT_EVERY_CHUNKS);
    for chunk in address_keys.chunks(ADDRESS_CHUNK_SIZE) {
        let rows = sparql.query(&queries::address::get_query(chunk)).await?;
        info!("Found {} address rows", rows.len());
        committer.ensure_transaction()?;
        for row in &rows {
            insert_address_row(conn, row)?;
        }
        committer.batch_done()?;
    }
    committer.flush()?;

    info!("Time taken: {:.2} seconds", started.elapsed().as_secs_f64());
    Ok(())
}

fn insert_address_row(conn: &Connection, row: &SparqlRow) -> Result<()> {
    conn.execute(
        "INSERT INTO lf_address
             (addr_id, address_pid, parcel_id, addr_status_code, unit_type, unit_no,
              unit_suffix, level_type, level_no, level_suffix, street_no_first,
              street_no_first_suffix, street_no_last, street_no_last_suffix, road_id,
              site_id, location_desc, address_standard)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            required_binding(row, "addr_id")?,
            required_binding(row, "address_pid")?,
            required_binding(row, "parcel_id")?,
            required_binding(row, "addr_status_code")?,
            binding_value(row, "unit_type"),
            binding_value(row, "unit_no"),
            binding_value(row, "unit_suffix"),
            binding_value(row, "level_type"),
            binding_value(row, "level_no"),
            binding_value(row, "level_suffix"),
            binding_value(row, "street_no_first"),
            binding_value(row, "street_no_first_suffix"),
            binding_value(row, "street_no_last"),
            binding_value(row, "street_no_last_suffix"),
            required_binding(row, "road_id")?,
            required_binding(row, "site_id")?,
            binding_value(row, "location_desc"),
            required_binding(row, "address_standard")?
        ],
    )?;
    Ok(())
}

async fn populate_place_name_tables(
    sparql: &SparqlClient,
    conn: &Connection,
    address_keys: &[AddressKey],
) -> Result<()> {
    let started = Instant::now();
    info!("Populating place name table");

    let pairs: Vec<PlaceNameKey> = address_keys
        .iter()
        .map(|key| PlaceNameKey {
            parcel_id: key.parcel_id.clone(),
            addr_iri: key.addr_iri.clone(),
        })
        .collect();

    let mut committer = BatchCommitter::new(conn, COMMIT_EVERY_CHUNKS);
    for chunk in pairs.chunks(ENTITY_CHUNK_SIZE) {
        let rows = sparql.query(&queries::place_name::get_query(chunk)).await?;
        info!("Found {} place name rows", rows.len());
        committer.ensure_transaction()?;
        for row in &rows {
            conn.execute(
                "INSERT OR IGNORE INTO lf_place_name
                     (place_name_id, pl_name_status_code, pl_name_type_code, pl_name, site_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    required_binding(row, "place_name_id")?,
                    required_binding(row, "pl_name_status_code")?,
                    required_binding(row, "pl_name_type_code")?,
                    required_binding(row, "pl_name")?,
                    required_binding(row, "site_id")?
                ],
            )?;
        }
        committer.batch_done()?;
    }
    committer.flush()?;

    info!("Time taken: {:.2} seconds", started.elapsed().as_secs_f64());
    Ok(())
}

/// Extracts every PLS entity from the graph into the snapshot store.
pub async fn populate_tables(sparql: &SparqlClient, conn: &Connection, debug: bool) -> Result<()> {
    populate_locality_tables(sparql, conn).await?;
    populate_road_tables(sparql, conn, debug).await?;

    let parcel_iris = fetch_parcel_iris(sparql, debug).await?;
    info!("Found {} parcel IRIs", parcel_iris.len());
    populate_parcel_tables(sparql, conn, &parcel_iris).await?;
    populate_site_tables(sparql, conn, &parcel_iris).await?;

    let address_keys = fetch_address_keys(sparql, debug).await?;
    info!("Found {} address occurrences", address_keys.len());
    populate_address_tables(sparql, conn, &address_keys).await?;
    populate_place_name_tables(sparql, conn, &address_keys).await?;

    Ok(())
}

/// Rewrites every IRI-keyed column to its dense integer id and rebuilds the
/// affected tables with INTEGER columns. Referencing columns go through the
/// same map as the business id they point at, so join consistency holds by
/// construction.
pub fn rewrite_iri_columns(conn: &Connection) -> Result<()> {
    assign_ids(conn, "lf_road_id_map", "lf_road", "road_id")?;
    rebuild_with_integer_columns(conn, "lf_road", &["road_id"], Some("road_id"))?;

    assign_ids(conn, "lf_parcel_id_map", "lf_parcel", "parcel_id")?;
    rebuild_with_integer_columns(conn, "lf_parcel", &["parcel_id"], Some("parcel_id"))?;

    assign_ids(conn, "lf_site_id_map", "lf_site", "site_id")?;
    assign_ids(conn, "lf_site_id_map", "lf_site", "parent_site_id")?;
    assign_ids(conn, "lf_parcel_id_map", "lf_site", "parcel_id")?;
    rebuild_with_integer_columns(
        conn,
        "lf_site",
        &["site_id", "parent_site_id", "parcel_id"],
        Some("site_id"),
    )?;

    assign_ids(conn, "lf_address_id_map", "lf_address", "addr_id")?;
    assign_ids(conn, "lf_road_id_map", "lf_address", "road_id")?;
    assign_ids(conn, "lf_site_id_map", "lf_address", "site_id")?;
    assign_ids(conn, "lf_parcel_id_map", "lf_address", "parcel_id")?;
    rebuild_with_integer_columns(
        conn,
        "lf_address",
        &["addr_id", "road_id", "site_id", "parcel_id"],
        Some("addr_id"),
    )?;

    assign_ids(conn, "lf_place_name_id_map", "lf_place_name", "place_name_id")?;
    assign_ids(conn, "lf_site_id_map", "lf_place_name", "site_id")?;
    rebuild_with_integer_columns(
        conn,
        "lf_place_name",
        &["place_name_id", "site_id"],
        Some("place_name_id"),
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables;

    #[test]
    fn rewrite_keeps_references_consistent() {
        let conn = Connection::open_in_memory().unwrap();
        tables::create_tables(&conn).unwrap();
        conn.execute_batch(
            "INSERT INTO lf_parcel (parcel_id, plan_no, lot_no)
             VALUES ('https://example.com/parcel/1', 'SP1', '1');
             INSERT INTO lf_site (site_id, parent_site_id, site_type, parcel_id)
             VALUES ('https://example.com/parcel/1|https://example.com/addr/1', NULL, 'P',
                     'https://example.com/parcel/1');
             INSERT INTO lf_address (addr_id, address_pid, parcel_id, addr_status_code,
                 road_id, site_id, address_standard)
             VALUES ('https://example.com/addr/1/road/1', '100', 'https://example.com/parcel/1',
                     'P', 'https://example.com/road/1/L1/MARY',
                     'https://example.com/parcel/1|https://example.com/addr/1', 'UK');
             INSERT INTO lf_road (road_id, road_name, locality_code, road_cat_desc)
             VALUES ('https://example.com/road/1/L1/MARY', 'MARY', 'L1', 'P');",
        )
        .unwrap();

        rewrite_iri_columns(&conn).unwrap();

        // The address's references resolve to the same integers assigned to
        // the referenced rows.
        let consistent: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM lf_address a
                 JOIN lf_parcel p ON a.parcel_id = p.parcel_id
                 JOIN lf_site s ON a.site_id = s.site_id
                 JOIN lf_road r ON a.road_id = r.road_id",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(consistent, 1);

        let addr_id: i64 = conn
            .query_row("SELECT addr_id FROM lf_address", [], |row| row.get(0))
            .unwrap();
        assert_eq!(addr_id, 1);
    }
}
