use std::path::Path;
use std::time::Instant;

use chrono::Utc;
use lalf::conf::EnvConfigSettings;
use lalf::error::{EtlError, Result};
use lalf::esri::{AuthSettings, TokenBroker};
use lalf::geocode::{import_geocodes, incremental_where_clause, GeocodeTarget};
use lalf::http::build_client;
use lalf::lease::EtlLease;
use lalf::s3::Snapshots;
use lalf::sparql::{binding_value, SparqlClient};
use lalf::store::diff::{compute_table_diff, log_diff};
use lalf::store::hash::{ensure_unique_hashes, hash_rows_in_table, render_value};
use lalf::store::metadata;
use lalf::store::{BatchCommitter, SnapshotStore, COMMIT_EVERY_CHUNKS};
use lalf::sync::{EntitySync, GeometryColumns, SyncEngine};
use lalf::time_convert::metadata_timestamp;
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use tracing::{error, info};

pub mod queries;
pub mod rows;
pub mod tables;

pub const LOCK_ID: &str = "address-etl";
pub const S3_FILE_PREFIX_KEY: &str = "etl/";
const PREVIOUS_DB_PATH: &str = "/tmp/address_previous.db";
const SNAPSHOT_DB_NAME: &str = "address.db";

/// Runs the location-address pipeline under its exclusive lease. The lease is
/// released on every exit path once acquired.
pub async fn run(env_conf: &EnvConfigSettings) -> Result<()> {
    let started = Instant::now();
    info!("Starting ETL process");

    let lease = EtlLease::acquire(env_conf, LOCK_ID).await?;
    let outcome = run_locked(env_conf).await;
    if let Err(err) = lease.release().await {
        error!("Failed to release ETL lease: {err}");
    }
    outcome?;

    info!("ETL process completed successfully");
    info!("Total time taken: {:.2} seconds", started.elapsed().as_secs_f64());
    Ok(())
}

fn location_address_entity<'a>(env_conf: &'a EnvConfigSettings) -> EntitySync<'a> {
    EntitySync {
        name: "address",
        table: "address_current",
        loaded_table: "address_current_loaded",
        key_column: "address_pid",
        push_columns: tables::PUSH_COLUMNS,
        geometry: Some(GeometryColumns {
            longitude: "longitude",
            latitude: "latitude",
        }),
        query_url: &env_conf.location_addressing_urls.query,
        apply_edits_url: &env_conf.location_addressing_urls.apply_edits,
    }
}

async fn run_locked(env_conf: &EnvConfigSettings) -> Result<()> {
    let store = SnapshotStore::open(Path::new(&env_conf.sqlite_path))?;
    let snapshots = Snapshots::new(env_conf).await;
    if !snapshots.bucket_exists(&env_conf.s3_bucket_name).await? {
        return Err(EtlError::StorageFatal(format!(
            "S3 bucket {} does not exist",
            env_conf.s3_bucket_name
        )));
    }

    let conn = store.conn();
    tables::create_tables(conn)?;
    metadata::write_start_time(conn, Utc::now())?;

    // Bring forward the previous snapshot: its address rows are the diff
    // baseline, its geocodes seed the incremental pull, and its start time
    // is the pull watermark.
    let mut watermark = None;
    if let Some(key) = snapshots
        .latest_snapshot_key(&env_conf.s3_bucket_name, S3_FILE_PREFIX_KEY)
        .await?
    {
        snapshots
            .download(&env_conf.s3_bucket_name, &key, Path::new(PREVIOUS_DB_PATH))
            .await?;
        store.attach_previous(Path::new(PREVIOUS_DB_PATH))?;
        watermark = metadata::previous_start_time(conn)?;
        store.load_previous_rows("address_current", "address_previous")?;
        store.load_previous_rows("geocode", "geocode")?;
        store.detach_previous()?;
    }

    let client = build_client(env_conf)?;
    let sparql = SparqlClient::new(
        env_conf.sparql_endpoint.clone(),
        client.clone(),
        env_conf.http_retry_max_time_in_seconds,
    );
    populate_staging(&sparql, conn, env_conf.address_iri_limit).await?;

    let broker = TokenBroker::new(
        client.clone(),
        AuthSettings::from_conf(env_conf),
        env_conf.http_retry_max_time_in_seconds,
    );
    let where_clause = if env_conf.debug {
        debug_geocode_where(conn)?
    } else {
        incremental_where_clause(watermark)
    };
    import_geocodes(
        &client,
        &broker,
        env_conf.http_retry_max_time_in_seconds,
        &env_conf.geocode_urls.query,
        where_clause,
        conn,
        GeocodeTarget::LocationAddress,
    )
    .await?;

    tables::create_table_indexes(conn)?;
    tables::populate_address_current_table(conn)?;
    hash_rows_in_table(conn, "address_current", "id")?;
    ensure_unique_hashes(conn, "address_current", "id")?;

    let diff = compute_table_diff(conn, "id", "address_pid", "address_previous", "address_current")?;
    log_diff("address_current", &diff);

    store.finish_bulk_load()?;

    let engine = SyncEngine::new(&client, &broker, env_conf.http_retry_max_time_in_seconds);
    engine
        .sync_entity(conn, &location_address_entity(env_conf), &diff)
        .await?;

    let published_at = metadata_timestamp(Utc::now());
    metadata::write_end_time(conn, &published_at)?;
    store.checkpoint()?;
    let key = format!("{S3_FILE_PREFIX_KEY}{published_at}/{SNAPSHOT_DB_NAME}");
    snapshots
        .upload(&env_conf.s3_bucket_name, &key, Path::new(&env_conf.sqlite_path))
        .await?;
    let download_url = snapshots
        .presigned_get_url(&env_conf.s3_bucket_name, &key)
        .await?;
    info!("Snapshot published to {key}");
    info!("Presigned download URL: {download_url}");
    Ok(())
}

/// Retrieves all current address IRIs, then pages through the detail query
/// in bounded chunks, appending each chunk to the staging table.
async fn populate_staging(
    sparql: &SparqlClient,
    conn: &Connection,
    iri_limit: Option<usize>,
) -> Result<()> {
    info!("Retrieving address IRIs from SPARQL endpoint");
    let iris: Vec<String> = sparql
        .query(&queries::address_iris_query(iri_limit))
        .await?
        .iter()
        .filter_map(|row| binding_value(row, "iri"))
        .collect();
    info!("Retrieved {} address IRIs to process", iris.len());

    let chunks: Vec<&[String]> = iris.chunks(queries::ADDRESS_IRI_CHUNK_SIZE).collect();
    info!("Split into {} chunks for processing", chunks.len());

    let mut committer = BatchCommitter::new(conn, COMMIT_EVERY_CHUNKS);
    for (index, chunk) in chunks.iter().enumerate() {
        info!("Processing address IRI chunk {} of {}", index + 1, chunks.len());
        let bindings = sparql.query(&queries::address_rows_query(chunk)).await?;
        let staged: Vec<rows::AddressStagingRow> = bindings
            .iter()
            .map(rows::AddressStagingRow::from_binding)
            .collect();
        committer.ensure_transaction()?;
        rows::insert_staging_rows(conn, &staged)?;
        committer.batch_done()?;
    }
    committer.flush()?;
    Ok(())
}

/// Restricted geocode pull for debug runs: only the geocodes of the staged
/// address pids.
fn debug_geocode_where(conn: &Connection) -> Result<String> {
    info!("Fetching geocodes in debug mode");
    let pids: Vec<String> = {
        let mut stmt = conn.prepare("SELECT DISTINCT address_pid FROM address_current_staging")?;
        let values = stmt
            .query_map([], |row| row.get::<_, SqlValue>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        values.iter().map(render_value).collect()
    };
    info!("Found {} address_pid values", pids.len());
    if pids.is_empty() {
        return Ok("1=0".to_string());
    }
    Ok(format!(
        "geocode_source = 'LALF' AND address_pid IN ({})",
        pids.join(", ")
    ))
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn staged_address(conn: &Connection, pid: &str) {
        conn.execute(
            "INSERT INTO address_current_staging (address, address_pid, state)
             VALUES (?1, ?2, 'QLD')",
            rusqlite::params![format!("{pid} Mary Street Brisbane City QLD"), pid],
        )
        .unwrap();
    }

    fn geocode(conn: &Connection, id: &str, pid: &str) {
        conn.execute(
            "INSERT INTO geocode VALUES (?1, 'PC', ?2, 153.5, -27.2)",
            rusqlite::params![id, pid],
        )
        .unwrap();
    }

    async fn mock_feature_service() -> (MockServer, TokenBroker, reqwest::Client) {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/generateToken"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": "t"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/applyEdits"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "addResults": [{"success": true}]
            })))
            .mount(&server)
            .await;
        let client = reqwest::Client::new();
        let broker = TokenBroker::new(
            client.clone(),
            AuthSettings {
                auth_url: format!("{}/generateToken", server.uri()),
                referer: "referer".into(),
                username: "user".into(),
                password: "pass".into(),
            },
            5,
        );
        (server, broker, client)
    }

    #[tokio::test]
    async fn first_run_pushes_only_geocoded_addresses() {
        // First-run semantics: no previous snapshot, three staged addresses,
        // geocodes for one of them plus an unrelated one. Exactly one row is
        // added and pushed, with no deletes issued.
        let store = SnapshotStore::open_in_memory().unwrap();
        let conn = store.conn();
        tables::create_tables(conn).unwrap();
        for pid in ["1", "2", "3"] {
            staged_address(conn, pid);
        }
        geocode(conn, "g1", "1");
        geocode(conn, "g2", "99");

        tables::create_table_indexes(conn).unwrap();
        tables::populate_address_current_table(conn).unwrap();
        hash_rows_in_table(conn, "address_current", "id").unwrap();
        ensure_unique_hashes(conn, "address_current", "id").unwrap();

        let diff =
            compute_table_diff(conn, "id", "address_pid", "address_previous", "address_current")
                .unwrap();
        assert!(diff.deleted.is_empty());
        assert_eq!(diff.added.len(), 1);

        let (server, broker, client) = mock_feature_service().await;
        let engine = SyncEngine::new(&client, &broker, 5);
        let query_url = format!("{}/query", server.uri());
        let apply_edits_url = format!("{}/applyEdits", server.uri());
        let entity = EntitySync {
            name: "address",
            table: "address_current",
            loaded_table: "address_current_loaded",
            key_column: "address_pid",
            push_columns: tables::PUSH_COLUMNS,
            geometry: Some(GeometryColumns {
                longitude: "longitude",
                latitude: "latitude",
            }),
            query_url: &query_url,
            apply_edits_url: &apply_edits_url,
        };
        engine.sync_entity(conn, &entity, &diff).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let edits: Vec<String> = requests
            .iter()
            .filter(|request| request.url.path() == "/applyEdits")
            .map(|request| String::from_utf8(request.body.clone()).unwrap())
            .collect();
        assert_eq!(edits.len(), 1);
        assert!(edits[0].contains("adds="));
        assert!(!edits[0].contains("deletes="));
        // A single add record: no object separator appears in the payload.
        assert!(!edits[0].contains("%7D%2C%7B"));
    }

    #[tokio::test]
    async fn unchanged_snapshot_makes_no_edit_calls() {
        let store = SnapshotStore::open_in_memory().unwrap();
        let conn = store.conn();
        tables::create_tables(conn).unwrap();
        staged_address(conn, "1");
        geocode(conn, "g1", "1");
        tables::populate_address_current_table(conn).unwrap();
        hash_rows_in_table(conn, "address_current", "id").unwrap();
        conn.execute(
            "INSERT INTO address_previous SELECT * FROM address_current",
            [],
        )
        .unwrap();

        let diff =
            compute_table_diff(conn, "id", "address_pid", "address_previous", "address_current")
                .unwrap();
        assert!(diff.is_empty());

        let (server, broker, client) = mock_feature_service().await;
        let engine = SyncEngine::new(&client, &broker, 5);
        let query_url = format!("{}/query", server.uri());
        let apply_edits_url = format!("{}/applyEdits", server.uri());
        let entity = EntitySync {
            name: "address",
            table: "address_current",
            loaded_table: "address_current_loaded",
            key_column: "address_pid",
            push_columns: tables::PUSH_COLUMNS,
            geometry: None,
            query_url: &query_url,
            apply_edits_url: &apply_edits_url,
        };
        engine.sync_entity(conn, &entity, &diff).await.unwrap();
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn iri_limit_caps_the_pull_to_a_single_chunk() {
        // With a limit of 10, exactly 10 IRIs are requested and the detail
        // query goes out in one chunk.
        let server = MockServer::start().await;
        let iris: Vec<serde_json::Value> = (0..10)
            .map(|n| {
                serde_json::json!({"iri": {"type": "uri",
                    "value": format!("https://example.com/addr/{n}")}})
            })
            .collect();
        Mock::given(method("POST"))
            .and(body_string_contains("LIMIT 10"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": {"bindings": iris}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("VALUES ?iri"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": {"bindings": [
                    {"address_pid": {"type": "literal", "value": "100"},
                     "state": {"type": "literal", "value": "QLD"}}
                ]}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let store = SnapshotStore::open_in_memory().unwrap();
        let conn = store.conn();
        tables::create_tables(conn).unwrap();
        let sparql = SparqlClient::new(server.uri(), reqwest::Client::new(), 5);
        populate_staging(&sparql, conn, Some(10)).await.unwrap();

        let staged: i64 = conn
            .query_row("SELECT COUNT(*) FROM address_current_staging", [], |row| row.get(0))
            .unwrap();
        assert_eq!(staged, 1);
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[test]
    fn debug_where_clause_lists_staged_pids() {
        let store = SnapshotStore::open_in_memory().unwrap();
        let conn = store.conn();
        tables::create_tables(conn).unwrap();
        staged_address(conn, "100");
        staged_address(conn, "101");
        let clause = debug_geocode_where(conn).unwrap();
        assert_eq!(clause, "geocode_source = 'LALF' AND address_pid IN (100, 101)");
    }

    #[test]
    fn empty_debug_staging_matches_nothing() {
        let store = SnapshotStore::open_in_memory().unwrap();
        let conn = store.conn();
        tables::create_tables(conn).unwrap();
        assert_eq!(debug_geocode_where(conn).unwrap(), "1=0");
    }
}
