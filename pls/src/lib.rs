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
use lalf::sparql::SparqlClient;
use lalf::store::hash::{ensure_unique_hashes, hash_rows_in_table};
use lalf::store::metadata;
use lalf::store::SnapshotStore;
use lalf::sync::SyncEngine;
use lalf::time_convert::metadata_timestamp;
use rusqlite::Connection;
use tracing::{error, info};

pub mod populate;
pub mod queries;
pub mod sync;
pub mod tables;

pub const LOCK_ID: &str = "address-etl-pls";
pub const S3_FILE_PREFIX_KEY: &str = "pls-etl/";
const PREVIOUS_DB_PATH: &str = "/tmp/pls_previous.db";
const SNAPSHOT_DB_NAME: &str = "pls.db";

/// Every table that carries a content hash, in snapshot order.
const HASHED_TABLES: &[&str] = &[
    "local_auth",
    "locality",
    "lf_road",
    "lf_parcel",
    "lf_site",
    "lf_place_name",
    "lf_address",
    "lf_geocode_sp_survey_point",
];

/// Runs the PLS pipeline under its exclusive lease. The lease is released on
/// every exit path once acquired.
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

async fn run_locked(env_conf: &EnvConfigSettings) -> Result<()> {
    let store = SnapshotStore::open(Path::new(&env_conf.pls_sqlite_path))?;
    let snapshots = Snapshots::new(env_conf).await;
    if !snapshots.bucket_exists(&env_conf.pls_s3_bucket_name).await? {
        return Err(EtlError::StorageFatal(format!(
            "S3 bucket {} does not exist",
            env_conf.pls_s3_bucket_name
        )));
    }

    let conn = store.conn();
    tables::create_tables(conn)?;
    metadata::write_start_time(conn, Utc::now())?;

    let mut watermark = None;
    if let Some(key) = snapshots
        .latest_snapshot_key(&env_conf.pls_s3_bucket_name, S3_FILE_PREFIX_KEY)
        .await?
    {
        snapshots
            .download(&env_conf.pls_s3_bucket_name, &key, Path::new(PREVIOUS_DB_PATH))
            .await?;
        store.attach_previous(Path::new(PREVIOUS_DB_PATH))?;
        watermark = metadata::previous_start_time(conn)?;
        load_previous_tables(&store, conn)?;
        store.detach_previous()?;
    }

    let client = build_client(env_conf)?;
    let broker = TokenBroker::new(
        client.clone(),
        AuthSettings::from_conf(env_conf),
        env_conf.http_retry_max_time_in_seconds,
    );
    import_geocodes(
        &client,
        &broker,
        env_conf.http_retry_max_time_in_seconds,
        &env_conf.geocode_urls.query,
        incremental_where_clause(watermark),
        conn,
        GeocodeTarget::Pls,
    )
    .await?;

    let sparql = SparqlClient::new(
        env_conf.sparql_endpoint.clone(),
        client.clone(),
        env_conf.http_retry_max_time_in_seconds,
    );
    populate::populate_tables(&sparql, conn, env_conf.debug).await?;
    populate::rewrite_iri_columns(conn)?;
    tables::update_geocode_site_id(conn)?;
    tables::create_table_indexes(conn)?;

    for table in HASHED_TABLES {
        hash_rows_in_table(conn, table, "hash")?;
        ensure_unique_hashes(conn, table, "hash")?;
    }

    store.finish_bulk_load()?;

    let engine = SyncEngine::new(&client, &broker, env_conf.http_retry_max_time_in_seconds);
    sync::compute_diff_and_sync(conn, &engine, env_conf).await?;

    let published_at = metadata_timestamp(Utc::now());
    metadata::write_end_time(conn, &published_at)?;
    store.checkpoint()?;
    let key = format!("{S3_FILE_PREFIX_KEY}{published_at}/{SNAPSHOT_DB_NAME}");
    snapshots
        .upload(&env_conf.pls_s3_bucket_name, &key, Path::new(&env_conf.pls_sqlite_path))
        .await?;
    let download_url = snapshots
        .presigned_get_url(&env_conf.pls_s3_bucket_name, &key)
        .await?;
    info!("Snapshot published to {key}");
    info!("Presigned download URL: {download_url}");
    Ok(())
}

/// Brings the previous snapshot forward: geocodes seed the incremental pull
/// (their site assignment and hash are recomputed this run), the id maps
/// keep integer assignments stable across runs, and the `_previous` tables
/// become the diff baseline.
fn load_previous_tables(store: &SnapshotStore, conn: &Connection) -> Result<()> {
    conn.execute(
        "INSERT INTO lf_geocode_sp_survey_point
         SELECT
             geocode_id,
             geocode_type,
             address_pid,
             NULL,
             centoid_lat,
             centoid_lon,
             NULL
         FROM previous.lf_geocode_sp_survey_point",
        [],
    )?;

    for map_table in tables::ID_MAP_TABLES {
        info!("Loading {map_table} from previous ETL");
        store.load_previous_rows(map_table, map_table)?;
    }

    for table in HASHED_TABLES {
        if *table == "lf_place_name" {
            continue;
        }
        store.load_previous_rows(table, &format!("{table}_previous"))?;
    }
    Ok(())
}
