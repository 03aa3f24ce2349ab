//! Bulk utilities for the LALF geocode collection: a one-off CSV seed loader
//! and a batched purge of previously loaded geocodes.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use lalf::conf::EnvConfigSettings;
use lalf::error::{EtlError, Result};
use lalf::esri::{apply_edits, service_request, total_count, AuthSettings, TokenBroker, MUTATION_BATCH_SIZE};
use lalf::sync::WKID_GDA94;
use reqwest::{Client, Method};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

const LOAD_BATCH_SIZE: usize = 10_000;

#[derive(Parser)]
#[command(about = "Bulk utilities for the LALF geocode collection")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Seed the geocode collection from a CSV export, tracking progress in a
    /// local staging database so an interrupted load resumes where it left
    /// off.
    Load {
        #[arg(long, default_value = "geocodes_for_esri.csv")]
        csv_file: PathBuf,
        #[arg(long, default_value = "geocode_load.db")]
        database: PathBuf,
        #[arg(long, default_value_t = 5)]
        max_workers: usize,
    },
    /// Delete previously loaded LALF geocodes in batches until none remain.
    Purge,
}

/// Everything a load worker needs besides its batch of rows.
#[derive(Clone)]
struct ServiceContext {
    auth: AuthSettings,
    query_url: String,
    apply_edits_url: String,
    http_timeout_in_seconds: u64,
    retry_budget_seconds: u64,
}

impl ServiceContext {
    fn from_conf(env_conf: &EnvConfigSettings) -> Self {
        Self {
            auth: AuthSettings::from_conf(env_conf),
            query_url: env_conf.geocode_urls.query.clone(),
            apply_edits_url: env_conf.geocode_urls.apply_edits.clone(),
            http_timeout_in_seconds: env_conf.http_timeout_in_seconds,
            retry_budget_seconds: env_conf.http_retry_max_time_in_seconds,
        }
    }

    fn build_client(&self) -> Result<Client> {
        Client::builder()
            .timeout(Duration::from_secs(self.http_timeout_in_seconds))
            .build()
            .map_err(|e| EtlError::Internal(format!("unable to build HTTP client: {e}")))
    }
}

#[derive(Debug, Deserialize)]
struct GeocodeCsvRow {
    geocode_type: Option<String>,
    address_pid: Option<String>,
    property_name: Option<String>,
    building_name: Option<String>,
    comments: Option<String>,
    assoc_lotplans: Option<String>,
    geocode_source: Option<String>,
    address: Option<String>,
    address_status: Option<String>,
    longitude: f64,
    latitude: f64,
}

#[derive(Debug, Clone)]
struct GeocodeLoadRow {
    rowid: i64,
    geocode_type: Option<String>,
    address_pid: Option<i64>,
    property_name: Option<String>,
    building_name: Option<String>,
    comments: Option<String>,
    assoc_lotplans: Option<String>,
    geocode_source: Option<String>,
    address: Option<String>,
    address_status: Option<String>,
    longitude: f64,
    latitude: f64,
}

impl GeocodeLoadRow {
    fn as_add_record(&self) -> Value {
        json!({
            "attributes": {
                "geocode_type": self.geocode_type,
                "address_pid": self.address_pid,
                "property_name": self.property_name,
                "building_name": self.building_name,
                "comments": self.comments,
                "assoc_lotplans": self.assoc_lotplans,
                "geocode_source": self.geocode_source,
                "address": self.address,
                "address_status": self.address_status,
                "longitude": self.longitude,
                "latitude": self.latitude,
            },
            "geometry": {
                "x": self.longitude,
                "y": self.latitude,
                "z": 0,
                "spatialReference": {"wkid": WKID_GDA94},
            },
        })
    }
}

fn open_staging_db(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")?;
    Ok(conn)
}

fn create_geocode_load_table(conn: &Connection) -> Result<()> {
    info!("Creating geocode table");
    conn.execute(
        "CREATE TABLE geocode (
            geocode_type TEXT,
            address_pid INTEGER,
            property_name TEXT,
            building_name TEXT,
            comments TEXT,
            assoc_lotplans TEXT,
            geocode_source TEXT,
            address TEXT,
            address_status TEXT,
            longitude REAL,
            latitude REAL,
            loaded BOOLEAN DEFAULT FALSE
        )",
        [],
    )?;
    Ok(())
}

fn insert_geocodes_from_csv(csv_file: &Path, conn: &Connection) -> Result<usize> {
    info!("Loading geocodes from {}", csv_file.display());
    let mut reader = csv::Reader::from_path(csv_file)
        .map_err(|e| EtlError::Internal(format!("unable to read {}: {e}", csv_file.display())))?;
    let mut stmt = conn.prepare(
        "INSERT INTO geocode (
            geocode_type, address_pid, property_name, building_name, comments,
            assoc_lotplans, geocode_source, address, address_status, longitude, latitude
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
    )?;
    let mut inserted = 0;
    for record in reader.deserialize::<GeocodeCsvRow>() {
        let row =
            record.map_err(|e| EtlError::SerDe(format!("invalid geocode CSV row: {e}")))?;
        stmt.execute(params![
            row.geocode_type,
            row.address_pid,
            row.property_name,
            row.building_name,
            row.comments,
            row.assoc_lotplans,
            row.geocode_source,
            row.address,
            row.address_status,
            row.longitude,
            row.latitude,
        ])?;
        inserted += 1;
    }
    info!("Loaded {inserted} geocodes into geocode table");
    Ok(inserted)
}

fn not_loaded_geocodes(conn: &Connection) -> Result<Vec<GeocodeLoadRow>> {
    let mut stmt = conn.prepare("SELECT rowid, * FROM geocode WHERE loaded = FALSE")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(GeocodeLoadRow {
                rowid: row.get("rowid")?,
                geocode_type: row.get("geocode_type")?,
                address_pid: row.get("address_pid")?,
                property_name: row.get("property_name")?,
                building_name: row.get("building_name")?,
                comments: row.get("comments")?,
                assoc_lotplans: row.get("assoc_lotplans")?,
                geocode_source: row.get("geocode_source")?,
                address: row.get("address")?,
                address_status: row.get("address_status")?,
                longitude: row.get("longitude")?,
                latitude: row.get("latitude")?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Pushes one batch and marks it loaded. Each worker obtains its own token,
/// opens its own database handle, and commits independently; writers
/// serialise at the database file.
async fn load_geocodes(
    job_id: usize,
    rows: Vec<GeocodeLoadRow>,
    database: PathBuf,
    context: ServiceContext,
) -> Result<()> {
    info!("Loading geocodes for job {job_id} with {} rows", rows.len());

    let client = context.build_client()?;
    let broker = TokenBroker::new(client.clone(), context.auth.clone(), context.retry_budget_seconds);
    let records: Vec<Value> = rows.iter().map(GeocodeLoadRow::as_add_record).collect();
    let adds = serde_json::to_string(&records)?;
    broker
        .with_token(|token| {
            apply_edits(
                &client,
                context.retry_budget_seconds,
                &context.apply_edits_url,
                token,
                Some(adds.clone()),
                None,
            )
        })
        .await?;

    let conn = open_staging_db(&database)?;
    let placeholders: Vec<&str> = rows.iter().map(|_| "?").collect();
    conn.execute(
        &format!(
            "UPDATE geocode SET loaded = TRUE WHERE rowid IN ({})",
            placeholders.join(", ")
        ),
        params_from_iter(rows.iter().map(|row| row.rowid)),
    )?;

    info!("Loaded geocodes for job {job_id} with {} rows", rows.len());
    Ok(())
}

async fn run_load(
    csv_file: &Path,
    database: &Path,
    max_workers: usize,
    context: ServiceContext,
) -> Result<()> {
    let conn = open_staging_db(database)?;

    // Only load the CSV when the staging table does not exist yet, so a
    // rerun picks up where the previous load stopped.
    let table_exists: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'geocode'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    if table_exists.is_none() {
        info!("Table does not exist, create table and load geocodes from csv");
        create_geocode_load_table(&conn)?;
        insert_geocodes_from_csv(csv_file, &conn)?;
    } else {
        info!("Table exists, skipping table creation and loading geocodes from csv");
    }

    let geocodes = not_loaded_geocodes(&conn)?;
    drop(conn);
    info!("Found {} geocodes to load", geocodes.len());

    let chunks: Vec<Vec<GeocodeLoadRow>> = geocodes
        .chunks(LOAD_BATCH_SIZE)
        .map(|chunk| chunk.to_vec())
        .collect();
    info!("Split into {} chunks for processing", chunks.len());

    let mut join_set = tokio::task::JoinSet::new();
    let mut errors = Vec::new();
    for (job_id, chunk) in chunks.into_iter().enumerate() {
        while join_set.len() >= max_workers {
            collect_outcome(join_set.join_next().await, &mut errors);
        }
        join_set.spawn(load_geocodes(
            job_id,
            chunk,
            database.to_path_buf(),
            context.clone(),
        ));
    }
    while !join_set.is_empty() {
        collect_outcome(join_set.join_next().await, &mut errors);
    }

    if !errors.is_empty() {
        for err in &errors {
            error!("Error: {err}");
        }
        return Err(EtlError::RemoteFatal(format!(
            "{} geocode load jobs failed",
            errors.len()
        )));
    }
    Ok(())
}

fn collect_outcome(
    outcome: Option<std::result::Result<Result<()>, tokio::task::JoinError>>,
    errors: &mut Vec<EtlError>,
) {
    match outcome {
        Some(Ok(Ok(()))) => {}
        Some(Ok(Err(err))) => errors.push(err),
        Some(Err(join_err)) => errors.push(EtlError::Internal(join_err.to_string())),
        None => {}
    }
}

/// Deletes LALF geocodes from the service in batches until none are left.
async fn run_purge(context: ServiceContext) -> Result<()> {
    let client = context.build_client()?;
    let broker = TokenBroker::new(client.clone(), context.auth.clone(), context.retry_budget_seconds);
    let where_clause = "geocode_source = 'LALF'";

    loop {
        let remaining = broker
            .with_token(|token| {
                total_count(
                    &client,
                    context.retry_budget_seconds,
                    &context.query_url,
                    where_clause,
                    token,
                )
            })
            .await?;
        info!("Total geocodes with source as LALF: {remaining}");
        if remaining == 0 {
            break;
        }

        let object_ids = broker
            .with_token(|token| {
                fetch_object_ids(&client, &context, where_clause, token)
            })
            .await?;
        if object_ids.is_empty() {
            break;
        }

        let deletes = serde_json::to_string(&object_ids)?;
        broker
            .with_token(|token| {
                apply_edits(
                    &client,
                    context.retry_budget_seconds,
                    &context.apply_edits_url,
                    token,
                    None,
                    Some(deletes.clone()),
                )
            })
            .await?;
        info!("Deleted {} geocodes", object_ids.len());
    }
    Ok(())
}

async fn fetch_object_ids(
    client: &Client,
    context: &ServiceContext,
    where_clause: &str,
    token: String,
) -> Result<Vec<i64>> {
    let params = [
        ("where", where_clause.to_string()),
        ("outFields", "objectid".to_string()),
        ("returnGeometry", "false".to_string()),
        ("f", "json".to_string()),
        ("resultOffset", "0".to_string()),
        ("resultRecordCount", MUTATION_BATCH_SIZE.to_string()),
        ("token", token),
    ];
    let value = service_request(
        client,
        context.retry_budget_seconds,
        Method::GET,
        &context.query_url,
        &params,
    )
    .await?;
    let features = value
        .get("features")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    features
        .iter()
        .map(|feature| {
            feature
                .pointer("/attributes/objectid")
                .and_then(Value::as_i64)
                .ok_or_else(|| EtlError::RemoteFatal("objectid missing from query response".into()))
        })
        .collect()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let env_conf = EnvConfigSettings::init();
    let context = ServiceContext::from_conf(&env_conf);

    let started = Instant::now();
    let outcome = match cli.command {
        Command::Load {
            csv_file,
            database,
            max_workers,
        } => run_load(&csv_file, &database, max_workers, context).await,
        Command::Purge => run_purge(context).await,
    };
    if let Err(err) = outcome {
        error!("Error: {err}");
        std::process::exit(1);
    }
    info!("Total time taken: {:.2} seconds", started.elapsed().as_secs_f64());
}
