use lalf::error::Result;
use lalf::store::metadata::create_metadata_table;
use rusqlite::Connection;
use tracing::info;

/// The columns pushed to the location-address collection, in declared order.
/// The content hash stays local to the snapshot.
pub const PUSH_COLUMNS: &[&str] = &[
    "lot",
    "plan",
    "address",
    "unit_number",
    "unit_type",
    "street_number",
    "street_name",
    "street_type",
    "state",
    "street_suffix",
    "property_name",
    "street_no_1",
    "street_no_1_suffix",
    "street_no_2",
    "street_no_2_suffix",
    "street_full",
    "locality",
    "local_authority",
    "address_status",
    "address_standard",
    "lotplan_status",
    "address_pid",
    "geocode_type",
    "latitude",
    "longitude",
];

const ADDRESS_COLUMNS_DDL: &str = "
    id TEXT,
    lot TEXT,
    plan TEXT,
    unit_type TEXT,
    unit_number TEXT,
    unit_suffix TEXT,
    floor_type TEXT,
    floor_number TEXT,
    floor_suffix TEXT,
    property_name TEXT,
    street_no_1 TEXT,
    street_no_1_suffix TEXT,
    street_no_2 TEXT,
    street_no_2_suffix TEXT,
    street_number TEXT,
    street_name TEXT,
    street_type TEXT,
    street_suffix TEXT,
    street_full TEXT,
    locality TEXT,
    local_authority TEXT,
    state TEXT,
    address TEXT,
    address_status TEXT,
    address_standard TEXT,
    lotplan_status TEXT,
    address_pid INTEGER,
    geocode_type TEXT,
    latitude REAL,
    longitude REAL
";

/// Create the tables required for the address ETL process:
///
/// - geocode - the geocode records pulled from the feature service.
/// - address_previous - the location address table from the previous run.
/// - address_current_staging - the rows extracted from the graph this run.
/// - address_current - the final table, staging joined with geocodes, with
///   the row hash used to diff against the previous run.
/// - address_current_loaded - tracks which rows have reached the service.
/// - metadata - start and end time for this run.
pub fn create_tables(conn: &Connection) -> Result<()> {
    info!("Creating geocode table");
    conn.execute(
        "CREATE TABLE geocode (
            geocode_id TEXT PRIMARY KEY,
            geocode_type TEXT,
            address_pid TEXT NOT NULL,
            longitude REAL,
            latitude REAL
        )",
        [],
    )?;

    info!("Creating address_previous table");
    conn.execute(
        &format!("CREATE TABLE IF NOT EXISTS address_previous ({ADDRESS_COLUMNS_DDL})"),
        [],
    )?;

    info!("Creating address_current_staging table");
    conn.execute(
        &format!("CREATE TABLE address_current_staging ({ADDRESS_COLUMNS_DDL})"),
        [],
    )?;

    info!("Creating address_current table");
    conn.execute(
        &format!("CREATE TABLE address_current ({ADDRESS_COLUMNS_DDL})"),
        [],
    )?;

    info!("Creating address_current_loaded table");
    conn.execute(
        "CREATE TABLE address_current_loaded (
            address_pid TEXT,
            loaded BOOLEAN DEFAULT FALSE
        )",
        [],
    )?;

    create_metadata_table(conn)?;
    Ok(())
}

/// Indexes are created after bulk insert to preserve load throughput.
pub fn create_table_indexes(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_address_current_staging_address_pid ON address_current_staging (address_pid);
         CREATE INDEX IF NOT EXISTS idx_geocode_address_pid ON geocode (address_pid);
         CREATE INDEX IF NOT EXISTS idx_address_current_address_pid ON address_current (address_pid);
         CREATE INDEX IF NOT EXISTS idx_address_current_id ON address_current (id);
         CREATE INDEX IF NOT EXISTS idx_address_previous_address_pid ON address_previous (address_pid);
         CREATE INDEX IF NOT EXISTS idx_address_previous_id ON address_previous (id);",
    )?;
    Ok(())
}

/// Joins staging with geocodes into address_current. Inner join semantics:
/// a staged address without any geocode does not make it into the snapshot,
/// and one with several geocodes lands once per geocode.
pub fn populate_address_current_table(conn: &Connection) -> Result<()> {
    info!("Populating address_current from staging and geocodes");
    conn.execute(
        "INSERT INTO address_current
         SELECT
             a.id,
             a.lot,
             a.plan,
             a.unit_type,
             a.unit_number,
             a.unit_suffix,
             a.floor_type,
             a.floor_number,
             a.floor_suffix,
             a.property_name,
             a.street_no_1,
             a.street_no_1_suffix,
             a.street_no_2,
             a.street_no_2_suffix,
             a.street_number,
             a.street_name,
             a.street_type,
             a.street_suffix,
             a.street_full,
             a.locality,
             a.local_authority,
             a.state,
             a.address,
             a.address_status,
             a.address_standard,
             a.lotplan_status,
             a.address_pid,
             g.geocode_type,
             g.latitude,
             g.longitude
         FROM address_current_staging a
         JOIN geocode g ON a.address_pid = g.address_pid",
        [],
    )?;
    Ok(())
}
