use lalf::error::Result;
use lalf::store::id_map::create_id_map_table;
use lalf::store::metadata::create_metadata_table;
use rusqlite::Connection;
use tracing::info;

/// The entity tables that are diffed and synced, in snapshot order.
pub const ID_MAP_TABLES: &[&str] = &[
    "lf_road_id_map",
    "lf_parcel_id_map",
    "lf_site_id_map",
    "lf_place_name_id_map",
    "lf_address_id_map",
];

fn create_locality_tables(conn: &Connection) -> Result<()> {
    info!("Creating local_auth table");
    conn.execute(
        "CREATE TABLE local_auth (
            la_code INTEGER PRIMARY KEY,
            la_name TEXT CHECK (length(la_name) <= 40) NOT NULL,
            hash TEXT
        )",
        [],
    )?;

    info!("Creating locality table");
    conn.execute(
        "CREATE TABLE locality (
            locality_code TEXT PRIMARY KEY CHECK (length(locality_code) <= 20),
            locality_name TEXT CHECK (length(locality_name) <= 40) NOT NULL,
            locality_type TEXT CHECK (length(locality_type) <= 5) NOT NULL,
            la_code INTEGER NOT NULL,
            state TEXT CHECK (state = 'QLD') NOT NULL,
            status TEXT CHECK (length(status) = 1) NOT NULL,
            hash TEXT,
            FOREIGN KEY (la_code) REFERENCES local_auth(la_code) ON UPDATE CASCADE
        )",
        [],
    )?;
    Ok(())
}

fn create_road_tables(conn: &Connection) -> Result<()> {
    info!("Creating lf_road table");
    conn.execute(
        "CREATE TABLE lf_road (
            road_id TEXT PRIMARY KEY,
            road_cat TEXT CHECK (length(road_cat) <= 20),
            road_name TEXT CHECK (length(road_name) <= 50) NOT NULL,
            road_name_suffix TEXT CHECK (length(road_name_suffix) <= 30),
            road_name_type TEXT CHECK (length(road_name_type) <= 20),
            locality_code TEXT NOT NULL,
            road_cat_desc TEXT CHECK (length(road_cat_desc) = 1) NOT NULL,
            hash TEXT,
            FOREIGN KEY (locality_code) REFERENCES locality(locality_code) ON UPDATE CASCADE
        )",
        [],
    )?;
    create_id_map_table(conn, "lf_road_id_map")?;
    Ok(())
}

fn create_parcel_tables(conn: &Connection) -> Result<()> {
    info!("Creating lf_parcel table");
    conn.execute(
        "CREATE TABLE lf_parcel (
            parcel_id TEXT PRIMARY KEY,
            plan_no TEXT CHECK (length(plan_no) <= 10),
            lot_no TEXT CHECK (length(lot_no) <= 5),
            hash TEXT
        )",
        [],
    )?;
    create_id_map_table(conn, "lf_parcel_id_map")?;
    Ok(())
}

fn create_site_tables(conn: &Connection) -> Result<()> {
    info!("Creating lf_site table");
    conn.execute(
        "CREATE TABLE lf_site (
            site_id TEXT PRIMARY KEY,
            parent_site_id TEXT,
            site_type TEXT CHECK (length(site_type) <= 50) NOT NULL,
            parcel_id TEXT NOT NULL,
            hash TEXT,
            FOREIGN KEY (parent_site_id) REFERENCES lf_site(site_id) ON UPDATE CASCADE,
            FOREIGN KEY (parcel_id) REFERENCES lf_parcel(parcel_id) ON UPDATE CASCADE
        )",
        [],
    )?;
    create_id_map_table(conn, "lf_site_id_map")?;
    Ok(())
}

fn create_geocode_tables(conn: &Connection) -> Result<()> {
    info!("Creating lf_geocode_sp_survey_point table");
    // The site FK comes later: the geocode service only carries address_pid,
    // so site_id is joined in once addresses are loaded, then the table is
    // rebuilt with the constraint.
    conn.execute(
        "CREATE TABLE lf_geocode_sp_survey_point (
            geocode_id TEXT PRIMARY KEY,
            geocode_type TEXT CHECK (length(geocode_type) <= 4) NOT NULL,
            address_pid TEXT NOT NULL,
            site_id TEXT,
            centoid_lat REAL NOT NULL,
            centoid_lon REAL NOT NULL,
            hash TEXT
        )",
        [],
    )?;
    Ok(())
}

fn create_place_name_tables(conn: &Connection) -> Result<()> {
    info!("Creating lf_place_name table");
    conn.execute(
        "CREATE TABLE lf_place_name (
            place_name_id TEXT PRIMARY KEY,
            pl_name_status_code TEXT CHECK (length(pl_name_status_code) = 1) NOT NULL,
            pl_name_type_code TEXT CHECK (length(pl_name_type_code) <= 4) NOT NULL,
            pl_name TEXT CHECK (length(pl_name) <= 50) NOT NULL,
            site_id TEXT NOT NULL,
            hash TEXT
        )",
        [],
    )?;
    create_id_map_table(conn, "lf_place_name_id_map")?;
    Ok(())
}

fn create_address_tables(conn: &Connection) -> Result<()> {
    info!("Creating lf_address table");
    conn.execute(
        "CREATE TABLE lf_address (
            address_pid TEXT NOT NULL,
            parcel_id TEXT NOT NULL,
            addr_id TEXT PRIMARY KEY,
            addr_status_code TEXT CHECK (length(addr_status_code) = 1) NOT NULL,
            unit_type TEXT CHECK (length(unit_type) <= 50),
            unit_no TEXT CHECK (length(unit_no) <= 5),
            unit_suffix TEXT CHECK (length(unit_suffix) <= 1),
            level_type TEXT CHECK (length(level_type) <= 20),
            level_no TEXT CHECK (length(level_no) <= 20),
            level_suffix TEXT CHECK (length(level_suffix) <= 5),
            street_no_first TEXT CHECK (length(street_no_first) <= 10),
            street_no_first_suffix TEXT CHECK (length(street_no_first_suffix) <= 10),
            street_no_last TEXT CHECK (length(street_no_last) <= 10),
            street_no_last_suffix TEXT CHECK (length(street_no_last_suffix) <= 10),
            road_id TEXT NOT NULL,
            site_id TEXT NOT NULL,
            location_desc TEXT CHECK (length(location_desc) <= 50),
            address_standard TEXT CHECK (length(address_standard) <= 10) NOT NULL,
            hash TEXT,
            FOREIGN KEY (parcel_id) REFERENCES lf_parcel(parcel_id) ON UPDATE CASCADE,
            FOREIGN KEY (road_id) REFERENCES lf_road(road_id) ON UPDATE CASCADE,
            FOREIGN KEY (site_id) REFERENCES lf_site(site_id) ON UPDATE CASCADE
        )",
        [],
    )?;
    create_id_map_table(conn, "lf_address_id_map")?;
    Ok(())
}

/// The previous-run baseline and per-record publication queue for every
/// synced entity. Previous tables are loaded verbatim from the downloaded
/// snapshot and never mutated, so they carry no constraints.
fn create_previous_and_loaded_tables(conn: &Connection) -> Result<()> {
    let specs: &[(&str, &str, &str)] = &[
        ("local_auth", "la_code INTEGER, la_name TEXT, hash TEXT", "la_code INTEGER"),
        (
            "locality",
            "locality_code TEXT, locality_name TEXT, locality_type TEXT,
             la_code INTEGER, state TEXT, status TEXT, hash TEXT",
            "locality_code TEXT",
        ),
        (
            "lf_road",
            "road_id INTEGER, road_cat TEXT, road_name TEXT, road_name_suffix TEXT,
             road_name_type TEXT, locality_code TEXT, road_cat_desc TEXT, hash TEXT",
            "road_id INTEGER",
        ),
        (
            "lf_parcel",
            "parcel_id INTEGER, plan_no TEXT, lot_no TEXT, hash TEXT",
            "parcel_id INTEGER",
        ),
        (
            "lf_site",
            "site_id INTEGER, parent_site_id INTEGER, site_type TEXT, parcel_id INTEGER, hash TEXT",
            "site_id INTEGER",
        ),
        (
            "lf_address",
            "address_pid TEXT, parcel_id INTEGER, addr_id INTEGER, addr_status_code TEXT,
             unit_type TEXT, unit_no TEXT, unit_suffix TEXT, level_type TEXT, level_no TEXT,
             level_suffix TEXT, street_no_first TEXT, street_no_first_suffix TEXT,
             street_no_last TEXT, street_no_last_suffix TEXT, road_id INTEGER, site_id INTEGER,
             location_desc TEXT, address_standard TEXT, hash TEXT",
            "addr_id INTEGER",
        ),
        (
            "lf_geocode_sp_survey_point",
            "geocode_id TEXT, geocode_type TEXT, address_pid TEXT, site_id INTEGER,
             centoid_lat REAL, centoid_lon REAL, hash TEXT",
            "geocode_id TEXT",
        ),
    ];
    for (table, previous_columns, key_column) in specs {
        info!("Creating {table}_previous and {table}_loaded tables");
        conn.execute(
            &format!("CREATE TABLE {table}_previous ({previous_columns})"),
            [],
        )?;
        conn.execute(
            &format!(
                "CREATE TABLE {table}_loaded (
                    {key_column},
                    loaded BOOLEAN DEFAULT FALSE
                )"
            ),
            [],
        )?;
    }
    Ok(())
}

pub fn create_tables(conn: &Connection) -> Result<()> {
    create_locality_tables(conn)?;
    create_road_tables(conn)?;
    create_parcel_tables(conn)?;
    create_site_tables(conn)?;
    create_geocode_tables(conn)?;
    create_place_name_tables(conn)?;
    create_address_tables(conn)?;
    create_previous_and_loaded_tables(conn)?;
    create_metadata_table(conn)?;
    Ok(())
}

/// Indexes are created after bulk load and the id-map rewrite; the rebuilds
/// in the rewrite drop any index created earlier.
pub fn create_table_indexes(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_locality_la_code ON locality (la_code);
         CREATE INDEX IF NOT EXISTS idx_lf_road_locality_code ON lf_road (locality_code);
         CREATE INDEX IF NOT EXISTS idx_lf_site_parcel_id ON lf_site (parcel_id);
         CREATE INDEX IF NOT EXISTS idx_lf_site_parent_site_id ON lf_site (parent_site_id);
         CREATE INDEX IF NOT EXISTS idx_lf_place_name_site_id ON lf_place_name (site_id);
         CREATE INDEX IF NOT EXISTS idx_lf_address_address_pid ON lf_address (address_pid);
         CREATE INDEX IF NOT EXISTS idx_lf_address_parcel_id ON lf_address (parcel_id);
         CREATE INDEX IF NOT EXISTS idx_lf_address_road_id ON lf_address (road_id);
         CREATE INDEX IF NOT EXISTS idx_lf_address_site_id ON lf_address (site_id);
         CREATE INDEX IF NOT EXISTS idx_lf_geocode_sp_survey_point_address_pid ON lf_geocode_sp_survey_point (address_pid);
         CREATE INDEX IF NOT EXISTS idx_lf_geocode_sp_survey_point_site_id ON lf_geocode_sp_survey_point (site_id);",
    )?;
    Ok(())
}

/// Joins each geocode to its site through the address table, then rebuilds
/// the geocode table with site_id mandatory and constrained. Geocodes with
/// no matching address drop out of the snapshot here.
pub fn update_geocode_site_id(conn: &Connection) -> Result<()> {
    info!("Updating geocode table with site_id");
    conn.execute(
        "UPDATE lf_geocode_sp_survey_point
         SET site_id = (
             SELECT site_id FROM lf_address
             WHERE lf_address.address_pid = lf_geocode_sp_survey_point.address_pid
         )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE lf_geocode_sp_survey_point_new (
            geocode_id TEXT PRIMARY KEY,
            geocode_type TEXT CHECK (length(geocode_type) <= 4) NOT NULL,
            address_pid TEXT NOT NULL,
            site_id INTEGER NOT NULL,
            centoid_lat REAL NOT NULL,
            centoid_lon REAL NOT NULL,
            hash TEXT,
            FOREIGN KEY (site_id) REFERENCES lf_site(site_id) ON UPDATE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "INSERT INTO lf_geocode_sp_survey_point_new
         SELECT * FROM lf_geocode_sp_survey_point
         WHERE site_id IS NOT NULL",
        [],
    )?;
    conn.execute("DROP TABLE lf_geocode_sp_survey_point", [])?;
    conn.execute(
        "ALTER TABLE lf_geocode_sp_survey_point_new RENAME TO lf_geocode_sp_survey_point",
        [],
    )?;
    Ok(())
}
