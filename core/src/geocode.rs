use std::time::Instant;

use chrono::{DateTime, FixedOffset};
use reqwest::Client;
use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::info;

use crate::error::{EtlError, Result};
use crate::esri::{Feature, OffsetPager, PageQuery, TokenBroker, MUTATION_BATCH_SIZE};
use crate::store::{BatchCommitter, COMMIT_EVERY_CHUNKS};
use crate::time_convert::esri_watermark;

/// Geocodes derived from building outlines and ASA bulk loads are not part
/// of this dataset, and hidden geocodes are excluded outright.
pub const GEOCODE_SOURCE_FILTER: &str = "(geocode_status IS NULL OR geocode_status <> 'H') \
AND LOWER(geocode_source) NOT LIKE 'derived from geoscape buildings%' \
AND LOWER(geocode_source) NOT LIKE 'asa geocodes%'";

/// Builds the geocode pull predicate: the source filter plus, when a previous
/// run supplies a watermark, an incremental `last_edited_date` bound.
pub fn incremental_where_clause(watermark: Option<DateTime<FixedOffset>>) -> String {
    match watermark {
        Some(watermark) => format!(
            "{GEOCODE_SOURCE_FILTER} AND last_edited_date >= DATE '{}'",
            esri_watermark(watermark)
        ),
        None => GEOCODE_SOURCE_FILTER.to_string(),
    }
}

/// Which pipeline's geocode table receives the pulled records.
#[derive(Debug, Clone, Copy)]
pub enum GeocodeTarget {
    LocationAddress,
    Pls,
}

impl GeocodeTarget {
    /// Geocodes are keyed by the remote object id: present rows carried over
    /// from the previous snapshot are updated in place, new ones inserted.
    fn upsert_sql(&self) -> &'static str {
        match self {
            GeocodeTarget::LocationAddress => {
                "INSERT INTO geocode (geocode_id, geocode_type, address_pid, longitude, latitude)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(geocode_id) DO UPDATE SET
                     geocode_type = excluded.geocode_type,
                     address_pid = excluded.address_pid,
                     longitude = excluded.longitude,
                     latitude = excluded.latitude"
            }
            GeocodeTarget::Pls => {
                "INSERT INTO lf_geocode_sp_survey_point
                     (geocode_id, geocode_type, address_pid, site_id, centoid_lat, centoid_lon, hash)
                 VALUES (?1, ?2, ?3, NULL, ?5, ?4, NULL)
                 ON CONFLICT(geocode_id) DO UPDATE SET
                     geocode_type = excluded.geocode_type,
                     address_pid = excluded.address_pid,
                     centoid_lat = excluded.centoid_lat,
                     centoid_lon = excluded.centoid_lon"
            }
        }
    }
}

fn attribute_string(feature: &Feature, key: &str) -> Option<String> {
    match feature.attributes.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(text.clone()),
        Some(other) => Some(other.to_string()),
    }
}

fn upsert_features(
    conn: &Connection,
    target: GeocodeTarget,
    features: &[Feature],
) -> Result<()> {
    let mut stmt = conn.prepare_cached(target.upsert_sql())?;
    for feature in features {
        let objectid = feature
            .attributes
            .get("objectid")
            .and_then(Value::as_i64)
            .ok_or_else(|| EtlError::DataIntegrity("geocode feature without objectid".into()))?;
        let address_pid = attribute_string(feature, "address_pid").ok_or_else(|| {
            EtlError::DataIntegrity(format!("geocode {objectid} has no address_pid"))
        })?;
        let geocode_type = attribute_string(feature, "geocode_type");
        let geometry = feature.geometry.ok_or_else(|| {
            EtlError::DataIntegrity(format!("geocode {objectid} has no geometry"))
        })?;
        stmt.execute(params![
            objectid,
            geocode_type,
            address_pid,
            geometry.x,
            geometry.y
        ])?;
    }
    Ok(())
}

/// Pulls the geocodes matching `where_clause` from the feature service and
/// upserts them into the pipeline's geocode table, committing every few
/// batches.
pub async fn import_geocodes(
    client: &Client,
    broker: &TokenBroker,
    retry_budget_seconds: u64,
    query_url: &str,
    where_clause: String,
    conn: &Connection,
    target: GeocodeTarget,
) -> Result<u64> {
    let started = Instant::now();
    let mut pager = OffsetPager::start(PageQuery {
        client,
        broker,
        retry_budget_seconds,
        query_url,
        where_clause,
        out_fields: "objectid,geocode_type,address_pid",
        return_geometry: true,
        batch_size: MUTATION_BATCH_SIZE,
    })
    .await?;
    info!("Fetching {} geocodes", pager.total());

    let mut committer = BatchCommitter::new(conn, COMMIT_EVERY_CHUNKS);
    let mut imported = 0u64;
    while let Some((batch_index, total_batches, features)) = pager.next_batch().await? {
        info!("Processing geocode batch {} of {total_batches}", batch_index + 1);
        committer.ensure_transaction()?;
        upsert_features(conn, target, &features)?;
        imported += features.len() as u64;
        committer.batch_done()?;
    }
    committer.flush()?;

    info!(
        "Geocodes loaded successfully ({imported} records) in {:.2} seconds",
        started.elapsed().as_secs_f64()
    );
    Ok(imported)
}
