use lalf::conf::EnvConfigSettings;
use lalf::error::Result;
use lalf::store::diff::{compute_table_diff, log_diff, TableDiff};
use lalf::sync::{EntitySync, GeometryColumns, SyncEngine};
use rusqlite::Connection;

const LOCAL_AUTH_COLUMNS: &[&str] = &["la_code", "la_name"];
const LOCALITY_COLUMNS: &[&str] = &[
    "locality_code",
    "locality_name",
    "locality_type",
    "la_code",
    "state",
    "status",
];
const ROAD_COLUMNS: &[&str] = &[
    "road_id",
    "road_name",
    "road_name_suffix",
    "road_name_type",
    "locality_code",
    "road_cat_desc",
];
const PARCEL_COLUMNS: &[&str] = &["parcel_id", "plan_no", "lot_no"];
const SITE_COLUMNS: &[&str] = &["site_id", "parent_site_id", "site_type", "parcel_id"];
const ADDRESS_COLUMNS: &[&str] = &[
    "address_pid",
    "parcel_id",
    "addr_id",
    "addr_status_code",
    "unit_type",
    "unit_no",
    "unit_suffix",
    "level_type",
    "level_no",
    "level_suffix",
    "street_no_first",
    "street_no_first_suffix",
    "street_no_last",
    "street_no_last_suffix",
    "road_id",
    "site_id",
    "location_desc",
    "address_standard",
];
const GEOCODE_COLUMNS: &[&str] = &[
    "geocode_id",
    "geocode_type",
    "address_pid",
    "site_id",
    "centoid_lat",
    "centoid_lon",
];

/// One synced PLS entity: the remote collection mapping plus the local
/// previous-snapshot table it diffs against.
pub struct PlsEntity<'a> {
    pub sync: EntitySync<'a>,
    pub previous_table: &'a str,
}

/// The synced entities in foreign-key order: inserts are applied in this
/// order (referenced entities first), deletes in reverse.
pub fn entities(env_conf: &EnvConfigSettings) -> Vec<PlsEntity<'_>> {
    vec![
        PlsEntity {
            sync: EntitySync {
                name: "local_auth",
                table: "local_auth",
                loaded_table: "local_auth_loaded",
                key_column: "la_code",
                push_columns: LOCAL_AUTH_COLUMNS,
                geometry: None,
                query_url: &env_conf.pls_local_auth_urls.query,
                apply_edits_url: &env_conf.pls_local_auth_urls.apply_edits,
            },
            previous_table: "local_auth_previous",
        },
        PlsEntity {
            sync: EntitySync {
                name: "locality",
                table: "locality",
                loaded_table: "locality_loaded",
                key_column: "locality_code",
                push_columns: LOCALITY_COLUMNS,
                geometry: None,
                query_url: &env_conf.pls_locality_urls.query,
                apply_edits_url: &env_conf.pls_locality_urls.apply_edits,
            },
            previous_table: "locality_previous",
        },
        PlsEntity {
            sync: EntitySync {
                name: "road",
                table: "lf_road",
                loaded_table: "lf_road_loaded",
                key_column: "road_id",
                push_columns: ROAD_COLUMNS,
                geometry: None,
                query_url: &env_conf.pls_road_urls.query,
                apply_edits_url: &env_conf.pls_road_urls.apply_edits,
            },
            previous_table: "lf_road_previous",
        },
        PlsEntity {
            sync: EntitySync {
                name: "parcel",
                table: "lf_parcel",
                loaded_table: "lf_parcel_loaded",
                key_column: "parcel_id",
                push_columns: PARCEL_COLUMNS,
                geometry: None,
                query_url: &env_conf.pls_parcel_urls.query,
                apply_edits_url: &env_conf.pls_parcel_urls.apply_edits,
            },
            previous_table: "lf_parcel_previous",
        },
        PlsEntity {
            sync: EntitySync {
                name: "site",
                table: "lf_site",
                loaded_table: "lf_site_loaded",
                key_column: "site_id",
                push_columns: SITE_COLUMNS,
                geometry: None,
                query_url: &env_conf.pls_site_urls.query,
                apply_edits_url: &env_conf.pls_site_urls.apply_edits,
            },
            previous_table: "lf_site_previous",
        },
        PlsEntity {
            sync: EntitySync {
                name: "address",
                table: "lf_address",
                loaded_table: "lf_address_loaded",
                key_column: "addr_id",
                push_columns: ADDRESS_COLUMNS,
                geometry: None,
                query_url: &env_conf.pls_address_urls.query,
                apply_edits_url: &env_conf.pls_address_urls.apply_edits,
            },
            previous_table: "lf_address_previous",
        },
        PlsEntity {
            sync: EntitySync {
                name: "geocode",
                table: "lf_geocode_sp_survey_point",
                loaded_table: "lf_geocode_sp_survey_point_loaded",
                key_column: "geocode_id",
                push_columns: GEOCODE_COLUMNS,
                geometry: Some(GeometryColumns {
                    longitude: "centoid_lon",
                    latitude: "centoid_lat",
                }),
                query_url: &env_conf.pls_geocode_urls.query,
                apply_edits_url: &env_conf.pls_geocode_urls.apply_edits,
            },
            previous_table: "lf_geocode_sp_survey_point_previous",
        },
    ]
}

pub fn compute_diffs(conn: &Connection, entities: &[PlsEntity<'_>]) -> Result<Vec<TableDiff>> {
    let mut diffs = Vec::with_capacity(entities.len());
    for entity in entities {
        let diff = compute_table_diff(
            conn,
            "hash",
            entity.sync.key_column,
            entity.previous_table,
            entity.sync.table,
        )?;
        log_diff(entity.sync.table, &diff);
        diffs.push(diff);
    }
    Ok(diffs)
}

/// Applies the diffs: deletes leaves-first (reverse entity order), then
/// inserts referenced entities first.
pub async fn apply_sync(
    conn: &Connection,
    engine: &SyncEngine<'_>,
    entities: &[PlsEntity<'_>],
    diffs: &[TableDiff],
) -> Result<()> {
    for (entity, diff) in entities.iter().zip(diffs.iter()).rev() {
        engine.delete_records(&entity.sync, &diff.deleted).await?;
    }
    for (entity, diff) in entities.iter().zip(diffs.iter()) {
        engine
            .insert_records(conn, &entity.sync, &diff.to_insert())
            .await?;
    }
    Ok(())
}

/// Diffs every synced entity against the previous snapshot and converges the
/// remote collections.
pub async fn compute_diff_and_sync(
    conn: &Connection,
    engine: &SyncEngine<'_>,
    env_conf: &EnvConfigSettings,
) -> Result<()> {
    let entities = entities(env_conf);
    let diffs = compute_diffs(conn, &entities)?;
    apply_sync(conn, engine, &entities, &diffs).await
}

#[cfg(test)]
mod tests {
    use lalf::esri::{AuthSettings, TokenBroker};
    use rusqlite::types::Value as SqlValue;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn deletes_run_in_reverse_entity_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/generateToken"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": "t"})),
            )
            .mount(&server)
            .await;
        for layer in ["7", "8"] {
            Mock::given(method("POST"))
                .and(path(format!("/{layer}/query")))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "features": [{"attributes": {"objectid": 1}}]
                })))
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path(format!("/{layer}/applyEdits")))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "deleteResults": [{"success": true}]
                })))
                .mount(&server)
                .await;
        }

        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE parent_loaded (id INTEGER, loaded BOOLEAN DEFAULT FALSE);
             CREATE TABLE child_loaded (id INTEGER, loaded BOOLEAN DEFAULT FALSE);
             CREATE TABLE parent (id INTEGER, hash TEXT);
             CREATE TABLE child (id INTEGER, hash TEXT);",
        )
        .unwrap();

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
        let engine = SyncEngine::new(&client, &broker, 5);

        let parent_query = format!("{}/7/query", server.uri());
        let parent_edits = format!("{}/7/applyEdits", server.uri());
        let child_query = format!("{}/8/query", server.uri());
        let child_edits = format!("{}/8/applyEdits", server.uri());
        let ordered = [
            PlsEntity {
                sync: EntitySync {
                    name: "parent",
                    table: "parent",
                    loaded_table: "parent_loaded",
                    key_column: "id",
                    push_columns: &["id"],
                    geometry: None,
                    query_url: &parent_query,
                    apply_edits_url: &parent_edits,
                },
                previous_table: "parent",
            },
            PlsEntity {
                sync: EntitySync {
                    name: "child",
                    table: "child",
                    loaded_table: "child_loaded",
                    key_column: "id",
                    push_columns: &["id"],
                    geometry: None,
                    query_url: &child_query,
                    apply_edits_url: &child_edits,
                },
                previous_table: "child",
            },
        ];

        let diffs = [
            TableDiff {
                deleted: vec![SqlValue::Integer(1)],
                added: Vec::new(),
            },
            TableDiff {
                deleted: vec![SqlValue::Integer(2)],
                added: Vec::new(),
            },
        ];
        apply_sync(&conn, &engine, &ordered, &diffs).await.unwrap();

        // The child collection (layer 8) is emptied before the parent
        // collection (layer 7) is touched.
        let edit_paths: Vec<String> = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|request| request.url.path().ends_with("/applyEdits"))
            .map(|request| request.url.path().to_string())
            .collect();
        assert_eq!(edit_paths, ["/8/applyEdits", "/7/applyEdits"]);
    }

    #[test]
    fn entity_order_is_foreign_key_order() {
        let names = [
            "local_auth",
            "locality",
            "road",
            "parcel",
            "site",
            "address",
            "geocode",
        ];
        std::env::set_var("ETL_SPARQL_ENDPOINT", "http://localhost/sparql");
        std::env::set_var("ETL_ESRI_USERNAME", "user");
        std::env::set_var("ETL_ESRI_PASSWORD", "pass");
        let env_conf = EnvConfigSettings::init();
        let ordered: Vec<&str> = entities(&env_conf)
            .iter()
            .map(|entity| entity.sync.name)
            .collect();
        assert_eq!(ordered, names);
    }
}
