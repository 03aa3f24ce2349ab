use itertools::Itertools;
use reqwest::{Client, Method};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection};
use serde_json::{json, Value};
use tracing::info;

use crate::error::{EtlError, Result};
use crate::esri::{apply_edits, service_request, TokenBroker, MUTATION_BATCH_SIZE};
use crate::store::diff::TableDiff;

/// The geodetic datum for all geometries in this system (GDA94).
pub const WKID_GDA94: u32 = 4283;

/// Which columns of a spatial entity carry the point coordinates.
#[derive(Debug, Clone, Copy)]
pub struct GeometryColumns<'a> {
    pub longitude: &'a str,
    pub latitude: &'a str,
}

/// Describes how one snapshot entity maps onto its remote collection.
#[derive(Debug, Clone, Copy)]
pub struct EntitySync<'a> {
    pub name: &'a str,
    /// Current-snapshot table rows are pushed from.
    pub table: &'a str,
    /// Queue table tracking per-record publication progress.
    pub loaded_table: &'a str,
    pub key_column: &'a str,
    /// Columns pushed as ESRI attributes, in declared order.
    pub push_columns: &'a [&'a str],
    pub geometry: Option<GeometryColumns<'a>>,
    pub query_url: &'a str,
    pub apply_edits_url: &'a str,
}

/// Converges one remote collection onto the current snapshot: deletes in
/// business-id batches, then reinserts the union of added and deleted rows
/// through the `_loaded` queue so an interrupted run resumes without
/// double-insertion.
pub struct SyncEngine<'a> {
    client: &'a Client,
    broker: &'a TokenBroker,
    retry_budget_seconds: u64,
}

fn sql_to_json(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(integer) => Value::from(*integer),
        SqlValue::Real(real) => serde_json::Number::from_f64(*real)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        SqlValue::Text(text) => Value::from(text.clone()),
        SqlValue::Blob(blob) => Value::from(hex::encode(blob)),
    }
}

/// Renders business ids into an `IN (...)` list, single-quoting text ids.
/// Ids containing a quote are rejected rather than escaped.
pub fn sql_in_list(ids: &[SqlValue]) -> Result<String> {
    let mut rendered = Vec::with_capacity(ids.len());
    for id in ids {
        match id {
            SqlValue::Integer(integer) => rendered.push(integer.to_string()),
            SqlValue::Real(real) => rendered.push(real.to_string()),
            SqlValue::Text(text) => {
                if text.contains('\'') {
                    return Err(EtlError::DataIntegrity(format!(
                        "identifier contains a quote: {text}"
                    )));
                }
                rendered.push(format!("'{text}'"));
            }
            SqlValue::Null | SqlValue::Blob(_) => {
                return Err(EtlError::DataIntegrity(
                    "unsupported identifier type in delete batch".into(),
                ))
            }
        }
    }
    Ok(rendered.join(","))
}

impl<'a> SyncEngine<'a> {
    pub fn new(client: &'a Client, broker: &'a TokenBroker, retry_budget_seconds: u64) -> Self {
        Self {
            client,
            broker,
            retry_budget_seconds,
        }
    }

    /// Applies one entity's diff: deletions first, then the insert union.
    pub async fn sync_entity(
        &self,
        conn: &Connection,
        entity: &EntitySync<'_>,
        diff: &TableDiff,
    ) -> Result<()> {
        self.delete_records(entity, &diff.deleted).await?;
        self.insert_records(conn, entity, &diff.to_insert()).await
    }

    /// Deletes the records matching `ids` from the remote collection in
    /// batches: each batch first resolves server-side object ids for the
    /// business ids, then posts the deletes.
    pub async fn delete_records(&self, entity: &EntitySync<'_>, ids: &[SqlValue]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut total_deleted = 0u64;
        for (index, batch) in ids.chunks(MUTATION_BATCH_SIZE as usize).enumerate() {
            let batch_number = index + 1;
            let where_clause = format!("{} IN ({})", entity.key_column, sql_in_list(batch)?);
            let object_ids = self
                .broker
                .with_token(|token| self.query_object_ids(entity, &where_clause, token))
                .await?;
            if object_ids.is_empty() {
                info!("No {} records found for batch {batch_number}", entity.name);
                continue;
            }
            let deletes = serde_json::to_string(&object_ids)?;
            self.broker
                .with_token(|token| {
                    apply_edits(
                        self.client,
                        self.retry_budget_seconds,
                        entity.apply_edits_url,
                        token,
                        None,
                        Some(deletes.clone()),
                    )
                })
                .await?;
            total_deleted += object_ids.len() as u64;
            info!(
                "Deleted {} {} records from batch {batch_number}",
                object_ids.len(),
                entity.name
            );
        }
        info!("Total {} records deleted: {total_deleted}", entity.name);
        Ok(total_deleted)
    }

    /// Pushes the full current-snapshot rows for `ids`, draining the
    /// `_loaded` queue in batches and marking each batch only after the
    /// service accepted it.
    pub async fn insert_records(
        &self,
        conn: &Connection,
        entity: &EntitySync<'_>,
        ids: &[SqlValue],
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        {
            let mut stmt = conn.prepare(&format!(
                "INSERT INTO {} ({}) VALUES (?1)",
                entity.loaded_table, entity.key_column
            ))?;
            for id in ids {
                stmt.execute(params![id])?;
            }
        }

        let mut job_id = 1u32;
        loop {
            let batch: Vec<SqlValue> = {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM {} WHERE loaded = FALSE LIMIT {}",
                    entity.key_column, entity.loaded_table, MUTATION_BATCH_SIZE
                ))?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            };
            if batch.is_empty() {
                break;
            }

            let records = self.current_rows(conn, entity, &batch)?;
            if records.is_empty() {
                // Ids that were deleted outright have no current rows to
                // push; drain them from the queue without an edit call.
                info!(
                    "No current {} rows for job {job_id}; nothing to push",
                    entity.name
                );
            } else {
                let adds = serde_json::to_string(&records)?;
                self.broker
                    .with_token(|token| {
                        apply_edits(
                            self.client,
                            self.retry_budget_seconds,
                            entity.apply_edits_url,
                            token,
                            Some(adds.clone()),
                            None,
                        )
                    })
                    .await?;
            }

            let placeholders = batch.iter().map(|_| "?").join(", ");
            conn.execute(
                &format!(
                    "UPDATE {} SET loaded = TRUE WHERE {} IN ({placeholders})",
                    entity.loaded_table, entity.key_column
                ),
                params_from_iter(batch.iter()),
            )?;
            info!("Inserted {} {} rows for job {job_id}", batch.len(), entity.name);
            job_id += 1;
        }
        Ok(())
    }

    async fn query_object_ids(
        &self,
        entity: &EntitySync<'_>,
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
            self.client,
            self.retry_budget_seconds,
            Method::POST,
            entity.query_url,
            &params,
        )
        .await?;
        let features = match value.get("features").and_then(Value::as_array) {
            Some(features) => features.clone(),
            None => Vec::new(),
        };
        features
            .iter()
            .map(|feature| {
                feature
                    .pointer("/attributes/objectid")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| {
                        EtlError::RemoteFatal("objectid missing from query response".into())
                    })
            })
            .collect()
    }

    /// Looks up the rows for one queue batch and wraps them as ESRI add
    /// records.
    fn current_rows(
        &self,
        conn: &Connection,
        entity: &EntitySync<'_>,
        keys: &[SqlValue],
    ) -> Result<Vec<Value>> {
        let placeholders = keys.iter().map(|_| "?").join(", ");
        let columns = entity.push_columns.join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT {columns} FROM {} WHERE {} IN ({placeholders})",
            entity.table, entity.key_column
        ))?;
        let mut rows = stmt.query(params_from_iter(keys.iter()))?;

        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let mut attributes = serde_json::Map::new();
            for (index, column) in entity.push_columns.iter().enumerate() {
                let value: SqlValue = row.get(index)?;
                attributes.insert(column.to_string(), sql_to_json(&value));
            }
            let geometry = entity.geometry.map(|geometry| {
                json!({
                    "x": attributes.get(geometry.longitude).cloned().unwrap_or(Value::Null),
                    "y": attributes.get(geometry.latitude).cloned().unwrap_or(Value::Null),
                    "spatialReference": {"wkid": WKID_GDA94},
                })
            });
            let record = match geometry {
                Some(geometry) => json!({"attributes": attributes, "geometry": geometry}),
                None => json!({"attributes": attributes}),
            };
            records.push(record);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::esri::AuthSettings;

    fn quoted(values: &[&str]) -> Vec<SqlValue> {
        values.iter().map(|v| SqlValue::Text(v.to_string())).collect()
    }

    #[test]
    fn in_list_quotes_text_ids() {
        let ids = [SqlValue::Integer(12), SqlValue::Text("abc".into())];
        assert_eq!(sql_in_list(&ids).unwrap(), "12,'abc'");
    }

    #[test]
    fn in_list_rejects_embedded_quotes() {
        let ids = quoted(&["o'brien"]);
        assert!(matches!(sql_in_list(&ids), Err(EtlError::DataIntegrity(_))));
    }

    fn address_entity<'a>(query_url: &'a str, apply_edits_url: &'a str) -> EntitySync<'a> {
        EntitySync {
            name: "address",
            table: "address_current",
            loaded_table: "address_current_loaded",
            key_column: "address_pid",
            push_columns: &["address_pid", "unit", "latitude", "longitude"],
            geometry: Some(GeometryColumns {
                longitude: "longitude",
                latitude: "latitude",
            }),
            query_url,
            apply_edits_url,
        }
    }

    fn sync_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE address_current (
                 address_pid TEXT, unit TEXT, latitude REAL, longitude REAL
             );
             CREATE TABLE address_current_loaded (
                 address_pid TEXT,
                 loaded BOOLEAN DEFAULT FALSE
             );",
        )
        .unwrap();
        conn
    }

    async fn start_service() -> (MockServer, AuthSettings) {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/generateToken"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": "t"})),
            )
            .mount(&server)
            .await;
        let auth = AuthSettings {
            auth_url: format!("{}/generateToken", server.uri()),
            referer: "referer".into(),
            username: "user".into(),
            password: "pass".into(),
        };
        (server, auth)
    }

    #[tokio::test]
    async fn modified_row_is_deleted_then_reinserted() {
        let (server, auth) = start_service().await;
        Mock::given(method("POST"))
            .and(path("/query"))
            .and(body_string_contains("address_pid+IN"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "features": [{"attributes": {"objectid": 55}}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/applyEdits"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "addResults": [], "deleteResults": []
            })))
            .mount(&server)
            .await;

        let conn = sync_db();
        conn.execute(
            "INSERT INTO address_current VALUES ('100', '14', -27.2, 153.5)",
            [],
        )
        .unwrap();

        let client = Client::new();
        let broker = TokenBroker::new(client.clone(), auth, 5);
        let engine = SyncEngine::new(&client, &broker, 5);
        let query_url = format!("{}/query", server.uri());
        let apply_edits_url = format!("{}/applyEdits", server.uri());
        let entity = address_entity(&query_url, &apply_edits_url);

        let diff = TableDiff {
            deleted: quoted(&["100"]),
            added: quoted(&["100"]),
        };
        engine.sync_entity(&conn, &entity, &diff).await.unwrap();

        // One delete of the business id, then one insert of its new row, in
        // that order.
        let requests = server.received_requests().await.unwrap();
        let edits: Vec<String> = requests
            .iter()
            .filter(|r| r.url.path() == "/applyEdits")
            .map(|r| String::from_utf8(r.body.clone()).unwrap())
            .collect();
        assert_eq!(edits.len(), 2);
        assert!(edits[0].contains("deletes=%5B55%5D"));
        assert!(edits[1].contains("adds="));
        assert!(edits[1].contains("%2214%22"), "new row pushed: {}", edits[1]);

        let unloaded: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM address_current_loaded WHERE loaded = FALSE",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(unloaded, 0);
    }

    #[tokio::test]
    async fn empty_delete_batches_are_skipped() {
        let (server, auth) = start_service().await;
        Mock::given(method("POST"))
            .and(path("/query"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"features": []})),
            )
            .mount(&server)
            .await;

        let client = Client::new();
        let broker = TokenBroker::new(client.clone(), auth, 5);
        let engine = SyncEngine::new(&client, &broker, 5);
        let query_url = format!("{}/query", server.uri());
        let apply_edits_url = format!("{}/applyEdits", server.uri());
        let entity = address_entity(&query_url, &apply_edits_url);

        let deleted = engine.delete_records(&entity, &quoted(&["404"])).await.unwrap();
        assert_eq!(deleted, 0);
        let edit_calls = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.url.path() == "/applyEdits")
            .count();
        assert_eq!(edit_calls, 0);
    }

    #[tokio::test]
    async fn geometry_wraps_coordinates_with_gda94() {
        let conn = sync_db();
        conn.execute(
            "INSERT INTO address_current VALUES ('7', '1', -27.5, 153.0)",
            [],
        )
        .unwrap();
        let (server, auth) = start_service().await;
        let client = Client::new();
        let broker = TokenBroker::new(client.clone(), auth, 5);
        let engine = SyncEngine::new(&client, &broker, 5);
        let query_url = format!("{}/query", server.uri());
        let apply_edits_url = format!("{}/applyEdits", server.uri());
        let entity = address_entity(&query_url, &apply_edits_url);

        let records = engine
            .current_rows(&conn, &entity, &quoted(&["7"]))
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["geometry"]["x"], serde_json::json!(153.0));
        assert_eq!(records[0]["geometry"]["y"], serde_json::json!(-27.5));
        assert_eq!(records[0]["geometry"]["spatialReference"]["wkid"], serde_json::json!(4283));
    }
}
