use std::future::Future;

use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::conf::EnvConfigSettings;
use crate::error::{EtlError, Result};
use crate::http::with_retries;

/// Batch size for feature-service mutations and the queries that feed them.
pub const MUTATION_BATCH_SIZE: u64 = 2_000;

/// How many batches a token is used for before it is rotated, independent of
/// the unconditional rotation on code 498.
const TOKEN_USES_PER_REFRESH: u32 = 10;
const TOKEN_EXPIRATION_MINUTES: u32 = 15;

/// A feature-service record: attributes plus, for spatial layers, a point
/// geometry.
#[derive(Debug, Clone, Deserialize)]
pub struct Feature {
    pub attributes: serde_json::Map<String, Value>,
    #[serde(default)]
    pub geometry: Option<Geometry>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Geometry {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub auth_url: String,
    pub referer: String,
    pub username: String,
    pub password: String,
}

impl AuthSettings {
    pub fn from_conf(env_conf: &EnvConfigSettings) -> Self {
        Self {
            auth_url: env_conf.esri_auth_url.clone(),
            referer: env_conf.esri_referer.clone(),
            username: env_conf.esri_username.clone(),
            password: env_conf.esri_password.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct TokenState {
    token: Option<String>,
    uses_left: u32,
}

/// Hands out short-lived bearer tokens for the feature service, rotating
/// after [TOKEN_USES_PER_REFRESH] uses or on an auth-expiry signal. Refreshes
/// are serialised behind the state mutex, so concurrent refresh attempts
/// collapse into one. Tokens are never logged.
pub struct TokenBroker {
    client: Client,
    auth: AuthSettings,
    retry_budget_seconds: u64,
    state: Mutex<TokenState>,
}

impl TokenBroker {
    pub fn new(client: Client, auth: AuthSettings, retry_budget_seconds: u64) -> Self {
        Self {
            client,
            auth,
            retry_budget_seconds,
            state: Mutex::new(TokenState::default()),
        }
    }

    pub async fn current_token(&self) -> Result<String> {
        let mut state = self.state.lock().await;
        if state.token.is_none() || state.uses_left == 0 {
            info!("Getting feature service token");
            let token = self.request_token().await?;
            state.token = Some(token);
            state.uses_left = TOKEN_USES_PER_REFRESH;
            info!("Feature service token obtained");
        }
        state.uses_left -= 1;
        state
            .token
            .clone()
            .ok_or_else(|| EtlError::Internal("token state empty after refresh".into()))
    }

    /// Discards the cached token and obtains a fresh one. The returned token
    /// counts as used once.
    pub async fn refresh(&self) -> Result<String> {
        let mut state = self.state.lock().await;
        info!("Refreshing feature service token");
        let token = self.request_token().await?;
        state.token = Some(token.clone());
        state.uses_left = TOKEN_USES_PER_REFRESH - 1;
        Ok(token)
    }

    /// Runs `op` with the current token. If the service signals token expiry
    /// the token is refreshed and `op` retried exactly once.
    pub async fn with_token<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let token = self.current_token().await?;
        match op(token).await {
            Err(EtlError::AuthExpired(msg)) => {
                warn!("Feature service token expired ({msg}); refreshing and retrying once");
                let token = self.refresh().await?;
                op(token).await
            }
            other => other,
        }
    }

    async fn request_token(&self) -> Result<String> {
        with_retries(self.retry_budget_seconds, || self.request_token_once()).await
    }

    async fn request_token_once(&self) -> Result<String> {
        let expiration = TOKEN_EXPIRATION_MINUTES.to_string();
        let response = self
            .client
            .post(&self.auth.auth_url)
            .query(&[
                ("f", "json"),
                ("referer", self.auth.referer.as_str()),
                ("expiration", expiration.as_str()),
            ])
            .form(&[
                ("username", self.auth.username.as_str()),
                ("password", self.auth.password.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            error!("Error getting feature service token ({status})");
            return Err(EtlError::TransientRemote(format!(
                "token endpoint returned {status}"
            )));
        }

        let body: Value = response.json().await?;
        match body.get("token").and_then(Value::as_str) {
            Some(token) => Ok(token.to_string()),
            None => {
                let error_value = body.get("error").unwrap_or(&Value::Null);
                error!("Token endpoint returned no token: {}", error_value);
                Err(EtlError::RemoteFatal("token endpoint returned no token".into()))
            }
        }
    }
}

/// Issues one feature-service request under the retry budget. These services
/// frequently return HTTP 200 with an embedded `error` object, which counts
/// as a failure; error code 498 surfaces as [EtlError::AuthExpired] for the
/// caller to handle.
pub async fn service_request(
    client: &Client,
    retry_budget_seconds: u64,
    method: Method,
    url: &str,
    params: &[(&str, String)],
) -> Result<Value> {
    with_retries(retry_budget_seconds, || {
        service_request_once(client, method.clone(), url, params)
    })
    .await
}

async fn service_request_once(
    client: &Client,
    method: Method,
    url: &str,
    params: &[(&str, String)],
) -> Result<Value> {
    let request = if method == Method::GET {
        client.get(url).query(params)
    } else {
        client.post(url).form(params)
    };
    let response = request.send().await?;

    let status = response.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(EtlError::AuthExpired("service returned 401".into()));
    }
    let body = response.text().await?;
    if !status.is_success() {
        error!("Error from feature service ({status}): {body}");
        if status.is_client_error() {
            return Err(EtlError::RemoteFatal(format!("feature service returned {status}")));
        }
        return Err(EtlError::TransientRemote(format!("feature service returned {status}")));
    }

    let value: Value = serde_json::from_str(&body)?;
    if let Some(embedded) = value.get("error") {
        if embedded.get("code").and_then(Value::as_i64) == Some(498) {
            return Err(EtlError::AuthExpired("feature service returned code 498".into()));
        }
        error!("Feature service returned an embedded error: {embedded}");
        return Err(EtlError::TransientRemote(format!(
            "feature service error: {embedded}"
        )));
    }
    Ok(value)
}

/// Issues a `returnCountOnly` query for the records matching `where_clause`.
pub async fn total_count(
    client: &Client,
    retry_budget_seconds: u64,
    query_url: &str,
    where_clause: &str,
    token: String,
) -> Result<u64> {
    let params = [
        ("where", where_clause.to_string()),
        ("returnCountOnly", "true".to_string()),
        ("f", "json".to_string()),
        ("token", token),
    ];
    let value = service_request(client, retry_budget_seconds, Method::GET, query_url, &params).await?;
    value
        .get("count")
        .and_then(Value::as_u64)
        .ok_or_else(|| EtlError::RemoteFatal("count missing from returnCountOnly response".into()))
}

/// Posts an applyEdits mutation. `adds` and `deletes` are pre-encoded JSON
/// arrays; the service applies each request transactionally.
pub async fn apply_edits(
    client: &Client,
    retry_budget_seconds: u64,
    apply_edits_url: &str,
    token: String,
    adds: Option<String>,
    deletes: Option<String>,
) -> Result<Value> {
    let mut params = vec![("f", "json".to_string()), ("token", token)];
    if let Some(adds) = adds {
        params.push(("adds", adds));
    }
    if let Some(deletes) = deletes {
        params.push(("deletes", deletes));
    }
    service_request(
        client,
        retry_budget_seconds,
        Method::POST,
        apply_edits_url,
        &params,
    )
    .await
}

/// Everything needed to page one feature-service query by offset.
pub struct PageQuery<'a> {
    pub client: &'a Client,
    pub broker: &'a TokenBroker,
    pub retry_budget_seconds: u64,
    pub query_url: &'a str,
    pub where_clause: String,
    pub out_fields: &'a str,
    pub return_geometry: bool,
    pub batch_size: u64,
}

/// Drives `resultOffset`/`resultRecordCount` iteration over a feature-service
/// query until the count reported up front is exhausted.
pub struct OffsetPager<'a> {
    query: PageQuery<'a>,
    total: u64,
    offset: u64,
}

impl<'a> OffsetPager<'a> {
    pub async fn start(query: PageQuery<'a>) -> Result<OffsetPager<'a>> {
        let total = query
            .broker
            .with_token(|token| {
                total_count(
                    query.client,
                    query.retry_budget_seconds,
                    query.query_url,
                    &query.where_clause,
                    token,
                )
            })
            .await?;
        Ok(Self { query, total, offset: 0 })
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn total_batches(&self) -> u64 {
        self.total.div_ceil(self.query.batch_size)
    }

    /// Yields the next `(batch_index, total_batches, features)` triple, or
    /// `None` once the offset reaches the reported count. An empty in-range
    /// batch is reported with a warning and iteration continues.
    pub async fn next_batch(&mut self) -> Result<Option<(u64, u64, Vec<Feature>)>> {
        if self.offset >= self.total {
            return Ok(None);
        }
        let batch_index = self.offset / self.query.batch_size;
        let features = self
            .query
            .broker
            .with_token(|token| self.fetch_page(token))
            .await?;
        if features.is_empty() {
            warn!("No records found for offset {} of {}", self.offset, self.total);
        }
        self.offset += self.query.batch_size;
        Ok(Some((batch_index, self.total_batches(), features)))
    }

    async fn fetch_page(&self, token: String) -> Result<Vec<Feature>> {
        let params = [
            ("where", self.query.where_clause.clone()),
            ("outFields", self.query.out_fields.to_string()),
            ("returnGeometry", self.query.return_geometry.to_string()),
            ("resultOffset", self.offset.to_string()),
            ("resultRecordCount", self.query.batch_size.to_string()),
            ("f", "json".to_string()),
            ("token", token),
        ];
        let value = service_request(
            self.query.client,
            self.query.retry_budget_seconds,
            Method::GET,
            self.query.query_url,
            &params,
        )
        .await?;
        match value.get("features") {
            Some(features) => Ok(serde_json::from_value(features.clone())?),
            None => {
                warn!("No features field in the response for offset {}", self.offset);
                Ok(Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn auth(server: &MockServer) -> AuthSettings {
        AuthSettings {
            auth_url: format!("{}/generateToken", server.uri()),
            referer: "https://example.com/arcgis/".into(),
            username: "user".into(),
            password: "pass".into(),
        }
    }

    async fn mount_token_endpoint(server: &MockServer, token: &str) {
        Mock::given(method("POST"))
            .and(path("/generateToken"))
            .and(body_string_contains("username=user"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": token})),
            )
            .mount(server)
            .await;
    }

    fn feature_page(ids: &[i64]) -> serde_json::Value {
        let features: Vec<_> = ids
            .iter()
            .map(|id| serde_json::json!({"attributes": {"objectid": id}}))
            .collect();
        serde_json::json!({"features": features})
    }

    #[tokio::test]
    async fn token_rotates_after_ten_uses() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/generateToken"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": "t"})),
            )
            .expect(3)
            .mount(&server)
            .await;

        let broker = TokenBroker::new(Client::new(), auth(&server), 5);
        for _ in 0..21 {
            broker.current_token().await.unwrap();
        }
    }

    #[tokio::test]
    async fn with_token_refreshes_once_on_498() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server, "t").await;
        Mock::given(method("GET"))
            .and(path("/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "error": {"code": 498, "message": "Invalid token"}
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/query"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"count": 7})),
            )
            .mount(&server)
            .await;

        let client = Client::new();
        let broker = TokenBroker::new(client.clone(), auth(&server), 5);
        let url = format!("{}/query", server.uri());
        let count = broker
            .with_token(|token| total_count(&client, 5, &url, "1=1", token))
            .await
            .unwrap();
        assert_eq!(count, 7);
        // One initial token plus one refresh.
        assert_eq!(
            server
                .received_requests()
                .await
                .unwrap()
                .iter()
                .filter(|r| r.url.path() == "/generateToken")
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn pager_recovers_from_mid_pagination_expiry() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server, "t").await;
        Mock::given(method("GET"))
            .and(path("/query"))
            .and(query_param("returnCountOnly", "true"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"count": 6})),
            )
            .mount(&server)
            .await;
        // The offset-2 page fails once with an expired token.
        Mock::given(method("GET"))
            .and(path("/query"))
            .and(query_param("resultOffset", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "error": {"code": 498, "message": "Invalid token"}
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/query"))
            .and(query_param("resultOffset", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(feature_page(&[1, 2])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/query"))
            .and(query_param("resultOffset", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(feature_page(&[3, 4])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/query"))
            .and(query_param("resultOffset", "4"))
            .respond_with(ResponseTemplate::new(200).set_body_json(feature_page(&[5, 6])))
            .mount(&server)
            .await;

        let client = Client::new();
        let broker = TokenBroker::new(client.clone(), auth(&server), 5);
        let url = format!("{}/query", server.uri());
        let mut pager = OffsetPager::start(PageQuery {
            client: &client,
            broker: &broker,
            retry_budget_seconds: 5,
            query_url: &url,
            where_clause: "1=1".into(),
            out_fields: "objectid",
            return_geometry: false,
            batch_size: 2,
        })
        .await
        .unwrap();

        let mut seen = Vec::new();
        while let Some((_, total_batches, features)) = pager.next_batch().await.unwrap() {
            assert_eq!(total_batches, 3);
            for feature in features {
                seen.push(feature.attributes["objectid"].as_i64().unwrap());
            }
        }
        // The expired batch was processed exactly once; the final row count
        // equals the reported total.
        assert_eq!(seen, vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn embedded_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "error": {"code": 500, "message": "oops"}
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/query"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"count": 1})),
            )
            .mount(&server)
            .await;

        let client = Client::new();
        let url = format!("{}/query", server.uri());
        let count = total_count(&client, 5, &url, "1=1", "t".into()).await.unwrap();
        assert_eq!(count, 1);
    }
}
