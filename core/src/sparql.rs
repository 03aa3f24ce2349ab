use std::collections::HashMap;

use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Client;
use serde::Deserialize;
use tracing::error;

use crate::error::{EtlError, Result};
use crate::http::with_retries;

/// One bound term in a SPARQL JSON result binding. Only the lexical value is
/// used; datatypes are resolved inside the queries themselves.
#[derive(Debug, Clone, Deserialize)]
pub struct SparqlTerm {
    pub value: String,
}

/// One result row: variable name to bound term. Unbound variables are simply
/// absent.
pub type SparqlRow = HashMap<String, SparqlTerm>;

#[derive(Debug, Deserialize)]
struct SparqlResults {
    results: SparqlResultSet,
}

#[derive(Debug, Deserialize)]
struct SparqlResultSet {
    bindings: Vec<SparqlRow>,
}

/// POSTs sparql-query documents to the endpoint and decodes
/// application/sparql-results+json responses.
pub struct SparqlClient {
    endpoint: String,
    client: Client,
    retry_budget_seconds: u64,
}

impl SparqlClient {
    pub fn new(endpoint: String, client: Client, retry_budget_seconds: u64) -> Self {
        Self {
            endpoint,
            client,
            retry_budget_seconds,
        }
    }

    pub async fn query(&self, query: &str) -> Result<Vec<SparqlRow>> {
        with_retries(self.retry_budget_seconds, || self.query_once(query)).await
    }

    async fn query_once(&self, query: &str) -> Result<Vec<SparqlRow>> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/sparql-query")
            .header(ACCEPT, "application/sparql-results+json")
            .body(query.to_string())
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            error!("Error querying SPARQL endpoint ({status}): {body}");
            return Err(EtlError::TransientRemote(format!(
                "SPARQL endpoint returned {status}"
            )));
        }

        let parsed: SparqlResults = serde_json::from_str(&body)?;
        Ok(parsed.results.bindings)
    }
}

/// Convenience lookup for optional bindings.
pub fn binding_value(row: &SparqlRow, variable: &str) -> Option<String> {
    row.get(variable).map(|term| term.value.clone())
}

/// Lookup for bindings the query guarantees; a missing one means the source
/// data violates the extraction contract.
pub fn required_binding(row: &SparqlRow, variable: &str) -> Result<String> {
    binding_value(row, variable).ok_or_else(|| {
        EtlError::DataIntegrity(format!("SPARQL row is missing required binding {variable}"))
    })
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_string_contains, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn decodes_bindings_and_sets_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("content-type", "application/sparql-query"))
            .and(header("accept", "application/sparql-results+json"))
            .and(body_string_contains("SELECT ?iri"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "head": {"vars": ["iri", "lot"]},
                "results": {"bindings": [
                    {"iri": {"type": "uri", "value": "https://example.com/addr/1"},
                     "lot": {"type": "literal", "value": "36"}},
                    {"iri": {"type": "uri", "value": "https://example.com/addr/2"}}
                ]}
            })))
            .mount(&server)
            .await;

        let client = SparqlClient::new(server.uri(), Client::new(), 5);
        let rows = client.query("SELECT ?iri WHERE { ?iri a <x> }").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(binding_value(&rows[0], "lot").as_deref(), Some("36"));
        assert_eq!(binding_value(&rows[1], "lot"), None);
    }

    #[tokio::test]
    async fn server_errors_are_retried_until_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": {"bindings": []}
            })))
            .mount(&server)
            .await;

        let client = SparqlClient::new(server.uri(), Client::new(), 5);
        let rows = client.query("SELECT ?iri WHERE { ?iri a <x> }").await.unwrap();
        assert!(rows.is_empty());
    }
}
