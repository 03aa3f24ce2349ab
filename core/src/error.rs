use std::{error::Error, fmt, result};

pub type Result<T, E = EtlError> = result::Result<T, E>;

#[derive(Debug)]
pub enum EtlError {
    /// Network failure, 5xx, or an embedded feature-service error other than
    /// code 498. Retried within the backoff budget.
    TransientRemote(String),
    /// HTTP 401 or feature-service error code 498. Handled at the paginator
    /// and sync boundaries by refreshing the token and retrying once.
    AuthExpired(String),
    /// Non-auth 4xx, or a transient failure that outlived the backoff budget.
    RemoteFatal(String),
    /// Object storage bucket missing, download or upload failure.
    StorageFatal(String),
    /// A row violates a declared constraint, or duplicate content hashes
    /// were found within one snapshot table.
    DataIntegrity(String),
    /// The exclusive run lease could not be acquired within its timeout.
    LeaseUnavailable(String),
    DbError(String),
    SerDe(String),
    Internal(String),
}

impl Error for EtlError {}

impl fmt::Display for EtlError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EtlError::TransientRemote(s) => write!(f, "Transient remote failure: {}", s),
            EtlError::AuthExpired(s) => write!(f, "Feature service auth expired: {}", s),
            EtlError::RemoteFatal(s) => write!(f, "Fatal remote failure: {}", s),
            EtlError::StorageFatal(s) => write!(f, "Object storage failure: {}", s),
            EtlError::DataIntegrity(s) => write!(f, "Data integrity violation: {}", s),
            EtlError::LeaseUnavailable(s) => write!(f, "ETL lease unavailable: {}", s),
            EtlError::DbError(s) => write!(f, "Snapshot database error: {}", s),
            EtlError::SerDe(s) => write!(f, "SerDe related error: {}", s),
            EtlError::Internal(s) => write!(f, "Unexpected internal error: {}", s),
        }
    }
}

impl From<rusqlite::Error> for EtlError {
    fn from(e: rusqlite::Error) -> Self {
        EtlError::DbError(e.to_string())
    }
}

impl From<reqwest::Error> for EtlError {
    fn from(e: reqwest::Error) -> Self {
        // reqwest surfaces timeouts, connection resets and protocol errors
        // here; all of them are retryable within the backoff budget.
        EtlError::TransientRemote(e.to_string())
    }
}

impl From<serde_json::Error> for EtlError {
    fn from(e: serde_json::Error) -> Self {
        EtlError::SerDe(e.to_string())
    }
}

impl From<std::io::Error> for EtlError {
    fn from(e: std::io::Error) -> Self {
        EtlError::Internal(e.to_string())
    }
}

impl From<chrono::ParseError> for EtlError {
    fn from(e: chrono::ParseError) -> Self {
        EtlError::SerDe(e.to_string())
    }
}

impl From<url::ParseError> for EtlError {
    fn from(e: url::ParseError) -> Self {
        EtlError::Internal(e.to_string())
    }
}
