use std::future::Future;
use std::time::Duration;

use backoff::future::retry_notify;
use backoff::ExponentialBackoff;
use reqwest::Client;
use tracing::warn;

use crate::conf::EnvConfigSettings;
use crate::error::{EtlError, Result};

pub fn backoff_policy(max_elapsed_seconds: u64) -> ExponentialBackoff {
    ExponentialBackoff {
        max_elapsed_time: Some(Duration::from_secs(max_elapsed_seconds)),
        ..ExponentialBackoff::default()
    }
}

/// Builds the HTTP client shared by SPARQL and feature-service calls, with
/// the configured per-request timeout.
pub fn build_client(env_conf: &EnvConfigSettings) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(env_conf.http_timeout_in_seconds))
        .build()
        .map_err(|e| EtlError::Internal(format!("unable to build HTTP client: {e}")))
}

/// Runs `op` under exponential backoff until it succeeds or the total time
/// budget lapses. Only [EtlError::TransientRemote] is retried; every other
/// error surfaces immediately. A transient error that outlives the budget is
/// reported as [EtlError::RemoteFatal].
pub async fn with_retries<T, F, Fut>(max_elapsed_seconds: u64, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_notify(
        backoff_policy(max_elapsed_seconds),
        move || {
            let attempt = op();
            async move {
                attempt.await.map_err(|e| match e {
                    EtlError::TransientRemote(_) => backoff::Error::transient(e),
                    other => backoff::Error::permanent(other),
                })
            }
        },
        |err: EtlError, wait: Duration| {
            warn!("Backing off {:.1} seconds after error: {err}", wait.as_secs_f64());
        },
    )
    .await
    .map_err(|e| match e {
        EtlError::TransientRemote(msg) => {
            EtlError::RemoteFatal(format!("retry budget exhausted: {msg}"))
        }
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let result = with_retries(30, || async {
            match calls.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => Err(EtlError::TransientRemote("flaky".into())),
                _ => Ok(42),
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn auth_expiry_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retries(30, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(EtlError::AuthExpired("code 498".into()))
        })
        .await;
        assert!(matches!(result, Err(EtlError::AuthExpired(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
