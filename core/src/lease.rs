use std::time::Duration;

use aws_config::{BehaviorVersion, Region};
use aws_sdk_dynamodb::config::Credentials;
use aws_sdk_dynamodb::types::AttributeValue;
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::conf::EnvConfigSettings;
use crate::error::{EtlError, Result};

/// At most one ETL run per pipeline: the lease outlives any plausible run
/// but expires if the holder is killed without releasing.
const LEASE_TTL_SECONDS: i64 = 86_400;
const RETRY_TIMEOUT_SECONDS: u64 = 600;
const RETRY_INTERVAL_SECONDS: u64 = 60;

/// An exclusive, TTL-bounded run lease held in a key-value table supporting
/// conditional puts. Acquisition retries for up to ten minutes at one minute
/// intervals; release is guarded by the holder identity so a stale process
/// cannot release a successor's lease.
pub struct EtlLease {
    client: aws_sdk_dynamodb::Client,
    table: String,
    lock_id: String,
    holder: String,
}

async fn build_client(env_conf: &EnvConfigSettings) -> aws_sdk_dynamodb::Client {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(profile) = &env_conf.test_aws_profile {
        loader = loader
            .endpoint_url(&profile.lease_endpoint)
            .region(Region::new(profile.region.clone()))
            .credentials_provider(Credentials::new(
                profile.access_key.clone(),
                profile.secret_key.clone(),
                None,
                None,
                "static",
            ));
    }
    let shared = loader.load().await;
    aws_sdk_dynamodb::Client::new(&shared)
}

impl EtlLease {
    pub async fn acquire(env_conf: &EnvConfigSettings, lock_id: &str) -> Result<Self> {
        let client = build_client(env_conf).await;
        let lease = Self {
            client,
            table: env_conf.lock_table_name.clone(),
            lock_id: lock_id.to_string(),
            holder: Uuid::new_v4().to_string(),
        };

        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(RETRY_TIMEOUT_SECONDS);
        loop {
            match lease.try_acquire().await {
                Ok(true) => {
                    info!("Acquired ETL lease {}", lease.lock_id);
                    return Ok(lease);
                }
                Ok(false) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(EtlError::LeaseUnavailable(format!(
                            "lease {} still held after {RETRY_TIMEOUT_SECONDS} seconds",
                            lease.lock_id
                        )));
                    }
                    info!(
                        "ETL lease {} is held, retrying in {RETRY_INTERVAL_SECONDS} seconds",
                        lease.lock_id
                    );
                    tokio::time::sleep(Duration::from_secs(RETRY_INTERVAL_SECONDS)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_acquire(&self) -> Result<bool> {
        let now = Utc::now().timestamp();
        let expires_at = now + LEASE_TTL_SECONDS;
        let outcome = self
            .client
            .put_item()
            .table_name(&self.table)
            .item("lock_id", AttributeValue::S(self.lock_id.clone()))
            .item("holder", AttributeValue::S(self.holder.clone()))
            .item("expires_at", AttributeValue::N(expires_at.to_string()))
            .condition_expression("attribute_not_exists(lock_id) OR expires_at < :now")
            .expression_attribute_values(":now", AttributeValue::N(now.to_string()))
            .send()
            .await;
        match outcome {
            Ok(_) => Ok(true),
            Err(err) => {
                let held = err
                    .as_service_error()
                    .map(|service_err| service_err.is_conditional_check_failed_exception())
                    .unwrap_or(false);
                if held {
                    return Ok(false);
                }
                Err(EtlError::LeaseUnavailable(format!(
                    "lease backend error: {err}"
                )))
            }
        }
    }

    /// Releases the lease. Must be called on every exit path once acquisition
    /// succeeded, even if publication failed.
    pub async fn release(self) -> Result<()> {
        let outcome = self
            .client
            .delete_item()
            .table_name(&self.table)
            .key("lock_id", AttributeValue::S(self.lock_id.clone()))
            .condition_expression("holder = :holder")
            .expression_attribute_values(":holder", AttributeValue::S(self.holder.clone()))
            .send()
            .await;
        match outcome {
            Ok(_) => {
                info!("Released ETL lease {}", self.lock_id);
                Ok(())
            }
            Err(err) => {
                let stale = err
                    .as_service_error()
                    .map(|service_err| service_err.is_conditional_check_failed_exception())
                    .unwrap_or(false);
                if stale {
                    // The TTL lapsed and another run took over; nothing to do.
                    warn!("ETL lease {} was already taken over", self.lock_id);
                    return Ok(());
                }
                Err(EtlError::LeaseUnavailable(format!(
                    "failed to release lease {}: {err}",
                    self.lock_id
                )))
            }
        }
    }
}
