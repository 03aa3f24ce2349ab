use std::path::Path;
use std::time::Duration;

use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use tracing::info;

use crate::conf::EnvConfigSettings;
use crate::error::{EtlError, Result};

/// Picks the most recent snapshot key from a listing. Keys embed an ISO-8601
/// timestamp with a fixed offset, so descending lexicographic order equals
/// temporal order.
pub fn latest_key(mut keys: Vec<String>) -> Option<String> {
    keys.sort();
    keys.pop()
}

/// Snapshot storage over an S3-compatible object store. Keys follow
/// `<prefix><ISO-8601-with-offset>/<name>.db`.
pub struct Snapshots {
    client: aws_sdk_s3::Client,
    presigned_url_expiry_seconds: u64,
}

impl Snapshots {
    pub async fn new(env_conf: &EnvConfigSettings) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(profile) = &env_conf.test_aws_profile {
            loader = loader
                .endpoint_url(&profile.s3_endpoint)
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
        let client = match env_conf.test_aws_profile {
            // MinIO does not serve virtual-hosted bucket addressing.
            Some(_) => aws_sdk_s3::Client::from_conf(
                aws_sdk_s3::config::Builder::from(&shared)
                    .force_path_style(true)
                    .build(),
            ),
            None => aws_sdk_s3::Client::new(&shared),
        };
        Self {
            client,
            presigned_url_expiry_seconds: env_conf.s3_presigned_url_expiry_seconds,
        }
    }

    pub async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(err) => {
                if err
                    .as_service_error()
                    .map(|service_err| service_err.is_not_found())
                    .unwrap_or(false)
                {
                    return Ok(false);
                }
                Err(EtlError::StorageFatal(format!(
                    "failed to head bucket {bucket}: {err}"
                )))
            }
        }
    }

    /// Returns the key of the most recent snapshot under `prefix`, or `None`
    /// when no snapshot has been published yet (first-run semantics).
    pub async fn latest_snapshot_key(&self, bucket: &str, prefix: &str) -> Result<Option<String>> {
        info!("Getting latest snapshot from {bucket}/{prefix}");
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix);
            if let Some(token) = continuation_token {
                request = request.continuation_token(token);
            }
            let listing = request.send().await.map_err(|err| {
                EtlError::StorageFatal(format!("failed to list objects in {bucket}: {err}"))
            })?;
            keys.extend(
                listing
                    .contents()
                    .iter()
                    .filter_map(|object| object.key().map(String::from)),
            );
            match listing.next_continuation_token() {
                Some(token) => continuation_token = Some(token.to_string()),
                None => break,
            }
        }

        let latest = latest_key(keys);
        match &latest {
            Some(key) => info!("Latest snapshot: {key}"),
            None => info!("No previous snapshot found"),
        }
        Ok(latest)
    }

    pub async fn download(&self, bucket: &str, key: &str, local_path: &Path) -> Result<()> {
        info!("Downloading {bucket}/{key} to {}", local_path.display());
        let object = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                EtlError::StorageFatal(format!("failed to get {bucket}/{key}: {err}"))
            })?;
        let bytes = object.body.collect().await.map_err(|err| {
            EtlError::StorageFatal(format!("failed to read {bucket}/{key}: {err}"))
        })?;
        tokio::fs::write(local_path, bytes.into_bytes())
            .await
            .map_err(|err| EtlError::StorageFatal(format!("failed to write snapshot: {err}")))?;
        Ok(())
    }

    pub async fn upload(&self, bucket: &str, key: &str, local_path: &Path) -> Result<()> {
        info!("Uploading {} to {bucket}/{key}", local_path.display());
        let body = ByteStream::from_path(local_path).await.map_err(|err| {
            EtlError::StorageFatal(format!("failed to open snapshot for upload: {err}"))
        })?;
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|err| {
                EtlError::StorageFatal(format!("failed to upload {bucket}/{key}: {err}"))
            })?;
        Ok(())
    }

    /// Produces a presigned download URL for the published snapshot.
    pub async fn presigned_get_url(&self, bucket: &str, key: &str) -> Result<String> {
        let presigning = PresigningConfig::expires_in(Duration::from_secs(
            self.presigned_url_expiry_seconds,
        ))
        .map_err(|err| EtlError::Internal(format!("invalid presign expiry: {err}")))?;
        let request = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|err| {
                EtlError::StorageFatal(format!("failed to presign {bucket}/{key}: {err}"))
            })?;
        Ok(request.uri().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_key_sorts_descending() {
        let keys = vec![
            "etl/2025-05-27T00:00:00+1000/address.db".to_string(),
            "etl/2025-05-28T00:00:00+1000/address.db".to_string(),
            "etl/2025-05-26T23:59:59+1000/address.db".to_string(),
        ];
        assert_eq!(
            latest_key(keys).as_deref(),
            Some("etl/2025-05-28T00:00:00+1000/address.db")
        );
    }

    #[test]
    fn latest_key_of_empty_listing_is_none() {
        assert_eq!(latest_key(Vec::new()), None);
    }

    #[test]
    fn iso_8601_fixed_offset_order_is_temporal_order() {
        // Same-offset timestamps sort lexicographically in time order, which
        // is what the key convention relies on.
        let earlier = "etl/2025-05-28T09:59:59+1000/address.db";
        let later = "etl/2025-05-28T10:00:00+1000/address.db";
        assert!(later > earlier);
    }
}
