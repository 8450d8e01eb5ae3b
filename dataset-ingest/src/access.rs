use std::sync::Arc;
use std::time::Duration;

use common_s3::{S3Client, S3Error};
use serde::Serialize;
use tracing::{info, warn};

use crate::{error::IngestError, metric_consts::DOWNLOAD_LINKS_ISSUED};

// What S3 means by an empty location constraint
const DEFAULT_REGION: &str = "us-east-1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadLink {
    pub key: String,
    pub url: String,
    pub expires_in_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub accessible: bool,
    /// Store error code when the bucket could not be reached
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Read access to stored datasets that doesn't go through the catalog.
#[derive(Clone)]
pub struct AccessService {
    client: Arc<dyn S3Client>,
    bucket: String,
    link_ttl: Duration,
}

impl AccessService {
    pub fn new(client: Arc<dyn S3Client>, bucket: String, link_ttl: Duration) -> Self {
        Self {
            client,
            bucket,
            link_ttl,
        }
    }

    /// Presigned GET for `key`. Presigning alone never touches the store, so
    /// the object is checked first; a link to nothing is a `NotFound`.
    pub async fn download_link(&self, key: &str) -> Result<DownloadLink, IngestError> {
        self.client.head_object(&self.bucket, key).await?;

        let url = self
            .client
            .presign_get(&self.bucket, key, self.link_ttl)
            .await
            .map_err(IngestError::store_unreachable)?;

        metrics::counter!(DOWNLOAD_LINKS_ISSUED).increment(1);
        info!(bucket = %self.bucket, key, ttl_secs = self.link_ttl.as_secs(), "issued download link");
        Ok(DownloadLink {
            key: key.to_string(),
            url,
            expires_in_seconds: self.link_ttl.as_secs(),
        })
    }

    /// Reachability report; failures are reported in the result, not raised
    pub async fn bucket_info(&self) -> BucketInfo {
        match self.probe().await {
            Ok(region) => BucketInfo {
                name: self.bucket.clone(),
                region: Some(region),
                accessible: true,
                error: None,
            },
            Err(e) => {
                warn!(bucket = %self.bucket, error = %e, "bucket is not accessible");
                BucketInfo {
                    name: self.bucket.clone(),
                    region: None,
                    accessible: false,
                    error: Some(e.code().to_string()),
                }
            }
        }
    }

    async fn probe(&self) -> Result<String, S3Error> {
        self.client.head_bucket(&self.bucket).await?;
        let region = self.client.bucket_region(&self.bucket).await?;
        Ok(region
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| DEFAULT_REGION.to_string()))
    }
}
