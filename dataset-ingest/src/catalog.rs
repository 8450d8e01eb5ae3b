use std::sync::Arc;

use chrono::{DateTime, Utc};
use common_s3::{ObjectSummary, S3Client, S3Error};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use tracing::{debug, info};

use crate::{error::IngestError, metadata::MetadataRecord, metric_consts::CATALOG_LISTINGS};

// HEAD requests in flight while building a listing
const HEAD_CONCURRENCY: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    pub key: String,
    pub metadata: MetadataRecord,
    pub last_modified: Option<DateTime<Utc>>,
    pub size_bytes: u64,
    /// Binary-unit rendering of `size_bytes`, for display only
    pub size: String,
}

/// Read-only view of the datasets currently in the bucket.
#[derive(Clone)]
pub struct Catalog {
    client: Arc<dyn S3Client>,
    bucket: String,
    extensions: Vec<String>,
}

impl Catalog {
    pub fn new(client: Arc<dyn S3Client>, bucket: String, extensions: Vec<String>) -> Self {
        Self {
            client,
            bucket,
            extensions,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn is_dataset_key(&self, key: &str) -> bool {
        has_extension(key, &self.extensions)
    }

    /// Every dataset object in the bucket, sorted by key, with its metadata
    /// normalised into a [`MetadataRecord`].
    ///
    /// A failed listing is an error, never an empty catalog. Objects deleted
    /// between the listing and their HEAD are skipped.
    pub async fn list(&self) -> Result<Vec<CatalogEntry>, IngestError> {
        let objects = self
            .client
            .list_objects(&self.bucket, None)
            .await
            .map_err(IngestError::store_unreachable)?;

        let datasets: Vec<ObjectSummary> = objects
            .into_iter()
            .filter(|o| self.is_dataset_key(&o.key))
            .collect();

        let entries: Vec<Option<CatalogEntry>> = stream::iter(datasets)
            .map(|object| self.describe(object))
            .buffered(HEAD_CONCURRENCY)
            .try_collect()
            .await?;

        let mut entries: Vec<CatalogEntry> = entries.into_iter().flatten().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        metrics::counter!(CATALOG_LISTINGS).increment(1);
        info!(bucket = %self.bucket, count = entries.len(), "listed catalog");
        Ok(entries)
    }

    async fn describe(&self, object: ObjectSummary) -> Result<Option<CatalogEntry>, IngestError> {
        match self.client.head_object(&self.bucket, &object.key).await {
            Ok(head) => Ok(Some(CatalogEntry {
                metadata: MetadataRecord::from_map(&head.metadata),
                last_modified: object.last_modified.or(head.last_modified),
                size_bytes: object.size,
                size: format_binary_size(object.size),
                key: object.key,
            })),
            Err(S3Error::NotFound(key)) => {
                debug!(key = %key, "object disappeared between list and head, skipping");
                Ok(None)
            }
            Err(e) => Err(IngestError::store_unreachable(e)),
        }
    }
}

/// Case-insensitive extension check; `extensions` are lowercase without dots
pub fn has_extension(name: &str, extensions: &[String]) -> bool {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            let ext = ext.to_ascii_lowercase();
            extensions.iter().any(|allowed| *allowed == ext)
        }
        _ => false,
    }
}

const BINARY_UNITS: [&str; 8] = ["KiB", "MiB", "GiB", "TiB", "PiB", "EiB", "ZiB", "YiB"];

/// `1 Byte`, `512 Bytes`, `1.5 KiB`, `2.1 GiB`
pub fn format_binary_size(bytes: u64) -> String {
    if bytes == 1 {
        return "1 Byte".to_string();
    }
    if bytes < 1024 {
        return format!("{bytes} Bytes");
    }

    let mut value = bytes as f64 / 1024.0;
    let mut unit = BINARY_UNITS[0];
    for next in &BINARY_UNITS[1..] {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }
    format!("{value:.1} {unit}")
}
