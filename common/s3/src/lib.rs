//! Object store client abstraction for the dataset ingestion service
//!
//! This crate wraps the handful of S3 operations the ingestion pipeline needs
//! behind a trait, so the pipeline can be driven against a real bucket or
//! against the in-memory [`MockS3Client`] in tests.
//!
//! Follows the trait-plus-manual-mock pattern: the mock is always compiled,
//! no conditional compilation needed.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

mod aws;
mod mock;

pub use aws::{S3Config, S3Impl};
pub use mock::{MockS3Client, S3Op, StoredObject};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum S3Error {
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Bucket not found: {0}")]
    BucketNotFound(String),
    #[error("S3 service error {code}: {message}")]
    Service { code: String, message: String },
    #[error("S3 transport error ({reason}): {message}")]
    Transport { reason: String, message: String },
    #[error("Failed to presign request: {0}")]
    Presign(String),
}

impl S3Error {
    /// The store's own error code, or the transport failure reason when the
    /// request never got a service response.
    pub fn code(&self) -> &str {
        match self {
            S3Error::NotFound(_) => "NoSuchKey",
            S3Error::BucketNotFound(_) => "NoSuchBucket",
            S3Error::Service { code, .. } => code,
            S3Error::Transport { reason, .. } => reason,
            S3Error::Presign(_) => "presign_failure",
        }
    }
}

/// Out-of-band attributes written alongside an object's bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectAttributes {
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// One entry of a bucket listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Result of a HEAD on a single object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHead {
    pub size: u64,
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPartInfo {
    pub part_number: i32,
    pub e_tag: String,
}

/// S3 client trait that both real and mock implementations use
#[async_trait]
pub trait S3Client: Send + Sync {
    /// List every object under `prefix`, following continuation tokens until
    /// the listing is exhausted.
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<ObjectSummary>, S3Error>;

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectHead, S3Error>;

    /// Single-request upload, for bodies that fit in one part
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        attributes: &ObjectAttributes,
    ) -> Result<(), S3Error>;

    /// Returns the upload id
    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        attributes: &ObjectAttributes,
    ) -> Result<String, S3Error>;

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<CompletedPartInfo, S3Error>;

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPartInfo>,
    ) -> Result<(), S3Error>;

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), S3Error>;

    /// Time-limited GET url for one object
    async fn presign_get(&self, bucket: &str, key: &str, ttl: Duration)
        -> Result<String, S3Error>;

    async fn head_bucket(&self, bucket: &str) -> Result<(), S3Error>;

    /// `None` means the store did not report a location constraint
    async fn bucket_region(&self, bucket: &str) -> Result<Option<String>, S3Error>;
}
