use std::time::Duration;

use common_s3::S3Config;
use envconfig::Envconfig;
use tracing::warn;

use crate::{error::IngestError, hasher::DigestWidth};

// S3 rejects multipart parts smaller than this, except the last one
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

// Most parts a single multipart upload may have
pub const MAX_PARTS: u64 = 10_000;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "S3_BUCKET")]
    pub s3_bucket: String,

    #[envconfig(from = "AWS_REGION", default = "us-east-1")]
    pub aws_region: String,

    // Set for MinIO/localstack, leave unset for AWS
    #[envconfig(from = "OBJECT_STORAGE_ENDPOINT")]
    pub object_storage_endpoint: Option<String>,

    #[envconfig(from = "OBJECT_STORAGE_ACCESS_KEY_ID")]
    pub object_storage_access_key_id: Option<String>,

    #[envconfig(from = "OBJECT_STORAGE_SECRET_ACCESS_KEY")]
    pub object_storage_secret_access_key: Option<String>,

    #[envconfig(from = "MAX_UPLOAD_BYTES", default = "32212254720")] // 30 GiB
    pub max_upload_bytes: u64,

    // Hex characters of the crc32 kept in keys and metadata. Anything under 8 throws
    // away digest bits and makes accidental collisions more likely.
    #[envconfig(from = "CONTENT_HASH_LENGTH", default = "8")]
    pub content_hash_length: usize,

    #[envconfig(from = "HASH_BLOCK_SIZE", default = "8192")]
    pub hash_block_size: usize,

    #[envconfig(from = "UPLOAD_PART_SIZE", default = "67108864")] // 64 MiB
    pub upload_part_size: usize,

    #[envconfig(from = "ALLOWED_EXTENSIONS", default = "hdf5,h5")]
    pub allowed_extensions: String,

    #[envconfig(from = "DOWNLOAD_LINK_TTL_SECONDS", default = "3600")]
    pub download_link_ttl_seconds: u64,

    #[envconfig(from = "S3_OPERATION_TIMEOUT_SECONDS", default = "300")]
    pub s3_operation_timeout_seconds: u64,
}

impl Config {
    pub fn init_validated() -> Result<Self, IngestError> {
        let config = Self::init_from_env().map_err(|e| IngestError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        if self.s3_bucket.trim().is_empty() {
            return Err(IngestError::Config("S3_BUCKET must not be empty".to_string()));
        }

        let width = self.digest_width()?;
        if width.is_truncated() {
            warn!(
                content_hash_length = self.content_hash_length,
                distinct_digests = width.distinct_values(),
                "content hash is truncated below the native crc32 width, accidental collisions are more likely"
            );
        }

        if self.hash_block_size == 0 {
            return Err(IngestError::Config(
                "HASH_BLOCK_SIZE must be greater than zero".to_string(),
            ));
        }

        if self.upload_part_size < MIN_PART_SIZE {
            return Err(IngestError::Config(format!(
                "UPLOAD_PART_SIZE must be at least {MIN_PART_SIZE} bytes, got {}",
                self.upload_part_size
            )));
        }

        let parts_needed = self.max_upload_bytes.div_ceil(self.upload_part_size as u64);
        if parts_needed > MAX_PARTS {
            return Err(IngestError::Config(format!(
                "UPLOAD_PART_SIZE of {} bytes needs {parts_needed} parts for a file of MAX_UPLOAD_BYTES ({}), more than the {MAX_PARTS} a multipart upload allows",
                self.upload_part_size, self.max_upload_bytes
            )));
        }

        if self.extensions().is_empty() {
            return Err(IngestError::Config(
                "ALLOWED_EXTENSIONS must name at least one extension".to_string(),
            ));
        }

        Ok(())
    }

    pub fn digest_width(&self) -> Result<DigestWidth, IngestError> {
        DigestWidth::new(self.content_hash_length)
    }

    /// Lowercased, without leading dots
    pub fn extensions(&self) -> Vec<String> {
        self.allowed_extensions
            .split(',')
            .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect()
    }

    pub fn download_link_ttl(&self) -> Duration {
        Duration::from_secs(self.download_link_ttl_seconds)
    }

    pub fn s3_config(&self) -> S3Config {
        S3Config {
            region: self.aws_region.clone(),
            endpoint: self.object_storage_endpoint.clone(),
            access_key_id: self.object_storage_access_key_id.clone(),
            secret_access_key: self.object_storage_secret_access_key.clone(),
            operation_timeout: Duration::from_secs(self.s3_operation_timeout_seconds),
        }
    }
}
