use async_trait::async_trait;
use aws_config::{timeout::TimeoutConfig, BehaviorVersion};
use aws_sdk_s3::{
    config::{http::HttpResponse, Credentials, Region},
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    presigning::PresigningConfig,
    primitives::{ByteStream, DateTime as AwsDateTime},
    types::{CompletedMultipartUpload, CompletedPart},
    Client as AwsS3SdkClient,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{error, info};

use crate::{CompletedPartInfo, ObjectAttributes, ObjectHead, ObjectSummary, S3Client, S3Error};

/// Configuration for creating an S3 client.
#[derive(Debug, Clone)]
pub struct S3Config {
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub operation_timeout: Duration,
}

/// Real S3 client implementation
#[derive(Clone)]
pub struct S3Impl {
    client: AwsS3SdkClient,
}

impl S3Impl {
    pub fn new(client: AwsS3SdkClient) -> Self {
        Self { client }
    }

    /// Build a client from configuration.
    ///
    /// Uses the default AWS credential chain (IRSA, env vars, instance profile, etc.)
    /// unless explicit credentials are provided in the config.
    pub async fn from_config(config: &S3Config) -> Self {
        let region = Region::new(config.region.clone());

        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(region.clone())
            .load()
            .await;

        let timeout_config = TimeoutConfig::builder()
            .operation_timeout(config.operation_timeout)
            .build();

        let mut builder = aws_sdk_s3::config::Builder::from(&aws_config)
            .region(region)
            .timeout_config(timeout_config);

        // Custom endpoints are MinIO/localstack, which need path-style addressing
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        if let (Some(access_key), Some(secret_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            let credentials = Credentials::new(access_key, secret_key, None, None, "env");
            builder = builder.credentials_provider(credentials);
        }

        info!(
            region = %config.region,
            endpoint = ?config.endpoint,
            "S3 client initialized"
        );

        Self::new(AwsS3SdkClient::from_conf(builder.build()))
    }
}

#[derive(Clone, Copy)]
enum Scope {
    Bucket,
    Object,
}

fn transport(reason: &str, message: String) -> S3Error {
    S3Error::Transport {
        reason: reason.to_string(),
        message,
    }
}

/// Map an SDK failure onto our error type, keeping the service's error code verbatim.
fn classify<E>(err: SdkError<E, HttpResponse>, bucket: &str, key: &str, scope: Scope) -> S3Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let message = DisplayErrorContext(&err).to_string();
    let classified = match &err {
        SdkError::TimeoutError(_) => transport("timeout", message),
        SdkError::DispatchFailure(_) => transport("connection_error", message),
        SdkError::ConstructionFailure(_) => transport("construction_failure", message),
        SdkError::ResponseError(e) => transport(
            &format!("response_error_{}", e.raw().status().as_u16()),
            message,
        ),
        SdkError::ServiceError(e) => {
            let code = e
                .err()
                .code()
                .map(str::to_string)
                .unwrap_or_else(|| format!("status_{}", e.raw().status().as_u16()));
            match (code.as_str(), scope) {
                ("NoSuchBucket", _) => S3Error::BucketNotFound(bucket.to_string()),
                ("NoSuchKey", _) => S3Error::NotFound(key.to_string()),
                // HEAD responses carry no body, so a 404 arrives without a specific code
                ("NotFound" | "status_404", Scope::Bucket) => {
                    S3Error::BucketNotFound(bucket.to_string())
                }
                ("NotFound" | "status_404", Scope::Object) => S3Error::NotFound(key.to_string()),
                _ => S3Error::Service { code, message },
            }
        }
        _ => transport("unknown", message),
    };

    if !matches!(classified, S3Error::NotFound(_)) {
        error!(bucket, key, error = %classified, "S3 request failed");
    }
    classified
}

fn to_utc(dt: &AwsDateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}

fn to_size(size: Option<i64>) -> u64 {
    size.and_then(|s| u64::try_from(s).ok()).unwrap_or(0)
}

fn metadata_or_none(attributes: &ObjectAttributes) -> Option<std::collections::HashMap<String, String>> {
    if attributes.metadata.is_empty() {
        None
    } else {
        Some(attributes.metadata.clone())
    }
}

#[async_trait]
impl S3Client for S3Impl {
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<ObjectSummary>, S3Error> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .set_prefix(prefix.map(str::to_string))
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| classify(e, bucket, "", Scope::Bucket))?;

            for object in output.contents() {
                let Some(key) = object.key() else {
                    continue;
                };
                objects.push(ObjectSummary {
                    key: key.to_string(),
                    size: to_size(object.size()),
                    last_modified: object.last_modified().and_then(to_utc),
                });
            }

            match (output.is_truncated(), output.next_continuation_token()) {
                (Some(true), Some(token)) => continuation = Some(token.to_string()),
                _ => break,
            }
        }

        Ok(objects)
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectHead, S3Error> {
        let output = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(e, bucket, key, Scope::Object))?;

        Ok(ObjectHead {
            size: to_size(output.content_length()),
            content_type: output.content_type().map(str::to_string),
            metadata: output.metadata().cloned().unwrap_or_default(),
            last_modified: output.last_modified().and_then(to_utc),
        })
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        attributes: &ObjectAttributes,
    ) -> Result<(), S3Error> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .set_content_type(attributes.content_type.clone())
            .set_metadata(metadata_or_none(attributes))
            .send()
            .await
            .map_err(|e| classify(e, bucket, key, Scope::Object))
            .map(|_| ()) // We don't care about the result as long as it's success
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        attributes: &ObjectAttributes,
    ) -> Result<String, S3Error> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .set_content_type(attributes.content_type.clone())
            .set_metadata(metadata_or_none(attributes))
            .send()
            .await
            .map_err(|e| classify(e, bucket, key, Scope::Object))?;

        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| S3Error::Service {
                code: "MissingUploadId".to_string(),
                message: format!("CreateMultipartUpload for {key} returned no upload id"),
            })
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<CompletedPartInfo, S3Error> {
        let output = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| classify(e, bucket, key, Scope::Object))?;

        let e_tag = output.e_tag().ok_or_else(|| S3Error::Service {
            code: "MissingETag".to_string(),
            message: format!("UploadPart {part_number} for {key} returned no ETag"),
        })?;

        Ok(CompletedPartInfo {
            part_number,
            e_tag: e_tag.to_string(),
        })
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPartInfo>,
    ) -> Result<(), S3Error> {
        let parts = parts
            .into_iter()
            .map(|p| {
                CompletedPart::builder()
                    .part_number(p.part_number)
                    .e_tag(p.e_tag)
                    .build()
            })
            .collect();

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| classify(e, bucket, key, Scope::Object))
            .map(|_| ())
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), S3Error> {
        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| classify(e, bucket, key, Scope::Object))
            .map(|_| ())
    }

    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<String, S3Error> {
        let presigning =
            PresigningConfig::expires_in(ttl).map_err(|e| S3Error::Presign(e.to_string()))?;

        let request = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| classify(e, bucket, key, Scope::Object))?;

        Ok(request.uri().to_string())
    }

    // Simply assert we can reach the bucket, returning an error if not. This is
    // useful during app startup to ensure the bucket is accessible.
    async fn head_bucket(&self, bucket: &str) -> Result<(), S3Error> {
        self.client
            .head_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| classify(e, bucket, "", Scope::Bucket))
            .map(|_| ())
    }

    async fn bucket_region(&self, bucket: &str) -> Result<Option<String>, S3Error> {
        let output = self
            .client
            .get_bucket_location()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| classify(e, bucket, "", Scope::Bucket))?;

        Ok(output
            .location_constraint()
            .map(|c| c.as_str().to_string())
            .filter(|c| !c.is_empty()))
    }
}
