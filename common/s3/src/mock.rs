use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{CompletedPartInfo, ObjectAttributes, ObjectHead, ObjectSummary, S3Client, S3Error};

/// The operations the mock records, and that failures can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum S3Op {
    ListObjects,
    HeadObject,
    PutObject,
    CreateMultipartUpload,
    UploadPart,
    CompleteMultipartUpload,
    AbortMultipartUpload,
    PresignGet,
    HeadBucket,
    BucketRegion,
}

impl S3Op {
    /// Whether the operation sends object bytes or attributes to the store.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            S3Op::PutObject
                | S3Op::CreateMultipartUpload
                | S3Op::UploadPart
                | S3Op::CompleteMultipartUpload
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Bytes,
    pub attributes: ObjectAttributes,
    pub last_modified: DateTime<Utc>,
}

#[derive(Default)]
struct MockBucket {
    region: Option<String>,
    objects: BTreeMap<String, StoredObject>,
}

struct PendingUpload {
    bucket: String,
    key: String,
    attributes: ObjectAttributes,
    parts: BTreeMap<i32, Bytes>,
}

struct InjectedFailure {
    remaining_ok: usize,
    error: S3Error,
}

#[derive(Default)]
struct MockState {
    buckets: HashMap<String, MockBucket>,
    uploads: HashMap<String, PendingUpload>,
    next_upload_id: u64,
    calls: Vec<S3Op>,
    failures: HashMap<S3Op, InjectedFailure>,
}

impl MockState {
    fn record(&mut self, op: S3Op) -> Result<(), S3Error> {
        self.calls.push(op);
        match self.failures.get_mut(&op) {
            Some(failure) if failure.remaining_ok == 0 => Err(failure.error.clone()),
            Some(failure) => {
                failure.remaining_ok -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn bucket(&mut self, bucket: &str) -> Result<&mut MockBucket, S3Error> {
        self.buckets
            .get_mut(bucket)
            .ok_or_else(|| S3Error::BucketNotFound(bucket.to_string()))
    }

    fn upload(&mut self, upload_id: &str, key: &str) -> Result<&mut PendingUpload, S3Error> {
        self.uploads
            .get_mut(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| no_such_upload(upload_id, key))
    }
}

fn no_such_upload(upload_id: &str, key: &str) -> S3Error {
    S3Error::Service {
        code: "NoSuchUpload".to_string(),
        message: format!("unknown upload {upload_id} for {key}"),
    }
}

/// Mock S3 client for testing - always available, no conditional compilation needed.
///
/// Behaves like a small in-memory object store: objects written through it can be
/// listed and read back, multipart uploads are assembled on completion, and every
/// call is recorded so tests can assert on what did (or did not) reach the store.
/// Clones share state.
#[derive(Clone, Default)]
pub struct MockS3Client {
    state: Arc<Mutex<MockState>>,
}

impl MockS3Client {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bucket(self, bucket: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .buckets
            .entry(bucket.to_string())
            .or_default();
        self
    }

    pub fn with_bucket_region(self, bucket: &str, region: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .region = Some(region.to_string());
        self
    }

    /// Seed an object directly, bypassing the call log
    pub fn with_object(
        self,
        bucket: &str,
        key: &str,
        body: impl Into<Bytes>,
        metadata: HashMap<String, String>,
    ) -> Self {
        let object = StoredObject {
            body: body.into(),
            attributes: ObjectAttributes {
                content_type: None,
                metadata,
            },
            last_modified: Utc::now(),
        };
        self.state
            .lock()
            .unwrap()
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .objects
            .insert(key.to_string(), object);
        self
    }

    /// Make every call to `op` fail with `error`
    pub fn fail_on(self, op: S3Op, error: S3Error) -> Self {
        self.fail_after(op, 0, error)
    }

    /// Let `successes` calls to `op` through, then fail every later one
    pub fn fail_after(self, op: S3Op, successes: usize, error: S3Error) -> Self {
        self.state.lock().unwrap().failures.insert(
            op,
            InjectedFailure {
                remaining_ok: successes,
                error,
            },
        );
        self
    }

    pub fn calls(&self) -> Vec<S3Op> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count_calls(&self, op: S3Op) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| **c == op)
            .count()
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.state
            .lock()
            .unwrap()
            .buckets
            .get(bucket)
            .and_then(|b| b.objects.get(key).cloned())
    }

    pub fn object_keys(&self, bucket: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .buckets
            .get(bucket)
            .map(|b| b.objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Multipart uploads created but neither completed nor aborted
    pub fn pending_uploads(&self) -> usize {
        self.state.lock().unwrap().uploads.len()
    }
}

#[async_trait]
impl S3Client for MockS3Client {
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<ObjectSummary>, S3Error> {
        let mut state = self.state.lock().unwrap();
        state.record(S3Op::ListObjects)?;
        let prefix = prefix.unwrap_or("");
        Ok(state
            .bucket(bucket)?
            .objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| ObjectSummary {
                key: key.clone(),
                size: object.body.len() as u64,
                last_modified: Some(object.last_modified),
            })
            .collect())
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectHead, S3Error> {
        let mut state = self.state.lock().unwrap();
        state.record(S3Op::HeadObject)?;
        let object = state
            .bucket(bucket)?
            .objects
            .get(key)
            .ok_or_else(|| S3Error::NotFound(key.to_string()))?;
        Ok(ObjectHead {
            size: object.body.len() as u64,
            content_type: object.attributes.content_type.clone(),
            metadata: object.attributes.metadata.clone(),
            last_modified: Some(object.last_modified),
        })
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        attributes: &ObjectAttributes,
    ) -> Result<(), S3Error> {
        let mut state = self.state.lock().unwrap();
        state.record(S3Op::PutObject)?;
        state.bucket(bucket)?.objects.insert(
            key.to_string(),
            StoredObject {
                body,
                attributes: attributes.clone(),
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        attributes: &ObjectAttributes,
    ) -> Result<String, S3Error> {
        let mut state = self.state.lock().unwrap();
        state.record(S3Op::CreateMultipartUpload)?;
        state.bucket(bucket)?;
        state.next_upload_id += 1;
        let upload_id = format!("upload-{}", state.next_upload_id);
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                attributes: attributes.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<CompletedPartInfo, S3Error> {
        let mut state = self.state.lock().unwrap();
        state.record(S3Op::UploadPart)?;
        let e_tag = format!("\"part-{part_number}-{}\"", body.len());
        state
            .upload(upload_id, key)?
            .parts
            .insert(part_number, body);
        Ok(CompletedPartInfo { part_number, e_tag })
    }

    async fn complete_multipart_upload(
        &self,
        _bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPartInfo>,
    ) -> Result<(), S3Error> {
        let mut state = self.state.lock().unwrap();
        state.record(S3Op::CompleteMultipartUpload)?;
        state.upload(upload_id, key)?;
        let upload = state
            .uploads
            .remove(upload_id)
            .ok_or_else(|| no_such_upload(upload_id, key))?;

        let mut body = BytesMut::new();
        for part in &parts {
            let data = upload
                .parts
                .get(&part.part_number)
                .ok_or_else(|| S3Error::Service {
                    code: "InvalidPart".to_string(),
                    message: format!("part {} was never uploaded", part.part_number),
                })?;
            body.extend_from_slice(data);
        }

        state.bucket(&upload.bucket)?.objects.insert(
            upload.key,
            StoredObject {
                body: body.freeze(),
                attributes: upload.attributes,
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        _bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), S3Error> {
        let mut state = self.state.lock().unwrap();
        state.record(S3Op::AbortMultipartUpload)?;
        state.upload(upload_id, key)?;
        state.uploads.remove(upload_id);
        Ok(())
    }

    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<String, S3Error> {
        let mut state = self.state.lock().unwrap();
        state.record(S3Op::PresignGet)?;
        state.bucket(bucket)?;
        Ok(format!(
            "https://{bucket}.s3.mock.local/{key}?X-Amz-Expires={}",
            ttl.as_secs()
        ))
    }

    async fn head_bucket(&self, bucket: &str) -> Result<(), S3Error> {
        let mut state = self.state.lock().unwrap();
        state.record(S3Op::HeadBucket)?;
        state.bucket(bucket).map(|_| ())
    }

    async fn bucket_region(&self, bucket: &str) -> Result<Option<String>, S3Error> {
        let mut state = self.state.lock().unwrap();
        state.record(S3Op::BucketRegion)?;
        Ok(state.bucket(bucket)?.region.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUCKET: &str = "test-bucket";

    #[tokio::test]
    async fn test_mock_put_then_list_and_head() {
        let client = MockS3Client::new().with_bucket(BUCKET);
        let attributes = ObjectAttributes {
            content_type: Some("application/x-hdf".to_string()),
            metadata: HashMap::from([("crc32_hash".to_string(), "deadbeef".to_string())]),
        };

        client
            .put_object(BUCKET, "a.h5", Bytes::from_static(b"abc"), &attributes)
            .await
            .unwrap();

        let listed = client.list_objects(BUCKET, None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "a.h5");
        assert_eq!(listed[0].size, 3);

        let head = client.head_object(BUCKET, "a.h5").await.unwrap();
        assert_eq!(head.metadata["crc32_hash"], "deadbeef");
        assert_eq!(head.content_type.as_deref(), Some("application/x-hdf"));
    }

    #[tokio::test]
    async fn test_mock_unknown_bucket() {
        let client = MockS3Client::new();
        let result = client.list_objects("nope", None).await;
        assert_eq!(result, Err(S3Error::BucketNotFound("nope".to_string())));
    }

    #[tokio::test]
    async fn test_mock_head_missing_object() {
        let client = MockS3Client::new().with_bucket(BUCKET);
        let result = client.head_object(BUCKET, "missing.h5").await;
        assert!(matches!(result, Err(S3Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_mock_multipart_assembles_in_part_order() {
        let client = MockS3Client::new().with_bucket(BUCKET);
        let attributes = ObjectAttributes::default();
        let id = client
            .create_multipart_upload(BUCKET, "big.h5", &attributes)
            .await
            .unwrap();

        let second = client
            .upload_part(BUCKET, "big.h5", &id, 2, Bytes::from_static(b"world"))
            .await
            .unwrap();
        let first = client
            .upload_part(BUCKET, "big.h5", &id, 1, Bytes::from_static(b"hello "))
            .await
            .unwrap();
        assert!(client.object(BUCKET, "big.h5").is_none());

        client
            .complete_multipart_upload(BUCKET, "big.h5", &id, vec![first, second])
            .await
            .unwrap();

        let object = client.object(BUCKET, "big.h5").unwrap();
        assert_eq!(&object.body[..], b"hello world");
        assert_eq!(client.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn test_mock_fail_after() {
        let error = S3Error::Service {
            code: "InternalError".to_string(),
            message: "boom".to_string(),
        };
        let client = MockS3Client::new()
            .with_bucket(BUCKET)
            .fail_after(S3Op::HeadBucket, 1, error.clone());

        assert!(client.head_bucket(BUCKET).await.is_ok());
        assert_eq!(client.head_bucket(BUCKET).await, Err(error));
        assert_eq!(client.count_calls(S3Op::HeadBucket), 2);
    }
}
