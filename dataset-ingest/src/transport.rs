use std::sync::Arc;

use bytes::Bytes;
use common_s3::{CompletedPartInfo, ObjectAttributes, S3Client};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use unicode_normalization::UnicodeNormalization;

use crate::{
    error::IngestError,
    hasher::ContentDigest,
    metadata::MetadataRecord,
    metric_consts::{ABORTED_MULTIPART_UPLOADS, UPLOAD_PARTS},
    progress::ProgressTracker,
};

pub const HDF5_CONTENT_TYPE: &str = "application/x-hdf";

/// Moves one file into the bucket.
///
/// Bodies that fit in a single part go up in one request. Anything larger is
/// sent as a multipart upload, which keeps memory bounded by the part size and
/// lifts the 5 GB single-request ceiling. Metadata travels with the initiating
/// request either way, so the object never becomes visible without it.
#[derive(Clone)]
pub struct UploadTransport {
    client: Arc<dyn S3Client>,
    bucket: String,
    part_size: usize,
}

impl UploadTransport {
    pub fn new(client: Arc<dyn S3Client>, bucket: String, part_size: usize) -> Self {
        Self {
            client,
            bucket,
            part_size: part_size.max(1),
        }
    }

    pub async fn upload<R>(
        &self,
        mut source: R,
        size: u64,
        key: &str,
        metadata: &MetadataRecord,
        progress: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<(), IngestError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let attributes = ObjectAttributes {
            content_type: Some(HDF5_CONTENT_TYPE.to_string()),
            metadata: metadata.to_object_metadata(),
        };

        if size <= self.part_size as u64 {
            self.upload_single(&mut source, size, key, &attributes, progress, cancel)
                .await
        } else {
            self.upload_multipart(&mut source, size, key, &attributes, progress, cancel)
                .await
        }
    }

    async fn upload_single<R>(
        &self,
        source: &mut R,
        size: u64,
        key: &str,
        attributes: &ObjectAttributes,
        progress: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<(), IngestError>
    where
        R: AsyncRead + Unpin + Send,
    {
        // size <= part_size here, so it fits in usize
        let body = read_chunk(source, size as usize).await?;
        ensure_size(key, body.len() as u64, size)?;
        if !at_eof(source).await? {
            return Err(source_changed(key, size));
        }

        let len = body.len() as u64;
        tokio::select! {
            _ = cancel.cancelled() => return Err(IngestError::Cancelled),
            result = self.client.put_object(&self.bucket, key, body, attributes) => {
                result.map_err(IngestError::transfer_failure)?;
            }
        }
        progress.advance(len);
        debug!(key, bytes = len, "uploaded in a single request");
        Ok(())
    }

    async fn upload_multipart<R>(
        &self,
        source: &mut R,
        size: u64,
        key: &str,
        attributes: &ObjectAttributes,
        progress: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<(), IngestError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let upload_id = self
            .client
            .create_multipart_upload(&self.bucket, key, attributes)
            .await
            .map_err(IngestError::transfer_failure)?;
        debug!(key, upload_id = %upload_id, "started multipart upload");

        let result = match self
            .send_parts(source, size, key, &upload_id, progress, cancel)
            .await
        {
            Ok(parts) => {
                let count = parts.len();
                self.client
                    .complete_multipart_upload(&self.bucket, key, &upload_id, parts)
                    .await
                    .map_err(IngestError::transfer_failure)
                    .map(|_| count)
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(parts) => {
                info!(key, parts, bytes = size, "completed multipart upload");
                Ok(())
            }
            Err(e) => {
                self.abort(key, &upload_id).await;
                Err(e)
            }
        }
    }

    async fn send_parts<R>(
        &self,
        source: &mut R,
        size: u64,
        key: &str,
        upload_id: &str,
        progress: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<Vec<CompletedPartInfo>, IngestError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut parts = Vec::new();
        let mut sent = 0u64;
        let mut part_number = 1i32;

        loop {
            if cancel.is_cancelled() {
                return Err(IngestError::Cancelled);
            }

            let body = read_chunk(source, self.part_size).await?;
            if body.is_empty() {
                break;
            }
            let len = body.len() as u64;
            if sent + len > size {
                return Err(source_changed(key, size));
            }

            let part = tokio::select! {
                _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                result = self.client.upload_part(&self.bucket, key, upload_id, part_number, body) => {
                    result.map_err(IngestError::transfer_failure)?
                }
            };

            sent += len;
            progress.advance(len);
            metrics::counter!(UPLOAD_PARTS).increment(1);
            debug!(key, part_number, bytes = len, sent, "uploaded part");

            parts.push(part);
            part_number += 1;
        }

        ensure_size(key, sent, size)?;
        Ok(parts)
    }

    // Best effort: a failed abort leaves parts for the bucket's lifecycle rules
    async fn abort(&self, key: &str, upload_id: &str) {
        metrics::counter!(ABORTED_MULTIPART_UPLOADS).increment(1);
        match self
            .client
            .abort_multipart_upload(&self.bucket, key, upload_id)
            .await
        {
            Ok(()) => debug!(key, upload_id, "aborted multipart upload"),
            Err(e) => warn!(key, upload_id, error = %e, "failed to abort multipart upload"),
        }
    }
}

// Fill up to `limit` bytes, stopping early only at end of input
async fn read_chunk<R>(source: &mut R, limit: usize) -> std::io::Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; limit];
    let mut filled = 0;
    while filled < limit {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(Bytes::from(buf))
}

async fn at_eof<R>(source: &mut R) -> std::io::Result<bool>
where
    R: AsyncRead + Unpin,
{
    let mut byte = [0u8; 1];
    Ok(source.read(&mut byte).await? == 0)
}

fn ensure_size(key: &str, read: u64, expected: u64) -> Result<(), IngestError> {
    if read == expected {
        Ok(())
    } else {
        Err(source_changed(key, expected))
    }
}

fn source_changed(key: &str, expected: u64) -> IngestError {
    IngestError::TransferFailure {
        code: "source_changed".to_string(),
        message: format!("source for {key} no longer matches its hashed size of {expected} bytes"),
    }
}

/// Reduce a client-supplied file name to a safe ASCII base name: directory
/// parts dropped, accented letters folded to their base letter, whitespace
/// turned into `_`, anything outside `[A-Za-z0-9._-]` removed, and leading or
/// trailing `.`/`_` trimmed.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let folded: String = base.nfkd().collect();
    let cleaned: String = folded
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    cleaned.trim_matches(|c| c == '.' || c == '_').to_string()
}

/// Storage key for a file: `{stem}_{digest}{ext}`. Identical content under the
/// same name always lands on the same key.
pub fn derive_key(filename: &str, digest: &ContentDigest) -> Result<String, IngestError> {
    let safe = sanitize_filename(filename);
    if safe.is_empty() {
        return Err(IngestError::InvalidInput(format!(
            "file name {filename:?} has no usable characters"
        )));
    }

    let (stem, ext) = match safe.rfind('.') {
        Some(dot) if dot > 0 => safe.split_at(dot),
        _ => (safe.as_str(), ""),
    };
    // A name whose stem was stripped away entirely would lose its extension
    if filename.contains('.') && ext.is_empty() {
        return Err(IngestError::InvalidInput(format!(
            "file name {filename:?} has no usable characters before its extension"
        )));
    }
    Ok(format!("{stem}_{digest}{ext}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::{ContentHasher, DigestWidth};
    use crate::metadata::MetadataField;
    use common_s3::{MockS3Client, S3Error, S3Op};

    const BUCKET: &str = "datasets";

    fn transport(client: &MockS3Client, part_size: usize) -> UploadTransport {
        UploadTransport::new(Arc::new(client.clone()), BUCKET.to_string(), part_size)
    }

    fn metadata() -> MetadataRecord {
        let mut record = MetadataRecord::default();
        record.set(MetadataField::DatasetName, "hw");
        record.set(MetadataField::FileSize, "10");
        record
    }

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("sub-01_hw.hdf5"), "sub-01_hw.hdf5");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\data\\my file.h5"), "my_file.h5");
        assert_eq!(sanitize_filename("..hidden.h5"), "hidden.h5");
        assert_eq!(sanitize_filename("café data.h5"), "cafe_data.h5");
        assert_eq!(sanitize_filename("ünïcødé.h5"), "unicde.h5");
        assert_eq!(sanitize_filename("_.h5"), "h5");
        assert_eq!(sanitize_filename("日本.h5"), "h5");
        assert_eq!(sanitize_filename("///"), "");
    }

    #[test]
    fn test_derive_key() {
        let digest = ContentHasher::new(8192, DigestWidth::default()).hash_bytes(b"123456789");
        assert_eq!(
            derive_key("sub-01_hw.hdf5", &digest).unwrap(),
            "sub-01_hw_cbf43926.hdf5"
        );
        assert_eq!(derive_key("a.b.h5", &digest).unwrap(), "a.b_cbf43926.h5");
        assert_eq!(derive_key("noext", &digest).unwrap(), "noext_cbf43926");
        for name in ["/", "_.h5", "..h5", "日本.h5"] {
            assert!(
                matches!(derive_key(name, &digest), Err(IngestError::InvalidInput(_))),
                "{name} should be rejected"
            );
        }

        let short = ContentHasher::new(8192, DigestWidth::new(4).unwrap()).hash_bytes(b"123456789");
        assert_eq!(derive_key("x.h5", &short).unwrap(), "x_cbf4.h5");
    }

    #[tokio::test]
    async fn test_small_file_single_put_with_metadata() {
        let client = MockS3Client::new().with_bucket(BUCKET);
        let body = data(10);
        let progress = ProgressTracker::new(10);

        transport(&client, 64)
            .upload(
                &body[..],
                10,
                "hw_x.h5",
                &metadata(),
                &progress,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(client.count_calls(S3Op::PutObject), 1);
        assert_eq!(client.count_calls(S3Op::CreateMultipartUpload), 0);
        let stored = client.object(BUCKET, "hw_x.h5").unwrap();
        assert_eq!(stored.body.as_ref(), &body[..]);
        assert_eq!(stored.attributes.metadata["dataset_name"], "hw");
        assert_eq!(
            stored.attributes.content_type.as_deref(),
            Some("application/x-hdf")
        );
        assert_eq!(progress.snapshot().transferred, 10);
    }

    #[tokio::test]
    async fn test_large_file_goes_multipart() {
        let client = MockS3Client::new().with_bucket(BUCKET);
        let body = data(250);
        let progress = ProgressTracker::new(250);
        let mut rx = progress.subscribe();

        transport(&client, 100)
            .upload(
                &body[..],
                250,
                "big.h5",
                &metadata(),
                &progress,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(client.count_calls(S3Op::UploadPart), 3);
        assert_eq!(client.count_calls(S3Op::PutObject), 0);
        assert_eq!(client.pending_uploads(), 0);
        assert_eq!(client.object(BUCKET, "big.h5").unwrap().body.as_ref(), &body[..]);
        assert_eq!(rx.borrow_and_update().transferred, 250);
    }

    #[tokio::test]
    async fn test_part_failure_aborts_and_leaves_no_object() {
        let client = MockS3Client::new().with_bucket(BUCKET).fail_after(
            S3Op::UploadPart,
            1,
            S3Error::Transport {
                reason: "connection_error".to_string(),
                message: "reset by peer".to_string(),
            },
        );
        let body = data(250);
        let progress = ProgressTracker::new(250);

        let result = transport(&client, 100)
            .upload(
                &body[..],
                250,
                "big.h5",
                &metadata(),
                &progress,
                &CancellationToken::new(),
            )
            .await;

        match result {
            Err(IngestError::TransferFailure { code, .. }) => assert_eq!(code, "connection_error"),
            other => panic!("expected TransferFailure, got {other:?}"),
        }
        assert_eq!(client.count_calls(S3Op::AbortMultipartUpload), 1);
        assert_eq!(client.pending_uploads(), 0);
        assert!(client.object(BUCKET, "big.h5").is_none());
        // only the part that made it counts
        assert_eq!(progress.snapshot().transferred, 100);
    }

    #[tokio::test]
    async fn test_complete_failure_aborts() {
        let client = MockS3Client::new().with_bucket(BUCKET).fail_on(
            S3Op::CompleteMultipartUpload,
            S3Error::Service {
                code: "InternalError".to_string(),
                message: "try again".to_string(),
            },
        );
        let body = data(250);

        let result = transport(&client, 100)
            .upload(
                &body[..],
                250,
                "big.h5",
                &metadata(),
                &ProgressTracker::new(250),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(IngestError::TransferFailure { .. })));
        assert_eq!(client.count_calls(S3Op::AbortMultipartUpload), 1);
        assert!(client.object(BUCKET, "big.h5").is_none());
    }

    #[tokio::test]
    async fn test_cancelled_before_parts() {
        let client = MockS3Client::new().with_bucket(BUCKET);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let body = data(250);

        let result = transport(&client, 100)
            .upload(
                &body[..],
                250,
                "big.h5",
                &metadata(),
                &ProgressTracker::new(250),
                &cancel,
            )
            .await;

        assert!(matches!(result, Err(IngestError::Cancelled)));
        assert_eq!(client.count_calls(S3Op::UploadPart), 0);
        assert_eq!(client.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn test_source_shorter_than_declared_size() {
        let client = MockS3Client::new().with_bucket(BUCKET);
        let body = data(150);

        let result = transport(&client, 100)
            .upload(
                &body[..],
                250,
                "big.h5",
                &metadata(),
                &ProgressTracker::new(250),
                &CancellationToken::new(),
            )
            .await;

        match result {
            Err(IngestError::TransferFailure { code, .. }) => assert_eq!(code, "source_changed"),
            other => panic!("expected TransferFailure, got {other:?}"),
        }
        assert!(client.object(BUCKET, "big.h5").is_none());
        assert_eq!(client.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn test_source_longer_than_declared_size() {
        let client = MockS3Client::new().with_bucket(BUCKET);
        let body = data(20);

        let result = transport(&client, 100)
            .upload(
                &body[..],
                10,
                "small.h5",
                &metadata(),
                &ProgressTracker::new(10),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(IngestError::TransferFailure { .. })));
        assert_eq!(client.count_calls(S3Op::PutObject), 0);
    }
}
