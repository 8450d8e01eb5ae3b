use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use common_s3::S3Client;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    catalog::{has_extension, Catalog},
    config::Config,
    dedup::DedupIndex,
    error::IngestError,
    hasher::ContentHasher,
    metadata::{MetadataExtractor, MetadataField, MetadataRecord},
    metric_consts::{DUPLICATES_REJECTED, UPLOADS, UPLOAD_BYTES, UPLOAD_TIME},
    progress::{Progress, ProgressTracker},
    transport::{derive_key, sanitize_filename, UploadTransport},
};

pub const UPLOAD_SUCCESS_MESSAGE: &str = "File uploaded successfully";

/// Where one upload attempt currently stands.
///
/// `Pending -> Hashing -> DedupChecking -> (RejectedDuplicate | Transferring)
/// -> (Committed | Failed)`. Any step may also fall through to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    Pending,
    Hashing,
    DedupChecking,
    RejectedDuplicate,
    Transferring,
    Committed,
    Failed,
}

impl UploadState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadState::Committed | UploadState::Failed | UploadState::RejectedDuplicate
        )
    }
}

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub path: PathBuf,
    /// Name the file was submitted under; the key is derived from it
    pub filename: String,
    /// Submitted values that override attributes read from the file
    pub form_fields: HashMap<String, String>,
}

impl UploadRequest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            path,
            filename,
            form_fields: HashMap::new(),
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.form_fields.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadReceipt {
    pub message: String,
    pub key: String,
    pub metadata: MetadataRecord,
}

/// Runs uploads end to end. Cheap to clone; every attempt gets its own
/// metadata record, digest and dedup snapshot, nothing is shared between them.
#[derive(Clone)]
pub struct IngestService {
    extractor: MetadataExtractor,
    hasher: ContentHasher,
    catalog: Catalog,
    transport: UploadTransport,
    extensions: Vec<String>,
    max_upload_bytes: u64,
}

impl IngestService {
    pub fn new(
        config: &Config,
        client: Arc<dyn S3Client>,
        extractor: MetadataExtractor,
    ) -> Result<Self, IngestError> {
        let extensions = config.extensions();
        Ok(Self {
            extractor,
            hasher: ContentHasher::new(config.hash_block_size, config.digest_width()?),
            catalog: Catalog::new(client.clone(), config.s3_bucket.clone(), extensions.clone()),
            transport: UploadTransport::new(
                client,
                config.s3_bucket.clone(),
                config.upload_part_size,
            ),
            extensions,
            max_upload_bytes: config.max_upload_bytes,
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Upload and wait for the outcome
    pub async fn upload(&self, request: UploadRequest) -> Result<UploadReceipt, IngestError> {
        let attempt = Attempt::new();
        self.run(request, &attempt).await
    }

    /// Start an upload in the background. The returned handle reports state
    /// and progress while it runs and can cancel it before commit.
    pub fn start_upload(&self, request: UploadRequest) -> UploadHandle {
        let attempt = Attempt::new();
        let state = attempt.state.subscribe();
        let progress = attempt.progress.subscribe();
        let cancel = attempt.cancel.clone();

        let service = self.clone();
        let task = tokio::spawn(async move { service.run(request, &attempt).await });

        UploadHandle {
            state,
            progress,
            cancel,
            task,
        }
    }

    async fn run(
        &self,
        request: UploadRequest,
        attempt: &Attempt,
    ) -> Result<UploadReceipt, IngestError> {
        let started = Instant::now();
        let filename = request.filename.clone();
        let result = self.attempt(request, attempt).await;

        match &result {
            Ok(receipt) => {
                metrics::counter!(UPLOADS, "outcome" => "committed").increment(1);
                metrics::histogram!(UPLOAD_TIME).record(started.elapsed().as_millis() as f64);
                info!(filename = %filename, key = %receipt.key, "upload committed");
            }
            Err(e) => {
                if !matches!(e, IngestError::DuplicateContent { .. }) {
                    attempt.enter(UploadState::Failed);
                }
                metrics::counter!(UPLOADS, "outcome" => e.reason_code()).increment(1);
                if e.is_user_facing() {
                    info!(filename = %filename, reason = e.reason_code(), "upload rejected: {e}");
                } else {
                    error!(filename = %filename, reason = e.reason_code(), "upload failed: {e}");
                }
            }
        }
        result
    }

    async fn attempt(
        &self,
        request: UploadRequest,
        attempt: &Attempt,
    ) -> Result<UploadReceipt, IngestError> {
        let UploadRequest {
            path,
            filename,
            form_fields,
        } = request;

        if filename.trim().is_empty() {
            return Err(IngestError::InvalidInput("no file name given".to_string()));
        }
        // Checked on the name the key is built from, so the key keeps its extension
        if !has_extension(&sanitize_filename(&filename), &self.extensions) {
            return Err(IngestError::InvalidInput(format!(
                "{filename} does not have an allowed extension ({})",
                self.extensions.join(", ")
            )));
        }

        let stat = tokio::fs::metadata(&path).await?;
        if !stat.is_file() {
            return Err(IngestError::InvalidInput(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        let size = stat.len();
        if size > self.max_upload_bytes {
            return Err(IngestError::OversizeInput {
                size,
                limit: self.max_upload_bytes,
            });
        }
        attempt.progress.set_total(size);

        let extractor = self.extractor.clone();
        let extract_from = path.clone();
        let mut metadata = tokio::task::spawn_blocking(move || extractor.extract(&extract_from))
            .await
            .map_err(|e| IngestError::Io(std::io::Error::other(e)))?;
        metadata.overlay(&MetadataRecord::from_map(&form_fields));

        attempt.check_cancelled()?;
        attempt.enter(UploadState::Hashing);
        let digest = self.hasher.hash_path(path.clone()).await?;
        let key = derive_key(&filename, &digest)?;

        attempt.check_cancelled()?;
        attempt.enter(UploadState::DedupChecking);
        let index = DedupIndex::build(&self.catalog).await?;
        if let Some(existing) = index.find(&digest.as_hex()) {
            attempt.enter(UploadState::RejectedDuplicate);
            metrics::counter!(DUPLICATES_REJECTED).increment(1);
            return Err(IngestError::DuplicateContent {
                digest: digest.as_hex(),
                existing_key: existing.to_string(),
            });
        }

        // Computed values always win over anything the file or form claimed
        metadata.set(MetadataField::FileSize, size.to_string());
        metadata.set(MetadataField::Crc32Hash, digest.as_hex());

        attempt.check_cancelled()?;
        attempt.enter(UploadState::Transferring);
        let file = tokio::fs::File::open(&path).await?;
        self.transport
            .upload(
                file,
                size,
                &key,
                &metadata,
                &attempt.progress,
                &attempt.cancel,
            )
            .await?;
        metrics::counter!(UPLOAD_BYTES).increment(size);

        attempt.enter(UploadState::Committed);
        Ok(UploadReceipt {
            message: UPLOAD_SUCCESS_MESSAGE.to_string(),
            key,
            metadata,
        })
    }
}

struct Attempt {
    state: watch::Sender<UploadState>,
    progress: ProgressTracker,
    cancel: CancellationToken,
}

impl Attempt {
    fn new() -> Self {
        let (state, _) = watch::channel(UploadState::Pending);
        Self {
            state,
            progress: ProgressTracker::new(0),
            cancel: CancellationToken::new(),
        }
    }

    fn enter(&self, next: UploadState) {
        debug!(state = ?next, "upload state");
        self.state.send_replace(next);
    }

    fn check_cancelled(&self) -> Result<(), IngestError> {
        if self.cancel.is_cancelled() {
            Err(IngestError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A running upload started with [`IngestService::start_upload`].
pub struct UploadHandle {
    state: watch::Receiver<UploadState>,
    progress: watch::Receiver<Progress>,
    cancel: CancellationToken,
    task: JoinHandle<Result<UploadReceipt, IngestError>>,
}

impl UploadHandle {
    pub fn state(&self) -> UploadState {
        *self.state.borrow()
    }

    pub fn state_updates(&self) -> watch::Receiver<UploadState> {
        self.state.clone()
    }

    pub fn progress(&self) -> Progress {
        *self.progress.borrow()
    }

    pub fn progress_updates(&self) -> watch::Receiver<Progress> {
        self.progress.clone()
    }

    /// Stop before commit. A multipart upload in flight is aborted; once the
    /// object is committed cancelling has no effect.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this upload, for cancelling from elsewhere
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn wait(self) -> Result<UploadReceipt, IngestError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(IngestError::Cancelled),
        }
    }
}
