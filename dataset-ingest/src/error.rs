use common_s3::S3Error;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Object store unreachable ({code}): {message}")]
    StoreUnreachable { code: String, message: String },
    #[error("Identical content is already stored as {existing_key} (crc32 {digest})")]
    DuplicateContent { digest: String, existing_key: String },
    #[error("File is {size} bytes, over the configured upload limit of {limit} bytes")]
    OversizeInput { size: u64, limit: u64 },
    #[error("Transfer failed ({code}): {message}")]
    TransferFailure { code: String, message: String },
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Upload cancelled before the object was committed")]
    Cancelled,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Config error: {0}")]
    Config(String),
}

/// What callers outside the crate see when an operation fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorPayload {
    pub reason: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

impl IngestError {
    pub fn store_unreachable(err: S3Error) -> Self {
        IngestError::StoreUnreachable {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    pub fn transfer_failure(err: S3Error) -> Self {
        IngestError::TransferFailure {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    /// Stable machine-readable reason
    pub fn reason_code(&self) -> &'static str {
        match self {
            IngestError::StoreUnreachable { .. } => "store_unreachable",
            IngestError::DuplicateContent { .. } => "duplicate_content",
            IngestError::OversizeInput { .. } => "oversize_input",
            IngestError::TransferFailure { .. } => "transfer_failure",
            IngestError::InvalidInput(_) => "invalid_input",
            IngestError::NotFound(_) => "not_found",
            IngestError::Cancelled => "cancelled",
            IngestError::Io(_) => "io_error",
            IngestError::Config(_) => "config_error",
        }
    }

    /// The object store's own error code, when the failure came from the store
    pub fn store_code(&self) -> Option<&str> {
        match self {
            IngestError::StoreUnreachable { code, .. }
            | IngestError::TransferFailure { code, .. } => Some(code),
            IngestError::NotFound(_) => Some("NoSuchKey"),
            _ => None,
        }
    }

    /// Errors a user can act on, as opposed to faults in the system.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            IngestError::DuplicateContent { .. }
                | IngestError::OversizeInput { .. }
                | IngestError::InvalidInput(_)
                | IngestError::NotFound(_)
        )
    }

    pub fn payload(&self) -> ErrorPayload {
        ErrorPayload {
            reason: self.reason_code().to_string(),
            message: self.to_string(),
            store_code: self.store_code().map(str::to_string),
            limit: match self {
                IngestError::OversizeInput { limit, .. } => Some(*limit),
                _ => None,
            },
        }
    }
}

impl From<S3Error> for IngestError {
    fn from(err: S3Error) -> Self {
        match err {
            S3Error::NotFound(key) => IngestError::NotFound(key),
            other => IngestError::store_unreachable(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_keep_store_code() {
        let err = IngestError::from(S3Error::BucketNotFound("datasets".to_string()));
        assert_eq!(err.reason_code(), "store_unreachable");
        assert_eq!(err.store_code(), Some("NoSuchBucket"));

        let err = IngestError::transfer_failure(S3Error::Service {
            code: "SlowDown".to_string(),
            message: "reduce your request rate".to_string(),
        });
        let payload = err.payload();
        assert_eq!(payload.reason, "transfer_failure");
        assert_eq!(payload.store_code.as_deref(), Some("SlowDown"));
    }

    #[test]
    fn test_oversize_payload_names_limit() {
        let err = IngestError::OversizeInput {
            size: 32 * 1024 * 1024 * 1024,
            limit: 30 * 1024 * 1024 * 1024,
        };
        let payload = err.payload();
        assert_eq!(payload.reason, "oversize_input");
        assert_eq!(payload.limit, Some(30 * 1024 * 1024 * 1024));
        assert!(payload.message.contains("32212254720"));
        assert!(err.is_user_facing());
    }

    #[test]
    fn test_payload_serialization_skips_empty_fields() {
        let err = IngestError::DuplicateContent {
            digest: "1a2b3c4d".to_string(),
            existing_key: "sub-01_1a2b3c4d.h5".to_string(),
        };
        let json = serde_json::to_value(err.payload()).unwrap();
        assert_eq!(json["reason"], "duplicate_content");
        assert!(json.get("store_code").is_none());
        assert!(json.get("limit").is_none());
    }
}
