pub mod access;
pub mod app_context;
pub mod catalog;
pub mod cmd;
pub mod config;
pub mod dedup;
pub mod error;
pub mod hasher;
pub mod metadata;
pub mod metric_consts;
pub mod pipeline;
pub mod progress;
pub mod transport;

pub use error::{ErrorPayload, IngestError};
pub use metadata::{MetadataField, MetadataRecord};
pub use pipeline::{IngestService, UploadHandle, UploadReceipt, UploadRequest, UploadState};
