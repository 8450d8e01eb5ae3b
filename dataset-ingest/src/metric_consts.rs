pub const UPLOADS: &str = "dataset_ingest_uploads";
pub const UPLOAD_BYTES: &str = "dataset_ingest_upload_bytes";
pub const UPLOAD_PARTS: &str = "dataset_ingest_upload_parts";
pub const UPLOAD_TIME: &str = "dataset_ingest_upload_time_ms";
pub const DUPLICATES_REJECTED: &str = "dataset_ingest_duplicates_rejected";
pub const ABORTED_MULTIPART_UPLOADS: &str = "dataset_ingest_aborted_multipart_uploads";
pub const METADATA_EXTRACTION_FAILED: &str = "dataset_ingest_metadata_extraction_failed";
pub const CATALOG_LISTINGS: &str = "dataset_ingest_catalog_listings";
pub const DOWNLOAD_LINKS_ISSUED: &str = "dataset_ingest_download_links_issued";
