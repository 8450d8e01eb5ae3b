use std::sync::Arc;

use common_s3::{S3Client, S3Impl};
use tracing::info;

use crate::{
    access::AccessService, config::Config, error::IngestError, metadata::MetadataExtractor,
    pipeline::IngestService,
};

pub struct AppContext {
    pub config: Config,
    pub s3_client: Arc<dyn S3Client>,
    pub ingest: IngestService,
    pub access: AccessService,
}

impl AppContext {
    pub async fn new(config: &Config) -> Result<Self, IngestError> {
        config.validate()?;
        let s3_client = S3Impl::from_config(&config.s3_config()).await;
        info!(bucket = %config.s3_bucket, "using bucket");
        Self::with_client(config, Arc::new(s3_client), MetadataExtractor::default())
    }

    /// Wire the services around an existing client, e.g. a mock
    pub fn with_client(
        config: &Config,
        s3_client: Arc<dyn S3Client>,
        extractor: MetadataExtractor,
    ) -> Result<Self, IngestError> {
        let ingest = IngestService::new(config, s3_client.clone(), extractor)?;
        let access = AccessService::new(
            s3_client.clone(),
            config.s3_bucket.clone(),
            config.download_link_ttl(),
        );

        Ok(Self {
            config: config.clone(),
            s3_client,
            ingest,
            access,
        })
    }
}
