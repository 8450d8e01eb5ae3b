use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::{
    app_context::AppContext, error::IngestError, metadata::MetadataField,
    pipeline::UploadRequest,
};

#[derive(Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Print JSON on a single line
    #[arg(long, global = true)]
    compact: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Upload a dataset file, refusing content that is already stored
    Upload {
        file: PathBuf,

        /// Store under this file name instead of the local one
        #[arg(long)]
        name: Option<String>,

        #[command(flatten)]
        metadata: MetadataArgs,
    },
    /// List stored datasets with their metadata
    List,
    /// Print a time-limited download link for a stored dataset
    Link { key: String },
    /// Check that the bucket is reachable
    BucketInfo,
}

/// Values that take precedence over the attributes stored in the file
#[derive(Args, Debug, Default)]
pub struct MetadataArgs {
    #[arg(long)]
    dataset_name: Option<String>,
    #[arg(long)]
    subject_id: Option<String>,
    #[arg(long)]
    preprocessing_pipeline: Option<String>,
    #[arg(long)]
    owner_name: Option<String>,
    #[arg(long)]
    owner_email: Option<String>,
    #[arg(long)]
    beta_pipeline: Option<String>,
    #[arg(long)]
    github_url: Option<String>,
    #[arg(long)]
    publication_url: Option<String>,
}

impl MetadataArgs {
    fn into_fields(self) -> HashMap<String, String> {
        [
            (MetadataField::DatasetName, self.dataset_name),
            (MetadataField::SubjectId, self.subject_id),
            (MetadataField::PreprocessingPipeline, self.preprocessing_pipeline),
            (MetadataField::OwnerName, self.owner_name),
            (MetadataField::OwnerEmail, self.owner_email),
            (MetadataField::BetaPipeline, self.beta_pipeline),
            (MetadataField::GithubUrl, self.github_url),
            (MetadataField::PublicationUrl, self.publication_url),
        ]
        .into_iter()
        .filter_map(|(field, value)| value.map(|v| (field.key().to_string(), v)))
        .collect()
    }
}

impl Cli {
    /// Run the parsed command, printing its result (or error payload) as JSON
    pub async fn run(self, context: &AppContext) -> anyhow::Result<ExitCode> {
        let outcome = match self.command {
            Commands::Upload {
                file,
                name,
                metadata,
            } => upload(context, file, name, metadata).await,
            Commands::List => context
                .ingest
                .catalog()
                .list()
                .await
                .and_then(|entries| to_json(&entries)),
            Commands::Link { key } => context
                .access
                .download_link(&key)
                .await
                .and_then(|link| to_json(&link)),
            Commands::BucketInfo => {
                let info = context.access.bucket_info().await;
                let accessible = info.accessible;
                print_json(&to_json(&info)?, self.compact)?;
                return Ok(if accessible {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::FAILURE
                });
            }
        };

        match outcome {
            Ok(body) => {
                print_json(&body, self.compact)?;
                Ok(ExitCode::SUCCESS)
            }
            Err(e) => {
                print_json(&json!({ "error": e.payload() }), self.compact)?;
                Ok(ExitCode::FAILURE)
            }
        }
    }
}

async fn upload(
    context: &AppContext,
    file: PathBuf,
    name: Option<String>,
    metadata: MetadataArgs,
) -> Result<serde_json::Value, IngestError> {
    let mut request = UploadRequest::new(file);
    if let Some(name) = name {
        request = request.with_filename(name);
    }
    request.form_fields = metadata.into_fields();

    let handle = context.ingest.start_upload(request);

    let mut progress = handle.progress_updates();
    let reporter = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let p = *progress.borrow_and_update();
            if p.transferred > 0 {
                info!(
                    transferred = p.transferred,
                    total = p.total,
                    "uploaded {:.1}%",
                    p.fraction() * 100.0
                );
            }
        }
    });

    let token = handle.cancellation_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling upload");
            token.cancel();
        }
    });

    let result = handle.wait().await;
    interrupt.abort();
    if let Err(e) = reporter.await {
        warn!("progress reporter stopped: {e}");
    }

    to_json(&result?)
}

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value, IngestError> {
    serde_json::to_value(value).map_err(|e| IngestError::Io(std::io::Error::other(e)))
}

fn print_json(value: &serde_json::Value, compact: bool) -> anyhow::Result<()> {
    let rendered = if compact {
        serde_json::to_string(value)
    } else {
        serde_json::to_string_pretty(value)
    }
    .context("rendering output")?;

    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{rendered}").context("writing output")?;
    Ok(())
}
