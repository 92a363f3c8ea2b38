//! Binary entry point for the `batchsub` CLI.

use std::io::{self, Write};
use std::process;

use clap::Parser;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use batchsub::{
    AzureBatchClient, AzureBlobStore, AzureError, ConfigError, Provisioner, RunError, RunOptions,
    RunOrchestrator, RunSummary, Stager, load_job_spec,
};

mod cli;

use cli::Cli;

/// Conventional exit status for an interrupted run.
const EXIT_CANCELLED: i32 = 130;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid credentials: {0}")]
    Credentials(AzureError),
    #[error(transparent)]
    Run(#[from] RunError<AzureError, AzureError>),
}

impl CliError {
    const fn exit_code(&self) -> i32 {
        match self {
            Self::Run(RunError::Cancelled { .. }) => EXIT_CANCELLED,
            _ => 1,
        }
    }
}

#[tokio::main]
async fn main() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();

    let cli = Cli::parse();
    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    let exit_code = match run(cli, &cancel).await {
        Ok(summary) => {
            report_summary(&summary);
            0
        }
        Err(err) => {
            report_error(&err);
            err.exit_code()
        }
    };

    process::exit(exit_code);
}

fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling run and cleaning up");
            cancel.cancel();
        }
    });
}

async fn run(cli: Cli, cancel: &CancellationToken) -> Result<RunSummary, CliError> {
    info!(path = %cli.configuration_file, "reading configuration file");
    let spec = load_job_spec(&cli.configuration_file).await?;
    info!(job_name = %spec.job_name, "configuration validated");

    let store = AzureBlobStore::new(&spec.storage_account_name, &spec.storage_account_key)
        .map_err(CliError::Credentials)?;
    let compute = AzureBatchClient::new(
        &spec.batch_account_name,
        &spec.batch_account_key,
        &spec.batch_account_url,
    )
    .map_err(CliError::Credentials)?;

    let orchestrator = RunOrchestrator::new(Stager::new(store), Provisioner::new(compute));
    let options = RunOptions {
        download_outputs: !cli.no_download,
        output_dir: cli.output_dir,
        ..RunOptions::default()
    };
    Ok(orchestrator.execute(&spec, &options, cancel).await?)
}

fn report_summary(summary: &RunSummary) {
    info!(downloaded = summary.downloaded_files, "run complete");
    if let Some(container) = summary.teardown.retained_output_container.as_deref() {
        info!(container, "outputs remain in the retained container");
    }
    for failure in &summary.teardown.failures {
        warn!(
            resource = %failure.resource,
            error = %failure.message,
            "cleanup failed; the resource may need manual deletion"
        );
    }
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
