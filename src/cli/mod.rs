//! Command-line interface definitions for the `batchsub` binary.
//!
//! This module centralises the clap parser structure so both the main
//! binary and the build script can reuse it when generating the manual
//! page.

use camino::Utf8PathBuf;
use clap::Parser;

/// Top-level CLI for the `batchsub` binary.
#[derive(Debug, Parser)]
#[command(
    name = "batchsub",
    about = "Stage inputs, run one command on an ephemeral batch pool, and fetch the results"
)]
pub(crate) struct Cli {
    /// Path to the job configuration file (KEY:=VALUE lines).
    #[arg(short = 'c', long, value_name = "PATH")]
    pub(crate) configuration_file: Utf8PathBuf,
    /// Do not download output files after the run; they stay in the output
    /// container, which is retained instead of deleted.
    #[arg(short = 'n', long)]
    pub(crate) no_download: bool,
    /// Directory output files are downloaded into.
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub(crate) output_dir: Utf8PathBuf,
}
