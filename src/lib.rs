//! Core library for the `batchsub` job submission tool.
//!
//! The crate orchestrates one unit of work against an ephemeral compute
//! pool: stage local inputs into a remote object store, provision a pool,
//! job, and single task, wait for the task to reach a terminal state,
//! retrieve the outputs, and tear down everything it created — on every
//! exit path, not just the happy one.

pub mod azure;
pub mod compute;
pub mod config;
pub mod poll;
pub mod provision;
pub mod run;
pub mod spec;
pub mod staging;
pub mod store;
pub mod teardown;
pub mod test_support;

pub use azure::{AzureBatchClient, AzureBlobStore, AzureError};
pub use compute::{
    ComputeBackend, OutputCapture, PoolSpec, ResourceReference, TaskSpec, TaskStatus,
};
pub use config::{ConfigError, load_job_spec, parse_config_str};
pub use poll::{CompletionPoller, DEFAULT_POLL_INTERVAL, PollError, WaitOutcome};
pub use provision::{ProvisionError, Provisioner, TASK_ID};
pub use run::{RunError, RunOptions, RunOrchestrator, RunSummary};
pub use spec::{DEFAULT_VM_SIZE, InputMapping, JobSpec, JobSpecBuilder, OutputMapping, SpecError};
pub use staging::{SAS_TTL, Stager, StagingError};
pub use store::{BlobItem, BlobStore, SasPermission, TimeLimitedUrl};
pub use teardown::{ResourceSet, TeardownCoordinator, TeardownFailure, TeardownReport};
