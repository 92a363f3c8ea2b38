//! Pool, job, and task provisioning against the compute backend.

use shell_escape::unix::escape;
use thiserror::Error;
use tracing::debug;

use crate::compute::{ComputeBackend, OutputCapture, PoolSpec, ResourceReference, TaskSpec};
use crate::spec::JobSpec;
use crate::store::TimeLimitedUrl;

/// Pools are sized for exactly one task.
pub const TARGET_DEDICATED_NODES: u32 = 1;

/// Identifier of the single task submitted with each job.
pub const TASK_ID: &str = "Task1";

/// Catch-all pattern capturing the task's stdout/stderr log files.
pub const STD_LOG_PATTERN: &str = "std*.txt";

/// Errors raised while provisioning compute resources.
#[derive(Debug, Error)]
pub enum ProvisionError<E>
where
    E: std::error::Error + 'static,
{
    /// Raised when the pool cannot be created; job creation must not
    /// proceed after this.
    #[error("failed to create pool {pool_id}: {source}")]
    Pool {
        /// Pool being created.
        pool_id: String,
        /// Backend error.
        #[source]
        source: E,
    },
    /// Raised when the job cannot be created.
    #[error("failed to create job {job_id}: {source}")]
    Job {
        /// Job being created.
        job_id: String,
        /// Backend error.
        #[source]
        source: E,
    },
    /// Raised when the task cannot be added to the job.
    #[error("failed to add task to job {job_id}: {source}")]
    Task {
        /// Job the task belongs to.
        job_id: String,
        /// Backend error.
        #[source]
        source: E,
    },
}

/// Creates and destroys pools, jobs, and tasks for one run.
#[derive(Clone, Debug)]
pub struct Provisioner<C: ComputeBackend> {
    backend: C,
}

impl<C: ComputeBackend> Provisioner<C> {
    /// Creates a provisioner over the given backend.
    #[must_use]
    pub const fn new(backend: C) -> Self {
        Self { backend }
    }

    /// Returns a reference to the underlying backend.
    #[must_use]
    pub const fn backend(&self) -> &C {
        &self.backend
    }

    /// Provisions the single-task pool described by the spec.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Pool`] on quota, auth, or naming failures.
    pub async fn create_pool(&self, spec: &JobSpec) -> Result<(), ProvisionError<C::Error>> {
        let pool = PoolSpec {
            id: spec.pool_id().to_owned(),
            vm_size: spec.vm_size.clone(),
            vm_image: spec.vm_image.clone(),
            target_nodes: TARGET_DEDICATED_NODES,
        };
        debug!(pool_id = %pool.id, vm_size = %pool.vm_size, "creating pool");
        self.backend
            .create_pool(&pool)
            .await
            .map_err(|source| ProvisionError::Pool {
                pool_id: pool.id,
                source,
            })
    }

    /// Creates the job bound to the pool of the same name. The pool must
    /// already exist.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Job`] when the backend rejects the job.
    pub async fn create_job(&self, spec: &JobSpec) -> Result<(), ProvisionError<C::Error>> {
        debug!(job_id = %spec.job_id(), "creating job");
        self.backend
            .create_job(spec.job_id(), spec.pool_id())
            .await
            .map_err(|source| ProvisionError::Job {
                job_id: spec.job_id().to_owned(),
                source,
            })
    }

    /// Builds and submits the single task: the command wrapped for a shell,
    /// the staged inputs as resource files, and one on-success capture per
    /// output pattern plus the stdout/stderr catch-all.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Task`] when the backend rejects the task.
    pub async fn create_task(
        &self,
        spec: &JobSpec,
        input_refs: Vec<ResourceReference>,
        output_url: &TimeLimitedUrl,
    ) -> Result<(), ProvisionError<C::Error>> {
        let task = build_task(spec, input_refs, output_url);
        debug!(
            job_id = %spec.job_id(),
            inputs = task.resource_files.len(),
            captures = task.output_captures.len(),
            "adding task"
        );
        self.backend
            .add_task(spec.job_id(), &task)
            .await
            .map_err(|source| ProvisionError::Task {
                job_id: spec.job_id().to_owned(),
                source,
            })
    }

    /// Deletes a job; deleting an absent job succeeds.
    ///
    /// # Errors
    ///
    /// Propagates the backend error unchanged for teardown reporting.
    pub async fn delete_job(&self, job_id: &str) -> Result<(), C::Error> {
        self.backend.delete_job(job_id).await
    }

    /// Deletes a pool; deleting an absent pool succeeds.
    ///
    /// # Errors
    ///
    /// Propagates the backend error unchanged for teardown reporting.
    pub async fn delete_pool(&self, pool_id: &str) -> Result<(), C::Error> {
        self.backend.delete_pool(pool_id).await
    }
}

/// Wraps the configured command so it runs under a shell on the node.
fn shell_command(command: &str) -> String {
    format!("/bin/bash -c {}", escape(command.into()))
}

fn build_task(
    spec: &JobSpec,
    input_refs: Vec<ResourceReference>,
    output_url: &TimeLimitedUrl,
) -> TaskSpec {
    let mut captures: Vec<OutputCapture> = spec
        .outputs
        .iter()
        .flat_map(|mapping| mapping.patterns.iter())
        .map(|pattern| OutputCapture {
            pattern: pattern.clone(),
            container_url: output_url.url.clone(),
            path: pattern_directory(pattern),
            on_success_only: true,
        })
        .collect();
    captures.push(OutputCapture {
        pattern: STD_LOG_PATTERN.to_owned(),
        container_url: output_url.url.clone(),
        path: None,
        on_success_only: true,
    });

    TaskSpec {
        id: TASK_ID.to_owned(),
        command_line: shell_command(&spec.command),
        resource_files: input_refs,
        output_captures: captures,
    }
}

/// Directory component of an output pattern, used as the destination path
/// prefix so captured files keep their layout inside the container.
fn pattern_directory(pattern: &str) -> Option<String> {
    pattern
        .rsplit_once('/')
        .map(|(dir, _)| dir.to_owned())
        .filter(|dir| !dir.is_empty())
}
