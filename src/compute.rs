//! Batch-compute abstraction: pools, jobs, tasks, and task state reporting.

use std::future::Future;
use std::pin::Pin;

use serde::Deserialize;

/// Parameters for provisioning one compute pool.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PoolSpec {
    /// Pool identifier; equals the job name by convention.
    pub id: String,
    /// Virtual machine size (for example `Standard_D16s_v3`).
    pub vm_size: String,
    /// Virtual machine image the nodes boot from.
    pub vm_image: String,
    /// Number of dedicated nodes to provision.
    pub target_nodes: u32,
}

/// One staged input file made available to a task: the path it appears at
/// in the task working directory and the capability URL it is fetched from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResourceReference {
    /// Path relative to the task working directory.
    pub remote_path: String,
    /// Read-scoped URL the compute node downloads the file from.
    pub url: String,
}

/// One output-capture rule attached to a task.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OutputCapture {
    /// Glob pattern, relative to the task working directory, selecting the
    /// files to capture.
    pub pattern: String,
    /// Write-scoped container URL the captured files are uploaded to.
    pub container_url: String,
    /// Optional path prefix inside the destination container.
    pub path: Option<String>,
    /// Whether the capture only runs when the task command succeeds.
    pub on_success_only: bool,
}

/// Full description of the single task submitted with a job.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TaskSpec {
    /// Task identifier within the job.
    pub id: String,
    /// Command line executed on the compute node, already shell-wrapped.
    pub command_line: String,
    /// Input files staged onto the node before the command starts.
    pub resource_files: Vec<ResourceReference>,
    /// Output-capture rules applied after the command finishes.
    pub output_captures: Vec<OutputCapture>,
}

/// Execution state reported for a task.
///
/// Terminal detection is state-based, not exit-code-based: a task whose
/// command exited non-zero still reaches [`TaskStatus::Completed`].
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Queued, not yet assigned to a node.
    Active,
    /// Node is fetching resource files.
    Preparing,
    /// Command is executing.
    Running,
    /// Task finished, regardless of the command's exit code.
    Completed,
}

impl TaskStatus {
    /// Returns `true` when the task has finished executing.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Future returned by compute-backend operations.
pub type ComputeFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Minimal interface implemented by batch-compute backends.
pub trait ComputeBackend {
    /// Provider specific error type returned by the backend.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Provisions a compute pool.
    fn create_pool<'a>(&'a self, pool: &'a PoolSpec) -> ComputeFuture<'a, (), Self::Error>;

    /// Creates a job bound to an existing pool. The pool must already be
    /// addressable by `pool_id`.
    fn create_job<'a>(
        &'a self,
        job_id: &'a str,
        pool_id: &'a str,
    ) -> ComputeFuture<'a, (), Self::Error>;

    /// Adds one task to an existing job.
    fn add_task<'a>(
        &'a self,
        job_id: &'a str,
        task: &'a TaskSpec,
    ) -> ComputeFuture<'a, (), Self::Error>;

    /// Reports the current state of every task belonging to a job.
    fn task_states<'a>(&'a self, job_id: &'a str)
    -> ComputeFuture<'a, Vec<TaskStatus>, Self::Error>;

    /// Deletes a job. Idempotent: deleting an absent job succeeds.
    fn delete_job<'a>(&'a self, job_id: &'a str) -> ComputeFuture<'a, (), Self::Error>;

    /// Deletes a pool. Idempotent: deleting an absent pool succeeds.
    fn delete_pool<'a>(&'a self, pool_id: &'a str) -> ComputeFuture<'a, (), Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::TaskStatus;
    use rstest::rstest;

    #[rstest]
    #[case(TaskStatus::Active, false)]
    #[case(TaskStatus::Preparing, false)]
    #[case(TaskStatus::Running, false)]
    #[case(TaskStatus::Completed, true)]
    fn terminal_detection_is_state_based(#[case] status: TaskStatus, #[case] terminal: bool) {
        assert_eq!(status.is_terminal(), terminal);
    }

    #[rstest]
    fn task_states_deserialize_from_service_spelling() {
        let parsed: Vec<TaskStatus> =
            serde_json::from_str("[\"active\",\"preparing\",\"running\",\"completed\"]")
                .expect("states should parse");
        assert_eq!(
            parsed,
            vec![
                TaskStatus::Active,
                TaskStatus::Preparing,
                TaskStatus::Running,
                TaskStatus::Completed
            ]
        );
    }
}
