//! Orchestrates one end-to-end job submission.
//!
//! The run workflow stages inputs into the object store, provisions the
//! pool, job, and single task, waits for the task to reach a terminal
//! state, downloads outputs, and tears down every remote resource it
//! created. Every exit path after the first successful creation call runs
//! best-effort teardown of the recorded [`ResourceSet`]; only failures
//! before any resource exists skip cleanup.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::compute::ComputeBackend;
use crate::poll::{CompletionPoller, DEFAULT_POLL_INTERVAL, PollError, WaitOutcome};
use crate::provision::{ProvisionError, Provisioner};
use crate::spec::JobSpec;
use crate::staging::{Stager, StagingError};
use crate::store::BlobStore;
use crate::teardown::{ResourceSet, TeardownCoordinator, TeardownReport};

/// Caller-tunable knobs for one run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunOptions {
    /// Whether to download outputs after completion. When `false`, the
    /// output container is retained instead of deleted so results are not
    /// discarded unread.
    pub download_outputs: bool,
    /// Directory output files are mirrored into.
    pub output_dir: Utf8PathBuf,
    /// Interval between completion checks.
    pub poll_interval: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            download_outputs: true,
            output_dir: Utf8PathBuf::from("."),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Outcome of a successful run.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RunSummary {
    /// Number of output files downloaded.
    pub downloaded_files: usize,
    /// Cleanup report; failures here are non-fatal but worth surfacing.
    pub teardown: TeardownReport,
}

/// Errors surfaced while performing a run.
///
/// Variants raised after remote resources exist carry a message already
/// annotated with the outcome of the cleanup attempt.
#[derive(Debug, Error)]
pub enum RunError<SE, CE>
where
    SE: std::error::Error + 'static,
    CE: std::error::Error + 'static,
{
    /// Raised when staging inputs or preparing the output container fails.
    #[error("staging failed: {message}")]
    Staging {
        /// Description including any teardown note.
        message: String,
        /// Underlying staging error.
        #[source]
        source: StagingError<SE>,
    },
    /// Raised when pool, job, or task creation fails.
    #[error("provisioning failed: {message}")]
    Provision {
        /// Description including any teardown note.
        message: String,
        /// Underlying provisioning error.
        #[source]
        source: ProvisionError<CE>,
    },
    /// Raised when completion polling fails.
    #[error("completion polling failed: {message}")]
    Poll {
        /// Description including any teardown note.
        message: String,
        /// Underlying polling error.
        #[source]
        source: PollError<CE>,
    },
    /// Raised when the run is cancelled before the task completes. The
    /// created resources are torn down before this is returned.
    #[error("run cancelled before completion{message}")]
    Cancelled {
        /// Empty, or a parenthesised teardown note.
        message: String,
    },
}

/// Executes the end-to-end submission flow over the two service seams.
#[derive(Debug)]
pub struct RunOrchestrator<S: BlobStore, C: ComputeBackend> {
    stager: Stager<S>,
    provisioner: Provisioner<C>,
}

impl<S, C> RunOrchestrator<S, C>
where
    S: BlobStore,
    C: ComputeBackend,
{
    /// Creates a new orchestrator.
    #[must_use]
    pub const fn new(stager: Stager<S>, provisioner: Provisioner<C>) -> Self {
        Self {
            stager,
            provisioner,
        }
    }

    /// Runs the whole flow: upload, provision, wait, download, teardown.
    ///
    /// Ordering guarantees: uploads complete before any compute resource is
    /// created; the task is added only after the pool, job, and output
    /// container exist; teardown never begins before the wait resolves.
    ///
    /// # Errors
    ///
    /// Returns [`RunError`] when staging, provisioning, or polling fails,
    /// or [`RunError::Cancelled`] when `cancel` fires first. In every such
    /// case the resources created so far have already been torn down
    /// best-effort, and the error message notes any cleanup failures.
    pub async fn execute(
        &self,
        spec: &JobSpec,
        options: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, RunError<S::Error, C::Error>> {
        let mut resources = ResourceSet::default();

        // The container is recorded before the call because a failed upload
        // can still leave it behind; deleting a never-created container is
        // idempotent.
        let input_container = spec.input_container();
        resources.input_container = Some(input_container.clone());
        info!(container = %input_container, "uploading input files");
        let input_refs = match self.stager.upload_inputs(&input_container, &spec.inputs).await {
            Ok(refs) => refs,
            Err(err) => return Err(self.fail_staging(err, &resources).await),
        };
        info!(files = input_refs.len(), "input files staged");

        resources.pool_id = Some(spec.pool_id().to_owned());
        info!(pool_id = %spec.pool_id(), vm_size = %spec.vm_size, "creating pool");
        if let Err(err) = self.provisioner.create_pool(spec).await {
            return Err(self.fail_provision(err, &resources).await);
        }

        resources.job_id = Some(spec.job_id().to_owned());
        info!(job_id = %spec.job_id(), "creating job");
        if let Err(err) = self.provisioner.create_job(spec).await {
            return Err(self.fail_provision(err, &resources).await);
        }

        let output_container = spec.output_container();
        resources.output_container = Some(output_container.clone());
        info!(container = %output_container, "preparing output container");
        let output_url = match self.stager.prepare_output_container(&output_container).await {
            Ok(url) => url,
            Err(err) => return Err(self.fail_staging(err, &resources).await),
        };

        info!(job_id = %spec.job_id(), "adding task");
        if let Err(err) = self
            .provisioner
            .create_task(spec, input_refs, &output_url)
            .await
        {
            return Err(self.fail_provision(err, &resources).await);
        }

        info!(job_id = %spec.job_id(), "waiting for task completion");
        let poller = CompletionPoller::new().with_interval(options.poll_interval);
        match poller
            .await_completion(self.provisioner.backend(), spec.job_id(), cancel)
            .await
        {
            Ok(WaitOutcome::Completed) => {}
            Ok(WaitOutcome::Cancelled) => {
                let note = self.cleanup_note(&resources).await;
                return Err(RunError::Cancelled { message: note });
            }
            Err(err) => {
                let message = self.annotate(err.to_string(), &resources).await;
                return Err(RunError::Poll {
                    message,
                    source: err,
                });
            }
        }
        info!(job_id = %spec.job_id(), "task complete, cleaning up");

        let download_to = options
            .download_outputs
            .then(|| options.output_dir.as_path());
        let report = self
            .teardown(&resources, download_to, !options.download_outputs)
            .await;
        Ok(RunSummary {
            downloaded_files: report.downloaded_files,
            teardown: report,
        })
    }

    async fn teardown(
        &self,
        resources: &ResourceSet,
        download_to: Option<&Utf8Path>,
        retain_outputs: bool,
    ) -> TeardownReport {
        TeardownCoordinator::new(&self.stager, &self.provisioner)
            .teardown(resources, download_to, retain_outputs)
            .await
    }

    async fn fail_staging(
        &self,
        source: StagingError<S::Error>,
        resources: &ResourceSet,
    ) -> RunError<S::Error, C::Error> {
        let message = self.annotate(source.to_string(), resources).await;
        RunError::Staging { message, source }
    }

    async fn fail_provision(
        &self,
        source: ProvisionError<C::Error>,
        resources: &ResourceSet,
    ) -> RunError<S::Error, C::Error> {
        let message = self.annotate(source.to_string(), resources).await;
        RunError::Provision { message, source }
    }

    /// Tears down the recorded resources and appends a note describing any
    /// cleanup failures to `message`.
    async fn annotate(&self, message: String, resources: &ResourceSet) -> String {
        let report = self.teardown(resources, None, false).await;
        append_teardown_note(message, &report)
    }

    async fn cleanup_note(&self, resources: &ResourceSet) -> String {
        append_teardown_note(String::new(), &self.teardown(resources, None, false).await)
    }
}

fn append_teardown_note(message: String, report: &TeardownReport) -> String {
    if report.is_clean() {
        return message;
    }
    let failed: Vec<String> = report
        .failures
        .iter()
        .map(|failure| failure.resource.clone())
        .collect();
    format!(
        "{message} (cleanup also failed for: {})",
        failed.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::TaskStatus;
    use crate::spec::{InputMapping, OutputMapping};
    use crate::test_support::{MemoryBlobStore, ScriptedCompute};
    use rstest::rstest;
    use std::fs;

    fn spec_for(dir: &Utf8Path) -> JobSpec {
        JobSpec::builder()
            .batch_account_name("batch")
            .batch_account_key("a2V5")
            .batch_account_url("https://batch.example.invalid")
            .storage_account_name("storage")
            .storage_account_key("a2V5")
            .job_name("NightlyRun")
            .command("analyze")
            .vm_image("/images/ubuntu-22.04")
            .input(InputMapping::parse(&format!("{dir}/in/*.csv")).expect("mapping"))
            .output(OutputMapping::parse("out/*.json").expect("mapping"))
            .build()
            .expect("spec should build")
    }

    fn workspace() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().expect("temp dir");
        let base = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 dir");
        fs::create_dir_all(base.join("in")).expect("mkdir");
        fs::write(base.join("in/data.csv"), "1,2,3").expect("write");
        (dir, base)
    }

    fn fast_options(base: &Utf8Path) -> RunOptions {
        RunOptions {
            download_outputs: true,
            output_dir: base.to_path_buf(),
            poll_interval: Duration::from_millis(1),
        }
    }

    #[rstest]
    #[tokio::test]
    async fn successful_run_leaves_outputs_and_no_remote_resources() {
        let (_guard, base) = workspace();
        let store = MemoryBlobStore::new();
        // Simulate the task writing its outputs through the capability URL.
        store.stage_blob_on_create("nightlyrun-output", "out/result.json", b"{}".to_vec());
        store.stage_blob_on_create("nightlyrun-output", "stdout.txt", b"done".to_vec());
        let compute = ScriptedCompute::new();
        compute.push_states(vec![TaskStatus::Running]);
        compute.push_states(vec![TaskStatus::Completed]);

        let orchestrator =
            RunOrchestrator::new(Stager::new(store.clone()), Provisioner::new(compute.clone()));
        let spec = spec_for(&base);
        let summary = orchestrator
            .execute(&spec, &fast_options(&base), &CancellationToken::new())
            .await
            .expect("run should succeed");

        assert_eq!(summary.downloaded_files, 2);
        assert!(summary.teardown.is_clean());
        assert!(base.join("out/result.json").exists());
        assert!(store.containers().is_empty(), "containers must be deleted");
        assert!(compute.pools().is_empty(), "pool must be deleted");
        assert!(compute.jobs().is_empty(), "job must be deleted");
    }

    #[rstest]
    #[tokio::test]
    async fn uploads_happen_before_any_compute_resource() {
        let (_guard, base) = workspace();
        let store = MemoryBlobStore::new();
        let compute = ScriptedCompute::new();

        let orchestrator =
            RunOrchestrator::new(Stager::new(store), Provisioner::new(compute.clone()));
        let spec = spec_for(&base);
        orchestrator
            .execute(&spec, &fast_options(&base), &CancellationToken::new())
            .await
            .expect("run should succeed");

        let operations = compute.operations();
        assert_eq!(
            operations.first().map(String::as_str),
            Some("create_pool"),
            "no compute call may precede pool creation: {operations:?}"
        );
        let task_position = operations.iter().position(|op| op == "add_task");
        let job_position = operations.iter().position(|op| op == "create_job");
        assert!(job_position < task_position, "task must follow job");
    }

    #[rstest]
    #[tokio::test]
    async fn task_receives_staged_inputs_and_captures() {
        let (_guard, base) = workspace();
        let store = MemoryBlobStore::new();
        let compute = ScriptedCompute::new();

        let orchestrator =
            RunOrchestrator::new(Stager::new(store), Provisioner::new(compute.clone()));
        let spec = spec_for(&base);
        orchestrator
            .execute(&spec, &fast_options(&base), &CancellationToken::new())
            .await
            .expect("run should succeed");

        let tasks = compute.tasks("NightlyRun");
        let task = tasks.first().expect("one task should be submitted");
        assert_eq!(task.id, "Task1");
        assert_eq!(task.resource_files.len(), 1);
        assert!(
            task.resource_files
                .first()
                .is_some_and(|file| file.remote_path == "data.csv")
        );
        assert_eq!(task.output_captures.len(), 2, "pattern plus std*.txt");
    }

    #[rstest]
    #[tokio::test]
    async fn provisioning_failure_tears_down_created_resources() {
        let (_guard, base) = workspace();
        let store = MemoryBlobStore::new();
        let compute = ScriptedCompute::new();
        compute.fail_operation("create_job");

        let orchestrator =
            RunOrchestrator::new(Stager::new(store.clone()), Provisioner::new(compute.clone()));
        let spec = spec_for(&base);
        let err = orchestrator
            .execute(&spec, &fast_options(&base), &CancellationToken::new())
            .await
            .expect_err("run should fail");

        assert!(matches!(err, RunError::Provision { .. }));
        assert!(store.containers().is_empty(), "input container cleaned");
        assert!(compute.pools().is_empty(), "pool cleaned");
    }

    #[rstest]
    #[tokio::test]
    async fn staging_failure_before_compute_resources_still_cleans_container() {
        let (_guard, base) = workspace();
        let store = MemoryBlobStore::new();
        store.seed_container("nightlyrun-input");
        let compute = ScriptedCompute::new();

        let orchestrator =
            RunOrchestrator::new(Stager::new(store.clone()), Provisioner::new(compute.clone()));
        let spec = spec_for(&base);
        let err = orchestrator
            .execute(&spec, &fast_options(&base), &CancellationToken::new())
            .await
            .expect_err("collision should fail the run");

        assert!(matches!(err, RunError::Staging { .. }));
        assert!(compute.operations().is_empty(), "no compute calls expected");
        // The run owns containers named after its job, so cleanup deletes
        // the colliding container too.
        assert!(store.containers().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn cancellation_tears_down_and_reports_cancelled() {
        let (_guard, base) = workspace();
        let store = MemoryBlobStore::new();
        let compute = ScriptedCompute::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let orchestrator =
            RunOrchestrator::new(Stager::new(store.clone()), Provisioner::new(compute.clone()));
        let spec = spec_for(&base);
        let err = orchestrator
            .execute(&spec, &fast_options(&base), &cancel)
            .await
            .expect_err("cancelled run should error");

        assert!(matches!(err, RunError::Cancelled { .. }));
        assert!(store.containers().is_empty());
        assert!(compute.pools().is_empty());
        assert!(compute.jobs().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn skipping_download_retains_the_output_container() {
        let (_guard, base) = workspace();
        let store = MemoryBlobStore::new();
        store.stage_blob_on_create("nightlyrun-output", "out/result.json", b"{}".to_vec());
        let compute = ScriptedCompute::new();

        let orchestrator =
            RunOrchestrator::new(Stager::new(store.clone()), Provisioner::new(compute));
        let spec = spec_for(&base);
        let options = RunOptions {
            download_outputs: false,
            ..fast_options(&base)
        };
        let summary = orchestrator
            .execute(&spec, &options, &CancellationToken::new())
            .await
            .expect("run should succeed");

        assert_eq!(summary.downloaded_files, 0);
        assert_eq!(
            summary.teardown.retained_output_container.as_deref(),
            Some("nightlyrun-output")
        );
        assert!(store.has_container("nightlyrun-output"));
        assert!(!store.has_container("nightlyrun-input"));
        assert!(!base.join("out/result.json").exists());
    }

    #[rstest]
    #[tokio::test]
    async fn teardown_failures_on_success_path_are_reported_not_fatal() {
        let (_guard, base) = workspace();
        let store = MemoryBlobStore::new();
        let compute = ScriptedCompute::new();
        compute.fail_operation("delete_pool");

        let orchestrator =
            RunOrchestrator::new(Stager::new(store), Provisioner::new(compute));
        let spec = spec_for(&base);
        let summary = orchestrator
            .execute(&spec, &fast_options(&base), &CancellationToken::new())
            .await
            .expect("run should still succeed");

        assert!(!summary.teardown.is_clean());
        assert!(
            summary
                .teardown
                .failures
                .iter()
                .any(|failure| failure.resource == "pool NightlyRun")
        );
    }

    #[rstest]
    #[tokio::test]
    async fn cleanup_failures_are_noted_in_the_error_message() {
        let (_guard, base) = workspace();
        let store = MemoryBlobStore::new();
        let compute = ScriptedCompute::new();
        compute.fail_operation("create_job");
        store.fail_operation("delete_container");

        let orchestrator =
            RunOrchestrator::new(Stager::new(store), Provisioner::new(compute));
        let spec = spec_for(&base);
        let err = orchestrator
            .execute(&spec, &fast_options(&base), &CancellationToken::new())
            .await
            .expect_err("run should fail");

        let RunError::Provision { message, .. } = err else {
            panic!("expected Provision, got {err:?}");
        };
        assert!(
            message.contains("cleanup also failed"),
            "message: {message}"
        );
    }
}
