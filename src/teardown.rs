//! Best-effort teardown of everything a run created.
//!
//! Every deletion is attempted independently: leaving a remote resource
//! alive is costlier than a partial cleanup error, so a failed step is
//! recorded and the remaining steps still run.

use camino::Utf8Path;
use tracing::{info, warn};

use crate::compute::ComputeBackend;
use crate::provision::Provisioner;
use crate::staging::Stager;
use crate::store::BlobStore;

/// Ledger of the remote resources a run has created so far. Fields are
/// recorded as the corresponding creation call is issued and consumed by
/// [`TeardownCoordinator::teardown`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ResourceSet {
    /// Input container name, when created.
    pub input_container: Option<String>,
    /// Pool identifier, when created.
    pub pool_id: Option<String>,
    /// Job identifier, when created.
    pub job_id: Option<String>,
    /// Output container name, when created.
    pub output_container: Option<String>,
}

impl ResourceSet {
    /// Returns `true` when nothing has been created yet.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.input_container.is_none()
            && self.pool_id.is_none()
            && self.job_id.is_none()
            && self.output_container.is_none()
    }
}

/// One cleanup step that failed; never fatal.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TeardownFailure {
    /// Resource the step was acting on (for example `job NightlyRun`).
    pub resource: String,
    /// Error string from the failing operation.
    pub message: String,
}

/// Outcome of a teardown pass.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TeardownReport {
    /// Every step that failed, in attempt order.
    pub failures: Vec<TeardownFailure>,
    /// Number of output files downloaded before deletion.
    pub downloaded_files: usize,
    /// Output container left alive, when outputs were retained.
    pub retained_output_container: Option<String>,
}

impl TeardownReport {
    /// Returns `true` when every attempted step succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, resource: impl Into<String>, message: impl Into<String>) {
        let failure = TeardownFailure {
            resource: resource.into(),
            message: message.into(),
        };
        warn!(resource = %failure.resource, error = %failure.message, "cleanup step failed");
        self.failures.push(failure);
    }
}

/// Deletes the resources of one run in dependency order.
#[derive(Debug)]
pub struct TeardownCoordinator<'a, S: BlobStore, C: ComputeBackend> {
    stager: &'a Stager<S>,
    provisioner: &'a Provisioner<C>,
}

impl<'a, S: BlobStore, C: ComputeBackend> TeardownCoordinator<'a, S, C> {
    /// Creates a coordinator borrowing the run's stager and provisioner.
    #[must_use]
    pub const fn new(stager: &'a Stager<S>, provisioner: &'a Provisioner<C>) -> Self {
        Self {
            stager,
            provisioner,
        }
    }

    /// Tears down every recorded resource: optionally download the output
    /// container first, then delete the job, the pool, the output
    /// container, and the input container. Each step is independent of the
    /// others' success.
    ///
    /// When `retain_outputs` is set, or when the download step fails, the
    /// output container is left alive so results are not discarded.
    pub async fn teardown(
        &self,
        resources: &ResourceSet,
        download_to: Option<&Utf8Path>,
        retain_outputs: bool,
    ) -> TeardownReport {
        let mut report = TeardownReport::default();
        let mut keep_output = retain_outputs;

        if let (Some(dest), Some(container)) = (download_to, resources.output_container.as_ref()) {
            match self.stager.download_container(container, dest).await {
                Ok(written) => {
                    info!(container = %container, files = written, dest = %dest, "downloaded outputs");
                    report.downloaded_files = written;
                }
                Err(err) => {
                    // Deleting an undrained container would destroy results.
                    keep_output = true;
                    report.record(format!("download {container}"), err.to_string());
                }
            }
        }

        if let Some(job_id) = resources.job_id.as_ref() {
            if let Err(err) = self.provisioner.delete_job(job_id).await {
                report.record(format!("job {job_id}"), err.to_string());
            }
        }

        if let Some(pool_id) = resources.pool_id.as_ref() {
            if let Err(err) = self.provisioner.delete_pool(pool_id).await {
                report.record(format!("pool {pool_id}"), err.to_string());
            }
        }

        if let Some(container) = resources.output_container.as_ref() {
            if keep_output {
                info!(container = %container, "output container retained");
                report.retained_output_container = Some(container.clone());
            } else if let Err(err) = self.stager.delete_container(container).await {
                report.record(format!("container {container}"), err.to_string());
            }
        }

        if let Some(container) = resources.input_container.as_ref() {
            if let Err(err) = self.stager.delete_container(container).await {
                report.record(format!("container {container}"), err.to_string());
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MemoryBlobStore, ScriptedCompute};
    use camino::Utf8PathBuf;
    use rstest::rstest;

    fn full_resource_set() -> ResourceSet {
        ResourceSet {
            input_container: Some(String::from("run-input")),
            pool_id: Some(String::from("Run")),
            job_id: Some(String::from("Run")),
            output_container: Some(String::from("run-output")),
        }
    }

    fn seeded_backends() -> (MemoryBlobStore, ScriptedCompute) {
        let store = MemoryBlobStore::new();
        store.seed_container("run-input");
        store.seed_container("run-output");
        let compute = ScriptedCompute::new();
        compute.seed_pool("Run");
        compute.seed_job("Run");
        (store, compute)
    }

    #[rstest]
    #[tokio::test]
    async fn deletes_everything_in_dependency_order() {
        let (store, compute) = seeded_backends();
        let stager = Stager::new(store.clone());
        let provisioner = Provisioner::new(compute.clone());

        let report = TeardownCoordinator::new(&stager, &provisioner)
            .teardown(&full_resource_set(), None, false)
            .await;

        assert!(report.is_clean(), "failures: {:?}", report.failures);
        assert!(store.containers().is_empty());
        assert!(compute.pools().is_empty());
        assert!(compute.jobs().is_empty());
        assert_eq!(
            compute.operations(),
            vec!["delete_job", "delete_pool"],
            "job deletion must precede pool deletion"
        );
    }

    #[rstest]
    #[tokio::test]
    async fn job_failure_does_not_stop_remaining_steps() {
        let (store, compute) = seeded_backends();
        compute.fail_operation("delete_job");
        let stager = Stager::new(store.clone());
        let provisioner = Provisioner::new(compute.clone());

        let report = TeardownCoordinator::new(&stager, &provisioner)
            .teardown(&full_resource_set(), None, false)
            .await;

        assert_eq!(report.failures.len(), 1);
        assert!(
            report
                .failures
                .first()
                .is_some_and(|failure| failure.resource == "job Run")
        );
        // Pool and both containers were still deleted.
        assert!(compute.pools().is_empty());
        assert!(store.containers().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn retaining_outputs_keeps_the_output_container() {
        let (store, compute) = seeded_backends();
        let stager = Stager::new(store.clone());
        let provisioner = Provisioner::new(compute);

        let report = TeardownCoordinator::new(&stager, &provisioner)
            .teardown(&full_resource_set(), None, true)
            .await;

        assert!(report.is_clean());
        assert_eq!(
            report.retained_output_container.as_deref(),
            Some("run-output")
        );
        assert!(store.has_container("run-output"));
        assert!(!store.has_container("run-input"));
    }

    #[rstest]
    #[tokio::test]
    async fn failed_download_retains_the_output_container() {
        let (store, compute) = seeded_backends();
        store.seed_blob("run-output", "a.txt", b"alpha".to_vec());
        store.fail_operation("get_blob");
        let stager = Stager::new(store.clone());
        let provisioner = Provisioner::new(compute);

        let dir = tempfile::tempdir().expect("temp dir");
        let dest =
            Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 temp dir");
        let report = TeardownCoordinator::new(&stager, &provisioner)
            .teardown(&full_resource_set(), Some(&dest), false)
            .await;

        assert!(!report.is_clean());
        assert_eq!(
            report.retained_output_container.as_deref(),
            Some("run-output")
        );
        assert!(store.has_container("run-output"));
    }

    #[rstest]
    #[tokio::test]
    async fn downloads_before_deleting_when_requested() {
        let (store, compute) = seeded_backends();
        store.seed_blob("run-output", "out/result.json", b"{}".to_vec());
        let stager = Stager::new(store.clone());
        let provisioner = Provisioner::new(compute);

        let dir = tempfile::tempdir().expect("temp dir");
        let dest =
            Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 temp dir");
        let report = TeardownCoordinator::new(&stager, &provisioner)
            .teardown(&full_resource_set(), Some(&dest), false)
            .await;

        assert!(report.is_clean(), "failures: {:?}", report.failures);
        assert_eq!(report.downloaded_files, 1);
        assert!(dest.join("out/result.json").exists());
        assert!(!store.has_container("run-output"));
    }

    #[rstest]
    #[tokio::test]
    async fn empty_resource_set_is_a_no_op() {
        let store = MemoryBlobStore::new();
        let compute = ScriptedCompute::new();
        let stager = Stager::new(store);
        let provisioner = Provisioner::new(compute.clone());

        let report = TeardownCoordinator::new(&stager, &provisioner)
            .teardown(&ResourceSet::default(), None, false)
            .await;

        assert!(report.is_clean());
        assert!(compute.operations().is_empty());
    }
}
