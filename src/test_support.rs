//! Test support utilities shared across unit and integration tests.
//!
//! Both fakes sit behind the production seams so orchestration logic can be
//! exercised without network access: [`MemoryBlobStore`] is a functional
//! in-memory object store and [`ScriptedCompute`] records every backend call
//! while serving scripted task-state observations.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;

use crate::compute::{ComputeBackend, ComputeFuture, PoolSpec, TaskSpec, TaskStatus};
use crate::store::{BlobItem, BlobStore, SasPermission, StoreFuture, TimeLimitedUrl};

/// Errors returned by [`MemoryBlobStore`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum MemoryStoreError {
    /// Raised when creating a container that already exists.
    #[error("container {container} already exists")]
    AlreadyExists {
        /// Colliding container name.
        container: String,
    },
    /// Raised when addressing a container that does not exist.
    #[error("container {container} not found")]
    ContainerNotFound {
        /// Missing container name.
        container: String,
    },
    /// Raised when addressing a blob that does not exist.
    #[error("blob {blob} not found in container {container}")]
    BlobNotFound {
        /// Container that was searched.
        container: String,
        /// Missing blob name.
        blob: String,
    },
    /// Raised when the test scripted the operation to fail.
    #[error("injected failure for {operation}")]
    Injected {
        /// Operation that was scripted to fail.
        operation: String,
    },
}

#[derive(Debug, Default)]
struct MemoryState {
    containers: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    failed_operations: BTreeSet<String>,
    stage_on_create: BTreeMap<String, Vec<(String, Vec<u8>)>>,
}

/// In-memory [`BlobStore`] with scripted failure injection.
#[derive(Clone, Debug, Default)]
pub struct MemoryBlobStore {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryBlobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self, operation: &str) -> Result<(), MemoryStoreError> {
        if self.state().failed_operations.contains(operation) {
            return Err(MemoryStoreError::Injected {
                operation: operation.to_owned(),
            });
        }
        Ok(())
    }

    /// Scripts every future call of `operation` to fail. Recognized names
    /// match the [`BlobStore`] methods.
    pub fn fail_operation(&self, operation: &str) {
        self.state().failed_operations.insert(operation.to_owned());
    }

    /// Creates a container directly, bypassing failure injection.
    pub fn seed_container(&self, name: &str) {
        self.state().containers.entry(name.to_owned()).or_default();
    }

    /// Inserts a blob directly, creating the container if needed.
    pub fn seed_blob(&self, container: &str, name: &str, body: Vec<u8>) {
        self.state()
            .containers
            .entry(container.to_owned())
            .or_default()
            .insert(name.to_owned(), body);
    }

    /// Arranges for `name`/`body` to appear in `container` the moment the
    /// store creates it, simulating a remote task writing outputs through
    /// its capability URL.
    pub fn stage_blob_on_create(&self, container: &str, name: &str, body: Vec<u8>) {
        self.state()
            .stage_on_create
            .entry(container.to_owned())
            .or_default()
            .push((name.to_owned(), body));
    }

    /// Returns `true` when the container currently exists.
    #[must_use]
    pub fn has_container(&self, name: &str) -> bool {
        self.state().containers.contains_key(name)
    }

    /// Names of every container currently alive.
    #[must_use]
    pub fn containers(&self) -> Vec<String> {
        self.state().containers.keys().cloned().collect()
    }

    /// Contents of one blob, when present.
    #[must_use]
    pub fn blob(&self, container: &str, name: &str) -> Option<Vec<u8>> {
        self.state()
            .containers
            .get(container)
            .and_then(|blobs| blobs.get(name))
            .cloned()
    }
}

impl BlobStore for MemoryBlobStore {
    type Error = MemoryStoreError;

    fn create_container<'a>(&'a self, name: &'a str) -> StoreFuture<'a, (), Self::Error> {
        let this = self.clone();
        Box::pin(async move {
            this.check("create_container")?;
            let mut state = this.state();
            if state.containers.contains_key(name) {
                return Err(MemoryStoreError::AlreadyExists {
                    container: name.to_owned(),
                });
            }
            let staged = state.stage_on_create.remove(name).unwrap_or_default();
            state
                .containers
                .insert(name.to_owned(), staged.into_iter().collect());
            Ok(())
        })
    }

    fn delete_container<'a>(&'a self, name: &'a str) -> StoreFuture<'a, (), Self::Error> {
        let this = self.clone();
        Box::pin(async move {
            this.check("delete_container")?;
            // Absent containers delete successfully.
            this.state().containers.remove(name);
            Ok(())
        })
    }

    fn put_blob<'a>(
        &'a self,
        container: &'a str,
        name: &'a str,
        body: Vec<u8>,
    ) -> StoreFuture<'a, (), Self::Error> {
        let this = self.clone();
        Box::pin(async move {
            this.check("put_blob")?;
            let mut state = this.state();
            let blobs =
                state
                    .containers
                    .get_mut(container)
                    .ok_or_else(|| MemoryStoreError::ContainerNotFound {
                        container: container.to_owned(),
                    })?;
            blobs.insert(name.to_owned(), body);
            Ok(())
        })
    }

    fn get_blob<'a>(
        &'a self,
        container: &'a str,
        name: &'a str,
    ) -> StoreFuture<'a, Vec<u8>, Self::Error> {
        let this = self.clone();
        Box::pin(async move {
            this.check("get_blob")?;
            this.blob(container, name)
                .ok_or_else(|| MemoryStoreError::BlobNotFound {
                    container: container.to_owned(),
                    blob: name.to_owned(),
                })
        })
    }

    fn list_blobs<'a>(&'a self, container: &'a str) -> StoreFuture<'a, Vec<BlobItem>, Self::Error> {
        let this = self.clone();
        Box::pin(async move {
            this.check("list_blobs")?;
            let state = this.state();
            let blobs =
                state
                    .containers
                    .get(container)
                    .ok_or_else(|| MemoryStoreError::ContainerNotFound {
                        container: container.to_owned(),
                    })?;
            Ok(blobs
                .iter()
                .map(|(name, body)| BlobItem {
                    name: name.clone(),
                    size: u64::try_from(body.len()).ok(),
                })
                .collect())
        })
    }

    fn container_url<'a>(
        &'a self,
        container: &'a str,
        permission: SasPermission,
        ttl: Duration,
    ) -> StoreFuture<'a, TimeLimitedUrl, Self::Error> {
        let this = self.clone();
        Box::pin(async move {
            this.check("container_url")?;
            let ttl_seconds = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
            let query = format!("sig=fake-{}", permission.token());
            Ok(TimeLimitedUrl {
                url: format!("memory://{container}?{query}"),
                query,
                permission,
                expires_at: Utc::now() + chrono::Duration::seconds(ttl_seconds),
            })
        })
    }

    fn blob_url(&self, container: &str, name: &str, capability: &TimeLimitedUrl) -> String {
        format!("memory://{container}/{name}?{}", capability.query)
    }
}

/// Errors returned by [`ScriptedCompute`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ScriptedComputeError {
    /// Raised when the test scripted the operation to fail.
    #[error("injected failure for {operation}")]
    Injected {
        /// Operation that was scripted to fail.
        operation: String,
    },
    /// Raised when an operation's precondition resource is missing.
    #[error("{resource} does not exist")]
    MissingResource {
        /// Description of the missing resource.
        resource: String,
    },
    /// Raised when creating a resource that already exists.
    #[error("{resource} already exists")]
    AlreadyExists {
        /// Description of the colliding resource.
        resource: String,
    },
}

#[derive(Debug, Default)]
struct ComputeState {
    pools: BTreeMap<String, PoolSpec>,
    jobs: BTreeMap<String, String>,
    tasks: BTreeMap<String, Vec<TaskSpec>>,
    states: VecDeque<Vec<TaskStatus>>,
    failed_operations: BTreeSet<String>,
    operations: Vec<String>,
    state_queries: usize,
}

/// Recording [`ComputeBackend`] fake with scripted task-state observations.
///
/// When the scripted state queue runs dry, listings report one completed
/// task so happy-path waits terminate.
#[derive(Clone, Debug, Default)]
pub struct ScriptedCompute {
    inner: Arc<Mutex<ComputeState>>,
}

impl ScriptedCompute {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ComputeState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self, operation: &str) -> Result<(), ScriptedComputeError> {
        let mut state = self.state();
        state.operations.push(operation.to_owned());
        if state.failed_operations.contains(operation) {
            return Err(ScriptedComputeError::Injected {
                operation: operation.to_owned(),
            });
        }
        Ok(())
    }

    /// Scripts every future call of `operation` to fail. Recognized names
    /// match the [`ComputeBackend`] methods.
    pub fn fail_operation(&self, operation: &str) {
        self.state().failed_operations.insert(operation.to_owned());
    }

    /// Queues one task-state observation; observations are served in FIFO
    /// order.
    pub fn push_states(&self, states: Vec<TaskStatus>) {
        self.state().states.push_back(states);
    }

    /// Creates a pool directly, bypassing failure injection.
    pub fn seed_pool(&self, id: &str) {
        self.state().pools.insert(
            id.to_owned(),
            PoolSpec {
                id: id.to_owned(),
                vm_size: String::from("seeded"),
                vm_image: String::from("seeded"),
                target_nodes: 1,
            },
        );
    }

    /// Creates a job directly, bypassing failure injection.
    pub fn seed_job(&self, id: &str) {
        self.state().jobs.insert(id.to_owned(), id.to_owned());
    }

    /// Identifiers of every pool currently alive.
    #[must_use]
    pub fn pools(&self) -> Vec<String> {
        self.state().pools.keys().cloned().collect()
    }

    /// The recorded [`PoolSpec`] for one pool, when present.
    #[must_use]
    pub fn pool(&self, id: &str) -> Option<PoolSpec> {
        self.state().pools.get(id).cloned()
    }

    /// Identifiers of every job currently alive.
    #[must_use]
    pub fn jobs(&self) -> Vec<String> {
        self.state().jobs.keys().cloned().collect()
    }

    /// Tasks recorded for a job, in submission order.
    #[must_use]
    pub fn tasks(&self, job_id: &str) -> Vec<TaskSpec> {
        self.state().tasks.get(job_id).cloned().unwrap_or_default()
    }

    /// Every backend call made so far, in order, by operation name.
    #[must_use]
    pub fn operations(&self) -> Vec<String> {
        self.state().operations.clone()
    }

    /// Number of task-state listings served so far.
    #[must_use]
    pub fn state_queries(&self) -> usize {
        self.state().state_queries
    }
}

impl ComputeBackend for ScriptedCompute {
    type Error = ScriptedComputeError;

    fn create_pool<'a>(&'a self, pool: &'a PoolSpec) -> ComputeFuture<'a, (), Self::Error> {
        let this = self.clone();
        let pool = pool.clone();
        Box::pin(async move {
            this.begin("create_pool")?;
            let mut state = this.state();
            if state.pools.contains_key(&pool.id) {
                return Err(ScriptedComputeError::AlreadyExists {
                    resource: format!("pool {}", pool.id),
                });
            }
            state.pools.insert(pool.id.clone(), pool);
            Ok(())
        })
    }

    fn create_job<'a>(
        &'a self,
        job_id: &'a str,
        pool_id: &'a str,
    ) -> ComputeFuture<'a, (), Self::Error> {
        let this = self.clone();
        Box::pin(async move {
            this.begin("create_job")?;
            let mut state = this.state();
            if !state.pools.contains_key(pool_id) {
                return Err(ScriptedComputeError::MissingResource {
                    resource: format!("pool {pool_id}"),
                });
            }
            if state.jobs.contains_key(job_id) {
                return Err(ScriptedComputeError::AlreadyExists {
                    resource: format!("job {job_id}"),
                });
            }
            state.jobs.insert(job_id.to_owned(), pool_id.to_owned());
            Ok(())
        })
    }

    fn add_task<'a>(
        &'a self,
        job_id: &'a str,
        task: &'a TaskSpec,
    ) -> ComputeFuture<'a, (), Self::Error> {
        let this = self.clone();
        let task = task.clone();
        Box::pin(async move {
            this.begin("add_task")?;
            let mut state = this.state();
            if !state.jobs.contains_key(job_id) {
                return Err(ScriptedComputeError::MissingResource {
                    resource: format!("job {job_id}"),
                });
            }
            state.tasks.entry(job_id.to_owned()).or_default().push(task);
            Ok(())
        })
    }

    fn task_states<'a>(
        &'a self,
        _job_id: &'a str,
    ) -> ComputeFuture<'a, Vec<TaskStatus>, Self::Error> {
        let this = self.clone();
        Box::pin(async move {
            this.begin("task_states")?;
            let mut state = this.state();
            state.state_queries += 1;
            Ok(state
                .states
                .pop_front()
                .unwrap_or_else(|| vec![TaskStatus::Completed]))
        })
    }

    fn delete_job<'a>(&'a self, job_id: &'a str) -> ComputeFuture<'a, (), Self::Error> {
        let this = self.clone();
        Box::pin(async move {
            this.begin("delete_job")?;
            // Absent jobs delete successfully.
            let mut state = this.state();
            state.jobs.remove(job_id);
            state.tasks.remove(job_id);
            Ok(())
        })
    }

    fn delete_pool<'a>(&'a self, pool_id: &'a str) -> ComputeFuture<'a, (), Self::Error> {
        let this = self.clone();
        Box::pin(async move {
            this.begin("delete_pool")?;
            this.state().pools.remove(pool_id);
            Ok(())
        })
    }
}
