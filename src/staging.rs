//! Input/output staging between the local filesystem and the object store.
//!
//! Staging is split into an upload-before-run phase (the orchestrator pushes
//! inputs and hands the task read-scoped references) and a write-during-run
//! phase (the task pushes outputs through a write-scoped capability URL), so
//! the orchestrator never streams task output in real time.

use std::path::Path;
use std::time::Duration;

use camino::{Utf8Component, Utf8Path};
use thiserror::Error;
use tracing::{debug, warn};

use crate::compute::ResourceReference;
use crate::spec::InputMapping;
use crate::store::{BlobStore, SasPermission, TimeLimitedUrl};

/// Validity window for every capability URL minted during a run.
pub const SAS_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// Errors surfaced while staging files to or from the object store.
#[derive(Debug, Error)]
pub enum StagingError<E>
where
    E: std::error::Error + 'static,
{
    /// Raised when a container cannot be created, including name collisions
    /// with a container left over from an earlier run.
    #[error("failed to create container {container}: {source}")]
    Container {
        /// Container that could not be created.
        container: String,
        /// Store error.
        #[source]
        source: E,
    },
    /// Raised when a glob pattern does not parse.
    #[error("invalid input pattern '{pattern}': {message}")]
    Pattern {
        /// The rejected pattern.
        pattern: String,
        /// Parser error message.
        message: String,
    },
    /// Raised when a matched input file cannot be read.
    #[error("failed to read input file {path}: {message}")]
    UnreadableInput {
        /// Local path that could not be read.
        path: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when an input file name is not valid UTF-8.
    #[error("input path {path} is not valid UTF-8")]
    NonUtf8Path {
        /// Lossy rendering of the offending path.
        path: String,
    },
    /// Raised when a blob upload fails.
    #[error("failed to upload {blob} to container {container}: {source}")]
    Upload {
        /// Destination container.
        container: String,
        /// Blob name being uploaded.
        blob: String,
        /// Store error.
        #[source]
        source: E,
    },
    /// Raised when a container listing fails.
    #[error("failed to list container {container}: {source}")]
    List {
        /// Container being listed.
        container: String,
        /// Store error.
        #[source]
        source: E,
    },
    /// Raised when a blob download fails.
    #[error("failed to download {blob} from container {container}: {source}")]
    Download {
        /// Source container.
        container: String,
        /// Blob being downloaded.
        blob: String,
        /// Store error.
        #[source]
        source: E,
    },
    /// Raised when a downloaded blob cannot be written locally.
    #[error("failed to write local file {path}: {message}")]
    LocalWrite {
        /// Local path that could not be written.
        path: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a capability URL cannot be minted.
    #[error("failed to mint {permission} URL for container {container}: {source}")]
    Capability {
        /// Container the capability was requested for.
        container: String,
        /// Permission that was requested.
        permission: SasPermission,
        /// Store error.
        #[source]
        source: E,
    },
    /// Raised when a container deletion fails for a reason other than the
    /// container already being gone.
    #[error("failed to delete container {container}: {source}")]
    Delete {
        /// Container being deleted.
        container: String,
        /// Store error.
        #[source]
        source: E,
    },
}

/// Moves files between the local filesystem and the object store.
#[derive(Clone, Debug)]
pub struct Stager<S: BlobStore> {
    store: S,
}

impl<S: BlobStore> Stager<S> {
    /// Creates a stager over the given store.
    #[must_use]
    pub const fn new(store: S) -> Self {
        Self { store }
    }

    /// Returns a reference to the underlying store.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Creates the input container, uploads every file matched by the
    /// mappings, and returns one read-scoped reference per uploaded file.
    ///
    /// Blobs are named after the file basename; the mapping's destination
    /// directory only affects the path the file appears at in the task
    /// working directory. A pattern matching nothing uploads nothing and is
    /// logged at warn level.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError`] when the container cannot be created, a
    /// pattern does not parse, a matched file is unreadable, an upload
    /// fails, or the read capability cannot be minted.
    pub async fn upload_inputs(
        &self,
        container: &str,
        inputs: &[InputMapping],
    ) -> Result<Vec<ResourceReference>, StagingError<S::Error>> {
        self.store
            .create_container(container)
            .await
            .map_err(|source| StagingError::Container {
                container: container.to_owned(),
                source,
            })?;

        let mut staged: Vec<(String, String)> = Vec::new();
        for mapping in inputs {
            for pattern in &mapping.patterns {
                let matched = self.upload_pattern(container, mapping, pattern, &mut staged).await?;
                if matched == 0 {
                    warn!(pattern, "input pattern matched no files");
                }
            }
        }

        let capability = self
            .store
            .container_url(container, SasPermission::Read, SAS_TTL)
            .await
            .map_err(|source| StagingError::Capability {
                container: container.to_owned(),
                permission: SasPermission::Read,
                source,
            })?;

        Ok(staged
            .into_iter()
            .map(|(blob, remote_path)| ResourceReference {
                url: self.store.blob_url(container, &blob, &capability),
                remote_path,
            })
            .collect())
    }

    async fn upload_pattern(
        &self,
        container: &str,
        mapping: &InputMapping,
        pattern: &str,
        staged: &mut Vec<(String, String)>,
    ) -> Result<usize, StagingError<S::Error>> {
        let paths = glob::glob(pattern).map_err(|err| StagingError::Pattern {
            pattern: pattern.to_owned(),
            message: err.to_string(),
        })?;

        let mut matched = 0;
        for entry in paths {
            let path = entry.map_err(|err| StagingError::UnreadableInput {
                path: err.path().display().to_string(),
                message: err.to_string(),
            })?;
            if !path.is_file() {
                continue;
            }
            let blob = basename(&path)?;
            let body = tokio::fs::read(&path)
                .await
                .map_err(|err| StagingError::UnreadableInput {
                    path: path.display().to_string(),
                    message: err.to_string(),
                })?;
            debug!(container, blob = %blob, bytes = body.len(), "uploading input file");
            self.store
                .put_blob(container, &blob, body)
                .await
                .map_err(|source| StagingError::Upload {
                    container: container.to_owned(),
                    blob: blob.clone(),
                    source,
                })?;
            let remote_path = mapping.remote_path_for(&blob);
            staged.push((blob, remote_path));
            matched += 1;
        }
        Ok(matched)
    }

    /// Downloads every blob in a container, mirroring blob paths under
    /// `dest` and creating intermediate directories as needed. Returns the
    /// number of files written.
    ///
    /// Blob names that would escape `dest` (absolute, or containing `..`)
    /// are skipped with a warning rather than written.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError`] when the listing, a download, or a local
    /// write fails.
    pub async fn download_container(
        &self,
        container: &str,
        dest: &Utf8Path,
    ) -> Result<usize, StagingError<S::Error>> {
        let blobs = self
            .store
            .list_blobs(container)
            .await
            .map_err(|source| StagingError::List {
                container: container.to_owned(),
                source,
            })?;

        let mut written = 0;
        for blob in blobs {
            if !is_safe_relative(Utf8Path::new(&blob.name)) {
                warn!(blob = %blob.name, "skipping blob with unsafe path");
                continue;
            }
            let body = self
                .store
                .get_blob(container, &blob.name)
                .await
                .map_err(|source| StagingError::Download {
                    container: container.to_owned(),
                    blob: blob.name.clone(),
                    source,
                })?;

            let local = dest.join(&blob.name);
            if let Some(parent) = local.parent() {
                // create_dir_all tolerates directories that already exist.
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|err| StagingError::LocalWrite {
                        path: parent.to_string(),
                        message: err.to_string(),
                    })?;
            }
            tokio::fs::write(&local, body)
                .await
                .map_err(|err| StagingError::LocalWrite {
                    path: local.to_string(),
                    message: err.to_string(),
                })?;
            debug!(blob = %blob.name, local = %local, "downloaded output file");
            written += 1;
        }
        Ok(written)
    }

    /// Creates the output container and mints the write-scoped capability
    /// the task uploads its outputs through.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError`] when creation or minting fails.
    pub async fn prepare_output_container(
        &self,
        container: &str,
    ) -> Result<TimeLimitedUrl, StagingError<S::Error>> {
        self.store
            .create_container(container)
            .await
            .map_err(|source| StagingError::Container {
                container: container.to_owned(),
                source,
            })?;
        self.store
            .container_url(container, SasPermission::Write, SAS_TTL)
            .await
            .map_err(|source| StagingError::Capability {
                container: container.to_owned(),
                permission: SasPermission::Write,
                source,
            })
    }

    /// Deletes a container; deleting an absent container succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError::Delete`] when the store reports a failure
    /// other than absence.
    pub async fn delete_container(&self, container: &str) -> Result<(), StagingError<S::Error>> {
        self.store
            .delete_container(container)
            .await
            .map_err(|source| StagingError::Delete {
                container: container.to_owned(),
                source,
            })
    }
}

fn basename<E>(path: &Path) -> Result<String, StagingError<E>>
where
    E: std::error::Error + 'static,
{
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_owned)
        .ok_or_else(|| StagingError::NonUtf8Path {
            path: path.display().to_string(),
        })
}

fn is_safe_relative(path: &Utf8Path) -> bool {
    !path.as_str().is_empty()
        && path
            .components()
            .all(|component| matches!(component, Utf8Component::Normal(_)))
}
