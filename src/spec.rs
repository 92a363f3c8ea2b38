//! Immutable job description and its validating builder.
//!
//! A [`JobSpec`] is produced once from configuration, validated exhaustively,
//! and then passed by reference to every component. All remote resource names
//! derive deterministically from the job name, so two runs sharing a job name
//! would collide; the tool assumes at most one active run per name.

use thiserror::Error;

/// VM size used when the configuration does not override it. Large enough to
/// cover most workloads.
pub const DEFAULT_VM_SIZE: &str = "Standard_D16s_v3";

/// Suffix appended to the lower-cased job name for the input container.
pub const INPUT_CONTAINER_SUFFIX: &str = "-input";

/// Suffix appended to the lower-cased job name for the output container.
pub const OUTPUT_CONTAINER_SUFFIX: &str = "-output";

/// Containers are limited to 63 characters, so the job name must leave room
/// for the longest suffix.
const MAX_JOB_NAME_LEN: usize = 63 - OUTPUT_CONTAINER_SUFFIX.len();

/// One local-to-remote staging instruction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InputMapping {
    /// Local glob patterns selecting the files to upload.
    pub patterns: Vec<String>,
    /// Destination directory in the task working directory; `None` means the
    /// working-directory root.
    pub destination: Option<String>,
}

impl InputMapping {
    /// Parses the configuration value syntax: whitespace-separated tokens
    /// where a single token is one glob pattern and, with several tokens,
    /// the last one names the remote destination directory.
    ///
    /// Returns `None` for a blank value.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let mut tokens: Vec<String> = value.split_whitespace().map(str::to_owned).collect();
        match tokens.len() {
            0 => None,
            1 => Some(Self {
                patterns: tokens,
                destination: None,
            }),
            _ => {
                let destination = tokens.pop();
                Some(Self {
                    patterns: tokens,
                    destination,
                })
            }
        }
    }

    /// Computes the task-side path for a file with the given basename.
    #[must_use]
    pub fn remote_path_for(&self, basename: &str) -> String {
        self.destination.as_ref().map_or_else(
            || basename.to_owned(),
            |dir| format!("{}/{basename}", dir.trim_end_matches('/')),
        )
    }
}

/// Remote path/glob patterns captured after the task finishes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OutputMapping {
    /// Patterns relative to the task working directory.
    pub patterns: Vec<String>,
}

impl OutputMapping {
    /// Parses the configuration value syntax: whitespace-separated patterns.
    ///
    /// Returns `None` for a blank value.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let patterns: Vec<String> = value.split_whitespace().map(str::to_owned).collect();
        if patterns.is_empty() {
            None
        } else {
            Some(Self { patterns })
        }
    }
}

/// Errors raised while assembling a [`JobSpec`].
#[derive(Debug, Error, Eq, PartialEq)]
pub enum SpecError {
    /// Raised when required fields are unset or required lists are empty.
    /// Every missing option is reported at once so the configuration can be
    /// fixed in one pass.
    #[error(
        "the following options are required, but were not found in your \
         configuration file: {}",
        missing.join(", ")
    )]
    Incomplete {
        /// Configuration keys of every missing field, in schema order.
        missing: Vec<String>,
    },
    /// Raised when the job name cannot derive valid container names.
    #[error("JOB_NAME '{name}' cannot be used for container names: {reason}")]
    InvalidJobName {
        /// The rejected job name.
        name: String,
        /// Why the name was rejected.
        reason: String,
    },
}

/// The validated description of one run. Either fully valid or unusable,
/// never partially valid; construct it through [`JobSpec::builder`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JobSpec {
    /// Batch account name.
    pub batch_account_name: String,
    /// Batch account shared key.
    pub batch_account_key: String,
    /// Batch account endpoint URL.
    pub batch_account_url: String,
    /// Storage account name.
    pub storage_account_name: String,
    /// Storage account shared key.
    pub storage_account_key: String,
    /// Job name; every remote resource name derives from it.
    pub job_name: String,
    /// Shell command executed on the compute node.
    pub command: String,
    /// Virtual machine image the pool nodes boot from.
    pub vm_image: String,
    /// Virtual machine size; defaults to [`DEFAULT_VM_SIZE`].
    pub vm_size: String,
    /// Ordered input staging instructions.
    pub inputs: Vec<InputMapping>,
    /// Ordered output capture instructions.
    pub outputs: Vec<OutputMapping>,
}

impl JobSpec {
    /// Starts a builder for a [`JobSpec`].
    #[must_use]
    pub fn builder() -> JobSpecBuilder {
        JobSpecBuilder::default()
    }

    /// Pool identifier: equals the job name.
    #[must_use]
    pub fn pool_id(&self) -> &str {
        &self.job_name
    }

    /// Job identifier: equals the job name.
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_name
    }

    /// Name of the container holding staged inputs:
    /// `lower(job_name) + "-input"`.
    #[must_use]
    pub fn input_container(&self) -> String {
        format!("{}{INPUT_CONTAINER_SUFFIX}", self.job_name.to_lowercase())
    }

    /// Name of the container receiving task outputs:
    /// `lower(job_name) + "-output"`.
    #[must_use]
    pub fn output_container(&self) -> String {
        format!("{}{OUTPUT_CONTAINER_SUFFIX}", self.job_name.to_lowercase())
    }
}

/// Builder for [`JobSpec`] that defers trimming and validation to
/// construction and reports every problem in one pass.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct JobSpecBuilder {
    batch_account_name: String,
    batch_account_key: String,
    batch_account_url: String,
    storage_account_name: String,
    storage_account_key: String,
    job_name: String,
    command: String,
    vm_image: String,
    vm_size: String,
    inputs: Vec<InputMapping>,
    outputs: Vec<OutputMapping>,
}

impl JobSpecBuilder {
    /// Sets the batch account name.
    #[must_use]
    pub fn batch_account_name(mut self, value: impl Into<String>) -> Self {
        self.batch_account_name = value.into();
        self
    }

    /// Sets the batch account key.
    #[must_use]
    pub fn batch_account_key(mut self, value: impl Into<String>) -> Self {
        self.batch_account_key = value.into();
        self
    }

    /// Sets the batch account endpoint URL.
    #[must_use]
    pub fn batch_account_url(mut self, value: impl Into<String>) -> Self {
        self.batch_account_url = value.into();
        self
    }

    /// Sets the storage account name.
    #[must_use]
    pub fn storage_account_name(mut self, value: impl Into<String>) -> Self {
        self.storage_account_name = value.into();
        self
    }

    /// Sets the storage account key.
    #[must_use]
    pub fn storage_account_key(mut self, value: impl Into<String>) -> Self {
        self.storage_account_key = value.into();
        self
    }

    /// Sets the job name.
    #[must_use]
    pub fn job_name(mut self, value: impl Into<String>) -> Self {
        self.job_name = value.into();
        self
    }

    /// Sets the remote command.
    #[must_use]
    pub fn command(mut self, value: impl Into<String>) -> Self {
        self.command = value.into();
        self
    }

    /// Sets the VM image.
    #[must_use]
    pub fn vm_image(mut self, value: impl Into<String>) -> Self {
        self.vm_image = value.into();
        self
    }

    /// Sets the VM size, overriding [`DEFAULT_VM_SIZE`].
    #[must_use]
    pub fn vm_size(mut self, value: impl Into<String>) -> Self {
        self.vm_size = value.into();
        self
    }

    /// Appends one input mapping; order is preserved.
    #[must_use]
    pub fn input(mut self, mapping: InputMapping) -> Self {
        self.inputs.push(mapping);
        self
    }

    /// Appends one output mapping; order is preserved.
    #[must_use]
    pub fn output(mut self, mapping: OutputMapping) -> Self {
        self.outputs.push(mapping);
        self
    }

    /// Builds and validates the [`JobSpec`], trimming string inputs and
    /// applying the VM size default.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::Incomplete`] naming every unset field and empty
    /// list, or [`SpecError::InvalidJobName`] when the job name cannot
    /// derive valid container names.
    pub fn build(self) -> Result<JobSpec, SpecError> {
        let spec = JobSpec {
            batch_account_name: self.batch_account_name.trim().to_owned(),
            batch_account_key: self.batch_account_key.trim().to_owned(),
            batch_account_url: self.batch_account_url.trim().to_owned(),
            storage_account_name: self.storage_account_name.trim().to_owned(),
            storage_account_key: self.storage_account_key.trim().to_owned(),
            job_name: self.job_name.trim().to_owned(),
            command: self.command.trim().to_owned(),
            vm_image: self.vm_image.trim().to_owned(),
            vm_size: {
                let trimmed = self.vm_size.trim();
                if trimmed.is_empty() {
                    DEFAULT_VM_SIZE.to_owned()
                } else {
                    trimmed.to_owned()
                }
            },
            inputs: self.inputs,
            outputs: self.outputs,
        };

        let mut missing = Vec::new();
        let required = [
            ("BATCH_ACCOUNT_NAME", &spec.batch_account_name),
            ("BATCH_ACCOUNT_KEY", &spec.batch_account_key),
            ("BATCH_ACCOUNT_URL", &spec.batch_account_url),
            ("STORAGE_ACCOUNT_NAME", &spec.storage_account_name),
            ("STORAGE_ACCOUNT_KEY", &spec.storage_account_key),
            ("JOB_NAME", &spec.job_name),
            ("COMMAND", &spec.command),
            ("VM_IMAGE", &spec.vm_image),
        ];
        for (key, value) in required {
            if value.is_empty() {
                missing.push(key.to_owned());
            }
        }
        if spec.inputs.is_empty() {
            missing.push("INPUT".to_owned());
        }
        if spec.outputs.is_empty() {
            missing.push("OUTPUT".to_owned());
        }
        if !missing.is_empty() {
            return Err(SpecError::Incomplete { missing });
        }

        validate_job_name(&spec.job_name)?;
        Ok(spec)
    }
}

/// Checks that the lower-cased job name plus the container suffixes stays a
/// valid container name: ASCII alphanumerics and single interior hyphens,
/// starting and ending alphanumeric, within the length limit.
fn validate_job_name(name: &str) -> Result<(), SpecError> {
    let reject = |reason: &str| SpecError::InvalidJobName {
        name: name.to_owned(),
        reason: reason.to_owned(),
    };

    if name.len() > MAX_JOB_NAME_LEN {
        return Err(reject(&format!(
            "longer than {MAX_JOB_NAME_LEN} characters"
        )));
    }
    let lowered = name.to_lowercase();
    if !lowered
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-')
    {
        return Err(reject(
            "only ASCII letters, digits, and hyphens are allowed",
        ));
    }
    let starts_ok = lowered.chars().next().is_some_and(|ch| ch.is_ascii_alphanumeric());
    let ends_ok = lowered.chars().last().is_some_and(|ch| ch.is_ascii_alphanumeric());
    if !starts_ok || !ends_ok {
        return Err(reject("must start and end with a letter or digit"));
    }
    if lowered.contains("--") {
        return Err(reject("consecutive hyphens are not allowed"));
    }
    Ok(())
}
