//! Configuration-file parsing for job submissions.
//!
//! The file format is line-oriented `KEY:=VALUE` pairs. Blank lines and `#`
//! comments are skipped. The recognized keys form a closed schema: every key
//! maps onto exactly one [`JobSpec`] field, `INPUT` and `OUTPUT` may repeat
//! and append in order, and anything else is a validation error. Problems
//! are batch-reported so a configuration can be fixed in one pass.

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::spec::{InputMapping, JobSpec, JobSpecBuilder, OutputMapping, SpecError};

/// Separator between a key and its value.
pub const KEY_VALUE_SEPARATOR: &str = ":=";

/// Errors raised while reading, parsing, or validating a configuration file.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Raised when the file cannot be read.
    #[error("failed to read configuration file {path}: {message}")]
    Io {
        /// Path that was being read.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised for lines that are not `KEY:=VALUE`; every offending line is
    /// reported at once.
    #[error("malformed configuration lines (expected KEY:=VALUE): {}", lines.join("; "))]
    Malformed {
        /// Description of each malformed line (`line N: 'content'`).
        lines: Vec<String>,
    },
    /// Raised when keys outside the schema appear; every unrecognized key is
    /// reported at once, not just the first.
    #[error(
        "the following options were specified in the configuration file, \
         but not recognized: {}",
        keys.join(", ")
    )]
    Unrecognized {
        /// Every unrecognized key, in file order, deduplicated.
        keys: Vec<String>,
    },
    /// Raised when the parsed configuration fails spec validation.
    #[error(transparent)]
    Invalid(#[from] SpecError),
}

/// The closed schema of recognized configuration keys.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ConfigKey {
    BatchAccountName,
    BatchAccountKey,
    BatchAccountUrl,
    StorageAccountName,
    StorageAccountKey,
    JobName,
    Command,
    Input,
    Output,
    VmImage,
    VmSize,
}

impl ConfigKey {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "BATCH_ACCOUNT_NAME" => Some(Self::BatchAccountName),
            "BATCH_ACCOUNT_KEY" => Some(Self::BatchAccountKey),
            "BATCH_ACCOUNT_URL" => Some(Self::BatchAccountUrl),
            "STORAGE_ACCOUNT_NAME" => Some(Self::StorageAccountName),
            "STORAGE_ACCOUNT_KEY" => Some(Self::StorageAccountKey),
            "JOB_NAME" => Some(Self::JobName),
            "COMMAND" => Some(Self::Command),
            "INPUT" => Some(Self::Input),
            "OUTPUT" => Some(Self::Output),
            "VM_IMAGE" => Some(Self::VmImage),
            "VM_SIZE" => Some(Self::VmSize),
            _ => None,
        }
    }

    /// Applies one `key := value` assignment to the builder. Returns `None`
    /// when the value is blank for a key whose value syntax forbids it.
    fn apply(self, builder: JobSpecBuilder, value: &str) -> Option<JobSpecBuilder> {
        match self {
            Self::BatchAccountName => Some(builder.batch_account_name(value)),
            Self::BatchAccountKey => Some(builder.batch_account_key(value)),
            Self::BatchAccountUrl => Some(builder.batch_account_url(value)),
            Self::StorageAccountName => Some(builder.storage_account_name(value)),
            Self::StorageAccountKey => Some(builder.storage_account_key(value)),
            Self::JobName => Some(builder.job_name(value)),
            Self::Command => Some(builder.command(value)),
            Self::Input => InputMapping::parse(value).map(|mapping| builder.input(mapping)),
            Self::Output => OutputMapping::parse(value).map(|mapping| builder.output(mapping)),
            Self::VmImage => Some(builder.vm_image(value)),
            Self::VmSize => Some(builder.vm_size(value)),
        }
    }
}

/// Reads and parses a configuration file into a validated [`JobSpec`].
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when the file cannot be read, or any error
/// from [`parse_config_str`].
pub async fn load_job_spec(path: &Utf8Path) -> Result<JobSpec, ConfigError> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|err| ConfigError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
    parse_config_str(&contents)
}

/// Parses configuration text into a validated [`JobSpec`].
///
/// # Errors
///
/// Returns [`ConfigError::Malformed`] listing every syntactically invalid
/// line, then [`ConfigError::Unrecognized`] listing every unknown key, then
/// [`ConfigError::Invalid`] when the assembled spec is incomplete.
pub fn parse_config_str(contents: &str) -> Result<JobSpec, ConfigError> {
    let mut builder = JobSpec::builder();
    let mut malformed = Vec::new();
    let mut unrecognized: Vec<String> = Vec::new();

    for (index, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let number = index + 1;

        let Some((key_part, value_part)) = line.split_once(KEY_VALUE_SEPARATOR) else {
            malformed.push(format!("line {number}: '{line}'"));
            continue;
        };
        let key = key_part.trim();
        let value = value_part.trim();

        let Some(config_key) = ConfigKey::from_name(key) else {
            if !unrecognized.iter().any(|seen| seen == key) {
                unrecognized.push(key.to_owned());
            }
            continue;
        };

        match config_key.apply(builder, value) {
            Some(applied) => builder = applied,
            None => {
                malformed.push(format!("line {number}: '{key}' has an empty value"));
                builder = JobSpec::builder();
            }
        }
    }

    if !malformed.is_empty() {
        return Err(ConfigError::Malformed { lines: malformed });
    }
    if !unrecognized.is_empty() {
        return Err(ConfigError::Unrecognized { keys: unrecognized });
    }

    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const COMPLETE: &str = "\
# Azure-related things
BATCH_ACCOUNT_NAME:=mybatch
BATCH_ACCOUNT_KEY:=YmF0Y2hrZXk=
BATCH_ACCOUNT_URL:=https://mybatch.canadacentral.batch.azure.com

STORAGE_ACCOUNT_NAME:=mystorage
STORAGE_ACCOUNT_KEY:=c3RvcmFnZWtleQ==
JOB_NAME:=NightlyRun
COMMAND:=analyze --input data.csv
INPUT:=./in/*.csv
OUTPUT:=out/*.json
VM_IMAGE:=/images/ubuntu-22.04
";

    #[rstest]
    fn complete_file_parses() {
        let spec = parse_config_str(COMPLETE).expect("config should parse");
        assert_eq!(spec.job_name, "NightlyRun");
        assert_eq!(spec.command, "analyze --input data.csv");
        assert_eq!(spec.inputs.len(), 1);
        assert_eq!(spec.outputs.len(), 1);
        assert_eq!(spec.vm_size, crate::spec::DEFAULT_VM_SIZE);
    }

    #[rstest]
    fn repeated_inputs_and_outputs_append_in_order() {
        let contents = format!("{COMPLETE}INPUT:=refs/*.fa remote/refs\nOUTPUT:=logs/*.txt\n");
        let spec = parse_config_str(&contents).expect("config should parse");
        assert_eq!(spec.inputs.len(), 2);
        assert_eq!(
            spec.inputs.last().and_then(|m| m.destination.as_deref()),
            Some("remote/refs")
        );
        assert_eq!(spec.outputs.len(), 2);
        assert_eq!(
            spec.outputs.last().map(|m| m.patterns.clone()),
            Some(vec![String::from("logs/*.txt")])
        );
    }

    #[rstest]
    fn every_unrecognized_key_is_reported() {
        let contents = format!("{COMPLETE}FIRST_BAD:=1\nSECOND_BAD:=2\nTHIRD_BAD:=3\n");
        let err = parse_config_str(&contents).expect_err("should reject unknown keys");
        assert_eq!(
            err,
            ConfigError::Unrecognized {
                keys: vec![
                    String::from("FIRST_BAD"),
                    String::from("SECOND_BAD"),
                    String::from("THIRD_BAD"),
                ]
            }
        );
    }

    #[rstest]
    fn malformed_lines_are_batched() {
        let contents = "BATCH_ACCOUNT_NAME:=ok\nnot a pair\nanother bad line\n";
        let err = parse_config_str(contents).expect_err("should reject malformed lines");
        let ConfigError::Malformed { lines } = err else {
            panic!("expected Malformed, got {err:?}");
        };
        assert_eq!(lines.len(), 2);
        assert!(lines.first().is_some_and(|l| l.contains("line 2")));
    }

    #[rstest]
    fn blank_input_value_is_malformed() {
        let contents = format!("{COMPLETE}INPUT:=\n");
        let err = parse_config_str(&contents).expect_err("should reject blank INPUT");
        assert!(matches!(err, ConfigError::Malformed { .. }));
    }

    #[rstest]
    fn missing_fields_are_batched_after_parsing() {
        let contents = "JOB_NAME:=run\nCOMMAND:=echo hi\n";
        let err = parse_config_str(contents).expect_err("should be incomplete");
        let ConfigError::Invalid(SpecError::Incomplete { missing }) = err else {
            panic!("expected Incomplete, got {err:?}");
        };
        assert_eq!(
            missing,
            vec![
                "BATCH_ACCOUNT_NAME",
                "BATCH_ACCOUNT_KEY",
                "BATCH_ACCOUNT_URL",
                "STORAGE_ACCOUNT_NAME",
                "STORAGE_ACCOUNT_KEY",
                "VM_IMAGE",
                "INPUT",
                "OUTPUT",
            ]
        );
    }

    #[rstest]
    fn comments_and_blank_lines_are_skipped() {
        let contents = format!("# leading comment\n\n{COMPLETE}");
        assert!(parse_config_str(&contents).is_ok());
    }

    #[rstest]
    fn values_may_contain_the_separator() {
        let contents = COMPLETE.replace(
            "COMMAND:=analyze --input data.csv",
            "COMMAND:=echo 'a:=b'",
        );
        let spec = parse_config_str(&contents).expect("config should parse");
        assert_eq!(spec.command, "echo 'a:=b'");
    }
}
