//! Checking the installed d2 release against the supported minimum.

use std::io;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use semver::Version;

use crate::config::VersionCheck;
use crate::render::{Execution, Executor};

/// Errors from checking the d2 binary before a build
#[derive(Debug, thiserror::Error)]
pub enum VersionError {
    /// `min-version` in `book.toml` is not a semantic version
    #[error("invalid min-version `{value}`: {source}")]
    InvalidMinimum {
        /// Configured value
        value: String,
        /// Parse failure
        source: semver::Error,
    },
    /// The executable does not exist
    #[error("failed to find d2 executable `{}`, is it installed?", .path.display())]
    NotFound {
        /// Configured executable
        path: PathBuf,
    },
    /// The executable exists but could not be run
    #[error("failed to run `{} --version`: {source}", .path.display())]
    Spawn {
        /// Configured executable
        path: PathBuf,
        /// Underlying I/O error
        source: io::Error,
    },
    /// `--version` exited unsuccessfully
    #[error("`{} --version` failed: {stderr}", .path.display())]
    Status {
        /// Configured executable
        path: PathBuf,
        /// What it printed to stderr
        stderr: String,
    },
    /// Older than `min-version`, with the check set to `error`
    #[error("d2 {found} is older than the minimum supported version {required}")]
    TooOld {
        /// Version reported by the binary
        found: Version,
        /// Configured minimum
        required: Version,
    },
}

/// Parses `d2 --version` output such as `v0.6.5` or `0.6.5-HEAD`
///
/// Anything after the first hyphen is build metadata and ignored.
pub fn parse_version(output: &str) -> Option<Version> {
    let text = output.trim();
    let text = text.strip_prefix('v').unwrap_or(text);
    let core = text.split('-').next()?;
    Version::parse(core).ok()
}

/// Runs `<executable> --version` once and compares it against `min_version`
///
/// Returns the detected version, or `None` when the check is disabled or the
/// output could not be parsed (which only warns).
pub fn check_version(
    executor: &dyn Executor,
    executable: &Path,
    min_version: &str,
    check: VersionCheck,
) -> Result<Option<Version>, VersionError> {
    if check == VersionCheck::Off {
        return Ok(None);
    }

    let required = Version::parse(min_version).map_err(|source| VersionError::InvalidMinimum {
        value: min_version.to_owned(),
        source,
    })?;

    let execution = Execution {
        program: executable,
        args: vec![String::from("--version")],
        env: Vec::new(),
        stdin: None,
        current_dir: None,
    };
    let output = executor.execute(&execution).map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            VersionError::NotFound {
                path: executable.to_path_buf(),
            }
        } else {
            VersionError::Spawn {
                path: executable.to_path_buf(),
                source,
            }
        }
    })?;
    if !output.success {
        return Err(VersionError::Status {
            path: executable.to_path_buf(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let Some(found) = parse_version(&text) else {
        warn!("Unable to parse d2 version from `{}`", text.trim());
        return Ok(None);
    };
    debug!("Found d2 {found}");

    if found < required {
        let err = VersionError::TooOld { found, required };
        if check == VersionCheck::Error {
            return Err(err);
        }
        warn!("{err}");
        return Ok(None);
    }

    Ok(Some(found))
}
