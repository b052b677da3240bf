//! Identifiers, workload definitions and timing records shared by the runner and the reporter.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};

/// An opaque identifier for file tests and endpoints.
///
/// File test identifiers and endpoint identifiers live in independent namespaces. Identifiers are
/// ordered by their string contents, which is the order used when rendering reports.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(String);

impl Id {
    /// Creates a new identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if the identifier is the empty string.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Id {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for Id {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A timed action class performed against an endpoint.
///
/// The declaration order is the order in which operations run and the order of rows in a report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Operation {
    /// Writes the synthetic payloads.
    Upload,
    /// Reads the payloads back and verifies their digests.
    Download,
    /// Removes the payloads again.
    Delete,
}

impl Operation {
    /// All operations in run order.
    pub const ALL: [Operation; 3] = [Operation::Upload, Operation::Download, Operation::Delete];

    /// Returns the display name of the operation.
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Upload => "Upload",
            Operation::Download => "Download",
            Operation::Delete => "Delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown [`Operation`] name.
#[derive(Debug, thiserror::Error)]
#[error("unknown operation `{0}`")]
pub struct ParseOperationError(String);

impl FromStr for Operation {
    type Err = ParseOperationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .into_iter()
            .find(|op| op.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseOperationError(s.to_owned()))
    }
}

/// A file test as it appears in the configuration, before defaults are applied.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct FileTestConfig {
    /// Size of every sub-object.
    pub size: ByteSize,
    /// Number of sub-objects transferred concurrently. `0` means `1`.
    #[serde(default)]
    pub parallelism: usize,
    /// Seed for the payload contents. Unset or `0` derives a seed from the current time.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Timeout for each operation. Unset or zero falls back to the global timeout.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

impl FileTestConfig {
    /// Applies all defaults, producing an immutable [`FileTest`].
    ///
    /// `time_seed` is used when no seed was configured. It must be non-zero.
    pub fn resolve(&self, default_timeout: Duration, time_seed: u64) -> FileTest {
        let seed = match self.seed {
            Some(seed) if seed > 0 => seed,
            _ => time_seed.max(1),
        };
        let timeout = match self.timeout {
            Some(timeout) if !timeout.is_zero() => timeout,
            _ => default_timeout,
        };

        FileTest {
            size: self.size.as_u64(),
            parallelism: self.parallelism.max(1),
            seed,
            timeout,
        }
    }
}

/// A fully resolved workload definition.
///
/// Upload and download regenerate identical payloads from the same `FileTest`, so a single resolved
/// value must be shared by all operations of a test.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileTest {
    /// Size of every sub-object in bytes.
    pub size: u64,
    /// Number of concurrent workers, at least `1`.
    pub parallelism: usize,
    /// Base seed. Worker `i` uses `seed + i`.
    pub seed: u64,
    /// Upper bound for each operation.
    pub timeout: Duration,
}

/// Derives a non-zero seed from the wall clock.
pub fn time_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or_default()
        .max(1)
}

/// Outcome and timing of one operation against one endpoint.
#[derive(Clone, Debug, PartialEq)]
pub struct OperationResult {
    /// Wall clock time right before the first worker started.
    pub start_time: SystemTime,
    /// Time until the last worker completed, including cancellation.
    pub duration: Duration,
    /// The failure message, if the operation failed.
    pub error: Option<String>,
}

impl OperationResult {
    /// Creates a successful result.
    pub fn succeeded(start_time: SystemTime, duration: Duration) -> Self {
        Self {
            start_time,
            duration,
            error: None,
        }
    }

    /// Creates a failed result. An empty message is recorded as `"unknown error"`.
    pub fn failed(start_time: SystemTime, duration: Duration, error: impl Into<String>) -> Self {
        let mut error = error.into();
        if error.is_empty() {
            error = "unknown error".to_owned();
        }

        Self {
            start_time,
            duration,
            error: Some(error),
        }
    }

    /// Creates a result from the outcome of an operation.
    pub fn from_outcome<E: fmt::Display>(
        start_time: SystemTime,
        duration: Duration,
        outcome: Result<(), E>,
    ) -> Self {
        match outcome {
            Ok(()) => Self::succeeded(start_time, duration),
            Err(err) => Self::failed(start_time, duration, err.to_string()),
        }
    }

    /// Returns `true` if the operation completed without error.
    pub fn success(&self) -> bool {
        self.error.is_none()
    }
}
