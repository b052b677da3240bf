//! Configuration for the perftester binary.
//!
//! Configuration is loaded from the following sources, with the following precedence (highest to
//! lowest):
//!
//! 1. Environment variables (prefixed with `PT__`)
//! 2. YAML configuration file (specified via `-c` or `--config` flag)
//! 3. Defaults
//!
//! Environment variables use double underscores (`__`) to denote nested structures, for example
//! `PT__TIMEOUT=30s` or `PT__ENDPOINTS__MINIO__BUCKET=bench`.
//!
//! # Example
//!
//! ```yaml
//! timeout: 5m
//!
//! file_tests:
//!   small:
//!     size: 1MiB
//!     parallelism: 10
//!   large:
//!     size: 256MiB
//!     timeout: 20m
//!
//! endpoints:
//!   local:
//!     type: filesystem
//!     path: /tmp/perftester
//!   minio:
//!     type: s3compatible
//!     endpoint: http://localhost:9000
//!     bucket: perftester
//!     access_key: minioadmin
//!     secret_key: minioadmin
//!     path_style: true
//!     prefix: runs/today
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use figment::providers::{Env, Format, Serialized, Yaml};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::client::{BoxedClient, InMemoryClient, LocalFsClient, S3Client, S3ClientConfig};
use crate::datamodel::{FileTestConfig, Id};
use crate::endpoint::Endpoint;

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "PT__";

/// Storage backend of an endpoint.
///
/// The `type` field in YAML or `__TYPE` in environment variables determines which variant is used.
#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Storage {
    /// Keeps objects in process memory (type `"memory"`). Useful for dry runs.
    Memory,

    /// Stores objects as files below `path` (type `"filesystem"`).
    FileSystem {
        /// Root directory. Created on first upload.
        path: PathBuf,
    },

    /// Amazon S3 or an S3-compatible service (type `"s3compatible"`).
    ///
    /// Without `access_key` and `secret_key`, credentials are taken from the default AWS chain,
    /// e.g. `AWS_ACCESS_KEY_ID` and `AWS_SECRET_ACCESS_KEY`.
    S3Compatible {
        /// Custom endpoint URL, e.g. `http://localhost:9000` for MinIO.
        #[serde(default)]
        endpoint: Option<String>,
        /// The bucket to benchmark. It must exist.
        bucket: String,
        /// The bucket region.
        #[serde(default = "default_region")]
        region: String,
        /// Static access key.
        #[serde(default)]
        access_key: Option<String>,
        /// Static secret key, redacted from logs.
        #[serde(default, skip_serializing)]
        secret_key: Option<SecretString>,
        /// Use path-style bucket addressing, required by most self-hosted services.
        #[serde(default)]
        path_style: bool,
    },
}

fn default_region() -> String {
    "us-east-1".to_owned()
}

/// A configured endpoint.
#[derive(Debug, Deserialize, Serialize)]
pub struct EndpointConfig {
    /// The storage backend.
    #[serde(flatten)]
    pub storage: Storage,
    /// Directory all benchmark objects are placed in.
    #[serde(default)]
    pub prefix: Option<String>,
}

impl EndpointConfig {
    /// Constructs the client and binds it to an [`Endpoint`] with the given identifier.
    pub async fn connect(&self, id: &Id) -> Result<Endpoint> {
        let client: BoxedClient = match &self.storage {
            Storage::Memory => Box::new(InMemoryClient::new()),
            Storage::FileSystem { path } => Box::new(LocalFsClient::new(path)),
            Storage::S3Compatible {
                endpoint,
                bucket,
                region,
                access_key,
                secret_key,
                path_style,
            } => {
                let config = S3ClientConfig {
                    endpoint: endpoint.clone(),
                    bucket: bucket.clone(),
                    region: region.clone(),
                    access_key: access_key.clone(),
                    secret_key: secret_key.clone(),
                    path_style: *path_style,
                };
                let client = S3Client::new(config)
                    .await
                    .with_context(|| format!("failed to create client for endpoint {id}"))?;
                Box::new(client)
            }
        };

        let mut endpoint = Endpoint::new(id.clone(), client);
        if let Some(prefix) = &self.prefix {
            endpoint = endpoint.with_prefix(prefix.as_str());
        }
        Ok(endpoint)
    }
}

/// Log output format.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Chooses [`LogFormat::Pretty`] for TTY, otherwise [`LogFormat::Simplified`].
    #[default]
    Auto,

    /// Pretty printing with colors.
    Pretty,

    /// Simplified plain text output.
    Simplified,

    /// Dump out JSON lines.
    Json,
}

mod display_fromstr {
    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
        T: std::fmt::Display,
    {
        serializer.collect_str(&value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
        T: std::str::FromStr,
        <T as std::str::FromStr>::Err: std::fmt::Display,
    {
        use serde::Deserialize;
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Logging configuration. Logs are always written to stderr.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Logging {
    /// Minimum log level to output.
    ///
    /// The `RUST_LOG` environment variable takes precedence if set.
    ///
    /// # Environment Variable
    ///
    /// `PT__LOGGING__LEVEL`
    #[serde(with = "display_fromstr")]
    pub level: LevelFilter,

    /// Log output format.
    ///
    /// # Environment Variable
    ///
    /// `PT__LOGGING__FORMAT`
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Runtime configuration for the perftester.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Timeout of every operation, unless a file test overrides it.
    ///
    /// # Default
    ///
    /// `10m`
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Number of file test and endpoint pairs benchmarked at the same time.
    ///
    /// # Default
    ///
    /// `1`, so that pairs do not compete for bandwidth.
    pub concurrency: usize,

    /// Workloads to run, keyed by identifier.
    pub file_tests: BTreeMap<Id, FileTestConfig>,

    /// Storage targets to benchmark, keyed by identifier.
    pub endpoints: BTreeMap<Id, EndpointConfig>,

    /// Logging configuration.
    pub logging: Logging,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10 * 60),
            concurrency: 1,
            file_tests: BTreeMap::new(),
            endpoints: BTreeMap::new(),
            logging: Logging::default(),
        }
    }
}

impl Config {
    /// Loads and validates the configuration.
    ///
    /// Configuration is merged in the following order (later sources override earlier ones):
    /// 1. Default values
    /// 2. YAML configuration file (if `path` is given)
    /// 3. Environment variables (prefixed with `PT__`)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = figment::Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config: Config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Checks that there is something to benchmark.
    pub fn validate(&self) -> Result<()> {
        if self.file_tests.is_empty() {
            bail!("no file tests configured");
        }
        if self.endpoints.is_empty() {
            bail!("no endpoints configured");
        }
        if let Some((id, _)) = self.file_tests.iter().find(|(_, test)| test.size.as_u64() == 0) {
            bail!("file test {id} has no size");
        }
        Ok(())
    }

    /// Returns the payload size of every file test, as needed by the report.
    pub fn file_test_sizes(&self) -> BTreeMap<Id, u64> {
        self.file_tests
            .iter()
            .map(|(id, test)| (id.clone(), test.size.as_u64()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use secrecy::ExposeSecret;

    use super::*;

    const YAML: &[u8] = br#"
        timeout: 30s
        file_tests:
            small:
                size: 1MiB
                parallelism: 4
                seed: 17
            large:
                size: 10MB
                timeout: 2m
        endpoints:
            local:
                type: filesystem
                path: /tmp/perftester
                prefix: bench
            minio:
                type: s3compatible
                endpoint: http://localhost:9000
                bucket: perftester
                access_key: minioadmin
                secret_key: hunter2
                path_style: true
        "#;

    #[test]
    fn configurable_via_yaml() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile.write_all(YAML).unwrap();

        figment::Jail::expect_with(|_jail| {
            let config = Config::load(Some(tempfile.path())).unwrap();

            assert_eq!(config.timeout, Duration::from_secs(30));
            assert_eq!(config.concurrency, 1);

            let small = &config.file_tests[&Id::from("small")];
            assert_eq!(small.size.as_u64(), 1024 * 1024);
            assert_eq!(small.parallelism, 4);
            assert_eq!(small.seed, Some(17));
            assert_eq!(small.timeout, None);

            let large = &config.file_tests[&Id::from("large")];
            assert_eq!(large.size.as_u64(), 10_000_000);
            assert_eq!(large.timeout, Some(Duration::from_secs(120)));

            let local = &config.endpoints[&Id::from("local")];
            assert!(matches!(&local.storage, Storage::FileSystem { path } if path == Path::new("/tmp/perftester")));
            assert_eq!(local.prefix.as_deref(), Some("bench"));

            let Storage::S3Compatible {
                endpoint,
                bucket,
                region,
                secret_key,
                path_style,
                ..
            } = &config.endpoints[&Id::from("minio")].storage
            else {
                panic!("expected s3 storage");
            };
            assert_eq!(endpoint.as_deref(), Some("http://localhost:9000"));
            assert_eq!(bucket, "perftester");
            assert_eq!(region, "us-east-1");
            assert!(path_style);
            assert_eq!(secret_key.as_ref().unwrap().expose_secret(), "hunter2");
            assert!(!format!("{config:?}").contains("hunter2"));

            assert_eq!(
                config.file_test_sizes(),
                BTreeMap::from([(Id::from("large"), 10_000_000), (Id::from("small"), 1_048_576)])
            );

            Ok(())
        });
    }

    #[test]
    fn env_overrides_yaml() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile.write_all(YAML).unwrap();

        figment::Jail::expect_with(|jail| {
            jail.set_env("PT__TIMEOUT", "1h");
            jail.set_env("PT__CONCURRENCY", "3");
            jail.set_env("PT__LOGGING__LEVEL", "debug");
            jail.set_env("PT__LOGGING__FORMAT", "json");

            let config = Config::load(Some(tempfile.path())).unwrap();
            assert_eq!(config.timeout, Duration::from_secs(3600));
            assert_eq!(config.concurrency, 3);
            assert_eq!(config.logging.level, LevelFilter::DEBUG);
            assert_eq!(config.logging.format, LogFormat::Json);

            Ok(())
        });
    }

    #[test]
    fn rejects_empty_config() {
        figment::Jail::expect_with(|_jail| {
            let err = Config::load(None).unwrap_err();
            assert_eq!(err.to_string(), "no file tests configured");
            Ok(())
        });
    }

    #[test]
    fn rejects_zero_size() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            file_tests:
                empty:
                    size: 0
            endpoints:
                mem:
                    type: memory
            "#,
            )
            .unwrap();

        figment::Jail::expect_with(|_jail| {
            let err = Config::load(Some(tempfile.path())).unwrap_err();
            assert_eq!(err.to_string(), "file test empty has no size");
            Ok(())
        });
    }

    #[tokio::test]
    async fn connects_memory_endpoint_with_prefix() {
        let config = EndpointConfig {
            storage: Storage::Memory,
            prefix: Some("runs/".into()),
        };
        let endpoint = config.connect(&Id::from("mem")).await.unwrap();

        assert_eq!(endpoint.id, Id::from("mem"));
        assert_eq!(endpoint.object_path(&Id::from("ft"), 1), "runs/ft1");
        assert_eq!(endpoint.client.name(), "in-memory");
    }
}
