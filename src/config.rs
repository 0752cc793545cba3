//! Configuration.
//!
//! Settings come from a JSON file (by default `$HOME/.config/twikwak17/cfg.json`) and from explicit overrides,
//! usually command line options. Overrides win. A missing configuration file is an empty configuration.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use bytesize::ByteSize;
use log;
use serde::{Deserialize, Serialize};

use crate::buffer::{SpillPolicy, DEFAULT_CHECK_EVERY, DEFAULT_MIN_AVAILABLE_BYTES};
use crate::context::DEFAULT_MONITOR_FREQ;
use crate::lines::DEFAULT_BATCH_SIZE;
use crate::sort::{PartitionFormat, SorterKind};

/// Configuration file location relative to the home directory.
pub const DEFAULT_CONFIG_LOCATION: &str = ".config/twikwak17/cfg.json";
/// External sort program used when none is configured.
pub const DEFAULT_SORT_PROGRAM: &str = "sort";

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    /// A required value is neither configured nor given explicitly.
    Missing { key: &'static str, config_path: PathBuf },
    /// A value is present but unusable.
    Invalid { key: &'static str, value: String, reason: String },
    /// The configuration file could not be read.
    IO(io::Error),
    /// The configuration file is not valid JSON.
    Parse { path: PathBuf, source: serde_json::Error },
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            ConfigError::Missing { .. } => None,
            ConfigError::Invalid { .. } => None,
            ConfigError::IO(err) => Some(err),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            ConfigError::Missing { key, config_path } => write!(
                f,
                "Missing configuration value for {}. Either provide it through the CLI call or configure it at {} .",
                key,
                config_path.display()
            ),
            ConfigError::Invalid { key, value, reason } => {
                write!(f, "invalid value {:?} for {}: {}", value, key, reason)
            }
            ConfigError::IO(err) => write!(f, "configuration file not readable: {}", err),
            ConfigError::Parse { path, source } => {
                write!(f, "configuration file {} not parsable: {}", path.display(), source)
            }
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(err: io::Error) -> Self {
        ConfigError::IO(err)
    }
}

/// Raw configuration as found in the configuration file. Every value is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub twitter7_dpath: Option<PathBuf>,
    pub kwak10_dpath: Option<PathBuf>,
    pub output_dpath: Option<PathBuf>,
    pub quiet: Option<bool>,
    /// Available memory floor, as a human readable size (e.g. `500MB`).
    pub min_available_memory: Option<String>,
    /// Lines between two progress reports.
    pub monitor_line_freq: Option<u64>,
    /// Inserts between two available memory checks.
    pub memory_check_freq: Option<usize>,
    /// Distinct keys an accumulator may hold before it spills.
    pub spill_record_limit: Option<usize>,
    /// Records buffered by output files before being written.
    pub write_batch_size: Option<usize>,
    pub sorter: Option<SorterKind>,
    pub threads: Option<usize>,
    pub sort_program: Option<String>,
    pub classifier_command: Option<String>,
    pub partition_format: Option<PartitionFormat>,
    /// Directory for temporary sort data.
    pub tmp_dpath: Option<PathBuf>,
}

impl Config {
    /// Default configuration file path, [`None`] when the home directory is unknown.
    pub fn default_path() -> Option<PathBuf> {
        std::env::var_os("HOME").map(|home| PathBuf::from(home).join(DEFAULT_CONFIG_LOCATION))
    }

    /// Loads a configuration file. A missing file yields an empty configuration.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                log::debug!("configuration file {} not found, using defaults", path.display());
                return Ok(Config::default());
            }
            Err(err) => return Err(ConfigError::IO(err)),
        };

        let config = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        log::debug!("configuration loaded from {}", path.display());

        return Ok(config);
    }

    /// Returns this configuration with every value present in `overrides` replaced.
    pub fn with_overrides(self, overrides: Config) -> Config {
        Config {
            twitter7_dpath: overrides.twitter7_dpath.or(self.twitter7_dpath),
            kwak10_dpath: overrides.kwak10_dpath.or(self.kwak10_dpath),
            output_dpath: overrides.output_dpath.or(self.output_dpath),
            quiet: overrides.quiet.or(self.quiet),
            min_available_memory: overrides.min_available_memory.or(self.min_available_memory),
            monitor_line_freq: overrides.monitor_line_freq.or(self.monitor_line_freq),
            memory_check_freq: overrides.memory_check_freq.or(self.memory_check_freq),
            spill_record_limit: overrides.spill_record_limit.or(self.spill_record_limit),
            write_batch_size: overrides.write_batch_size.or(self.write_batch_size),
            sorter: overrides.sorter.or(self.sorter),
            threads: overrides.threads.or(self.threads),
            sort_program: overrides.sort_program.or(self.sort_program),
            classifier_command: overrides.classifier_command.or(self.classifier_command),
            partition_format: overrides.partition_format.or(self.partition_format),
            tmp_dpath: overrides.tmp_dpath.or(self.tmp_dpath),
        }
    }

    /// Validates the configuration and fills in defaults.
    ///
    /// # Arguments
    /// * `config_path` - Configuration file location named in error messages
    pub fn resolve(self, config_path: &Path) -> Result<Settings, ConfigError> {
        let output_dpath = self.output_dpath.ok_or_else(|| ConfigError::Missing {
            key: "output_dpath",
            config_path: config_path.to_path_buf(),
        })?;

        let min_available_bytes = match &self.min_available_memory {
            Some(value) => value
                .parse::<ByteSize>()
                .map_err(|reason| ConfigError::Invalid {
                    key: "min_available_memory",
                    value: value.clone(),
                    reason,
                })?
                .as_u64(),
            None => DEFAULT_MIN_AVAILABLE_BYTES,
        };

        let monitor_line_freq = positive("monitor_line_freq", self.monitor_line_freq, DEFAULT_MONITOR_FREQ)?;
        let memory_check_freq = positive("memory_check_freq", self.memory_check_freq, DEFAULT_CHECK_EVERY)?;
        let write_batch_size = positive("write_batch_size", self.write_batch_size, DEFAULT_BATCH_SIZE)?;
        let threads = match self.threads {
            Some(threads) => Some(positive("threads", Some(threads), threads)?),
            None => None,
        };

        return Ok(Settings {
            twitter7_dpath: self.twitter7_dpath,
            kwak10_dpath: self.kwak10_dpath,
            output_dpath,
            quiet: self.quiet.unwrap_or(false),
            min_available_bytes,
            monitor_line_freq,
            memory_check_freq,
            spill_record_limit: self.spill_record_limit,
            write_batch_size,
            sorter: self.sorter.unwrap_or_default(),
            threads,
            sort_program: self.sort_program.unwrap_or_else(|| DEFAULT_SORT_PROGRAM.to_string()),
            classifier_command: self.classifier_command,
            partition_format: self.partition_format.unwrap_or_default(),
            tmp_dpath: self.tmp_dpath,
            config_path: config_path.to_path_buf(),
        });
    }
}

fn positive<T>(key: &'static str, value: Option<T>, default: T) -> Result<T, ConfigError>
where
    T: Copy + PartialEq + Default + Display,
{
    match value {
        Some(value) if value == T::default() => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        }),
        Some(value) => Ok(value),
        None => Ok(default),
    }
}

/// Validated settings of a pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub twitter7_dpath: Option<PathBuf>,
    pub kwak10_dpath: Option<PathBuf>,
    pub output_dpath: PathBuf,
    pub quiet: bool,
    pub min_available_bytes: u64,
    pub monitor_line_freq: u64,
    pub memory_check_freq: usize,
    pub spill_record_limit: Option<usize>,
    pub write_batch_size: usize,
    pub sorter: SorterKind,
    pub threads: Option<usize>,
    pub sort_program: String,
    pub classifier_command: Option<String>,
    pub partition_format: PartitionFormat,
    pub tmp_dpath: Option<PathBuf>,
    /// Configuration file the settings were loaded from.
    pub config_path: PathBuf,
}

impl Settings {
    fn missing(&self, key: &'static str) -> ConfigError {
        ConfigError::Missing {
            key,
            config_path: self.config_path.clone(),
        }
    }

    pub fn twitter7_dpath(&self) -> Result<&Path, ConfigError> {
        self.twitter7_dpath.as_deref().ok_or_else(|| self.missing("twitter7_dpath"))
    }

    pub fn kwak10_dpath(&self) -> Result<&Path, ConfigError> {
        self.kwak10_dpath.as_deref().ok_or_else(|| self.missing("kwak10_dpath"))
    }

    pub fn classifier_command(&self) -> Result<&str, ConfigError> {
        self.classifier_command.as_deref().ok_or_else(|| self.missing("classifier_command"))
    }

    /// Spill triggers of every accumulator.
    pub fn spill_policy(&self) -> SpillPolicy {
        let policy = SpillPolicy::new(self.min_available_bytes).with_check_every(self.memory_check_freq);
        match self.spill_record_limit {
            Some(limit) => policy.with_record_limit(limit),
            None => policy,
        }
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::path::{Path, PathBuf};

    use rstest::*;

    use super::{Config, ConfigError};
    use crate::sort::{PartitionFormat, SorterKind};

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[rstest]
    fn test_missing_file_is_empty_config(tmp_dir: tempfile::TempDir) {
        let config = Config::load(&tmp_dir.path().join("cfg.json")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[rstest]
    fn test_load_and_override(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("cfg.json");
        fs::write(
            &path,
            r#"{
                "twitter7_dpath": "/data/twitter7",
                "output_dpath": "/data/out",
                "min_available_memory": "1GB",
                "sorter": "external",
                "partition_format": "msgpack",
                "spill_record_limit": 1000
            }"#,
        )
        .unwrap();

        let overrides = Config {
            output_dpath: Some(PathBuf::from("/tmp/out")),
            quiet: Some(true),
            ..Config::default()
        };
        let settings = Config::load(&path).unwrap().with_overrides(overrides).resolve(&path).unwrap();

        assert_eq!(settings.twitter7_dpath().unwrap(), Path::new("/data/twitter7"));
        assert_eq!(settings.output_dpath, PathBuf::from("/tmp/out"));
        assert!(settings.quiet);
        assert_eq!(settings.min_available_bytes, 1_000_000_000);
        assert_eq!(settings.sorter, SorterKind::External);
        assert_eq!(settings.partition_format, PartitionFormat::MsgPack);
        assert_eq!(settings.write_batch_size, 100_000);
        assert_eq!(settings.spill_policy().record_limit, Some(1000));
    }

    #[rstest]
    fn test_missing_values_name_the_key(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("cfg.json");

        let err = Config::default().resolve(&path).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!(
                "Missing configuration value for output_dpath. Either provide it through the CLI call or configure it at {} .",
                path.display()
            )
        );

        let settings = Config {
            output_dpath: Some(tmp_dir.path().to_path_buf()),
            ..Config::default()
        }
        .resolve(&path)
        .unwrap();
        assert!(matches!(
            settings.kwak10_dpath(),
            Err(ConfigError::Missing { key: "kwak10_dpath", .. })
        ));
        assert!(matches!(
            settings.classifier_command(),
            Err(ConfigError::Missing { key: "classifier_command", .. })
        ));
    }

    #[rstest]
    #[case(r#"{"output_dpath": "/o", "min_available_memory": "lots"}"#, "min_available_memory")]
    #[case(r#"{"output_dpath": "/o", "write_batch_size": 0}"#, "write_batch_size")]
    #[case(r#"{"output_dpath": "/o", "threads": 0}"#, "threads")]
    fn test_invalid_values(tmp_dir: tempfile::TempDir, #[case] content: &str, #[case] expected_key: &str) {
        let path = tmp_dir.path().join("cfg.json");
        fs::write(&path, content).unwrap();

        match Config::load(&path).unwrap().resolve(&path) {
            Err(ConfigError::Invalid { key, .. }) => assert_eq!(key, expected_key),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[rstest]
    fn test_unparsable_file(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("cfg.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse { .. })));
    }
}
