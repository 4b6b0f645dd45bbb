//! Configuration for the `fleetbench` binary.
//!
//! Configuration is loaded from the following sources, with later sources overriding earlier ones:
//!
//! 1. Defaults
//! 2. YAML configuration file (specified via `-c` or `--config` flag)
//! 3. Environment variables (prefixed with `FB__`)
//!
//! Environment variables use double underscores (`__`) to denote nested structures. For example:
//!
//! - `FB__HTTP_ADDR=0.0.0.0:8890` sets the address of the worker server
//! - `FB__WORKER__INDEX=2` sets the index of this worker
//! - `FB__LOGGING__FORMAT=json` switches to JSON logs
//!
//! The same file configures both sides of a run. The coordinator reads `workers`, `ack_timeout`,
//! `stages` and `report`; a worker process reads `http_addr` and `worker`:
//!
//! ```yaml
//! workers:
//!   - http://10.0.0.3:8890
//!   - http://10.0.0.4:8890
//! ack_timeout: 30m
//! report: results.json
//! stages:
//!   - name: load
//!     kind:
//!       type: stress_test
//!       num_requests: 10000
//! ```

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use figment::providers::{Env, Format, Serialized, Yaml};
use fleetbench_types::{StageDefinition, WorkerIndex};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::coordinator::{DEFAULT_ACK_TIMEOUT, DEFAULT_SLACK};

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "FB__";

/// Top-level configuration.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Address the worker server listens on, and the address probed by `healthcheck`.
    ///
    /// # Default
    ///
    /// `0.0.0.0:8890`
    pub http_addr: SocketAddr,

    /// Base URLs of remote workers. Worker `i` is the `i`-th entry.
    ///
    /// When empty, the coordinator runs `local_workers` in-process workers against in-memory
    /// stores instead.
    pub workers: Vec<String>,

    /// Number of in-process workers used when `workers` is empty.
    ///
    /// # Default
    ///
    /// `1`
    pub local_workers: usize,

    /// How long the coordinator waits for acknowledgements of stages without their own timeout.
    ///
    /// # Default
    ///
    /// `1h`
    #[serde(with = "humantime_serde")]
    pub ack_timeout: Duration,

    /// Added to a stage's own timeout before the coordinator stops waiting for it.
    ///
    /// # Default
    ///
    /// `15s`
    #[serde(with = "humantime_serde")]
    pub ack_slack: Duration,

    /// The plan executed by the `run` command.
    pub stages: Vec<StageDefinition>,

    /// File the run summary is written to as JSON.
    pub report: Option<PathBuf>,

    /// Settings of a worker process.
    pub worker: WorkerSettings,

    /// Runtime configuration.
    pub runtime: Runtime,

    /// Logging configuration.
    pub logging: Logging,

    /// Sentry error tracking configuration.
    pub sentry: Sentry,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8890)),
            workers: Vec::new(),
            local_workers: 1,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            ack_slack: DEFAULT_SLACK,
            stages: Vec::new(),
            report: None,
            worker: WorkerSettings::default(),
            runtime: Runtime::default(),
            logging: Logging::default(),
            sentry: Sentry::default(),
        }
    }
}

impl Config {
    /// Loads configuration from defaults, the optional YAML file at `path`, and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if a value has the wrong type.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = figment::Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        Ok(config)
    }
}

/// Settings of a worker process, used by the `worker` command.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Index of this worker within the fleet.
    ///
    /// # Environment Variable
    ///
    /// `FB__WORKER__INDEX`
    pub index: WorkerIndex,

    /// Time stressors get to stop after a stage deadline before they are aborted.
    ///
    /// # Default
    ///
    /// `5s`
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,

    /// Number of entries the in-memory store is filled with on startup.
    ///
    /// # Default
    ///
    /// `0`
    pub entries: u64,

    /// Size of the entries the in-memory store is filled with, in bytes.
    ///
    /// # Default
    ///
    /// `1000`
    pub entry_size: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            index: 0,
            grace_period: fleetbench_worker::stressor::DEFAULT_GRACE_PERIOD,
            entries: 0,
            entry_size: 1000,
        }
    }
}

/// Runtime configuration for the Tokio async runtime.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Runtime {
    /// Number of worker threads of the runtime.
    ///
    /// # Default
    ///
    /// The number of available CPU cores.
    ///
    /// # Environment Variable
    ///
    /// `FB__RUNTIME__WORKER_THREADS`
    pub worker_threads: usize,
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            worker_threads: std::thread::available_parallelism().map_or(1, |n| n.get()),
        }
    }
}

/// Sentry error tracking configuration.
///
/// Sentry is disabled unless a DSN is set.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Sentry {
    /// Sentry DSN (Data Source Name).
    ///
    /// # Environment Variable
    ///
    /// `FB__SENTRY__DSN`
    pub dsn: Option<String>,

    /// Environment name attached to all events, such as `staging`.
    pub environment: Option<Cow<'static, str>>,

    /// Server name attached to all events.
    pub server_name: Option<Cow<'static, str>>,

    /// Error event sampling rate.
    ///
    /// # Default
    ///
    /// `1.0`
    pub sample_rate: f32,

    /// Performance trace sampling rate.
    ///
    /// # Default
    ///
    /// `0.01`
    pub traces_sample_rate: f32,

    /// Enables debug output of the Sentry SDK.
    pub debug: bool,

    /// Additional tags attached to all events.
    ///
    /// Set individually through `FB__SENTRY__TAGS__FOO=foo`.
    pub tags: BTreeMap<String, String>,
}

impl Sentry {
    /// Returns whether Sentry integration is enabled.
    pub fn is_enabled(&self) -> bool {
        self.dsn.is_some()
    }
}

impl Default for Sentry {
    fn default() -> Self {
        Self {
            dsn: None,
            environment: None,
            server_name: None,
            sample_rate: 1.0,
            traces_sample_rate: 0.01,
            debug: false,
            tags: BTreeMap::new(),
        }
    }
}

/// Log output format.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Chooses [`LogFormat::Pretty`] for a TTY, otherwise [`LogFormat::Simplified`].
    Auto,

    /// Pretty printing with colors.
    ///
    /// ```text
    ///  INFO  fleetbench_coordinator::coordinator > stage passed
    /// ```
    Pretty,

    /// Simplified plain text output.
    ///
    /// ```text
    /// 2024-05-02T12:10:32Z [fleetbench_coordinator::coordinator] INFO: stage passed
    /// ```
    Simplified,

    /// JSON lines.
    Json,
}

/// The logging format parse error.
#[derive(Clone, Debug)]
pub struct FormatParseError(String);

impl fmt::Display for FormatParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r#"error parsing "{}" as format: expected one of "auto", "pretty", "simplified", "json""#,
            self.0
        )
    }
}

impl std::error::Error for FormatParseError {}

impl std::str::FromStr for LogFormat {
    type Err = FormatParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let result = match s {
            "" => LogFormat::Auto,
            s if s.eq_ignore_ascii_case("auto") => LogFormat::Auto,
            s if s.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            s if s.eq_ignore_ascii_case("simplified") => LogFormat::Simplified,
            s if s.eq_ignore_ascii_case("json") => LogFormat::Json,
            s => return Err(FormatParseError(s.into())),
        };

        Ok(result)
    }
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
    /// Minimum level of emitted messages: TRACE, DEBUG, INFO, WARN, ERROR or OFF.
    ///
    /// `RUST_LOG` provides per-module control on top of this.
    ///
    /// # Default
    ///
    /// `INFO`
    #[serde(with = "display_fromstr")]
    pub level: LevelFilter,

    /// Log output format.
    ///
    /// # Default
    ///
    /// `auto`
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
