//! Stage definitions and their per-kind settings.
//!
//! A stage definition is deserialized from the benchmark plan, validated once by the coordinator,
//! and then sent unchanged to every worker. All settings have defaults, so a plan only needs to
//! name the values it wants to override:
//!
//! ```yaml
//! name: iterate-all
//! workers: [0, 1]
//! kind:
//!   type: iterate
//!   test:
//!     threads: 4
//!   fail_on_uneven_elements: false
//! ```

use std::collections::BTreeSet;
use std::time::Duration;

use fleetbench_stats::StatsKind;
use serde::{Deserialize, Serialize};

use crate::{ConfigError, ConfigResult, WorkerIndex};

/// An immutable, named bundle of configuration for one unit of benchmark work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Name of the stage, used in logs and error messages.
    pub name: String,

    /// Workers that execute this stage. All workers when `None`.
    ///
    /// Workers outside of this set acknowledge the stage immediately without doing any work.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<BTreeSet<WorkerIndex>>,

    /// Deadline for the stage body on each worker.
    ///
    /// When a stressor pool exceeds this deadline, it is cancelled and the stage is marked as
    /// timed out. The coordinator also derives its own acknowledgement deadline from it.
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,

    /// What the stage does.
    pub kind: StageKind,
}

impl StageDefinition {
    /// Creates a stage that runs on all workers without a deadline.
    pub fn new(name: impl Into<String>, kind: StageKind) -> Self {
        Self {
            name: name.into(),
            workers: None,
            timeout: None,
            kind,
        }
    }

    /// Returns `true` if the given worker is expected to execute this stage.
    pub fn targets(&self, worker: WorkerIndex) -> bool {
        self.workers
            .as_ref()
            .is_none_or(|workers| workers.contains(&worker))
    }

    /// Checks that all parameters are present and within their valid ranges.
    pub fn validate(&self) -> ConfigResult<()> {
        let v = Validator { stage: &self.name };

        if self.name.trim().is_empty() {
            return Err(ConfigError::Missing {
                stage: self.name.clone(),
                parameter: "name",
            });
        }
        if let Some(workers) = &self.workers {
            v.check(!workers.is_empty(), "workers", "must not be empty")?;
        }
        if let Some(timeout) = self.timeout {
            v.check(!timeout.is_zero(), "timeout", "must be greater than zero")?;
        }

        match &self.kind {
            StageKind::Iterate(settings) => settings.validate(&v),
            StageKind::StressTest(settings) => settings.validate(&v),
            StageKind::WaitForTopologyEvent(settings) => settings.validate(&v),
            StageKind::WaitForTopologySettle(settings) => settings.validate(&v),
            StageKind::CheckTopology(settings) => settings.validate(&v),
        }
    }
}

struct Validator<'a> {
    stage: &'a str,
}

impl Validator<'_> {
    fn check(&self, condition: bool, parameter: &'static str, reason: &str) -> ConfigResult<()> {
        if condition {
            Ok(())
        } else {
            Err(ConfigError::Invalid {
                stage: self.stage.to_owned(),
                parameter,
                reason: reason.to_owned(),
            })
        }
    }

    fn require(&self, value: &str, parameter: &'static str) -> ConfigResult<()> {
        if value.trim().is_empty() {
            return Err(ConfigError::Missing {
                stage: self.stage.to_owned(),
                parameter,
            });
        }
        Ok(())
    }
}

/// The kind of work a stage performs, together with its settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageKind {
    /// Iterates over a container of the store with a pool of stressors.
    Iterate(IterateSettings),
    /// Runs random key operations against the store with a pool of stressors.
    StressTest(StressTestSettings),
    /// Waits until the store reports a matching topology event.
    WaitForTopologyEvent(WaitForEventSettings),
    /// Waits until the store's topology has been quiet for a while.
    WaitForTopologySettle(SettleSettings),
    /// Checks whether the topology changed recently.
    CheckTopology(CheckTopologySettings),
}

impl StageKind {
    /// Returns the test settings for stages that record into the report.
    pub fn test(&self) -> Option<&TestSettings> {
        match self {
            StageKind::Iterate(settings) => Some(&settings.test),
            StageKind::StressTest(settings) => Some(&settings.test),
            _ => None,
        }
    }
}

/// Settings shared by all stages that run a stressor pool and record statistics.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestSettings {
    /// Name of the test in the report.
    ///
    /// The name `warmup` and the empty name are executed but never recorded.
    pub name: String,

    /// Adds an iteration to an existing test of the same name instead of failing.
    pub amend: bool,

    /// Number of concurrent stressors per worker.
    pub threads: usize,

    /// Accumulator kind used for recording operation timings.
    pub stats: StatsKind,
}

impl Default for TestSettings {
    fn default() -> Self {
        Self {
            name: "Test".to_owned(),
            amend: false,
            threads: 1,
            stats: StatsKind::Basic,
        }
    }
}

impl TestSettings {
    /// Returns `true` if results of this test should be added to the report.
    pub fn is_recorded(&self) -> bool {
        let name = self.name.trim();
        !name.is_empty() && !name.eq_ignore_ascii_case("warmup")
    }

    fn validate(&self, v: &Validator<'_>) -> ConfigResult<()> {
        v.check(self.threads > 0, "test.threads", "must be at least 1")
    }
}

/// Settings of the [`StageKind::Iterate`] stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IterateSettings {
    /// Test recording settings.
    pub test: TestSettings,

    /// Number of full iterations each stressor performs.
    pub num_loops: u32,

    /// Container to iterate over. The store's default container when `None`.
    pub container: Option<String>,

    /// Named filter passed to the store when acquiring the iterator.
    pub filter: Option<String>,

    /// Named converter passed to the store when acquiring the iterator.
    pub converter: Option<String>,

    /// Failed `next` calls tolerated per iteration before it is aborted.
    pub max_next_failures: u32,

    /// Fails the stage if any stressor could not complete an iteration.
    pub fail_on_failed_iteration: bool,

    /// Fails the stage if element counts differ between iterations, stressors or workers.
    pub fail_on_uneven_elements: bool,

    /// Fails the stage if the element count differs from the store's reported total size.
    ///
    /// Defaults to `true` unless a filter is set.
    pub fail_on_not_total_size: Option<bool>,
}

impl Default for IterateSettings {
    fn default() -> Self {
        Self {
            test: TestSettings::default(),
            num_loops: 1,
            container: None,
            filter: None,
            converter: None,
            max_next_failures: 100,
            fail_on_failed_iteration: true,
            fail_on_uneven_elements: true,
            fail_on_not_total_size: None,
        }
    }
}

impl IterateSettings {
    /// Resolves [`fail_on_not_total_size`](Self::fail_on_not_total_size) against the filter.
    pub fn fail_on_not_total_size(&self) -> bool {
        self.fail_on_not_total_size.unwrap_or(self.filter.is_none())
    }

    fn validate(&self, v: &Validator<'_>) -> ConfigResult<()> {
        self.test.validate(v)?;
        v.check(self.num_loops > 0, "num_loops", "must be at least 1")?;
        if let Some(container) = &self.container {
            v.require(container, "container")?;
        }
        Ok(())
    }
}

/// Settings of the [`StageKind::StressTest`] stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StressTestSettings {
    /// Test recording settings.
    pub test: TestSettings,

    /// Total requests per worker, shared by all stressors. Ignored if `duration` is set.
    pub num_requests: u64,

    /// Runs for this long instead of a fixed number of requests.
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,

    /// Number of distinct keys the operations are spread over.
    pub num_entries: u64,

    /// Size of written values in bytes.
    pub entry_size: usize,

    /// Relative frequency of reads.
    pub get_ratio: u32,

    /// Relative frequency of writes.
    pub put_ratio: u32,

    /// Relative frequency of removals.
    pub remove_ratio: u32,

    /// Container the keys live in. The store's default container when `None`.
    pub container: Option<String>,

    /// Consecutive failed requests after which a stressor gives up. Unlimited when `None`.
    pub max_consecutive_failures: Option<u32>,
}

impl Default for StressTestSettings {
    fn default() -> Self {
        Self {
            test: TestSettings::default(),
            num_requests: 50_000,
            duration: None,
            num_entries: 100,
            entry_size: 1000,
            get_ratio: 4,
            put_ratio: 1,
            remove_ratio: 0,
            container: None,
            max_consecutive_failures: None,
        }
    }
}

impl StressTestSettings {
    fn validate(&self, v: &Validator<'_>) -> ConfigResult<()> {
        self.test.validate(v)?;
        match self.duration {
            Some(duration) => {
                v.check(!duration.is_zero(), "duration", "must be greater than zero")?
            }
            None => v.check(self.num_requests > 0, "num_requests", "must be at least 1")?,
        }
        v.check(self.num_entries > 0, "num_entries", "must be at least 1")?;
        let ratios = u64::from(self.get_ratio)
            + u64::from(self.put_ratio)
            + u64::from(self.remove_ratio);
        v.check(ratios > 0, "get_ratio", "at least one ratio must be positive")?;
        v.check(
            ratios <= u64::from(u32::MAX),
            "get_ratio",
            "the sum of all ratios must fit into 32 bits",
        )?;
        if let Some(max) = self.max_consecutive_failures {
            v.check(max > 0, "max_consecutive_failures", "must be at least 1")?;
        }
        Ok(())
    }
}

/// A kind of history recorded by the topology tracker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryType {
    /// Changes of the cluster topology.
    Topology,
    /// Data rebalancing after a topology change.
    Rehash,
    /// Availability changes of a cache.
    CacheStatus,
}

impl HistoryType {
    /// All history types.
    pub const ALL: [HistoryType; 3] = [
        HistoryType::Topology,
        HistoryType::Rehash,
        HistoryType::CacheStatus,
    ];

    /// Returns all history types as a set.
    pub fn all() -> BTreeSet<HistoryType> {
        Self::ALL.into_iter().collect()
    }
}

/// Which end of an event a wait matches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCondition {
    /// The event has started.
    Start,
    /// The event has finished.
    End,
}

/// Settings of the [`StageKind::WaitForTopologyEvent`] stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitForEventSettings {
    /// Cache whose history is observed. The store's default cache when `None`.
    pub cache: Option<String>,

    /// History that is observed.
    pub history: HistoryType,

    /// Whether the start or the end of an event is awaited.
    pub condition: EventCondition,

    /// Minimum member count at the end of the event.
    pub min_members: usize,

    /// Maximum member count at the end of the event. Unbounded when `None`.
    pub max_members: Option<usize>,

    /// Waits for a matching event. When `false`, the stage only updates the marker.
    pub wait: bool,

    /// Remembers the newest event afterwards, so later waits ignore everything up to it.
    pub set: bool,

    /// How long to wait for a matching event. Zero waits indefinitely.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Interval between checks of the history.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for WaitForEventSettings {
    fn default() -> Self {
        Self {
            cache: None,
            history: HistoryType::Rehash,
            condition: EventCondition::End,
            min_members: 0,
            max_members: None,
            wait: true,
            set: true,
            timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl WaitForEventSettings {
    /// Upper bound on members, resolving an unbounded maximum.
    pub fn max_members(&self) -> usize {
        self.max_members.unwrap_or(usize::MAX)
    }

    fn validate(&self, v: &Validator<'_>) -> ConfigResult<()> {
        v.check(
            self.min_members <= self.max_members(),
            "min_members",
            "must not exceed max_members",
        )?;
        v.check(
            !self.poll_interval.is_zero(),
            "poll_interval",
            "must be greater than zero",
        )
    }
}

/// Settings of the [`StageKind::WaitForTopologySettle`] stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettleSettings {
    /// Cache whose history is observed. The store's default cache when `None`.
    pub cache: Option<String>,

    /// Histories that must be quiet.
    pub histories: BTreeSet<HistoryType>,

    /// Also requires the cluster membership to be unchanged for `period`.
    pub check_membership: bool,

    /// Quiet period after the last event.
    #[serde(with = "humantime_serde")]
    pub period: Duration,

    /// How long to wait for the topology to settle.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Interval between checks of the history.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for SettleSettings {
    fn default() -> Self {
        Self {
            cache: None,
            histories: HistoryType::all(),
            check_membership: true,
            period: Duration::from_secs(10),
            timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl SettleSettings {
    fn validate(&self, v: &Validator<'_>) -> ConfigResult<()> {
        v.check(
            !self.histories.is_empty() || self.check_membership,
            "histories",
            "nothing to check",
        )?;
        v.check(!self.timeout.is_zero(), "timeout", "must be greater than zero")?;
        v.check(
            !self.poll_interval.is_zero(),
            "poll_interval",
            "must be greater than zero",
        )
    }
}

/// Settings of the [`StageKind::CheckTopology`] stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckTopologySettings {
    /// Cache whose history is checked. The store's default cache when `None`.
    pub cache: Option<String>,

    /// Histories that are checked.
    pub histories: BTreeSet<HistoryType>,

    /// Window in which a change counts as recent.
    #[serde(with = "humantime_serde")]
    pub period: Duration,

    /// Whether a recent change is expected (`true`) or not expected (`false`).
    pub changed: bool,
}

impl Default for CheckTopologySettings {
    fn default() -> Self {
        Self {
            cache: None,
            histories: HistoryType::all(),
            period: Duration::from_secs(10),
            changed: true,
        }
    }
}

impl CheckTopologySettings {
    fn validate(&self, v: &Validator<'_>) -> ConfigResult<()> {
        v.check(!self.histories.is_empty(), "histories", "must not be empty")
    }
}
