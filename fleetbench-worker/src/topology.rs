//! History of cluster topology events and the wait primitives built on it.
//!
//! A store adapter appends events to a [`TopologyHistory`] as it observes them. Stages never
//! modify the history; they poll it until a condition holds or their deadline expires. The store
//! cannot push notifications to waiting stages, so every wait re-checks the history at a fixed,
//! configurable poll interval.
//!
//! Per cache and history type, the tracker distinguishes three states, derived purely from the
//! appended events: no event, in progress (a start without a later end), and settled (all starts
//! ended and nothing happened for a quiet period).

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use fleetbench_types::stage::{EventCondition, HistoryType, SettleSettings, WaitForEventSettings};
use tokio::time::Instant;

use crate::error::{TopologyError, TopologyResult};

/// Cache name used when a stage does not name one.
pub const DEFAULT_CACHE: &str = "default";

/// Identifies an event by its position in the arrival order of a [`TopologyHistory`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(u64);

/// Which part of a change an event marks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventPhase {
    /// The change started.
    Start,
    /// The change finished.
    End,
    /// The change happened at once.
    Single,
}

/// A single observed topology event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopologyEvent {
    /// Arrival order of the event.
    pub id: EventId,
    /// The history this event belongs to.
    pub history: HistoryType,
    /// Whether the event starts or ends a change.
    pub phase: EventPhase,
    /// When the event happened.
    pub time: Instant,
    /// Cluster members after the change.
    pub members_at_end: usize,
}

impl TopologyEvent {
    fn satisfies(&self, condition: EventCondition) -> bool {
        matches!(
            (condition, self.phase),
            (_, EventPhase::Single)
                | (EventCondition::Start, EventPhase::Start)
                | (EventCondition::End, EventPhase::End)
        )
    }
}

/// Parameters of [`TopologyHistory::wait_for_event`].
#[derive(Clone, Debug)]
pub struct EventWait {
    /// History to observe.
    pub history: HistoryType,
    /// Whether starts or ends are awaited.
    pub condition: EventCondition,
    /// Minimum members at the end of the event.
    pub min_members: usize,
    /// Maximum members at the end of the event.
    pub max_members: usize,
    /// Deadline for the wait. Zero waits indefinitely.
    pub timeout: Duration,
    /// Interval between checks.
    pub poll_interval: Duration,
}

impl From<&WaitForEventSettings> for EventWait {
    fn from(settings: &WaitForEventSettings) -> Self {
        Self {
            history: settings.history,
            condition: settings.condition,
            min_members: settings.min_members,
            max_members: settings.max_members(),
            timeout: settings.timeout,
            poll_interval: settings.poll_interval,
        }
    }
}

/// Parameters of [`TopologyHistory::wait_until_settled`].
#[derive(Clone, Debug)]
pub struct SettleWait {
    /// Histories that must be quiet.
    pub histories: BTreeSet<HistoryType>,
    /// Also requires membership to be unchanged for `period`.
    pub check_membership: bool,
    /// Quiet period.
    pub period: Duration,
    /// Deadline for the wait.
    pub timeout: Duration,
    /// Interval between checks.
    pub poll_interval: Duration,
}

impl From<&SettleSettings> for SettleWait {
    fn from(settings: &SettleSettings) -> Self {
        Self {
            histories: settings.histories.clone(),
            check_membership: settings.check_membership,
            period: settings.period,
            timeout: settings.timeout,
            poll_interval: settings.poll_interval,
        }
    }
}

/// Append-only record of topology events, shared between a store adapter and stages.
///
/// Cloning returns another handle to the same history.
#[derive(Clone, Debug, Default)]
pub struct TopologyHistory {
    inner: Arc<Mutex<HistoryInner>>,
}

#[derive(Debug, Default)]
struct HistoryInner {
    next_id: u64,
    events: HashMap<(String, HistoryType), Vec<TopologyEvent>>,
    members: Vec<String>,
    membership_changed: Option<Instant>,
}

impl TopologyHistory {
    /// Creates an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HistoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends an event that happens now.
    pub fn record(
        &self,
        cache: &str,
        history: HistoryType,
        phase: EventPhase,
        members_at_end: usize,
    ) -> EventId {
        self.record_at(cache, history, phase, members_at_end, Instant::now())
    }

    /// Appends an event with an explicit timestamp.
    ///
    /// Events must be appended in the order they happened.
    pub fn record_at(
        &self,
        cache: &str,
        history: HistoryType,
        phase: EventPhase,
        members_at_end: usize,
        time: Instant,
    ) -> EventId {
        let mut inner = self.lock();
        let id = EventId(inner.next_id);
        inner.next_id += 1;

        tracing::debug!(cache, ?history, ?phase, members_at_end, "topology event");
        inner
            .events
            .entry((cache.to_owned(), history))
            .or_default()
            .push(TopologyEvent {
                id,
                history,
                phase,
                time,
                members_at_end,
            });
        id
    }

    /// Records the current cluster members, remembering when they last changed.
    pub fn record_membership(&self, members: Vec<String>) {
        let mut inner = self.lock();
        if inner.members != members {
            tracing::debug!(?members, "cluster membership changed");
            inner.members = members;
            inner.membership_changed = Some(Instant::now());
        }
    }

    /// Returns the most recently recorded cluster members.
    pub fn members(&self) -> Vec<String> {
        self.lock().members.clone()
    }

    /// Returns all events of one history in arrival order.
    pub fn events(&self, cache: &str, history: HistoryType) -> Vec<TopologyEvent> {
        self.lock()
            .events
            .get(&(cache.to_owned(), history))
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the newest event of one history.
    pub fn latest(&self, cache: &str, history: HistoryType) -> Option<EventId> {
        let inner = self.lock();
        let events = inner.events.get(&(cache.to_owned(), history))?;
        events.last().map(|event| event.id)
    }

    /// Returns `true` if whether the history changed within `period` matches `expect_changed`.
    ///
    /// A history changed recently if its newest event happened less than `period` ago.
    pub fn check_recent(
        &self,
        cache: &str,
        history: HistoryType,
        period: Duration,
        expect_changed: bool,
    ) -> bool {
        let now = Instant::now();
        let inner = self.lock();
        let newest = inner
            .events
            .get(&(cache.to_owned(), history))
            .and_then(|events| events.last());

        let changed = newest.is_some_and(|event| within(event.time, now, period));
        changed == expect_changed
    }

    fn find_event(
        &self,
        cache: &str,
        wait: &EventWait,
        after: Option<EventId>,
    ) -> Option<TopologyEvent> {
        let inner = self.lock();
        let events = inner.events.get(&(cache.to_owned(), wait.history))?;
        events
            .iter()
            .filter(|event| after.is_none_or(|marker| event.id > marker))
            .find(|event| {
                event.satisfies(wait.condition)
                    && (wait.min_members..=wait.max_members).contains(&event.members_at_end)
            })
            .cloned()
    }

    /// Waits for the first event after `after` that satisfies `wait`.
    ///
    /// Events at or before the marker are ignored, so repeated waits do not trigger on the same
    /// event twice. Returns [`TopologyError::Timeout`] once `wait.timeout` has elapsed.
    pub async fn wait_for_event(
        &self,
        cache: &str,
        wait: &EventWait,
        after: Option<EventId>,
    ) -> TopologyResult<TopologyEvent> {
        poll(wait.timeout, wait.poll_interval, || {
            self.find_event(cache, wait, after)
        })
        .await
    }

    /// Returns `true` if all selected histories are settled.
    ///
    /// Scanning each history from the newest event backwards, every event must be at least
    /// `period` old and every start must be followed by an end.
    pub fn is_settled(
        &self,
        cache: &str,
        histories: &BTreeSet<HistoryType>,
        check_membership: bool,
        period: Duration,
    ) -> bool {
        let now = Instant::now();
        let inner = self.lock();

        for &history in histories {
            let Some(events) = inner.events.get(&(cache.to_owned(), history)) else {
                continue;
            };

            let mut open_ends = 0usize;
            for event in events.iter().rev() {
                if within(event.time, now, period) {
                    return false;
                }
                match event.phase {
                    EventPhase::End => open_ends += 1,
                    EventPhase::Start if open_ends == 0 => return false,
                    EventPhase::Start => open_ends -= 1,
                    EventPhase::Single => {}
                }
            }
            if open_ends > 0 {
                tracing::warn!(cache, ?history, open_ends, "history has ends without starts");
            }
        }

        if check_membership
            && let Some(changed) = inner.membership_changed
            && within(changed, now, period)
        {
            return false;
        }

        true
    }

    /// Waits until [`is_settled`](Self::is_settled) holds.
    pub async fn wait_until_settled(&self, cache: &str, wait: &SettleWait) -> TopologyResult<()> {
        poll(wait.timeout, wait.poll_interval, || {
            self.is_settled(cache, &wait.histories, wait.check_membership, wait.period)
                .then_some(())
        })
        .await
    }
}

/// Calls `check` every `interval` until it returns a value or `timeout` elapses.
///
/// A zero timeout polls indefinitely.
/// Returns `true` if less than `period` passed between `time` and `now`.
fn within(time: Instant, now: Instant, period: Duration) -> bool {
    now.saturating_duration_since(time) < period
}

async fn poll<T>(
    timeout: Duration,
    interval: Duration,
    mut check: impl FnMut() -> Option<T>,
) -> TopologyResult<T> {
    let started = Instant::now();
    loop {
        if let Some(value) = check() {
            return Ok(value);
        }

        let waited = started.elapsed();
        let pause = if timeout.is_zero() {
            interval
        } else if waited >= timeout {
            return Err(TopologyError::Timeout { waited });
        } else {
            interval.min(timeout - waited)
        };
        tokio::time::sleep(pause).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rehash_end(min_members: usize, timeout: Duration) -> EventWait {
        EventWait {
            history: HistoryType::Rehash,
            condition: EventCondition::End,
            min_members,
            max_members: usize::MAX,
            timeout,
            poll_interval: Duration::from_secs(1),
        }
    }

    fn settle(period: Duration) -> SettleWait {
        SettleWait {
            histories: HistoryType::all(),
            check_membership: true,
            period,
            timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_event_times_out() {
        let history = TopologyHistory::new();
        history.record(DEFAULT_CACHE, HistoryType::Rehash, EventPhase::End, 1);
        history.record(DEFAULT_CACHE, HistoryType::Topology, EventPhase::End, 3);

        let started = Instant::now();
        let result = history
            .wait_for_event(DEFAULT_CACHE, &rehash_end(2, Duration::from_secs(1)), None)
            .await;

        let TopologyError::Timeout { waited } = result.unwrap_err();
        assert!(waited >= Duration::from_secs(1));
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_event_sees_late_event() {
        let history = TopologyHistory::new();

        let feeder = history.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            feeder.record(DEFAULT_CACHE, HistoryType::Rehash, EventPhase::Start, 2);
            feeder.record(DEFAULT_CACHE, HistoryType::Rehash, EventPhase::End, 2);
        });

        let event = history
            .wait_for_event(DEFAULT_CACHE, &rehash_end(2, Duration::ZERO), None)
            .await
            .unwrap();
        assert_eq!(event.phase, EventPhase::End);
        assert_eq!(event.members_at_end, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_event_ignores_events_before_marker() {
        let history = TopologyHistory::new();
        history.record(DEFAULT_CACHE, HistoryType::Rehash, EventPhase::End, 4);
        let marker = history.latest(DEFAULT_CACHE, HistoryType::Rehash);

        let result = history
            .wait_for_event(DEFAULT_CACHE, &rehash_end(0, Duration::from_secs(2)), marker)
            .await;
        assert!(result.is_err());

        let id = history.record(DEFAULT_CACHE, HistoryType::Rehash, EventPhase::Single, 4);
        let event = history
            .wait_for_event(DEFAULT_CACHE, &rehash_end(0, Duration::from_secs(2)), marker)
            .await
            .unwrap();
        assert_eq!(event.id, id);
    }

    #[tokio::test(start_paused = true)]
    async fn start_condition_does_not_match_end() {
        let history = TopologyHistory::new();
        history.record(DEFAULT_CACHE, HistoryType::Rehash, EventPhase::End, 2);

        let mut wait = rehash_end(0, Duration::from_secs(1));
        wait.condition = EventCondition::Start;
        assert!(history.wait_for_event(DEFAULT_CACHE, &wait, None).await.is_err());

        wait.max_members = 1;
        wait.condition = EventCondition::End;
        assert!(history.wait_for_event(DEFAULT_CACHE, &wait, None).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn check_recent_compares_against_expectation() {
        let base = Instant::now();
        let history = TopologyHistory::new();
        let cache = DEFAULT_CACHE;
        let period = Duration::from_millis(10);
        for (phase, millis) in [(EventPhase::Start, 1), (EventPhase::End, 2)] {
            let time = base + Duration::from_millis(millis);
            history.record_at(cache, HistoryType::Topology, phase, 2, time);
        }

        tokio::time::advance(Duration::from_millis(10)).await;
        assert!(history.check_recent(cache, HistoryType::Topology, period, true));
        assert!(!history.check_recent(cache, HistoryType::Topology, period, false));

        tokio::time::advance(Duration::from_millis(3)).await;
        assert!(!history.check_recent(cache, HistoryType::Topology, period, true));
        assert!(history.check_recent(cache, HistoryType::Rehash, period, false));
    }

    #[tokio::test(start_paused = true)]
    async fn huge_period_keeps_changes_recent() {
        let history = TopologyHistory::new();
        history.record(DEFAULT_CACHE, HistoryType::Rehash, EventPhase::Single, 2);
        history.record_membership(vec!["a".into()]);
        tokio::time::advance(Duration::from_secs(60)).await;

        let period = Duration::MAX;
        assert!(history.check_recent(DEFAULT_CACHE, HistoryType::Rehash, period, true));
        assert!(!history.is_settled(DEFAULT_CACHE, &HistoryType::all(), false, period));
        assert!(!history.is_settled(DEFAULT_CACHE, &BTreeSet::new(), true, period));
    }

    #[tokio::test(start_paused = true)]
    async fn settles_after_quiet_period() {
        let history = TopologyHistory::new();
        history.record(DEFAULT_CACHE, HistoryType::Rehash, EventPhase::Start, 3);
        history.record(DEFAULT_CACHE, HistoryType::Rehash, EventPhase::End, 3);

        let wait = settle(Duration::from_secs(10));
        assert!(!history.is_settled(DEFAULT_CACHE, &wait.histories, true, wait.period));

        let started = Instant::now();
        history.wait_until_settled(DEFAULT_CACHE, &wait).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn open_start_is_not_settled() {
        let history = TopologyHistory::new();
        history.record(DEFAULT_CACHE, HistoryType::Topology, EventPhase::Start, 3);

        let mut wait = settle(Duration::from_secs(1));
        wait.timeout = Duration::from_secs(5);
        let result = history.wait_until_settled(DEFAULT_CACHE, &wait).await;
        assert!(matches!(result, Err(TopologyError::Timeout { .. })));

        history.record(DEFAULT_CACHE, HistoryType::Topology, EventPhase::End, 3);
        history.wait_until_settled(DEFAULT_CACHE, &wait).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn membership_change_delays_settling() {
        let history = TopologyHistory::new();
        let histories = HistoryType::all();
        let period = Duration::from_secs(5);

        history.record_membership(vec!["a".into(), "b".into()]);
        assert!(!history.is_settled(DEFAULT_CACHE, &histories, true, period));
        assert!(history.is_settled(DEFAULT_CACHE, &histories, false, period));

        tokio::time::advance(period).await;
        assert!(history.is_settled(DEFAULT_CACHE, &histories, true, period));

        history.record_membership(vec!["a".into(), "b".into()]);
        assert!(history.is_settled(DEFAULT_CACHE, &histories, true, period));
    }
}
