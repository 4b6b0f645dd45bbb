//! In-memory store for tests and loopback runs.
//!
//! [`InMemoryStore`] keeps containers in a `HashMap` and supports failure injection, so stages
//! can be exercised without a real product behind them. The store is [`Clone`], so tests can hold
//! a handle for inspection and fault injection while the executor owns another.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;

use crate::store::{
    BoxedCursor, Cursor, Entry, Store, StoreError, StoreOperation, StoreResponse, StoreResult,
};
use crate::topology::TopologyHistory;

/// Container used when an operation does not name one.
pub const DEFAULT_CONTAINER: &str = "default";

type Container = BTreeMap<String, Bytes>;

/// Number of upcoming calls that fail, per kind of call.
#[derive(Debug, Default)]
struct Faults {
    invoke: u32,
    iterate: u32,
    has_next: u32,
    next: u32,
    close: u32,
}

fn take_fault(counter: &mut u32) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

/// A store that keeps all entries in memory.
///
/// Supported filters are `prefix:<p>`, which keeps keys starting with `<p>`. Supported converters
/// are `key`, which replaces each value with its key, and `identity`.
#[derive(Clone, Debug)]
pub struct InMemoryStore {
    containers: Arc<Mutex<HashMap<String, Container>>>,
    faults: Arc<Mutex<Faults>>,
    running: Arc<AtomicBool>,
    topology: TopologyHistory,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Creates an empty, running store with an empty default container.
    pub fn new() -> Self {
        let containers = HashMap::from([(DEFAULT_CONTAINER.to_owned(), Container::new())]);
        Self {
            containers: Arc::new(Mutex::new(containers)),
            faults: Arc::new(Mutex::new(Faults::default())),
            running: Arc::new(AtomicBool::new(true)),
            topology: TopologyHistory::new(),
        }
    }

    fn containers(&self) -> MutexGuard<'_, HashMap<String, Container>> {
        self.containers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fills `container` with `count` entries of `size` bytes, keyed `key0`, `key1`, ...
    pub fn populate(&self, container: &str, count: u64, size: usize) {
        let value = Bytes::from(vec![0u8; size]);
        let mut containers = self.containers();
        let entries = containers.entry(container.to_owned()).or_default();
        for i in 0..count {
            entries.insert(format!("key{i}"), value.clone());
        }
    }

    /// Returns the number of entries in `container`.
    pub fn len(&self, container: &str) -> usize {
        self.containers().get(container).map_or(0, BTreeMap::len)
    }

    /// Returns `true` if `container` holds no entries.
    pub fn is_empty(&self, container: &str) -> bool {
        self.len(container) == 0
    }

    /// Marks the service as running or stopped.
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Relaxed);
    }

    /// Replaces the cluster members and records the change in the topology history.
    pub fn set_members(&self, members: Vec<String>) {
        self.topology.record_membership(members);
    }

    /// Lets the next `count` key-value operations fail.
    pub fn fail_invocations(&self, count: u32) {
        self.faults().invoke = count;
    }

    /// Lets the next `count` iterator acquisitions fail.
    pub fn fail_iterations(&self, count: u32) {
        self.faults().iterate = count;
    }

    /// Lets the next `count` cursor queries fail.
    pub fn fail_has_next(&self, count: u32) {
        self.faults().has_next = count;
    }

    /// Lets the next `count` cursor advances fail.
    pub fn fail_next(&self, count: u32) {
        self.faults().next = count;
    }

    /// Lets the next `count` cursor closes fail.
    pub fn fail_close(&self, count: u32) {
        self.faults().close = count;
    }

    fn resolve(container: Option<&str>) -> &str {
        container.unwrap_or(DEFAULT_CONTAINER)
    }
}

#[async_trait::async_trait]
impl Store for InMemoryStore {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    async fn invoke(
        &self,
        container: Option<&str>,
        operation: StoreOperation,
    ) -> StoreResult<StoreResponse> {
        if take_fault(&mut self.faults().invoke) {
            return Err(StoreError::Unavailable(format!(
                "injected {} failure",
                operation.name()
            )));
        }

        let name = Self::resolve(container);
        let mut containers = self.containers();
        let entries = containers
            .get_mut(name)
            .ok_or_else(|| StoreError::UnknownContainer(name.to_owned()))?;

        Ok(match operation {
            StoreOperation::Get { key } => StoreResponse::Value(entries.get(&key).cloned()),
            StoreOperation::Put { key, value } => {
                entries.insert(key, value);
                StoreResponse::Stored
            }
            StoreOperation::Remove { key } => {
                StoreResponse::Removed(entries.remove(&key).is_some())
            }
        })
    }

    async fn iterate(
        &self,
        container: Option<&str>,
        filter: Option<&str>,
        converter: Option<&str>,
    ) -> StoreResult<BoxedCursor> {
        if take_fault(&mut self.faults().iterate) {
            return Err(StoreError::Unavailable("injected iterator failure".into()));
        }

        let prefix = match filter {
            None => "",
            Some(filter) => filter
                .strip_prefix("prefix:")
                .ok_or_else(|| StoreError::Unsupported(format!("filter `{filter}`")))?,
        };
        let key_as_value = match converter {
            None | Some("identity") => false,
            Some("key") => true,
            Some(other) => return Err(StoreError::Unsupported(format!("converter `{other}`"))),
        };

        let name = Self::resolve(container);
        let containers = self.containers();
        let entries = containers
            .get(name)
            .ok_or_else(|| StoreError::UnknownContainer(name.to_owned()))?;

        let snapshot: Vec<Entry> = entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| Entry {
                key: key.clone(),
                value: if key_as_value {
                    Bytes::from(key.clone())
                } else {
                    value.clone()
                },
            })
            .collect();

        Ok(Box::new(InMemoryCursor {
            entries: snapshot.into_iter(),
            faults: Arc::clone(&self.faults),
        }))
    }

    async fn total_size(&self, container: Option<&str>) -> StoreResult<Option<u64>> {
        let name = Self::resolve(container);
        let containers = self.containers();
        let entries = containers
            .get(name)
            .ok_or_else(|| StoreError::UnknownContainer(name.to_owned()))?;
        Ok(Some(entries.len() as u64))
    }

    async fn members(&self) -> StoreResult<Vec<String>> {
        Ok(self.topology.members())
    }

    fn topology(&self) -> Option<TopologyHistory> {
        Some(self.topology.clone())
    }
}

struct InMemoryCursor {
    entries: std::vec::IntoIter<Entry>,
    faults: Arc<Mutex<Faults>>,
}

impl InMemoryCursor {
    fn fault(&self, select: impl FnOnce(&mut Faults) -> &mut u32) -> bool {
        let mut faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
        take_fault(select(&mut faults))
    }
}

#[async_trait::async_trait]
impl Cursor for InMemoryCursor {
    async fn has_next(&mut self) -> StoreResult<bool> {
        if self.fault(|faults| &mut faults.has_next) {
            return Err(StoreError::Unavailable("injected has_next failure".into()));
        }
        Ok(!self.entries.as_slice().is_empty())
    }

    async fn next(&mut self) -> StoreResult<Entry> {
        if self.fault(|faults| &mut faults.next) {
            return Err(StoreError::Unavailable("injected next failure".into()));
        }
        self.entries
            .next()
            .ok_or_else(|| StoreError::Unavailable("cursor is exhausted".into()))
    }

    async fn close(self: Box<Self>) -> StoreResult<()> {
        if self.fault(|faults| &mut faults.close) {
            return Err(StoreError::Unavailable("injected close failure".into()));
        }
        Ok(())
    }
}
