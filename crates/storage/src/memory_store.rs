use crate::*;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;

/// Process-local [`Log`] used by tests and the benchmark.
///
/// [`InMemoryLog::reopen`] simulates a restart: retained entries and cursors
/// survive, a new segment is allocated.
#[derive(Debug)]
pub struct InMemoryLog {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    segment: u64,
    entries: HashMap<Topic, BTreeMap<Position, Bytes>>,
    next_offsets: HashMap<Topic, u64>,
    cursors: HashMap<(Topic, SubscriptionName), Position>,
    individual_acks: HashMap<(Topic, SubscriptionName), Vec<Position>>,
    subscriptions: BTreeSet<(Topic, SubscriptionName)>,
}

impl Default for InMemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                segment: 1,
                ..Default::default()
            }),
        }
    }

    pub fn reopen(&self) {
        let mut inner = self.inner.lock();
        inner.segment += 1;
        inner.next_offsets.clear();
    }

    pub fn segment(&self) -> u64 {
        self.inner.lock().segment
    }

    /// Overwrite a stored payload in place. Only useful for corrupting entries in tests.
    pub fn replace_payload(&self, topic: &str, position: Position, payload: Bytes) -> bool {
        let mut inner = self.inner.lock();
        match inner
            .entries
            .get_mut(topic)
            .and_then(|log| log.get_mut(&position))
        {
            Some(slot) => {
                *slot = payload;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Log for InMemoryLog {
    async fn append(&self, topic: &str, payload: &[u8]) -> Result<Position, StorageError> {
        let mut inner = self.inner.lock();
        let segment = inner.segment;
        let next = inner.next_offsets.entry(topic.to_string()).or_insert(0);
        let position = Position::new(segment, *next);
        *next += 1;

        inner
            .entries
            .entry(topic.to_string())
            .or_default()
            .insert(position, Bytes::copy_from_slice(payload));
        Ok(position)
    }

    async fn read_from(
        &self,
        topic: &str,
        from: Position,
        max: usize,
    ) -> Result<Vec<StoredEntry>, StorageError> {
        let inner = self.inner.lock();
        let Some(log) = inner.entries.get(topic) else {
            return Ok(Vec::new());
        };
        Ok(log
            .range(from..)
            .take(max)
            .map(|(position, payload)| StoredEntry {
                position: *position,
                payload: payload.clone(),
            })
            .collect())
    }

    async fn count_from(&self, topic: &str, from: Position) -> Result<u64, StorageError> {
        let inner = self.inner.lock();
        Ok(inner
            .entries
            .get(topic)
            .map_or(0, |log| log.range(from..).count() as u64))
    }

    async fn mark_delete(
        &self,
        topic: &str,
        subscription: &str,
        position: Position,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        let key = (topic.to_string(), subscription.to_string());
        let current = inner.cursors.get(&key).copied();
        if check_cursor_forward(topic, subscription, current, position)? {
            inner.cursors.insert(key, position);
        }
        Ok(())
    }

    async fn mark_delete_position(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Option<Position>, StorageError> {
        let inner = self.inner.lock();
        Ok(inner
            .cursors
            .get(&(topic.to_string(), subscription.to_string()))
            .copied())
    }

    async fn save_individual_acks(
        &self,
        topic: &str,
        subscription: &str,
        positions: &[Position],
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        let key = (topic.to_string(), subscription.to_string());
        if positions.is_empty() {
            inner.individual_acks.remove(&key);
        } else {
            inner.individual_acks.insert(key, positions.to_vec());
        }
        Ok(())
    }

    async fn individual_acks(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Vec<Position>, StorageError> {
        let inner = self.inner.lock();
        Ok(inner
            .individual_acks
            .get(&(topic.to_string(), subscription.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn register_subscription(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<(), StorageError> {
        self.inner
            .lock()
            .subscriptions
            .insert((topic.to_string(), subscription.to_string()));
        Ok(())
    }

    async fn list_subscriptions(&self) -> Result<Vec<(Topic, SubscriptionName)>, StorageError> {
        Ok(self.inner.lock().subscriptions.iter().cloned().collect())
    }

    async fn cleanup_topic(&self, topic: &str) -> Result<u64, StorageError> {
        let mut inner = self.inner.lock();

        let mut slowest: Option<Position> = None;
        for (t, sub) in inner.subscriptions.iter().filter(|(t, _)| t == topic) {
            match inner.cursors.get(&(t.clone(), sub.clone())) {
                Some(p) => slowest = Some(slowest.map_or(*p, |s| s.min(*p))),
                None => return Ok(0),
            }
        }
        let Some(slowest) = slowest else {
            return Ok(0);
        };

        let Some(log) = inner.entries.get_mut(topic) else {
            return Ok(0);
        };
        let retained = log.split_off(&slowest.next());
        let removed = log.len() as u64;
        *log = retained;
        Ok(removed)
    }

    async fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
