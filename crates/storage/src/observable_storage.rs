use std::sync::Arc;
use std::time::Instant;

use sable_metrics::StorageStats;

use crate::{Log, Position, StorageError, StoredEntry, SubscriptionName, Topic};

macro_rules! observe {
    ($stats:expr, $field:ident, $call:expr) => {{
        let started = Instant::now();
        let res = $call.await;
        $stats.$field.finish(started, res.is_ok());
        res
    }};
}

/// [`Log`] wrapper that records call counts, errors and latencies.
#[derive(Debug)]
pub struct ObservableLog<L> {
    inner: L,
    stats: Arc<StorageStats>,
}

impl<L> ObservableLog<L> {
    pub fn new(inner: L, stats: Arc<StorageStats>) -> Self {
        Self { inner, stats }
    }

    #[inline(always)]
    fn inner(&self) -> &L {
        &self.inner
    }

    pub fn into_inner(self) -> L {
        self.inner
    }

    pub fn stats(&self) -> Arc<StorageStats> {
        Arc::clone(&self.stats)
    }
}

#[async_trait::async_trait]
impl<L: Log> Log for ObservableLog<L> {
    async fn append(&self, topic: &str, payload: &[u8]) -> Result<Position, StorageError> {
        self.stats.record_bytes_appended(payload.len());
        observe!(self.stats, appends, self.inner().append(topic, payload))
    }

    async fn read_from(
        &self,
        topic: &str,
        from: Position,
        max: usize,
    ) -> Result<Vec<StoredEntry>, StorageError> {
        let res = observe!(self.stats, reads, self.inner().read_from(topic, from, max));
        if let Ok(entries) = &res {
            self.stats.record_entries_read(entries.len());
        }
        res
    }

    async fn count_from(&self, topic: &str, from: Position) -> Result<u64, StorageError> {
        self.inner().count_from(topic, from).await
    }

    async fn mark_delete(
        &self,
        topic: &str,
        subscription: &str,
        position: Position,
    ) -> Result<(), StorageError> {
        observe!(
            self.stats,
            mark_deletes,
            self.inner().mark_delete(topic, subscription, position)
        )
    }

    async fn mark_delete_position(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Option<Position>, StorageError> {
        self.inner().mark_delete_position(topic, subscription).await
    }

    async fn save_individual_acks(
        &self,
        topic: &str,
        subscription: &str,
        positions: &[Position],
    ) -> Result<(), StorageError> {
        observe!(
            self.stats,
            mark_deletes,
            self.inner()
                .save_individual_acks(topic, subscription, positions)
        )
    }

    async fn individual_acks(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Vec<Position>, StorageError> {
        self.inner().individual_acks(topic, subscription).await
    }

    async fn register_subscription(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<(), StorageError> {
        self.inner().register_subscription(topic, subscription).await
    }

    async fn list_subscriptions(&self) -> Result<Vec<(Topic, SubscriptionName)>, StorageError> {
        self.inner().list_subscriptions().await
    }

    async fn cleanup_topic(&self, topic: &str) -> Result<u64, StorageError> {
        observe!(self.stats, maintenance, self.inner().cleanup_topic(topic))
    }

    async fn flush(&self) -> Result<(), StorageError> {
        observe!(self.stats, maintenance, self.inner().flush())
    }
}
