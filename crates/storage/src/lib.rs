pub mod memory_store;
pub mod observable_storage;
pub mod rocksdb_store;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub type Topic = String;
pub type SubscriptionName = String;

/// Location of one physical entry in a topic's log.
///
/// Ordered lexicographically by segment, then offset. A log allocates a new
/// segment whenever it is reopened, so positions written later always sort
/// after earlier ones even though offsets restart at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub segment: u64,
    pub offset: u64,
}

impl Position {
    pub const EARLIEST: Position = Position {
        segment: 0,
        offset: 0,
    };

    pub const fn new(segment: u64, offset: u64) -> Self {
        Self { segment, offset }
    }

    /// The position directly after this one within the same segment.
    pub const fn next(self) -> Self {
        Self {
            segment: self.segment,
            offset: self.offset + 1,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment, self.offset)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub position: Position,
    pub payload: Bytes,
}

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("column family not found: {0}")]
    MissingColumnFamily(&'static str),

    #[error("rocksdb error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("invalid key encoding: {0}")]
    KeyDecode(String),

    #[error("cursor for {topic}/{subscription} cannot move from {current} back to {requested}")]
    CursorMovedBackwards {
        topic: Topic,
        subscription: SubscriptionName,
        current: Position,
        requested: Position,
    },

    #[error("unexpected internal error: {0}")]
    Internal(String),
}

pub fn make_rocksdb_log(
    path: &str,
    sync_write: bool,
) -> Result<rocksdb_store::RocksLog, StorageError> {
    rocksdb_store::RocksLog::open(path, sync_write)
}

/// Durable, append-only entry log with per-subscription cursors.
#[async_trait]
pub trait Log: Send + Sync + fmt::Debug {
    /// Append one opaque entry to the end of the topic's log.
    async fn append(&self, topic: &str, payload: &[u8]) -> Result<Position, StorageError>;

    /// Read entries at or after `from`, in position order. May return fewer
    /// than `max`.
    async fn read_from(
        &self,
        topic: &str,
        from: Position,
        max: usize,
    ) -> Result<Vec<StoredEntry>, StorageError>;

    /// Number of retained entries at or after `from`.
    async fn count_from(&self, topic: &str, from: Position) -> Result<u64, StorageError>;

    /// Advance the durable cursor: every entry at or before `position` is
    /// consumed by the subscription. Idempotent; moving backwards is rejected
    /// with [`StorageError::CursorMovedBackwards`].
    async fn mark_delete(
        &self,
        topic: &str,
        subscription: &str,
        position: Position,
    ) -> Result<(), StorageError>;

    async fn mark_delete_position(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Option<Position>, StorageError>;

    /// Replace the set of entries the subscription fully acknowledged above
    /// its mark-delete position. An empty slice clears the set.
    async fn save_individual_acks(
        &self,
        topic: &str,
        subscription: &str,
        positions: &[Position],
    ) -> Result<(), StorageError>;

    async fn individual_acks(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Vec<Position>, StorageError>;

    async fn register_subscription(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<(), StorageError>;

    async fn list_subscriptions(&self) -> Result<Vec<(Topic, SubscriptionName)>, StorageError>;

    /// Drop entries every registered subscription has mark-deleted. Returns
    /// the number of entries removed (best effort for range deletes).
    async fn cleanup_topic(&self, topic: &str) -> Result<u64, StorageError>;

    async fn flush(&self) -> Result<(), StorageError>;
}

/// Lets a caller keep a handle on a log it hands to the broker.
#[async_trait]
impl<L: Log + ?Sized> Log for Arc<L> {
    async fn append(&self, topic: &str, payload: &[u8]) -> Result<Position, StorageError> {
        (**self).append(topic, payload).await
    }

    async fn read_from(
        &self,
        topic: &str,
        from: Position,
        max: usize,
    ) -> Result<Vec<StoredEntry>, StorageError> {
        (**self).read_from(topic, from, max).await
    }

    async fn count_from(&self, topic: &str, from: Position) -> Result<u64, StorageError> {
        (**self).count_from(topic, from).await
    }

    async fn mark_delete(
        &self,
        topic: &str,
        subscription: &str,
        position: Position,
    ) -> Result<(), StorageError> {
        (**self).mark_delete(topic, subscription, position).await
    }

    async fn mark_delete_position(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Option<Position>, StorageError> {
        (**self).mark_delete_position(topic, subscription).await
    }

    async fn save_individual_acks(
        &self,
        topic: &str,
        subscription: &str,
        positions: &[Position],
    ) -> Result<(), StorageError> {
        (**self)
            .save_individual_acks(topic, subscription, positions)
            .await
    }

    async fn individual_acks(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Vec<Position>, StorageError> {
        (**self).individual_acks(topic, subscription).await
    }

    async fn register_subscription(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<(), StorageError> {
        (**self).register_subscription(topic, subscription).await
    }

    async fn list_subscriptions(&self) -> Result<Vec<(Topic, SubscriptionName)>, StorageError> {
        (**self).list_subscriptions().await
    }

    async fn cleanup_topic(&self, topic: &str) -> Result<u64, StorageError> {
        (**self).cleanup_topic(topic).await
    }

    async fn flush(&self) -> Result<(), StorageError> {
        (**self).flush().await
    }
}

/// Shared precondition for `mark_delete` implementations.
pub(crate) fn check_cursor_forward(
    topic: &str,
    subscription: &str,
    current: Option<Position>,
    requested: Position,
) -> Result<bool, StorageError> {
    match current {
        Some(cur) if requested < cur => Err(StorageError::CursorMovedBackwards {
            topic: topic.to_string(),
            subscription: subscription.to_string(),
            current: cur,
            requested,
        }),
        Some(cur) if requested == cur => Ok(false),
        _ => Ok(true),
    }
}
