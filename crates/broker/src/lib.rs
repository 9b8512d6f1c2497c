macro_rules! invariant {
    ($cond:expr, $($arg:tt)*) => {
        if cfg!(debug_assertions) && !$cond {
            panic!($($arg)*);
        }
    };
}

pub mod ack;
pub mod batch;
pub mod config;
pub mod consumer;
pub mod dispatch;
pub mod key_shared;
pub mod producer;
pub mod subscription;
pub mod timer;

use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sable_metrics::BrokerStats;
use sable_protocol::CodecError;
use sable_storage::{Log, StorageError, SubscriptionName, Topic};

pub use crate::ack::{AckError, AckOutcome, AckTracker};
pub use crate::batch::{BatchContainer, FlushedBatch};
pub use crate::config::{
    BatchConfig, BatchingPolicy, BrokerConfig, ProducerConfig, SubscribeOptions,
};
pub use crate::consumer::{ConsumerHandle, ReceivedMessage};
pub use crate::dispatch::{ConsumerId, Dispatcher, SubscriptionType};
pub use crate::key_shared::{HashRange, KeyOrderingIndex, KeySharedMode, KeySharedPolicy};
pub use crate::producer::{Producer, SendFuture};
pub use crate::subscription::SubscriptionStats;

use crate::producer::{BatchWriter, ProducerCommand, run_batcher};
use crate::subscription::{DurableCursor, Subscription, SubscriptionSettings};

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    OversizeMessage { size: usize, limit: usize },

    #[error("subscription busy: {0}")]
    SubscriptionBusy(String),

    #[error("cumulative ack is not allowed on {0} subscriptions")]
    CumulativeAckNotAllowed(SubscriptionType),

    #[error("producer queue is full")]
    ProducerQueueFull,

    #[error("unknown subscription {subscription} on topic {topic}")]
    UnknownSubscription {
        topic: Topic,
        subscription: SubscriptionName,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("append failed: {0}")]
    AppendFailed(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("broker is shutting down")]
    Shutdown,
}

#[derive(Debug)]
struct TaskGroup {
    handles: SegQueue<tokio::task::JoinHandle<()>>,
    shutdown: AtomicBool,
}

impl TaskGroup {
    fn new() -> Self {
        Self {
            handles: SegQueue::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // no tasks after shutdown
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }

        let handle = tokio::spawn(fut);

        if self.shutdown.load(Ordering::Acquire) {
            handle.abort();
        } else {
            self.handles.push(handle);
        }
    }

    async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);

        while let Some(h) = self.handles.pop() {
            h.abort();
        }
    }
}

type SubscriptionMap = DashMap<(Topic, SubscriptionName), Arc<Subscription>>;

/// In-process broker: producers, subscriptions and their background tasks
/// over one [`Log`].
#[derive(Debug)]
pub struct Broker {
    pub config: BrokerConfig,
    log: Arc<dyn Log>,
    stats: Arc<BrokerStats>,
    subscriptions: Arc<SubscriptionMap>,
    topics: Arc<DashMap<Topic, ()>>,
    shutdown: CancellationToken,
    task_group: Arc<TaskGroup>,
}

impl Broker {
    /// Open a broker over `log`, resuming every subscription the log knows
    /// about from its mark-delete position.
    pub async fn try_new(
        log: impl Log + 'static,
        stats: Arc<BrokerStats>,
        config: BrokerConfig,
    ) -> Result<Self, BrokerError> {
        config.validate()?;

        let broker = Broker {
            config,
            log: Arc::new(log),
            stats,
            subscriptions: Arc::new(DashMap::new()),
            topics: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
            task_group: Arc::new(TaskGroup::new()),
        };

        for (topic, name) in broker.log.list_subscriptions().await? {
            let cursor = DurableCursor::load(&*broker.log, &topic, &name).await?;
            tracing::info!(
                %topic,
                subscription = %name,
                mark_delete = ?cursor.mark_delete,
                individual_acks = cursor.individual_acks.len(),
                "recovered subscription"
            );
            broker.topics.entry(topic.clone()).or_insert(());
            broker.insert_subscription(topic, name, cursor);
        }

        broker.start_cleanup_worker();
        Ok(broker)
    }

    pub fn stats(&self) -> Arc<BrokerStats> {
        self.stats.clone()
    }

    pub fn create_producer(
        &self,
        topic: &str,
        config: ProducerConfig,
    ) -> Result<Producer, BrokerError> {
        if self.shutdown.is_cancelled() {
            return Err(BrokerError::Shutdown);
        }
        self.topics.entry(topic.to_string()).or_insert(());

        let (tx, rx) = mpsc::channel::<ProducerCommand>(config.max_pending_messages.max(1));
        let writer = BatchWriter {
            topic: topic.to_string(),
            log: self.log.clone(),
            stats: self.stats.clone(),
            subscriptions: self.subscriptions.clone(),
            compression: config.batching.compression,
        };
        self.task_group.spawn(run_batcher(
            writer,
            config.batching,
            rx,
            self.shutdown.clone(),
        ));

        Ok(Producer::new(topic.to_string(), tx))
    }

    /// Producer using the broker-wide producer defaults.
    pub fn create_default_producer(&self, topic: &str) -> Result<Producer, BrokerError> {
        self.create_producer(topic, self.config.producer.clone())
    }

    pub async fn subscribe(
        &self,
        topic: &str,
        subscription: &str,
        options: SubscribeOptions,
    ) -> Result<ConsumerHandle, BrokerError> {
        if self.shutdown.is_cancelled() {
            return Err(BrokerError::Shutdown);
        }
        self.topics.entry(topic.to_string()).or_insert(());

        let sub = self.get_or_create_subscription(topic, subscription).await?;
        let (id, rx) = sub.attach(&options)?;

        Ok(ConsumerHandle::new(
            id,
            options.consumer_name,
            sub,
            rx,
            options.receiver_queue_size.max(1),
        ))
    }

    async fn get_or_create_subscription(
        &self,
        topic: &str,
        name: &str,
    ) -> Result<Arc<Subscription>, BrokerError> {
        let key = (topic.to_string(), name.to_string());
        if let Some(sub) = self.subscriptions.get(&key) {
            return Ok(sub.value().clone());
        }

        self.log.register_subscription(topic, name).await?;
        let cursor = DurableCursor::load(&*self.log, topic, name).await?;
        Ok(self.insert_subscription(key.0, key.1, cursor))
    }

    /// Spawns the coordinator only for the instance that actually got inserted.
    fn insert_subscription(
        &self,
        topic: Topic,
        name: SubscriptionName,
        cursor: DurableCursor,
    ) -> Arc<Subscription> {
        match self.subscriptions.entry((topic.clone(), name.clone())) {
            dashmap::Entry::Occupied(e) => e.get().clone(),
            dashmap::Entry::Vacant(v) => {
                let sub = Arc::new(Subscription::new(
                    topic,
                    name,
                    self.log.clone(),
                    self.stats.clone(),
                    SubscriptionSettings::from(&self.config),
                    cursor,
                    self.shutdown.clone(),
                ));
                v.insert(sub.clone());
                self.task_group.spawn(sub.clone().run());
                sub
            }
        }
    }

    fn subscription(&self, topic: &str, name: &str) -> Result<Arc<Subscription>, BrokerError> {
        self.subscriptions
            .get(&(topic.to_string(), name.to_string()))
            .map(|s| s.value().clone())
            .ok_or_else(|| BrokerError::UnknownSubscription {
                topic: topic.to_string(),
                subscription: name.to_string(),
            })
    }

    /// Entries of `topic` not yet fully acknowledged by `subscription`.
    pub async fn backlog(&self, topic: &str, subscription: &str) -> Result<u64, BrokerError> {
        self.subscription(topic, subscription)?.backlog().await
    }

    pub fn subscription_stats(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<SubscriptionStats, BrokerError> {
        Ok(self.subscription(topic, subscription)?.stats())
    }

    pub async fn flush_storage(&self) -> Result<(), BrokerError> {
        self.log.flush().await?;
        Ok(())
    }

    /// Drop entries every subscription of `topic` has consumed. Returns how
    /// many were removed.
    pub async fn force_cleanup(&self, topic: &str) -> Result<u64, BrokerError> {
        Ok(self.log.cleanup_topic(topic).await?)
    }

    fn start_cleanup_worker(&self) {
        let topics = self.topics.clone();
        let log = self.log.clone();
        let interval = Duration::from_secs(self.config.cleanup_interval_secs);
        let shutdown = self.shutdown.clone();

        self.task_group.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let names: Vec<Topic> = topics.iter().map(|t| t.key().clone()).collect();
                for topic in names {
                    match log.cleanup_topic(&topic).await {
                        Ok(0) => {}
                        Ok(removed) => tracing::debug!(%topic, removed, "cleaned up topic"),
                        Err(err) => tracing::warn!(%topic, error = %err, "cleanup failed"),
                    }
                }
            }
        });
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        // disconnect consumers so their receivers drain and end
        for entry in self.subscriptions.iter() {
            entry.value().close();
        }

        self.task_group.shutdown().await;
        tracing::info!("broker shut down");
    }
}
