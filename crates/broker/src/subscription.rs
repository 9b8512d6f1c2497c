use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use sable_metrics::BrokerStats;
use sable_protocol::{EntryCodec, MessageId, Position};
use sable_storage::{Log, StoredEntry, SubscriptionName, Topic};

use crate::BrokerError;
use crate::ack::AckTracker;
use crate::config::{BrokerConfig, SubscribeOptions};
use crate::consumer::ReceivedMessage;
use crate::dispatch::{
    ConsumerId, Delivery, DispatchError, DispatchUnit, Dispatcher, SubscriptionType,
};
use crate::key_shared::KeyOrderingIndex;
use crate::timer::DeadlineQueue;

#[derive(Debug, Clone)]
pub(crate) struct SubscriptionSettings {
    pub read_batch_size: usize,
    pub negative_ack_delay: Option<Duration>,
    pub cursor_flush_interval: Duration,
}

impl From<&BrokerConfig> for SubscriptionSettings {
    fn from(cfg: &BrokerConfig) -> Self {
        Self {
            read_batch_size: cfg.read_batch_size.max(1),
            negative_ack_delay: cfg.negative_ack_delay(),
            cursor_flush_interval: cfg.cursor_flush_interval(),
        }
    }
}

/// Durable cursor state of one subscription as stored in the log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct DurableCursor {
    pub mark_delete: Option<Position>,
    /// Fully acked entries above `mark_delete`.
    pub individual_acks: Vec<Position>,
}

impl DurableCursor {
    pub(crate) async fn load(
        log: &dyn Log,
        topic: &str,
        subscription: &str,
    ) -> Result<Self, BrokerError> {
        Ok(Self {
            mark_delete: log.mark_delete_position(topic, subscription).await?,
            individual_acks: log.individual_acks(topic, subscription).await?,
        })
    }
}

#[derive(Debug)]
enum Deadline {
    AckTimeout {
        consumer: ConsumerId,
        id: MessageId,
        delivery_seq: u64,
    },
    /// Delayed redelivery after a negative ack.
    Redeliver(DispatchUnit),
}

#[derive(Debug)]
struct ConsumerSlot {
    tx: mpsc::Sender<ReceivedMessage>,
    name: String,
    ack_timeout: Option<Duration>,
}

#[derive(Debug)]
struct SubscriptionState {
    tracker: AckTracker,
    dispatcher: Dispatcher,
    keys: KeyOrderingIndex,
    deadlines: DeadlineQueue<Deadline>,
    consumers: HashMap<ConsumerId, ConsumerSlot>,
    /// Next log position to read.
    read_position: Position,
    /// Last mark-delete the log accepted.
    durable_mark_delete: Option<Position>,
    /// Computed by the tracker, not yet accepted by the log.
    pending_mark_delete: Option<Position>,
    pending_individual_acks: Option<Vec<Position>>,
}

impl SubscriptionState {
    fn resume(sub_type: SubscriptionType, cursor: &DurableCursor) -> Self {
        let mark_delete = cursor.mark_delete;
        Self {
            tracker: AckTracker::resume_after(mark_delete)
                .with_individual_acks(cursor.individual_acks.iter().copied()),
            dispatcher: Dispatcher::new(sub_type),
            keys: KeyOrderingIndex::new(),
            deadlines: DeadlineQueue::new(),
            consumers: HashMap::new(),
            read_position: mark_delete.map_or(Position::EARLIEST, |p| p.next()),
            durable_mark_delete: mark_delete,
            pending_mark_delete: None,
            pending_individual_acks: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionStats {
    pub topic: Topic,
    pub subscription: SubscriptionName,
    pub subscription_type: SubscriptionType,
    pub consumers: usize,
    /// Entries delivered at least partially and not fully acknowledged.
    pub tracked_backlog: usize,
    pub unacked_messages: u64,
    pub pending_redelivery: usize,
    pub scheduled_deadlines: usize,
    pub mark_delete: Option<Position>,
    pub read_position: Position,
}

/// One named cursor over a topic together with its attached consumers.
///
/// All bookkeeping sits behind one mutex that is never held across an
/// await. A single coordinator task reads the log, dispatches and persists
/// the cursor; acks run on the caller's task.
#[derive(Debug)]
pub struct Subscription {
    topic: Topic,
    name: SubscriptionName,
    log: Arc<dyn Log>,
    stats: Arc<BrokerStats>,
    settings: SubscriptionSettings,
    state: Mutex<SubscriptionState>,
    notify: Notify,
    // Held by the coordinator for a whole pass so `backlog` sees the tracker
    // and the read position from the same moment.
    read_gate: tokio::sync::Mutex<()>,
    next_consumer_id: AtomicU64,
    shutdown: CancellationToken,
}

impl Subscription {
    pub(crate) fn new(
        topic: Topic,
        name: SubscriptionName,
        log: Arc<dyn Log>,
        stats: Arc<BrokerStats>,
        settings: SubscriptionSettings,
        cursor: DurableCursor,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            topic,
            name,
            log,
            stats,
            settings,
            state: Mutex::new(SubscriptionState::resume(
                SubscriptionType::default(),
                &cursor,
            )),
            notify: Notify::new(),
            read_gate: tokio::sync::Mutex::new(()),
            next_consumer_id: AtomicU64::new(0),
            shutdown,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscription_type(&self) -> SubscriptionType {
        self.state.lock().dispatcher.subscription_type()
    }

    /// Wake the coordinator, e.g. after new entries were appended.
    pub(crate) fn wake(&self) {
        self.notify.notify_one();
    }

    pub(crate) fn attach(
        &self,
        options: &SubscribeOptions,
    ) -> Result<(ConsumerId, mpsc::Receiver<ReceivedMessage>), BrokerError> {
        if self.shutdown.is_cancelled() {
            return Err(BrokerError::Shutdown);
        }

        let requested = options.subscription_type;
        let mut st = self.state.lock();
        let current = st.dispatcher.subscription_type();

        if st.consumers.is_empty() {
            st.dispatcher.set_subscription_type(requested);
        } else if requested != current {
            return Err(BrokerError::SubscriptionBusy(format!(
                "subscription {} is {current}, cannot attach a {requested} consumer",
                self.name
            )));
        } else if requested == SubscriptionType::Exclusive {
            return Err(BrokerError::SubscriptionBusy(
                "Exclusive consumer is already connected".into(),
            ));
        }

        let consumer = self.next_consumer_id.fetch_add(1, Ordering::SeqCst);
        if requested == SubscriptionType::KeyShared {
            st.keys
                .attach(consumer, &options.key_shared_policy)
                .map_err(|busy| BrokerError::SubscriptionBusy(busy.0))?;
        }

        let capacity = options.receiver_queue_size.max(1);
        let (tx, rx) = mpsc::channel(capacity as usize);
        st.dispatcher.add_consumer(consumer);
        st.dispatcher.grant_permits(consumer, capacity as u64);
        st.consumers.insert(
            consumer,
            ConsumerSlot {
                tx,
                name: options.consumer_name.clone(),
                ack_timeout: options.ack_timeout,
            },
        );
        drop(st);

        tracing::info!(
            topic = %self.topic,
            subscription = %self.name,
            consumer,
            consumer_name = %options.consumer_name,
            subscription_type = %requested,
            "consumer attached"
        );
        self.notify.notify_one();
        Ok((consumer, rx))
    }

    pub(crate) fn detach(&self, consumer: ConsumerId) -> bool {
        let mut st = self.state.lock();
        let detached = self.detach_locked(&mut st, consumer);
        drop(st);
        if detached {
            self.notify.notify_one();
        }
        detached
    }

    fn detach_locked(&self, st: &mut SubscriptionState, consumer: ConsumerId) -> bool {
        let Some(slot) = st.consumers.remove(&consumer) else {
            return false;
        };
        let requeued = st.dispatcher.remove_consumer(consumer);
        let unbound = st.keys.detach(consumer);
        tracing::info!(
            topic = %self.topic,
            subscription = %self.name,
            consumer,
            consumer_name = %slot.name,
            requeued,
            unbound,
            "consumer detached"
        );
        true
    }

    fn stale_ack(&self, consumer: ConsumerId, id: MessageId, reason: &dyn std::fmt::Display) {
        tracing::debug!(
            topic = %self.topic,
            subscription = %self.name,
            consumer,
            %id,
            %reason,
            "ignoring stale ack"
        );
        self.stats.stale_ack();
    }

    pub(crate) fn ack(&self, consumer: ConsumerId, id: MessageId) -> Result<(), BrokerError> {
        if self.shutdown.is_cancelled() {
            return Err(BrokerError::Shutdown);
        }
        let mut st = self.state.lock();
        match st.tracker.ack_individual(id) {
            Ok(outcome) => {
                st.dispatcher.on_ack(consumer, id);
                drop(st);
                self.stats.acked_many(outcome.newly_acked);
                if outcome.entries_completed > 0 {
                    self.notify.notify_one();
                }
            }
            Err(err) => {
                // A late copy may still be parked in the dispatcher.
                st.dispatcher.on_ack(consumer, id);
                drop(st);
                self.stale_ack(consumer, id, &err);
            }
        }
        Ok(())
    }

    pub(crate) fn ack_cumulative(
        &self,
        consumer: ConsumerId,
        id: MessageId,
    ) -> Result<(), BrokerError> {
        if self.shutdown.is_cancelled() {
            return Err(BrokerError::Shutdown);
        }
        let mut st = self.state.lock();
        let sub_type = st.dispatcher.subscription_type();
        if !sub_type.allows_cumulative_ack() {
            return Err(BrokerError::CumulativeAckNotAllowed(sub_type));
        }
        match st.tracker.ack_cumulative(id) {
            Ok(outcome) => {
                st.dispatcher.on_ack_cumulative(consumer, id);
                drop(st);
                self.stats.acked_many(outcome.newly_acked);
                // entries below `id` left tracking even if nothing new was acked
                self.notify.notify_one();
            }
            Err(err) => {
                drop(st);
                self.stale_ack(consumer, id, &err);
            }
        }
        Ok(())
    }

    pub(crate) fn negative_ack(
        &self,
        consumer: ConsumerId,
        id: MessageId,
    ) -> Result<(), BrokerError> {
        if self.shutdown.is_cancelled() {
            return Err(BrokerError::Shutdown);
        }
        let mut st = self.state.lock();
        if st.tracker.is_acked(id) {
            drop(st);
            self.stale_ack(consumer, id, &"negative ack for acknowledged message");
            return Ok(());
        }

        let found = match self.settings.negative_ack_delay {
            None => st.dispatcher.negative_ack(consumer, id),
            Some(delay) => match st.dispatcher.take_outstanding(consumer, id) {
                Some(unit) => {
                    st.deadlines
                        .schedule(Instant::now() + delay, Deadline::Redeliver(unit));
                    true
                }
                None => false,
            },
        };
        drop(st);

        if found {
            self.stats.negative_acked();
            self.notify.notify_one();
        } else {
            self.stale_ack(consumer, id, &"message not outstanding");
        }
        Ok(())
    }

    pub(crate) fn redeliver_unacknowledged(&self, consumer: ConsumerId) -> usize {
        let requeued = self.state.lock().dispatcher.redeliver_unacknowledged(consumer);
        if requeued > 0 {
            self.notify.notify_one();
        }
        requeued
    }

    pub(crate) fn grant_permits(&self, consumer: ConsumerId, permits: u64) -> bool {
        let granted = self.state.lock().dispatcher.grant_permits(consumer, permits);
        if granted {
            self.notify.notify_one();
        }
        granted
    }

    /// Entries not yet fully acknowledged: tracked ones plus everything in
    /// the log at or after the read position that was not acked before a
    /// restart.
    pub async fn backlog(&self) -> Result<u64, BrokerError> {
        let _gate = self.read_gate.lock().await;
        let (tracked, from, restored) = {
            let st = self.state.lock();
            let from = st.read_position;
            (
                st.tracker.backlog_size() as u64,
                from,
                st.tracker.restored_from(from) as u64,
            )
        };
        let unread = self.log.count_from(&self.topic, from).await?;
        Ok(tracked + unread.saturating_sub(restored))
    }

    pub fn stats(&self) -> SubscriptionStats {
        let st = self.state.lock();
        SubscriptionStats {
            topic: self.topic.clone(),
            subscription: self.name.clone(),
            subscription_type: st.dispatcher.subscription_type(),
            consumers: st.consumers.len(),
            tracked_backlog: st.tracker.backlog_size(),
            unacked_messages: st.tracker.unacked_messages(),
            pending_redelivery: st.dispatcher.pending_redelivery(),
            scheduled_deadlines: st.deadlines.len(),
            mark_delete: st.durable_mark_delete,
            read_position: st.read_position,
        }
    }

    /// Disconnect every consumer. Their receivers drain and then yield None.
    pub(crate) fn close(&self) {
        let mut st = self.state.lock();
        let ids: Vec<_> = st.consumers.keys().copied().collect();
        for consumer in ids {
            self.detach_locked(&mut st, consumer);
        }
    }

    pub(crate) async fn run(self: Arc<Self>) {
        let mut cursor_tick = tokio::time::interval(self.settings.cursor_flush_interval);
        cursor_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let progressed = match self.run_once().await {
                Ok(progressed) => progressed,
                Err(err) => {
                    tracing::warn!(
                        topic = %self.topic,
                        subscription = %self.name,
                        error = %err,
                        "subscription pass failed"
                    );
                    false
                }
            };
            if progressed {
                tokio::task::yield_now().await;
                continue;
            }

            let next_deadline = self.state.lock().deadlines.next_deadline();
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(next_deadline.unwrap_or_else(Instant::now)),
                    if next_deadline.is_some() => {}
                _ = cursor_tick.tick() => {}
            }
        }

        tracing::debug!(topic = %self.topic, subscription = %self.name, "coordinator stopped");
    }

    /// One coordinator pass. Returns true if entries were read from the log,
    /// in which case another pass should follow right away.
    async fn run_once(&self) -> Result<bool, BrokerError> {
        let _gate = self.read_gate.lock().await;

        let (from, want) = {
            let mut st = self.state.lock();
            self.fire_deadlines(&mut st, Instant::now());

            // Units parked behind a blocked key keep waiting while reads
            // continue for other keys, up to a bounded read-ahead.
            let read_ahead =
                self.settings.read_batch_size * st.dispatcher.consumer_count().max(1);
            let room = read_ahead.saturating_sub(st.dispatcher.fresh_len());
            let want = st
                .dispatcher
                .total_available_permits()
                .min(self.settings.read_batch_size as u64)
                .min(room as u64) as usize;
            (st.read_position, want)
        };

        let mut read_any = false;
        if want > 0 {
            let entries = self.log.read_from(&self.topic, from, want).await?;
            if !entries.is_empty() {
                read_any = true;
                let mut st = self.state.lock();
                self.ingest(&mut st, entries);
            }
        }

        let (mark_delete, individual_acks) = {
            let mut st = self.state.lock();
            self.pump(&mut st);
            if let Some(position) = st.tracker.advance_cursor() {
                st.pending_mark_delete = Some(position);
            }
            if let Some(acks) = st.tracker.take_individual_acks() {
                st.pending_individual_acks = Some(acks);
            }
            (st.pending_mark_delete, st.pending_individual_acks.clone())
        };

        // The ack set is only written once the cursor below it is durable.
        let cursor_durable = match mark_delete {
            Some(position) => self.persist_mark_delete(position).await,
            None => true,
        };
        if let Some(acks) = individual_acks.filter(|_| cursor_durable) {
            self.persist_individual_acks(acks).await;
        }
        Ok(read_any)
    }

    fn fire_deadlines(&self, st: &mut SubscriptionState, now: Instant) {
        for deadline in st.deadlines.pop_expired(now) {
            match deadline {
                Deadline::AckTimeout {
                    consumer,
                    id,
                    delivery_seq,
                } => {
                    if st.dispatcher.on_ack_timeout(consumer, id, delivery_seq) {
                        tracing::debug!(
                            topic = %self.topic,
                            subscription = %self.name,
                            consumer,
                            %id,
                            "ack timeout, requeued"
                        );
                        self.stats.ack_timeout();
                    }
                }
                Deadline::Redeliver(unit) => {
                    if !st.tracker.is_acked(unit.id) {
                        st.dispatcher.requeue_unit(unit);
                    }
                }
            }
        }
    }

    fn ingest(&self, st: &mut SubscriptionState, entries: Vec<StoredEntry>) {
        for entry in entries {
            st.read_position = entry.position.next();

            let decoded = match EntryCodec::decode(&entry.payload) {
                Ok(decoded) => decoded,
                Err(err) => {
                    tracing::error!(
                        topic = %self.topic,
                        subscription = %self.name,
                        position = %entry.position,
                        error = %err,
                        "skipping undecodable entry"
                    );
                    self.stats.decode_error();
                    continue;
                }
            };

            let Some(batch_size) = decoded.first().map(|d| d.batch_size) else {
                continue;
            };
            if !st.tracker.record_delivered(entry.position, batch_size) {
                continue;
            }

            st.dispatcher.enqueue(decoded.into_iter().map(|d| {
                let id = d.id(entry.position);
                DispatchUnit::new(id, Arc::new(d.message))
            }));
        }
    }

    /// Dispatch and hand deliveries to consumer channels.
    fn pump(&self, st: &mut SubscriptionState) {
        let deliveries = match st.dispatcher.dispatch(&mut st.keys) {
            Ok(deliveries) => deliveries,
            Err(err) => {
                self.restart(st, err);
                return;
            }
        };

        let now = Instant::now();
        let mut retry = false;
        for delivery in deliveries {
            retry |= !self.send(st, delivery, now);
        }
        if retry {
            self.notify.notify_one();
        }
    }

    /// Returns false if the delivery could not be placed.
    fn send(&self, st: &mut SubscriptionState, delivery: Delivery, now: Instant) -> bool {
        let Delivery {
            consumer,
            unit,
            delivery_seq,
        } = delivery;
        let id = unit.id;
        let redelivered = unit.redelivery_count > 0;

        let Some(slot) = st.consumers.get(&consumer) else {
            self.take_back(st, consumer, id);
            return false;
        };
        let ack_timeout = slot.ack_timeout;
        let msg = ReceivedMessage {
            id,
            message: unit.message,
            redelivery_count: unit.redelivery_count,
        };

        match slot.tx.try_send(msg) {
            Ok(()) => {
                self.stats.delivered();
                if redelivered {
                    self.stats.redelivered_many(1);
                }
                if let Some(timeout) = ack_timeout {
                    st.deadlines.schedule(
                        now + timeout,
                        Deadline::AckTimeout {
                            consumer,
                            id,
                            delivery_seq,
                        },
                    );
                }
                true
            }
            Err(TrySendError::Full(_)) => {
                tracing::debug!(
                    topic = %self.topic,
                    subscription = %self.name,
                    consumer,
                    %id,
                    "receiver queue full, requeued"
                );
                self.take_back(st, consumer, id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.detach_locked(st, consumer);
                false
            }
        }
    }

    fn take_back(&self, st: &mut SubscriptionState, consumer: ConsumerId, id: MessageId) {
        if let Some(unit) = st.dispatcher.take_outstanding(consumer, id) {
            st.dispatcher.requeue_unit(unit);
        }
    }

    /// Throw away dispatch state and start over from the durable cursor.
    /// Every consumer is disconnected.
    fn restart(&self, st: &mut SubscriptionState, err: DispatchError) {
        tracing::error!(
            topic = %self.topic,
            subscription = %self.name,
            error = %err,
            mark_delete = ?st.durable_mark_delete,
            "restarting dispatcher"
        );
        self.stats.flow_violation();

        let sub_type = st.dispatcher.subscription_type();
        let cursor = DurableCursor {
            mark_delete: st.durable_mark_delete,
            individual_acks: st.tracker.individual_acks(),
        };
        *st = SubscriptionState::resume(sub_type, &cursor);
    }

    async fn persist_individual_acks(&self, acks: Vec<Position>) {
        match self
            .log
            .save_individual_acks(&self.topic, &self.name, &acks)
            .await
        {
            Ok(()) => {
                let mut st = self.state.lock();
                if st.pending_individual_acks.as_ref() == Some(&acks) {
                    st.pending_individual_acks = None;
                }
            }
            Err(err) => {
                tracing::warn!(
                    topic = %self.topic,
                    subscription = %self.name,
                    entries = acks.len(),
                    error = %err,
                    "saving individual acks failed, will retry"
                );
            }
        }
    }

    /// Returns whether the log accepted the position.
    async fn persist_mark_delete(&self, position: Position) -> bool {
        match self.log.mark_delete(&self.topic, &self.name, position).await {
            Ok(()) => {
                let mut st = self.state.lock();
                if st.durable_mark_delete.is_none_or(|p| p < position) {
                    st.durable_mark_delete = Some(position);
                }
                if st.pending_mark_delete == Some(position) {
                    st.pending_mark_delete = None;
                }
                tracing::trace!(
                    topic = %self.topic,
                    subscription = %self.name,
                    %position,
                    "mark-delete persisted"
                );
                true
            }
            Err(err) => {
                tracing::warn!(
                    topic = %self.topic,
                    subscription = %self.name,
                    %position,
                    error = %err,
                    "mark-delete failed, will retry"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubscribeOptions;
    use crate::key_shared::{HashRange, KeySharedPolicy};
    use crate::key_shared::HASH_RANGE_SIZE;
    use bytes::Bytes;
    use sable_protocol::LogicalMessage;
    use sable_storage::memory_store::InMemoryLog;
    use xxhash_rust::xxh3::xxh3_64;

    fn subscription(log: Arc<InMemoryLog>) -> Arc<Subscription> {
        Arc::new(Subscription::new(
            "t".into(),
            "s".into(),
            log,
            BrokerStats::new(60),
            SubscriptionSettings::from(&BrokerConfig::default()),
            DurableCursor::default(),
            CancellationToken::new(),
        ))
    }

    async fn append(log: &InMemoryLog, n: usize) -> Vec<Position> {
        let mut out = Vec::new();
        for i in 0..n {
            let bytes = EntryCodec::encode_single(&LogicalMessage::new(format!("m{i}"))).unwrap();
            out.push(log.append("t", &bytes).await.unwrap());
        }
        out
    }

    async fn append_keyed(log: &InMemoryLog, key: &str, payload: &str) -> Position {
        let msg = LogicalMessage::new(payload.to_string()).with_key(key);
        let bytes = EntryCodec::encode_single(&msg).unwrap();
        log.append("t", &bytes).await.unwrap()
    }

    /// First `key-N` whose hash satisfies `pred`.
    fn key_where(pred: impl Fn(u64) -> bool) -> String {
        (0..)
            .map(|i| format!("key-{i}"))
            .find(|k| pred(xxh3_64(k.as_bytes())))
            .unwrap()
    }

    fn payloads(rx: &mut mpsc::Receiver<ReceivedMessage>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(String::from_utf8_lossy(msg.payload()).into_owned());
        }
        out
    }

    #[test]
    fn attach_rules() {
        let sub = subscription(Arc::new(InMemoryLog::new()));

        let (a, _rx_a) = sub.attach(&SubscribeOptions::new(SubscriptionType::Exclusive)).unwrap();
        let err = sub
            .attach(&SubscribeOptions::new(SubscriptionType::Exclusive))
            .unwrap_err();
        assert!(matches!(err, BrokerError::SubscriptionBusy(_)));
        let err = sub
            .attach(&SubscribeOptions::new(SubscriptionType::Shared))
            .unwrap_err();
        assert!(matches!(err, BrokerError::SubscriptionBusy(_)));

        // type may change once nobody is attached
        assert!(sub.detach(a));
        let (_, _rx_b) = sub.attach(&SubscribeOptions::new(SubscriptionType::Shared)).unwrap();
        let (_, _rx_c) = sub.attach(&SubscribeOptions::new(SubscriptionType::Shared)).unwrap();
        assert_eq!(sub.stats().consumers, 2);
        assert_eq!(sub.subscription_type(), SubscriptionType::Shared);
    }

    #[test]
    fn key_shared_overlapping_ranges_are_busy() {
        let sub = subscription(Arc::new(InMemoryLog::new()));
        let opts = |start, end| {
            SubscribeOptions::new(SubscriptionType::KeyShared).with_key_shared_policy(
                KeySharedPolicy::sticky(vec![HashRange::new(start, end)]),
            )
        };

        let (_, _rx) = sub.attach(&opts(0, 100)).unwrap();
        assert!(matches!(
            sub.attach(&opts(50, 200)),
            Err(BrokerError::SubscriptionBusy(_))
        ));
        let (_, _rx2) = sub.attach(&opts(101, 200)).unwrap();
        assert_eq!(sub.stats().consumers, 2);
    }

    #[tokio::test]
    async fn pass_reads_dispatches_and_persists_cursor() {
        let log = Arc::new(InMemoryLog::new());
        let positions = append(&log, 3).await;
        let sub = subscription(log.clone());
        assert_eq!(sub.backlog().await.unwrap(), 3);

        let (consumer, mut rx) = sub
            .attach(&SubscribeOptions::default().with_receiver_queue_size(2))
            .unwrap();
        assert!(sub.run_once().await.unwrap());

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(first.id, MessageId::single(positions[0]));
        assert_eq!(sub.backlog().await.unwrap(), 3);

        sub.ack(consumer, second.id).unwrap();
        sub.run_once().await.unwrap();
        assert_eq!(log.mark_delete_position("t", "s").await.unwrap(), None);
        assert_eq!(
            log.individual_acks("t", "s").await.unwrap(),
            vec![positions[1]]
        );

        sub.ack(consumer, first.id).unwrap();
        sub.run_once().await.unwrap();
        assert_eq!(
            log.mark_delete_position("t", "s").await.unwrap(),
            Some(positions[1])
        );
        assert!(log.individual_acks("t", "s").await.unwrap().is_empty());
        assert_eq!(sub.backlog().await.unwrap(), 1);
        assert_eq!(sub.stats().mark_delete, Some(positions[1]));
    }

    #[tokio::test]
    async fn duplicate_acks_are_counted_not_errors() {
        let log = Arc::new(InMemoryLog::new());
        append(&log, 1).await;
        let stats = BrokerStats::new(60);
        let sub = Arc::new(Subscription::new(
            "t".into(),
            "s".into(),
            log,
            stats.clone(),
            SubscriptionSettings::from(&BrokerConfig::default()),
            DurableCursor::default(),
            CancellationToken::new(),
        ));
        let (consumer, mut rx) = sub.attach(&SubscribeOptions::default()).unwrap();
        sub.run_once().await.unwrap();
        let msg = rx.try_recv().unwrap();

        sub.ack(consumer, msg.id).unwrap();
        sub.ack(consumer, msg.id).unwrap();
        assert_eq!(stats.snapshot().stale_acks, 1);
        assert_eq!(stats.snapshot().total_acked, 1);
    }

    #[tokio::test]
    async fn cumulative_ack_rejected_on_shared() {
        let sub = subscription(Arc::new(InMemoryLog::new()));
        let (consumer, _rx) = sub
            .attach(&SubscribeOptions::new(SubscriptionType::Shared))
            .unwrap();
        let err = sub
            .ack_cumulative(consumer, MessageId::single(Position::new(1, 0)))
            .unwrap_err();
        assert!(matches!(
            err,
            BrokerError::CumulativeAckNotAllowed(SubscriptionType::Shared)
        ));
    }

    #[tokio::test]
    async fn flow_violation_restarts_from_durable_cursor() {
        let log = Arc::new(InMemoryLog::new());
        append(&log, 2).await;
        let stats = BrokerStats::new(60);
        let sub = Arc::new(Subscription::new(
            "t".into(),
            "s".into(),
            log,
            stats.clone(),
            SubscriptionSettings::from(&BrokerConfig::default()),
            DurableCursor::default(),
            CancellationToken::new(),
        ));
        let (_, mut rx) = sub.attach(&SubscribeOptions::default()).unwrap();
        sub.run_once().await.unwrap();
        assert_eq!(rx.try_recv().unwrap().redelivery_count, 0);

        {
            let mut st = sub.state.lock();
            sub.restart(
                &mut st,
                DispatchError::FlowControlViolation {
                    consumer: 0,
                    reason: "test".into(),
                },
            );
        }

        // receiver drains, then reports the disconnect
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
        assert_eq!(stats.snapshot().flow_violations, 1);
        assert_eq!(sub.stats().consumers, 0);
        assert_eq!(sub.stats().read_position, Position::EARLIEST);
        assert_eq!(sub.backlog().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn consumer_without_permits_does_not_stall_other_keys() {
        let log = Arc::new(InMemoryLog::new());
        let sub = subscription(log.clone());
        let opts = SubscribeOptions::new(SubscriptionType::KeyShared).with_receiver_queue_size(1);
        let (a, mut rx_a) = sub.attach(&opts).unwrap();
        let (b, mut rx_b) = sub.attach(&opts).unwrap();

        // auto-split picks the consumer at `hash % consumers`
        let ka = key_where(|h| h % 2 == 0);
        let kb = key_where(|h| h % 2 == 1);

        append_keyed(&log, &ka, "a0").await;
        append_keyed(&log, &ka, "a1").await;
        sub.run_once().await.unwrap();
        assert_eq!(payloads(&mut rx_a), ["a0"]);
        assert_eq!(sub.stats().pending_redelivery, 0);

        for i in 0..3 {
            append_keyed(&log, &kb, &format!("b{i}")).await;
        }
        for _ in 0..5 {
            sub.run_once().await.unwrap();
        }
        assert_eq!(payloads(&mut rx_b), ["b0"]);
        assert_eq!(
            sub.state.lock().keys.binding(&Bytes::from(kb.clone())).map(|b| b.consumer),
            Some(b)
        );

        // a1 is still parked for A and keeps its place ahead of later a-keys
        assert!(sub.grant_permits(a, 1));
        sub.run_once().await.unwrap();
        assert_eq!(payloads(&mut rx_a), ["a1"]);
        assert!(sub.grant_permits(b, 1));
        sub.run_once().await.unwrap();
        assert_eq!(payloads(&mut rx_b), ["b1"]);
    }

    #[tokio::test]
    async fn unserved_sticky_key_does_not_stall_covered_keys() {
        let log = Arc::new(InMemoryLog::new());
        let sub = subscription(log.clone());
        let half = HASH_RANGE_SIZE / 2;
        let (consumer, mut rx) = sub
            .attach(
                &SubscribeOptions::new(SubscriptionType::KeyShared)
                    .with_receiver_queue_size(10)
                    .with_key_shared_policy(KeySharedPolicy::sticky(vec![HashRange::new(
                        0,
                        half - 1,
                    )])),
            )
            .unwrap();

        let slot = |h: u64| (h % HASH_RANGE_SIZE as u64) as u32;
        let uncovered = key_where(|h| slot(h) >= half);
        let covered = key_where(|h| slot(h) < half);

        append_keyed(&log, &uncovered, "lost").await;
        sub.run_once().await.unwrap();
        assert!(payloads(&mut rx).is_empty());

        let mut delivered = Vec::new();
        for i in 0..5 {
            delivered.push(append_keyed(&log, &covered, &format!("c{i}")).await);
        }
        for _ in 0..5 {
            sub.run_once().await.unwrap();
        }
        assert_eq!(payloads(&mut rx), ["c0", "c1", "c2", "c3", "c4"]);
        assert_eq!(sub.stats().read_position, Position::new(1, 6));

        for p in delivered {
            sub.ack(consumer, MessageId::single(p)).unwrap();
        }
        assert_eq!(sub.backlog().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn read_ahead_is_bounded_while_keys_are_blocked() {
        let log = Arc::new(InMemoryLog::new());
        let settings = SubscriptionSettings {
            read_batch_size: 4,
            ..SubscriptionSettings::from(&BrokerConfig::default())
        };
        let sub = Arc::new(Subscription::new(
            "t".into(),
            "s".into(),
            log.clone(),
            BrokerStats::new(60),
            settings,
            DurableCursor::default(),
            CancellationToken::new(),
        ));
        let opts = SubscribeOptions::new(SubscriptionType::KeyShared);
        let (_, mut rx_a) = sub.attach(&opts.clone().with_receiver_queue_size(1)).unwrap();
        let (_, mut rx_b) = sub.attach(&opts.with_receiver_queue_size(100)).unwrap();

        // every message belongs to A, which has room for one
        let ka = key_where(|h| h % 2 == 0);
        for i in 0..20 {
            append_keyed(&log, &ka, &format!("m{i}")).await;
        }
        for _ in 0..10 {
            sub.run_once().await.unwrap();
        }

        assert_eq!(payloads(&mut rx_a), ["m0"]);
        assert!(payloads(&mut rx_b).is_empty());
        // two consumers, four per read: at most eight parked
        assert_eq!(sub.state.lock().dispatcher.fresh_len(), 8);
        assert_eq!(sub.stats().read_position, Position::new(1, 9));
    }

    #[tokio::test]
    async fn restored_individual_acks_are_not_redelivered() {
        let log = Arc::new(InMemoryLog::new());
        let positions = append(&log, 3).await;
        let cursor = DurableCursor {
            mark_delete: None,
            individual_acks: vec![positions[1], positions[2]],
        };
        let sub = Arc::new(Subscription::new(
            "t".into(),
            "s".into(),
            log.clone(),
            BrokerStats::new(60),
            SubscriptionSettings::from(&BrokerConfig::default()),
            cursor,
            CancellationToken::new(),
        ));
        assert_eq!(sub.backlog().await.unwrap(), 1);

        let (consumer, mut rx) = sub.attach(&SubscribeOptions::default()).unwrap();
        sub.run_once().await.unwrap();
        let only = rx.try_recv().unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(only.id, MessageId::single(positions[0]));
        assert_eq!(sub.backlog().await.unwrap(), 1);

        sub.ack(consumer, only.id).unwrap();
        sub.run_once().await.unwrap();
        assert_eq!(
            log.mark_delete_position("t", "s").await.unwrap(),
            Some(positions[2])
        );
        assert!(log.individual_acks("t", "s").await.unwrap().is_empty());
        assert_eq!(sub.backlog().await.unwrap(), 0);
    }
}
