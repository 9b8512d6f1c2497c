use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use sable_protocol::{LogicalMessage, MessageId};

use crate::key_shared::KeyOrderingIndex;

pub type ConsumerId = u64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionType {
    #[default]
    Exclusive,
    Failover,
    Shared,
    KeyShared,
}

impl SubscriptionType {
    pub fn allows_cumulative_ack(self) -> bool {
        matches!(self, SubscriptionType::Exclusive | SubscriptionType::Failover)
    }
}

impl fmt::Display for SubscriptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubscriptionType::Exclusive => "Exclusive",
            SubscriptionType::Failover => "Failover",
            SubscriptionType::Shared => "Shared",
            SubscriptionType::KeyShared => "Key_Shared",
        };
        f.write_str(s)
    }
}

/// One logical message waiting for, or in, delivery.
#[derive(Debug, Clone)]
pub struct DispatchUnit {
    pub id: MessageId,
    pub message: Arc<LogicalMessage>,
    pub redelivery_count: u32,
}

impl DispatchUnit {
    pub fn new(id: MessageId, message: Arc<LogicalMessage>) -> Self {
        Self {
            id,
            message,
            redelivery_count: 0,
        }
    }

    /// Key used for Key_Shared routing. Messages without any key share one
    /// empty key.
    pub fn routing_key(&self) -> Bytes {
        self.message.ordering_bytes().unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub consumer: ConsumerId,
    pub unit: DispatchUnit,
    /// Stamped per delivery so a late ack-timeout for an earlier delivery of
    /// the same message can be told apart.
    pub delivery_seq: u64,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("flow control violation for consumer {consumer}: {reason}")]
    FlowControlViolation { consumer: ConsumerId, reason: String },
}

#[derive(Debug)]
struct Outstanding {
    unit: DispatchUnit,
    delivery_seq: u64,
}

#[derive(Debug, Default)]
struct ConsumerFlowState {
    available_permits: u64,
    granted_total: u64,
    outstanding: VecDeque<Outstanding>,
}

impl ConsumerFlowState {
    fn take(&mut self, id: MessageId) -> Option<Outstanding> {
        let idx = self.outstanding.iter().position(|o| o.unit.id == id)?;
        self.outstanding.remove(idx)
    }
}

/// Permit-bounded assignment of messages to consumers. Pure state machine:
/// the caller moves deliveries onto consumer channels.
///
/// Units waiting for redelivery are kept ordered by id and always go out
/// before fresh units.
#[derive(Debug)]
pub struct Dispatcher {
    sub_type: SubscriptionType,
    // Ids are handed out in attach order, so the first entry is the
    // longest-attached consumer.
    consumers: BTreeMap<ConsumerId, ConsumerFlowState>,
    fresh: VecDeque<DispatchUnit>,
    redelivery: BTreeMap<MessageId, DispatchUnit>,
    rr_next: ConsumerId,
    next_delivery_seq: u64,
}

impl Dispatcher {
    pub fn new(sub_type: SubscriptionType) -> Self {
        Self {
            sub_type,
            consumers: BTreeMap::new(),
            fresh: VecDeque::new(),
            redelivery: BTreeMap::new(),
            rr_next: 0,
            next_delivery_seq: 0,
        }
    }

    pub fn subscription_type(&self) -> SubscriptionType {
        self.sub_type
    }

    /// Only possible while no consumer is attached.
    pub fn set_subscription_type(&mut self, sub_type: SubscriptionType) -> bool {
        if !self.consumers.is_empty() {
            return false;
        }
        self.sub_type = sub_type;
        true
    }

    pub fn add_consumer(&mut self, consumer: ConsumerId) -> bool {
        if self.consumers.contains_key(&consumer) {
            return false;
        }
        self.consumers.insert(consumer, ConsumerFlowState::default());
        true
    }

    /// Detach a consumer. Its outstanding messages go back for redelivery;
    /// returns how many.
    pub fn remove_consumer(&mut self, consumer: ConsumerId) -> usize {
        let Some(state) = self.consumers.remove(&consumer) else {
            return 0;
        };
        let n = state.outstanding.len();
        for o in state.outstanding {
            self.requeue(o.unit);
        }
        n
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// The consumer receiving the stream for Exclusive and Failover.
    pub fn active_consumer(&self) -> Option<ConsumerId> {
        self.consumers.keys().next().copied()
    }

    pub fn grant_permits(&mut self, consumer: ConsumerId, permits: u64) -> bool {
        match self.consumers.get_mut(&consumer) {
            Some(state) => {
                state.available_permits += permits;
                state.granted_total += permits;
                true
            }
            None => false,
        }
    }

    pub fn enqueue(&mut self, units: impl IntoIterator<Item = DispatchUnit>) {
        self.fresh.extend(units);
    }

    pub fn fresh_len(&self) -> usize {
        self.fresh.len()
    }

    pub fn pending_redelivery(&self) -> usize {
        self.redelivery.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.fresh.is_empty() || !self.redelivery.is_empty()
    }

    pub fn available_permits(&self, consumer: ConsumerId) -> u64 {
        self.consumers
            .get(&consumer)
            .map_or(0, |s| s.available_permits)
    }

    /// Permits usable right now: the active consumer's for Exclusive and
    /// Failover, everyone's otherwise.
    pub fn total_available_permits(&self) -> u64 {
        match self.sub_type {
            SubscriptionType::Exclusive | SubscriptionType::Failover => self
                .active_consumer()
                .map_or(0, |c| self.available_permits(c)),
            SubscriptionType::Shared | SubscriptionType::KeyShared => {
                self.consumers.values().map(|s| s.available_permits).sum()
            }
        }
    }

    pub fn outstanding(&self, consumer: ConsumerId) -> usize {
        self.consumers
            .get(&consumer)
            .map_or(0, |s| s.outstanding.len())
    }

    pub fn total_unacked(&self) -> usize {
        self.consumers.values().map(|s| s.outstanding.len()).sum()
    }

    pub fn dispatch(
        &mut self,
        keys: &mut KeyOrderingIndex,
    ) -> Result<Vec<Delivery>, DispatchError> {
        let mut out = Vec::new();
        if self.consumers.is_empty() || !self.has_pending() {
            return Ok(out);
        }

        match self.sub_type {
            SubscriptionType::Exclusive | SubscriptionType::Failover => {
                self.dispatch_single_active(&mut out)?
            }
            SubscriptionType::Shared => self.dispatch_shared(&mut out)?,
            SubscriptionType::KeyShared => self.dispatch_key_shared(keys, &mut out)?,
        }
        Ok(out)
    }

    fn dispatch_single_active(&mut self, out: &mut Vec<Delivery>) -> Result<(), DispatchError> {
        let Some(active) = self.active_consumer() else {
            return Ok(());
        };
        while self.available_permits(active) > 0 {
            let Some(unit) = self.next_unit() else { break };
            self.deliver(active, unit, out)?;
        }
        Ok(())
    }

    fn dispatch_shared(&mut self, out: &mut Vec<Delivery>) -> Result<(), DispatchError> {
        while self.has_pending() {
            let Some(consumer) = self.next_round_robin() else {
                break;
            };
            let Some(unit) = self.next_unit() else { break };
            self.deliver(consumer, unit, out)?;
            self.rr_next = consumer + 1;
        }
        Ok(())
    }

    /// A key is blocked for the rest of the pass as soon as one of its units
    /// cannot go out, so later units of that key never overtake it.
    fn dispatch_key_shared(
        &mut self,
        keys: &mut KeyOrderingIndex,
        out: &mut Vec<Delivery>,
    ) -> Result<(), DispatchError> {
        let mut blocked: HashSet<Bytes> = HashSet::new();

        let waiting: Vec<MessageId> = self.redelivery.keys().copied().collect();
        for id in waiting {
            if self.total_available_permits() == 0 {
                return Ok(());
            }
            let Some(key) = self.redelivery.get(&id).map(DispatchUnit::routing_key) else {
                continue;
            };
            if blocked.contains(&key) {
                continue;
            }
            match keys.resolve(&key) {
                Some(c) if self.available_permits(c) > 0 => {
                    if let Some(unit) = self.redelivery.remove(&id) {
                        keys.record_delivery(&key, unit.id);
                        self.deliver(c, unit, out)?;
                    }
                }
                _ => {
                    blocked.insert(key);
                }
            }
        }

        let mut kept = VecDeque::with_capacity(self.fresh.len());
        while let Some(unit) = self.fresh.pop_front() {
            if self.total_available_permits() == 0 {
                kept.push_back(unit);
                kept.extend(self.fresh.drain(..));
                break;
            }
            let key = unit.routing_key();
            if blocked.contains(&key) {
                kept.push_back(unit);
                continue;
            }
            match keys.resolve(&key) {
                Some(c) if self.available_permits(c) > 0 => {
                    keys.record_delivery(&key, unit.id);
                    self.deliver(c, unit, out)?;
                }
                _ => {
                    blocked.insert(key);
                    kept.push_back(unit);
                }
            }
        }
        self.fresh = kept;
        Ok(())
    }

    fn next_unit(&mut self) -> Option<DispatchUnit> {
        match self.redelivery.pop_first() {
            Some((_, unit)) => Some(unit),
            None => self.fresh.pop_front(),
        }
    }

    fn next_round_robin(&self) -> Option<ConsumerId> {
        self.consumers
            .range(self.rr_next..)
            .chain(self.consumers.range(..self.rr_next))
            .find(|(_, s)| s.available_permits > 0)
            .map(|(id, _)| *id)
    }

    fn deliver(
        &mut self,
        consumer: ConsumerId,
        unit: DispatchUnit,
        out: &mut Vec<Delivery>,
    ) -> Result<(), DispatchError> {
        let violation = |reason: String| DispatchError::FlowControlViolation { consumer, reason };

        let Some(state) = self.consumers.get_mut(&consumer) else {
            return Err(violation("consumer not attached".into()));
        };
        if state.available_permits == 0 {
            return Err(violation(format!("no permits left for {}", unit.id)));
        }
        state.available_permits -= 1;

        let delivery_seq = self.next_delivery_seq;
        self.next_delivery_seq += 1;

        state.outstanding.push_back(Outstanding {
            unit: unit.clone(),
            delivery_seq,
        });
        let in_use = state.outstanding.len() as u64 + state.available_permits;
        if in_use > state.granted_total {
            return Err(violation(format!(
                "{} outstanding with {} permits left exceeds {} granted",
                state.outstanding.len(),
                state.available_permits,
                state.granted_total
            )));
        }

        out.push(Delivery {
            consumer,
            unit,
            delivery_seq,
        });
        Ok(())
    }

    fn requeue(&mut self, mut unit: DispatchUnit) {
        unit.redelivery_count += 1;
        self.redelivery.entry(unit.id).or_insert(unit);
    }

    /// Put a unit taken with [`take_outstanding`](Self::take_outstanding) back
    /// for redelivery.
    pub fn requeue_unit(&mut self, unit: DispatchUnit) {
        self.requeue(unit);
    }

    fn take_any(&mut self, consumer: ConsumerId, id: MessageId) -> Option<Outstanding> {
        if let Some(o) = self.consumers.get_mut(&consumer).and_then(|s| s.take(id)) {
            return Some(o);
        }
        // Acks may arrive from a consumer other than the one holding the unit.
        self.consumers.values_mut().find_map(|s| s.take(id))
    }

    /// Individual ack. Returns whether the message was outstanding or waiting
    /// for redelivery.
    pub fn on_ack(&mut self, consumer: ConsumerId, id: MessageId) -> bool {
        let was_outstanding = self.take_any(consumer, id).is_some();
        let was_waiting = self.redelivery.remove(&id).is_some();
        was_outstanding || was_waiting
    }

    /// Cumulative ack: forget everything at or before `id`. Returns the
    /// number of outstanding or waiting units removed.
    pub fn on_ack_cumulative(&mut self, _consumer: ConsumerId, id: MessageId) -> usize {
        let mut removed = 0;
        for state in self.consumers.values_mut() {
            let before = state.outstanding.len();
            state.outstanding.retain(|o| o.unit.id > id);
            removed += before - state.outstanding.len();
        }

        let keep = match id.batch_index.checked_add(1) {
            Some(next_index) => MessageId::new(id.position, next_index, 0),
            None => MessageId::new(id.position.next(), 0, 0),
        };
        let above = self.redelivery.split_off(&keep);
        removed += self.redelivery.len();
        self.redelivery = above;

        self.fresh.retain(|u| u.id > id);
        removed
    }

    /// Remove an outstanding unit without requeueing it.
    pub fn take_outstanding(&mut self, consumer: ConsumerId, id: MessageId) -> Option<DispatchUnit> {
        self.take_any(consumer, id).map(|o| o.unit)
    }

    pub fn negative_ack(&mut self, consumer: ConsumerId, id: MessageId) -> bool {
        match self.take_any(consumer, id) {
            Some(o) => {
                self.requeue(o.unit);
                true
            }
            None => false,
        }
    }

    /// Requeue everything the consumer holds. Returns how many.
    pub fn redeliver_unacknowledged(&mut self, consumer: ConsumerId) -> usize {
        let Some(state) = self.consumers.get_mut(&consumer) else {
            return 0;
        };
        let drained: Vec<_> = state.outstanding.drain(..).collect();
        let n = drained.len();
        for o in drained {
            self.requeue(o.unit);
        }
        n
    }

    /// Ack-timeout for one specific delivery. A no-op unless the unit is still
    /// outstanding at `consumer` under the same `delivery_seq`.
    pub fn on_ack_timeout(
        &mut self,
        consumer: ConsumerId,
        id: MessageId,
        delivery_seq: u64,
    ) -> bool {
        let Some(state) = self.consumers.get_mut(&consumer) else {
            return false;
        };
        let Some(idx) = state
            .outstanding
            .iter()
            .position(|o| o.unit.id == id && o.delivery_seq == delivery_seq)
        else {
            return false;
        };
        match state.outstanding.remove(idx) {
            Some(o) => {
                self.requeue(o.unit);
                true
            }
            None => false,
        }
    }
}
