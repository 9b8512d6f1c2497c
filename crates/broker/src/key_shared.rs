use std::collections::{BTreeMap, HashMap};
use std::fmt;

use bytes::Bytes;
use xxhash_rust::xxh3::xxh3_64;

use sable_protocol::MessageId;

use crate::dispatch::ConsumerId;

/// Size of the sticky hash space. Sticky ranges are inclusive slices of
/// `0..HASH_RANGE_SIZE`.
pub const HASH_RANGE_SIZE: u32 = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashRange {
    pub start: u32,
    pub end: u32,
}

impl HashRange {
    pub const fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub const fn contains(&self, slot: u32) -> bool {
        self.start <= slot && slot <= self.end
    }

    pub const fn overlaps(&self, other: &HashRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    const fn is_valid(&self) -> bool {
        self.start <= self.end && self.end < HASH_RANGE_SIZE
    }
}

impl fmt::Display for HashRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum KeySharedMode {
    /// Keys are spread by hash over whichever consumers are attached.
    #[default]
    AutoSplit,
    /// Each consumer declares the hash ranges it serves.
    Sticky { ranges: Vec<HashRange> },
}

impl KeySharedMode {
    fn name(&self) -> &'static str {
        match self {
            KeySharedMode::AutoSplit => "AUTO_SPLIT",
            KeySharedMode::Sticky { .. } => "STICKY",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeySharedPolicy {
    pub mode: KeySharedMode,
    pub allow_out_of_order_delivery: bool,
}

impl KeySharedPolicy {
    pub fn auto_split() -> Self {
        Self::default()
    }

    pub fn sticky(ranges: Vec<HashRange>) -> Self {
        Self {
            mode: KeySharedMode::Sticky { ranges },
            allow_out_of_order_delivery: false,
        }
    }

    pub fn with_allow_out_of_order_delivery(self, allow: bool) -> Self {
        Self {
            allow_out_of_order_delivery: allow,
            ..self
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct SubscriptionBusy(pub String);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyBindError {
    #[error("consumer {0} is not attached")]
    UnknownConsumer(ConsumerId),

    #[error("key is bound to live consumer {owner}")]
    AlreadyBound { owner: ConsumerId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyBinding {
    pub consumer: ConsumerId,
    pub last_delivered: Option<MessageId>,
}

/// Key → consumer ownership for one Key_Shared subscription.
///
/// A binding is created on first resolution of a key and only dropped when
/// its consumer detaches.
#[derive(Debug, Default)]
pub struct KeyOrderingIndex {
    policy: Option<KeySharedPolicy>,
    consumers: BTreeMap<ConsumerId, Vec<HashRange>>,
    bindings: HashMap<Bytes, KeyBinding>,
}

impl KeyOrderingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscription-wide compatibility check for a connecting consumer.
    pub fn attach(
        &mut self,
        consumer: ConsumerId,
        policy: &KeySharedPolicy,
    ) -> Result<(), SubscriptionBusy> {
        if let Some(active) = &self.policy {
            if active.mode.name() != policy.mode.name() {
                return Err(SubscriptionBusy(format!(
                    "Subscription is of different type. Active subscription key_shared mode of \
                     '{}' is different than the connecting consumer's key_shared mode '{}'.",
                    active.mode.name(),
                    policy.mode.name()
                )));
            }
            if active.allow_out_of_order_delivery != policy.allow_out_of_order_delivery {
                return Err(SubscriptionBusy(format!(
                    "Subscription is of different type. Active subscription key_shared value of \
                     'allowOutOfOrderDelivery={}' is different than the connecting consumer's \
                     value 'allowOutOfOrderDelivery={}'.",
                    active.allow_out_of_order_delivery, policy.allow_out_of_order_delivery
                )));
            }
        }

        let ranges = match &policy.mode {
            KeySharedMode::AutoSplit => Vec::new(),
            KeySharedMode::Sticky { ranges } => {
                self.check_ranges(ranges)?;
                ranges.clone()
            }
        };

        if self.policy.is_none() {
            self.policy = Some(policy.clone());
        }
        self.consumers.insert(consumer, ranges);
        Ok(())
    }

    fn check_ranges(&self, ranges: &[HashRange]) -> Result<(), SubscriptionBusy> {
        if ranges.is_empty() {
            return Err(SubscriptionBusy(
                "Ranges for KeyShared policy must not be empty.".into(),
            ));
        }
        for (i, r) in ranges.iter().enumerate() {
            if !r.is_valid() {
                return Err(SubscriptionBusy(format!(
                    "Invalid range {r}, must be within [0, {}]",
                    HASH_RANGE_SIZE - 1
                )));
            }
            if let Some(other) = ranges[..i].iter().find(|o| o.overlaps(r)) {
                return Err(SubscriptionBusy(format!(
                    "Ranges {other} and {r} of the same consumer overlap"
                )));
            }
            for (owner, owned) in &self.consumers {
                if let Some(o) = owned.iter().find(|o| o.overlaps(r)) {
                    return Err(SubscriptionBusy(format!(
                        "Range conflict with consumer {owner}: {r} overlaps {o}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Drop a consumer and all of its bindings. Returns the number of keys
    /// that became unbound.
    pub fn detach(&mut self, consumer: ConsumerId) -> usize {
        if self.consumers.remove(&consumer).is_none() {
            return 0;
        }
        let before = self.bindings.len();
        self.bindings.retain(|_, b| b.consumer != consumer);
        if self.consumers.is_empty() {
            self.policy = None;
        }
        before - self.bindings.len()
    }

    pub fn bind(&mut self, key: Bytes, consumer: ConsumerId) -> Result<(), KeyBindError> {
        if !self.consumers.contains_key(&consumer) {
            return Err(KeyBindError::UnknownConsumer(consumer));
        }
        match self.bindings.get(&key) {
            Some(b) if b.consumer != consumer => Err(KeyBindError::AlreadyBound {
                owner: b.consumer,
            }),
            Some(_) => Ok(()),
            None => {
                self.bindings.insert(
                    key,
                    KeyBinding {
                        consumer,
                        last_delivered: None,
                    },
                );
                Ok(())
            }
        }
    }

    /// Consumer owning `key`, binding it on first use. None when no attached
    /// consumer can serve the key.
    pub fn resolve(&mut self, key: &Bytes) -> Option<ConsumerId> {
        if let Some(b) = self.bindings.get(key) {
            return Some(b.consumer);
        }

        let hash = xxh3_64(key);
        let consumer = match self.policy.as_ref().map(|p| &p.mode) {
            Some(KeySharedMode::Sticky { .. }) => {
                let slot = (hash % HASH_RANGE_SIZE as u64) as u32;
                self.consumers
                    .iter()
                    .find(|(_, ranges)| ranges.iter().any(|r| r.contains(slot)))
                    .map(|(id, _)| *id)
            }
            _ => {
                let n = self.consumers.len() as u64;
                if n == 0 {
                    None
                } else {
                    self.consumers.keys().nth((hash % n) as usize).copied()
                }
            }
        }?;

        self.bindings.insert(
            key.clone(),
            KeyBinding {
                consumer,
                last_delivered: None,
            },
        );
        Some(consumer)
    }

    pub fn record_delivery(&mut self, key: &Bytes, id: MessageId) {
        if let Some(b) = self.bindings.get_mut(key) {
            if b.last_delivered.is_none_or(|last| id > last) {
                b.last_delivered = Some(id);
            }
        }
    }

    pub fn last_delivered(&self, key: &Bytes) -> Option<MessageId> {
        self.bindings.get(key).and_then(|b| b.last_delivered)
    }

    pub fn binding(&self, key: &Bytes) -> Option<KeyBinding> {
        self.bindings.get(key).copied()
    }

    pub fn policy(&self) -> Option<&KeySharedPolicy> {
        self.policy.as_ref()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    pub fn bound_keys(&self) -> usize {
        self.bindings.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sable_protocol::Position;

    fn key(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn resolution_is_sticky_until_detach() {
        let mut idx = KeyOrderingIndex::new();
        idx.attach(1, &KeySharedPolicy::auto_split()).unwrap();
        idx.attach(2, &KeySharedPolicy::auto_split()).unwrap();

        let keys: Vec<_> = (0..50).map(|i| key(&format!("key-{i}"))).collect();
        let first: Vec<_> = keys.iter().map(|k| idx.resolve(k).unwrap()).collect();

        // A new consumer does not move existing keys.
        idx.attach(3, &KeySharedPolicy::auto_split()).unwrap();
        let again: Vec<_> = keys.iter().map(|k| idx.resolve(k).unwrap()).collect();
        assert_eq!(first, again);
        assert!(first.contains(&1) && first.contains(&2));

        let owned_by_1 = first.iter().filter(|c| **c == 1).count();
        assert_eq!(idx.detach(1), owned_by_1);
        for k in &keys {
            assert_ne!(idx.resolve(k), Some(1));
        }
    }

    #[test]
    fn bind_rejects_foreign_live_owner() {
        let mut idx = KeyOrderingIndex::new();
        idx.attach(1, &KeySharedPolicy::auto_split()).unwrap();
        idx.attach(2, &KeySharedPolicy::auto_split()).unwrap();

        idx.bind(key("a"), 1).unwrap();
        idx.bind(key("a"), 1).unwrap();
        assert_eq!(
            idx.bind(key("a"), 2),
            Err(KeyBindError::AlreadyBound { owner: 1 })
        );
        assert_eq!(idx.bind(key("b"), 9), Err(KeyBindError::UnknownConsumer(9)));

        idx.detach(1);
        idx.bind(key("a"), 2).unwrap();
        assert_eq!(idx.resolve(&key("a")), Some(2));
    }

    #[test]
    fn mode_mismatch_is_busy_and_leaves_existing_consumers() {
        let mut idx = KeyOrderingIndex::new();
        idx.attach(1, &KeySharedPolicy::auto_split()).unwrap();
        let k = key("x");
        assert_eq!(idx.resolve(&k), Some(1));

        let err = idx
            .attach(2, &KeySharedPolicy::sticky(vec![HashRange::new(0, 100)]))
            .unwrap_err();
        assert!(err.0.contains("'AUTO_SPLIT'"), "{err}");
        assert!(err.0.contains("'STICKY'"), "{err}");

        let err = idx
            .attach(
                3,
                &KeySharedPolicy::auto_split().with_allow_out_of_order_delivery(true),
            )
            .unwrap_err();
        assert!(err.0.contains("allowOutOfOrderDelivery"), "{err}");

        assert_eq!(idx.consumer_count(), 1);
        assert_eq!(idx.resolve(&k), Some(1));
    }

    #[test]
    fn sticky_ranges_route_and_must_not_overlap() {
        let mut idx = KeyOrderingIndex::new();
        idx.attach(
            1,
            &KeySharedPolicy::sticky(vec![HashRange::new(0, HASH_RANGE_SIZE / 2 - 1)]),
        )
        .unwrap();
        idx.attach(
            2,
            &KeySharedPolicy::sticky(vec![HashRange::new(HASH_RANGE_SIZE / 2, HASH_RANGE_SIZE - 1)]),
        )
        .unwrap();

        assert!(
            idx.attach(3, &KeySharedPolicy::sticky(vec![HashRange::new(10, 20)]))
                .unwrap_err()
                .0
                .contains("Range conflict")
        );
        assert!(
            idx.attach(3, &KeySharedPolicy::sticky(vec![HashRange::new(5, HASH_RANGE_SIZE)]))
                .is_err()
        );
        assert!(idx.attach(3, &KeySharedPolicy::sticky(vec![])).is_err());

        for i in 0..20 {
            let k = key(&format!("k{i}"));
            let slot = (xxh3_64(&k) % HASH_RANGE_SIZE as u64) as u32;
            let expected = if slot < HASH_RANGE_SIZE / 2 { 1 } else { 2 };
            assert_eq!(idx.resolve(&k), Some(expected));
        }
    }

    #[test]
    fn sticky_gap_leaves_key_unserved() {
        let mut idx = KeyOrderingIndex::new();
        // one slot only; almost every key misses it
        idx.attach(1, &KeySharedPolicy::sticky(vec![HashRange::new(7, 7)]))
            .unwrap();
        let unserved = (0..20)
            .map(|i| key(&format!("k{i}")))
            .filter(|k| (xxh3_64(k) % HASH_RANGE_SIZE as u64) != 7)
            .collect::<Vec<_>>();
        assert!(!unserved.is_empty());
        for k in &unserved {
            assert_eq!(idx.resolve(k), None);
        }
        assert_eq!(idx.bound_keys(), 0);
    }

    #[test]
    fn last_delivered_only_moves_forward() {
        let mut idx = KeyOrderingIndex::new();
        idx.attach(1, &KeySharedPolicy::auto_split()).unwrap();
        let k = key("a");
        idx.resolve(&k);

        let p = Position::new(1, 3);
        idx.record_delivery(&k, MessageId::new(p, 2, 5));
        idx.record_delivery(&k, MessageId::new(p, 1, 5));
        assert_eq!(idx.last_delivered(&k), Some(MessageId::new(p, 2, 5)));
    }

    #[test]
    fn policy_resets_when_last_consumer_leaves() {
        let mut idx = KeyOrderingIndex::new();
        idx.attach(1, &KeySharedPolicy::auto_split()).unwrap();
        idx.detach(1);
        assert!(idx.policy().is_none());
        idx.attach(2, &KeySharedPolicy::sticky(vec![HashRange::new(0, 10)]))
            .unwrap();
    }
}
