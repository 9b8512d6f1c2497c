use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use sable_protocol::{LogicalMessage, MessageId};

use crate::BrokerError;
use crate::dispatch::{ConsumerId, SubscriptionType};
use crate::subscription::Subscription;

/// A message as handed to the application.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub(crate) id: MessageId,
    pub(crate) message: Arc<LogicalMessage>,
    pub(crate) redelivery_count: u32,
}

impl ReceivedMessage {
    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn payload(&self) -> &Bytes {
        &self.message.payload
    }

    pub fn key(&self) -> Option<&str> {
        self.message.key.as_deref()
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.message.properties
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.message.properties.get(name).map(String::as_str)
    }

    pub fn sequence_id(&self) -> Option<u64> {
        self.message.sequence_id
    }

    /// How many times this message went back for redelivery before this copy.
    pub fn redelivery_count(&self) -> u32 {
        self.redelivery_count
    }

    pub fn message(&self) -> &LogicalMessage {
        &self.message
    }
}

// Permits are re-granted once the application has taken half of the
// receiver queue, so the channel never holds more than the queue size.
pub struct ConsumerHandle {
    id: ConsumerId,
    name: String,
    subscription: Arc<Subscription>,
    messages: mpsc::Receiver<ReceivedMessage>,
    receiver_queue_size: u32,
    consumed_since_grant: u32,
    detached: bool,
}

impl ConsumerHandle {
    pub(crate) fn new(
        id: ConsumerId,
        name: String,
        subscription: Arc<Subscription>,
        messages: mpsc::Receiver<ReceivedMessage>,
        receiver_queue_size: u32,
    ) -> Self {
        Self {
            id,
            name,
            subscription,
            messages,
            receiver_queue_size,
            consumed_since_grant: 0,
            detached: false,
        }
    }

    pub fn id(&self) -> ConsumerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic(&self) -> &str {
        self.subscription.topic()
    }

    pub fn subscription(&self) -> &str {
        self.subscription.name()
    }

    pub fn subscription_type(&self) -> SubscriptionType {
        self.subscription.subscription_type()
    }

    /// Next delivered message. None once the consumer has been disconnected
    /// by the broker or the broker shut down.
    pub async fn recv(&mut self) -> Option<ReceivedMessage> {
        let msg = self.messages.recv().await?;
        self.took_one();
        Some(msg)
    }

    pub fn try_recv(&mut self) -> Option<ReceivedMessage> {
        let msg = self.messages.try_recv().ok()?;
        self.took_one();
        Some(msg)
    }

    /// Messages sitting in the receiver queue.
    pub fn queued(&self) -> usize {
        self.messages.len()
    }

    fn took_one(&mut self) {
        self.consumed_since_grant += 1;
        let threshold = (self.receiver_queue_size / 2).max(1);
        if self.consumed_since_grant >= threshold {
            self.subscription
                .grant_permits(self.id, self.consumed_since_grant as u64);
            self.consumed_since_grant = 0;
        }
    }

    /// Acknowledge one message. Duplicate and stale acks are ignored.
    pub fn ack(&self, id: MessageId) -> Result<(), BrokerError> {
        self.subscription.ack(self.id, id)
    }

    /// Acknowledge `id` and everything before it. Exclusive and Failover only.
    pub fn ack_cumulative(&self, id: MessageId) -> Result<(), BrokerError> {
        self.subscription.ack_cumulative(self.id, id)
    }

    pub fn negative_ack(&self, id: MessageId) -> Result<(), BrokerError> {
        self.subscription.negative_ack(self.id, id)
    }

    /// Send every message this consumer holds unacknowledged back for
    /// redelivery. Returns how many were requeued.
    pub fn redeliver_unacknowledged(&self) -> usize {
        self.subscription.redeliver_unacknowledged(self.id)
    }

    /// Extra permits on top of the receiver-queue flow control.
    pub fn grant_permits(&self, permits: u64) -> bool {
        self.subscription.grant_permits(self.id, permits)
    }

    pub fn close(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if !self.detached {
            self.detached = true;
            self.subscription.detach(self.id);
        }
    }
}

impl std::fmt::Debug for ConsumerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("topic", &self.subscription.topic())
            .field("subscription", &self.subscription.name())
            .finish()
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        self.detach();
    }
}
