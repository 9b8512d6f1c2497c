use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use sable_storage::Position;
use sable_util::{UnixMillis, unix_millis};

/// One application message as produced and consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalMessage {
    pub payload: Bytes,
    pub properties: BTreeMap<String, String>,
    /// Publish key.
    pub key: Option<String>,
    /// Overrides `key` for ordering and key-shared routing.
    pub ordering_key: Option<Bytes>,
    pub sequence_id: Option<u64>,
    pub publish_time: UnixMillis,
}

impl LogicalMessage {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            properties: BTreeMap::new(),
            key: None,
            ordering_key: None,
            sequence_id: None,
            publish_time: unix_millis(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_ordering_key(mut self, ordering_key: impl Into<Bytes>) -> Self {
        self.ordering_key = Some(ordering_key.into());
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn with_sequence_id(mut self, sequence_id: u64) -> Self {
        self.sequence_id = Some(sequence_id);
        self
    }

    /// Bytes used to route and order this message: the ordering key if set,
    /// else the publish key.
    pub fn ordering_bytes(&self) -> Option<Bytes> {
        match (&self.ordering_key, &self.key) {
            (Some(ok), _) => Some(ok.clone()),
            (None, Some(k)) => Some(Bytes::copy_from_slice(k.as_bytes())),
            (None, None) => None,
        }
    }

    /// Uncompressed size counted against batch and message limits.
    pub fn size(&self) -> usize {
        let props: usize = self
            .properties
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum();
        self.payload.len()
            + props
            + self.key.as_ref().map_or(0, String::len)
            + self.ordering_key.as_ref().map_or(0, Bytes::len)
    }
}

/// Everything about a message except its payload, as stored in an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct MessageMetadata {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub ordering_key: Option<Bytes>,
    #[serde(default)]
    pub sequence_id: Option<u64>,
    pub publish_time: UnixMillis,
}

impl MessageMetadata {
    pub(crate) fn of(msg: &LogicalMessage) -> Self {
        Self {
            properties: msg.properties.clone(),
            key: msg.key.clone(),
            ordering_key: msg.ordering_key.clone(),
            sequence_id: msg.sequence_id,
            publish_time: msg.publish_time,
        }
    }

    pub(crate) fn into_message(self, payload: Bytes) -> LogicalMessage {
        LogicalMessage {
            payload,
            properties: self.properties,
            key: self.key,
            ordering_key: self.ordering_key,
            sequence_id: self.sequence_id,
            publish_time: self.publish_time,
        }
    }
}

/// Identifies one logical message in a topic: its entry plus its index in
/// that entry. Ordered by position, then batch index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId {
    pub position: Position,
    pub batch_index: u32,
    pub batch_size: u32,
}

impl MessageId {
    pub const fn new(position: Position, batch_index: u32, batch_size: u32) -> Self {
        Self {
            position,
            batch_index,
            batch_size,
        }
    }

    /// Id of the message stored alone in its entry.
    pub const fn single(position: Position) -> Self {
        Self::new(position, 0, 1)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{}",
            self.position, self.batch_index, self.batch_size
        )
    }
}

/// A message recovered from an entry, with its place in that entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMessage {
    pub batch_index: u32,
    pub batch_size: u32,
    pub message: LogicalMessage,
}

impl DecodedMessage {
    pub fn id(&self, position: Position) -> MessageId {
        MessageId::new(position, self.batch_index, self.batch_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_key_wins_over_publish_key() {
        let m = LogicalMessage::new("x").with_key("k1");
        assert_eq!(m.ordering_bytes(), Some(Bytes::from_static(b"k1")));

        let m = m.with_ordering_key(Bytes::from_static(b"ok"));
        assert_eq!(m.ordering_bytes(), Some(Bytes::from_static(b"ok")));

        assert_eq!(LogicalMessage::new("x").ordering_bytes(), None);
    }

    #[test]
    fn message_ids_order_by_position_then_index() {
        let p1 = Position::new(1, 1);
        let p2 = Position::new(1, 2);
        assert!(MessageId::new(p1, 9, 10) < MessageId::new(p2, 0, 10));
        assert!(MessageId::new(p1, 1, 10) < MessageId::new(p1, 2, 10));
        assert!(MessageId::single(p1) < MessageId::single(p2));
    }

    #[test]
    fn size_counts_metadata() {
        let m = LogicalMessage::new(vec![0u8; 10])
            .with_key("abc")
            .with_property("p", "vv");
        assert_eq!(m.size(), 10 + 3 + 3);
    }
}
