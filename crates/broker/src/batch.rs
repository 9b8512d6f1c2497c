use std::collections::HashMap;

use bytes::Bytes;
use tokio::time::Instant;

use sable_protocol::{CodecError, CompressionType, EntryCodec, LogicalMessage};

use crate::config::{BatchConfig, BatchingPolicy};

/// Messages that leave the container together as one physical entry.
///
/// `messages[i]` gets batch index `i`; `tokens[i]` is the completion token
/// handed in with it.
#[derive(Debug)]
pub struct FlushedBatch<T> {
    pub messages: Vec<LogicalMessage>,
    pub tokens: Vec<T>,
    /// False for messages flushed with batching disabled; those are encoded
    /// without a batch header.
    pub batched: bool,
}

impl<T> FlushedBatch<T> {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn batch_size(&self) -> u32 {
        self.messages.len() as u32
    }

    pub fn encode(&self, compression: CompressionType) -> Result<Bytes, CodecError> {
        match (self.batched, self.messages.as_slice()) {
            (false, [single]) => EntryCodec::encode_single(single),
            _ => EntryCodec::encode_batch(&self.messages, compression),
        }
    }
}

/// A message rejected for exceeding the per-message hard cap.
#[derive(Debug)]
pub struct Oversize<T> {
    pub size: usize,
    pub limit: usize,
    pub token: T,
}

#[derive(Debug)]
struct Partition<T> {
    key: Option<Bytes>,
    items: Vec<(LogicalMessage, T)>,
}

/// Producer-side accumulator.
///
/// Count and byte limits apply to the whole container, also under
/// [`BatchingPolicy::KeyBased`] where pending messages are split into one
/// partition per ordering key (first-appearance order, FIFO within a key).
#[derive(Debug)]
pub struct BatchContainer<T> {
    config: BatchConfig,
    partitions: Vec<Partition<T>>,
    index: HashMap<Option<Bytes>, usize>,
    count: usize,
    bytes: usize,
    first_added: Option<Instant>,
    next_sequence_id: u64,
}

impl<T> BatchContainer<T> {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            partitions: Vec::new(),
            index: HashMap::new(),
            count: 0,
            bytes: 0,
            first_added: None,
            next_sequence_id: 0,
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn pending_bytes(&self) -> usize {
        self.bytes
    }

    /// When the current batch must be flushed by the delay timer.
    pub fn deadline(&self) -> Option<Instant> {
        self.first_added.map(|t| t + self.config.max_delay())
    }

    /// Add one message. `Ok` means accepted and carries any entries that had
    /// to be flushed (possibly including this message); `Err` rejects the
    /// message without touching pending state.
    pub fn add(
        &mut self,
        msg: LogicalMessage,
        token: T,
    ) -> Result<Vec<FlushedBatch<T>>, Oversize<T>> {
        let size = msg.size();
        if size > self.config.max_message_size {
            return Err(Oversize {
                size,
                limit: self.config.max_message_size,
                token,
            });
        }

        if !self.config.enabled {
            let mut messages = vec![msg];
            self.assign_sequence_ids(&mut messages);
            return Ok(vec![FlushedBatch {
                messages,
                tokens: vec![token],
                batched: false,
            }]);
        }

        let mut flushed = Vec::new();
        if self.count > 0 && self.would_overflow(size) {
            flushed.extend(self.flush());
        }

        let key = match self.config.policy {
            BatchingPolicy::Default => None,
            BatchingPolicy::KeyBased => msg.ordering_bytes(),
        };
        let slot = match self.index.get(&key) {
            Some(&i) => i,
            None => {
                self.partitions.push(Partition {
                    key: key.clone(),
                    items: Vec::new(),
                });
                self.index.insert(key, self.partitions.len() - 1);
                self.partitions.len() - 1
            }
        };
        self.partitions[slot].items.push((msg, token));

        self.count += 1;
        self.bytes += size;
        if self.first_added.is_none() {
            self.first_added = Some(Instant::now());
        }

        if self.is_full() {
            flushed.extend(self.flush());
        }

        Ok(flushed)
    }

    /// Drain everything pending, one entry per partition.
    pub fn flush(&mut self) -> Vec<FlushedBatch<T>> {
        let partitions = std::mem::take(&mut self.partitions);
        self.index.clear();
        self.count = 0;
        self.bytes = 0;
        self.first_added = None;

        partitions
            .into_iter()
            .filter(|p| !p.items.is_empty())
            .map(|p| {
                tracing::trace!(key = ?p.key, count = p.items.len(), "flushing partition");
                let (mut messages, tokens): (Vec<_>, Vec<_>) = p.items.into_iter().unzip();
                self.assign_sequence_ids(&mut messages);
                FlushedBatch {
                    messages,
                    tokens,
                    batched: true,
                }
            })
            .collect()
    }

    fn would_overflow(&self, size: usize) -> bool {
        let max_messages = self.config.max_messages;
        let max_bytes = self.config.max_bytes;
        (max_messages > 0 && self.count + 1 > max_messages)
            || (max_bytes > 0 && self.bytes + size > max_bytes)
    }

    fn is_full(&self) -> bool {
        let max_messages = self.config.max_messages;
        let max_bytes = self.config.max_bytes;
        (max_messages > 0 && self.count >= max_messages)
            || (max_bytes > 0 && self.bytes >= max_bytes)
    }

    fn assign_sequence_ids(&mut self, messages: &mut [LogicalMessage]) {
        for msg in messages {
            match msg.sequence_id {
                Some(explicit) => {
                    self.next_sequence_id = self.next_sequence_id.max(explicit.saturating_add(1));
                }
                None => {
                    msg.sequence_id = Some(self.next_sequence_id);
                    self.next_sequence_id += 1;
                }
            }
        }
    }
}
