use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use sable_protocol::CompressionType;
use sable_util::millis_or_none;

use crate::BrokerError;
use crate::dispatch::SubscriptionType;
use crate::key_shared::KeySharedPolicy;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchingPolicy {
    /// One FIFO batch.
    #[default]
    Default,
    /// One entry per ordering key on flush.
    KeyBased,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// When false every message becomes its own non-batched entry.
    pub enabled: bool,
    /// 0 = unlimited
    pub max_messages: usize,
    /// 0 = unlimited
    pub max_bytes: usize,
    pub max_delay_ms: u64,
    /// Hard cap for a single message, independent of batching.
    pub max_message_size: usize,
    pub policy: BatchingPolicy,
    pub compression: CompressionType,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_messages: 1000,
            max_bytes: 128 * 1024,
            max_delay_ms: 10,
            max_message_size: 5 * 1024 * 1024,
            policy: BatchingPolicy::Default,
            compression: CompressionType::None,
        }
    }
}

impl BatchConfig {
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_max_messages(self, max_messages: usize) -> Self {
        Self {
            max_messages,
            ..self
        }
    }

    pub fn with_max_bytes(self, max_bytes: usize) -> Self {
        Self { max_bytes, ..self }
    }

    pub fn with_max_delay_ms(self, max_delay_ms: u64) -> Self {
        Self {
            max_delay_ms,
            ..self
        }
    }

    pub fn with_policy(self, policy: BatchingPolicy) -> Self {
        Self { policy, ..self }
    }

    pub fn with_compression(self, compression: CompressionType) -> Self {
        Self {
            compression,
            ..self
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    pub batching: BatchConfig,
    /// Sends queued but not yet handed to the batcher. `send_async` fails
    /// with `ProducerQueueFull` beyond this.
    pub max_pending_messages: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            batching: BatchConfig::default(),
            max_pending_messages: 1000,
        }
    }
}

impl ProducerConfig {
    pub fn with_batching(self, batching: BatchConfig) -> Self {
        Self { batching, ..self }
    }
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub subscription_type: SubscriptionType,
    pub consumer_name: String,
    pub receiver_queue_size: u32,
    pub key_shared_policy: KeySharedPolicy,
    /// None disables ack-timeout redelivery.
    pub ack_timeout: Option<Duration>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            subscription_type: SubscriptionType::Exclusive,
            consumer_name: String::new(),
            receiver_queue_size: 1000,
            key_shared_policy: KeySharedPolicy::default(),
            ack_timeout: None,
        }
    }
}

impl SubscribeOptions {
    pub fn new(subscription_type: SubscriptionType) -> Self {
        Self {
            subscription_type,
            ..Self::default()
        }
    }

    pub fn with_consumer_name(self, consumer_name: impl Into<String>) -> Self {
        Self {
            consumer_name: consumer_name.into(),
            ..self
        }
    }

    pub fn with_receiver_queue_size(self, receiver_queue_size: u32) -> Self {
        Self {
            receiver_queue_size,
            ..self
        }
    }

    pub fn with_key_shared_policy(self, key_shared_policy: KeySharedPolicy) -> Self {
        Self {
            key_shared_policy,
            ..self
        }
    }

    pub fn with_ack_timeout(self, ack_timeout: Duration) -> Self {
        Self {
            ack_timeout: Some(ack_timeout),
            ..self
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub cleanup_interval_secs: u64,
    /// Max entries pulled from the log per coordinator pass.
    pub read_batch_size: usize,
    /// 0 = redeliver negatively acknowledged messages right away.
    pub negative_ack_redelivery_delay_ms: u64,
    /// Upper bound on how long a completed entry waits for its mark-delete.
    pub cursor_flush_interval_ms: u64,
    /// Defaults for producers that do not bring their own config.
    pub producer: ProducerConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: 60,
            read_batch_size: 100,
            negative_ack_redelivery_delay_ms: 0,
            cursor_flush_interval_ms: 100,
            producer: ProducerConfig::default(),
        }
    }
}

impl BrokerConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, BrokerError> {
        let config: Self = toml::from_str(s).map_err(|e| BrokerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, BrokerError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| BrokerError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.read_batch_size == 0 {
            return Err(BrokerError::Config("read_batch_size must be > 0".into()));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(BrokerError::Config(
                "cleanup_interval_secs must be > 0".into(),
            ));
        }
        if self.producer.batching.max_message_size == 0 {
            return Err(BrokerError::Config(
                "producer.batching.max_message_size must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn negative_ack_delay(&self) -> Option<Duration> {
        millis_or_none(self.negative_ack_redelivery_delay_ms)
    }

    pub fn cursor_flush_interval(&self) -> Duration {
        Duration::from_millis(self.cursor_flush_interval_ms.max(1))
    }
}
