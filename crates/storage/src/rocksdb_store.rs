use crate::*;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch, WriteOptions,
};

const CF_ENTRIES: &str = "entries";
const CF_CURSORS: &str = "cursors";
const CF_INDIVIDUAL_ACKS: &str = "individual_acks";
const CF_SUBSCRIPTIONS: &str = "subscriptions";
const CF_META: &str = "meta";

/// RocksDB-backed [`Log`].
///
/// Key layout (all integers big-endian so byte order equals numeric order):
/// - `entries`: `topic 0x00 segment offset` → payload
/// - `cursors`: `topic 0x00 subscription` → `segment offset`
/// - `individual_acks`: `topic 0x00 subscription` → `(segment offset)*`
/// - `subscriptions`: `topic 0x00 subscription` → empty
/// - `meta`: `LAST_SEGMENT` → `u64`
#[derive(Debug, Clone)]
pub struct RocksLog {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    sync_write: bool,
    segment: u64,
    // Next offset per topic within `segment`. Held across the write so entries
    // become visible in offset order.
    next_offsets: Arc<Mutex<HashMap<Topic, u64>>>,
}

// TODO: move the blocking RocksDB calls onto spawn_blocking once reads get large
impl RocksLog {
    const META_LAST_SEGMENT: &'static [u8] = b"LAST_SEGMENT";

    fn write_opts(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_write); // fsync WAL before returning
        write_opts
    }

    pub fn open(path: &str, sync_write: bool) -> Result<Self, StorageError> {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        let bg_jobs = match cpus {
            0..=2 => 2,
            3..=4 => 4,
            _ => 6,
        };

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_max_background_jobs(bg_jobs);
        opts.set_enable_pipelined_write(true);
        opts.set_write_buffer_size(64 * 1024 * 1024);
        opts.set_max_write_buffer_number(3);

        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        block_opts.set_cache_index_and_filter_blocks(true);
        opts.set_block_based_table_factory(&block_opts);

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_ENTRIES, Options::default()),
            ColumnFamilyDescriptor::new(CF_CURSORS, Options::default()),
            ColumnFamilyDescriptor::new(CF_INDIVIDUAL_ACKS, Options::default()),
            ColumnFamilyDescriptor::new(CF_SUBSCRIPTIONS, Options::default()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ];

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cfs)?;
        let mut log = Self {
            db: Arc::new(db),
            sync_write,
            segment: 0,
            next_offsets: Arc::new(Mutex::new(HashMap::new())),
        };

        // Segment 0 is never written so that Position::EARLIEST precedes every entry.
        let last = log.meta_get_u64(Self::META_LAST_SEGMENT)?.unwrap_or(0);
        let segment = last + 1;
        {
            let meta_cf = log.cf(CF_META)?;
            log.db.put_cf_opt(
                &meta_cf,
                Self::META_LAST_SEGMENT,
                segment.to_be_bytes(),
                &log.write_opts(),
            )?;
        }
        log.segment = segment;

        tracing::info!(path, segment, "opened rocksdb log");
        Ok(log)
    }

    pub fn segment(&self) -> u64 {
        self.segment
    }

    fn topic_prefix(topic: &str) -> Vec<u8> {
        let mut v = Vec::with_capacity(topic.len() + 1);
        v.extend_from_slice(topic.as_bytes());
        v.push(0);
        v
    }

    fn encode_entry_key(topic: &str, position: Position) -> Vec<u8> {
        let mut v = Self::topic_prefix(topic);
        v.extend_from_slice(&position.segment.to_be_bytes());
        v.extend_from_slice(&position.offset.to_be_bytes());
        v
    }

    fn decode_entry_position(key: &[u8]) -> Result<Position, StorageError> {
        if key.len() < 16 {
            return Err(StorageError::KeyDecode(format!(
                "entry key too short: {} bytes",
                key.len()
            )));
        }
        let tail = &key[key.len() - 16..];
        Ok(Position {
            segment: Self::be_u64(&tail[..8], "segment")?,
            offset: Self::be_u64(&tail[8..], "offset")?,
        })
    }

    fn encode_subscription_key(topic: &str, subscription: &str) -> Vec<u8> {
        let mut v = Self::topic_prefix(topic);
        v.extend_from_slice(subscription.as_bytes());
        v
    }

    fn encode_position(position: Position) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&position.segment.to_be_bytes());
        out[8..].copy_from_slice(&position.offset.to_be_bytes());
        out
    }

    fn decode_position(bytes: &[u8]) -> Result<Position, StorageError> {
        if bytes.len() != 16 {
            return Err(StorageError::KeyDecode(format!(
                "cursor: expected 16 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Position {
            segment: Self::be_u64(&bytes[..8], "cursor segment")?,
            offset: Self::be_u64(&bytes[8..], "cursor offset")?,
        })
    }

    fn decode_positions(bytes: &[u8]) -> Result<Vec<Position>, StorageError> {
        if bytes.len() % 16 != 0 {
            return Err(StorageError::KeyDecode(format!(
                "individual acks: {} bytes is not a multiple of 16",
                bytes.len()
            )));
        }
        bytes.chunks_exact(16).map(Self::decode_position).collect()
    }

    #[inline]
    fn cf(&self, name: &'static str) -> Result<Arc<BoundColumnFamily<'_>>, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or(StorageError::MissingColumnFamily(name))
    }

    #[inline]
    fn be_u64(bytes: &[u8], ctx: &str) -> Result<u64, StorageError> {
        let arr: [u8; 8] = bytes.try_into().map_err(|_| {
            StorageError::KeyDecode(format!("{ctx}: expected 8 bytes, got {}", bytes.len()))
        })?;
        Ok(u64::from_be_bytes(arr))
    }

    fn meta_get_u64(&self, key: &[u8]) -> Result<Option<u64>, StorageError> {
        let meta_cf = self.cf(CF_META)?;
        match self.db.get_cf(&meta_cf, key)? {
            Some(v) => Ok(Some(Self::be_u64(&v, "meta u64")?)),
            None => Ok(None),
        }
    }

    fn cursor(&self, topic: &str, subscription: &str) -> Result<Option<Position>, StorageError> {
        let cursors_cf = self.cf(CF_CURSORS)?;
        let key = Self::encode_subscription_key(topic, subscription);
        match self.db.get_cf(&cursors_cf, key)? {
            Some(v) => Ok(Some(Self::decode_position(&v)?)),
            None => Ok(None),
        }
    }

    fn topic_subscriptions(&self, topic: &str) -> Result<Vec<SubscriptionName>, StorageError> {
        let subs_cf = self.cf(CF_SUBSCRIPTIONS)?;
        let prefix = Self::topic_prefix(topic);
        let iter = self
            .db
            .iterator_cf(&subs_cf, IteratorMode::From(&prefix, Direction::Forward));

        let mut out = Vec::new();
        for pair in iter {
            let (key, _) = pair?;
            if !key.starts_with(&prefix) {
                break;
            }
            let name = String::from_utf8(key[prefix.len()..].to_vec())
                .map_err(|_| StorageError::KeyDecode("invalid subscription utf8".into()))?;
            out.push(name);
        }
        Ok(out)
    }
}

#[async_trait]
impl Log for RocksLog {
    async fn append(&self, topic: &str, payload: &[u8]) -> Result<Position, StorageError> {
        let entries_cf = self.cf(CF_ENTRIES)?;

        let mut next_offsets = self.next_offsets.lock();
        let next = next_offsets.entry(topic.to_string()).or_insert(0);
        let position = Position::new(self.segment, *next);

        self.db.put_cf_opt(
            &entries_cf,
            Self::encode_entry_key(topic, position),
            payload,
            &self.write_opts(),
        )?;
        *next += 1;

        Ok(position)
    }

    async fn read_from(
        &self,
        topic: &str,
        from: Position,
        max: usize,
    ) -> Result<Vec<StoredEntry>, StorageError> {
        let entries_cf = self.cf(CF_ENTRIES)?;
        let prefix = Self::topic_prefix(topic);
        let start_key = Self::encode_entry_key(topic, from);

        let iter = self
            .db
            .iterator_cf(&entries_cf, IteratorMode::From(&start_key, Direction::Forward));

        let mut out = Vec::new();
        for pair in iter {
            if out.len() >= max {
                break;
            }
            let (key, value) = pair?;
            if !key.starts_with(&prefix) {
                break;
            }
            out.push(StoredEntry {
                position: Self::decode_entry_position(&key)?,
                payload: Bytes::from(value.into_vec()),
            });
        }

        Ok(out)
    }

    async fn count_from(&self, topic: &str, from: Position) -> Result<u64, StorageError> {
        let entries_cf = self.cf(CF_ENTRIES)?;
        let prefix = Self::topic_prefix(topic);
        let start_key = Self::encode_entry_key(topic, from);

        let iter = self
            .db
            .iterator_cf(&entries_cf, IteratorMode::From(&start_key, Direction::Forward));

        let mut count = 0;
        for pair in iter {
            let (key, _) = pair?;
            if !key.starts_with(&prefix) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    async fn mark_delete(
        &self,
        topic: &str,
        subscription: &str,
        position: Position,
    ) -> Result<(), StorageError> {
        let current = self.cursor(topic, subscription)?;
        if !check_cursor_forward(topic, subscription, current, position)? {
            return Ok(());
        }

        let cursors_cf = self.cf(CF_CURSORS)?;
        self.db.put_cf_opt(
            &cursors_cf,
            Self::encode_subscription_key(topic, subscription),
            Self::encode_position(position),
            &self.write_opts(),
        )?;
        Ok(())
    }

    async fn mark_delete_position(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Option<Position>, StorageError> {
        self.cursor(topic, subscription)
    }

    async fn save_individual_acks(
        &self,
        topic: &str,
        subscription: &str,
        positions: &[Position],
    ) -> Result<(), StorageError> {
        let acks_cf = self.cf(CF_INDIVIDUAL_ACKS)?;
        let key = Self::encode_subscription_key(topic, subscription);
        if positions.is_empty() {
            self.db.delete_cf_opt(&acks_cf, key, &self.write_opts())?;
            return Ok(());
        }

        let mut value = Vec::with_capacity(positions.len() * 16);
        for p in positions {
            value.extend_from_slice(&Self::encode_position(*p));
        }
        self.db
            .put_cf_opt(&acks_cf, key, value, &self.write_opts())?;
        Ok(())
    }

    async fn individual_acks(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Vec<Position>, StorageError> {
        let acks_cf = self.cf(CF_INDIVIDUAL_ACKS)?;
        let key = Self::encode_subscription_key(topic, subscription);
        match self.db.get_cf(&acks_cf, key)? {
            Some(v) => Self::decode_positions(&v),
            None => Ok(Vec::new()),
        }
    }

    async fn register_subscription(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<(), StorageError> {
        let subs_cf = self.cf(CF_SUBSCRIPTIONS)?;
        self.db.put_cf_opt(
            &subs_cf,
            Self::encode_subscription_key(topic, subscription),
            [],
            &self.write_opts(),
        )?;
        Ok(())
    }

    async fn list_subscriptions(&self) -> Result<Vec<(Topic, SubscriptionName)>, StorageError> {
        let subs_cf = self.cf(CF_SUBSCRIPTIONS)?;
        let iter = self.db.iterator_cf(&subs_cf, IteratorMode::Start);

        let mut out = Vec::new();
        for pair in iter {
            let (key, _) = pair?;

            let Some(zero) = key.iter().position(|&b| b == 0) else {
                continue;
            };

            let topic = String::from_utf8(key[..zero].to_vec())
                .map_err(|_| StorageError::KeyDecode("invalid topic".into()))?;
            let subscription = String::from_utf8(key[zero + 1..].to_vec())
                .map_err(|_| StorageError::KeyDecode("invalid subscription".into()))?;

            out.push((topic, subscription));
        }

        Ok(out)
    }

    async fn cleanup_topic(&self, topic: &str) -> Result<u64, StorageError> {
        let subscriptions = self.topic_subscriptions(topic)?;

        // No subscription ever attached: nothing is known to be consumed.
        if subscriptions.is_empty() {
            return Ok(0);
        }

        let mut slowest: Option<Position> = None;
        for sub in &subscriptions {
            match self.cursor(topic, sub)? {
                Some(p) => slowest = Some(slowest.map_or(p, |s| s.min(p))),
                None => return Ok(0),
            }
        }
        let Some(slowest) = slowest else {
            return Ok(0);
        };

        let end = slowest.next();
        let removed = self.count_from(topic, Position::EARLIEST).await?
            - self.count_from(topic, end).await?;
        if removed == 0 {
            return Ok(0);
        }

        let entries_cf = self.cf(CF_ENTRIES)?;
        let mut batch = WriteBatch::default();
        batch.delete_range_cf(
            &entries_cf,
            Self::encode_entry_key(topic, Position::EARLIEST),
            Self::encode_entry_key(topic, end),
        );
        self.db.write_opt(batch, &self.write_opts())?;

        tracing::debug!(topic, %slowest, removed, "cleaned up consumed entries");
        Ok(removed)
    }

    async fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}
