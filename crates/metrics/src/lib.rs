use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Counts events over a sliding window of fixed-width time slots.
///
/// Every slot remembers which tick it was last written in, so slots that
/// went quiet for a whole lap of the ring are not read back as current.
#[derive(Debug)]
pub struct SlidingWindow {
    slots: Box<[Slot]>,
    slot_secs: u64,
    total: AtomicU64,
}

#[derive(Debug, Default)]
struct Slot {
    tick: AtomicU64,
    count: AtomicU64,
}

impl SlidingWindow {
    pub fn new(slot_secs: u64, slots: usize) -> Self {
        Self {
            slots: (0..slots.max(1)).map(|_| Slot::default()).collect(),
            slot_secs: slot_secs.max(1),
            total: AtomicU64::new(0),
        }
    }

    fn tick_now(&self) -> u64 {
        sable_util::unix_millis() / 1000 / self.slot_secs
    }

    #[inline]
    pub fn add(&self, n: u64) {
        let tick = self.tick_now();
        let slot = &self.slots[(tick % self.slots.len() as u64) as usize];

        // first writer in a new tick resets the slot; racing adds may be lost
        if slot.tick.swap(tick, Ordering::Relaxed) != tick {
            slot.count.store(0, Ordering::Relaxed);
        }
        slot.count.fetch_add(n, Ordering::Relaxed);
        self.total.fetch_add(n, Ordering::Relaxed);
    }

    /// Events in the last `slots` slots, the current one included.
    pub fn recent(&self, slots: usize) -> u64 {
        let now = self.tick_now();
        let span = slots.min(self.slots.len()) as u64;

        self.slots
            .iter()
            .filter(|s| {
                let tick = s.tick.load(Ordering::Relaxed);
                tick <= now && now - tick < span
            })
            .map(|s| s.count.load(Ordering::Relaxed))
            .sum()
    }

    pub fn rate_per_sec(&self, window_secs: usize) -> f64 {
        let slots = (window_secs as u64 / self.slot_secs).max(1) as usize;
        let covered = slots.min(self.slots.len()) as u64 * self.slot_secs;
        self.recent(slots) as f64 / covered as f64
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct LatencyStats {
    count: AtomicU64,
    sum_micros: AtomicU64,
    max_micros: AtomicU64,
}

impl LatencyStats {
    #[inline]
    pub fn record(&self, elapsed: Duration) {
        let micros = elapsed.as_micros().min(u64::MAX as u128) as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
        self.max_micros.fetch_max(micros, Ordering::Relaxed);
    }

    pub fn mean_ms(&self) -> Option<f64> {
        match self.count.load(Ordering::Relaxed) {
            0 => None,
            n => Some(self.sum_micros.load(Ordering::Relaxed) as f64 / n as f64 / 1000.0),
        }
    }

    pub fn max_ms(&self) -> Option<f64> {
        match self.count.load(Ordering::Relaxed) {
            0 => None,
            _ => Some(self.max_micros.load(Ordering::Relaxed) as f64 / 1000.0),
        }
    }
}

/// Rate, total, failures and latency of one kind of call.
#[derive(Debug)]
pub struct OpStats {
    pub calls: SlidingWindow,
    pub failures: AtomicU64,
    pub latency: LatencyStats,
}

impl OpStats {
    pub fn new(window_slots: usize) -> Self {
        Self {
            calls: SlidingWindow::new(1, window_slots),
            failures: AtomicU64::new(0),
            latency: LatencyStats::default(),
        }
    }

    #[inline]
    pub fn incr(&self) {
        self.calls.add(1);
    }

    #[inline]
    pub fn incr_many(&self, many: u64) {
        if many > 0 {
            self.calls.add(many);
        }
    }

    /// One finished call: counted, timed, and flagged as failed if `ok` is false.
    #[inline]
    pub fn finish(&self, started: Instant, ok: bool) {
        self.calls.add(1);
        self.latency.record(started.elapsed());
        if !ok {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn total(&self) -> u64 {
        self.calls.total()
    }

    pub fn failed(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Counters for the durable log collaborator.
#[derive(Debug)]
pub struct StorageStats {
    pub appends: OpStats,
    pub reads: OpStats,
    pub mark_deletes: OpStats,
    pub maintenance: OpStats,

    pub entries_read: AtomicU64,
    pub bytes_appended: AtomicU64,
}

impl StorageStats {
    pub fn new(window_slots: usize) -> Arc<Self> {
        Arc::new(Self {
            appends: OpStats::new(window_slots),
            reads: OpStats::new(window_slots),
            mark_deletes: OpStats::new(window_slots),
            maintenance: OpStats::new(window_slots),
            entries_read: AtomicU64::new(0),
            bytes_appended: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn record_entries_read(&self, entries: usize) {
        self.entries_read.fetch_add(entries as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_bytes_appended(&self, bytes: usize) {
        self.bytes_appended.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StorageStatsSnapshot {
        StorageStatsSnapshot {
            appends_per_sec_1m: self.appends.calls.rate_per_sec(60),
            reads_per_sec_1m: self.reads.calls.rate_per_sec(60),
            total_appends: self.appends.total(),
            total_reads: self.reads.total(),
            total_mark_deletes: self.mark_deletes.total(),
            total_entries_read: self.entries_read.load(Ordering::Relaxed),
            total_bytes_appended: self.bytes_appended.load(Ordering::Relaxed),
            append_errors: self.appends.failed(),
            mark_delete_errors: self.mark_deletes.failed(),

            avg_append_latency_ms: self.appends.latency.mean_ms(),
            max_append_latency_ms: self.appends.latency.max_ms(),
            avg_read_latency_ms: self.reads.latency.mean_ms(),
            avg_mark_delete_latency_ms: self.mark_deletes.latency.mean_ms(),
            avg_cleanup_latency_ms: self.maintenance.latency.mean_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageStatsSnapshot {
    pub appends_per_sec_1m: f64,
    pub reads_per_sec_1m: f64,
    pub total_appends: u64,
    pub total_reads: u64,
    pub total_mark_deletes: u64,
    pub total_entries_read: u64,
    pub total_bytes_appended: u64,
    pub append_errors: u64,
    pub mark_delete_errors: u64,

    pub avg_append_latency_ms: Option<f64>,
    pub max_append_latency_ms: Option<f64>,
    pub avg_read_latency_ms: Option<f64>,
    pub avg_mark_delete_latency_ms: Option<f64>,
    pub avg_cleanup_latency_ms: Option<f64>,
}

/// Message-level counters. Everything here counts logical (sub-)messages
/// except `publish_batches`, which counts physical entries.
#[derive(Debug)]
pub struct BrokerStats {
    pub published: OpStats,
    pub delivered: OpStats,
    pub acked: OpStats,
    pub negative_acked: OpStats,
    pub redelivered: OpStats,
    pub ack_timeouts: OpStats,

    pub stale_acks: AtomicU64,
    pub decode_errors: AtomicU64,
    pub oversize_rejected: AtomicU64,
    pub flow_violations: AtomicU64,

    pub publish_batches: SlidingWindow,
    pub published_bytes: AtomicU64,
}

impl BrokerStats {
    pub fn new(window_slots: usize) -> Arc<Self> {
        Arc::new(Self {
            published: OpStats::new(window_slots),
            delivered: OpStats::new(window_slots),
            acked: OpStats::new(window_slots),
            negative_acked: OpStats::new(window_slots),
            redelivered: OpStats::new(window_slots),
            ack_timeouts: OpStats::new(window_slots),
            stale_acks: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            oversize_rejected: AtomicU64::new(0),
            flow_violations: AtomicU64::new(0),
            publish_batches: SlidingWindow::new(1, window_slots),
            published_bytes: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn delivered(&self) {
        self.delivered.incr();
    }

    #[inline]
    pub fn acked_many(&self, acked: u64) {
        self.acked.incr_many(acked);
    }

    #[inline]
    pub fn negative_acked(&self) {
        self.negative_acked.incr();
    }

    #[inline]
    pub fn redelivered_many(&self, redelivered: u64) {
        self.redelivered.incr_many(redelivered);
    }

    #[inline]
    pub fn ack_timeout(&self) {
        self.ack_timeouts.incr();
    }

    #[inline]
    pub fn stale_ack(&self) {
        self.stale_acks.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn oversize_rejected(&self) {
        self.oversize_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn flow_violation(&self) {
        self.flow_violations.fetch_add(1, Ordering::Relaxed);
    }

    /// One entry of `batch_size` messages, `bytes` long once encoded.
    #[inline]
    pub fn publish_batch(&self, batch_size: usize, bytes: usize) {
        self.publish_batches.add(1);
        self.published_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.published.incr_many(batch_size as u64);
    }

    pub fn snapshot(&self) -> BrokerStatsSnapshot {
        let window = 60;
        let batches = self.publish_batches.total();
        let published = self.published.total();

        BrokerStatsSnapshot {
            published_per_sec_1m: self.published.calls.rate_per_sec(window),
            delivered_per_sec_1m: self.delivered.calls.rate_per_sec(window),
            acked_per_sec_1m: self.acked.calls.rate_per_sec(window),
            redelivered_per_sec_1m: self.redelivered.calls.rate_per_sec(window),

            avg_publish_batch_size: (batches > 0).then(|| published as f64 / batches as f64),

            total_published: published,
            total_publish_batches: batches,
            total_published_bytes: self.published_bytes.load(Ordering::Relaxed),
            total_delivered: self.delivered.total(),
            total_acked: self.acked.total(),
            total_negative_acked: self.negative_acked.total(),
            total_redelivered: self.redelivered.total(),
            total_ack_timeouts: self.ack_timeouts.total(),
            stale_acks: self.stale_acks.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            oversize_rejected: self.oversize_rejected.load(Ordering::Relaxed),
            flow_violations: self.flow_violations.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BrokerStatsSnapshot {
    pub published_per_sec_1m: f64,
    pub delivered_per_sec_1m: f64,
    pub acked_per_sec_1m: f64,
    pub redelivered_per_sec_1m: f64,

    pub avg_publish_batch_size: Option<f64>,

    pub total_published: u64,
    pub total_publish_batches: u64,
    pub total_published_bytes: u64,
    pub total_delivered: u64,
    pub total_acked: u64,
    pub total_negative_acked: u64,
    pub total_redelivered: u64,
    pub total_ack_timeouts: u64,
    pub stale_acks: u64,
    pub decode_errors: u64,
    pub oversize_rejected: u64,
    pub flow_violations: u64,
}

/// Shared handle on every stats group of one process.
#[derive(Clone, Debug)]
pub struct Metrics {
    storage: Arc<StorageStats>,
    broker: Arc<BrokerStats>,
}

impl Metrics {
    /// `window_slots` one-second slots back every rate.
    pub fn new(window_slots: usize) -> Self {
        Self {
            storage: StorageStats::new(window_slots),
            broker: BrokerStats::new(window_slots),
        }
    }

    pub fn storage(&self) -> Arc<StorageStats> {
        self.storage.clone()
    }

    pub fn broker(&self) -> Arc<BrokerStats> {
        self.broker.clone()
    }

    /// Spawn the periodic loggers selected in `config`.
    pub fn start(self, config: MetricsConfig) -> MetricsHandle {
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        if config.log_storage {
            let stats = self.storage();
            tasks.push(tokio::spawn(log_every(
                config.interval,
                cancel.clone(),
                move || log_storage(&stats.snapshot()),
            )));
        }
        if config.log_broker {
            let stats = self.broker();
            tasks.push(tokio::spawn(log_every(
                config.interval,
                cancel.clone(),
                move || log_broker(&stats.snapshot()),
            )));
        }

        MetricsHandle {
            metrics: self,
            cancel,
            tasks,
        }
    }
}

pub struct MetricsHandle {
    metrics: Metrics,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl MetricsHandle {
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub log_storage: bool,
    pub log_broker: bool,
    pub interval: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            log_storage: true,
            log_broker: true,
            interval: Duration::from_secs(10),
        }
    }
}

async fn log_every(interval: Duration, cancel: CancellationToken, mut emit: impl FnMut()) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    // first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => emit(),
        }
    }
}

#[inline]
fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn log_storage(snap: &StorageStatsSnapshot) {
    tracing::info!(
        appends_s = round2(snap.appends_per_sec_1m),
        reads_s = round2(snap.reads_per_sec_1m),
        append_ms = snap.avg_append_latency_ms.map(round2),
        append_max_ms = snap.max_append_latency_ms.map(round2),
        read_ms = snap.avg_read_latency_ms.map(round2),
        mark_delete_ms = snap.avg_mark_delete_latency_ms.map(round2),
        total_appends = snap.total_appends,
        total_entries_read = snap.total_entries_read,
        append_errors = snap.append_errors,
        "[storage]"
    );
}

fn log_broker(snap: &BrokerStatsSnapshot) {
    tracing::info!(
        published_s = round2(snap.published_per_sec_1m),
        delivered_s = round2(snap.delivered_per_sec_1m),
        acked_s = round2(snap.acked_per_sec_1m),
        redelivered_s = round2(snap.redelivered_per_sec_1m),
        batch_size = snap.avg_publish_batch_size.map(round2),
        ack_timeouts = snap.total_ack_timeouts,
        stale_acks = snap.stale_acks,
        decode_errors = snap.decode_errors,
        oversize = snap.oversize_rejected,
        flow_violations = snap.flow_violations,
        "[broker]"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_counts_recent_events() {
        let w = SlidingWindow::new(1, 60);
        w.add(1);
        w.add(4);
        // a second boundary may fall between the adds
        assert_eq!(w.recent(2), 5);
        assert_eq!(w.total(), 5);
    }

    #[test]
    fn latency_mean_and_max() {
        let l = LatencyStats::default();
        assert!(l.mean_ms().is_none());
        l.record(Duration::from_micros(1000));
        l.record(Duration::from_micros(3000));
        assert_eq!(l.mean_ms(), Some(2.0));
        assert_eq!(l.max_ms(), Some(3.0));
    }

    #[test]
    fn failed_calls_are_counted_separately() {
        let op = OpStats::new(10);
        op.finish(Instant::now(), true);
        op.finish(Instant::now(), false);
        assert_eq!(op.total(), 2);
        assert_eq!(op.failed(), 1);
    }

    #[test]
    fn publish_batches_feed_published_total() {
        let stats = BrokerStats::new(60);
        stats.publish_batch(25, 1000);
        stats.publish_batch(25, 1000);
        let snap = stats.snapshot();
        assert_eq!(snap.total_published, 50);
        assert_eq!(snap.total_publish_batches, 2);
        assert_eq!(snap.total_published_bytes, 2000);
        assert_eq!(snap.avg_publish_batch_size, Some(25.0));
    }

    #[test]
    fn error_counters_show_in_snapshot() {
        let stats = BrokerStats::new(60);
        stats.stale_ack();
        stats.stale_ack();
        stats.decode_error();
        let snap = stats.snapshot();
        assert_eq!(snap.stale_acks, 2);
        assert_eq!(snap.decode_errors, 1);
        assert_eq!(snap.flow_violations, 0);
    }

    #[tokio::test]
    async fn loggers_stop_on_shutdown() {
        let metrics = Metrics::new(60);
        let handle = metrics.start(MetricsConfig {
            interval: Duration::from_millis(5),
            ..Default::default()
        });
        tokio::time::sleep(Duration::from_millis(12)).await;
        handle.shutdown().await;
    }
}
