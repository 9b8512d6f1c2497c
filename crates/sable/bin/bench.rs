use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use clap::{Parser, ValueEnum};

use sable_broker::{
    BatchConfig, BatchingPolicy, Broker, BrokerConfig, BrokerError, ConsumerHandle, Producer,
    ProducerConfig, SubscribeOptions, SubscriptionType,
};
use sable_metrics::{Metrics, MetricsConfig};
use sable_protocol::{CompressionType, LogicalMessage};
use sable_storage::{make_rocksdb_log, observable_storage::ObservableLog};
use sable_util::init_tracing;

#[derive(Parser, Debug)]
#[command(name = "sable-bench")]
pub enum Command {
    /// Publish and consume through one topic end to end
    #[command(name = "e2e")]
    E2E(E2EBench),
}

#[derive(Parser, Debug)]
pub struct E2EBench {
    /// Broker settings as TOML; flags below override the producer batching
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long, default_value = "100000")]
    pub messages: u64,

    #[arg(long, default_value = "4")]
    pub producers: usize,

    #[arg(long, default_value = "1")]
    pub consumers: usize,

    #[arg(long, default_value = "32")]
    pub payload_min: usize,

    #[arg(long, default_value = "256")]
    pub payload_max: usize,

    #[arg(long, default_value = "1000")]
    pub batch_max_messages: usize,

    #[arg(long, default_value = "10")]
    pub batch_delay_ms: u64,

    /// Group batches by key
    #[arg(long, default_value = "false")]
    pub key_based: bool,

    /// Distinct message keys, 0 = unkeyed
    #[arg(long, default_value = "0")]
    pub keys: usize,

    #[arg(long, default_value = "false")]
    pub snappy: bool,

    #[arg(long, value_enum, default_value = "shared")]
    pub subscription_type: SubType,

    #[arg(long, default_value = "1000")]
    pub receiver_queue: u32,

    /// Sync Writes for RocksDB backend
    #[arg(long, default_value = "false")]
    pub sync_write: bool,

    #[arg(long, default_value = "1")]
    pub report_interval_secs: u64,

    #[arg(long, value_enum, default_value = "individual")]
    pub ack_mode: AckMode,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubType {
    Exclusive,
    Failover,
    Shared,
    KeyShared,
}

impl From<SubType> for SubscriptionType {
    fn from(t: SubType) -> Self {
        match t {
            SubType::Exclusive => SubscriptionType::Exclusive,
            SubType::Failover => SubscriptionType::Failover,
            SubType::Shared => SubscriptionType::Shared,
            SubType::KeyShared => SubscriptionType::KeyShared,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckMode {
    Individual,
    /// Cumulative every 100 messages; Exclusive/Failover only
    Cumulative,
    None,
}

#[derive(Default)]
struct BenchCounters {
    confirmed: AtomicU64,
    send_errors: AtomicU64,
    consumed: AtomicU64,
    redelivered: AtomicU64,
    acked: AtomicU64,
}

fn make_payload(msg_id: u64, producer_id: u32, size: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12 + size);
    buf.extend_from_slice(&msg_id.to_be_bytes());
    buf.extend_from_slice(&producer_id.to_be_bytes());

    let mut body = vec![0u8; size];
    fastrand::fill(&mut body);
    buf.extend_from_slice(&body);

    buf
}

async fn producer_task(
    producer: Producer,
    producer_id: u32,
    start_id: u64,
    count: u64,
    cmd: Arc<E2EBench>,
    counters: Arc<BenchCounters>,
) -> anyhow::Result<()> {
    let mut pending = Vec::with_capacity(1024);

    for i in 0..count {
        let msg_id = start_id + i;
        let size = fastrand::usize(cmd.payload_min..=cmd.payload_max.max(cmd.payload_min));
        let mut msg = LogicalMessage::new(make_payload(msg_id, producer_id, size))
            .with_property("producer", producer_id.to_string());
        if cmd.keys > 0 {
            msg = msg.with_key(format!("key-{}", msg_id % cmd.keys as u64));
        }

        pending.push(producer.send_async(msg));
        if pending.len() >= 1024 {
            settle(&mut pending, &counters).await;
        }
    }
    settle(&mut pending, &counters).await;
    producer.close().await.context("closing producer")?;
    Ok(())
}

async fn settle(pending: &mut Vec<sable_broker::SendFuture>, counters: &BenchCounters) {
    for fut in pending.drain(..) {
        match fut.await {
            Ok(_) => counters.confirmed.fetch_add(1, Ordering::Relaxed),
            Err(err) => {
                tracing::warn!(error = %err, "send failed");
                counters.send_errors.fetch_add(1, Ordering::Relaxed)
            }
        };
    }
}

async fn consumer_task(
    mut consumer: ConsumerHandle,
    ack_mode: AckMode,
    counters: Arc<BenchCounters>,
) -> anyhow::Result<()> {
    let mut since_cumulative = 0u64;

    while let Some(msg) = consumer.recv().await {
        counters.consumed.fetch_add(1, Ordering::Relaxed);
        if msg.redelivery_count() > 0 {
            counters.redelivered.fetch_add(1, Ordering::Relaxed);
        }

        let res = match ack_mode {
            AckMode::Individual => consumer.ack(msg.id()).map(|()| 1),
            AckMode::Cumulative => {
                since_cumulative += 1;
                if since_cumulative >= 100 {
                    let n = std::mem::take(&mut since_cumulative);
                    consumer.ack_cumulative(msg.id()).map(|()| n)
                } else {
                    Ok(0)
                }
            }
            AckMode::None => Ok(0),
        };
        match res {
            Ok(n) => {
                counters.acked.fetch_add(n, Ordering::Relaxed);
            }
            Err(BrokerError::Shutdown) => break,
            Err(err) => return Err(err).context("acking"),
        }
    }
    Ok(())
}

async fn reporter(
    counters: Arc<BenchCounters>,
    broker: Arc<Broker>,
    topic: String,
    interval: u64,
    total: u64,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));

    loop {
        ticker.tick().await;
        let consumed = counters.consumed.load(Ordering::Relaxed);
        let backlog = broker.backlog(&topic, "bench_sub").await.ok();
        tracing::info!(
            confirmed = counters.confirmed.load(Ordering::Relaxed),
            send_errors = counters.send_errors.load(Ordering::Relaxed),
            consumed,
            redelivered = counters.redelivered.load(Ordering::Relaxed),
            acked = counters.acked.load(Ordering::Relaxed),
            ?backlog,
            "[bench]"
        );

        if consumed >= total {
            break;
        }
    }
}

fn broker_config(cmd: &E2EBench) -> anyhow::Result<BrokerConfig> {
    let mut cfg = match &cmd.config {
        Some(path) => BrokerConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => BrokerConfig::default(),
    };

    cfg.producer = ProducerConfig {
        batching: BatchConfig::default()
            .with_max_messages(cmd.batch_max_messages)
            .with_max_delay_ms(cmd.batch_delay_ms)
            .with_policy(if cmd.key_based {
                BatchingPolicy::KeyBased
            } else {
                BatchingPolicy::Default
            })
            .with_compression(if cmd.snappy {
                CompressionType::Snappy
            } else {
                CompressionType::None
            }),
        ..cfg.producer
    };
    cfg.validate()?;
    Ok(cfg)
}

async fn run_e2e_bench(cmd: E2EBench) -> anyhow::Result<()> {
    let cfg = broker_config(&cmd)?;

    let db_path = format!("bench_data/{}", fastrand::u64(..));
    std::fs::create_dir_all(&db_path)?;

    let log = make_rocksdb_log(&db_path, cmd.sync_write)?;
    let metrics = Metrics::new(60 * 60);
    let log = ObservableLog::new(log, metrics.storage());
    let broker = Arc::new(Broker::try_new(log, metrics.broker(), cfg).await?);

    let metrics_handle = metrics.clone().start(MetricsConfig {
        log_broker: true,
        log_storage: true,
        interval: Duration::from_secs(cmd.report_interval_secs.max(1) * 5),
    });

    let cmd = Arc::new(cmd);
    let counters = Arc::new(BenchCounters::default());
    let topic = format!("bench_topic_{}", fastrand::u64(..));
    let start = Instant::now();

    let mut consumers = Vec::new();
    for i in 0..cmd.consumers {
        let consumer = broker
            .subscribe(
                &topic,
                "bench_sub",
                SubscribeOptions::new(cmd.subscription_type.into())
                    .with_consumer_name(format!("bench-{i}"))
                    .with_receiver_queue_size(cmd.receiver_queue),
            )
            .await?;
        consumers.push(tokio::spawn(consumer_task(
            consumer,
            cmd.ack_mode,
            counters.clone(),
        )));
    }

    let per_producer = cmd.messages / cmd.producers.max(1) as u64;
    let total = per_producer * cmd.producers.max(1) as u64;
    let mut producers = Vec::new();
    for p in 0..cmd.producers.max(1) {
        let producer = broker.create_default_producer(&topic)?;
        producers.push(tokio::spawn(producer_task(
            producer,
            p as u32,
            p as u64 * per_producer,
            per_producer,
            cmd.clone(),
            counters.clone(),
        )));
    }

    let report = tokio::spawn(reporter(
        counters.clone(),
        broker.clone(),
        topic.clone(),
        cmd.report_interval_secs,
        total,
    ));

    for p in producers {
        p.await??;
    }
    let published_in = start.elapsed();

    report.await?;
    let consumed_in = start.elapsed();

    tracing::info!("=== FINAL THROUGHPUT ===");
    tracing::info!(
        "Published: {:.0} msg/s",
        total as f64 / published_in.as_secs_f64()
    );
    tracing::info!(
        "Consumed:  {:.0} msg/s",
        total as f64 / consumed_in.as_secs_f64()
    );

    broker.flush_storage().await?;
    let removed = broker.force_cleanup(&topic).await?;
    tracing::info!(removed, stats = ?broker.stats().snapshot(), "bench complete");

    broker.shutdown().await;
    for c in consumers {
        c.await??;
    }
    metrics_handle.shutdown().await;
    Ok(())
}

#[tokio::main(flavor = "multi_thread", worker_threads = 8)]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    match Command::parse() {
        Command::E2E(e2e) => {
            tracing::info!("Starting E2E bench: {:#?}", e2e);
            run_e2e_bench(e2e).await
        }
    }
}
