use anyhow::anyhow;
use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use xque::core::{new_jid, Utc};
use xque::prelude::*;
use xque_redis::{RedisStore, REDIS_URL_ENV};

struct Delivery {
    latency_millis: i64,
    jid: Jid,
}

#[derive(Serialize, Deserialize)]
struct PingPayload {
    enqueued_at_millis: i64,
}

impl PingPayload {
    fn now() -> Self {
        Self {
            enqueued_at_millis: Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Default)]
struct Attempts {
    total: AtomicUsize,
    failed_once: Mutex<HashSet<Jid>>,
}

impl Attempts {
    fn retried(&self) -> usize {
        self.failed_once.lock().map(|f| f.len()).unwrap_or(0)
    }
}

/// Reports its latency. Every `fail_every`-th attempt fails, once per job, so retries are part
/// of the measurement.
struct PingJob {
    tx: UnboundedSender<Delivery>,
    fail_every: usize,
    attempts: Arc<Attempts>,
}

impl PingJob {
    fn should_fail(&self, jid: &Jid) -> bool {
        let attempt = self.attempts.total.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_every == 0 || attempt % self.fail_every != 0 {
            return false;
        }
        match self.attempts.failed_once.lock() {
            Ok(mut failed) => failed.insert(jid.clone()),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl JobProcessor for PingJob {
    type Payload = PingPayload;
    type Error = JobError;

    async fn handle(&self, jid: &Jid, payload: Self::Payload) -> Result<(), Self::Error> {
        if self.should_fail(jid) {
            return Err(anyhow!("Injected failure").into());
        }
        let latency_millis = Utc::now().timestamp_millis() - payload.enqueued_at_millis;
        self.tx
            .unbounded_send(Delivery {
                latency_millis,
                jid: jid.clone(),
            })
            .map_err(|_| anyhow!("Failed to report delivery"))?;
        Ok(())
    }

    fn name() -> &'static str {
        "ping"
    }

    fn attributes() -> &'static [&'static str] {
        &["enqueued_at_millis"]
    }

    fn options() -> JobOptions {
        JobOptions::default()
            .with_expiry(30)
            .with_retries(3)
            .with_backoff([0])
    }
}

async fn produce(count: usize, interval: Duration, producer: Producer<RedisStore>) {
    let mut ticker = tokio::time::interval(interval);
    for i in 0..count {
        ticker.tick().await;
        // Spread jobs over the whole priority range.
        let priority = (i % 9) as i8 - 4;
        if let Err(e) = producer
            .enqueue::<PingJob>(&PingPayload::now(), priority)
            .await
        {
            eprintln!("Failed to enqueue job: {}", e);
        }
    }
}

fn arg<T: FromStr>(position: usize, default: T) -> T {
    std::env::args()
        .nth(position)
        .and_then(|v| T::from_str(&v).ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let count: usize = arg(1, 10_000);
    let concurrency: usize = arg(2, 50);
    let interval_nanos: u64 = arg(3, 700_000);
    let fail_every: usize = arg(4, 20);
    let url =
        std::env::var(REDIS_URL_ENV).unwrap_or_else(|_| "redis://localhost:6379/0".to_string());

    let store = RedisStore::connect(&url).await?;
    let queue_name = format!("bench-{}", new_jid());
    let producer = Producer::with_queue(store.clone(), queue_name.clone());

    let (tx, rx) = unbounded::<Delivery>();
    let attempts = Arc::new(Attempts::default());
    let mut router = JobRouter::default();
    router.add_job_handler(PingJob {
        tx,
        fail_every,
        attempts: attempts.clone(),
    })?;

    let config = ConsumerConfig {
        poll_interval: Duration::from_millis(1),
        ..ConsumerConfig::default()
    };
    let pool = Arc::new(
        ConsumerPool::new(store, router, concurrency)
            .with_queue(queue_name)
            .with_config(config),
    );

    let started = Instant::now();
    tokio::spawn(produce(
        count,
        Duration::from_nanos(interval_nanos),
        producer.clone(),
    ));
    let consumers = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.run(true).await })
    };

    let mut deliveries = rx.take(count).collect::<Vec<Delivery>>().await;
    let elapsed = started.elapsed();

    // Snapshot the queue before the consumers wind down.
    let ready = producer.queue_size().await?;
    let pending = producer.pending_size().await?;
    let failing = producer
        .scan_each()
        .try_filter(|job| futures::future::ready(job.errors > 0))
        .try_fold(0usize, |n, _| futures::future::ready(Ok(n + 1)))
        .await?;

    pool.stop();
    consumers.await?;

    if deliveries.is_empty() {
        return Err(anyhow!("No jobs were delivered"));
    }
    let unique = deliveries
        .iter()
        .map(|d| d.jid.clone())
        .collect::<HashSet<Jid>>()
        .len();
    deliveries.sort_by_key(|d| d.latency_millis);
    let percentile = |p: usize| deliveries[(deliveries.len() - 1) * p / 100].latency_millis;

    println!("delivered: {} ({} unique)", deliveries.len(), unique);
    println!("attempts: {}", attempts.total.load(Ordering::SeqCst));
    println!("retried: {}", attempts.retried());
    println!("latency min: {}ms", percentile(0));
    println!("latency p50: {}ms", percentile(50));
    println!("latency p95: {}ms", percentile(95));
    println!("latency max: {}ms", percentile(100));
    println!(
        "throughput: {:.1}/s",
        deliveries.len() as f64 / elapsed.as_secs_f64()
    );
    println!(
        "left in queue: {} ready, {} pending, {} with errors",
        ready, pending, failing
    );
    Ok(())
}
