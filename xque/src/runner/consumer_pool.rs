use super::consumer::{Consumer, ConsumerConfig};
use super::job_router::JobRouter;
use crate::core::store::Store;
use crate::core::DEFAULT_QUEUE_NAME;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const JITTER_INTERVAL_MS: [u64; 10] = [0, 1, 1, 2, 3, 5, 8, 13, 21, 34];

/// A fixed number of consumers working the same queue.
///
/// ## Implementation
///
/// - Every consumer gets a clone of the store and shares the router. Consumers share no mutable
///   state; the store alone keeps them from running the same job twice.
/// - Each consumer runs in its own task, polling with the configured interval + random jitter.
/// - `stop` asks every consumer to stop. `run` returns once all of them have finished the job
///   they were working on and left their loop.
///
/// ## Examples
/// See `xque-redis` for examples.
pub struct ConsumerPool<S> {
    store: S,
    router: Arc<JobRouter>,
    queue_name: String,
    concurrency: usize,
    config: ConsumerConfig,
    token: CancellationToken,
}

impl<S> ConsumerPool<S>
where
    S: Store + Clone + 'static,
{
    /// Create a new pool of `concurrency` consumers for the default queue.
    pub fn new(store: S, router: JobRouter, concurrency: usize) -> Self {
        Self {
            store,
            router: Arc::new(router),
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            concurrency,
            config: ConsumerConfig::default(),
            token: CancellationToken::new(),
        }
    }

    pub fn with_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = queue_name.into();
        self
    }

    pub fn with_config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Run the consumers until [`stop`](Self::stop) is called. With `traps` set, SIGINT, SIGTERM
    /// and SIGQUIT stop the pool too.
    pub async fn run(&self, traps: bool) {
        let traps = traps.then(|| tokio::spawn(stop_on_signal(self.token.clone())));

        tracing::info!(
            queue = %self.queue_name,
            "Starting {} consumers",
            self.concurrency
        );
        let consumers: Vec<_> = (0..self.concurrency)
            .map(|_| {
                let config = ConsumerConfig {
                    poll_interval: self.config.poll_interval + get_random_jitter(),
                    ..self.config
                };
                let consumer = Consumer::with_config(
                    self.store.clone(),
                    self.queue_name.clone(),
                    self.router.clone(),
                    config,
                )
                .with_token(self.token.child_token());
                tokio::spawn(async move { consumer.run().await })
            })
            .collect();

        for result in futures::future::join_all(consumers).await {
            if let Err(e) = result {
                tracing::error!("Consumer task failed: {}", e);
            }
        }

        if let Some(traps) = traps {
            traps.abort();
        }
        tracing::info!(queue = %self.queue_name, "All consumers stopped");
    }

    /// Ask every consumer to stop.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

async fn stop_on_signal(token: CancellationToken) {
    match wait_for_signal().await {
        Ok(signal) => {
            tracing::info!("Received {}, stopping consumers", signal);
            token.cancel();
        }
        Err(e) => tracing::error!("Failed to install signal handlers: {}", e),
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;
    let mut int = signal(SignalKind::interrupt())?;
    let name = tokio::select! {
        _ = term.recv() => "SIGTERM",
        _ = quit.recv() => "SIGQUIT",
        _ = int.recv() => "SIGINT",
    };
    Ok(name)
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}

fn get_random_jitter() -> Duration {
    JITTER_INTERVAL_MS
        .choose(&mut rand::thread_rng())
        .map(|ms| Duration::from_millis(*ms))
        .unwrap_or_else(|| Duration::from_millis(5)) // Always takes a happy path technically
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job_processor::JobProcessor;
    use crate::core::Jid;
    use crate::memory::MemoryStore;
    use crate::producer::Producer;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Instant;

    #[derive(Serialize, Deserialize)]
    struct Work {
        n: u32,
    }

    struct Collect(Arc<Mutex<Vec<(Jid, u32)>>>);

    #[async_trait]
    impl JobProcessor for Collect {
        type Payload = Work;
        type Error = std::convert::Infallible;

        async fn handle(&self, jid: &Jid, payload: Work) -> Result<(), Self::Error> {
            tokio::time::sleep(Duration::from_millis(2)).await;
            self.0.lock().unwrap().push((jid.clone(), payload.n));
            Ok(())
        }

        fn name() -> &'static str {
            "collect"
        }

        fn attributes() -> &'static [&'static str] {
            &["n"]
        }
    }

    fn quick() -> ConsumerConfig {
        ConsumerConfig {
            poll_interval: Duration::from_millis(5),
            error_sleep: Duration::from_millis(5),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn every_job_runs_exactly_once() {
        let store = MemoryStore::new();
        let producer = Producer::with_queue(store.clone(), "work");
        let done = Arc::new(Mutex::new(Vec::new()));
        let mut router = JobRouter::default();
        router.add_job_handler(Collect(done.clone())).unwrap();

        let mut enqueued = HashSet::new();
        for n in 0..200 {
            enqueued.insert(producer.enqueue::<Collect>(&Work { n }, 0).await.unwrap());
        }

        let pool = Arc::new(
            ConsumerPool::new(store, router, 8)
                .with_queue("work")
                .with_config(quick()),
        );
        let running = tokio::spawn({
            let pool = pool.clone();
            async move { pool.run(false).await }
        });

        let deadline = Instant::now() + Duration::from_secs(10);
        while producer.size().await.unwrap() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pool.stop();
        tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .unwrap()
            .unwrap();

        let done = done.lock().unwrap();
        assert_eq!(done.len(), 200);
        let ran: HashSet<Jid> = done.iter().map(|(jid, _)| jid.clone()).collect();
        assert_eq!(ran, enqueued);
    }

    #[tokio::test]
    async fn stop_before_run_returns_immediately() {
        let pool = ConsumerPool::new(MemoryStore::new(), JobRouter::default(), 3);
        pool.stop();
        assert!(pool.is_stopped());
        tokio::time::timeout(Duration::from_secs(1), pool.run(false))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stop_wakes_idle_consumers() {
        let pool = Arc::new(ConsumerPool::new(
            MemoryStore::new(),
            JobRouter::default(),
            4,
        ));
        let running = tokio::spawn({
            let pool = pool.clone();
            async move { pool.run(true).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.stop();
        tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .unwrap()
            .unwrap();
    }
}
