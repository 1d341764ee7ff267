//! In-process [`Store`]. Everything lives behind one lock, so each operation is atomic the same
//! way a server side script is. Not durable; meant for tests and local development.

use crate::core::store::{priority_score, Ordering, QueueError, RawJob, Store};
use crate::core::Jid;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Expiry applied to blobs that don't carry a readable one.
const FALLBACK_EXPIRY_SECS: i64 = 3_600;

#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<Jid, i64>,
    ordered: BTreeSet<(i64, Jid)>,
}

impl SortedSet {
    fn insert(&mut self, jid: Jid, score: i64) {
        if let Some(old) = self.scores.insert(jid.clone(), score) {
            self.ordered.remove(&(old, jid.clone()));
        }
        self.ordered.insert((score, jid));
    }

    fn remove(&mut self, jid: &Jid) {
        if let Some(score) = self.scores.remove(jid) {
            self.ordered.remove(&(score, jid.clone()));
        }
    }

    fn first(&self) -> Option<&(i64, Jid)> {
        self.ordered.iter().next()
    }

    fn pop_first(&mut self) -> Option<Jid> {
        let (_, jid) = self.first()?.clone();
        self.remove(&jid);
        Some(jid)
    }

    fn score(&self, jid: &Jid) -> Option<i64> {
        self.scores.get(jid).copied()
    }

    fn len(&self) -> usize {
        self.scores.len()
    }
}

#[derive(Debug, Default)]
struct Queue {
    ready: SortedSet,
    pending: SortedSet,
    sequence: i64,
}

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<Jid, String>,
    queues: HashMap<String, Queue>,
    /// Open scans: cursor -> last entry returned. Scans resume strictly after that entry, so
    /// removals elsewhere in the ordering don't shift jobs past the cursor.
    cursors: HashMap<u64, (i64, Jid)>,
    next_cursor: u64,
}

impl State {
    fn queue(&mut self, name: &str) -> &mut Queue {
        self.queues.entry(name.to_string()).or_default()
    }
}

#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    clock_offset: Arc<AtomicI64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the store clock forward.
    pub fn advance(&self, secs: i64) {
        self.clock_offset.fetch_add(secs, AtomicOrdering::SeqCst);
    }

    /// Current store time in unix seconds.
    pub fn now(&self) -> i64 {
        chrono::Utc::now().timestamp() + self.clock_offset.load(AtomicOrdering::SeqCst)
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, QueueError> {
        self.state
            .lock()
            .map_err(|_| anyhow::anyhow!("Lock is poisoned").into())
    }
}

fn blob_expiry(blob: &str) -> i64 {
    serde_json::from_str::<Value>(blob)
        .ok()
        .and_then(|v| v.get("expiry").and_then(Value::as_i64))
        .unwrap_or(FALLBACK_EXPIRY_SECS)
}

#[async_trait]
impl Store for MemoryStore {
    async fn enqueue(
        &self,
        queue: &str,
        jid: &Jid,
        blob: &str,
        priority: i8,
    ) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        state.jobs.insert(jid.clone(), blob.to_string());
        let queue = state.queue(queue);
        queue.sequence += 1;
        let score = priority_score(priority, queue.sequence);
        queue.ready.insert(jid.clone(), score);
        Ok(())
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<RawJob>, QueueError> {
        let now = self.now();
        let mut state = self.lock()?;
        let state = &mut *state;
        let q = state.queues.entry(queue.to_string()).or_default();

        let jid = match q.pending.first() {
            Some((deadline, jid)) if *deadline <= now => Some(jid.clone()),
            _ => q.ready.pop_first(),
        };
        let Some(jid) = jid else {
            return Ok(None);
        };
        let Some(blob) = state.jobs.get(&jid).cloned() else {
            q.pending.remove(&jid);
            return Ok(None);
        };

        q.pending.insert(jid.clone(), now + blob_expiry(&blob));
        Ok(Some(RawJob { jid, blob }))
    }

    async fn backoff(
        &self,
        queue: &str,
        jid: &Jid,
        blob: &str,
        backoff_secs: u64,
    ) -> Result<(), QueueError> {
        let now = self.now();
        let mut state = self.lock()?;
        state.jobs.insert(jid.clone(), blob.to_string());
        let queue = state.queue(queue);
        queue.pending.remove(jid);
        queue.pending.insert(jid.clone(), now + backoff_secs as i64);
        Ok(())
    }

    async fn delete(&self, queue: &str, jid: &Jid) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        state.jobs.remove(jid);
        state.queue(queue).pending.remove(jid);
        Ok(())
    }

    async fn pending_deadline(
        &self,
        queue: &str,
        jid: &Jid,
    ) -> Result<(Option<i64>, Option<i64>), QueueError> {
        let now = self.now();
        let state = self.lock()?;
        let deadline = state
            .queues
            .get(queue)
            .and_then(|q| q.pending.score(jid));
        Ok((Some(now), deadline))
    }

    async fn queue_size(&self, queue: &str) -> Result<u64, QueueError> {
        let state = self.lock()?;
        Ok(state.queues.get(queue).map_or(0, |q| q.ready.len()) as u64)
    }

    async fn pending_size(&self, queue: &str) -> Result<u64, QueueError> {
        let state = self.lock()?;
        Ok(state.queues.get(queue).map_or(0, |q| q.pending.len()) as u64)
    }

    async fn find(&self, jid: &Jid) -> Result<Option<String>, QueueError> {
        let state = self.lock()?;
        Ok(state.jobs.get(jid).cloned())
    }

    async fn find_many(&self, jids: &[Jid]) -> Result<Vec<Option<String>>, QueueError> {
        let state = self.lock()?;
        Ok(jids.iter().map(|jid| state.jobs.get(jid).cloned()).collect())
    }

    async fn scan(
        &self,
        queue: &str,
        ordering: Ordering,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<Jid>), QueueError> {
        let mut state = self.lock()?;
        let state = &mut *state;
        let last = match cursor {
            0 => None,
            // Unknown or finished cursor.
            c => match state.cursors.remove(&c) {
                Some(last) => Some(last),
                None => return Ok((0, Vec::new())),
            },
        };
        let Some(q) = state.queues.get(queue) else {
            return Ok((0, Vec::new()));
        };
        let set = match ordering {
            Ordering::Ready => &q.ready,
            Ordering::Pending => &q.pending,
        };
        let mut entries = match last {
            Some(last) => set.ordered.range((Excluded(last), Unbounded)),
            None => set.ordered.range::<(i64, Jid), _>(..),
        };
        let batch: Vec<(i64, Jid)> = entries.by_ref().take(count).cloned().collect();
        let more = entries.next().is_some();

        let next = match batch.last() {
            Some(last) if more => {
                state.next_cursor += 1;
                state.cursors.insert(state.next_cursor, last.clone());
                state.next_cursor
            }
            _ => 0,
        };
        let jids = batch.into_iter().map(|(_, jid)| jid).collect();
        Ok((next, jids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(jid: &Jid, expiry: u64) -> String {
        format!(r#"{{"id":"{}","expiry":{}}}"#, jid, expiry)
    }

    async fn push(store: &MemoryStore, name: &str, priority: i8) -> Jid {
        let jid = Jid::from(name);
        store
            .enqueue("q", &jid, &blob(&jid, 100), priority)
            .await
            .unwrap();
        jid
    }

    async fn pop(store: &MemoryStore) -> Option<Jid> {
        store.dequeue("q").await.unwrap().map(|raw| raw.jid)
    }

    #[tokio::test]
    async fn priority_then_fifo() {
        let store = MemoryStore::new();
        let low = push(&store, "low", -4).await;
        let a = push(&store, "a", 0).await;
        let high = push(&store, "high", 4).await;
        let b = push(&store, "b", 0).await;
        let mid = push(&store, "mid", 2).await;

        for expected in [high, mid, a, b, low] {
            assert_eq!(pop(&store).await, Some(expected));
        }
        assert_eq!(pop(&store).await, None);
    }

    #[tokio::test]
    async fn dequeue_moves_job_to_pending() {
        let store = MemoryStore::new();
        let a = push(&store, "a", 0).await;
        let _b = push(&store, "b", 0).await;

        assert_eq!(pop(&store).await, Some(a.clone()));
        assert_eq!(store.queue_size("q").await.unwrap(), 1);
        assert_eq!(store.pending_size("q").await.unwrap(), 1);

        let (now, deadline) = store.pending_deadline("q", &a).await.unwrap();
        assert_eq!(deadline.unwrap() - now.unwrap(), 100);
    }

    #[tokio::test]
    async fn overdue_pending_wins_over_ready() {
        let store = MemoryStore::new();
        let a = push(&store, "a", 0).await;
        assert_eq!(pop(&store).await, Some(a.clone()));
        let high = push(&store, "high", 4).await;

        // Not overdue yet: ready work is served.
        assert_eq!(pop(&store).await, Some(high));
        assert_eq!(pop(&store).await, None);

        store.advance(101);
        let _fresh = push(&store, "fresh", 4).await;
        assert_eq!(pop(&store).await, Some(a.clone()));
        // Redelivered in place with a fresh deadline.
        let (now, deadline) = store.pending_deadline("q", &a).await.unwrap();
        assert_eq!(deadline.unwrap() - now.unwrap(), 100);
        assert!(store.find(&a).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn orphaned_pending_entry_is_dropped() {
        let store = MemoryStore::new();
        let a = push(&store, "a", 0).await;
        assert_eq!(pop(&store).await, Some(a.clone()));
        store.lock().unwrap().jobs.remove(&a);
        store.advance(101);

        assert_eq!(pop(&store).await, None);
        assert_eq!(store.pending_size("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn backoff_and_delete() {
        let store = MemoryStore::new();
        let a = push(&store, "a", 0).await;
        pop(&store).await.unwrap();

        store.backoff("q", &a, "updated", 60).await.unwrap();
        let (now, deadline) = store.pending_deadline("q", &a).await.unwrap();
        assert_eq!(deadline.unwrap() - now.unwrap(), 60);
        assert_eq!(store.find(&a).await.unwrap().as_deref(), Some("updated"));

        store.delete("q", &a).await.unwrap();
        store.delete("q", &a).await.unwrap();
        assert!(store.find(&a).await.unwrap().is_none());
        assert_eq!(store.pending_size("q").await.unwrap(), 0);
        let (_, deadline) = store.pending_deadline("q", &a).await.unwrap();
        assert!(deadline.is_none());
    }

    #[tokio::test]
    async fn scan_walks_in_batches() {
        let store = MemoryStore::new();
        for i in 0..5 {
            push(&store, &format!("job{}", i), 0).await;
        }
        let (cursor, first) = store.scan("q", Ordering::Ready, 0, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_ne!(cursor, 0);
        let (cursor, second) = store.scan("q", Ordering::Ready, cursor, 2).await.unwrap();
        assert_eq!(second.len(), 2);
        let (cursor, third) = store.scan("q", Ordering::Ready, cursor, 2).await.unwrap();
        assert_eq!(third.len(), 1);
        assert_eq!(cursor, 0);

        let (cursor, none) = store.scan("other", Ordering::Pending, 0, 2).await.unwrap();
        assert_eq!(cursor, 0);
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn scan_survives_removal_between_batches() {
        let store = MemoryStore::new();
        let mut jids = Vec::new();
        for i in 0..4 {
            jids.push(push(&store, &format!("job{}", i), 0).await);
        }

        let (cursor, first) = store.scan("q", Ordering::Ready, 0, 2).await.unwrap();
        assert_eq!(first, jids[..2]);
        // job0 leaves the ready ordering mid-scan.
        assert_eq!(pop(&store).await, Some(jids[0].clone()));

        let (cursor, second) = store.scan("q", Ordering::Ready, cursor, 2).await.unwrap();
        assert_eq!(second, jids[2..]);
        assert_eq!(cursor, 0);
    }
}
