//! Keyed work queue shared by the controllers.
//!
//! A key is handed to at most one worker at a time. Operations added for a key
//! while it waits are coalesced into one batch; operations added while it is
//! being processed are held back and the key is re-queued by `done`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

struct Inner<K, Op> {
    queue: VecDeque<K>,
    /// Operations per key not yet handed to a worker.
    pending: HashMap<K, Vec<Op>>,
    processing: HashSet<K>,
    shutting_down: bool,
}

pub struct WorkQueue<K, Op> {
    inner: Mutex<Inner<K, Op>>,
    notify: Notify,
}

impl<K, Op> WorkQueue<K, Op>
where
    K: Clone + Eq + Hash + Send + 'static,
    Op: Clone + PartialEq + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                pending: HashMap::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Queue `op` for `key`. Ignored once the queue is shut down.
    pub fn add(&self, key: K, op: Op) {
        let mut inner = self.inner.lock().unwrap();
        if inner.shutting_down {
            return;
        }
        let newly_pending = !inner.pending.contains_key(&key);
        let ops = inner.pending.entry(key.clone()).or_default();
        if ops.last() != Some(&op) {
            ops.push(op);
        }
        if newly_pending && !inner.processing.contains(&key) {
            inner.queue.push_back(key);
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Queue `op` for `key` once `delay` has elapsed.
    pub fn add_after(self: &Arc<Self>, key: K, op: Op, delay: Duration) {
        self.add_all_after(key, vec![op], delay);
    }

    /// Queue `ops` for `key`, in order, once `delay` has elapsed.
    pub fn add_all_after(self: &Arc<Self>, key: K, ops: Vec<Op>, delay: Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            for op in ops {
                queue.add(key.clone(), op);
            }
        });
    }

    /// Wait for the next key and its batched operations. `None` after shutdown.
    pub async fn get(&self) -> Option<(K, Vec<Op>)> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.shutting_down {
                    return None;
                }
                if let Some(key) = inner.queue.pop_front() {
                    let ops = inner.pending.remove(&key).unwrap_or_default();
                    inner.processing.insert(key.clone());
                    return Some((key, ops));
                }
            }
            notified.await;
        }
    }

    /// Release `key` after processing; re-queue it if more work arrived.
    pub fn done(&self, key: &K) {
        let mut inner = self.inner.lock().unwrap();
        inner.processing.remove(key);
        if !inner.shutting_down && inner.pending.contains_key(key) {
            inner.queue.push_back(key.clone());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Stop handing out work and wake every waiting worker.
    pub fn shut_down(&self) {
        self.inner.lock().unwrap().shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Keys waiting to be picked up.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, Op> Default for WorkQueue<K, Op>
where
    K: Clone + Eq + Hash + Send + 'static,
    Op: Clone + PartialEq + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Background tasks of one controller plus the signal that stops them.
pub struct ControllerHandle {
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ControllerHandle {
    pub(crate) fn new(stop: watch::Sender<bool>, tasks: Vec<JoinHandle<()>>) -> Self {
        Self { stop, tasks }
    }

    /// Signal shutdown and wait for every task. Work already handed to a
    /// worker runs to completion.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        for task in self.tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = ?err, "controller task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ops_for_a_waiting_key_are_coalesced() {
        let queue: WorkQueue<&str, u8> = WorkQueue::new();
        queue.add("a", 1);
        queue.add("a", 1);
        queue.add("a", 2);
        queue.add("b", 1);
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get().await, Some(("a", vec![1, 2])));
        assert_eq!(queue.get().await, Some(("b", vec![1])));
    }

    #[tokio::test]
    async fn key_in_processing_is_held_until_done() {
        let queue: WorkQueue<&str, u8> = WorkQueue::new();
        queue.add("a", 1);
        let (key, _) = queue.get().await.expect("item");

        queue.add("a", 2);
        assert!(queue.is_empty(), "busy key must not be handed out twice");

        queue.done(&key);
        assert_eq!(queue.get().await, Some(("a", vec![2])));
    }

    #[tokio::test]
    async fn shutdown_releases_waiting_workers() {
        let queue: Arc<WorkQueue<&'static str, u8>> = Arc::new(WorkQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.shut_down();
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("worker woke")
            .expect("join");
        assert_eq!(got, None);

        queue.add("a", 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn delayed_add_arrives_later() {
        let queue: Arc<WorkQueue<&'static str, u8>> = Arc::new(WorkQueue::new());
        queue.add_after("a", 7, Duration::from_millis(10));
        assert!(queue.is_empty());
        let got = tokio::time::timeout(Duration::from_secs(1), queue.get())
            .await
            .expect("delayed item");
        assert_eq!(got, Some(("a", vec![7])));
    }

    #[tokio::test]
    async fn delayed_batch_keeps_every_op_in_order() {
        let queue: Arc<WorkQueue<&'static str, u8>> = Arc::new(WorkQueue::new());
        queue.add_all_after("a", vec![1, 3], Duration::from_millis(10));
        let got = tokio::time::timeout(Duration::from_secs(1), queue.get())
            .await
            .expect("delayed batch");
        assert_eq!(got, Some(("a", vec![1, 3])));
    }
}
