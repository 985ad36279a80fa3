use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio::sync::Notify;

use super::graph::NodeRef;
use crate::protocol::config::RequeueConfig;

fn key_of(node: &NodeRef) -> usize {
    Arc::as_ptr(node) as usize
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<NodeRef>,
    // queued or waiting to be re-queued once processing ends
    dirty: HashMap<usize, NodeRef>,
    processing: HashSet<usize>,
    failures: HashMap<usize, u32>,
    shutting_down: bool,
}

/// Deduplicating work queue of graph nodes.
///
/// A node is held at most once as pending and at most once as in flight; an
/// add while it is in flight is replayed when `done` is called.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

impl WorkQueue {
    pub fn new(cfg: &RequeueConfig) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, node: NodeRef) {
        let key = key_of(&node);
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains_key(&key) {
            return;
        }
        state.dirty.insert(key, node.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(node);
        drop(state);
        self.notify.notify_one();
    }

    /// Re-adds `node` after a per-node exponential delay.
    pub fn add_rate_limited(self: &Arc<Self>, node: NodeRef) {
        let delay = {
            let mut state = self.lock();
            let failures = state.failures.entry(key_of(&node)).or_insert(0);
            let exp = (*failures).min(30);
            *failures += 1;
            self.base_delay
                .saturating_mul(1u32 << exp.min(31))
                .min(self.max_delay)
        };
        self.add_after(node, delay);
    }

    pub fn add_after(self: &Arc<Self>, node: NodeRef, delay: Duration) {
        if delay.is_zero() {
            self.add(node);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(node);
        });
    }

    /// Clears the failure history of `node`.
    pub fn forget(&self, node: &NodeRef) {
        self.lock().failures.remove(&key_of(node));
    }

    pub fn num_requeues(&self, node: &NodeRef) -> u32 {
        self.lock()
            .failures
            .get(&key_of(node))
            .copied()
            .unwrap_or(0)
    }

    /// Waits for the next node. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<NodeRef> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(node) = state.queue.pop_front() {
                    let key = key_of(&node);
                    state.dirty.remove(&key);
                    state.processing.insert(key);
                    return Some(node);
                }
            }

            notified.await;
        }
    }

    /// Marks `node` as no longer in flight.
    pub fn done(&self, node: &NodeRef) {
        let key = key_of(node);
        let mut state = self.lock();
        state.processing.remove(&key);
        if let Some(pending) = state.dirty.get(&key).cloned() {
            state.queue.push_back(pending);
            drop(state);
            self.notify.notify_one();
        }
    }

    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
