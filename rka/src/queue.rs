//! Keyed work queue with per-key exponential backoff.
//!
//! A key is handed to at most one worker at a time.  Adding a key that is
//! already queued is a no-op; adding a key that is being processed marks it
//! dirty, and it is queued again exactly once when the worker calls
//! [`RateLimitingQueue::done`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use libcsi::retry_policy;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Work queue over object names.
pub type WorkQueue = RateLimitingQueue<String>;

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    /// Earliest pending delayed add per key.
    waiting: HashMap<K, Instant>,
    shutting_down: bool,
}

impl<K> Default for State<K> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            waiting: HashMap::new(),
            shutting_down: false,
        }
    }
}

/// Per-key exponential backoff: `start`, doubling up to `max`.
#[derive(Debug)]
pub struct KeyedBackoff<K> {
    start: Duration,
    max: Duration,
    keys: HashMap<K, Retries>,
}

#[derive(Debug)]
struct Retries {
    policy: ExponentialBackoff,
    failures: u32,
}

impl<K: Eq + Hash + Clone> KeyedBackoff<K> {
    pub fn new(start: Duration, max: Duration) -> Self {
        Self {
            start,
            max,
            keys: HashMap::new(),
        }
    }

    /// Delay before the next attempt for `key`; counts as one failure.
    pub fn when(&mut self, key: &K) -> Duration {
        let (start, max) = (self.start, self.max);
        let retries = self.keys.entry(key.clone()).or_insert_with(|| Retries {
            policy: retry_policy(start, max),
            failures: 0,
        });
        retries.failures = retries.failures.saturating_add(1);
        retries.policy.next_backoff().unwrap_or(max)
    }

    pub fn forget(&mut self, key: &K) {
        self.keys.remove(key);
    }

    pub fn failures(&self, key: &K) -> u32 {
        self.keys.get(key).map_or(0, |retries| retries.failures)
    }
}

struct Shared<K> {
    name: &'static str,
    state: Mutex<State<K>>,
    backoff: Mutex<KeyedBackoff<K>>,
    notify: Notify,
}

pub struct RateLimitingQueue<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for RateLimitingQueue<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Critical sections never panic half-way, so a poisoned lock is still consistent.
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl<K> RateLimitingQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(name: &'static str, retry_start: Duration, retry_max: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                name,
                state: Mutex::new(State::default()),
                backoff: Mutex::new(KeyedBackoff::new(retry_start, retry_max)),
                notify: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    /// Queue `key` for processing unless it is already pending.
    pub fn add(&self, key: K) {
        let mut state = lock(&self.shared.state);
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.shared.notify.notify_one();
    }

    /// Queue `key` once `delay` has passed.
    ///
    /// Of several delayed adds for one key only the earliest is kept.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let ready_at = Instant::now() + delay;
        {
            let mut state = lock(&self.shared.state);
            if state.shutting_down {
                return;
            }
            match state.waiting.get(&key) {
                Some(existing) if *existing <= ready_at => return,
                _ => {
                    state.waiting.insert(key.clone(), ready_at);
                }
            }
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(ready_at).await;
            let due = {
                let mut state = lock(&queue.shared.state);
                if state.waiting.get(&key) == Some(&ready_at) {
                    state.waiting.remove(&key);
                    true
                } else {
                    false
                }
            };
            if due {
                queue.add(key);
            }
        });
    }

    /// Queue `key` after its backoff delay, counting one more failure.
    pub fn add_rate_limited(&self, key: K) {
        let delay = lock(&self.shared.backoff).when(&key);
        self.add_after(key, delay);
    }

    /// Reset the backoff of `key`.
    pub fn forget(&self, key: &K) {
        lock(&self.shared.backoff).forget(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        lock(&self.shared.backoff).failures(key)
    }

    /// Wait for the next key.  Returns `None` once shut down and drained.
    ///
    /// The caller owns the key until it calls [`Self::done`].
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = lock(&self.shared.state);
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.shared.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Release `key`; requeue it if it was added while being processed,
    /// unless the queue is shutting down.
    pub fn done(&self, key: &K) {
        let mut state = lock(&self.shared.state);
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.shared.notify.notify_one();
        }
    }

    /// Number of keys ready to be handed out.
    pub fn len(&self) -> usize {
        lock(&self.shared.state).queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting keys.  Workers drain what is queued, then get `None`.
    pub fn shut_down(&self) {
        lock(&self.shared.state).shutting_down = true;
        self.shared.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        lock(&self.shared.state).shutting_down
    }
}
