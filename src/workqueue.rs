use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct ItemExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for ItemExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

impl ItemExponentialBackoff {
    pub fn delay(&self, requeues: u32) -> Duration {
        2u32.checked_pow(requeues)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |d| d.min(self.max))
    }
}

struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    waiting: HashMap<T, Instant>,
    requeues: HashMap<T, u32>,
    shutting_down: bool,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    backoff: ItemExponentialBackoff,
}

/// Deduplicating queue. Keys added while being processed go back in on [`WorkQueue::done`].
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> WorkQueue<T>
where
    T: Hash + Eq + Clone + Send + Sync + 'static,
{
    pub fn new(backoff: ItemExponentialBackoff) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    waiting: HashMap::new(),
                    requeues: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                backoff,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State<T>> {
        // the state is consistent after every critical section, a poisoned lock is still usable
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queues `item` for processing. A no-op if it is already pending or waiting out a backoff.
    pub fn add(&self, item: T) {
        let mut state = self.state();
        if state.shutting_down || state.waiting.contains_key(&item) {
            return;
        }
        self.push(&mut state, item);
    }

    fn push(&self, state: &mut State<T>, item: T) {
        if !state.dirty.insert(item.clone()) {
            return;
        }
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        self.inner.notify.notify_one();
    }

    /// Queues `item` once `delay` has passed. An earlier pending deadline for the same item wins.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            return self.add(item);
        }
        let ready_at = Instant::now() + delay;
        {
            let mut state = self.state();
            if state.shutting_down {
                return;
            }
            if state.dirty.contains(&item) && !state.processing.contains(&item) {
                return;
            }
            if state.waiting.get(&item).is_some_and(|at| *at <= ready_at) {
                return;
            }
            state.waiting.insert(item.clone(), ready_at);
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(ready_at).await;
            let mut state = queue.state();
            if state.shutting_down || state.waiting.get(&item) != Some(&ready_at) {
                return;
            }
            state.waiting.remove(&item);
            queue.push(&mut state, item);
        });
    }

    /// Queues `item` after its backoff delay and counts the requeue.
    pub fn add_rate_limited(&self, item: T) {
        let delay = {
            let mut state = self.state();
            let requeues = state.requeues.entry(item.clone()).or_insert(0);
            let delay = self.inner.backoff.delay(*requeues);
            *requeues += 1;
            delay
        };
        self.add_after(item, delay);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.state().requeues.get(item).copied().unwrap_or(0)
    }

    /// Resets the backoff of `item`.
    pub fn forget(&self, item: &T) {
        self.state().requeues.remove(item);
    }

    /// Waits for the next item. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Marks `item` as processed, queueing it again if it was added in the meantime.
    pub fn done(&self, item: &T) {
        let mut state = self.state();
        state.processing.remove(item);
        if state.dirty.contains(item) && !state.shutting_down {
            state.queue.push_back(item.clone());
            self.inner.notify.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> WorkQueue<String> {
        WorkQueue::new(ItemExponentialBackoff::default())
    }

    #[test]
    fn test_backoff_delay() {
        let backoff = ItemExponentialBackoff::default();
        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_secs(2));
        assert_eq!(backoff.delay(5), Duration::from_secs(32));
        assert_eq!(backoff.delay(6), Duration::from_secs(60));
        assert_eq!(backoff.delay(40), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_add_deduplicates_pending_items() {
        let queue = queue();
        queue.add("a".to_string());
        queue.add("a".to_string());
        queue.add("b".to_string());
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await.as_deref(), Some("a"));
        assert_eq!(queue.get().await.as_deref(), Some("b"));
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn test_item_added_while_processing_is_requeued_on_done() {
        let queue = queue();
        queue.add("a".to_string());
        let item = queue.get().await.unwrap();
        queue.add("a".to_string());
        assert_eq!(queue.len(), 0);
        queue.done(&item);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_add_waits_for_backoff() {
        let queue = queue();
        let start = Instant::now();
        queue.add_rate_limited("a".to_string());
        queue.add_rate_limited("a".to_string());
        assert_eq!(queue.num_requeues(&"a".to_string()), 2);
        assert_eq!(queue.len(), 0);

        assert_eq!(queue.get().await.as_deref(), Some("a"));
        // the first deadline wins over the longer second one
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_secs(2));

        queue.forget(&"a".to_string());
        assert_eq!(queue.num_requeues(&"a".to_string()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_keeps_backoff_penalty() {
        let queue = queue();
        let start = Instant::now();
        queue.add_after("a".to_string(), Duration::from_secs(10));
        queue.add("a".to_string());
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.get().await.as_deref(), Some("a"));
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_shut_down_wakes_waiting_getters() {
        let queue = queue();
        let getter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.shut_down();
        assert_eq!(getter.await.unwrap(), None);
        queue.add("a".to_string());
        assert_eq!(queue.len(), 0);
        assert!(queue.is_shutting_down());
    }
}
