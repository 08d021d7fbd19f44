//! Lease queue
//!
//! Holds every test identifier of the run in exactly one of three places:
//! the stack of queued entries, the map of leased entries (with lease time)
//! or the completed set. All access goes through one lock, acquired with a
//! bounded wait so that a stuck holder surfaces as [`QueueError::Deadlock`]
//! instead of hanging the leader.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};

/// How long an operation waits for the queue lock
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(60);

/// Pause between lease attempts while nothing is queued
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Queue errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("could not acquire the queue lock within {timeout:?}; giving up")]
    Deadlock { timeout: Duration },
}

/// Queue sizes read under one lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueCounts {
    pub queued: usize,
    pub leased: usize,
    pub completed: usize,
}

impl QueueCounts {
    /// Entries not completed yet
    pub fn size(&self) -> usize {
        self.queued + self.leased
    }
}

#[derive(Debug)]
struct QueueState {
    /// Queued entries; the last element is leased first
    stack: Vec<String>,
    leased: HashMap<String, Instant>,
    completed: HashSet<String>,
    visited: bool,
    last_activity_at: Instant,
}

/// Thread-safe queue granting revocable leases on test identifiers
#[derive(Debug)]
pub struct LeaseQueue {
    state: Mutex<QueueState>,
    closed: AtomicBool,
    total: usize,
    initialized_at: Instant,
    poll_interval: Duration,
    sync_timeout: Duration,
}

impl LeaseQueue {
    /// Build a queue from the provider's list. Duplicates are dropped, keeping
    /// the first occurrence.
    pub fn new(entries: Vec<String>) -> Self {
        Self::with_options(entries, POLL_INTERVAL, SYNC_TIMEOUT)
    }

    pub fn with_options(entries: Vec<String>, poll_interval: Duration, sync_timeout: Duration) -> Self {
        let mut seen = HashSet::with_capacity(entries.len());
        let stack: Vec<String> = entries
            .into_iter()
            .filter(|entry| seen.insert(entry.clone()))
            .collect();
        let now = Instant::now();

        Self {
            total: stack.len(),
            state: Mutex::new(QueueState {
                stack,
                leased: HashMap::new(),
                completed: HashSet::new(),
                visited: false,
                last_activity_at: now,
            }),
            closed: AtomicBool::new(false),
            initialized_at: now,
            poll_interval,
            sync_timeout,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>, QueueError> {
        self.state
            .try_lock_for(self.sync_timeout)
            .ok_or(QueueError::Deadlock {
                timeout: self.sync_timeout,
            })
    }

    /// Lease the next entry, waiting while the queue is empty.
    ///
    /// Returns `Ok(None)` once the queue is closed.
    pub fn lease(&self) -> Result<Option<String>, QueueError> {
        loop {
            if self.is_closed() {
                return Ok(None);
            }
            if let Some(entry) = self.try_lease()? {
                return Ok(Some(entry));
            }
            thread::sleep(self.poll_interval);
        }
    }

    /// Lease the next entry if one is queued right now.
    pub fn try_lease(&self) -> Result<Option<String>, QueueError> {
        let mut state = self.lock()?;
        while let Some(entry) = state.stack.pop() {
            if state.completed.contains(&entry) {
                continue;
            }
            let now = Instant::now();
            state.leased.insert(entry.clone(), now);
            state.visited = true;
            state.last_activity_at = now;
            return Ok(Some(entry));
        }
        Ok(None)
    }

    /// Return a leased entry to the queue, just below the top of the stack.
    pub fn repush(&self, entry: &str) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        state.leased.remove(entry);

        if state.completed.contains(entry) || state.stack.iter().any(|e| e == entry) {
            return Ok(());
        }

        let position = state.stack.len().saturating_sub(1);
        state.stack.insert(position, entry.to_string());
        Ok(())
    }

    /// Mark an entry completed. Returns `false` if it already was.
    pub fn release(&self, entry: &str) -> Result<bool, QueueError> {
        let mut state = self.lock()?;
        if state.completed.contains(entry) {
            return Ok(false);
        }

        state.leased.remove(entry);
        state.stack.retain(|e| e != entry);
        state.completed.insert(entry.to_string());
        Ok(true)
    }

    pub fn is_completed(&self, entry: &str) -> Result<bool, QueueError> {
        Ok(self.lock()?.completed.contains(entry))
    }

    /// Entries not completed yet (queued plus leased)
    pub fn size(&self) -> Result<usize, QueueError> {
        let state = self.lock()?;
        Ok(state.stack.len() + state.leased.len())
    }

    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.size()? == 0)
    }

    pub fn completed_size(&self) -> Result<usize, QueueError> {
        Ok(self.lock()?.completed.len())
    }

    pub fn leased_size(&self) -> Result<usize, QueueError> {
        Ok(self.lock()?.leased.len())
    }

    /// Consistent snapshot of all sizes
    pub fn counts(&self) -> Result<QueueCounts, QueueError> {
        let state = self.lock()?;
        Ok(QueueCounts {
            queued: state.stack.len(),
            leased: state.leased.len(),
            completed: state.completed.len(),
        })
    }

    /// Copy of the leases matching `predicate`
    pub fn select_leased<F>(&self, mut predicate: F) -> Result<HashMap<String, Instant>, QueueError>
    where
        F: FnMut(&str, Instant) -> bool,
    {
        let state = self.lock()?;
        Ok(state
            .leased
            .iter()
            .filter(|(entry, leased_at)| predicate(entry, **leased_at))
            .map(|(entry, leased_at)| (entry.clone(), *leased_at))
            .collect())
    }

    /// Copy of the queued entries, next to be leased last
    pub fn entries_list(&self) -> Result<Vec<String>, QueueError> {
        Ok(self.lock()?.stack.clone())
    }

    /// Queued and leased entries, queued first
    pub fn outstanding(&self) -> Result<Vec<String>, QueueError> {
        let state = self.lock()?;
        let mut leased: Vec<String> = state.leased.keys().cloned().collect();
        leased.sort();
        Ok(state.stack.iter().rev().cloned().chain(leased).collect())
    }

    /// Whether anything was ever leased
    pub fn is_visited(&self) -> Result<bool, QueueError> {
        Ok(self.lock()?.visited)
    }

    pub fn initialized_at(&self) -> Instant {
        self.initialized_at
    }

    /// Time of the latest lease (creation time before the first one)
    pub fn last_activity_at(&self) -> Result<Instant, QueueError> {
        Ok(self.lock()?.last_activity_at)
    }

    /// Number of unique entries the queue was created with
    pub fn total(&self) -> usize {
        self.total
    }

    /// Make pending and future `lease` calls return `None`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn queue(entries: &[&str]) -> LeaseQueue {
        LeaseQueue::with_options(
            entries.iter().map(|e| e.to_string()).collect(),
            Duration::from_millis(5),
            Duration::from_millis(200),
        )
    }

    fn assert_conserved(queue: &LeaseQueue) {
        let counts = queue.counts().unwrap();
        assert_eq!(counts.size() + counts.completed, queue.total());
        assert_eq!(queue.size().unwrap(), counts.size());
    }

    #[test]
    fn test_lease_is_lifo() {
        let queue = queue(&["a", "b", "c"]);
        assert_eq!(queue.lease().unwrap().as_deref(), Some("c"));
        assert_eq!(queue.lease().unwrap().as_deref(), Some("b"));
        assert_eq!(queue.lease().unwrap().as_deref(), Some("a"));
        assert_eq!(queue.try_lease().unwrap(), None);
        assert_eq!(queue.leased_size().unwrap(), 3);
    }

    #[test]
    fn test_repush_single_entry_is_leased_again() {
        let queue = queue(&["only"]);
        let entry = queue.lease().unwrap().unwrap();
        queue.repush(&entry).unwrap();

        assert_eq!(queue.leased_size().unwrap(), 0);
        assert_eq!(queue.lease().unwrap().as_deref(), Some("only"));
    }

    #[test]
    fn test_repush_is_not_immediately_leased() {
        let queue = queue(&["a", "b", "c"]);
        let first = queue.lease().unwrap().unwrap();
        assert_eq!(first, "c");
        queue.repush(&first).unwrap();

        assert_eq!(queue.entries_list().unwrap(), vec!["a", "c", "b"]);
        assert_eq!(queue.lease().unwrap().as_deref(), Some("b"));
        assert_eq!(queue.lease().unwrap().as_deref(), Some("c"));
    }

    #[test]
    fn test_release_once() {
        let queue = queue(&["a"]);
        let entry = queue.lease().unwrap().unwrap();

        assert!(queue.release(&entry).unwrap());
        assert!(!queue.release(&entry).unwrap());
        assert!(queue.is_completed(&entry).unwrap());
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_completed_is_permanent() {
        let queue = queue(&["a", "b"]);
        let entry = queue.lease().unwrap().unwrap();
        queue.release(&entry).unwrap();

        queue.repush(&entry).unwrap();
        assert!(queue.is_completed(&entry).unwrap());
        assert_eq!(queue.entries_list().unwrap(), vec!["a"]);
        assert_conserved(&queue);
    }

    #[test]
    fn test_repush_does_not_duplicate() {
        let queue = queue(&["a", "b"]);
        let entry = queue.lease().unwrap().unwrap();
        queue.repush(&entry).unwrap();
        queue.repush(&entry).unwrap();

        assert_eq!(queue.size().unwrap(), 2);
        assert_conserved(&queue);
    }

    #[test]
    fn test_release_removes_queued_copy() {
        let queue = queue(&["a", "b"]);
        let entry = queue.lease().unwrap().unwrap();
        queue.repush(&entry).unwrap();

        assert!(queue.release(&entry).unwrap());
        assert_eq!(queue.entries_list().unwrap(), vec!["a"]);
        assert_conserved(&queue);
    }

    #[test]
    fn test_duplicates_collapsed() {
        let queue = queue(&["a", "b", "a"]);
        assert_eq!(queue.total(), 2);
        assert_eq!(queue.entries_list().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_conservation_under_mixed_operations() {
        let queue = queue(&["a", "b", "c", "d", "e"]);
        assert_conserved(&queue);

        let a = queue.lease().unwrap().unwrap();
        let b = queue.lease().unwrap().unwrap();
        assert_conserved(&queue);
        queue.repush(&a).unwrap();
        assert_conserved(&queue);
        queue.release(&b).unwrap();
        queue.release(&b).unwrap();
        assert_conserved(&queue);
        queue.release(&a).unwrap();
        queue.repush(&a).unwrap();
        assert_conserved(&queue);

        while let Some(entry) = queue.try_lease().unwrap() {
            queue.release(&entry).unwrap();
            assert_conserved(&queue);
        }
        assert_eq!(queue.completed_size().unwrap(), 5);
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_conservation_across_threads() {
        let entries: Vec<String> = (0..200).map(|i| format!("t{}", i)).collect();
        let queue = Arc::new(LeaseQueue::with_options(
            entries,
            Duration::from_millis(1),
            Duration::from_secs(5),
        ));

        let workers: Vec<_> = (0..6)
            .map(|w| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    let mut round = 0;
                    while let Some(entry) = queue.try_lease().unwrap() {
                        round += 1;
                        if (round + w) % 3 == 0 {
                            queue.repush(&entry).unwrap();
                        } else {
                            queue.release(&entry).unwrap();
                        }
                    }
                })
            })
            .collect();

        let sampler = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for _ in 0..500 {
                    let counts = queue.counts().unwrap();
                    assert_eq!(counts.size() + counts.completed, 200);
                }
            })
        };

        for worker in workers {
            worker.join().unwrap();
        }
        sampler.join().unwrap();

        while let Some(entry) = queue.try_lease().unwrap() {
            queue.release(&entry).unwrap();
        }
        assert_eq!(queue.completed_size().unwrap(), 200);
        assert_conserved(&queue);
    }

    #[test]
    fn test_visited_and_activity() {
        let queue = queue(&["a"]);
        assert!(!queue.is_visited().unwrap());
        assert_eq!(queue.last_activity_at().unwrap(), queue.initialized_at());

        queue.lease().unwrap();
        assert!(queue.is_visited().unwrap());
        assert!(queue.last_activity_at().unwrap() >= queue.initialized_at());
    }

    #[test]
    fn test_select_leased() {
        let queue = queue(&["a", "b"]);
        queue.lease().unwrap();
        queue.lease().unwrap();

        let selected = queue.select_leased(|entry, _| entry == "a").unwrap();
        assert_eq!(selected.len(), 1);
        assert!(selected.contains_key("a"));
    }

    #[test]
    fn test_close_releases_blocked_lease() {
        let queue = Arc::new(queue(&[]));
        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.lease())
        };

        thread::sleep(Duration::from_millis(30));
        queue.close();

        let result = waiter.join().unwrap().unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn test_lease_waits_for_repush() {
        let queue = Arc::new(queue(&["a"]));
        let entry = queue.lease().unwrap().unwrap();

        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.lease())
        };
        thread::sleep(Duration::from_millis(30));
        queue.repush(&entry).unwrap();

        assert_eq!(waiter.join().unwrap().unwrap().as_deref(), Some("a"));
    }

    #[test]
    fn test_lock_timeout_is_deadlock() {
        let queue = LeaseQueue::with_options(
            vec!["a".to_string()],
            Duration::from_millis(5),
            Duration::from_millis(20),
        );
        let _held = queue.state.lock();

        let result = queue.try_lease();
        assert!(matches!(result, Err(QueueError::Deadlock { .. })));
    }

    #[test]
    fn test_outstanding_lists_queued_then_leased() {
        let queue = queue(&["a", "b", "c"]);
        queue.lease().unwrap();
        assert_eq!(queue.outstanding().unwrap(), vec!["b", "a", "c"]);
    }
}
