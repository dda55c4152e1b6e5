//! LIFO queue of idle resources with blocking, optionally fair, handout

use crate::cancel::CancelToken;
use crate::lease::{IdleEntry, ResourceId};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// How often a waiter holding a cancel token checks it.
const CANCEL_POLL: Duration = Duration::from_millis(10);

/// Returned when a wait was aborted through a [`CancelToken`].
#[derive(Debug)]
pub(crate) struct Interrupted;

struct IdleState<T> {
    /// Most recently released at the front, longest idle at the back.
    entries: VecDeque<IdleEntry<T>>,
    /// Tickets of blocked callers, longest waiting first.
    waiters: VecDeque<u64>,
    next_ticket: u64,
    peak_waiting: usize,
    closed: bool,
}

/// Idle resources plus the permits to take them.
///
/// A permit is an entry in the queue, so the number of permits always equals
/// the queue length. In fair mode only the longest waiting caller may take
/// an entry while others wait.
pub(crate) struct IdleQueue<T> {
    state: Mutex<IdleState<T>>,
    available: Condvar,
    fair: bool,
}

impl<T> IdleQueue<T> {
    pub fn new(fair: bool) -> Self {
        Self {
            state: Mutex::new(IdleState {
                entries: VecDeque::new(),
                waiters: VecDeque::new(),
                next_ticket: 0,
                peak_waiting: 0,
                closed: false,
            }),
            available: Condvar::new(),
            fair,
        }
    }

    /// Put an entry at the head of the queue.
    /// Hands the entry back when the queue was closed.
    pub fn push(&self, entry: IdleEntry<T>) -> Result<(), IdleEntry<T>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(entry);
        }
        state.entries.push_front(entry);
        drop(state);
        self.wake();
        Ok(())
    }

    /// Take the most recently released entry, waiting up to `timeout` for one.
    /// Returns `None` on timeout or when the queue is closed while waiting.
    pub fn take(
        &self,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> Result<Option<IdleEntry<T>>, Interrupted> {
        let mut state = self.state.lock();
        if cancel.is_some_and(CancelToken::is_cancelled) {
            return Err(Interrupted);
        }
        if state.closed {
            return Ok(None);
        }
        if self.may_take(&state, None) {
            return Ok(state.entries.pop_front());
        }
        if timeout.is_zero() {
            return Ok(None);
        }
        let deadline = Instant::now().checked_add(timeout);
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.waiters.push_back(ticket);
        state.peak_waiting = state.peak_waiting.max(state.waiters.len());

        let result = loop {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                break Err(Interrupted);
            }
            if state.closed {
                break Ok(None);
            }
            if self.may_take(&state, Some(ticket)) {
                break Ok(state.entries.pop_front());
            }
            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                break Ok(None);
            }
            match (deadline, cancel) {
                (Some(d), Some(_)) => {
                    self.available.wait_until(&mut state, d.min(now + CANCEL_POLL));
                }
                (Some(d), None) => {
                    self.available.wait_until(&mut state, d);
                }
                (None, Some(_)) => {
                    self.available.wait_for(&mut state, CANCEL_POLL);
                }
                (None, None) => self.available.wait(&mut state),
            }
        };

        state.waiters.retain(|t| *t != ticket);
        let pass_on = !state.entries.is_empty() && !state.waiters.is_empty();
        drop(state);
        if pass_on {
            self.wake();
        }
        result
    }

    fn may_take(&self, state: &IdleState<T>, ticket: Option<u64>) -> bool {
        if state.entries.is_empty() {
            return false;
        }
        if !self.fair {
            return true;
        }
        match ticket {
            None => state.waiters.is_empty(),
            Some(ticket) => state.waiters.front() == Some(&ticket),
        }
    }

    fn wake(&self) {
        if self.fair {
            self.available.notify_all();
        } else {
            self.available.notify_one();
        }
    }

    /// Remove the longest idle entry if `expired` says so.
    pub fn pop_oldest_if(&self, expired: impl FnOnce(&IdleEntry<T>) -> bool) -> Option<IdleEntry<T>> {
        let mut state = self.state.lock();
        if state.entries.back().is_some_and(expired) {
            state.entries.pop_back()
        } else {
            None
        }
    }

    /// Remove a specific entry, if it is still idle.
    pub fn remove(&self, id: ResourceId) -> Option<IdleEntry<T>> {
        let mut state = self.state.lock();
        let index = state.entries.iter().position(|e| e.id == id)?;
        state.entries.remove(index)
    }

    /// Ids of entries created before `cutoff`.
    pub fn created_before(&self, cutoff: Instant) -> Vec<ResourceId> {
        let state = self.state.lock();
        state
            .entries
            .iter()
            .filter(|e| e.created_at < cutoff)
            .map(|e| e.id)
            .collect()
    }

    /// Remove all entries, oldest first.
    pub fn drain(&self) -> Vec<IdleEntry<T>> {
        let mut state = self.state.lock();
        state.entries.drain(..).rev().collect()
    }

    /// Refuse further pushes, wake all waiters and hand back all entries.
    pub fn close(&self) -> Vec<IdleEntry<T>> {
        let mut state = self.state.lock();
        state.closed = true;
        let entries = state.entries.drain(..).rev().collect();
        drop(state);
        self.available.notify_all();
        entries
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    pub fn peak_waiting(&self) -> usize {
        self.state.lock().peak_waiting
    }

    pub fn ids(&self) -> Vec<ResourceId> {
        self.state.lock().entries.iter().map(|e| e.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::Slot;
    use std::sync::Arc;
    use std::thread;

    fn entry(id: u64) -> IdleEntry<u64> {
        IdleEntry::from_slot(Slot {
            id: ResourceId(id),
            value: id,
            created_at: Instant::now(),
        })
    }

    #[test]
    fn test_lifo_order() {
        let queue = IdleQueue::new(false);
        queue.push(entry(1)).unwrap();
        queue.push(entry(2)).unwrap();
        let taken = queue.take(Duration::ZERO, None).unwrap().unwrap();
        assert_eq!(taken.value, 2);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_oldest_at_back() {
        let queue = IdleQueue::new(false);
        queue.push(entry(1)).unwrap();
        queue.push(entry(2)).unwrap();
        let oldest = queue.pop_oldest_if(|_| true).unwrap();
        assert_eq!(oldest.value, 1);
        assert!(queue.pop_oldest_if(|_| false).is_none());
    }

    #[test]
    fn test_take_times_out() {
        let queue: IdleQueue<u64> = IdleQueue::new(false);
        let start = Instant::now();
        assert!(queue.take(Duration::from_millis(30), None).unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(queue.waiting(), 0);
    }

    #[test]
    fn test_blocked_take_receives_push() {
        let queue = Arc::new(IdleQueue::new(true));
        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.take(Duration::from_secs(5), None).unwrap())
        };
        while queue.waiting() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        queue.push(entry(7)).unwrap();
        assert_eq!(waiter.join().unwrap().unwrap().value, 7);
        assert_eq!(queue.peak_waiting(), 1);
    }

    #[test]
    fn test_cancel_interrupts_wait() {
        let queue: Arc<IdleQueue<u64>> = Arc::new(IdleQueue::new(false));
        let token = CancelToken::new();
        let waiter = {
            let queue = Arc::clone(&queue);
            let token = token.clone();
            thread::spawn(move || queue.take(Duration::from_secs(5), Some(&token)))
        };
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert!(waiter.join().unwrap().is_err());
    }

    #[test]
    fn test_close_refuses_push_and_wakes_waiters() {
        let queue = Arc::new(IdleQueue::new(false));
        queue.push(entry(1)).unwrap();
        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let first = queue.take(Duration::ZERO, None).unwrap();
                let second = queue.take(Duration::from_secs(5), None).unwrap();
                (first.is_some(), second.is_none())
            })
        };
        while queue.waiting() == 0 && queue.len() == 1 {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(10));
        let drained = queue.close();
        assert!(drained.is_empty());
        assert_eq!(waiter.join().unwrap(), (true, true));
        assert!(queue.push(entry(2)).is_err());
    }
}
