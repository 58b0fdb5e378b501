// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Bounded local deque with opposite-end consumption.
//!
//! Built on `crossbeam-deque`'s LIFO worker. The two handle roles are
//! inverted relative to classic work-stealing so the contract comes out
//! as: the owner consumes the *oldest* item (front, FIFO) through the
//! lock-free stealer handle, and peers take the *newest* item (back)
//! through the worker handle. The ends are disjoint, so the owner's fast
//! path never contends with an in-progress steal; pushes and peer steals
//! share the worker handle behind a brief lock, which serializes steals
//! on the owner side. An atomic counter separate from the deque itself
//! bounds capacity.

use crossbeam_deque::{Steal, Stealer, Worker};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Bounded local deque
pub struct LocalQueue<T> {
    /// Back-end handle: pushes, and peer steals popping the newest item.
    /// Locked because pushes come from any pool task and steals from RPC
    /// handlers.
    back: Mutex<Worker<T>>,
    /// Front-end handle: the owner's lock-free FIFO consumption path
    front: Stealer<T>,
    size: AtomicUsize,
    capacity: usize,
}

impl<T> LocalQueue<T> {
    /// Create a deque bounded to `capacity` items
    pub fn new(capacity: usize) -> Self {
        // LIFO flavor: the worker handle pops the newest item while the
        // stealer handle always takes the oldest, giving the two roles
        // opposite ends
        let back = Worker::new_lifo();
        let front = back.stealer();
        Self {
            back: Mutex::new(back),
            front,
            size: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Current depth
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Whether the deque is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured bound
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Owner push; the item is handed back when the deque is full so the
    /// caller can route it elsewhere instead of dropping it
    pub fn push(&self, item: T) -> Result<(), T> {
        // Reserve a slot first so concurrent pushes cannot overshoot
        let mut current = self.size.load(Ordering::Acquire);
        loop {
            if current >= self.capacity {
                return Err(item);
            }
            match self.size.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        self.back.lock().push(item);
        Ok(())
    }

    /// Owner pop: the oldest item, from the front, without taking the lock
    pub fn pop(&self) -> Option<T> {
        loop {
            match self.front.steal() {
                Steal::Success(item) => {
                    self.size.fetch_sub(1, Ordering::AcqRel);
                    return Some(item);
                }
                Steal::Retry => continue,
                Steal::Empty => return None,
            }
        }
    }

    /// Peer steal: up to `max` of the newest items, from the back
    /// (the opposite end from the owner)
    pub fn steal(&self, max: usize) -> Vec<T> {
        let back = self.back.lock();
        let mut taken = Vec::new();
        while taken.len() < max {
            match back.pop() {
                Some(item) => {
                    self.size.fetch_sub(1, Ordering::AcqRel);
                    taken.push(item);
                }
                None => break,
            }
        }
        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_fifo_order() {
        let q = LocalQueue::new(10);
        for i in 0..5 {
            q.push(i).unwrap();
        }

        for expected in 0..5 {
            assert_eq!(q.pop(), Some(expected));
        }
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_capacity_bound() {
        let q = LocalQueue::new(2);
        q.push(1).unwrap();
        q.push(2).unwrap();

        let rejected = q.push(3).unwrap_err();
        assert_eq!(rejected, 3);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_steal_takes_the_back() {
        let q = LocalQueue::new(10);
        for i in 0..4 {
            q.push(i).unwrap();
        }

        // Peers take the newest item; the owner still sees the oldest
        assert_eq!(q.steal(1), vec![3]);
        assert_eq!(q.pop(), Some(0));
    }

    #[test]
    fn test_steal_drains_without_owner() {
        let q = LocalQueue::new(10);
        for i in 0..6 {
            q.push(i).unwrap();
        }

        let stolen = q.steal(2);
        assert_eq!(stolen, vec![5, 4]);
        assert_eq!(q.len(), 4);

        // Owner drains the remainder in FIFO order
        let mut remaining = Vec::new();
        while let Some(item) = q.pop() {
            remaining.push(item);
        }
        assert_eq!(remaining, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_concurrent_push_respects_bound() {
        let q = std::sync::Arc::new(LocalQueue::new(100));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let q = q.clone();
            handles.push(std::thread::spawn(move || {
                let mut accepted = 0;
                for i in 0..50 {
                    if q.push(i).is_ok() {
                        accepted += 1;
                    }
                }
                accepted
            }));
        }
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 100);
        assert_eq!(q.len(), 100);
    }
}
